//! SIP header-block parsing and the small set of CUCM-specific header
//! helpers the dialog engine needs (Session-ID parameter parsing,
//! Remote-Party-ID display name/number extraction, tag/session-id/branch
//! generation).

use std::collections::HashMap;

use rand::Rng;

use crate::error::SipError;

/// Synthetic key the request-line/status-line is stored under, since it
/// has no `Name: value` shape of its own.
pub const START_LINE_KEY: &str = "__start_line__";

pub const EMPTY_SESSION_ID: &str = "00000000000000000000000000000000";

/// A parsed SIP header block: request/status line plus a case-sensitive
/// name -> value map. Repeated headers (e.g. two `Recv-Info` lines) keep
/// only the last occurrence, which is sufficient for every header this
/// engine reads.
#[derive(Debug, Clone, Default)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn parse(head: &str) -> Self {
        let mut map = HashMap::new();
        for (i, line) in head.split("\r\n").enumerate() {
            if line.is_empty() {
                continue;
            }
            if i == 0 {
                map.insert(START_LINE_KEY.to_string(), line.to_string());
                continue;
            }
            if let Some((name, value)) = line.split_once(": ") {
                map.insert(name.to_string(), value.to_string());
            }
        }
        Headers(map)
    }

    pub fn start_line(&self) -> Option<&str> {
        self.0.get(START_LINE_KEY).map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn require(&self, name: &'static str) -> Result<&str, SipError> {
        self.get(name).ok_or(SipError::MissingHeader(name))
    }

    pub fn content_length(&self) -> Option<usize> {
        self.get("Content-Length").and_then(|v| v.trim().parse().ok())
    }

    /// For a response start line (`SIP/2.0 200 OK`), the numeric status code.
    pub fn status_code(&self) -> Option<u32> {
        let line = self.start_line()?;
        if !line.starts_with("SIP/2.0 ") {
            return None;
        }
        line.split_whitespace().nth(1)?.parse().ok()
    }

    /// Method name of a request start line (`INVITE sip:... SIP/2.0`), or
    /// `None` for a response.
    pub fn request_method(&self) -> Option<&str> {
        let line = self.start_line()?;
        if line.starts_with("SIP/2.0") {
            return None;
        }
        line.split_whitespace().next()
    }

    pub fn is_response(&self) -> bool {
        self.start_line().map(|l| l.starts_with("SIP/2.0")).unwrap_or(false)
    }

    /// `CSeq: 101 INVITE` -> `(101, "INVITE")`.
    pub fn cseq(&self) -> Option<(u32, &str)> {
        let value = self.get("CSeq")?;
        let (num, method) = value.split_once(' ')?;
        Some((num.trim().parse().ok()?, method.trim()))
    }

    /// Proper `;`-delimited parse of the `Session-ID` header:
    /// `<id>[;remote=<remote-id>][;other=params]`. Earlier SIP stacks that
    /// strip a `remote=` prefix with a character-class trim corrupt any id
    /// that happens to share characters with the literal `remote=` string;
    /// this parses the parameter list properly instead.
    pub fn session_id(&self) -> Option<(String, Option<String>)> {
        let raw = self.get("Session-ID")?;
        let mut parts = raw.split(';');
        let id = parts.next()?.trim().to_string();
        let mut remote = None;
        for param in parts {
            let param = param.trim();
            if let Some(value) = param.strip_prefix("remote=") {
                remote = Some(value.to_string());
            }
        }
        Some((id, remote))
    }

    /// The user part of a `sip:user@host` URI found inside a header value.
    pub fn uri_user(value: &str) -> Option<String> {
        let after_scheme = value.split("sip:").nth(1)?;
        let user = after_scheme.split('@').next()?;
        Some(user.to_string())
    }

    pub fn from_user(&self) -> Option<String> {
        Self::uri_user(self.get("From")?)
    }

    pub fn to_user(&self) -> Option<String> {
        Self::uri_user(self.get("To")?)
    }

    /// Display name + canonical number from `Remote-Party-ID`, e.g.
    /// `"Alice" <sip:9100@host>;party=calling;...;x-cisco-number=9100`,
    /// falling back to the quoted display name / URI user part of `From`.
    pub fn remote_party(&self) -> (Option<String>, Option<String>) {
        if let Some(rpid) = self.get("Remote-Party-ID") {
            let display = quoted_display_name(rpid);
            let number = rpid
                .split(';')
                .find_map(|p| p.trim().strip_prefix("x-cisco-number=").map(str::to_string))
                .or_else(|| Self::uri_user(rpid));
            if display.is_some() || number.is_some() {
                return (display, number);
            }
        }
        let from = self.get("From").unwrap_or_default();
        (quoted_display_name(from), self.from_user())
    }
}

fn quoted_display_name(value: &str) -> Option<String> {
    let start = value.find('"')?;
    let rest = &value[start + 1..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

/// 32 lowercase hex characters, used for `Session-ID` values.
pub fn generate_session_id() -> String {
    hex_chars(32)
}

/// `24-hex + '-' + 8-hex`, used for SIP `tag=` parameters.
pub fn generate_tag() -> String {
    format!("{}-{}", hex_chars(24), hex_chars(8))
}

/// `z9hG4bK` + 8 hex chars, the magic cookie required by RFC 3261 branches.
pub fn generate_branch() -> String {
    format!("z9hG4bK{}", hex_chars(8))
}

fn hex_chars(n: usize) -> String {
    let mut rng = rand::thread_rng();
    const ALPHABET: &[u8] = b"0123456789abcdef";
    (0..n).map(|_| ALPHABET[rng.gen_range(0..16)] as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_start_line_and_headers() {
        let head = "INVITE sip:9100@host SIP/2.0\r\nVia: SIP/2.0/TCP 1.2.3.4:5060\r\nCSeq: 101 INVITE\r\nContent-Length: 10\r\n";
        let h = Headers::parse(head);
        assert_eq!(h.request_method(), Some("INVITE"));
        assert_eq!(h.get("Via"), Some("SIP/2.0/TCP 1.2.3.4:5060"));
        assert_eq!(h.cseq(), Some((101, "INVITE")));
        assert_eq!(h.content_length(), Some(10));
    }

    #[test]
    fn parses_response_status_code() {
        let head = "SIP/2.0 486 Busy here\r\nCSeq: 101 INVITE\r\n";
        let h = Headers::parse(head);
        assert!(h.is_response());
        assert_eq!(h.status_code(), Some(486));
    }

    #[test]
    fn session_id_parameter_parsing_does_not_corrupt_ids_containing_remote_substring() {
        // A naive `lstrip('remote=')` would eat leading characters of this
        // id because they overlap with the literal "remote=" char set.
        let head = "SIP/2.0 200 OK\r\nSession-ID: eeee00000000000000000000000000;remote=abcd00000000000000000000000000\r\n";
        let h = Headers::parse(head);
        let (id, remote) = h.session_id().unwrap();
        assert_eq!(id, "eeee00000000000000000000000000");
        assert_eq!(remote.as_deref(), Some("abcd00000000000000000000000000"));
    }

    #[test]
    fn remote_party_id_extracts_display_and_cisco_number() {
        let head = "SIP/2.0 180 Ringing\r\nRemote-Party-ID: \"Alice\" <sip:9100@host>;party=called;x-cisco-number=9100\r\n";
        let h = Headers::parse(head);
        let (display, number) = h.remote_party();
        assert_eq!(display.as_deref(), Some("Alice"));
        assert_eq!(number.as_deref(), Some("9100"));
    }

    #[test]
    fn falls_back_to_from_header_display_name() {
        let head = "INVITE sip:x@y SIP/2.0\r\nFrom: \"Bob\" <sip:9200@host>;tag=abc\r\n";
        let h = Headers::parse(head);
        let (display, number) = h.remote_party();
        assert_eq!(display.as_deref(), Some("Bob"));
        assert_eq!(number.as_deref(), Some("9200"));
    }

    #[test]
    fn generated_ids_have_expected_shapes() {
        assert_eq!(generate_session_id().len(), 32);
        let tag = generate_tag();
        assert_eq!(tag.len(), 33);
        assert_eq!(tag.chars().nth(24), Some('-'));
        assert!(generate_branch().starts_with("z9hG4bK"));
    }
}
