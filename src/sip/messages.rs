//! SIP message compilation: every request and response this engine ever
//! sends. Header sets and ordering are fixed per message type, matching
//! what CUCM expects from a CSF-class endpoint; only the values (host,
//! ports, device identity, per-dialog ids) are parameterized.

use std::net::Ipv4Addr;

use crate::profile::{DeviceProfile, SecurityMode};

use super::headers::{generate_branch, generate_session_id, generate_tag};

/// Capability headers CUCM expects on every dialog-establishing message.
const SUPPORTED: &str = "replaces,join,sdp-anat,norefersub,resource-priority,extended-refer,X-cisco-serviceuri";
const ALLOW: &str = "ACK,BYE,CANCEL,INVITE,NOTIFY,OPTIONS,REFER,REGISTER,UPDATE,SUBSCRIBE,INFO";

/// `+sip.instance` URN used on a normal (non-forcing) `REGISTER`.
const ZERO_INSTANCE_URN: &str = "00000000-0000-0000-0000-000000000000";

/// `Session-ID` value meaning "no peer session id known yet", per the
/// all-zeros convention CUCM uses on a dialog's first outgoing message.
fn zero_session_id() -> String {
    "0".repeat(32)
}

/// Everything a compiled message needs to know about the local endpoint,
/// gathered once per dialog so the `compile_*` functions stay pure.
#[derive(Debug, Clone)]
pub struct DialogContext {
    pub profile: DeviceProfile,
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub call_id: String,
    pub branch: String,
    pub from_tag: String,
}

impl DialogContext {
    pub fn new(profile: DeviceProfile, local_ip: Ipv4Addr, local_port: u16) -> Self {
        Self {
            profile,
            local_ip,
            local_port,
            call_id: format!("{}@{}", uuid::Uuid::new_v4(), local_ip),
            branch: generate_branch(),
            from_tag: generate_tag(),
        }
    }

    /// `tcp`/`TCP` for `none`/`authenticated`, `tls`/`TLS` once the dialog
    /// runs over the TLS transport. CUCM expects the lowercase token in the
    /// `Contact` URI's `transport=` parameter and the uppercase token in `Via`.
    fn transport_token(&self, upper: bool) -> &'static str {
        let secure = matches!(self.profile.security_mode, SecurityMode::Encrypted);
        match (secure, upper) {
            (false, false) => "tcp",
            (false, true) => "TCP",
            (true, false) => "tls",
            (true, true) => "TLS",
        }
    }

    fn contact(&self) -> String {
        format!(
            "<sip:{line}@{ip}:{port};transport={transport}>;+u.sip!devicename.ccm.cisco.com=\"{device}\"",
            line = self.profile.line_number,
            ip = self.local_ip,
            port = self.local_port,
            transport = self.transport_token(false),
            device = self.profile.device_name,
        )
    }

    /// `Contact` carrying `+sip.instance`, used only on `REGISTER`:
    /// `instance_urn` is the zero UUID for a normal registration and the
    /// engine's persistent instance id when forcing a takeover.
    fn contact_register(&self, instance_urn: &str) -> String {
        format!(
            "<sip:{line}@{ip}:{port};transport={transport}>;+sip.instance=\"<urn:uuid:{instance}>\";+u.sip!devicename.ccm.cisco.com=\"{device}\"",
            line = self.profile.line_number,
            ip = self.local_ip,
            port = self.local_port,
            transport = self.transport_token(false),
            instance = instance_urn,
            device = self.profile.device_name,
        )
    }

    fn via(&self) -> String {
        format!(
            "SIP/2.0/{} {}:{};branch={}",
            self.transport_token(true),
            self.local_ip,
            self.local_port,
            self.branch
        )
    }

    /// `Date:` header value for "now", hand-formatted (see [`rfc1123_date`]).
    fn date_now(&self) -> String {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        rfc1123_date(secs)
    }
}

/// RFC 1123 `Date:` header value, hand-formatted to avoid pulling in a date
/// crate for one field. `unix_secs` comes from the host clock.
pub fn rfc1123_date(unix_secs: u64) -> String {
    const DAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
    const MONTHS: [&str; 12] =
        ["Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec"];

    let days_since_epoch = unix_secs / 86400;
    let secs_of_day = unix_secs % 86400;
    let (hour, minute, second) = (secs_of_day / 3600, (secs_of_day % 3600) / 60, secs_of_day % 60);
    let weekday = DAYS[((days_since_epoch + 4) % 7) as usize];

    let (year, month, day) = civil_from_days(days_since_epoch as i64);

    format!(
        "{weekday}, {day:02} {month} {year} {hour:02}:{minute:02}:{second:02} GMT",
        month = MONTHS[(month - 1) as usize],
    )
}

/// Howard Hinnant's days-from-civil algorithm, inverted: days since the
/// Unix epoch -> (year, month, day).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// `REGISTER` head + the two-part `multipart/mixed` body CUCM expects for a
/// CSF-class registration (bulk register request, then capability set).
///
/// `force` selects the takeover path: `+sip.instance` carries `instance_id`
/// instead of the zero UUID, and the `Reason:` alarm cause becomes
/// `Application-Requested-Destroy` instead of `initialized`.
pub fn compile_register(ctx: &DialogContext, cseq: u32, date: &str, force: bool, instance_id: &str) -> (String, String) {
    let boundary = "uniqueBoundary";
    let instance_urn = if force { instance_id } else { ZERO_INSTANCE_URN };
    let alarm_cause = if force { "Application-Requested-Destroy" } else { "initialized" };
    let body = format!(
        "--{boundary}\r\n\
         Content-Type: application/x-cisco-remotecc-request+xml\r\n\r\n\
         <bulkregisterreq>\r\n\
         \t<bulkregisterpart>\r\n\
         \t\t<device>{device}</device>\r\n\
         \t\t<line>{line}</line>\r\n\
         \t</bulkregisterpart>\r\n\
         </bulkregisterreq>\r\n\
         --{boundary}\r\n\
         Content-Type: application/x-cisco-remotecc-request+xml\r\n\r\n\
         <optionsind>\r\n\
         \t<capabilities>audio,video=false,kpml=true</capabilities>\r\n\
         </optionsind>\r\n\
         --{boundary}--\r\n",
        device = ctx.profile.device_name,
        line = ctx.profile.line_number,
    );

    let head = format!(
        "REGISTER sip:{host} SIP/2.0\r\n\
         Via: {via}\r\n\
         From: <sip:{line}@{host}>;tag={tag}\r\n\
         To: <sip:{line}@{host}>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} REGISTER\r\n\
         Contact: {contact}\r\n\
         Session-ID: {session_id}\r\n\
         Expires: 3600\r\n\
         Reason: SIP;cause=200;text=\"cisco-alarm:25 Name={device} ActiveLoad={device} Last={alarm_cause}\"\r\n\
         Date: {date}\r\n\
         Max-Forwards: 70\r\n\
         User-Agent: {device}\r\n\
         Server: Cisco-CSF\r\n\
         Supported: {supported}\r\n\
         Allow: {allow}\r\n\
         Content-Type: multipart/mixed;boundary={boundary}\r\n\
         Content-Length: {len}\r\n\r\n",
        supported = SUPPORTED,
        allow = ALLOW,
        host = ctx.profile.cucm_host,
        line = ctx.profile.line_number,
        tag = ctx.from_tag,
        via = ctx.via(),
        call_id = ctx.call_id,
        contact = ctx.contact_register(instance_urn),
        device = ctx.profile.device_name,
        session_id = generate_session_id(),
        len = body.len(),
    );

    (head, body)
}

/// Outgoing `INVITE`, carrying the locally built SDP offer as its body.
/// `local_session_id` is the dialog's stable session id, generated once by
/// the caller and reused on every later message of the same dialog.
pub fn compile_invite(ctx: &DialogContext, cseq: u32, to_number: &str, sdp_body: &str, local_session_id: &str) -> (String, String) {
    let head = format!(
        "INVITE sip:{to}@{host} SIP/2.0\r\n\
         Via: {via}\r\n\
         From: <sip:{line}@{host}>;tag={tag}\r\n\
         To: <sip:{to}@{host}>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} INVITE\r\n\
         Contact: {contact}\r\n\
         Session-ID: {session_id}\r\n\
         Remote-Party-ID: <sip:{line}@{host}>;party=calling;screen=yes;privacy=off\r\n\
         Expires: 180\r\n\
         Allow: {allow}\r\n\
         Supported: {supported}\r\n\
         Allow-Events: kpml,dialog\r\n\
         Date: {date}\r\n\
         Max-Forwards: 70\r\n\
         User-Agent: {device}\r\n\
         Server: Cisco-CSF\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {len}\r\n\r\n",
        to = to_number,
        host = ctx.profile.cucm_host,
        line = ctx.profile.line_number,
        tag = ctx.from_tag,
        via = ctx.via(),
        call_id = ctx.call_id,
        contact = ctx.contact(),
        session_id = format!("{local_session_id};remote={}", zero_session_id()),
        allow = ALLOW,
        supported = SUPPORTED,
        date = ctx.date_now(),
        device = ctx.profile.device_name,
        len = sdp_body.len(),
    );

    (head, sdp_body.to_string())
}

/// `ACK` sent after receiving the `200 OK` for an outgoing `INVITE`.
pub fn compile_invite_ok_ack(ctx: &DialogContext, to_number: &str, to_tag: &str) -> String {
    format!(
        "ACK sip:{to}@{host} SIP/2.0\r\n\
         Via: {via}\r\n\
         From: <sip:{line}@{host}>;tag={tag}\r\n\
         To: <sip:{to}@{host}>;tag={to_tag}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 101 ACK\r\n\
         Date: {date}\r\n\
         Max-Forwards: 70\r\n\
         Content-Length: 0\r\n\r\n",
        to = to_number,
        host = ctx.profile.cucm_host,
        line = ctx.profile.line_number,
        tag = ctx.from_tag,
        via = ctx.via(),
        call_id = ctx.call_id,
        date = ctx.date_now(),
    )
}

/// `CANCEL` for an outgoing `INVITE` that hasn't been answered yet.
pub fn compile_cancel(ctx: &DialogContext, to_number: &str) -> String {
    format!(
        "CANCEL sip:{to}@{host} SIP/2.0\r\n\
         Via: {via}\r\n\
         From: <sip:{line}@{host}>;tag={tag}\r\n\
         To: <sip:{to}@{host}>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 101 CANCEL\r\n\
         Date: {date}\r\n\
         Max-Forwards: 70\r\n\
         Content-Length: 0\r\n\r\n",
        to = to_number,
        host = ctx.profile.cucm_host,
        line = ctx.profile.line_number,
        tag = ctx.from_tag,
        via = ctx.via(),
        call_id = ctx.call_id,
        date = ctx.date_now(),
    )
}

/// `100 Trying` sent immediately on receiving an incoming `INVITE`.
pub fn compile_trying(ctx: &DialogContext, from_header: &str, to_header_with_tag: &str, call_id: &str) -> String {
    format!(
        "SIP/2.0 100 Trying\r\n\
         Via: {via}\r\n\
         From: {from}\r\n\
         To: {to}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 101 INVITE\r\n\
         Date: {date}\r\n\
         Server: Cisco-CSF\r\n\
         Content-Length: 0\r\n\r\n",
        via = ctx.via(),
        from = from_header,
        to = to_header_with_tag,
        date = ctx.date_now(),
    )
}

/// `180 Ringing` for an incoming call, alerting the caller.
pub fn compile_ringing(
    ctx: &DialogContext,
    from_header: &str,
    to_header_with_tag: &str,
    call_id: &str,
    session_id: &str,
    remote_session_id: &str,
) -> String {
    format!(
        "SIP/2.0 180 Ringing\r\n\
         Via: {via}\r\n\
         From: {from}\r\n\
         To: {to}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 101 INVITE\r\n\
         Contact: {contact}\r\n\
         Session-ID: {session_id};remote={remote_session_id}\r\n\
         Remote-Party-ID: <sip:{line}@{host}>;party=called;screen=yes;privacy=off\r\n\
         Allow: {allow}\r\n\
         Supported: {supported}\r\n\
         Allow-Events: kpml,dialog\r\n\
         Date: {date}\r\n\
         Server: Cisco-CSF\r\n\
         Content-Length: 0\r\n\r\n",
        via = ctx.via(),
        from = from_header,
        to = to_header_with_tag,
        contact = ctx.contact(),
        line = ctx.profile.line_number,
        host = ctx.profile.cucm_host,
        allow = ALLOW,
        supported = SUPPORTED,
        date = ctx.date_now(),
    )
}

/// `486 Busy Here`, used both for a genuinely busy line and for the
/// single-active-dialog rejection of a second concurrent `INVITE`.
pub fn compile_busy_here(ctx: &DialogContext, from_header: &str, to_header_with_tag: &str, call_id: &str) -> String {
    format!(
        "SIP/2.0 486 Busy Here\r\n\
         Via: {via}\r\n\
         From: {from}\r\n\
         To: {to}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 101 INVITE\r\n\
         Remote-Party-ID: <sip:{line}@{host}>;party=called;screen=yes;privacy=off\r\n\
         Date: {date}\r\n\
         Server: Cisco-CSF\r\n\
         Content-Length: 0\r\n\r\n",
        via = ctx.via(),
        from = from_header,
        to = to_header_with_tag,
        line = ctx.profile.line_number,
        host = ctx.profile.cucm_host,
        date = ctx.date_now(),
    )
}

/// `200 OK` answering an incoming `INVITE`, carrying the local SDP answer.
pub fn compile_invite_ok(
    ctx: &DialogContext,
    from_header: &str,
    to_header_with_tag: &str,
    call_id: &str,
    sdp_body: &str,
) -> (String, String) {
    let head = format!(
        "SIP/2.0 200 OK\r\n\
         Via: {via}\r\n\
         From: {from}\r\n\
         To: {to}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 101 INVITE\r\n\
         Contact: {contact}\r\n\
         Allow: {allow}\r\n\
         Supported: {supported}\r\n\
         Date: {date}\r\n\
         Server: Cisco-CSF\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {len}\r\n\r\n",
        via = ctx.via(),
        from = from_header,
        to = to_header_with_tag,
        contact = ctx.contact(),
        allow = ALLOW,
        supported = SUPPORTED,
        date = ctx.date_now(),
        len = sdp_body.len(),
    );
    (head, sdp_body.to_string())
}

/// `BYE` sent to tear down a call this endpoint originated.
pub fn compile_bye_outgoing(ctx: &DialogContext, to_number: &str, to_tag: &str) -> String {
    format!(
        "BYE sip:{to}@{host} SIP/2.0\r\n\
         Via: {via}\r\n\
         From: <sip:{line}@{host}>;tag={tag}\r\n\
         To: <sip:{to}@{host}>;tag={to_tag}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 102 BYE\r\n\
         Date: {date}\r\n\
         Max-Forwards: 70\r\n\
         Content-Length: 0\r\n\r\n",
        to = to_number,
        host = ctx.profile.cucm_host,
        line = ctx.profile.line_number,
        tag = ctx.from_tag,
        via = ctx.via(),
        call_id = ctx.call_id,
        date = ctx.date_now(),
    )
}

/// `BYE` sent to tear down a call this endpoint received; From/To are
/// swapped relative to the outgoing case since the local party was the
/// original `To`.
pub fn compile_bye_incoming(ctx: &DialogContext, local_tag: &str, peer_uri: &str, peer_tag: &str, call_id: &str) -> String {
    format!(
        "BYE {peer_uri} SIP/2.0\r\n\
         Via: {via}\r\n\
         From: <sip:{line}@{host}>;tag={local_tag}\r\n\
         To: {peer_uri};tag={peer_tag}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 102 BYE\r\n\
         Date: {date}\r\n\
         Max-Forwards: 70\r\n\
         Content-Length: 0\r\n\r\n",
        via = ctx.via(),
        line = ctx.profile.line_number,
        host = ctx.profile.cucm_host,
        date = ctx.date_now(),
    )
}

/// `200 OK` acknowledging a received `BYE`.
pub fn compile_bye_ok(ctx: &DialogContext, from_header: &str, to_header: &str, call_id: &str) -> String {
    format!(
        "SIP/2.0 200 OK\r\n\
         Via: {via}\r\n\
         From: {from}\r\n\
         To: {to}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 102 BYE\r\n\
         Date: {date}\r\n\
         Server: Cisco-CSF\r\n\
         Content-Length: 0\r\n\r\n",
        via = ctx.via(),
        from = from_header,
        to = to_header,
        date = ctx.date_now(),
    )
}

/// `200 OK` acknowledging a KPML `SUBSCRIBE`.
pub fn compile_subscribe_ack(ctx: &DialogContext, from_header: &str, to_header_with_tag: &str, call_id: &str, cseq: u32) -> String {
    format!(
        "SIP/2.0 200 OK\r\n\
         Via: {via}\r\n\
         From: {from}\r\n\
         To: {to}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} SUBSCRIBE\r\n\
         Expires: 7200\r\n\
         Date: {date}\r\n\
         Server: Cisco-CSF\r\n\
         Content-Length: 0\r\n\r\n",
        via = ctx.via(),
        from = from_header,
        to = to_header_with_tag,
        date = ctx.date_now(),
    )
}

/// KPML `NOTIFY`, either the initial empty-body notification or a
/// terminating one carrying a `kpml-response` body (`code`/`text` pair).
pub fn compile_subscribe_notify(
    ctx: &DialogContext,
    peer_uri: &str,
    local_tag: &str,
    peer_tag: &str,
    call_id: &str,
    cseq: u32,
    kpml_code: Option<(&str, &str)>,
) -> (String, String) {
    let body = match kpml_code {
        None => String::new(),
        Some((code, text)) => format!(
            "<kpml-response version=\"1.0\" code=\"{code}\" text=\"{text}\"/>\r\n",
        ),
    };

    let content_type = if body.is_empty() {
        String::new()
    } else {
        "Content-Type: application/kpml-response+xml\r\n".to_string()
    };

    let head = format!(
        "NOTIFY {peer_uri} SIP/2.0\r\n\
         Via: {via}\r\n\
         From: <sip:{line}@{host}>;tag={local_tag}\r\n\
         To: {peer_uri};tag={peer_tag}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} NOTIFY\r\n\
         Event: kpml\r\n\
         Subscription-State: active;expires=7200\r\n\
         Date: {date}\r\n\
         Max-Forwards: 70\r\n\
         {content_type}Content-Length: {len}\r\n\r\n",
        via = ctx.via(),
        line = ctx.profile.line_number,
        host = ctx.profile.cucm_host,
        date = ctx.date_now(),
        len = body.len(),
    );

    (head, body)
}
