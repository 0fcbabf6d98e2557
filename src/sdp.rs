//! Minimal SDP (RFC 4566) offer/answer handling: exactly enough to talk to
//! CUCM. The offer always advertises the same fixed payload set and Cisco
//! attributes; the answer parser pulls out a connection address, a media
//! port, and a single chosen codec.

use std::net::Ipv4Addr;

use crate::error::SdpError;

/// One entry from a parsed `a=rtpmap` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: Option<u32>,
}

/// A parsed SDP offer or answer, reduced to the fields this engine cares about.
#[derive(Debug, Clone)]
pub struct SessionDescription {
    pub connection_ip: Ipv4Addr,
    pub media_port: u16,
    pub payload_types: Vec<u8>,
    pub rtpmaps: Vec<RtpMap>,
}

/// Build the fixed local offer body for a given local address/port.
///
/// The attribute set (`cisco-mari`, `b=AS:4000`, the `Cisco-SIPUA` origin
/// line) is not optional decoration: CUCM has been observed to reject
/// offers missing them.
pub fn build_offer(local_ip: Ipv4Addr, local_port: u16) -> String {
    format!(
        "v=0\r\n\
         o=Cisco-SIPUA 22437 0 IN IP4 {ip}\r\n\
         s=SIP Call\r\n\
         c=IN IP4 {ip}\r\n\
         b=AS:4000\r\n\
         t=0 0\r\n\
         a=cisco-mari:v1\r\n\
         a=cisco-mari-rate\r\n\
         m=audio {port} RTP/AVP 114 0 8 111 101\r\n\
         a=rtpmap:114 opus/48000/2\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=rtpmap:8 PCMA/8000\r\n\
         a=rtpmap:111 x-ulpfecuc/8000\r\n\
         a=rtpmap:101 telephone-event/8000\r\n\
         a=sendrecv\r\n",
        ip = local_ip,
        port = local_port,
    )
}

/// Parse an SDP body into connection address, media port, payload types in
/// declared order, and the `rtpmap` table.
pub fn parse(body: &str) -> Result<SessionDescription, SdpError> {
    let mut connection_ip: Option<Ipv4Addr> = None;
    let mut media_port: Option<u16> = None;
    let mut payload_types = Vec::new();
    let mut rtpmaps = Vec::new();

    for line in body.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("c=") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() >= 3 {
                connection_ip = parts[2].parse().ok();
            }
        } else if let Some(rest) = line.strip_prefix("m=audio") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() >= 3 {
                media_port = parts[0].parse().ok();
                payload_types = parts[2..].iter().filter_map(|p| p.parse().ok()).collect();
            }
        } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            if let Some(map) = parse_rtpmap(rest) {
                rtpmaps.push(map);
            }
        }
    }

    let connection_ip = connection_ip.ok_or(SdpError::MissingConnection)?;
    let media_port = media_port.ok_or(SdpError::MissingMedia)?;

    Ok(SessionDescription { connection_ip, media_port, payload_types, rtpmaps })
}

fn parse_rtpmap(rest: &str) -> Option<RtpMap> {
    let mut parts = rest.splitn(2, ' ');
    let pt: u8 = parts.next()?.trim().parse().ok()?;
    let encoding_spec = parts.next()?.trim();

    let mut fields = encoding_spec.split('/');
    let encoding = fields.next()?.to_string();
    let clock_rate: u32 = fields.next()?.parse().ok()?;
    let channels: Option<u32> = fields.next().and_then(|c| c.parse().ok());

    Some(RtpMap { payload_type: pt, encoding, clock_rate, channels })
}

/// Negotiation rule: opus beats PCMA beats PCMU, applied against whatever
/// the peer actually advertised an `rtpmap` for.
pub fn select_codec(sdp: &SessionDescription) -> Result<(u8, u32), SdpError> {
    if let Some(opus) = sdp.rtpmaps.iter().find(|m| m.encoding.eq_ignore_ascii_case("opus")) {
        return Ok((opus.payload_type, opus.clock_rate));
    }
    if let Some(pcma) = sdp.rtpmaps.iter().find(|m| m.encoding.eq_ignore_ascii_case("PCMA")) {
        return Ok((pcma.payload_type, pcma.clock_rate));
    }
    if sdp.payload_types.contains(&crate::codec::PT_PCMU)
        || sdp.rtpmaps.iter().any(|m| m.encoding.eq_ignore_ascii_case("PCMU"))
    {
        return Ok((crate::codec::PT_PCMU, 8000));
    }
    Err(SdpError::NoCommonCodec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_carries_the_mandatory_cisco_attributes() {
        let offer = build_offer(Ipv4Addr::new(10, 0, 0, 5), 12000);
        assert!(offer.contains("a=cisco-mari:v1"));
        assert!(offer.contains("b=AS:4000"));
        assert!(offer.contains("o=Cisco-SIPUA"));
        assert!(offer.contains("m=audio 12000 RTP/AVP 114 0 8 111 101"));
    }

    #[test]
    fn parses_connection_and_media_port() {
        let body = "v=0\r\no=x 1 2 IN IP4 10.0.0.1\r\nc=IN IP4 10.0.0.1\r\nt=0 0\r\nm=audio 30000 RTP/AVP 8\r\na=rtpmap:8 PCMA/8000\r\n";
        let sdp = parse(body).unwrap();
        assert_eq!(sdp.connection_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(sdp.media_port, 30000);
        assert_eq!(sdp.payload_types, vec![8]);
    }

    #[test]
    fn selects_opus_over_pcma_over_pcmu() {
        let mut sdp = parse("c=IN IP4 1.2.3.4\r\nm=audio 1000 RTP/AVP 0 8 114\r\na=rtpmap:0 PCMU/8000\r\na=rtpmap:8 PCMA/8000\r\na=rtpmap:114 opus/48000/2\r\n").unwrap();
        assert_eq!(select_codec(&sdp).unwrap(), (114, 48000));

        sdp.rtpmaps.retain(|m| m.payload_type != 114);
        assert_eq!(select_codec(&sdp).unwrap(), (8, 8000));

        sdp.rtpmaps.retain(|m| m.payload_type != 8);
        assert_eq!(select_codec(&sdp).unwrap(), (0, 8000));
    }

    #[test]
    fn missing_connection_line_is_an_error() {
        let body = "v=0\r\nm=audio 1000 RTP/AVP 0\r\n";
        assert!(parse(body).is_err());
    }
}
