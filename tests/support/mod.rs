//! Shared fixtures for the end-to-end tests: a minimal fake-CUCM TCP server
//! helper (message framing mirrors `src/sip/transport.rs` but reimplemented
//! here deliberately, so these tests exercise the engine's wire behavior
//! against an independent reader rather than its own parser) plus device
//! profile/config builders.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use cucm_softphone::profile::{CertStore, DeviceProfile, PhoneConfig, SecurityMode};
use cucm_softphone::sip::headers::Headers;

static COUNTER: AtomicU32 = AtomicU32::new(0);

pub fn temp_dir(label: &str) -> PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("cucm-softphone-test-{label}-{}-{n}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn profile(host: &str, sip_port: u16, sips_port: u16) -> DeviceProfile {
    DeviceProfile {
        cucm_host: host.to_string(),
        sip_port,
        sips_port,
        line_number: "9100".to_string(),
        display_name: "Test User".to_string(),
        device_name: "SEP001122334455".to_string(),
        contact_id: "9100".to_string(),
        security_mode: SecurityMode::None,
        expected_cert_md5: None,
        capf_servers: vec![],
    }
}

pub fn config(profile: DeviceProfile) -> PhoneConfig {
    let certs = CertStore { client_cert_dir: temp_dir("client"), server_cert_dir: temp_dir("server") };
    PhoneConfig::new(profile, certs)
}

/// Read one framed SIP message (head + body) off a raw socket the way a
/// CUCM-side test double would, using the crate's own header parser to
/// find `Content-Length`.
pub fn read_frame(stream: &mut TcpStream) -> (String, String) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let text = String::from_utf8_lossy(&buf).into_owned();
        if let Some(split_at) = text.find("\r\n\r\n") {
            let head = text[..split_at].to_string();
            let header_bytes = split_at + 4;
            let content_length = Headers::parse(&head).content_length().unwrap_or(0);
            if buf.len() - header_bytes >= content_length {
                let body = String::from_utf8_lossy(&buf[header_bytes..header_bytes + content_length]).into_owned();
                return (head, body);
            }
        }
        let n = stream.read(&mut chunk).expect("fake cucm server read");
        assert!(n > 0, "peer closed before a full frame arrived");
        buf.extend_from_slice(&chunk[..n]);
    }
}

pub fn send(stream: &mut TcpStream, text: &str) {
    stream.write_all(text.as_bytes()).unwrap();
}

pub fn header(head: &str, name: &str) -> String {
    Headers::parse(head).get(name).unwrap_or("").to_string()
}

/// A silent capture/playback stand-in, just enough to keep an `RtpSession`'s
/// tx/rx threads alive (and stoppable promptly) for the duration of a test.
pub struct SilentSource;
impl cucm_softphone::audio::AudioSource for SilentSource {
    fn read(&mut self, samples: usize) -> std::io::Result<Vec<i16>> {
        std::thread::sleep(std::time::Duration::from_millis(5));
        Ok(vec![0i16; samples])
    }
}

pub struct NullSink;
impl cucm_softphone::audio::AudioSink for NullSink {
    fn write(&mut self, _samples: &[i16]) -> std::io::Result<()> {
        Ok(())
    }
}
