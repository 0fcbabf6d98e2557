//! Blocking SIP transport: a TCP or TLS byte stream framed by
//! `Content-Length`, with partial-frame buffering across reads.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerName};

use crate::error::SipError;

/// One parsed SIP message: header block plus body bytes.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub head: String,
    pub body: Vec<u8>,
}

enum Stream {
    Tcp(TcpStream),
    Tls(rustls::StreamOwned<ClientConnection, TcpStream>),
}

impl Stream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_read_timeout(timeout),
            Stream::Tls(s) => s.sock.set_read_timeout(timeout),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Tls(s) => s.write(buf),
        }
    }
    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Tls(s) => s.flush(),
        }
    }
}

/// A connected SIP transport. Reader and writer halves are used from
/// different threads (the SIP reader thread reads; host commands write
/// under the dialog mutex), so the stream is wrapped once here and callers
/// serialize access to it themselves via that mutex.
pub struct SipTransport {
    stream: Stream,
    recv_buf: Vec<u8>,
    pub local_addr: std::net::SocketAddr,
}

impl SipTransport {
    pub fn connect_tcp(host: &str, port: u16) -> Result<Self, SipError> {
        let stream = TcpStream::connect((host, port)).map_err(SipError::Connect)?;
        let local_addr = stream.local_addr().map_err(SipError::Connect)?;
        Ok(Self { stream: Stream::Tcp(stream), recv_buf: Vec::new(), local_addr })
    }

    /// `trusted_pem` is the CUCM CallManager (or CAPF) CA/self-signed cert
    /// collection read from [`crate::profile::CertStore::server_cert_dir`].
    /// When `verify_hostname` is off, the chain is still validated against
    /// `trusted_pem`; only the hostname-vs-SAN check is skipped, matching
    /// deployments that pin by certificate rather than by name.
    pub fn connect_tls(
        host: &str,
        port: u16,
        trusted_pem: &[u8],
        verify_hostname: bool,
    ) -> Result<Self, SipError> {
        let tcp = TcpStream::connect((host, port)).map_err(SipError::Connect)?;
        let local_addr = tcp.local_addr().map_err(SipError::Connect)?;

        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut std::io::Cursor::new(trusted_pem))
            .map_err(|e| SipError::Tls(e.to_string()))?
        {
            roots.add(&rustls::Certificate(cert)).map_err(|e| SipError::Tls(e.to_string()))?;
        }

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let mut config = config;
        if !verify_hostname {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(danger::NoHostnameVerification));
        }

        let server_name = ServerName::try_from(host).map_err(|e| SipError::Tls(e.to_string()))?;
        let conn = ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| SipError::Tls(e.to_string()))?;
        let tls_stream = rustls::StreamOwned::new(conn, tcp);

        Ok(Self { stream: Stream::Tls(tls_stream), recv_buf: Vec::new(), local_addr })
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), SipError> {
        self.stream.set_read_timeout(timeout).map_err(SipError::Read)
    }

    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<(), SipError> {
        self.stream.write_all(bytes).map_err(SipError::Write)?;
        self.stream.flush().map_err(SipError::Write)
    }

    /// Read one message, blocking and buffering across `read()` calls until
    /// `Content-Length` bytes of body are available. Returns `Ok(None)` on a
    /// clean EOF.
    pub fn read_message(&mut self) -> Result<Option<RawMessage>, SipError> {
        loop {
            if let Some(msg) = self.try_take_message()? {
                return Ok(Some(msg));
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).map_err(SipError::Read)?;
            if n == 0 {
                return Ok(None);
            }
            self.recv_buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn try_take_message(&mut self) -> Result<Option<RawMessage>, SipError> {
        let text = String::from_utf8_lossy(&self.recv_buf).into_owned();
        let Some(split_at) = text.find("\r\n\r\n") else {
            return Ok(None);
        };
        let head = text[..split_at].to_string();
        let header_bytes = split_at + 4;

        let content_length = crate::sip::headers::Headers::parse(&head)
            .content_length()
            .ok_or_else(|| SipError::Malformed("missing Content-Length".into()))?;

        let available_body = self.recv_buf.len() - header_bytes;
        if available_body < content_length {
            return Ok(None);
        }

        let body = self.recv_buf[header_bytes..header_bytes + content_length].to_vec();
        self.recv_buf.drain(..header_bytes + content_length);

        Ok(Some(RawMessage { head, body }))
    }
}

mod danger {
    use rustls::client::{ServerCertVerified, ServerCertVerifier};
    use rustls::{Certificate, Error, ServerName};
    use std::time::SystemTime;

    /// Skips hostname verification only; still requires a handshake to
    /// complete. Used when [`crate::profile::PhoneConfig::verify_hostname`]
    /// is explicitly turned off by the host.
    pub struct NoHostnameVerification;

    impl ServerCertVerifier for NoHostnameVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &Certificate,
            _intermediates: &[Certificate],
            _server_name: &ServerName,
            _scts: &mut dyn Iterator<Item = &[u8]>,
            _ocsp_response: &[u8],
            _now: SystemTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpListener;

    #[test]
    fn frames_a_single_message_by_content_length() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"SIP/2.0 200 OK\r\nContent-Length: 5\r\n\r\nhello").unwrap();
        });

        let mut transport = SipTransport::connect_tcp(&addr.ip().to_string(), addr.port()).unwrap();
        let msg = transport.read_message().unwrap().unwrap();
        assert!(msg.head.starts_with("SIP/2.0 200 OK"));
        assert_eq!(msg.body, b"hello");
        server.join().unwrap();
    }

    #[test]
    fn waits_for_a_partial_body_across_two_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"SIP/2.0 200 OK\r\nContent-Length: 5\r\n\r\nhel").unwrap();
            std::thread::sleep(Duration::from_millis(50));
            sock.write_all(b"lo").unwrap();
        });

        let mut transport = SipTransport::connect_tcp(&addr.ip().to_string(), addr.port()).unwrap();
        let msg = transport.read_message().unwrap().unwrap();
        assert_eq!(msg.body, b"hello");
        server.join().unwrap();
    }

    #[test]
    fn dispatches_two_back_to_back_messages_from_one_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"SIP/2.0 100 Trying\r\nContent-Length: 0\r\n\r\nSIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n")
                .unwrap();
        });

        let mut transport = SipTransport::connect_tcp(&addr.ip().to_string(), addr.port()).unwrap();
        let first = transport.read_message().unwrap().unwrap();
        let second = transport.read_message().unwrap().unwrap();
        assert!(first.head.starts_with("SIP/2.0 100"));
        assert!(second.head.starts_with("SIP/2.0 200"));
        server.join().unwrap();
    }
}
