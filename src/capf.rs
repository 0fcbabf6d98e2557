//! CAPF (Certificate Authority Proxy Function) client: the proprietary TLV
//! protocol CUCM phones speak over TLS port 3804 to obtain a locally
//! unique certificate (LSC). Framing, opcodes and field layout below are
//! fixed by the server; only the phone name, generated key, and CSR
//! substitute are produced locally.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use rsa::pkcs8::EncodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use rustls::{ClientConfig, ClientConnection, ServerName};

use crate::error::CapfError;

const MAGIC_BYTE: u8 = 0x55;

const OPCODE_SERVERHELLO: u8 = 0x01;
const OPCODE_CLIENTREQ: u8 = 0x02;
const OPCODE_SERVEROK: u8 = 0x03;
const OPCODE_CLIENTCSR: u8 = 0x04;
const OPCODE_SERVERCRT: u8 = 0x09;
const OPCODE_CLIENTACK: u8 = 0x0a;
const OPCODE_SERVERFIN: u8 = 0x0f;

const RECODE_ALREADYISSUED: u8 = 0x07;
const RECODE_NOTFOUND: u8 = 0x09;

/// Result of a successful certificate issuance: a freshly generated RSA-2048
/// key and the DER certificate CUCM issued for it, both PEM-encoded so the
/// host can hand them straight to [`crate::profile::CertStore`].
pub struct IssuedCertificate {
    pub private_key_pem: String,
    pub certificate_pem: String,
}

/// A connected CAPF session. One instance is good for exactly one
/// `request_certificate` exchange; the session id the server hands out on
/// connect does not carry across TCP connections.
pub struct CapfClient {
    stream: rustls::StreamOwned<ClientConnection, TcpStream>,
    session_id: [u8; 4],
}

impl CapfClient {
    /// Connect and perform the opening `SERVERHELLO` exchange. CAPF
    /// enrollment runs before this device has a certificate of its own to
    /// authenticate with, and CUCM's CAPF service presents a certificate
    /// from its own internal CA that the phone has no prior trust for
    /// either -- hostname/chain verification is always off here, matching
    /// how every CAPF client in the field behaves.
    pub fn connect(host: &str, port: u16) -> Result<Self, CapfError> {
        let tcp = TcpStream::connect((host, port)).map_err(|e| CapfError::Connect(e.to_string()))?;

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        let mut config = config;
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(accept_any::AcceptAnyCert));

        let server_name = ServerName::try_from(host).map_err(|e| CapfError::Connect(e.to_string()))?;
        let conn = ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| CapfError::Connect(e.to_string()))?;
        let mut stream = rustls::StreamOwned::new(conn, tcp);

        let hello = recv_frame(&mut stream)?;
        if hello.len() < 6 {
            return Err(CapfError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short hello")));
        }
        if hello[1] != OPCODE_SERVERHELLO {
            return Err(CapfError::UnexpectedOpcode(hello[1]));
        }
        let mut session_id = [0u8; 4];
        session_id.copy_from_slice(&hello[2..6]);

        Ok(Self { stream, session_id })
    }

    /// Run the full three-step exchange and return the issued key/cert.
    pub fn request_certificate(&mut self, phone_name: &str) -> Result<IssuedCertificate, CapfError> {
        self.send_client_request(phone_name)?;

        let response = recv_frame(&mut self.stream)?;
        let opcode = response[1];
        let fields = read_fields(&response[8..]);
        if opcode == OPCODE_SERVERFIN {
            let errcode = fields.get(&1).and_then(|v| v.first()).copied();
            return Err(match errcode {
                Some(RECODE_ALREADYISSUED) => CapfError::AlreadyIssued,
                Some(RECODE_NOTFOUND) => CapfError::PhoneNotFound,
                Some(other) => CapfError::UnknownDecline(other),
                None => CapfError::UnexpectedOpcode(opcode),
            });
        }
        if opcode != OPCODE_SERVEROK {
            return Err(CapfError::UnexpectedOpcode(opcode));
        }

        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).map_err(|e| CapfError::Crypto(e.to_string()))?;
        let csr = build_csr_substitute(&key);
        self.send_csr(&csr)?;

        let response = recv_frame(&mut self.stream)?;
        if response[1] != OPCODE_SERVERCRT {
            return Err(CapfError::UnexpectedOpcode(response[1]));
        }
        let fields = read_fields(&response[8..]);
        let cert_package = fields.get(&4).ok_or(CapfError::UnexpectedOpcode(response[1]))?;
        let cert_fields = read_fields(cert_package);
        let mut cert_bytes = cert_fields.get(&1).ok_or(CapfError::UnexpectedOpcode(response[1]))?.clone();
        // The server prefixes the DER certificate with a two-byte marker;
        // strip leading 0x00/0x01 bytes the way the reference client does.
        while cert_bytes.first() == Some(&0x00) || cert_bytes.first() == Some(&0x01) {
            cert_bytes.remove(0);
        }

        self.send_ack()?;
        let response = recv_frame(&mut self.stream)?;
        if response[1] != OPCODE_SERVERFIN {
            return Err(CapfError::UnexpectedOpcode(response[1]));
        }

        let private_key_pem = key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| CapfError::Crypto(e.to_string()))?
            .to_string();
        let certificate_pem = der_to_pem(&cert_bytes, "CERTIFICATE");

        Ok(IssuedCertificate { private_key_pem, certificate_pem })
    }

    fn send_client_request(&mut self, phone_name: &str) -> Result<(), CapfError> {
        let mut name = phone_name.as_bytes().to_vec();
        name.push(0);
        let payload = [field(0x07, &[0x02]), field(0x0d, &name), field(0x01, &[0x01])].concat();
        self.send_frame(OPCODE_CLIENTREQ, &payload)
    }

    fn send_csr(&mut self, csr: &[u8]) -> Result<(), CapfError> {
        let payload = field(0x09, csr);
        self.send_frame(OPCODE_CLIENTCSR, &payload)
    }

    fn send_ack(&mut self) -> Result<(), CapfError> {
        let payload = field(0x01, &[0x01]);
        self.send_frame(OPCODE_CLIENTACK, &payload)
    }

    fn send_frame(&mut self, opcode: u8, payload: &[u8]) -> Result<(), CapfError> {
        let mut header = vec![MAGIC_BYTE, opcode];
        header.extend_from_slice(&self.session_id);
        let frame = field_bytes(&header, payload);
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }
}

fn recv_frame(stream: &mut rustls::StreamOwned<ClientConnection, TcpStream>) -> Result<Vec<u8>, CapfError> {
    let mut buf = [0u8; 4096];
    let n = stream.read(&mut buf)?;
    if n == 0 || buf[0] != MAGIC_BYTE {
        return Err(CapfError::BadMagic(*buf.first().unwrap_or(&0)));
    }
    Ok(buf[..n].to_vec())
}

/// `identifier + u16-be length + value`, the TLV shape every CAPF field
/// (and the outer frame itself) uses.
fn field(identifier: u8, value: &[u8]) -> Vec<u8> {
    let mut out = vec![identifier];
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn field_bytes(header: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = header.to_vec();
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn read_fields(data: &[u8]) -> HashMap<u8, Vec<u8>> {
    let mut fields = HashMap::new();
    let mut rest = data;
    while rest.len() >= 3 {
        let id = rest[0];
        let len = u16::from_be_bytes([rest[1], rest[2]]) as usize;
        if rest.len() < 3 + len {
            break;
        }
        fields.insert(id, rest[3..3 + len].to_vec());
        rest = &rest[3 + len..];
    }
    fields
}

/// Builds the abbreviated "CSR" CUCM's CAPF service actually expects: not a
/// PKCS#10 request, just a `SubjectPublicKeyInfo` (algorithm identifier +
/// raw modulus/exponent pair) hand-encoded in DER, matching what the field
/// CAPF client sends.
fn build_csr_substitute(key: &RsaPrivateKey) -> Vec<u8> {
    let public_key_seq = der_sequence(&[
        der_integer(&key.n().to_bytes_be()),
        der_integer(&key.e().to_bytes_be()),
    ]);

    let algorithm_id = der_sequence(&[
        der_oid(&[1, 2, 840, 113549, 1, 1, 1]), // rsaEncryption
        der_null(),
    ]);

    der_sequence(&[algorithm_id, der_bit_string(&public_key_seq)])
}

fn der_len(len: usize) -> Vec<u8> {
    if len < 0x80 {
        vec![len as u8]
    } else {
        let bytes = len.to_be_bytes();
        let significant: Vec<u8> = bytes.iter().copied().skip_while(|&b| b == 0).collect();
        let mut out = vec![0x80 | significant.len() as u8];
        out.extend(significant);
        out
    }
}

fn der_tlv(tag: u8, value: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend(der_len(value.len()));
    out.extend_from_slice(value);
    out
}

fn der_sequence(parts: &[Vec<u8>]) -> Vec<u8> {
    der_tlv(0x30, &parts.concat())
}

fn der_integer(unsigned_be: &[u8]) -> Vec<u8> {
    let mut value = unsigned_be.to_vec();
    if value.first().map(|b| b & 0x80 != 0).unwrap_or(false) {
        value.insert(0, 0x00);
    }
    der_tlv(0x02, &value)
}

fn der_bit_string(inner: &[u8]) -> Vec<u8> {
    let mut value = vec![0x00]; // zero unused trailing bits
    value.extend_from_slice(inner);
    der_tlv(0x03, &value)
}

fn der_null() -> Vec<u8> {
    vec![0x05, 0x00]
}

fn der_oid(arcs: &[u32]) -> Vec<u8> {
    let mut body = vec![(arcs[0] * 40 + arcs[1]) as u8];
    for &arc in &arcs[2..] {
        let mut chunk = vec![(arc & 0x7f) as u8];
        let mut rest = arc >> 7;
        while rest > 0 {
            chunk.push((rest & 0x7f) as u8 | 0x80);
            rest >>= 7;
        }
        chunk.reverse();
        body.extend(chunk);
    }
    der_tlv(0x06, &body)
}

const BASE64_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn base64_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() + 2) / 3 * 4);
    for chunk in data.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = *chunk.get(1).unwrap_or(&0) as u32;
        let b2 = *chunk.get(2).unwrap_or(&0) as u32;
        let triple = (b0 << 16) | (b1 << 8) | b2;
        out.push(BASE64_ALPHABET[((triple >> 18) & 0x3f) as usize] as char);
        out.push(BASE64_ALPHABET[((triple >> 12) & 0x3f) as usize] as char);
        out.push(if chunk.len() > 1 { BASE64_ALPHABET[((triple >> 6) & 0x3f) as usize] as char } else { '=' });
        out.push(if chunk.len() > 2 { BASE64_ALPHABET[(triple & 0x3f) as usize] as char } else { '=' });
    }
    out
}

fn der_to_pem(der: &[u8], label: &str) -> String {
    let b64 = base64_encode(der);
    let mut body = String::new();
    for line in b64.as_bytes().chunks(64) {
        body.push_str(std::str::from_utf8(line).unwrap());
        body.push('\n');
    }
    format!("-----BEGIN {label}-----\n{body}-----END {label}-----\n")
}

mod accept_any {
    use rustls::client::{ServerCertVerified, ServerCertVerifier};
    use rustls::{Certificate, Error, ServerName};
    use std::time::SystemTime;

    pub struct AcceptAnyCert;

    impl ServerCertVerifier for AcceptAnyCert {
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

    #[test]
    fn field_encodes_identifier_length_and_value() {
        let f = field(0x01, &[0xaa, 0xbb]);
        assert_eq!(f, vec![0x01, 0x00, 0x02, 0xaa, 0xbb]);
    }

    #[test]
    fn read_fields_round_trips_field_encoding() {
        let data = [field(0x01, &[0xaa]), field(0x02, &[0xbb, 0xcc])].concat();
        let fields = read_fields(&data);
        assert_eq!(fields.get(&1), Some(&vec![0xaa]));
        assert_eq!(fields.get(&2), Some(&vec![0xbb, 0xcc]));
    }

    #[test]
    fn der_oid_encodes_rsa_encryption() {
        // 1.2.840.113549.1.1.1 -> 06 09 2A 86 48 86 F7 0D 01 01 01
        let oid = der_oid(&[1, 2, 840, 113549, 1, 1, 1]);
        assert_eq!(oid, vec![0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01]);
    }

    #[test]
    fn base64_encode_matches_known_vector() {
        assert_eq!(base64_encode(b"any carnal pleasure."), "YW55IGNhcm5hbCBwbGVhc3VyZS4=");
    }

    #[test]
    fn pem_wraps_at_64_columns_with_labels() {
        let pem = der_to_pem(&[0u8; 100], "CERTIFICATE");
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.trim_end().ends_with("-----END CERTIFICATE-----"));
        let first_body_line = pem.lines().nth(1).unwrap();
        assert_eq!(first_body_line.len(), 64);
    }
}
