use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rand::Rng;

use crate::audio::{AudioSink, AudioSource};
use crate::codec::Codec;
use crate::error::RtpError;
use crate::resample::Resampler;
use crate::rtp::packet::RtpPacket;

/// Fixed 20-byte STUN binding indication CUCM's media gateway expects as a
/// keepalive: a binding-indication message type/length header followed by
/// an ASCII transaction id. Not a conformant STUN transaction id, but the
/// only shape this gateway is known to check for.
const STUN_KEEPALIVE: [u8; 20] = [
    0x00, 0x11, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, b'K', b'e', b'e', b'p', b'a', b' ', b'R', b'T', b'P', 0x00,
    0x00, 0x00,
];

const RECV_BUF: usize = 1024;

pub struct RtpSockets {
    pub rtp: UdpSocket,
    pub rtcp: UdpSocket,
    pub local_rtp_port: u16,
}

impl RtpSockets {
    /// Bind the inbound RTP/RTCP socket pair on adjacent ports.
    pub fn bind() -> Result<Self, RtpError> {
        for base in (10000u16..20000).step_by(2) {
            let rtp = UdpSocket::bind(("0.0.0.0", base));
            let rtcp = UdpSocket::bind(("0.0.0.0", base + 1));
            if let (Ok(rtp), Ok(rtcp)) = (rtp, rtcp) {
                return Ok(Self { rtp, rtcp, local_rtp_port: base });
            }
        }
        Err(RtpError::Bind(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "no free adjacent UDP port pair found",
        )))
    }
}

/// One bidirectional RTP media stream for an established call.
pub struct RtpSession {
    stop: Arc<AtomicBool>,
    tx_handle: Option<JoinHandle<()>>,
    rx_handle: Option<JoinHandle<()>>,
    locked_payload_type: Arc<AtomicU32>,
}

impl RtpSession {
    /// Start the sender and receiver threads. `codec` is the negotiated
    /// codec for the outbound direction; the inbound direction locks its
    /// own codec from the payload type of the first received packet.
    pub fn start(
        sockets: RtpSockets,
        remote_addr: SocketAddr,
        device_rate: u32,
        mut codec: Codec,
        source: Box<dyn AudioSource>,
        sink: Box<dyn AudioSink>,
    ) -> Result<Self, RtpError> {
        let stop = Arc::new(AtomicBool::new(false));
        let rtp_socket = sockets.rtp.try_clone().map_err(RtpError::Bind)?;
        rtp_socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .map_err(RtpError::Bind)?;

        send_stun_keepalive(&sockets.rtp, &sockets.rtcp, remote_addr);

        let codec_clock = codec.clock_rate();
        let frame_samples = codec.frame_samples();
        let locked_payload_type = Arc::new(AtomicU32::new(u32::MAX));

        let tx_stop = stop.clone();
        let tx_socket = rtp_socket.try_clone().map_err(RtpError::Bind)?;
        let tx_handle = std::thread::Builder::new()
            .name("rtp-tx".into())
            .spawn(move || {
                tx_loop(
                    tx_socket,
                    remote_addr,
                    device_rate,
                    codec_clock,
                    frame_samples,
                    &mut codec,
                    source,
                    tx_stop,
                )
            })
            .expect("spawn rtp-tx thread");

        let rx_stop = stop.clone();
        let rx_locked_pt = locked_payload_type.clone();
        let rx_handle = std::thread::Builder::new()
            .name("rtp-rx".into())
            .spawn(move || rx_loop(rtp_socket, device_rate, rx_locked_pt, sink, rx_stop))
            .expect("spawn rtp-rx thread");

        Ok(Self {
            stop,
            tx_handle: Some(tx_handle),
            rx_handle: Some(rx_handle),
            locked_payload_type,
        })
    }

    pub fn locked_payload_type(&self) -> Option<u8> {
        let v = self.locked_payload_type.load(Ordering::Relaxed);
        if v == u32::MAX {
            None
        } else {
            Some(v as u8)
        }
    }

    /// Idempotent: calling `stop` twice is safe.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.tx_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.rx_handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for RtpSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn send_stun_keepalive(rtp: &UdpSocket, rtcp: &UdpSocket, remote: SocketAddr) {
    let _ = rtp.send_to(&STUN_KEEPALIVE, remote);
    let _ = rtcp.send_to(&STUN_KEEPALIVE, SocketAddr::new(remote.ip(), remote.port() + 1));
}

#[allow(clippy::too_many_arguments)]
fn tx_loop(
    socket: UdpSocket,
    remote_addr: SocketAddr,
    device_rate: u32,
    codec_rate: u32,
    frame_samples: usize,
    codec: &mut Codec,
    mut source: Box<dyn AudioSource>,
    stop: Arc<AtomicBool>,
) {
    let ssrc: u32 = rand::thread_rng().gen();
    let mut sequence_number: u16 = 1;
    let mut timestamp: u32 = frame_samples as u32;
    let mut first_packet = true;
    let mut resampler = Resampler::new(device_rate, codec_rate);

    // Samples to pull from the device per iteration, at the device rate.
    let device_chunk = ((frame_samples as u64 * device_rate as u64) / codec_rate as u64) as usize;

    while !stop.load(Ordering::Relaxed) {
        let captured = match source.read(device_chunk) {
            Ok(pcm) => pcm,
            Err(e) => {
                tracing::warn!("rtp tx: audio source error: {e}");
                break;
            }
        };
        if captured.is_empty() {
            continue;
        }

        let pcm = resampler.process(&captured);
        if pcm.is_empty() {
            continue;
        }

        let payload = match codec.encode(&pcm) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("rtp tx: encode error: {e}");
                continue;
            }
        };

        let payload_type = match codec {
            Codec::Pcmu => crate::codec::PT_PCMU,
            Codec::Pcma => crate::codec::PT_PCMA,
            Codec::G729(_) => crate::codec::PT_G729,
            Codec::Opus(_) => 114,
        };

        let packet = RtpPacket::new(payload_type, first_packet, sequence_number, timestamp, ssrc, payload);
        if let Err(e) = socket.send_to(&packet.to_bytes(), remote_addr) {
            tracing::warn!("rtp tx: send failed: {e}");
        }

        first_packet = false;
        sequence_number = sequence_number.wrapping_add(1);
        timestamp = timestamp.wrapping_add(frame_samples as u32);
    }
}

fn rx_loop(
    socket: UdpSocket,
    device_rate: u32,
    locked_payload_type: Arc<AtomicU32>,
    sink: Box<dyn AudioSink>,
    stop: Arc<AtomicBool>,
) {
    let mut buf = [0u8; RECV_BUF + 1];
    let mut decoder: Option<(u8, Codec, Resampler)> = None;
    let sink = Mutex::new(sink);

    while !stop.load(Ordering::Relaxed) {
        let (len, _addr) = match socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                tracing::warn!("rtp rx: recv failed: {e}");
                break;
            }
        };

        if len < 12 || len == 20 || len > RECV_BUF {
            // Too short to be RTP, a STUN probe from the peer, or absurdly
            // oversized -- all silently dropped per the wire contract.
            continue;
        }

        let packet = match RtpPacket::from_bytes(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("rtp rx: malformed packet: {e}");
                continue;
            }
        };

        if decoder.is_none() {
            let codec = match Codec::for_payload_type(packet.payload_type, None) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("rtp rx: cannot decode payload type {}: {e}", packet.payload_type);
                    continue;
                }
            };
            let codec_rate = codec.clock_rate();
            locked_payload_type.store(packet.payload_type as u32, Ordering::Relaxed);
            decoder = Some((packet.payload_type, codec, Resampler::new(codec_rate, device_rate)));
        }

        let (_, codec, resampler) = decoder.as_mut().unwrap();
        let pcm = match codec.decode(&packet.payload) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("rtp rx: decode error: {e}");
                continue;
            }
        };
        let resampled = resampler.process(&pcm);
        if let Ok(mut guard) = sink.lock() {
            if let Err(e) = guard.write(&resampled) {
                tracing::warn!("rtp rx: audio sink error: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stun_keepalive_is_twenty_bytes() {
        assert_eq!(STUN_KEEPALIVE.len(), 20);
        assert_eq!(&STUN_KEEPALIVE[0..8], &[0x00, 0x11, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42]);
    }

    #[test]
    fn bind_finds_adjacent_port_pair() {
        let sockets = RtpSockets::bind().unwrap();
        assert_eq!(sockets.rtp.local_addr().unwrap().port(), sockets.local_rtp_port);
        assert_eq!(sockets.rtcp.local_addr().unwrap().port(), sockets.local_rtp_port + 1);
    }
}
