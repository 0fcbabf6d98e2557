//! Softphone engine for Cisco CUCM: SIP registration and call control,
//! SDP negotiation, bidirectional RTP audio and CAPF certificate
//! enrollment, wired together behind a single [`Phone`] handle.

pub mod audio;
pub mod capf;
pub mod codec;
pub mod error;
pub mod events;
pub mod profile;
pub mod resample;
pub mod rtp;
pub mod sdp;
pub mod sip;

use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use audio::{AudioSink, AudioSource};
use error::PhoneError;
use events::{EventReceiver, EventSender};
use profile::PhoneConfig;
use sip::SipEngine;

/// Install a daily-rolling file log plus an `EnvFilter`-driven stderr
/// layer. The returned guard must be held by the caller for the lifetime
/// of the process -- dropping it stops the non-blocking writer thread.
pub fn init_logging(log_dir: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(log_dir, "softphone.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(EnvFilter::from_default_env())
        .init();

    guard
}

/// A single registered device/line. Owns the SIP dialog engine and
/// forwards call control to it; the host drives audio capture/playback
/// through [`AudioSource`]/[`AudioSink`] implementations it supplies.
pub struct Phone {
    engine: Arc<SipEngine>,
    device_rate: u32,
}

impl Phone {
    /// Connect to CUCM and spin up the SIP reader thread. Does not
    /// register; call [`Phone::register`] next.
    pub fn new(config: &PhoneConfig, local_ip: Ipv4Addr, device_rate: u32, events: EventSender) -> Result<Self, PhoneError> {
        let engine = SipEngine::connect(config, local_ip, events)?;
        Ok(Self { engine, device_rate })
    }

    /// `force` takes over a registration CUCM reports as already active on
    /// another client instead of failing with [`PhoneError`]'s
    /// already-active variant.
    pub fn register(&self, force: bool) -> Result<(), PhoneError> {
        self.engine.register(force)
    }

    pub fn registration_status(&self) -> events::RegistrationStatus {
        self.engine.registration_status()
    }

    pub fn call(&self, number: &str, source: Box<dyn AudioSource>, sink: Box<dyn AudioSink>) -> Result<(), PhoneError> {
        self.engine.call(number, self.device_rate, source, sink)
    }

    pub fn cancel_call(&self) -> Result<(), PhoneError> {
        self.engine.cancel()
    }

    pub fn answer_call(&self, source: Box<dyn AudioSource>, sink: Box<dyn AudioSink>) -> Result<(), PhoneError> {
        self.engine.accept(self.device_rate, source, sink)
    }

    pub fn reject_call(&self) -> Result<(), PhoneError> {
        self.engine.reject()
    }

    pub fn hangup_call(&self) -> Result<(), PhoneError> {
        self.engine.hangup()
    }

    /// Enroll this device for CAPF certificate issuance against the first
    /// configured CAPF server, persisting the result to
    /// [`profile::CertStore::client_cert_dir`].
    pub fn bootstrap_capf(&self, config: &PhoneConfig, events: &EventSender) -> Result<(), PhoneError> {
        let Some(server) = config.profile.capf_servers.first() else {
            return Ok(());
        };
        let mut client = capf::CapfClient::connect(&server.host, server.port)?;
        match client.request_certificate(&config.profile.device_name) {
            Ok(issued) => {
                std::fs::create_dir_all(&config.certs.client_cert_dir).map_err(error::CapfError::from)?;
                std::fs::write(config.certs.client_cert_dir.join("key.pem"), &issued.private_key_pem)
                    .map_err(error::CapfError::from)?;
                std::fs::write(config.certs.client_cert_dir.join("cert.pem"), &issued.certificate_pem)
                    .map_err(error::CapfError::from)?;
                let _ = events.send(events::Event::CapfCertificateIssued);
                Ok(())
            }
            Err(e) => {
                let _ = events.send(events::Event::CapfFailed { reason: e.to_string() });
                Err(e.into())
            }
        }
    }

    pub fn shutdown(&self) {
        self.engine.shutdown();
    }
}

/// Convenience pairing used by hosts that just want a channel to read
/// events from alongside the `Phone` handle.
pub fn event_channel() -> (EventSender, EventReceiver) {
    events::channel()
}
