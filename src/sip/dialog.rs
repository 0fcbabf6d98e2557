//! The dialog engine: owns the SIP transport's reader thread and drives
//! the registration, outgoing-call, incoming-call and KPML state machines
//! described for this device. Only one call dialog is tracked at a time; a
//! second incoming `INVITE` while any call is active is rejected with `486
//! Busy Here` rather than queued or forked.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::audio::{AudioSink, AudioSource};
use crate::codec::Codec;
use crate::error::{PhoneError, SipError};
use crate::events::{EventSender, RegistrationStatus};
use crate::profile::PhoneConfig;
use crate::rtp::{RtpSession, RtpSockets};
use crate::{events::Event, sdp};

use super::headers::Headers;
use super::messages::{self, DialogContext};
use super::transport::SipTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Idle,
    Invited,
    Ringing,
    Offered,
    Alerting,
    Established,
}

/// Everything about the call currently in progress, if any.
struct ActiveCall {
    direction: CallDirection,
    state: CallState,
    call_id: String,
    peer_number: String,
    local_tag: String,
    peer_tag: Option<String>,
    from_header: String,
    to_header: String,
    remote_session_id: Option<String>,
    local_session_id: String,
}

enum PendingOutcome {
    RegisterOk { expires: u64 },
    RegisterFailed(SipError),
    InviteAccepted { to_tag: String, sdp_body: String },
    InviteFailed(SipError),
}

struct PendingWait {
    kind: &'static str,
    tx: mpsc::Sender<PendingOutcome>,
}

/// Owns the TCP/TLS connection to CUCM and coordinates every dialog on it.
pub struct SipEngine {
    transport: Arc<Mutex<SipTransport>>,
    ctx: Mutex<DialogContext>,
    reg_status: Mutex<RegistrationStatus>,
    /// Persistent `+sip.instance` urn used only while forcing a takeover
    /// registration; generated once per process.
    instance_id: String,
    /// Half the most recently granted `Expires`, read by the renewal thread
    /// at the top of every cycle so it tracks whatever CUCM last granted.
    renewal_interval: Mutex<Duration>,
    call: Mutex<Option<ActiveCall>>,
    pending: Mutex<Option<PendingWait>>,
    events: EventSender,
    stop: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    renewal: Mutex<Option<JoinHandle<()>>>,
    rtp_session: Mutex<Option<RtpSession>>,
    /// Retained so a security-mode upgrade (§4.3 failure semantics) can
    /// rebuild the transport without the host re-supplying configuration.
    config: Mutex<PhoneConfig>,
    /// SDP body of the incoming `INVITE` currently being alerted, consumed
    /// by `accept()` once the callee answers.
    pending_invite_body: Mutex<Option<String>>,
    /// Addressing for the most recent KPML `SUBSCRIBE` dialog, needed to
    /// send the follow-up `NOTIFY` once the first one is acknowledged.
    kpml: Mutex<Option<KpmlDialog>>,
    local_ip: Ipv4Addr,
}

#[derive(Clone)]
struct KpmlDialog {
    peer_uri: String,
    local_tag: String,
    peer_tag: String,
    call_id: String,
}

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

impl SipEngine {
    pub fn connect(config: &PhoneConfig, local_ip: Ipv4Addr, events: EventSender) -> Result<Arc<Self>, PhoneError> {
        let profile = &config.profile;
        let transport = if matches!(profile.security_mode, crate::profile::SecurityMode::None) {
            SipTransport::connect_tcp(&profile.cucm_host, profile.sip_port)?
        } else {
            let trusted = std::fs::read(config.certs.server_cert_dir.join("cucm.pem")).unwrap_or_default();
            SipTransport::connect_tls(&profile.cucm_host, profile.sips_port, &trusted, config.verify_hostname)?
        };
        let local_port = transport.local_addr.port();

        let ctx = DialogContext::new(profile.clone(), local_ip, local_port);

        let engine = Arc::new(Self {
            transport: Arc::new(Mutex::new(transport)),
            ctx: Mutex::new(ctx),
            reg_status: Mutex::new(RegistrationStatus::Inactive),
            instance_id: uuid::Uuid::new_v4().to_string(),
            renewal_interval: Mutex::new(Duration::from_secs(1800)),
            call: Mutex::new(None),
            pending: Mutex::new(None),
            events,
            stop: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
            renewal: Mutex::new(None),
            rtp_session: Mutex::new(None),
            config: Mutex::new(config.clone()),
            pending_invite_body: Mutex::new(None),
            kpml: Mutex::new(None),
            local_ip,
        });

        let reader_engine = engine.clone();
        let handle = std::thread::Builder::new()
            .name("sip-reader".into())
            .spawn(move || reader_engine.reader_loop())
            .expect("spawn sip-reader thread");
        *engine.reader.lock().unwrap() = Some(handle);

        let _ = engine.events.send(Event::Initialized);
        Ok(engine)
    }

    fn set_reg_status(&self, status: RegistrationStatus) {
        *self.reg_status.lock().unwrap() = status;
        let _ = self.events.send(Event::RegistrationState(status));
    }

    /// Send `REGISTER`, block for the terminal response, and on first
    /// success spawn a background thread that renews at half the granted
    /// expiry. Safe to call again later (e.g. a forced re-registration);
    /// only the first successful call spawns the renewal thread, since the
    /// renewal thread itself calls back into [`Self::do_register`] rather
    /// than this method.
    ///
    /// `force` takes over a registration CUCM reports as already active
    /// elsewhere (`already_active` failure semantics): it sends `CSeq 102`
    /// instead of `101`, carries this engine's persistent `+sip.instance`
    /// urn instead of the zero UUID, and the `Reason:` alarm cause becomes
    /// `Application-Requested-Destroy`.
    pub fn register(self: &Arc<Self>, force: bool) -> Result<(), PhoneError> {
        let had_renewal = self.renewal.lock().unwrap().is_some();
        self.do_register(force)?;
        if !had_renewal {
            self.spawn_renewal();
        }
        Ok(())
    }

    /// The actual REGISTER request/response cycle, including the silent
    /// TLS-upgrade retry. Never spawns the renewal thread itself, so the
    /// renewal thread can call this directly without spawning a nested copy
    /// of itself on every successful renewal.
    fn do_register(self: &Arc<Self>, force: bool) -> Result<(), PhoneError> {
        self.set_reg_status(RegistrationStatus::Registering);
        let cseq = if force { 102 } else { 101 };

        let rx = self.arm_pending("register");
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let date = messages::rfc1123_date(now);
        let (head, body) = {
            let ctx = self.ctx.lock().unwrap();
            messages::compile_register(&ctx, cseq, &date, force, &self.instance_id)
        };
        self.send_raw(&head, &body)?;

        match rx.recv_timeout(WAIT_TIMEOUT) {
            Ok(PendingOutcome::RegisterOk { expires }) => {
                self.set_reg_status(RegistrationStatus::Registered);
                self.apply_expires(expires);
                Ok(())
            }
            Ok(PendingOutcome::RegisterFailed(e)) => {
                if let SipError::ServerRejected { ref warning, .. } = e {
                    if warning.contains("Device security mismatch: expected TLS") {
                        tracing::info!("cucm demands tls for this device, upgrading security mode and retrying");
                        if self.reconnect_secure().is_ok() {
                            return self.do_register(force);
                        }
                    }
                }
                self.set_reg_status(RegistrationStatus::Failed);
                Err(e.into())
            }
            _ => {
                self.set_reg_status(RegistrationStatus::Failed);
                Err(SipError::ConnectionReset.into())
            }
        }
    }

    /// Apply a freshly granted `Expires`: the transport read deadline
    /// becomes `Expires + 5s` and the renewal thread's next sleep becomes
    /// `Expires/2`.
    fn apply_expires(&self, expires: u64) {
        *self.renewal_interval.lock().unwrap() = Duration::from_secs(expires / 2);
        if let Ok(mut t) = self.transport.lock() {
            let _ = t.set_read_timeout(Some(Duration::from_secs(expires + 5)));
        }
    }

    /// Silently rebuild the transport under TLS after CUCM rejects a
    /// REGISTER with "Device security mismatch: expected TLS".
    fn reconnect_secure(&self) -> Result<(), PhoneError> {
        let mut config = self.config.lock().unwrap().clone();
        config.profile.security_mode = crate::profile::SecurityMode::Encrypted;
        let trusted = std::fs::read(config.certs.server_cert_dir.join("cucm.pem")).unwrap_or_default();
        let transport =
            SipTransport::connect_tls(&config.profile.cucm_host, config.profile.sips_port, &trusted, config.verify_hostname)?;
        let local_port = transport.local_addr.port();
        *self.transport.lock().unwrap() = transport;
        {
            let mut ctx = self.ctx.lock().unwrap();
            *ctx = DialogContext::new(config.profile.clone(), ctx.local_ip, local_port);
        }
        *self.config.lock().unwrap() = config;
        Ok(())
    }

    fn spawn_renewal(self: &Arc<Self>) {
        let engine = self.clone();
        let handle = std::thread::Builder::new()
            .name("sip-register-renew".into())
            .spawn(move || {
                // Renew at Expires/2, read fresh each cycle since a prior
                // do_register() call may have updated it. A renewal that
                // fails with a connection reset gets exactly one immediate
                // retry; a second consecutive reset is left to surface
                // through the RegistrationState(Failed) event do_register()
                // already sent. The wait is polled in small slices so
                // `shutdown()` doesn't block for a full interval joining
                // this thread.
                let mut consecutive_resets = 0u32;
                while !engine.stop.load(Ordering::Relaxed) {
                    let interval = *engine.renewal_interval.lock().unwrap();
                    let mut waited = Duration::ZERO;
                    while waited < interval && !engine.stop.load(Ordering::Relaxed) {
                        let slice = Duration::from_millis(200).min(interval - waited);
                        std::thread::sleep(slice);
                        waited += slice;
                    }
                    if engine.stop.load(Ordering::Relaxed) {
                        break;
                    }
                    match engine.do_register(false) {
                        Ok(()) => consecutive_resets = 0,
                        Err(PhoneError::Sip(SipError::ConnectionReset)) => {
                            consecutive_resets += 1;
                            if consecutive_resets == 1 {
                                tracing::warn!("registration renewal lost the connection, retrying once");
                                if engine.do_register(false).is_ok() {
                                    consecutive_resets = 0;
                                }
                            } else {
                                tracing::error!("registration renewal failed twice in a row");
                                consecutive_resets = 0;
                            }
                        }
                        Err(e) => {
                            consecutive_resets = 0;
                            tracing::warn!("registration renewal failed: {e}");
                        }
                    }
                }
            })
            .expect("spawn sip-register-renew thread");
        *self.renewal.lock().unwrap() = Some(handle);
    }

    /// Place an outgoing call. Blocks until the far end answers, is busy,
    /// rejects, or the dialog is cancelled/times out.
    pub fn call(self: &Arc<Self>, number: &str, device_rate: u32, source: Box<dyn AudioSource>, sink: Box<dyn AudioSink>) -> Result<(), PhoneError> {
        {
            let call = self.call.lock().unwrap();
            if call.is_some() {
                return Err(PhoneError::CallAlreadyActive);
            }
        }

        let sockets = RtpSockets::bind()?;
        let offer = sdp::build_offer(self.local_ip, sockets.local_rtp_port);

        let cseq = 101;
        let local_session_id = super::headers::generate_session_id();
        let rx = self.arm_pending("invite");
        let (call_id, from_header, local_tag) = {
            let mut ctx = self.ctx.lock().unwrap();
            *ctx = DialogContext::new(ctx.profile.clone(), ctx.local_ip, ctx.local_port);
            let (head, body) = messages::compile_invite(&ctx, cseq, number, &offer, &local_session_id);
            self.send_raw(&head, &body)?;
            (ctx.call_id.clone(), format!("<sip:{}@{}>;tag={}", ctx.profile.line_number, ctx.profile.cucm_host, ctx.from_tag), ctx.from_tag.clone())
        };

        *self.call.lock().unwrap() = Some(ActiveCall {
            direction: CallDirection::Outgoing,
            state: CallState::Invited,
            call_id: call_id.clone(),
            peer_number: number.to_string(),
            local_tag: local_tag.clone(),
            peer_tag: None,
            from_header,
            to_header: String::new(),
            remote_session_id: None,
            local_session_id,
        });
        let _ = self.events.send(Event::OutgoingCallTrying);

        let outcome = rx.recv_timeout(Duration::from_secs(60));
        match outcome {
            Ok(PendingOutcome::InviteAccepted { to_tag, sdp_body }) => {
                if let Some(call) = self.call.lock().unwrap().as_mut() {
                    call.peer_tag = Some(to_tag.clone());
                    call.state = CallState::Established;
                }
                let ack = {
                    let ctx = self.ctx.lock().unwrap();
                    messages::compile_invite_ok_ack(&ctx, number, &to_tag)
                };
                self.send_raw(&ack, "")?;

                let answer = sdp::parse(&sdp_body)?;
                let (payload_type, rate_hint) = sdp::select_codec(&answer)?;
                let codec = Codec::for_payload_type(payload_type, Some(rate_hint))?;
                let remote_addr = std::net::SocketAddr::new(answer.connection_ip.into(), answer.media_port);
                let rtp = RtpSession::start(sockets, remote_addr, device_rate, codec, source, sink)?;
                *self.rtp_session.lock().unwrap() = Some(rtp);

                let _ = self.events.send(Event::OutgoingCallAccepted);
                Ok(())
            }
            Ok(PendingOutcome::InviteFailed(e)) => {
                *self.call.lock().unwrap() = None;
                let _ = self.events.send(Event::OutgoingCallFailed { reason: e.to_string() });
                Err(e.into())
            }
            _ => {
                *self.call.lock().unwrap() = None;
                Err(SipError::ConnectionReset.into())
            }
        }
    }

    /// Cancel an outgoing call that has not yet been answered.
    pub fn cancel(&self) -> Result<(), PhoneError> {
        let number = {
            let call = self.call.lock().unwrap();
            match call.as_ref() {
                Some(c) if c.direction == CallDirection::Outgoing && c.state != CallState::Established => {
                    c.peer_number.clone()
                }
                _ => return Err(PhoneError::NoActiveCall),
            }
        };
        let cancel = {
            let ctx = self.ctx.lock().unwrap();
            messages::compile_cancel(&ctx, &number)
        };
        self.send_raw(&cancel, "")
    }

    /// Accept a ringing incoming call.
    pub fn accept(self: &Arc<Self>, device_rate: u32, source: Box<dyn AudioSource>, sink: Box<dyn AudioSink>) -> Result<(), PhoneError> {
        let (from_header, to_header, call_id, remote_body) = {
            let call = self.call.lock().unwrap();
            let call = call.as_ref().filter(|c| c.direction == CallDirection::Incoming).ok_or(PhoneError::NoActiveCall)?;
            (call.from_header.clone(), call.to_header.clone(), call.call_id.clone(), self.pending_invite_body.lock().unwrap().clone())
        };

        let sockets = RtpSockets::bind()?;
        let answer_sdp = sdp::build_offer(self.local_ip, sockets.local_rtp_port);

        let (head, body) = {
            let ctx = self.ctx.lock().unwrap();
            messages::compile_invite_ok(&ctx, &from_header, &to_header, &call_id, &answer_sdp)
        };
        self.send_raw(&head, &body)?;

        if let Some(offer_body) = remote_body {
            let offer = sdp::parse(&offer_body)?;
            let (payload_type, rate_hint) = sdp::select_codec(&offer)?;
            let codec = Codec::for_payload_type(payload_type, Some(rate_hint))?;
            let remote_addr = std::net::SocketAddr::new(offer.connection_ip.into(), offer.media_port);
            let rtp = RtpSession::start(sockets, remote_addr, device_rate, codec, source, sink)?;
            *self.rtp_session.lock().unwrap() = Some(rtp);
        }

        if let Some(call) = self.call.lock().unwrap().as_mut() {
            call.state = CallState::Established;
        }
        let _ = self.events.send(Event::IncomingCallAccepted);
        Ok(())
    }

    /// Reject a ringing incoming call with `486 Busy Here`.
    pub fn reject(&self) -> Result<(), PhoneError> {
        let (from_header, to_header, call_id) = {
            let call = self.call.lock().unwrap();
            let call = call.as_ref().filter(|c| c.direction == CallDirection::Incoming).ok_or(PhoneError::NoActiveCall)?;
            (call.from_header.clone(), call.to_header.clone(), call.call_id.clone())
        };
        let busy = {
            let ctx = self.ctx.lock().unwrap();
            messages::compile_busy_here(&ctx, &from_header, &to_header, &call_id)
        };
        self.send_raw(&busy, "")?;
        *self.call.lock().unwrap() = None;
        Ok(())
    }

    /// Tear down whichever call is currently established.
    pub fn hangup(&self) -> Result<(), PhoneError> {
        let call = self.call.lock().unwrap().take().ok_or(PhoneError::NoActiveCall)?;
        self.rtp_session.lock().unwrap().take();

        let bye = {
            let ctx = self.ctx.lock().unwrap();
            match call.direction {
                CallDirection::Outgoing => {
                    messages::compile_bye_outgoing(&ctx, &call.peer_number, call.peer_tag.as_deref().unwrap_or(""))
                }
                CallDirection::Incoming => messages::compile_bye_incoming(
                    &ctx,
                    &call.local_tag,
                    &call.from_header,
                    call.peer_tag.as_deref().unwrap_or(""),
                    &call.call_id,
                ),
            }
        };
        self.send_raw(&bye, "")?;
        let _ = self.events.send(Event::CallClosed);
        Ok(())
    }

    pub fn registration_status(&self) -> RegistrationStatus {
        *self.reg_status.lock().unwrap()
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Ok(mut t) = self.transport.lock() {
            let _ = t.set_read_timeout(Some(Duration::from_millis(10)));
        }
        if let Some(h) = self.renewal.lock().unwrap().take() {
            let _ = h.join();
        }
        if let Some(h) = self.reader.lock().unwrap().take() {
            let _ = h.join();
        }
    }

    fn send_raw(&self, head: &str, body: &str) -> Result<(), PhoneError> {
        let mut t = self.transport.lock().unwrap();
        t.send_raw(head.as_bytes())?;
        if !body.is_empty() {
            t.send_raw(body.as_bytes())?;
        }
        Ok(())
    }

    fn arm_pending(&self, kind: &'static str) -> mpsc::Receiver<PendingOutcome> {
        let (tx, rx) = mpsc::channel();
        *self.pending.lock().unwrap() = Some(PendingWait { kind, tx });
        rx
    }

    fn resolve_pending(&self, kind: &str, outcome: PendingOutcome) {
        let mut guard = self.pending.lock().unwrap();
        if guard.as_ref().map(|p| p.kind) == Some(kind) {
            if let Some(pending) = guard.take() {
                let _ = pending.tx.send(outcome);
            }
        }
    }

    fn reader_loop(self: Arc<Self>) {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return;
            }
            let message = {
                let mut t = self.transport.lock().unwrap();
                t.read_message()
            };
            match message {
                Ok(Some(msg)) => self.dispatch(msg),
                Ok(None) => {
                    tracing::warn!("sip transport closed by peer");
                    self.set_reg_status(RegistrationStatus::Failed);
                    return;
                }
                Err(e) => {
                    if self.stop.load(Ordering::Relaxed) {
                        return;
                    }
                    tracing::warn!("sip transport read error: {e}");
                    return;
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, msg: super::transport::RawMessage) {
        let headers = Headers::parse(&msg.head);
        let body = String::from_utf8_lossy(&msg.body).into_owned();

        if headers.is_response() {
            self.dispatch_response(&headers, &body);
        } else if let Some(method) = headers.request_method() {
            self.dispatch_request(method, &headers, &body);
        }
    }

    fn dispatch_response(&self, headers: &Headers, body: &str) {
        let status = headers.status_code().unwrap_or(0);
        let (cseq_num, cseq_method) = headers.cseq().unwrap_or((0, ""));

        match cseq_method {
            "REGISTER" => {
                if status == 100 {
                    return;
                }
                if status == 200 {
                    let expires = headers.get("Expires").and_then(|v| v.trim().parse().ok()).unwrap_or(3600);
                    self.resolve_pending("register", PendingOutcome::RegisterOk { expires });
                } else {
                    let mut warning = headers.get("Warning").unwrap_or("").to_string();
                    if warning.is_empty() && body.contains("Device security mismatch") {
                        warning = body.to_string();
                    }
                    if status == 403 && warning.contains("Registration is active for another client") {
                        self.resolve_pending("register", PendingOutcome::RegisterFailed(SipError::RegistrationAlreadyActive));
                    } else {
                        self.resolve_pending(
                            "register",
                            PendingOutcome::RegisterFailed(SipError::ServerRejected { status: status.to_string(), warning }),
                        );
                    }
                }
            }
            "INVITE" => match status {
                100 => {}
                180 | 183 => {
                    if let Some((remote_id, _)) = headers.session_id() {
                        if let Some(call) = self.call.lock().unwrap().as_mut() {
                            call.remote_session_id = Some(remote_id);
                        }
                    }
                    let (display_name, number) = headers.remote_party();
                    let _ = self.events.send(Event::OutgoingCallRinging { display_name, number });
                }
                200 => {
                    let to_tag = headers
                        .get("To")
                        .and_then(|to| to.split("tag=").nth(1))
                        .unwrap_or("")
                        .to_string();
                    self.resolve_pending(
                        "invite",
                        PendingOutcome::InviteAccepted { to_tag, sdp_body: body.to_string() },
                    );
                }
                486 => self.resolve_pending("invite", PendingOutcome::InviteFailed(SipError::Busy)),
                _ => {
                    let warning = headers.get("Warning").unwrap_or(headers.start_line().unwrap_or("")).to_string();
                    self.resolve_pending("invite", PendingOutcome::InviteFailed(SipError::Rejected(warning)));
                }
            },
            "SUBSCRIBE" => {
                // 200 OK for our own NOTIFY CSeq 1000 triggers the second,
                // terminating NOTIFY with the KPML timer-expired body.
                if status == 200 && cseq_num == 1000 {
                    self.send_kpml_followup();
                }
            }
            _ => {}
        }
    }

    fn dispatch_request(self: &Arc<Self>, method: &str, headers: &Headers, body: &str) {
        let call_id = headers.get("Call-ID").unwrap_or_default().to_string();
        let from_header = headers.get("From").unwrap_or_default().to_string();
        let to_header = headers.get("To").unwrap_or_default().to_string();

        match method {
            "INVITE" => self.handle_incoming_invite(headers, body, call_id, from_header, to_header),
            "CANCEL" => {
                let mut call = self.call.lock().unwrap();
                if call.as_ref().map(|c| c.call_id.as_str()) == Some(call_id.as_str()) {
                    *call = None;
                    let _ = self.events.send(Event::IncomingCallCanceled);
                }
            }
            "BYE" => {
                *self.call.lock().unwrap() = None;
                self.rtp_session.lock().unwrap().take();
                let ok = {
                    let ctx = self.ctx.lock().unwrap();
                    messages::compile_bye_ok(&ctx, &to_header, &from_header, &call_id)
                };
                let _ = self.send_raw(&ok, "");
                let _ = self.events.send(Event::CallClosed);
            }
            "SUBSCRIBE" => self.handle_kpml_subscribe(headers, &from_header, &to_header, &call_id),
            "OPTIONS" => {
                // No body, minimal 200 OK is enough to keep the dialog healthy.
            }
            _ => {}
        }
    }

    fn handle_incoming_invite(self: &Arc<Self>, headers: &Headers, body: &str, call_id: String, from_header: String, to_header: String) {
        if self.call.lock().unwrap().is_some() {
            let busy = {
                let ctx = self.ctx.lock().unwrap();
                messages::compile_busy_here(&ctx, &from_header, &to_header, &call_id)
            };
            let _ = self.send_raw(&busy, "");
            return;
        }

        let local_session_id = super::headers::generate_session_id();
        let (remote_session_id, _) = headers.session_id().unwrap_or((String::new(), None));
        let local_tag = super::headers::generate_tag();
        let to_with_tag = format!("{to_header};tag={local_tag}");

        // Briefly Offered while the Trying response goes out, then Alerting
        // once Ringing has actually been sent to the caller.
        let trying = {
            let ctx = self.ctx.lock().unwrap();
            messages::compile_trying(&ctx, &from_header, &to_with_tag, &call_id)
        };
        let _ = self.send_raw(&trying, "");

        let ringing = {
            let ctx = self.ctx.lock().unwrap();
            messages::compile_ringing(&ctx, &from_header, &to_with_tag, &call_id, &local_session_id, &remote_session_id)
        };
        let _ = self.send_raw(&ringing, "");

        *self.pending_invite_body.lock().unwrap() = Some(body.to_string());

        let (display_name, number) = headers.remote_party();
        let peer_tag = from_header.split("tag=").nth(1).map(str::to_string);
        *self.call.lock().unwrap() = Some(ActiveCall {
            direction: CallDirection::Incoming,
            state: CallState::Alerting,
            call_id,
            peer_number: number.clone().unwrap_or_default(),
            local_tag,
            peer_tag,
            from_header,
            to_header: to_with_tag,
            remote_session_id: Some(remote_session_id),
            local_session_id,
        });

        let _ = self.events.send(Event::IncomingCallRinging { display_name, number });
    }

    fn handle_kpml_subscribe(&self, headers: &Headers, from_header: &str, to_header: &str, call_id: &str) {
        let (cseq_num, _) = headers.cseq().unwrap_or((0, ""));
        let to_with_tag = if to_header.contains("tag=") {
            to_header.to_string()
        } else {
            format!("{to_header};tag={}", super::headers::generate_tag())
        };

        let ack = {
            let ctx = self.ctx.lock().unwrap();
            messages::compile_subscribe_ack(&ctx, from_header, &to_with_tag, call_id, cseq_num)
        };
        let _ = self.send_raw(&ack, "");

        let peer_uri = from_header.split(';').next().unwrap_or(from_header).to_string();
        let local_tag = to_with_tag.split("tag=").nth(1).unwrap_or("").to_string();
        let peer_tag = from_header.split("tag=").nth(1).unwrap_or("").to_string();

        if cseq_num == 101 {
            *self.kpml.lock().unwrap() = Some(KpmlDialog {
                peer_uri: peer_uri.clone(),
                local_tag: local_tag.clone(),
                peer_tag: peer_tag.clone(),
                call_id: call_id.to_string(),
            });
            let (head, nbody) = {
                let ctx = self.ctx.lock().unwrap();
                messages::compile_subscribe_notify(&ctx, &peer_uri, &local_tag, &peer_tag, call_id, 1000, None)
            };
            let _ = self.send_raw(&head, &nbody);
        } else if cseq_num == 102 {
            let (head, nbody) = {
                let ctx = self.ctx.lock().unwrap();
                messages::compile_subscribe_notify(
                    &ctx,
                    &peer_uri,
                    &local_tag,
                    &peer_tag,
                    call_id,
                    1002,
                    Some(("487", "Subscription Exp")),
                )
            };
            let _ = self.send_raw(&head, &nbody);
        }
    }

    /// The second, terminating `NOTIFY` sent once CUCM acks the first
    /// (CSeq 1000) one: carries the `code="423" text="Timer Expired"` body.
    fn send_kpml_followup(&self) {
        let Some(kpml) = self.kpml.lock().unwrap().clone() else {
            return;
        };
        let (head, body) = {
            let ctx = self.ctx.lock().unwrap();
            messages::compile_subscribe_notify(
                &ctx,
                &kpml.peer_uri,
                &kpml.local_tag,
                &kpml.peer_tag,
                &kpml.call_id,
                1001,
                Some(("423", "Timer Expired")),
            )
        };
        let _ = self.send_raw(&head, &body);
    }
}
