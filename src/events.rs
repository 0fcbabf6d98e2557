/// Events surfaced to the host application over a plain channel.
///
/// Replaces the Tauri `app_handle.emit_all("sip-event", ..)` pattern this
/// engine's ancestor used: a host that isn't a GUI app still needs to see
/// these transitions, so they go out as a typed enum instead of a JSON blob
/// tied to a window event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Initialized,
    RegistrationState(RegistrationStatus),
    OutgoingCallTrying,
    OutgoingCallRinging { display_name: Option<String>, number: Option<String> },
    OutgoingCallAccepted,
    OutgoingCallBusy,
    OutgoingCallFailed { reason: String },
    IncomingCallRinging { display_name: Option<String>, number: Option<String> },
    IncomingCallCanceled,
    IncomingCallAccepted,
    CallClosed,
    CapfCertificateIssued,
    CapfFailed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    Inactive,
    Registering,
    Registered,
    Failed,
}

pub type EventSender = std::sync::mpsc::Sender<Event>;
pub type EventReceiver = std::sync::mpsc::Receiver<Event>;

pub fn channel() -> (EventSender, EventReceiver) {
    std::sync::mpsc::channel()
}
