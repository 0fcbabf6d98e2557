use thiserror::Error;

/// Top-level error returned by the public [`crate::Phone`] API.
#[derive(Debug, Error)]
pub enum PhoneError {
    #[error(transparent)]
    Sip(#[from] SipError),
    #[error(transparent)]
    Rtp(#[from] RtpError),
    #[error(transparent)]
    Sdp(#[from] SdpError),
    #[error(transparent)]
    Capf(#[from] CapfError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("no active call")]
    NoActiveCall,
    #[error("a call is already active")]
    CallAlreadyActive,
    #[error("not registered")]
    NotRegistered,
}

#[derive(Debug, Error)]
pub enum SipError {
    #[error("transport connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("transport read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("transport write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("tls handshake failed: {0}")]
    Tls(String),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
    #[error("registration already active for another client")]
    RegistrationAlreadyActive,
    #[error("connection reset during registration")]
    ConnectionReset,
    #[error("server rejected registration: {status} {warning}")]
    ServerRejected { status: String, warning: String },
    #[error("call was busy")]
    Busy,
    #[error("call was rejected: {0}")]
    Rejected(String),
    #[error("call was cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum RtpError {
    #[error("failed to bind rtp socket: {0}")]
    Bind(#[source] std::io::Error),
    #[error("failed to send rtp packet: {0}")]
    Send(#[source] std::io::Error),
    #[error("failed to receive rtp packet: {0}")]
    Receive(#[source] std::io::Error),
    #[error("rtp packet too short ({0} bytes)")]
    TooShort(usize),
    #[error("audio device error: {0}")]
    Device(String),
}

#[derive(Debug, Error)]
pub enum SdpError {
    #[error("no connection address in sdp")]
    MissingConnection,
    #[error("no media description in sdp")]
    MissingMedia,
    #[error("no common codec in offer/answer")]
    NoCommonCodec,
    #[error("malformed sdp line: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum CapfError {
    #[error("tls connect failed: {0}")]
    Connect(String),
    #[error("unexpected magic byte: {0:#x}")]
    BadMagic(u8),
    #[error("unexpected opcode from server: {0:#x}")]
    UnexpectedOpcode(u8),
    #[error("server declined: certificate already issued")]
    AlreadyIssued,
    #[error("server declined: phone not found")]
    PhoneNotFound,
    #[error("server declined with unknown error code: {0:#x}")]
    UnknownDecline(u8),
    #[error("timed out waiting for server response")]
    Timeout,
    #[error("key/certificate generation failed: {0}")]
    Crypto(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported payload type {0}")]
    UnsupportedPayloadType(u8),
    #[error("opus codec error: {0}")]
    Opus(String),
    #[error("g.729 codec error: {0}")]
    G729(String),
    #[error("codec feature not enabled: {0}")]
    FeatureDisabled(&'static str),
}
