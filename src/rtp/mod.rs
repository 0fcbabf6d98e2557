pub mod packet;
pub mod session;

pub use packet::RtpPacket;
pub use session::{RtpSession, RtpSockets};
