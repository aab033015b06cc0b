//! RTP/RTCP plumbing: packet model, report codec, per-stream sessions

mod packet;
pub mod rtcp;
mod recv;
mod send;
mod stats;

pub use packet::RtpPacket;
pub use recv::{RtpRecvSession, RtxOutcome};
pub use send::RtpSendSession;
pub use stats::{StreamRate, StreamStats};
