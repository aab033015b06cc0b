//! Error types for the media plane

use crate::types::{PusherId, RoomId, UserId};
use thiserror::Error;

/// Media-plane error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("room {0} is closed")]
    RoomClosed(RoomId),

    #[error("unknown user: {0}")]
    UnknownUser(UserId),

    #[error("unknown pusher: {0}")]
    UnknownPusher(PusherId),

    #[error("unknown ssrc: {0}")]
    UnknownSsrc(u32),

    #[error("ssrc {0} already in use in this room")]
    SsrcInUse(u32),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("RTP error: {0}")]
    Rtp(&'static str),

    #[error("RTCP error: {0}")]
    Rtcp(&'static str),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("relay error: {0}")]
    Relay(String),

    #[error("invalid payload: {0}")]
    Payload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for media-plane operations
pub type Result<T> = std::result::Result<T, Error>;
