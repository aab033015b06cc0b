//! Transport capability consumed by the media plane
//!
//! ICE, DTLS-SRTP and websocket framing live outside this crate. The media
//! plane only needs three things from a negotiated transport: whether it is
//! ready, and a way to emit RTP and RTCP bytes. Pushers, pullers and both
//! relay kinds all speak to the wire through this trait.

use crate::error::Result;
use crate::types::{RoomId, SessionId, UserId};
use std::sync::Arc;

/// Byte-level media transport
pub trait MediaTransport: Send + Sync {
    /// False until the underlying transport (ICE/DTLS) is ready; packets
    /// submitted before then are silently dropped by the callers.
    fn is_connected(&self) -> bool;
    fn send_rtp(&self, data: &[u8]);
    fn send_rtcp(&self, data: &[u8]);
}

/// Shared handle to a media transport
pub type SharedTransport = Arc<dyn MediaTransport>;

/// Which direction a negotiated session carries media
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    /// Server receives from the participant (push)
    Recv,
    /// Server sends to the participant (pull)
    Send,
}

/// Result of setting up one WebRTC session with a participant
pub struct NegotiatedTransport {
    pub session_id: SessionId,
    /// Local ICE credentials for the answer SDP
    pub ice_ufrag: String,
    pub ice_pwd: String,
    /// Local DTLS fingerprint for the answer SDP ("sha-256 AB:CD:...")
    pub fingerprint: String,
    pub transport: SharedTransport,
}

/// Factory for WebRTC sessions, owned by the signaling front-end
pub trait TransportFactory: Send + Sync {
    /// Allocate a session toward `user_id`. `remote_fingerprint` is the
    /// fingerprint taken from the participant's offer, if present.
    fn create_transport(
        &self,
        role: TransportRole,
        room_id: &RoomId,
        user_id: &UserId,
        remote_fingerprint: Option<&str>,
    ) -> Result<NegotiatedTransport>;
}

/// Shared handle to the transport factory
pub type SharedTransportFactory = Arc<dyn TransportFactory>;
