//! chorus-sfu
//!
//! Room-scoped media plane of a multi-party conferencing SFU. One instance
//! hosts many rooms; each room tracks its local participants, shadow
//! entries for participants hosted on peer instances, the pushers they
//! publish and the pullers that subscribe to them. A central pilot service
//! keeps the instances' views in sync; media between instances travels as
//! plain RTP/RTCP over UDP relays.
//!
//! ## Architecture
//!
//! - [`Room`](room::Room): per-conference state machine; all operations run
//!   serialized under the room lock
//! - [`MediaPusher`](pusher::MediaPusher) / [`MediaPuller`](puller::MediaPuller):
//!   receive and send side of a single stream
//! - [`RtcRecvRelay`](relay::RtcRecvRelay) / [`RtcSendRelay`](relay::RtcSendRelay):
//!   UDP bridges toward peer instances
//! - [`RoomManager`](manager::RoomManager): room lifecycle and sweeping
//!
//! Transport internals (ICE, DTLS-SRTP, websocket framing) and the pilot
//! channel are consumed through the capability traits in [`transport`],
//! [`signal`] and [`pilot`].

pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod param;
pub mod pilot;
pub mod puller;
pub mod pusher;
pub mod relay;
pub mod room;
pub mod rtp;
pub mod sdp;
pub mod signal;
pub mod transport;
pub mod types;
pub mod user;

pub use config::{IceCandidateConfig, RelayConfig, SfuConfig};
pub use error::{Error, Result};
pub use events::{EventSink, NoopEventSink};
pub use manager::RoomManager;
pub use param::{AvType, PullRequestInfo, PushInfo, RtpSessionParam};
pub use pilot::PilotClient;
pub use room::{Room, SharedRoom};
pub use signal::{SignalResponse, SignalSender};
pub use transport::{MediaTransport, TransportFactory, TransportRole};
pub use types::{PullerId, PusherId, RoomId, SessionId, UserId};

/// Wall-clock milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}
