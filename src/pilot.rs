//! Pilot-center protocol
//!
//! Every instance keeps a bidirectional JSON channel to the central pilot
//! service. Rooms send requests (`join`) and notifications (`push`,
//! `userLeave`, `userDisconnect`, `userReConnect`, `pullRemoteStream`,
//! `textMessage`) outward; the pilot pushes roster and pull-demand
//! notifications inward, which the channel owner routes to
//! [`Room`](crate::room::Room) via its `handle_*_notification_from_center`
//! operations.

use crate::param::PushInfo;
use crate::signal::UserSnapshot;
use crate::types::{RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Client capability toward the pilot center
///
/// `request` returns a request id; the eventual response is handed back to
/// the room through `Room::on_pilot_response` by whoever owns the channel.
pub trait PilotClient: Send + Sync {
    fn request(&self, method: &str, data: Value) -> u64;
    fn notify(&self, method: &str, data: Value);
}

/// Shared handle to the pilot channel
pub type SharedPilot = Arc<dyn PilotClient>;

/// Outbound `join` request payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PilotJoinRequest {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub user_name: String,
}

/// `join` response payload: the roster of users already known to the pilot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PilotJoinResponse {
    pub room_id: RoomId,
    pub users: Vec<UserSnapshot>,
}

/// Outbound `push` notification payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PilotPushNotification {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub user_name: String,
    pub publishers: Vec<PushInfo>,
}

/// Outbound `userLeave` / `userDisconnect` notification payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PilotUserGoneNotification {
    pub room_id: RoomId,
    pub user_id: UserId,
}

/// Outbound `userReConnect` notification payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PilotReconnectNotification {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub user_name: String,
}

/// `pullRemoteStream` payload, both directions
///
/// Outbound it advertises the local recv-relay endpoint for a remote pusher;
/// inbound it tells this instance to start relaying a local pusher toward
/// the given endpoint. Key casing is part of the wire schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRemoteStreamNotification {
    #[serde(rename = "roomId")]
    pub room_id: RoomId,
    pub pusher_user_id: UserId,
    pub udp_ip: String,
    pub udp_port: u16,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    #[serde(rename = "pushInfo")]
    pub push_info: PushInfo,
}

/// Outbound `textMessage` notification payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PilotTextMessageNotification {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub user_name: String,
    pub message: String,
}

/// Inbound `newUser` notification payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PilotNewUserNotification {
    #[serde(default)]
    pub room_id: Option<RoomId>,
    pub user_id: UserId,
    pub user_name: String,
}

/// Inbound `newPusher` notification payload; pusher entries are validated
/// one by one so a malformed item never discards the rest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PilotNewPusherNotification {
    pub user_id: UserId,
    pub pushers: Vec<Value>,
}

/// Inbound `userLeave` / `userDisconnect` notification payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PilotUserGoneInbound {
    pub user_id: UserId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{AvType, RtpSessionParam};
    use crate::types::PusherId;

    #[test]
    fn pull_remote_stream_wire_keys() {
        let n = PullRemoteStreamNotification {
            room_id: RoomId::new("r1"),
            pusher_user_id: UserId::new("u1"),
            udp_ip: "10.0.0.1".to_string(),
            udp_port: 40_000,
            media_type: "video".to_string(),
            push_info: PushInfo {
                pusher_id: PusherId::new("p1"),
                rtp_param: RtpSessionParam {
                    av_type: AvType::Video,
                    ssrc: 100,
                    payload_type: 96,
                    clock_rate: 90_000,
                    ..Default::default()
                },
            },
        };
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["roomId"], "r1");
        assert_eq!(v["pusher_user_id"], "u1");
        assert_eq!(v["udp_ip"], "10.0.0.1");
        assert_eq!(v["udp_port"], 40_000);
        assert_eq!(v["mediaType"], "video");
        assert_eq!(v["pushInfo"]["pusherId"], "p1");
    }

    #[test]
    fn join_response_parses_roster() {
        let v = serde_json::json!({
            "roomId": "r1",
            "users": [
                {"userId": "u2", "userName": "bob", "pushers": []}
            ]
        });
        let resp: PilotJoinResponse = serde_json::from_value(v).unwrap();
        assert_eq!(resp.room_id.as_str(), "r1");
        assert_eq!(resp.users.len(), 1);
        assert_eq!(resp.users[0].user_name, "bob");
    }
}
