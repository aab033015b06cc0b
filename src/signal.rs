//! Signaling surface toward local participants
//!
//! The websocket front-end hands every local user a `SignalSender`; the room
//! answers requests through `respond` and pushes `newUser` / `newPusher` /
//! `userLeave` / `userDisconnect` / `userReConnect` / `textMessage`
//! notifications through `notify`. Remote users never carry a sender.

use crate::param::PushInfo;
use crate::types::{RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Per-user signaling channel capability
pub trait SignalSender: Send + Sync {
    /// Deliver the response for request `req_id`.
    fn respond(&self, req_id: u64, response: SignalResponse);
    /// Push a server-initiated notification.
    fn notify(&self, method: &str, data: Value);
}

/// Shared handle to one user's signaling channel
pub type SharedSignal = Arc<dyn SignalSender>;

/// Response envelope: `{code, message, ...payload}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalResponse {
    pub code: i32,
    pub message: String,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl SignalResponse {
    #[must_use]
    pub fn ok(message: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            code: 0,
            message: message.into(),
            data,
        }
    }

    #[must_use]
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: Map::new(),
        }
    }
}

/// One user entry in a join snapshot or a `newUser` notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSnapshot {
    pub user_id: UserId,
    pub user_name: String,
    pub pushers: Vec<PushInfo>,
}

/// `newPusher` notification payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPusherNotification {
    pub user_id: UserId,
    pub user_name: String,
    pub room_id: RoomId,
    pub pushers: Vec<PushInfo>,
}

/// `userLeave` / `userDisconnect` notification payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGoneNotification {
    pub user_id: UserId,
    pub room_id: RoomId,
}

/// `userReConnect` notification payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserReconnectNotification {
    pub user_id: UserId,
    pub user_name: String,
    pub room_id: RoomId,
}

/// `textMessage` notification payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextMessageNotification {
    pub user_id: UserId,
    pub user_name: String,
    pub room_id: RoomId,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_envelope_flattens_payload() {
        let mut data = Map::new();
        data.insert("sdp".to_string(), json!("v=0..."));
        let resp = SignalResponse::ok("push success", data);
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["code"], 0);
        assert_eq!(v["message"], "push success");
        assert_eq!(v["sdp"], "v=0...");
    }

    #[test]
    fn user_snapshot_uses_camel_case() {
        let snap = UserSnapshot {
            user_id: UserId::new("u1"),
            user_name: "alice".to_string(),
            pushers: vec![],
        };
        let v = serde_json::to_value(&snap).unwrap();
        assert_eq!(v["userId"], "u1");
        assert_eq!(v["userName"], "alice");
        assert!(v["pushers"].as_array().unwrap().is_empty());
    }
}
