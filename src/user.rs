//! Participant state

use crate::param::PushInfo;
use crate::signal::{SharedSignal, UserSnapshot};
use crate::types::{PusherId, RoomId, UserId};
use std::collections::BTreeMap;
use tracing::info;

const HEARTBEAT_TIMEOUT_MS: i64 = 40_000;

/// One participant of a room: identity, liveness, advertised pushers and —
/// for local users — the signaling channel. Remote users are shadow entries
/// injected by pilot notifications and never carry a signaling channel.
pub struct RtcUser {
    room_id: RoomId,
    user_id: UserId,
    user_name: String,
    remote: bool,
    signal: Option<SharedSignal>,
    last_heartbeat_ms: i64,
    pushers: BTreeMap<PusherId, PushInfo>,
}

impl RtcUser {
    pub fn new(
        room_id: RoomId,
        user_id: UserId,
        user_name: String,
        signal: Option<SharedSignal>,
        now_ms: i64,
    ) -> Self {
        info!(
            room_id = %room_id,
            user_id = %user_id,
            user_name = %user_name,
            "RtcUser created"
        );
        Self {
            room_id,
            user_id,
            user_name,
            remote: false,
            signal,
            last_heartbeat_ms: now_ms,
            pushers: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn update_heartbeat(&mut self, now_ms: i64) {
        self.last_heartbeat_ms = now_ms;
    }

    #[must_use]
    pub fn is_alive(&self, now_ms: i64) -> bool {
        now_ms - self.last_heartbeat_ms < HEARTBEAT_TIMEOUT_MS
    }

    pub fn set_remote(&mut self, remote: bool) {
        self.remote = remote;
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    #[must_use]
    pub fn signal(&self) -> Option<&SharedSignal> {
        self.signal.as_ref()
    }

    /// Rebind (reconnect) or clear (leave/disconnect) the signaling channel.
    pub fn set_signal(&mut self, signal: Option<SharedSignal>) {
        self.signal = signal;
    }

    pub fn add_pusher(&mut self, pusher_id: PusherId, info: PushInfo) {
        self.pushers.insert(pusher_id, info);
    }

    pub fn remove_pusher(&mut self, pusher_id: &PusherId) -> Option<PushInfo> {
        self.pushers.remove(pusher_id)
    }

    #[must_use]
    pub fn get_pusher(&self, pusher_id: &PusherId) -> Option<&PushInfo> {
        self.pushers.get(pusher_id)
    }

    #[must_use]
    pub fn pushers(&self) -> &BTreeMap<PusherId, PushInfo> {
        &self.pushers
    }

    /// Roster entry for join snapshots and `newUser` notifications
    #[must_use]
    pub fn snapshot(&self) -> UserSnapshot {
        UserSnapshot {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            pushers: self.pushers.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_window() {
        let mut user = RtcUser::new(
            RoomId::new("r"),
            UserId::new("u"),
            "alice".to_string(),
            None,
            1_000,
        );
        assert!(user.is_alive(1_000));
        assert!(user.is_alive(40_999));
        assert!(!user.is_alive(41_000));
        user.update_heartbeat(41_000);
        assert!(user.is_alive(80_999));
    }

    #[test]
    fn snapshot_lists_pushers_in_stable_order() {
        let mut user = RtcUser::new(
            RoomId::new("r"),
            UserId::new("u"),
            "alice".to_string(),
            None,
            0,
        );
        for id in ["b", "a", "c"] {
            user.add_pusher(
                PusherId::new(id),
                PushInfo {
                    pusher_id: PusherId::new(id),
                    rtp_param: Default::default(),
                },
            );
        }
        let snap = user.snapshot();
        let ids: Vec<_> = snap.pushers.iter().map(|p| p.pusher_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
