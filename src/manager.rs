//! Multi-room orchestration
//!
//! Rooms are created on first join and swept once their 90 second
//! liveness window lapses with no local participant activity.

use crate::config::SfuConfig;
use crate::events::EventSink;
use crate::pilot::SharedPilot;
use crate::relay::PortAllocator;
use crate::room::{Room, SharedRoom};
use crate::transport::SharedTransportFactory;
use crate::types::RoomId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

const SWEEP_INTERVAL_SECS: u64 = 10;

pub struct RoomManager {
    config: Arc<SfuConfig>,
    pilot: SharedPilot,
    transports: SharedTransportFactory,
    ports: Arc<PortAllocator>,
    events: Arc<dyn EventSink>,
    rooms: DashMap<RoomId, SharedRoom>,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RoomManager {
    /// Create the manager and start the dead-room sweeper. Must run inside
    /// a Tokio runtime.
    pub fn new(
        config: SfuConfig,
        pilot: SharedPilot,
        transports: SharedTransportFactory,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let ports = Arc::new(PortAllocator::new(
            config.relay.port_min,
            config.relay.port_max,
        ));
        let manager = Arc::new(Self {
            config: Arc::new(config),
            pilot,
            transports,
            ports,
            events,
            rooms: DashMap::new(),
            sweeper: parking_lot::Mutex::new(None),
        });
        info!(
            relay_port_min = manager.config.relay.port_min,
            relay_port_max = manager.config.relay.port_max,
            candidates = manager.config.candidates.len(),
            "room manager initialized"
        );

        let sweeper = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let mut ticker = interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
                loop {
                    ticker.tick().await;
                    manager.sweep_dead_rooms();
                }
            })
        };
        *manager.sweeper.lock() = Some(sweeper);
        manager
    }

    pub fn get_or_create_room(&self, room_id: RoomId) -> SharedRoom {
        if let Some(room) = self.rooms.get(&room_id) {
            return Arc::clone(room.value());
        }
        let room = Room::create(
            room_id.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.pilot),
            Arc::clone(&self.transports),
            Arc::clone(&self.ports),
            Arc::clone(&self.events),
        );
        info!(room_id = %room_id, total_rooms = self.rooms.len() + 1, "room registered");
        self.rooms.insert(room_id, Arc::clone(&room));
        room
    }

    #[must_use]
    pub fn room(&self, room_id: &RoomId) -> Option<SharedRoom> {
        self.rooms.get(room_id).map(|room| Arc::clone(room.value()))
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Close and drop every room whose liveness window lapsed.
    pub fn sweep_dead_rooms(&self) {
        let now_ms = crate::now_millis();
        let dead: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|entry| !entry.value().lock().is_alive(now_ms))
            .map(|entry| entry.key().clone())
            .collect();
        for room_id in dead {
            if let Some((_, room)) = self.rooms.remove(&room_id) {
                room.lock().close();
                warn!(room_id = %room_id, "swept dead room");
            }
        }
    }
}

impl Drop for RoomManager {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::events::NoopEventSink;
    use crate::pilot::PilotClient;
    use crate::transport::{
        MediaTransport, NegotiatedTransport, TransportFactory, TransportRole,
    };
    use crate::types::{SessionId, UserId};
    use serde_json::Value;

    struct NullPilot;

    impl PilotClient for NullPilot {
        fn request(&self, _method: &str, _data: Value) -> u64 {
            0
        }
        fn notify(&self, _method: &str, _data: Value) {}
    }

    struct NullTransport;

    impl MediaTransport for NullTransport {
        fn is_connected(&self) -> bool {
            false
        }
        fn send_rtp(&self, _data: &[u8]) {}
        fn send_rtcp(&self, _data: &[u8]) {}
    }

    struct NullFactory;

    impl TransportFactory for NullFactory {
        fn create_transport(
            &self,
            _role: TransportRole,
            _room_id: &RoomId,
            _user_id: &UserId,
            _remote_fingerprint: Option<&str>,
        ) -> Result<NegotiatedTransport> {
            Ok(NegotiatedTransport {
                session_id: SessionId::generate(),
                ice_ufrag: "u".to_string(),
                ice_pwd: "p".to_string(),
                fingerprint: "sha-256 00".to_string(),
                transport: Arc::new(NullTransport),
            })
        }
    }

    fn manager() -> Arc<RoomManager> {
        RoomManager::new(
            SfuConfig::default(),
            Arc::new(NullPilot),
            Arc::new(NullFactory),
            Arc::new(NoopEventSink),
        )
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let manager = manager();
        let room = manager.get_or_create_room(RoomId::new("r1"));
        let again = manager.get_or_create_room(RoomId::new("r1"));
        assert!(Arc::ptr_eq(&room, &again));
        assert_eq!(manager.room_count(), 1);
    }

    #[tokio::test]
    async fn sweep_removes_dead_rooms() {
        let manager = manager();
        let room = manager.get_or_create_room(RoomId::new("r1"));
        assert_eq!(manager.room_count(), 1);

        // a freshly created room is alive
        manager.sweep_dead_rooms();
        assert_eq!(manager.room_count(), 1);

        room.lock().close();
        manager.sweep_dead_rooms();
        assert_eq!(manager.room_count(), 0);
    }
}
