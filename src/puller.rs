//! Send side of one subscription
//!
//! A `MediaPuller` forwards one pusher's packets to one local subscriber.
//! The subscriber negotiated its own extmap, so the packet's mid /
//! transport-wide-cc / abs-send-time extension ids are remapped in place
//! (values preserved) before the bytes leave through the subscriber's
//! transport.

use crate::events::{stamped, EventSink};
use crate::param::RtpSessionParam;
use crate::rtp::rtcp::{Nack, ReportBlock};
use crate::rtp::{RtpPacket, RtpSendSession};
use crate::transport::SharedTransport;
use crate::types::{PullerId, PusherId, RoomId, SessionId, UserId};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

const STATS_INTERVAL_MS: i64 = 5000;

pub struct MediaPuller {
    param: RtpSessionParam,
    room_id: RoomId,
    puller_user_id: UserId,
    pusher_user_id: UserId,
    pusher_id: PusherId,
    puller_id: PullerId,
    session_id: SessionId,
    transport: SharedTransport,
    events: Arc<dyn EventSink>,

    send_session: RtpSendSession,
    last_stats_ms: i64,
}

impl MediaPuller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        param: RtpSessionParam,
        room_id: RoomId,
        puller_user_id: UserId,
        pusher_user_id: UserId,
        pusher_id: PusherId,
        session_id: SessionId,
        transport: SharedTransport,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let puller_id = PullerId::generate();
        info!(
            room_id = %room_id,
            pusher_id = %pusher_id,
            puller_user_id = %puller_user_id,
            pusher_user_id = %pusher_user_id,
            session_id = %session_id,
            puller_id = %puller_id,
            ssrc = param.ssrc,
            payload_type = param.payload_type,
            media_type = %param.av_type,
            "MediaPuller created"
        );
        let send_session = RtpSendSession::new(
            param.clone(),
            room_id.clone(),
            Some(puller_user_id.clone()),
            pusher_user_id.clone(),
            transport.clone(),
        );
        Self {
            param,
            room_id,
            puller_user_id,
            pusher_user_id,
            pusher_id,
            puller_id,
            session_id,
            transport,
            events,
            send_session,
            last_stats_ms: -1,
        }
    }

    #[must_use]
    pub fn puller_id(&self) -> &PullerId {
        &self.puller_id
    }

    #[must_use]
    pub fn pusher_id(&self) -> &PusherId {
        &self.pusher_id
    }

    #[must_use]
    pub fn puller_user_id(&self) -> &UserId {
        &self.puller_user_id
    }

    #[must_use]
    pub fn pusher_user_id(&self) -> &UserId {
        &self.pusher_user_id
    }

    #[must_use]
    pub fn param(&self) -> &RtpSessionParam {
        &self.param
    }

    /// Forward one packet to the subscriber. Drops silently while the
    /// transport is not connected and for empty payloads.
    pub fn on_transport_send_rtp(&mut self, pkt: &mut RtpPacket, now_ms: i64) {
        if pkt.payload_len() == 0 {
            return;
        }
        if !self.transport.is_connected() {
            return;
        }

        if let Some(new_id) = self.param.mid_ext_id {
            if !pkt.remap_mid_ext(new_id) {
                debug!(
                    room_id = %self.room_id,
                    puller_id = %self.puller_id,
                    new_id,
                    "mid extension remap failed"
                );
            }
        }
        if let Some(new_id) = self.param.tcc_ext_id {
            if !pkt.remap_tcc_ext(new_id) {
                debug!(
                    room_id = %self.room_id,
                    puller_id = %self.puller_id,
                    new_id,
                    "transport-wide-cc extension remap failed"
                );
            }
        }
        if let Some(new_id) = self.param.abs_send_time_ext_id {
            if !pkt.remap_abs_send_time_ext(new_id) {
                warn!(
                    room_id = %self.room_id,
                    puller_id = %self.puller_id,
                    new_id,
                    "abs-send-time extension remap failed"
                );
            }
        }

        if !self.send_session.send_rtp(pkt, now_ms) {
            return;
        }
        self.transport.send_rtp(pkt.data());
    }

    pub fn on_timer(&mut self, now_ms: i64) {
        if self.last_stats_ms < 0 {
            self.last_stats_ms = now_ms;
        } else if now_ms - self.last_stats_ms >= STATS_INTERVAL_MS {
            self.last_stats_ms = now_ms;
            let rate = self.send_session.stats_mut().rate(now_ms);
            info!(
                room_id = %self.room_id,
                puller_user_id = %self.puller_user_id,
                pusher_user_id = %self.pusher_user_id,
                ssrc = self.param.ssrc,
                media_type = %self.param.av_type,
                send_kbits = rate.kbits_per_sec(),
                send_pps = rate.packets_per_sec,
                "puller send statistics"
            );
            self.events.log(
                "puller_send",
                stamped(
                    "puller_send",
                    json!({
                        "room_id": self.room_id,
                        "puller_user_id": self.puller_user_id,
                        "pusher_user_id": self.pusher_user_id,
                        "ssrc": self.param.ssrc,
                        "media_type": self.param.av_type.as_str(),
                        "send_kbps": rate.kbits_per_sec(),
                        "send_pps": rate.packets_per_sec,
                    }),
                ),
            );
        }

        self.send_session.on_timer(now_ms);
    }

    pub fn handle_rtcp_rr_block(&mut self, block: &ReportBlock) {
        self.send_session.handle_rr_block(block);
    }

    pub fn handle_rtcp_fb_nack(&mut self, nack: &Nack, now_ms: i64) -> usize {
        self.send_session.handle_nack(nack, now_ms)
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventSink;
    use crate::param::AvType;
    use crate::transport::MediaTransport;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct CaptureTransport {
        connected: AtomicBool,
        rtp: Mutex<Vec<Vec<u8>>>,
    }

    impl MediaTransport for CaptureTransport {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Relaxed)
        }
        fn send_rtp(&self, data: &[u8]) {
            self.rtp.lock().push(data.to_vec());
        }
        fn send_rtcp(&self, _data: &[u8]) {}
    }

    fn puller(transport: Arc<CaptureTransport>) -> MediaPuller {
        let param = RtpSessionParam {
            av_type: AvType::Video,
            ssrc: 100,
            payload_type: 96,
            clock_rate: 90_000,
            use_nack: true,
            tcc_ext_id: Some(7),
            ..Default::default()
        };
        MediaPuller::new(
            param,
            RoomId::new("r"),
            UserId::new("sub"),
            UserId::new("pub"),
            PusherId::new("p1"),
            SessionId::new("s1"),
            transport,
            Arc::new(NoopEventSink),
        )
    }

    #[test]
    fn drops_until_transport_connected() {
        let transport = Arc::new(CaptureTransport::default());
        let mut p = puller(transport.clone());
        let mut pkt = RtpPacket::build(100, 96, 1, 0, &[1, 2]).unwrap();
        p.on_transport_send_rtp(&mut pkt, 0);
        assert!(transport.rtp.lock().is_empty());

        transport.connected.store(true, Ordering::Relaxed);
        p.on_transport_send_rtp(&mut pkt, 0);
        assert_eq!(transport.rtp.lock().len(), 1);
    }

    #[test]
    fn drops_empty_payload() {
        let transport = Arc::new(CaptureTransport::default());
        transport.connected.store(true, Ordering::Relaxed);
        let mut p = puller(transport.clone());
        let mut pkt = RtpPacket::build(100, 96, 1, 0, &[]).unwrap();
        p.on_transport_send_rtp(&mut pkt, 0);
        assert!(transport.rtp.lock().is_empty());
    }

    #[test]
    fn remaps_extension_ids_to_subscriber_values() {
        let transport = Arc::new(CaptureTransport::default());
        transport.connected.store(true, Ordering::Relaxed);
        let mut p = puller(transport.clone());

        let mut pkt =
            RtpPacket::build_with_extensions(100, 96, 1, 0, &[1], &[(3, &[0xaa, 0xbb])]).unwrap();
        pkt.set_tcc_ext_id(3);
        p.on_transport_send_rtp(&mut pkt, 0);

        let sent = transport.rtp.lock();
        assert_eq!(sent.len(), 1);
        let reparsed = RtpPacket::parse(&sent[0]).unwrap();
        assert_eq!(reparsed.data()[16] >> 4, 7);
        assert_eq!(&reparsed.data()[17..19], &[0xaa, 0xbb]);
    }
}
