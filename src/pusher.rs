//! Receive side of one published stream
//!
//! A `MediaPusher` owns the receive session for one local publisher's
//! stream (primary SSRC plus optional RTX). It stamps the negotiated
//! header-extension ids onto incoming packets, demuxes RTX, and tells the
//! room whether the packet should be fanned out. PLI toward the publisher
//! runs on an 8 second cadence for video, plus on-demand key-frame
//! requests.

use crate::error::{Error, Result};
use crate::events::{stamped, EventSink};
use crate::param::{AvType, RtpSessionParam};
use crate::rtp::rtcp::{Pli, SenderReport};
use crate::rtp::{RtpPacket, RtpRecvSession, RtxOutcome};
use crate::transport::SharedTransport;
use crate::types::{PusherId, RoomId, SessionId, UserId};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info};

const STATS_INTERVAL_MS: i64 = 5000;
const KEYFRAME_INTERVAL_MS: i64 = 8000;

/// What to do with a packet after pusher-side processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PusherIngress {
    /// Deliver to every subscriber of this pusher
    Forward,
    /// Accounted but not forwarded (RTX repeat, empty payload)
    Dropped,
}

pub struct MediaPusher {
    param: RtpSessionParam,
    room_id: RoomId,
    user_id: UserId,
    session_id: SessionId,
    pusher_id: PusherId,
    transport: SharedTransport,
    events: Arc<dyn EventSink>,

    session: RtpRecvSession,

    last_stats_ms: i64,
    last_keyframe_request_ms: i64,
}

impl MediaPusher {
    pub fn new(
        param: RtpSessionParam,
        room_id: RoomId,
        user_id: UserId,
        session_id: SessionId,
        transport: SharedTransport,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let pusher_id = PusherId::generate();
        info!(
            room_id = %room_id,
            user_id = %user_id,
            session_id = %session_id,
            pusher_id = %pusher_id,
            ssrc = param.ssrc,
            payload_type = param.payload_type,
            media_type = %param.av_type,
            "MediaPusher created"
        );
        let session = RtpRecvSession::new(param.clone(), room_id.clone(), user_id.clone());
        Self {
            param,
            room_id,
            user_id,
            session_id,
            pusher_id,
            transport,
            events,
            session,
            last_stats_ms: -1,
            last_keyframe_request_ms: -1,
        }
    }

    #[must_use]
    pub fn pusher_id(&self) -> &PusherId {
        &self.pusher_id
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    #[must_use]
    pub fn param(&self) -> &RtpSessionParam {
        &self.param
    }

    #[must_use]
    pub fn media_type(&self) -> AvType {
        self.param.av_type
    }

    /// Process one packet from the publisher's transport. `Forward` means
    /// the packet (now carrying primary SSRC/seq) must be fanned out.
    pub fn handle_rtp_packet(
        &mut self,
        pkt: &mut RtpPacket,
        now_ms: i64,
    ) -> Result<PusherIngress> {
        if let Some(id) = self.param.mid_ext_id {
            pkt.set_mid_ext_id(id);
        }
        if let Some(id) = self.param.tcc_ext_id {
            pkt.set_tcc_ext_id(id);
        }
        if let Some(id) = self.param.abs_send_time_ext_id {
            pkt.set_abs_send_time_ext_id(id);
        }

        let ssrc = pkt.ssrc();
        if ssrc == self.param.ssrc {
            if !self.session.receive_rtp(pkt, now_ms) {
                error!(
                    room_id = %self.room_id,
                    user_id = %self.user_id,
                    pusher_id = %self.pusher_id,
                    ssrc,
                    "receive session rejected packet"
                );
                return Err(Error::Rtp("receive session rejected packet"));
            }
            return Ok(PusherIngress::Forward);
        }

        if self.param.rtx_ssrc != 0 && ssrc == self.param.rtx_ssrc {
            match self.session.receive_rtx(pkt, now_ms)? {
                RtxOutcome::Repeat => return Ok(PusherIngress::Dropped),
                RtxOutcome::Demuxed => {}
            }
            if pkt.payload_len() == 0 {
                return Ok(PusherIngress::Dropped);
            }
            return Ok(PusherIngress::Forward);
        }

        error!(
            room_id = %self.room_id,
            user_id = %self.user_id,
            pusher_id = %self.pusher_id,
            ssrc,
            "RTP packet with unknown ssrc"
        );
        Err(Error::UnknownSsrc(ssrc))
    }

    pub fn handle_rtcp_sr(&mut self, sr: &SenderReport) -> Result<()> {
        if sr.ssrc != self.param.ssrc {
            error!(
                room_id = %self.room_id,
                user_id = %self.user_id,
                pusher_id = %self.pusher_id,
                ssrc = sr.ssrc,
                "SR with unknown ssrc"
            );
            return Err(Error::UnknownSsrc(sr.ssrc));
        }
        self.session.handle_sr(sr);
        Ok(())
    }

    pub fn on_timer(&mut self, now_ms: i64) {
        if self.last_stats_ms < 0 {
            self.last_stats_ms = now_ms;
        } else if now_ms - self.last_stats_ms >= STATS_INTERVAL_MS {
            self.last_stats_ms = now_ms;
            let rate = self.session.stats_mut().rate(now_ms);
            debug!(
                room_id = %self.room_id,
                user_id = %self.user_id,
                session_id = %self.session_id,
                pusher_id = %self.pusher_id,
                ssrc = self.param.ssrc,
                media_type = %self.param.av_type,
                recv_kbits = rate.kbits_per_sec(),
                recv_pps = rate.packets_per_sec,
                "pusher receive statistics"
            );
            self.events.log(
                "pusher_recv",
                stamped(
                    "pusher_recv",
                    json!({
                        "room_id": self.room_id,
                        "user_id": self.user_id,
                        "session_id": self.session_id,
                        "pusher_id": self.pusher_id,
                        "ssrc": self.param.ssrc,
                        "media_type": self.param.av_type.as_str(),
                        "recv_kbps": rate.kbits_per_sec(),
                        "recv_pps": rate.packets_per_sec,
                    }),
                ),
            );
        }

        if self.param.av_type == AvType::Video {
            if self.last_keyframe_request_ms < 0 {
                self.last_keyframe_request_ms = now_ms;
            } else if now_ms - self.last_keyframe_request_ms >= KEYFRAME_INTERVAL_MS {
                if let Err(e) = self.request_key_frame(self.param.ssrc, now_ms) {
                    error!(
                        room_id = %self.room_id,
                        pusher_id = %self.pusher_id,
                        error = %e,
                        "periodic key-frame request failed"
                    );
                }
            }
        }
    }

    /// Send a PLI toward the publisher for `ssrc` (must be the primary).
    pub fn request_key_frame(&mut self, ssrc: u32, now_ms: i64) -> Result<()> {
        if ssrc != self.param.ssrc {
            return Err(Error::UnknownSsrc(ssrc));
        }
        self.last_keyframe_request_ms = now_ms;
        // sender_ssrc 0 identifies the server
        let pli = Pli {
            sender_ssrc: 0,
            media_ssrc: ssrc,
        };
        info!(
            room_id = %self.room_id,
            user_id = %self.user_id,
            session_id = %self.session_id,
            pusher_id = %self.pusher_id,
            ssrc,
            "requesting key frame from publisher"
        );
        self.transport.send_rtcp(&pli.to_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventSink;
    use crate::transport::MediaTransport;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CaptureTransport {
        rtcp: Mutex<Vec<Vec<u8>>>,
    }

    impl MediaTransport for CaptureTransport {
        fn is_connected(&self) -> bool {
            true
        }
        fn send_rtp(&self, _data: &[u8]) {}
        fn send_rtcp(&self, data: &[u8]) {
            self.rtcp.lock().push(data.to_vec());
        }
    }

    fn pusher(transport: Arc<CaptureTransport>) -> MediaPusher {
        let param = RtpSessionParam {
            av_type: AvType::Video,
            ssrc: 100,
            payload_type: 96,
            clock_rate: 90_000,
            rtx_ssrc: 101,
            rtx_payload_type: 97,
            use_nack: true,
            mid_ext_id: Some(1),
            tcc_ext_id: Some(3),
            ..Default::default()
        };
        MediaPusher::new(
            param,
            RoomId::new("r"),
            UserId::new("u"),
            SessionId::new("s"),
            transport,
            Arc::new(NoopEventSink),
        )
    }

    #[test]
    fn primary_packets_forward() {
        let mut p = pusher(Arc::new(CaptureTransport::default()));
        let mut pkt = RtpPacket::build(100, 96, 1, 0, &[1, 2]).unwrap();
        assert_eq!(
            p.handle_rtp_packet(&mut pkt, 0).unwrap(),
            PusherIngress::Forward
        );
        assert_eq!(pkt.mid_ext_id(), Some(1));
        assert_eq!(pkt.tcc_ext_id(), Some(3));
    }

    #[test]
    fn unknown_ssrc_is_an_error() {
        let mut p = pusher(Arc::new(CaptureTransport::default()));
        let mut pkt = RtpPacket::build(999, 96, 1, 0, &[1]).unwrap();
        assert!(p.handle_rtp_packet(&mut pkt, 0).is_err());
    }

    #[test]
    fn rtx_repeat_is_dropped() {
        let mut p = pusher(Arc::new(CaptureTransport::default()));
        let mut pkt = RtpPacket::build(100, 96, 5, 0, &[1, 2]).unwrap();
        assert_eq!(
            p.handle_rtp_packet(&mut pkt, 0).unwrap(),
            PusherIngress::Forward
        );

        let mut payload = 5u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[1, 2]);
        let mut rtx = RtpPacket::build(101, 97, 9_000, 0, &payload).unwrap();
        assert_eq!(
            p.handle_rtp_packet(&mut rtx, 10).unwrap(),
            PusherIngress::Dropped
        );
    }

    #[test]
    fn rtx_padding_probe_is_dropped() {
        let mut p = pusher(Arc::new(CaptureTransport::default()));
        // OSN only, no payload behind it
        let payload = 77u16.to_be_bytes().to_vec();
        let mut rtx = RtpPacket::build(101, 97, 9_000, 0, &payload).unwrap();
        assert_eq!(
            p.handle_rtp_packet(&mut rtx, 0).unwrap(),
            PusherIngress::Dropped
        );
    }

    #[test]
    fn pli_cadence_is_eight_seconds() {
        let transport = Arc::new(CaptureTransport::default());
        let mut p = pusher(transport.clone());
        p.on_timer(1_000);
        assert!(transport.rtcp.lock().is_empty());
        p.on_timer(5_000);
        assert!(transport.rtcp.lock().is_empty());
        p.on_timer(9_000);
        {
            let rtcp = transport.rtcp.lock();
            assert_eq!(rtcp.len(), 1);
            let pli = Pli::parse(&rtcp[0]).unwrap();
            assert_eq!(pli.media_ssrc, 100);
            assert_eq!(pli.sender_ssrc, 0);
        }
        // cadence restarts from the emission
        p.on_timer(13_000);
        assert_eq!(transport.rtcp.lock().len(), 1);
        p.on_timer(17_000);
        assert_eq!(transport.rtcp.lock().len(), 2);
    }

    #[test]
    fn on_demand_key_frame_request() {
        let transport = Arc::new(CaptureTransport::default());
        let mut p = pusher(transport.clone());
        p.request_key_frame(100, 0).unwrap();
        assert_eq!(transport.rtcp.lock().len(), 1);
        assert!(p.request_key_frame(999, 0).is_err());
    }
}
