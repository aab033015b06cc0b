//! Send-side RTP session: statistics, retransmit cache and RTCP for one
//! outbound stream
//!
//! The cache stores copies of the wire bytes; fan-out borrows are never
//! retained past the dispatch that produced them.

use crate::param::RtpSessionParam;
use crate::rtp::packet::RtpPacket;
use crate::rtp::rtcp::{Nack, ReportBlock, SenderReport};
use crate::rtp::stats::StreamStats;
use crate::transport::SharedTransport;
use crate::types::{RoomId, UserId};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

const CACHE_MAX_PACKETS: usize = 512;
const CACHE_TTL_MS: i64 = 3000;
const SR_INTERVAL_MS: i64 = 2000;
const NTP_UNIX_OFFSET_SEC: i64 = 2_208_988_800;

/// Send session for one subscription or relay stream
pub struct RtpSendSession {
    param: RtpSessionParam,
    room_id: RoomId,
    puller_user_id: Option<UserId>,
    pusher_user_id: UserId,
    transport: SharedTransport,

    stats: StreamStats,
    cache: HashMap<u16, (i64, Bytes)>,
    cache_order: VecDeque<u16>,

    last_sr_ms: i64,
    last_rtp_ts: u32,
    last_rr: Option<ReportBlock>,
}

impl RtpSendSession {
    pub fn new(
        param: RtpSessionParam,
        room_id: RoomId,
        puller_user_id: Option<UserId>,
        pusher_user_id: UserId,
        transport: SharedTransport,
    ) -> Self {
        Self {
            param,
            room_id,
            puller_user_id,
            pusher_user_id,
            transport,
            stats: StreamStats::default(),
            cache: HashMap::new(),
            cache_order: VecDeque::new(),
            last_sr_ms: 0,
            last_rtp_ts: 0,
            last_rr: None,
        }
    }

    #[must_use]
    pub fn param(&self) -> &RtpSessionParam {
        &self.param
    }

    /// Account an outbound packet and copy it into the retransmit cache.
    /// Returns false when the packet does not belong to this session's
    /// stream; the caller must not emit it in that case.
    pub fn send_rtp(&mut self, pkt: &RtpPacket, now_ms: i64) -> bool {
        if !self.param.owns_ssrc(pkt.ssrc()) {
            return false;
        }
        self.stats.record(pkt.len(), now_ms);
        self.last_rtp_ts = pkt.timestamp();
        if self.param.use_nack && pkt.ssrc() == self.param.ssrc {
            self.cache_insert(pkt.seq(), now_ms, Bytes::copy_from_slice(pkt.data()));
        }
        true
    }

    /// Retransmit every cached packet a NACK reports missing.
    /// Returns the number of packets resent.
    pub fn handle_nack(&mut self, nack: &Nack, now_ms: i64) -> usize {
        let mut resent = 0;
        for seq in nack.lost_seqs() {
            if let Some((_, data)) = self.cache.get(&seq) {
                self.transport.send_rtp(data);
                self.stats.record(data.len(), now_ms);
                resent += 1;
            } else {
                debug!(
                    room_id = %self.room_id,
                    pusher_user_id = %self.pusher_user_id,
                    ssrc = self.param.ssrc,
                    seq,
                    "NACKed packet no longer cached"
                );
            }
        }
        resent
    }

    pub fn handle_rr_block(&mut self, block: &ReportBlock) {
        debug!(
            room_id = %self.room_id,
            pusher_user_id = %self.pusher_user_id,
            ssrc = block.ssrc,
            fraction_lost = block.fraction_lost,
            jitter = block.jitter,
            "receiver report block"
        );
        self.last_rr = Some(block.clone());
    }

    #[must_use]
    pub fn last_rr(&self) -> Option<&ReportBlock> {
        self.last_rr.as_ref()
    }

    /// Periodic housekeeping: expire the retransmit cache and emit an SR.
    pub fn on_timer(&mut self, now_ms: i64) {
        while let Some(&seq) = self.cache_order.front() {
            match self.cache.get(&seq) {
                Some((cached_ms, _)) if now_ms - cached_ms > CACHE_TTL_MS => {
                    self.cache_order.pop_front();
                    self.cache.remove(&seq);
                }
                Some(_) => break,
                None => {
                    self.cache_order.pop_front();
                }
            }
        }

        if self.stats.packets() > 0 && now_ms - self.last_sr_ms >= SR_INTERVAL_MS {
            self.last_sr_ms = now_ms;
            let sr = SenderReport {
                ssrc: self.param.ssrc,
                ntp_sec: (now_ms / 1000 + NTP_UNIX_OFFSET_SEC) as u32,
                ntp_frac: (((now_ms % 1000) << 32) / 1000) as u32,
                rtp_ts: self.last_rtp_ts,
                packet_count: self.stats.packets() as u32,
                octet_count: self.stats.bytes() as u32,
            };
            self.transport.send_rtcp(&sr.to_bytes());
        }
    }

    pub fn stats_mut(&mut self) -> &mut StreamStats {
        &mut self.stats
    }

    #[must_use]
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    #[must_use]
    pub fn cached_packets(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn puller_user_id(&self) -> Option<&UserId> {
        self.puller_user_id.as_ref()
    }

    fn cache_insert(&mut self, seq: u16, now_ms: i64, data: Bytes) {
        if self.cache.insert(seq, (now_ms, data)).is_none() {
            self.cache_order.push_back(seq);
        }
        while self.cache.len() > CACHE_MAX_PACKETS {
            match self.cache_order.pop_front() {
                Some(old) => {
                    self.cache.remove(&old);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::AvType;
    use crate::rtp::rtcp::NackEntry;
    use crate::transport::MediaTransport;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct CaptureTransport {
        rtp: Mutex<Vec<Vec<u8>>>,
        rtcp: Mutex<Vec<Vec<u8>>>,
    }

    impl MediaTransport for CaptureTransport {
        fn is_connected(&self) -> bool {
            true
        }
        fn send_rtp(&self, data: &[u8]) {
            self.rtp.lock().push(data.to_vec());
        }
        fn send_rtcp(&self, data: &[u8]) {
            self.rtcp.lock().push(data.to_vec());
        }
    }

    fn session(transport: Arc<CaptureTransport>) -> RtpSendSession {
        let param = RtpSessionParam {
            av_type: AvType::Video,
            ssrc: 100,
            payload_type: 96,
            clock_rate: 90_000,
            rtx_ssrc: 101,
            rtx_payload_type: 97,
            use_nack: true,
            ..Default::default()
        };
        RtpSendSession::new(
            param,
            RoomId::new("r"),
            Some(UserId::new("sub")),
            UserId::new("pub"),
            transport,
        )
    }

    #[test]
    fn claims_only_own_ssrcs() {
        let transport = Arc::new(CaptureTransport::default());
        let mut s = session(transport);
        let own = RtpPacket::build(100, 96, 1, 0, &[1]).unwrap();
        let foreign = RtpPacket::build(999, 96, 1, 0, &[1]).unwrap();
        assert!(s.send_rtp(&own, 0));
        assert!(!s.send_rtp(&foreign, 0));
        assert_eq!(s.stats().packets(), 1);
    }

    #[test]
    fn nack_resends_cached_copy() {
        let transport = Arc::new(CaptureTransport::default());
        let mut s = session(transport.clone());
        let pkt = RtpPacket::build(100, 96, 42, 0, &[1, 2, 3]).unwrap();
        assert!(s.send_rtp(&pkt, 0));
        assert_eq!(s.cached_packets(), 1);

        let nack = Nack {
            sender_ssrc: 7,
            media_ssrc: 100,
            entries: vec![NackEntry { pid: 42, blp: 0 }],
        };
        assert_eq!(s.handle_nack(&nack, 10), 1);
        let sent = transport.rtp.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], pkt.data());
    }

    #[test]
    fn cache_expires_on_timer() {
        let transport = Arc::new(CaptureTransport::default());
        let mut s = session(transport);
        let pkt = RtpPacket::build(100, 96, 1, 0, &[1]).unwrap();
        assert!(s.send_rtp(&pkt, 1_000));
        s.on_timer(1_500);
        assert_eq!(s.cached_packets(), 1);
        s.on_timer(10_000);
        assert_eq!(s.cached_packets(), 0);
    }

    #[test]
    fn emits_periodic_sr() {
        let transport = Arc::new(CaptureTransport::default());
        let mut s = session(transport.clone());
        let pkt = RtpPacket::build(100, 96, 1, 4_711, &[1]).unwrap();
        assert!(s.send_rtp(&pkt, 1_000));
        s.on_timer(4_000);
        let rtcp = transport.rtcp.lock();
        assert_eq!(rtcp.len(), 1);
        let sr = SenderReport::parse(&rtcp[0]).unwrap();
        assert_eq!(sr.ssrc, 100);
        assert_eq!(sr.rtp_ts, 4_711);
        assert_eq!(sr.packet_count, 1);
    }
}
