//! Receive-side RTP session: sequence accounting, jitter, RTX demux and
//! duplicate suppression for one stream (primary SSRC plus optional RTX)

use crate::error::Result;
use crate::param::RtpSessionParam;
use crate::rtp::packet::RtpPacket;
use crate::rtp::rtcp::SenderReport;
use crate::rtp::stats::StreamStats;
use crate::types::{RoomId, UserId};
use std::collections::{HashSet, VecDeque};
use tracing::debug;

const MAX_DROPOUT: u16 = 3000;
const MAX_MISORDER: u16 = 100;
const SEEN_WINDOW: usize = 512;

/// What an RTX packet turned out to be after demuxing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtxOutcome {
    /// The recovered packet was already received; drop it silently
    Repeat,
    /// The packet now carries the primary stream's SSRC/seq/payload type
    Demuxed,
}

/// Receive session for one negotiated stream
pub struct RtpRecvSession {
    param: RtpSessionParam,
    room_id: RoomId,
    user_id: UserId,

    first_pkt: bool,
    cycles: u32,
    base_seq: u16,
    max_seq: u16,
    bad_seq: Option<u16>,

    jitter_q4: u32,
    last_transit: Option<i64>,

    seen: VecDeque<u16>,
    seen_set: HashSet<u16>,

    stats: StreamStats,
    last_sr: Option<SenderReport>,
}

impl RtpRecvSession {
    pub fn new(param: RtpSessionParam, room_id: RoomId, user_id: UserId) -> Self {
        Self {
            param,
            room_id,
            user_id,
            first_pkt: true,
            cycles: 0,
            base_seq: 0,
            max_seq: 0,
            bad_seq: None,
            jitter_q4: 0,
            last_transit: None,
            seen: VecDeque::with_capacity(SEEN_WINDOW),
            seen_set: HashSet::with_capacity(SEEN_WINDOW),
            stats: StreamStats::default(),
            last_sr: None,
        }
    }

    #[must_use]
    pub fn param(&self) -> &RtpSessionParam {
        &self.param
    }

    /// Account a primary-stream packet. Returns false when the sequence
    /// jump is implausible and the packet should not be forwarded.
    pub fn receive_rtp(&mut self, pkt: &RtpPacket, now_ms: i64) -> bool {
        if !self.update_seq(pkt.seq()) {
            debug!(
                room_id = %self.room_id,
                user_id = %self.user_id,
                ssrc = pkt.ssrc(),
                seq = pkt.seq(),
                "implausible sequence jump, packet not accepted"
            );
            return false;
        }
        self.update_jitter(pkt.timestamp(), now_ms);
        self.mark_seen(pkt.seq());
        self.stats.record(pkt.len(), now_ms);
        true
    }

    /// Demux an RTX packet back onto the primary stream and suppress
    /// retransmissions of packets already delivered.
    pub fn receive_rtx(&mut self, pkt: &mut RtpPacket, now_ms: i64) -> Result<RtxOutcome> {
        pkt.demux_rtx(self.param.ssrc, self.param.payload_type)?;
        if self.seen_set.contains(&pkt.seq()) {
            return Ok(RtxOutcome::Repeat);
        }
        self.mark_seen(pkt.seq());
        self.stats.record(pkt.len(), now_ms);
        Ok(RtxOutcome::Demuxed)
    }

    pub fn handle_sr(&mut self, sr: &SenderReport) {
        self.last_sr = Some(sr.clone());
    }

    #[must_use]
    pub fn last_sr(&self) -> Option<&SenderReport> {
        self.last_sr.as_ref()
    }

    pub fn stats_mut(&mut self) -> &mut StreamStats {
        &mut self.stats
    }

    #[must_use]
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Interarrival jitter in RTP timestamp units (RFC 3550 §6.4.1)
    #[must_use]
    pub fn jitter(&self) -> u32 {
        self.jitter_q4 >> 4
    }

    #[must_use]
    pub fn expected_packets(&self) -> i64 {
        if self.first_pkt {
            return 0;
        }
        let extended_max = (i64::from(self.cycles) << 16) | i64::from(self.max_seq);
        extended_max - i64::from(self.base_seq) + 1
    }

    fn init_seq(&mut self, seq: u16) {
        self.base_seq = seq;
        self.max_seq = seq;
        self.bad_seq = None;
        self.cycles = 0;
    }

    // Sequence validation per RFC 3550 appendix A.1.
    fn update_seq(&mut self, seq: u16) -> bool {
        if self.first_pkt {
            self.init_seq(seq);
            self.first_pkt = false;
            return true;
        }
        let udelta = seq.wrapping_sub(self.max_seq);
        if udelta < MAX_DROPOUT {
            if seq < self.max_seq {
                self.cycles += 1;
            }
            self.max_seq = seq;
            true
        } else if udelta <= u16::MAX - MAX_MISORDER {
            // large jump: accept only when the next packet confirms it
            if self.bad_seq == Some(seq) {
                self.init_seq(seq);
                true
            } else {
                self.bad_seq = Some(seq.wrapping_add(1));
                false
            }
        } else {
            // duplicate or reordered packet within the misorder window
            true
        }
    }

    fn update_jitter(&mut self, rtp_ts: u32, now_ms: i64) {
        if self.param.clock_rate == 0 {
            return;
        }
        let arrival = now_ms * i64::from(self.param.clock_rate) / 1000;
        let transit = arrival - i64::from(rtp_ts);
        if let Some(last) = self.last_transit {
            let d = (transit - last).unsigned_abs() as i64;
            let next = i64::from(self.jitter_q4) + d - i64::from((self.jitter_q4 + 8) >> 4);
            self.jitter_q4 = next.max(0) as u32;
        }
        self.last_transit = Some(transit);
    }

    fn mark_seen(&mut self, seq: u16) {
        if self.seen_set.insert(seq) {
            self.seen.push_back(seq);
            if self.seen.len() > SEEN_WINDOW {
                if let Some(old) = self.seen.pop_front() {
                    self.seen_set.remove(&old);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::AvType;

    fn session() -> RtpRecvSession {
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
        RtpRecvSession::new(param, RoomId::new("r"), UserId::new("u"))
    }

    fn pkt(seq: u16) -> RtpPacket {
        RtpPacket::build(100, 96, seq, u32::from(seq) * 3000, &[0; 16]).unwrap()
    }

    #[test]
    fn in_order_sequence_accepted() {
        let mut s = session();
        for seq in 0..10 {
            assert!(s.receive_rtp(&pkt(seq), i64::from(seq) * 33));
        }
        assert_eq!(s.expected_packets(), 10);
        assert_eq!(s.stats().packets(), 10);
    }

    #[test]
    fn wraparound_counts_a_cycle() {
        let mut s = session();
        assert!(s.receive_rtp(&pkt(65_534), 0));
        assert!(s.receive_rtp(&pkt(65_535), 33));
        assert!(s.receive_rtp(&pkt(0), 66));
        assert_eq!(s.expected_packets(), 3);
    }

    #[test]
    fn big_jump_needs_confirmation() {
        let mut s = session();
        assert!(s.receive_rtp(&pkt(10), 0));
        // one wild packet is rejected
        assert!(!s.receive_rtp(&pkt(40_000), 33));
        // the stream really restarted there: the follow-up is accepted
        assert!(s.receive_rtp(&pkt(40_001), 66));
        assert_eq!(s.expected_packets(), 1);
    }

    #[test]
    fn rtx_demux_and_repeat_suppression() {
        let mut s = session();
        assert!(s.receive_rtp(&pkt(5), 0));

        let mut payload = 6u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[1, 2, 3]);
        let mut rtx = RtpPacket::build(101, 97, 9_000, 18_000, &payload).unwrap();
        assert_eq!(s.receive_rtx(&mut rtx, 33).unwrap(), RtxOutcome::Demuxed);
        assert_eq!(rtx.ssrc(), 100);
        assert_eq!(rtx.seq(), 6);

        // the same retransmission again is a repeat
        let mut payload = 6u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[1, 2, 3]);
        let mut rtx2 = RtpPacket::build(101, 97, 9_001, 18_000, &payload).unwrap();
        assert_eq!(s.receive_rtx(&mut rtx2, 66).unwrap(), RtxOutcome::Repeat);
    }

    #[test]
    fn rtx_of_already_delivered_primary_is_repeat() {
        let mut s = session();
        assert!(s.receive_rtp(&pkt(7), 0));
        let mut payload = 7u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[9]);
        let mut rtx = RtpPacket::build(101, 97, 9_000, 21_000, &payload).unwrap();
        assert_eq!(s.receive_rtx(&mut rtx, 33).unwrap(), RtxOutcome::Repeat);
    }
}
