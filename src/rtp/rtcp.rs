//! RTCP wire codec: classification, compound scanning, and the report
//! types the media plane acts on (SR, RR, NACK, PLI, AFB)
//!
//! Compound scanning is fault-isolated per sub-packet: a malformed or
//! unrecognized item is logged and skipped, the scan continues with the
//! next item.

use crate::error::{Error, Result};
use tracing::{debug, warn};

pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_BYE: u8 = 203;
pub const PT_APP: u8 = 204;
pub const PT_RTPFB: u8 = 205;
pub const PT_PSFB: u8 = 206;

pub const FMT_RTPFB_NACK: u8 = 1;
pub const FMT_PSFB_PLI: u8 = 1;
pub const FMT_PSFB_AFB: u8 = 15;

/// RTCP packet types occupy 192..=223 in the second octet; RTP payload
/// types never land there once the marker bit is masked off.
#[must_use]
pub fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= 4 && data[0] >> 6 == 2 && (192..=223).contains(&data[1])
}

#[must_use]
pub fn is_rtp(data: &[u8]) -> bool {
    data.len() >= 12 && data[0] >> 6 == 2 && !(192..=223).contains(&data[1])
}

/// Sender report (SR)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_sec: u32,
    pub ntp_frac: u32,
    pub rtp_ts: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderReport {
    pub fn parse(item: &[u8]) -> Result<Self> {
        if item.len() < 28 {
            return Err(Error::Rtcp("SR shorter than 28 bytes"));
        }
        Ok(Self {
            ssrc: be32(&item[4..8]),
            ntp_sec: be32(&item[8..12]),
            ntp_frac: be32(&item[12..16]),
            rtp_ts: be32(&item[16..20]),
            packet_count: be32(&item[20..24]),
            octet_count: be32(&item[24..28]),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(28);
        buf.extend_from_slice(&[0x80, PT_SR, 0, 6]);
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        buf.extend_from_slice(&self.ntp_sec.to_be_bytes());
        buf.extend_from_slice(&self.ntp_frac.to_be_bytes());
        buf.extend_from_slice(&self.rtp_ts.to_be_bytes());
        buf.extend_from_slice(&self.packet_count.to_be_bytes());
        buf.extend_from_slice(&self.octet_count.to_be_bytes());
        buf
    }
}

/// One reception report block inside an RR (or SR)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportBlock {
    /// The SSRC this block reports about
    pub ssrc: u32,
    pub fraction_lost: u8,
    pub packets_lost: i32,
    pub highest_seq: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_last_sr: u32,
}

impl ReportBlock {
    fn parse(block: &[u8]) -> Self {
        let lost_raw = be32(&block[4..8]);
        // 24-bit signed cumulative loss
        let packets_lost = ((lost_raw << 8) as i32) >> 8;
        Self {
            ssrc: be32(&block[0..4]),
            fraction_lost: block[4],
            packets_lost,
            highest_seq: be32(&block[8..12]),
            jitter: be32(&block[12..16]),
            last_sr: be32(&block[16..20]),
            delay_last_sr: be32(&block[20..24]),
        }
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        let lost = (self.packets_lost as u32) & 0x00ff_ffff;
        buf.extend_from_slice(&(((self.fraction_lost as u32) << 24) | lost).to_be_bytes());
        buf.extend_from_slice(&self.highest_seq.to_be_bytes());
        buf.extend_from_slice(&self.jitter.to_be_bytes());
        buf.extend_from_slice(&self.last_sr.to_be_bytes());
        buf.extend_from_slice(&self.delay_last_sr.to_be_bytes());
    }
}

/// Receiver report (RR)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub sender_ssrc: u32,
    pub blocks: Vec<ReportBlock>,
}

impl ReceiverReport {
    pub fn parse(item: &[u8]) -> Result<Self> {
        if item.len() < 8 {
            return Err(Error::Rtcp("RR shorter than 8 bytes"));
        }
        let count = (item[0] & 0x1f) as usize;
        if item.len() < 8 + count * 24 {
            return Err(Error::Rtcp("RR report blocks truncated"));
        }
        let mut blocks = Vec::with_capacity(count);
        for i in 0..count {
            let start = 8 + i * 24;
            blocks.push(ReportBlock::parse(&item[start..start + 24]));
        }
        Ok(Self {
            sender_ssrc: be32(&item[4..8]),
            blocks,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let words = 1 + self.blocks.len() * 6;
        let mut buf = Vec::with_capacity(8 + self.blocks.len() * 24);
        buf.push(0x80 | self.blocks.len() as u8);
        buf.push(PT_RR);
        buf.extend_from_slice(&(words as u16).to_be_bytes());
        buf.extend_from_slice(&self.sender_ssrc.to_be_bytes());
        for block in &self.blocks {
            block.write(&mut buf);
        }
        buf
    }
}

/// Picture loss indication (PSFB fmt 1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pli {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
}

impl Pli {
    pub fn parse(item: &[u8]) -> Result<Self> {
        if item.len() < 12 {
            return Err(Error::Rtcp("PLI shorter than 12 bytes"));
        }
        Ok(Self {
            sender_ssrc: be32(&item[4..8]),
            media_ssrc: be32(&item[8..12]),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        buf.extend_from_slice(&[0x80 | FMT_PSFB_PLI, PT_PSFB, 0, 2]);
        buf.extend_from_slice(&self.sender_ssrc.to_be_bytes());
        buf.extend_from_slice(&self.media_ssrc.to_be_bytes());
        buf
    }
}

/// One NACK entry: a base sequence number plus a bitmask of the 16
/// following sequence numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackEntry {
    pub pid: u16,
    pub blp: u16,
}

/// Generic NACK (RTPFB fmt 1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub entries: Vec<NackEntry>,
}

impl Nack {
    pub fn parse(item: &[u8]) -> Result<Self> {
        if item.len() < 16 {
            return Err(Error::Rtcp("NACK shorter than 16 bytes"));
        }
        let mut entries = Vec::new();
        let mut i = 12;
        while i + 4 <= item.len() {
            entries.push(NackEntry {
                pid: u16::from_be_bytes([item[i], item[i + 1]]),
                blp: u16::from_be_bytes([item[i + 2], item[i + 3]]),
            });
            i += 4;
        }
        Ok(Self {
            sender_ssrc: be32(&item[4..8]),
            media_ssrc: be32(&item[8..12]),
            entries,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let words = 2 + self.entries.len();
        let mut buf = Vec::with_capacity(12 + self.entries.len() * 4);
        buf.push(0x80 | FMT_RTPFB_NACK);
        buf.push(PT_RTPFB);
        buf.extend_from_slice(&(words as u16).to_be_bytes());
        buf.extend_from_slice(&self.sender_ssrc.to_be_bytes());
        buf.extend_from_slice(&self.media_ssrc.to_be_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(&entry.pid.to_be_bytes());
            buf.extend_from_slice(&entry.blp.to_be_bytes());
        }
        buf
    }

    /// Expand pid/blp pairs into the full list of missing sequence numbers.
    #[must_use]
    pub fn lost_seqs(&self) -> Vec<u16> {
        let mut seqs = Vec::new();
        for entry in &self.entries {
            seqs.push(entry.pid);
            for bit in 0..16u16 {
                if entry.blp & (1 << bit) != 0 {
                    seqs.push(entry.pid.wrapping_add(bit + 1));
                }
            }
        }
        seqs
    }
}

/// One sub-packet recognized while scanning a compound RTCP datagram
#[derive(Debug, Clone)]
pub enum RtcpItem {
    Sr(SenderReport),
    Rr(ReceiverReport),
    Nack(Nack),
    Pli(Pli),
    Afb { sender_ssrc: u32, media_ssrc: u32 },
    Other { packet_type: u8, fmt: u8 },
}

/// Scan a compound RTCP datagram into recognized items.
#[must_use]
pub fn scan_compound(data: &[u8]) -> Vec<RtcpItem> {
    let mut items = Vec::new();
    let mut rest = data;
    while rest.len() >= 4 {
        if rest[0] >> 6 != 2 {
            warn!(len = rest.len(), "RTCP sub-packet has bad version, stopping scan");
            break;
        }
        let packet_type = rest[1];
        let fmt = rest[0] & 0x1f;
        let words = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        let item_len = (words + 1) * 4;
        if item_len > rest.len() {
            warn!(
                packet_type,
                item_len,
                remaining = rest.len(),
                "RTCP sub-packet overruns datagram, stopping scan"
            );
            break;
        }
        let item = &rest[..item_len];
        match packet_type {
            PT_SR => match SenderReport::parse(item) {
                Ok(sr) => items.push(RtcpItem::Sr(sr)),
                Err(e) => debug!(error = %e, "skipping malformed SR"),
            },
            PT_RR => match ReceiverReport::parse(item) {
                Ok(rr) => items.push(RtcpItem::Rr(rr)),
                Err(e) => debug!(error = %e, "skipping malformed RR"),
            },
            PT_RTPFB if fmt == FMT_RTPFB_NACK => match Nack::parse(item) {
                Ok(nack) => items.push(RtcpItem::Nack(nack)),
                Err(e) => debug!(error = %e, "skipping malformed NACK"),
            },
            PT_PSFB if fmt == FMT_PSFB_PLI => match Pli::parse(item) {
                Ok(pli) => items.push(RtcpItem::Pli(pli)),
                Err(e) => debug!(error = %e, "skipping malformed PLI"),
            },
            PT_PSFB if fmt == FMT_PSFB_AFB => {
                if item.len() >= 12 {
                    items.push(RtcpItem::Afb {
                        sender_ssrc: be32(&item[4..8]),
                        media_ssrc: be32(&item[8..12]),
                    });
                }
            }
            _ => items.push(RtcpItem::Other { packet_type, fmt }),
        }
        rest = &rest[item_len..];
    }
    items
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_rtp_and_rtcp() {
        let pli = Pli { sender_ssrc: 0, media_ssrc: 100 }.to_bytes();
        assert!(is_rtcp(&pli));
        assert!(!is_rtp(&pli));

        let rtp = crate::rtp::RtpPacket::build(100, 96, 1, 0, &[1, 2]).unwrap();
        assert!(is_rtp(rtp.data()));
        assert!(!is_rtcp(rtp.data()));
    }

    #[test]
    fn pli_round_trip() {
        let pli = Pli { sender_ssrc: 0, media_ssrc: 0xdead_beef };
        let parsed = Pli::parse(&pli.to_bytes()).unwrap();
        assert_eq!(parsed, pli);
    }

    #[test]
    fn nack_blp_expansion() {
        let nack = Nack {
            sender_ssrc: 1,
            media_ssrc: 100,
            entries: vec![NackEntry { pid: 10, blp: 0b101 }],
        };
        let parsed = Nack::parse(&nack.to_bytes()).unwrap();
        assert_eq!(parsed.lost_seqs(), vec![10, 11, 13]);
    }

    #[test]
    fn sr_round_trip() {
        let sr = SenderReport {
            ssrc: 100,
            ntp_sec: 3_900_000_000,
            ntp_frac: 1234,
            rtp_ts: 90_000,
            packet_count: 42,
            octet_count: 4200,
        };
        let parsed = SenderReport::parse(&sr.to_bytes()).unwrap();
        assert_eq!(parsed, sr);
    }

    #[test]
    fn rr_round_trip() {
        let rr = ReceiverReport {
            sender_ssrc: 7,
            blocks: vec![ReportBlock {
                ssrc: 100,
                fraction_lost: 12,
                packets_lost: -3,
                highest_seq: 70_000,
                jitter: 5,
                last_sr: 9,
                delay_last_sr: 11,
            }],
        };
        let parsed = ReceiverReport::parse(&rr.to_bytes()).unwrap();
        assert_eq!(parsed, rr);
    }

    #[test]
    fn compound_scan_skips_unknown_and_survives_truncation() {
        let mut compound = SenderReport {
            ssrc: 1,
            ntp_sec: 0,
            ntp_frac: 0,
            rtp_ts: 0,
            packet_count: 0,
            octet_count: 0,
        }
        .to_bytes();
        // an SDES the plane does not act on
        compound.extend_from_slice(&[0x81, PT_SDES, 0, 1, 0, 0, 0, 1]);
        compound.extend_from_slice(&Pli { sender_ssrc: 0, media_ssrc: 5 }.to_bytes());
        // trailing garbage claiming to be longer than the datagram
        compound.extend_from_slice(&[0x80, PT_RR, 0xff, 0xff]);

        let items = scan_compound(&compound);
        assert_eq!(items.len(), 3);
        assert!(matches!(items[0], RtcpItem::Sr(_)));
        assert!(matches!(items[1], RtcpItem::Other { packet_type: PT_SDES, .. }));
        assert!(matches!(items[2], RtcpItem::Pli(_)));
    }
}
