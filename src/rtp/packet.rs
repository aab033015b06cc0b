//! Parsed RTP packet with in-place header-extension remapping
//!
//! The buffer is owned (`BytesMut`) and stays wire-valid through every
//! mutation, so `data()` can always be handed straight to a transport.
//! Padding is stripped at parse time. Header extensions use the RFC 8285
//! one-byte format; which extension id means mid / transport-wide-cc /
//! abs-send-time is negotiated per stream, so the packet tracks the current
//! id of each known extension and can rewrite it to a subscriber's mapping
//! without touching the extension values.

use crate::error::{Error, Result};
use bytes::BytesMut;

const MIN_HEADER_LEN: usize = 12;
const ONE_BYTE_EXT_PROFILE: u16 = 0xBEDE;

#[derive(Debug, Clone, Copy, Default)]
struct KnownExtIds {
    mid: Option<u8>,
    tcc: Option<u8>,
    abs_send_time: Option<u8>,
}

#[derive(Debug, Clone, Copy)]
struct ExtEntry {
    id: u8,
    /// Offset of the (id << 4 | len-1) byte within the packet buffer
    id_offset: usize,
    data_len: u8,
}

/// One parsed RTP packet
#[derive(Debug, Clone)]
pub struct RtpPacket {
    data: BytesMut,
    header_len: usize,
    payload_len: usize,
    ext_entries: Vec<ExtEntry>,
    known: KnownExtIds,
}

impl RtpPacket {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < MIN_HEADER_LEN {
            return Err(Error::Rtp("packet shorter than fixed header"));
        }
        if raw[0] >> 6 != 2 {
            return Err(Error::Rtp("unsupported RTP version"));
        }
        let csrc_count = (raw[0] & 0x0f) as usize;
        let has_ext = raw[0] & 0x10 != 0;
        let has_padding = raw[0] & 0x20 != 0;

        let mut header_len = MIN_HEADER_LEN + csrc_count * 4;
        if raw.len() < header_len {
            return Err(Error::Rtp("truncated CSRC list"));
        }

        let mut ext_entries = Vec::new();
        if has_ext {
            if raw.len() < header_len + 4 {
                return Err(Error::Rtp("truncated extension header"));
            }
            let profile = u16::from_be_bytes([raw[header_len], raw[header_len + 1]]);
            let words = u16::from_be_bytes([raw[header_len + 2], raw[header_len + 3]]) as usize;
            let data_start = header_len + 4;
            let data_len = words * 4;
            if raw.len() < data_start + data_len {
                return Err(Error::Rtp("truncated extension data"));
            }
            if profile == ONE_BYTE_EXT_PROFILE {
                let mut i = data_start;
                let end = data_start + data_len;
                while i < end {
                    let b = raw[i];
                    if b == 0 {
                        i += 1;
                        continue;
                    }
                    let id = b >> 4;
                    if id == 15 {
                        break;
                    }
                    let len = (b & 0x0f) as usize + 1;
                    if i + 1 + len > end {
                        return Err(Error::Rtp("extension element overruns block"));
                    }
                    ext_entries.push(ExtEntry {
                        id,
                        id_offset: i,
                        data_len: len as u8,
                    });
                    i += 1 + len;
                }
            }
            header_len = data_start + data_len;
        }

        let mut data = BytesMut::from(raw);
        let total = if has_padding {
            let pad = raw[raw.len() - 1] as usize;
            if pad == 0 || raw.len() < header_len + pad {
                return Err(Error::Rtp("bad padding length"));
            }
            let total = raw.len() - pad;
            data.truncate(total);
            data[0] &= !0x20;
            total
        } else {
            raw.len()
        };
        let payload_len = total - header_len;

        Ok(Self {
            data,
            header_len,
            payload_len,
            ext_entries,
            known: KnownExtIds::default(),
        })
    }

    /// Assemble a packet from parts; used by relays and tests.
    pub fn build(ssrc: u32, payload_type: u8, seq: u16, timestamp: u32, payload: &[u8]) -> Result<Self> {
        Self::build_with_extensions(ssrc, payload_type, seq, timestamp, payload, &[])
    }

    /// Assemble a packet carrying one-byte header extensions `(id, data)`.
    pub fn build_with_extensions(
        ssrc: u32,
        payload_type: u8,
        seq: u16,
        timestamp: u32,
        payload: &[u8],
        extensions: &[(u8, &[u8])],
    ) -> Result<Self> {
        let mut raw = Vec::with_capacity(MIN_HEADER_LEN + payload.len() + 8 * extensions.len());
        let has_ext = !extensions.is_empty();
        raw.push(0x80 | u8::from(has_ext) << 4);
        raw.push(payload_type & 0x7f);
        raw.extend_from_slice(&seq.to_be_bytes());
        raw.extend_from_slice(&timestamp.to_be_bytes());
        raw.extend_from_slice(&ssrc.to_be_bytes());
        if has_ext {
            let mut block = Vec::new();
            for (id, data) in extensions {
                if *id == 0 || *id > 14 || data.is_empty() || data.len() > 16 {
                    return Err(Error::Rtp("invalid one-byte extension element"));
                }
                block.push((id << 4) | (data.len() as u8 - 1));
                block.extend_from_slice(data);
            }
            while block.len() % 4 != 0 {
                block.push(0);
            }
            raw.extend_from_slice(&ONE_BYTE_EXT_PROFILE.to_be_bytes());
            raw.extend_from_slice(&((block.len() / 4) as u16).to_be_bytes());
            raw.extend_from_slice(&block);
        }
        raw.extend_from_slice(payload);
        Self::parse(&raw)
    }

    #[must_use]
    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    pub fn set_ssrc(&mut self, ssrc: u32) {
        self.data[8..12].copy_from_slice(&ssrc.to_be_bytes());
    }

    #[must_use]
    pub fn seq(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn set_seq(&mut self, seq: u16) {
        self.data[2..4].copy_from_slice(&seq.to_be_bytes());
    }

    #[must_use]
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    #[must_use]
    pub fn payload_type(&self) -> u8 {
        self.data[1] & 0x7f
    }

    pub fn set_payload_type(&mut self, payload_type: u8) {
        self.data[1] = (self.data[1] & 0x80) | (payload_type & 0x7f);
    }

    #[must_use]
    pub fn marker(&self) -> bool {
        self.data[1] & 0x80 != 0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Full wire bytes of the packet
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data[self.header_len..self.header_len + self.payload_len]
    }

    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Record which extension id carries the mid in this packet's stream.
    pub fn set_mid_ext_id(&mut self, id: u8) {
        self.known.mid = Some(id);
    }

    pub fn set_tcc_ext_id(&mut self, id: u8) {
        self.known.tcc = Some(id);
    }

    pub fn set_abs_send_time_ext_id(&mut self, id: u8) {
        self.known.abs_send_time = Some(id);
    }

    #[must_use]
    pub fn mid_ext_id(&self) -> Option<u8> {
        self.known.mid
    }

    #[must_use]
    pub fn tcc_ext_id(&self) -> Option<u8> {
        self.known.tcc
    }

    #[must_use]
    pub fn abs_send_time_ext_id(&self) -> Option<u8> {
        self.known.abs_send_time
    }

    /// Rewrite the mid extension to `new_id`, preserving its value.
    pub fn remap_mid_ext(&mut self, new_id: u8) -> bool {
        match self.known.mid {
            Some(old) if old == new_id => true,
            Some(old) => {
                let ok = self.remap_ext_id(old, new_id);
                if ok {
                    self.known.mid = Some(new_id);
                }
                ok
            }
            None => false,
        }
    }

    pub fn remap_tcc_ext(&mut self, new_id: u8) -> bool {
        match self.known.tcc {
            Some(old) if old == new_id => true,
            Some(old) => {
                let ok = self.remap_ext_id(old, new_id);
                if ok {
                    self.known.tcc = Some(new_id);
                }
                ok
            }
            None => false,
        }
    }

    pub fn remap_abs_send_time_ext(&mut self, new_id: u8) -> bool {
        match self.known.abs_send_time {
            Some(old) if old == new_id => true,
            Some(old) => {
                let ok = self.remap_ext_id(old, new_id);
                if ok {
                    self.known.abs_send_time = Some(new_id);
                }
                ok
            }
            None => false,
        }
    }

    fn remap_ext_id(&mut self, old_id: u8, new_id: u8) -> bool {
        if new_id == 0 || new_id > 14 {
            return false;
        }
        for entry in &mut self.ext_entries {
            if entry.id == old_id {
                self.data[entry.id_offset] = (new_id << 4) | (entry.data_len - 1);
                entry.id = new_id;
                return true;
            }
        }
        false
    }

    /// Restore an RTX-wrapped packet to its original stream: recover the
    /// original sequence number from the first two payload bytes and swap in
    /// the primary SSRC and payload type.
    pub fn demux_rtx(&mut self, primary_ssrc: u32, primary_payload_type: u8) -> Result<()> {
        if self.payload_len < 2 {
            return Err(Error::Rtp("RTX payload too short for OSN"));
        }
        let osn = u16::from_be_bytes([
            self.data[self.header_len],
            self.data[self.header_len + 1],
        ]);
        let total = self.header_len + self.payload_len;
        self.data.copy_within(self.header_len + 2..total, self.header_len);
        self.data.truncate(total - 2);
        self.payload_len -= 2;
        self.set_seq(osn);
        self.set_ssrc(primary_ssrc);
        self.set_payload_type(primary_payload_type);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trip() {
        let pkt = RtpPacket::build(100, 96, 7, 90_000, &[1, 2, 3, 4]).unwrap();
        assert_eq!(pkt.ssrc(), 100);
        assert_eq!(pkt.payload_type(), 96);
        assert_eq!(pkt.seq(), 7);
        assert_eq!(pkt.timestamp(), 90_000);
        assert_eq!(pkt.payload(), &[1, 2, 3, 4]);

        let reparsed = RtpPacket::parse(pkt.data()).unwrap();
        assert_eq!(reparsed.payload(), pkt.payload());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(RtpPacket::parse(&[0x80, 96, 0]).is_err());
        let mut bad_version = RtpPacket::build(1, 96, 0, 0, &[0]).unwrap().data().to_vec();
        bad_version[0] = 0x40;
        assert!(RtpPacket::parse(&bad_version).is_err());
    }

    #[test]
    fn padding_is_stripped() {
        let mut raw = RtpPacket::build(5, 96, 1, 0, &[9, 9]).unwrap().data().to_vec();
        raw[0] |= 0x20;
        raw.extend_from_slice(&[0, 0, 3]);
        let pkt = RtpPacket::parse(&raw).unwrap();
        assert_eq!(pkt.payload(), &[9, 9]);
        assert_eq!(pkt.data().len(), 14);
        assert_eq!(pkt.data()[0] & 0x20, 0);
    }

    #[test]
    fn extension_id_remap_preserves_value() {
        let pkt = RtpPacket::build_with_extensions(1, 96, 1, 0, &[1], &[(3, &[0xaa, 0xbb])])
            .unwrap();
        let mut pkt = pkt;
        pkt.set_tcc_ext_id(3);
        assert!(pkt.remap_tcc_ext(7));

        let reparsed = RtpPacket::parse(pkt.data()).unwrap();
        // id byte now carries 7, the two value bytes are untouched
        let ext_byte = reparsed.data()[16];
        assert_eq!(ext_byte >> 4, 7);
        assert_eq!(ext_byte & 0x0f, 1);
        assert_eq!(&reparsed.data()[17..19], &[0xaa, 0xbb]);
    }

    #[test]
    fn remap_fails_without_matching_entry() {
        let mut pkt = RtpPacket::build(1, 96, 1, 0, &[1]).unwrap();
        pkt.set_mid_ext_id(4);
        assert!(!pkt.remap_mid_ext(2));
    }

    #[test]
    fn rtx_demux_restores_original() {
        // RTX payload: OSN 513 followed by the original payload
        let mut payload = 513u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[7, 8, 9]);
        let mut pkt = RtpPacket::build(101, 97, 9000, 0, &payload).unwrap();
        pkt.demux_rtx(100, 96).unwrap();
        assert_eq!(pkt.ssrc(), 100);
        assert_eq!(pkt.payload_type(), 96);
        assert_eq!(pkt.seq(), 513);
        assert_eq!(pkt.payload(), &[7, 8, 9]);
    }

    #[test]
    fn rtx_demux_rejects_short_payload() {
        let mut pkt = RtpPacket::build(101, 97, 9000, 0, &[1]).unwrap();
        assert!(pkt.demux_rtx(100, 96).is_err());
    }
}
