//! Minimal SDP session model
//!
//! Covers exactly what the room controller consumes from offer/answer
//! exchange: media sections with codecs, ssrc advertisements, header
//! extension mappings, direction/setup, ICE credentials and grafted
//! candidates. Rendering is deterministic for a given offer and candidate
//! list.

use crate::config::IceCandidateConfig;
use crate::error::{Error, Result};
use crate::param::{AvType, RtpSessionParam};
use std::collections::BTreeMap;
use std::fmt::Write as _;

const MID_EXT_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";
const TCC_EXT_URI: &str = "transport-wide-cc";
const ABS_SEND_TIME_EXT_URI: &str = "abs-send-time";

/// Media-section direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn parse(attr: &str) -> Option<Self> {
        match attr {
            "sendrecv" => Some(Self::SendRecv),
            "sendonly" => Some(Self::SendOnly),
            "recvonly" => Some(Self::RecvOnly),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }

    const fn as_attr(self) -> &'static str {
        match self {
            Self::SendRecv => "sendrecv",
            Self::SendOnly => "sendonly",
            Self::RecvOnly => "recvonly",
            Self::Inactive => "inactive",
        }
    }
}

/// DTLS setup role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setup {
    Active,
    Passive,
    ActPass,
}

impl Setup {
    fn parse(attr: &str) -> Option<Self> {
        match attr {
            "active" => Some(Self::Active),
            "passive" => Some(Self::Passive),
            "actpass" => Some(Self::ActPass),
            _ => None,
        }
    }

    const fn as_attr(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Passive => "passive",
            Self::ActPass => "actpass",
        }
    }
}

/// One negotiated codec within a media section
#[derive(Debug, Clone)]
pub struct MediaCodec {
    pub payload_type: u8,
    pub codec_name: String,
    pub clock_rate: u32,
    pub channel: Option<u16>,
    pub fmtp_param: String,
    pub rtcp_features: Vec<String>,
    pub rtx_payload_type: Option<u8>,
}

/// One advertised synchronization source
#[derive(Debug, Clone)]
pub struct SsrcInfo {
    pub ssrc: u32,
    pub cname: String,
    pub stream_id: String,
    pub is_main: bool,
}

/// One ICE candidate line
#[derive(Debug, Clone)]
pub struct IceCandidate {
    pub foundation: String,
    pub ip: String,
    pub port: u16,
    pub net_type: String,
}

/// One m= section
#[derive(Debug, Clone)]
pub struct MediaSection {
    pub av_type: AvType,
    pub mid: Option<String>,
    pub payload_order: Vec<u8>,
    pub codecs: BTreeMap<u8, MediaCodec>,
    /// RTX payload type -> primary payload type (from fmtp apt=)
    pub rtx_apt: BTreeMap<u8, u8>,
    pub direction: Direction,
    pub setup: Option<Setup>,
    pub extmaps: BTreeMap<u8, String>,
    pub ssrc_infos: Vec<SsrcInfo>,
    /// (primary, rtx) FID pairings
    pub ssrc_fid_groups: Vec<(u32, u32)>,
    pub rtcp_mux: bool,
}

impl MediaSection {
    fn new(av_type: AvType) -> Self {
        Self {
            av_type,
            mid: None,
            payload_order: Vec::new(),
            codecs: BTreeMap::new(),
            rtx_apt: BTreeMap::new(),
            direction: Direction::SendRecv,
            setup: None,
            extmaps: BTreeMap::new(),
            ssrc_infos: Vec::new(),
            ssrc_fid_groups: Vec::new(),
            rtcp_mux: false,
        }
    }

    /// First payload type on the m= line with an rtpmap that is not RTX
    fn primary_codec(&self) -> Option<&MediaCodec> {
        self.payload_order
            .iter()
            .find_map(|pt| self.codecs.get(pt))
    }

    fn main_ssrc(&self) -> Option<&SsrcInfo> {
        self.ssrc_infos
            .iter()
            .find(|s| s.is_main)
            .or_else(|| self.ssrc_infos.first())
    }

    fn rtx_ssrc_for(&self, primary: u32) -> u32 {
        self.ssrc_fid_groups
            .iter()
            .find(|(p, _)| *p == primary)
            .map_or(0, |(_, r)| *r)
    }

    fn ext_id_for(&self, uri_fragment: &str) -> Option<u8> {
        self.extmaps
            .iter()
            .find(|(_, uri)| uri.contains(uri_fragment))
            .map(|(id, _)| *id)
    }

    /// Negotiated extension id carrying the mid, if any
    #[must_use]
    pub fn mid_ext_id(&self) -> Option<u8> {
        self.ext_id_for(MID_EXT_URI)
    }

    #[must_use]
    pub fn tcc_ext_id(&self) -> Option<u8> {
        self.ext_id_for(TCC_EXT_URI)
    }

    #[must_use]
    pub fn abs_send_time_ext_id(&self) -> Option<u8> {
        self.ext_id_for(ABS_SEND_TIME_EXT_URI)
    }
}

/// Parsed SDP session description
#[derive(Debug, Clone)]
pub struct RtcSdp {
    pub sdp_type: String,
    pub ice_ufrag: Option<String>,
    pub ice_pwd: Option<String>,
    /// "algorithm hex" as it appeared after `a=fingerprint:`
    pub fingerprint: Option<String>,
    pub media: Vec<MediaSection>,
    pub ice_candidates: Vec<IceCandidate>,
}

/// Parameters for deriving an answer from an offer
#[derive(Debug, Clone)]
pub struct AnswerOptions {
    pub setup: Setup,
    pub direction: Direction,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub fingerprint: String,
}

struct RawRtpMap {
    name: String,
    clock_rate: u32,
    channel: Option<u16>,
}

impl RtcSdp {
    pub fn parse(sdp_type: &str, raw: &str) -> Result<Self> {
        let mut sdp = Self {
            sdp_type: sdp_type.to_string(),
            ice_ufrag: None,
            ice_pwd: None,
            fingerprint: None,
            media: Vec::new(),
            ice_candidates: Vec::new(),
        };
        let mut rtpmaps: Vec<BTreeMap<u8, RawRtpMap>> = Vec::new();
        let mut fmtps: Vec<BTreeMap<u8, String>> = Vec::new();
        let mut fbs: Vec<BTreeMap<u8, Vec<String>>> = Vec::new();

        for line in raw.lines() {
            let line = line.trim_end();
            if line.len() < 2 {
                continue;
            }
            let (kind, value) = line.split_at(2);
            match kind {
                "m=" => {
                    let mut parts = value.split_whitespace();
                    let av_type = match parts.next() {
                        Some("audio") => AvType::Audio,
                        Some("video") => AvType::Video,
                        _ => AvType::Unknown,
                    };
                    let mut section = MediaSection::new(av_type);
                    section.payload_order = parts
                        .skip(2)
                        .filter_map(|pt| pt.parse::<u8>().ok())
                        .collect();
                    sdp.media.push(section);
                    rtpmaps.push(BTreeMap::new());
                    fmtps.push(BTreeMap::new());
                    fbs.push(BTreeMap::new());
                }
                "a=" => {
                    let (attr, val) = match value.split_once(':') {
                        Some((a, v)) => (a, v),
                        None => (value, ""),
                    };
                    if let Some(section) = sdp.media.last_mut() {
                        match attr {
                            "mid" => section.mid = Some(val.to_string()),
                            "rtpmap" => {
                                if let Some((pt, encoding)) = val.split_once(' ') {
                                    if let (Ok(pt), Some(map)) =
                                        (pt.parse::<u8>(), parse_rtpmap(encoding))
                                    {
                                        if let Some(maps) = rtpmaps.last_mut() {
                                            maps.insert(pt, map);
                                        }
                                    }
                                }
                            }
                            "fmtp" => {
                                if let Some((pt, params)) = val.split_once(' ') {
                                    if let Ok(pt) = pt.parse::<u8>() {
                                        if let Some(list) = fmtps.last_mut() {
                                            list.insert(pt, params.to_string());
                                        }
                                    }
                                }
                            }
                            "rtcp-fb" => {
                                if let Some((pt, feature)) = val.split_once(' ') {
                                    if let Ok(pt) = pt.parse::<u8>() {
                                        if let Some(list) = fbs.last_mut() {
                                            list.entry(pt)
                                                .or_default()
                                                .push(feature.to_string());
                                        }
                                    }
                                }
                            }
                            "extmap" => {
                                if let Some((id, uri)) = val.split_once(' ') {
                                    if let Ok(id) = id.parse::<u8>() {
                                        section.extmaps.insert(id, uri.to_string());
                                    }
                                }
                            }
                            "ssrc" => parse_ssrc_line(section, val),
                            "ssrc-group" => {
                                let mut parts = val.split_whitespace();
                                if parts.next() == Some("FID") {
                                    let primary = parts.next().and_then(|s| s.parse().ok());
                                    let rtx = parts.next().and_then(|s| s.parse().ok());
                                    if let (Some(p), Some(r)) = (primary, rtx) {
                                        section.ssrc_fid_groups.push((p, r));
                                    }
                                }
                            }
                            "setup" => section.setup = Setup::parse(val),
                            "rtcp-mux" => section.rtcp_mux = true,
                            "ice-ufrag" => {
                                sdp.ice_ufrag.get_or_insert_with(|| val.to_string());
                            }
                            "ice-pwd" => {
                                sdp.ice_pwd.get_or_insert_with(|| val.to_string());
                            }
                            "fingerprint" => {
                                sdp.fingerprint.get_or_insert_with(|| val.to_string());
                            }
                            _ => {
                                if let Some(direction) = Direction::parse(attr) {
                                    section.direction = direction;
                                }
                            }
                        }
                    } else {
                        match attr {
                            "ice-ufrag" => sdp.ice_ufrag = Some(val.to_string()),
                            "ice-pwd" => sdp.ice_pwd = Some(val.to_string()),
                            "fingerprint" => sdp.fingerprint = Some(val.to_string()),
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }

        if sdp.media.is_empty() {
            return Err(Error::Sdp("no media sections".to_string()));
        }

        for (i, section) in sdp.media.iter_mut().enumerate() {
            finalize_section(section, &rtpmaps[i], &fmtps[i], &fbs[i]);
        }
        Ok(sdp)
    }

    /// Derive the answer skeleton: same media layout as the offer, local
    /// credentials, forced setup and direction, no candidates yet.
    #[must_use]
    pub fn answer(&self, opts: &AnswerOptions) -> Self {
        let mut answer = self.clone();
        answer.sdp_type = "answer".to_string();
        answer.ice_ufrag = Some(opts.ice_ufrag.clone());
        answer.ice_pwd = Some(opts.ice_pwd.clone());
        answer.fingerprint = Some(opts.fingerprint.clone());
        answer.ice_candidates.clear();
        for section in &mut answer.media {
            section.setup = Some(opts.setup);
            section.direction = opts.direction;
        }
        answer
    }

    /// Graft the configured server candidates into this description.
    pub fn add_candidates(&mut self, candidates: &[IceCandidateConfig]) {
        for (i, candidate) in candidates.iter().enumerate() {
            self.ice_candidates.push(IceCandidate {
                foundation: format!("{}", 10_000_001 + i as u32),
                ip: candidate.ip.clone(),
                port: candidate.port,
                net_type: candidate.net_type.clone(),
            });
        }
    }

    /// Extract the per-stream negotiation result of every usable media
    /// section (one advertised main SSRC and a recognized primary codec).
    #[must_use]
    pub fn rtp_session_params(&self) -> Vec<RtpSessionParam> {
        let mut params = Vec::new();
        for section in &self.media {
            if section.av_type == AvType::Unknown {
                continue;
            }
            let Some(codec) = section.primary_codec() else {
                continue;
            };
            let Some(main) = section.main_ssrc() else {
                continue;
            };
            let rtx_ssrc = section.rtx_ssrc_for(main.ssrc);
            let use_nack = codec
                .rtcp_features
                .iter()
                .any(|f| f.split_whitespace().next() == Some("nack"));
            let key_request = codec.rtcp_features.iter().any(|f| f.contains("pli"));
            params.push(RtpSessionParam {
                av_type: section.av_type,
                mid: section.mid.as_deref().and_then(|m| m.parse().ok()),
                codec: codec.codec_name.clone(),
                fmtp_param: codec.fmtp_param.clone(),
                rtcp_features: codec.rtcp_features.clone(),
                channel: codec.channel,
                ssrc: main.ssrc,
                payload_type: codec.payload_type,
                clock_rate: codec.clock_rate,
                rtx_ssrc,
                rtx_payload_type: codec.rtx_payload_type.unwrap_or(0),
                use_nack,
                key_request,
                mid_ext_id: section.ext_id_for(MID_EXT_URI),
                tcc_ext_id: section.ext_id_for(TCC_EXT_URI),
                abs_send_time_ext_id: section.ext_id_for(ABS_SEND_TIME_EXT_URI),
            });
        }
        params
    }

    /// Rewrite media sections from the subscriber's pullers: sendonly
    /// direction, the publisher's SSRCs and codec replacing whatever the
    /// offer carried.
    pub fn apply_puller_params(&mut self, params: &[RtpSessionParam]) {
        for param in params {
            for section in &mut self.media {
                if section.av_type != param.av_type {
                    continue;
                }
                section.direction = Direction::SendOnly;
                let stream_id = format!("stream_{}", param.ssrc);
                section.ssrc_infos = vec![SsrcInfo {
                    ssrc: param.ssrc,
                    cname: format!("cname_{}", param.ssrc),
                    stream_id: stream_id.clone(),
                    is_main: true,
                }];
                section.ssrc_fid_groups.clear();
                if param.rtx_ssrc != 0 {
                    section.ssrc_infos.push(SsrcInfo {
                        ssrc: param.rtx_ssrc,
                        cname: format!("cname_{}", param.rtx_ssrc),
                        stream_id,
                        is_main: false,
                    });
                    section.ssrc_fid_groups.push((param.ssrc, param.rtx_ssrc));
                }
                section.codecs.clear();
                section.rtx_apt.clear();
                section.payload_order = vec![param.payload_type];
                section.codecs.insert(
                    param.payload_type,
                    MediaCodec {
                        payload_type: param.payload_type,
                        codec_name: param.codec.clone(),
                        clock_rate: param.clock_rate,
                        channel: param.channel,
                        fmtp_param: param.fmtp_param.clone(),
                        rtcp_features: param.rtcp_features.clone(),
                        rtx_payload_type: (param.rtx_payload_type != 0)
                            .then_some(param.rtx_payload_type),
                    },
                );
                if param.rtx_payload_type != 0 {
                    section.payload_order.push(param.rtx_payload_type);
                    section
                        .rtx_apt
                        .insert(param.rtx_payload_type, param.payload_type);
                }
            }
        }
    }

    /// Render the description. Deterministic for identical content.
    #[must_use]
    pub fn to_sdp_string(&self) -> String {
        let mut out = String::new();
        out.push_str("v=0\r\n");
        out.push_str("o=- 0 2 IN IP4 127.0.0.1\r\n");
        out.push_str("s=-\r\n");
        out.push_str("t=0 0\r\n");
        let mids: Vec<&str> = self
            .media
            .iter()
            .filter_map(|m| m.mid.as_deref())
            .collect();
        if !mids.is_empty() {
            let _ = writeln!(out, "a=group:BUNDLE {}\r", mids.join(" "));
        }
        out.push_str("a=msid-semantic: WMS\r\n");

        for section in &self.media {
            let kind = match section.av_type {
                AvType::Audio => "audio",
                AvType::Video => "video",
                AvType::Unknown => "application",
            };
            let pts: Vec<String> = section
                .payload_order
                .iter()
                .map(|pt| pt.to_string())
                .collect();
            let _ = writeln!(out, "m={kind} 9 UDP/TLS/RTP/SAVPF {}\r", pts.join(" "));
            out.push_str("c=IN IP4 0.0.0.0\r\n");
            out.push_str("a=rtcp:9 IN IP4 0.0.0.0\r\n");
            if let Some(ufrag) = &self.ice_ufrag {
                let _ = writeln!(out, "a=ice-ufrag:{ufrag}\r");
            }
            if let Some(pwd) = &self.ice_pwd {
                let _ = writeln!(out, "a=ice-pwd:{pwd}\r");
            }
            if let Some(fingerprint) = &self.fingerprint {
                let _ = writeln!(out, "a=fingerprint:{fingerprint}\r");
            }
            if let Some(setup) = section.setup {
                let _ = writeln!(out, "a=setup:{}\r", setup.as_attr());
            }
            if let Some(mid) = &section.mid {
                let _ = writeln!(out, "a=mid:{mid}\r");
            }
            for (id, uri) in &section.extmaps {
                let _ = writeln!(out, "a=extmap:{id} {uri}\r");
            }
            let _ = writeln!(out, "a={}\r", section.direction.as_attr());
            if section.rtcp_mux {
                out.push_str("a=rtcp-mux\r\n");
            }
            for pt in &section.payload_order {
                if let Some(codec) = section.codecs.get(pt) {
                    match codec.channel {
                        Some(ch) => {
                            let _ = writeln!(
                                out,
                                "a=rtpmap:{pt} {}/{}/{ch}\r",
                                codec.codec_name, codec.clock_rate
                            );
                        }
                        None => {
                            let _ = writeln!(
                                out,
                                "a=rtpmap:{pt} {}/{}\r",
                                codec.codec_name, codec.clock_rate
                            );
                        }
                    }
                    for feature in &codec.rtcp_features {
                        let _ = writeln!(out, "a=rtcp-fb:{pt} {feature}\r");
                    }
                    if !codec.fmtp_param.is_empty() {
                        let _ = writeln!(out, "a=fmtp:{pt} {}\r", codec.fmtp_param);
                    }
                } else if let Some(primary_pt) = section.rtx_apt.get(pt) {
                    let clock_rate = section
                        .codecs
                        .get(primary_pt)
                        .map_or(90_000, |c| c.clock_rate);
                    let _ = writeln!(out, "a=rtpmap:{pt} rtx/{clock_rate}\r");
                    let _ = writeln!(out, "a=fmtp:{pt} apt={primary_pt}\r");
                }
            }
            for (primary, rtx) in &section.ssrc_fid_groups {
                let _ = writeln!(out, "a=ssrc-group:FID {primary} {rtx}\r");
            }
            for info in &section.ssrc_infos {
                let _ = writeln!(out, "a=ssrc:{} cname:{}\r", info.ssrc, info.cname);
                let _ = writeln!(
                    out,
                    "a=ssrc:{} msid:{} {}\r",
                    info.ssrc, info.stream_id, info.stream_id
                );
            }
            for candidate in &self.ice_candidates {
                let _ = writeln!(
                    out,
                    "a=candidate:{} 1 {} 10001 {} {} typ host\r",
                    candidate.foundation, candidate.net_type, candidate.ip, candidate.port
                );
            }
        }
        out
    }
}

fn parse_rtpmap(encoding: &str) -> Option<RawRtpMap> {
    let mut parts = encoding.split('/');
    let name = parts.next()?.to_string();
    let clock_rate = parts.next()?.parse().ok()?;
    let channel = parts.next().and_then(|c| c.parse().ok());
    Some(RawRtpMap {
        name,
        clock_rate,
        channel,
    })
}

fn parse_ssrc_line(section: &mut MediaSection, val: &str) {
    let Some((ssrc, rest)) = val.split_once(' ') else {
        return;
    };
    let Ok(ssrc) = ssrc.parse::<u32>() else {
        return;
    };
    let idx = match section.ssrc_infos.iter().position(|s| s.ssrc == ssrc) {
        Some(idx) => idx,
        None => {
            let is_main = !section
                .ssrc_fid_groups
                .iter()
                .any(|(_, rtx)| *rtx == ssrc)
                && section.ssrc_infos.is_empty();
            section.ssrc_infos.push(SsrcInfo {
                ssrc,
                cname: String::new(),
                stream_id: String::new(),
                is_main,
            });
            section.ssrc_infos.len() - 1
        }
    };
    let entry = &mut section.ssrc_infos[idx];
    if let Some((key, value)) = rest.split_once(':') {
        match key {
            "cname" => entry.cname = value.to_string(),
            "msid" => {
                entry.stream_id = value
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_string();
            }
            _ => {}
        }
    }
}

fn finalize_section(
    section: &mut MediaSection,
    rtpmaps: &BTreeMap<u8, RawRtpMap>,
    fmtps: &BTreeMap<u8, String>,
    fbs: &BTreeMap<u8, Vec<String>>,
) {
    // resolve apt pairings first so rtx payload types never become codecs
    for (pt, params) in fmtps {
        if let Some(apt) = params
            .split(';')
            .find_map(|kv| kv.trim().strip_prefix("apt="))
            .and_then(|v| v.parse::<u8>().ok())
        {
            section.rtx_apt.insert(*pt, apt);
        }
    }
    for (pt, map) in rtpmaps {
        if map.name.eq_ignore_ascii_case("rtx") {
            continue;
        }
        let rtx_payload_type = section
            .rtx_apt
            .iter()
            .find(|(_, primary)| **primary == *pt)
            .map(|(rtx, _)| *rtx);
        section.codecs.insert(
            *pt,
            MediaCodec {
                payload_type: *pt,
                codec_name: map.name.clone(),
                clock_rate: map.clock_rate,
                channel: map.channel,
                fmtp_param: fmtps.get(pt).cloned().unwrap_or_default(),
                rtcp_features: fbs.get(pt).cloned().unwrap_or_default(),
                rtx_payload_type,
            },
        );
    }
    // fix up is_main now that FID pairings are known
    for info in &mut section.ssrc_infos {
        info.is_main = !section
            .ssrc_fid_groups
            .iter()
            .any(|(_, rtx)| *rtx == info.ssrc);
    }
}
