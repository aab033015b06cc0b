//! Per-stream negotiation results and their wire schema
//!
//! `RtpSessionParam` carries everything a single negotiated RTP stream needs:
//! media kind, SSRCs, payload types, codec, RTX pairing, feedback flags and
//! header-extension ids. It serializes to a stable JSON schema shared with
//! the pilot and with peer instances, so field names and omission rules here
//! must not change.

use crate::types::{PusherId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Media kind of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AvType {
    Audio,
    Video,
    #[serde(other)]
    #[default]
    Unknown,
}

impl AvType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for AvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Negotiation result for a single RTP stream
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RtpSessionParam {
    pub av_type: AvType,
    /// Media-section mid; negotiated locally, never part of the wire schema
    #[serde(skip)]
    pub mid: Option<i32>,
    pub codec: String,
    pub fmtp_param: String,
    /// SDP rtcp-fb tokens ("nack", "pli", ...)
    pub rtcp_features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u16>,
    pub ssrc: u32,
    pub payload_type: u8,
    pub clock_rate: u32,
    /// 0 = stream has no RTX pairing
    pub rtx_ssrc: u32,
    pub rtx_payload_type: u8,
    pub use_nack: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub key_request: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid_ext_id: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcc_ext_id: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abs_send_time_ext_id: Option<u8>,
}

impl RtpSessionParam {
    /// True when `ssrc` is this stream's primary or RTX source
    #[must_use]
    pub fn owns_ssrc(&self, ssrc: u32) -> bool {
        ssrc == self.ssrc || (self.rtx_ssrc != 0 && ssrc == self.rtx_ssrc)
    }
}

/// One advertised published stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushInfo {
    pub pusher_id: PusherId,
    pub rtp_param: RtpSessionParam,
}

/// A subscription request: which of `target_user_id`'s streams
/// `src_user_id` wants to receive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestInfo {
    /// The publishing user
    pub target_user_id: UserId,
    /// The subscribing user
    pub src_user_id: UserId,
    pub room_id: RoomId,
    pub pushers: Vec<PushInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_param() -> RtpSessionParam {
        RtpSessionParam {
            av_type: AvType::Video,
            mid: Some(0),
            codec: "H264".to_string(),
            fmtp_param: "profile-level-id=42e01f;packetization-mode=1".to_string(),
            rtcp_features: vec!["nack".to_string(), "pli".to_string()],
            channel: None,
            ssrc: 12_345_678,
            payload_type: 96,
            clock_rate: 90_000,
            rtx_ssrc: 87_654_321,
            rtx_payload_type: 97,
            use_nack: true,
            key_request: true,
            mid_ext_id: Some(1),
            tcc_ext_id: Some(3),
            abs_send_time_ext_id: None,
        }
    }

    #[test]
    fn video_param_round_trip() {
        let param = video_param();
        let json = serde_json::to_value(&param).unwrap();
        assert_eq!(json["av_type"], "video");
        assert_eq!(json["codec"], "H264");
        assert_eq!(json["ssrc"], 12_345_678);
        assert_eq!(json["mid_ext_id"], 1);
        // mid is local state, never serialized
        assert!(json.get("mid").is_none());

        let back: RtpSessionParam = serde_json::from_value(json).unwrap();
        // mid does not survive the wire, everything else must
        let mut expected = param;
        expected.mid = None;
        assert_eq!(back, expected);
    }

    #[test]
    fn audio_param_omits_optional_fields() {
        let param = RtpSessionParam {
            av_type: AvType::Audio,
            codec: "opus".to_string(),
            fmtp_param: "minptime=10;useinbandfec=1".to_string(),
            rtcp_features: vec!["nack".to_string()],
            channel: Some(2),
            ssrc: 23_456_789,
            payload_type: 111,
            clock_rate: 48_000,
            use_nack: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&param).unwrap();
        assert_eq!(json["channel"], 2);
        assert!(json.get("key_request").is_none());
        assert!(json.get("mid_ext_id").is_none());
        assert!(json.get("tcc_ext_id").is_none());
        assert!(json.get("abs_send_time_ext_id").is_none());
        // rtx fields are always present, 0 meaning "no RTX"
        assert_eq!(json["rtx_ssrc"], 0);

        let back: RtpSessionParam = serde_json::from_value(json).unwrap();
        assert_eq!(back, param);
    }

    #[test]
    fn unknown_av_type_tolerated() {
        let json = serde_json::json!({
            "av_type": "subtitle",
            "codec": "x",
            "fmtp_param": "",
            "rtcp_features": [],
            "ssrc": 1u32,
            "payload_type": 0u8,
            "clock_rate": 90000u32,
            "rtx_ssrc": 0u32,
            "rtx_payload_type": 0u8,
            "use_nack": false
        });
        let param: RtpSessionParam = serde_json::from_value(json).unwrap();
        assert_eq!(param.av_type, AvType::Unknown);
    }

    #[test]
    fn push_info_wire_keys() {
        let info = PushInfo {
            pusher_id: PusherId::new("p-1"),
            rtp_param: video_param(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["pusherId"], "p-1");
        assert!(json["rtpParam"].is_object());

        let back: PushInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back.pusher_id, info.pusher_id);
        assert_eq!(back.rtp_param.ssrc, info.rtp_param.ssrc);
    }
}
