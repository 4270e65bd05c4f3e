
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Media kind of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Depth,
}

impl MediaKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            "depth" => Some(MediaKind::Depth),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Depth => "depth",
        }
    }

    /// Video-like kinds are the ones that can carry keyframes and therefore
    /// participate in full-frame (PLI/FIR) signalling.
    pub fn is_visual(&self) -> bool {
        matches!(self, MediaKind::Video | MediaKind::Depth)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single RTCP feedback mechanism a codec supports (`nack`, `nack pli`,
/// `ccm fir`, `goog-remb`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

/// A negotiated media codec inside [`RtpParameters`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpCodecParameters {
    /// Full mime-style name, e.g. `audio/opus` or `video/VP8`.
    pub name: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
}

impl RtpCodecParameters {
    /// Whether this codec is an instance of the given capability.
    ///
    /// Name comparison is case-insensitive; the clock rate must match and,
    /// when both sides declare channels, they must agree.
    pub fn matches_capability(&self, capability: &RtpCodecCapability) -> bool {
        if !self.name.eq_ignore_ascii_case(&capability.name) {
            return false;
        }
        if self.clock_rate != capability.clock_rate {
            return false;
        }
        match (self.channels, capability.channels) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// Forward error correction side stream of an encoding.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpFecParameters {
    pub mechanism: String,
    pub ssrc: u32,
}

/// Retransmission side stream of an encoding.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpRtxParameters {
    pub ssrc: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpEncodingParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    /// Payload type of the codec this encoding uses. Absent means the first
    /// codec in the parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec_payload_type: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fec: Option<RtpFecParameters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtx: Option<RtpRtxParameters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpHeaderExtensionParameters {
    pub uri: String,
    pub id: u16,
}

/// RTCP-related parameters of a stream.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtcpParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
}

/// Negotiated RTP parameters of a producer or consumer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mux_id: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
    pub rtcp: RtcpParameters,
}

impl RtpParameters {
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Drop codecs the given capabilities do not support, together with the
    /// encodings that referenced them.
    ///
    /// Encodings without an explicit `codecPayloadType` use the first codec
    /// and survive as long as any codec survives.
    pub fn reduce_codecs_and_encodings(&mut self, capabilities: &RtpCapabilities) {
        self.codecs.retain(|codec| {
            capabilities
                .codecs
                .iter()
                .any(|capability| codec.matches_capability(capability))
        });

        let kept: Vec<u8> = self.codecs.iter().map(|c| c.payload_type).collect();
        let any_codec_left = !self.codecs.is_empty();

        self.encodings.retain(|encoding| match encoding.codec_payload_type {
            Some(payload_type) => kept.contains(&payload_type),
            None => any_codec_left,
        });
    }

    /// Drop header extensions not present (by URI) in the supported set.
    pub fn reduce_header_extensions(&mut self, supported: &[RtpHeaderExtension]) {
        self.header_extensions
            .retain(|extension| supported.iter().any(|s| s.uri == extension.uri));
    }

    /// All SSRC values these parameters declare: primary, FEC and RTX,
    /// in encoding order.
    pub fn ssrcs(&self) -> Vec<u32> {
        let mut ssrcs = Vec::new();
        for encoding in &self.encodings {
            if let Some(ssrc) = encoding.ssrc {
                ssrcs.push(ssrc);
            }
            if let Some(fec) = &encoding.fec {
                ssrcs.push(fec.ssrc);
            }
            if let Some(rtx) = &encoding.rtx {
                ssrcs.push(rtx.ssrc);
            }
        }
        ssrcs
    }

    /// Primary (media) SSRCs only, one per encoding that declares one.
    pub fn media_ssrcs(&self) -> Vec<u32> {
        self.encodings.iter().filter_map(|e| e.ssrc).collect()
    }

    /// Clock rate of the codec the given encoding uses.
    pub fn clock_rate_for(&self, encoding: &RtpEncodingParameters) -> Option<u32> {
        let codec = match encoding.codec_payload_type {
            Some(payload_type) => self.codecs.iter().find(|c| c.payload_type == payload_type),
            None => self.codecs.first(),
        };
        codec.map(|c| c.clock_rate)
    }
}

/// A codec a peer (or room) is able to receive.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpCodecCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
}

/// A supported RFC 5285 header extension.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpHeaderExtension {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
    pub uri: String,
    pub preferred_id: u16,
}

/// Receive capabilities declared once per peer and intersected with the
/// room capabilities by the listener.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<RtpHeaderExtension>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fec_mechanisms: Vec<String>,
}

impl RtpCapabilities {
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
