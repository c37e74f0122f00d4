// RTP parameter types for the SFU
//
// These mirror the JSON shapes exchanged with WebRTC clients. Fields the
// control plane never inspects are carried through untouched in `extra`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::MediaKind;

/// Codec parameters (`profile-level-id`, `useinbandfec`, ...)
pub type CodecParameterMap = BTreeMap<String, Value>;

/// A codec the router is able to route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    /// Media kind
    pub kind: MediaKind,
    /// MIME type (`audio/opus`, `video/VP8`, ...)
    pub mime_type: String,
    /// Payload type assigned by the router
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    /// Clock rate in Hz
    pub clock_rate: u32,
    /// Audio channel count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    /// Codec specific parameters
    #[serde(default)]
    pub parameters: CodecParameterMap,
    /// RTCP feedback mechanisms
    #[serde(default)]
    pub rtcp_feedback: Vec<Value>,
}

impl RtpCodecCapability {
    /// Whether the given MIME type, clock rate and (for audio) channel count
    /// describe this codec
    pub fn matches(&self, mime_type: &str, clock_rate: u32, channels: Option<u8>) -> bool {
        if !self.mime_type.eq_ignore_ascii_case(mime_type) || self.clock_rate != clock_rate {
            return false;
        }
        match self.kind {
            MediaKind::Audio => self.channels.unwrap_or(1) == channels.unwrap_or(1),
            MediaKind::Video => true,
        }
    }
}

/// Capabilities of a router or a receiving endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    /// Supported codecs
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    /// Supported RTP header extensions
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

/// Negotiated codec inside `RtpParameters`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    /// MIME type
    pub mime_type: String,
    /// Payload type
    pub payload_type: u8,
    /// Clock rate in Hz
    pub clock_rate: u32,
    /// Audio channel count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    /// Codec specific parameters
    #[serde(default)]
    pub parameters: CodecParameterMap,
    /// RTCP feedback mechanisms
    #[serde(default)]
    pub rtcp_feedback: Vec<Value>,
}

/// One encoding (simulcast stream or single stream)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalability_mode: Option<String>,
    /// Anything else (`rtx`, `dtx`, `codecPayloadType`, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// RTP parameters of a producer or consumer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
    /// Anything else the client sent (`rtcp`, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RtpParameters {
    /// The media codec (first entry that is not a retransmission codec)
    pub fn media_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs
            .iter()
            .find(|codec| !codec.mime_type.to_ascii_lowercase().ends_with("/rtx"))
    }
}
