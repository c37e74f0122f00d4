// Media codec module for the SFU
//
// This module defines the fixed codec capability set every router is created
// with: Opus for audio, VP8 and H.264 (constrained baseline) for video.

use serde_json::json;

use super::{rtp::CodecParameterMap, MediaKind, RtpCodecCapability};

/// First dynamic payload type handed out by routers
pub const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

fn parameters(pairs: &[(&str, serde_json::Value)]) -> CodecParameterMap {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

/// Codecs advertised by every router
pub fn media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: parameters(&[
                ("maxPlaybackRate", json!(48000)),
                ("stereo", json!(1)),
                ("useinbandfec", json!(1)),
            ]),
            rtcp_feedback: Vec::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: parameters(&[("x-google-start-bitrate", json!(1000))]),
            rtcp_feedback: Vec::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: parameters(&[
                ("x-google-start-bitrate", json!(1000)),
                ("x-google-max-bitrate", json!(3000)),
                ("profile-level-id", json!("42e01f")),
            ]),
            rtcp_feedback: Vec::new(),
        },
    ]
}

/// Assign payload types and default RTCP feedback to a codec list, producing
/// the router's advertised capabilities
pub fn assign_payload_types(codecs: &[RtpCodecCapability]) -> Vec<RtpCodecCapability> {
    codecs
        .iter()
        .enumerate()
        .map(|(index, codec)| {
            let mut codec = codec.clone();
            if codec.preferred_payload_type.is_none() {
                codec.preferred_payload_type = Some(FIRST_DYNAMIC_PAYLOAD_TYPE + index as u8);
            }
            if codec.rtcp_feedback.is_empty() {
                codec.rtcp_feedback = match codec.kind {
                    MediaKind::Audio => vec![json!({ "type": "transport-cc" })],
                    MediaKind::Video => vec![
                        json!({ "type": "nack" }),
                        json!({ "type": "nack", "parameter": "pli" }),
                        json!({ "type": "ccm", "parameter": "fir" }),
                        json!({ "type": "goog-remb" }),
                        json!({ "type": "transport-cc" }),
                    ],
                };
            }
            codec
        })
        .collect()
}
