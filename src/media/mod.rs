// Media description module for the SFU
//
// This module holds the media vocabulary shared by the engine, the registry and
// the signaling protocol: track kinds, RTP parameter types and the fixed codec
// capability set advertised by every router.

pub mod codec;
pub mod rtp;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use rtp::{
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters,
    RtpParameters,
};

/// Room identifier (client supplied)
pub type RoomId = String;

/// Worker identifier
pub type WorkerId = String;

/// Router identifier
pub type RouterId = String;

/// Transport identifier
pub type TransportId = String;

/// Producer identifier
pub type ProducerId = String;

/// Consumer identifier
pub type ConsumerId = String;

/// Media track kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Generate a fresh engine-side identifier
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
