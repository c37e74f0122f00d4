// Live SFU control plane
//
// This library implements the control plane of a WebRTC Selective Forwarding
// Unit (SFU): a broadcaster publishes into a room, viewers consume from it, a
// viewer may be promoted to a call-in producer, and the room's media can be
// bridged into an external HLS transcoder.

pub mod engine;
pub mod media;
pub mod worker;
pub mod room;
pub mod session;
pub mod bandwidth;
pub mod transport;
pub mod simulcast;
pub mod signaling;
pub mod transcode;
pub mod presence;
pub mod sfu;

/// Error types for the SFU
pub mod error {
    use serde::{Deserialize, Serialize};
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum SfuError {
        #[error("{0} not found")]
        NotFound(String),

        #[error("Invalid parameters: {0}")]
        InvalidParameters(String),

        #[error("Cannot consume producer {0} with the given capabilities")]
        CapabilityMismatch(String),

        #[error("Media engine error: {0}")]
        Engine(String),

        #[error("External process error: {0}")]
        ExternalProcess(String),

        #[error("Timed out waiting for {0}")]
        Timeout(String),

        #[error("Room {0} is full")]
        RoomFull(String),

        #[error("Signaling error: {0}")]
        Signaling(String),

        #[error("Presence store error: {0}")]
        Presence(#[from] redis::RedisError),

        #[error("JSON error: {0}")]
        Json(#[from] serde_json::Error),

        #[error("WebSocket error: {0}")]
        WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

        #[error("IO error: {0}")]
        Io(#[from] std::io::Error),
    }

    /// Error code carried by `error` events on the signaling channel
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub enum ErrorCode {
        NotFound,
        InvalidParameters,
        CapabilityMismatch,
        EngineFailure,
        ExternalProcessFailure,
        Timeout,
        RoomFull,
        BadRequest,
        Internal,
    }

    impl SfuError {
        /// Wire code for this error
        pub fn code(&self) -> ErrorCode {
            match self {
                SfuError::NotFound(_) => ErrorCode::NotFound,
                SfuError::InvalidParameters(_) => ErrorCode::InvalidParameters,
                SfuError::CapabilityMismatch(_) => ErrorCode::CapabilityMismatch,
                SfuError::Engine(_) => ErrorCode::EngineFailure,
                SfuError::ExternalProcess(_) => ErrorCode::ExternalProcessFailure,
                SfuError::Timeout(_) => ErrorCode::Timeout,
                SfuError::RoomFull(_) => ErrorCode::RoomFull,
                SfuError::Signaling(_) | SfuError::Json(_) => ErrorCode::BadRequest,
                SfuError::Presence(_) | SfuError::WebSocket(_) | SfuError::Io(_) => {
                    ErrorCode::Internal
                }
            }
        }

        /// Message safe to hand back to a client.
        ///
        /// Client-caused errors are returned verbatim; engine and internal
        /// failures are reduced to a generic text and only logged in full.
        pub fn client_message(&self) -> String {
            match self.code() {
                ErrorCode::EngineFailure => "media engine failure".to_string(),
                ErrorCode::Internal => "internal server error".to_string(),
                _ => self.to_string(),
            }
        }
    }

    pub type Result<T> = std::result::Result<T, SfuError>;
}

pub use error::{ErrorCode, Result, SfuError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging for the SFU
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_keep_their_message() {
        let err = SfuError::NotFound("transport abc".to_string());
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(err.client_message(), "transport abc not found");
    }

    #[test]
    fn engine_errors_are_generic_for_clients() {
        let err = SfuError::Engine("worker channel closed".to_string());
        assert_eq!(err.code(), ErrorCode::EngineFailure);
        assert_eq!(err.client_message(), "media engine failure");
    }
}
