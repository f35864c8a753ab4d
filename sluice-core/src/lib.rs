//! Sluice Core - Stream resolution and transcoding proxy
//!
//! This crate provides the building blocks for turning arbitrary IPTV/VOD
//! source URLs into something a browser can play: redirect resolution with
//! per-hop header spoofing, content classification, a reference-counted
//! registry of transcoding sessions, supervision of the external transcoder
//! and safe serving of the generated HLS output.

pub mod config;
pub mod mode;
pub mod resolve;
pub mod stream;
pub mod tracing_setup;
pub mod transcode;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types for convenient access
pub use config::SluiceConfig;
pub use mode::RuntimeMode;
pub use resolve::{PlaybackKind, RedirectResolver, ResolvedSource, classify};
pub use stream::{
    IdleReaper, SegmentServer, SessionState, StreamError, StreamFingerprint, StreamRegistry,
    StreamResult,
};
pub use transcode::{FfmpegTranscoder, SimulatedTranscoder, TranscodeSupervisor, Transcoder};

/// Core errors that can bubble up from any Sluice subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SluiceError {
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SluiceError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            SluiceError::Stream(e) => match e {
                StreamError::InvalidSourceUrl { url, .. } => {
                    format!("Not a playable source URL: {url}")
                }
                StreamError::RedirectLoopOrTooDeep { .. } => {
                    "The source redirected too many times".to_string()
                }
                StreamError::SourceUnreachable { .. } => {
                    "The source could not be reached".to_string()
                }
                StreamError::TranscodeStartupFailed { .. } => {
                    "The stream could not be started".to_string()
                }
                StreamError::StreamStartupTimeout { .. } => {
                    "The stream is still starting, try again shortly".to_string()
                }
                StreamError::SessionNotFound { .. } => "The stream is no longer active".to_string(),
                _ => "Streaming error occurred".to_string(),
            },
            SluiceError::Configuration { .. } => "Configuration error occurred".to_string(),
            SluiceError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            SluiceError::Configuration { .. }
                | SluiceError::Stream(StreamError::InvalidSourceUrl { .. })
                | SluiceError::Stream(StreamError::InvalidFingerprint { .. })
                | SluiceError::Stream(StreamError::InvalidSegmentName { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, SluiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors_are_classified() {
        let error = SluiceError::from(StreamError::InvalidSourceUrl {
            url: "ftp://x".to_string(),
            reason: "unsupported scheme".to_string(),
        });
        assert!(error.is_user_error());
        assert!(error.user_message().contains("ftp://x"));

        let error = SluiceError::from(StreamError::StreamStartupTimeout {
            fingerprint: StreamFingerprint::new([0u8; 20]),
            waited_ms: 100,
        });
        assert!(!error.is_user_error());
        assert!(error.user_message().contains("still starting"));
    }
}
