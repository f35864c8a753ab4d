//! Type definitions shared by the registry, supervisor and segment server

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use super::fingerprint::StreamFingerprint;
use super::state::SessionState;

/// Errors surfaced by stream resolution and session management.
///
/// Each variant maps to one client-visible outcome; see
/// [`StreamError::is_retryable`] for which ones a player should retry.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The supplied source URL is not an absolute http(s) URL
    #[error("Invalid source URL {url}: {reason}")]
    InvalidSourceUrl {
        /// The rejected URL as supplied
        url: String,
        /// Why the URL was rejected
        reason: String,
    },

    /// The redirect chain exceeded the configured hop bound
    #[error("Redirect loop or chain too deep after {hops} hops starting at {url}")]
    RedirectLoopOrTooDeep {
        /// URL the chain started from
        url: String,
        /// Number of redirects followed before giving up
        hops: usize,
    },

    /// Network-level failure while contacting the source
    #[error("Source unreachable at {url}: {reason}")]
    SourceUnreachable {
        /// URL of the hop that failed
        url: String,
        /// Underlying network error
        reason: String,
    },

    /// The transcoder did not produce a playable manifest
    #[error("Transcoder failed to start: {detail}")]
    TranscodeStartupFailed {
        /// Diagnostic detail captured from the supervisor
        detail: String,
    },

    /// A joining caller waited past the bound for another caller's start
    #[error("Stream {fingerprint} still starting after {waited_ms}ms")]
    StreamStartupTimeout {
        /// Fingerprint of the session being waited on
        fingerprint: StreamFingerprint,
        /// How long the caller waited
        waited_ms: u64,
    },

    /// No live session exists for the fingerprint
    #[error("No active stream session for {fingerprint}")]
    SessionNotFound {
        /// The requested fingerprint
        fingerprint: StreamFingerprint,
    },

    /// A release arrived for a session that has no acquired clients
    #[error("Stream {fingerprint} has no acquired clients to release")]
    NotAcquired {
        /// The requested fingerprint
        fingerprint: StreamFingerprint,
    },

    /// A fingerprint string is not 40 hex characters
    #[error("Invalid stream fingerprint: {value}")]
    InvalidFingerprint {
        /// The rejected value
        value: String,
    },

    /// A segment or manifest name outside the allowed pattern
    #[error("Invalid segment name: {name}")]
    InvalidSegmentName {
        /// The rejected file name
        name: String,
    },

    /// The transcoder binary could not be launched
    #[error("Transcoder unavailable: {reason}")]
    TranscoderUnavailable {
        /// Launch failure detail
        reason: String,
    },

    /// Underlying I/O operation failed
    #[error("I/O error during {operation}: {source}")]
    Io {
        /// Description of the operation that failed
        operation: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl StreamError {
    /// Builds an I/O error tagged with the operation that failed.
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Check if the client may usefully retry by re-issuing `/resolve`.
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::SourceUnreachable { .. } => true,
            StreamError::TranscodeStartupFailed { .. } => true,
            StreamError::StreamStartupTimeout { .. } => true,
            StreamError::SessionNotFound { .. } => true,
            StreamError::TranscoderUnavailable { .. } => false,
            StreamError::RedirectLoopOrTooDeep { .. } => false,
            StreamError::InvalidSourceUrl { .. } => false,
            StreamError::InvalidFingerprint { .. } => false,
            StreamError::InvalidSegmentName { .. } => false,
            StreamError::NotAcquired { .. } => false,
            StreamError::Io { .. } => true,
        }
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamError::InvalidSourceUrl { .. } => "invalid_source_url",
            StreamError::RedirectLoopOrTooDeep { .. } => "redirect_loop_or_too_deep",
            StreamError::SourceUnreachable { .. } => "source_unreachable",
            StreamError::TranscodeStartupFailed { .. } => "transcode_startup_failed",
            StreamError::StreamStartupTimeout { .. } => "stream_startup_timeout",
            StreamError::SessionNotFound { .. } => "session_not_found",
            StreamError::NotAcquired { .. } => "not_acquired",
            StreamError::InvalidFingerprint { .. } => "invalid_fingerprint",
            StreamError::InvalidSegmentName { .. } => "invalid_segment_name",
            StreamError::TranscoderUnavailable { .. } => "transcoder_unavailable",
            StreamError::Io { .. } => "io",
        }
    }
}

/// Result type for stream operations
pub type StreamResult<T> = Result<T, StreamError>;

/// What an acquirer receives once a session is ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    /// Registry key of the session
    pub fingerprint: StreamFingerprint,
    /// Monotonic id distinguishing successive sessions for one fingerprint
    pub session_id: u64,
    /// Private output directory of the session
    pub output_dir: PathBuf,
    /// Relative URL of the manifest, e.g. `/segments/<fp>/index.m3u8`
    pub manifest_url: String,
}

/// Read-only view of a session for the operational API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub fingerprint: String,
    pub session_id: u64,
    pub source_url: String,
    pub state: SessionState,
    pub client_ref_count: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(serialize_with = "serialize_millis")]
    pub idle_for: Duration,
    pub last_error: Option<String>,
    pub pid: Option<u32>,
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(value.as_millis() as u64)
}

/// Outcome of one reaper sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Fingerprints torn down because they were idle past the threshold
    pub idle: Vec<StreamFingerprint>,
    /// Fingerprints torn down because they had errored
    pub errored: Vec<StreamFingerprint>,
}

impl ReapReport {
    /// Total number of sessions removed by the sweep.
    pub fn removed(&self) -> usize {
        self.idle.len() + self.errored.len()
    }
}
