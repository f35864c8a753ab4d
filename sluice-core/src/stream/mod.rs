//! Stream sessions: fingerprints, lifecycle, registry, reaping and serving
//!
//! Every distinct source URL maps to one [`StreamFingerprint`]. The
//! [`StreamRegistry`] holds at most one [`session::StreamSession`] per
//! fingerprint, counts the clients using it and hands startup to the
//! transcode supervisor. The [`SegmentServer`] exposes the session's output
//! directory and the [`IdleReaper`] removes sessions nobody watches.

pub mod fingerprint;
pub mod reaper;
pub mod registry;
pub mod segments;
pub mod session;
pub mod state;
pub mod types;

pub use fingerprint::{StreamFingerprint, normalize_source_url};
pub use reaper::IdleReaper;
pub use registry::{StreamRegistry, manifest_url};
pub use segments::{SegmentFile, SegmentKind, SegmentServer};
pub use session::StreamSession;
pub use state::SessionState;
pub use types::{ReapReport, SessionHandle, SessionSnapshot, StreamError, StreamResult};
