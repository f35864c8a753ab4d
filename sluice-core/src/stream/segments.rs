//! Safe lookup of manifest and segment files inside session directories

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;

use super::fingerprint::StreamFingerprint;
use super::registry::StreamRegistry;
use super::state::SessionState;
use super::types::{StreamError, StreamResult};

/// File names the transcoder produces. Anything else, including any path
/// separator or dot segment, is rejected before touching the filesystem.
static FILE_NAME_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}\.(m3u8|ts)$").ok());

/// MIME type of HLS manifests.
pub const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// MIME type of MPEG-TS segments.
pub const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

/// Cache directive for manifests, which mutate as segments roll.
pub const MANIFEST_CACHE_CONTROL: &str = "no-cache, no-store, must-revalidate";

/// Kind of file requested from a session directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Manifest,
    Segment,
}

/// An opened manifest or segment ready to be streamed to the client.
#[derive(Debug)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub file: tokio::fs::File,
    pub len: u64,
    pub kind: SegmentKind,
    pub content_type: &'static str,
    pub cache_control: String,
}

/// Serves files from the output directory of ready sessions.
pub struct SegmentServer {
    registry: Arc<StreamRegistry>,
    segment_max_age: Duration,
}

impl SegmentServer {
    /// Creates a server caching segments for twice the segment duration.
    pub fn new(registry: Arc<StreamRegistry>) -> Self {
        let segment_max_age = registry.supervisor().config().segment_duration * 2;
        Self {
            registry,
            segment_max_age,
        }
    }

    /// Validates `filename` against the manifest/segment pattern.
    ///
    /// # Errors
    /// - `StreamError::InvalidSegmentName` - Not a plain manifest or segment name
    pub fn classify_name(filename: &str) -> StreamResult<SegmentKind> {
        let valid = FILE_NAME_PATTERN
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(filename));
        if !valid {
            return Err(StreamError::InvalidSegmentName {
                name: filename.chars().take(80).collect(),
            });
        }
        if filename.ends_with(".m3u8") {
            Ok(SegmentKind::Manifest)
        } else {
            Ok(SegmentKind::Segment)
        }
    }

    /// Opens `filename` from the session for `fingerprint` and records the access.
    ///
    /// # Errors
    /// - `StreamError::InvalidSegmentName` - Name outside the allowed pattern
    /// - `StreamError::SessionNotFound` - No ready session, or the file is gone
    pub async fn serve(
        &self,
        fingerprint: StreamFingerprint,
        filename: &str,
    ) -> StreamResult<SegmentFile> {
        let kind = Self::classify_name(filename)?;

        let session = self
            .registry
            .get(fingerprint)
            .await
            .filter(|session| session.state() == SessionState::Ready)
            .ok_or(StreamError::SessionNotFound { fingerprint })?;

        let path = session.output_dir().join(filename);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StreamError::SessionNotFound { fingerprint });
            }
            Err(e) => return Err(StreamError::io(format!("open {}", path.display()), e)),
        };
        let len = file
            .metadata()
            .await
            .map_err(|e| StreamError::io(format!("stat {}", path.display()), e))?
            .len();

        session.touch();

        let (content_type, cache_control) = match kind {
            SegmentKind::Manifest => (MANIFEST_CONTENT_TYPE, MANIFEST_CACHE_CONTROL.to_string()),
            SegmentKind::Segment => (
                SEGMENT_CONTENT_TYPE,
                format!("public, max-age={}", self.segment_max_age.as_secs().max(1)),
            ),
        };

        Ok(SegmentFile {
            path,
            file,
            len,
            kind,
            content_type,
            cache_control,
        })
    }
}
