//! Runtime record of one transcode for one fingerprint

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use url::Url;

use super::fingerprint::StreamFingerprint;
use super::state::SessionState;
use super::types::SessionSnapshot;
use crate::transcode::ProcessHandle;

/// Number of transcoder diagnostic lines retained for error reports.
const DIAGNOSTIC_TAIL: usize = 8;

/// One active (or starting, or failed) transcode.
///
/// `state`, the reference count and the process handle are mutated only
/// while holding the session's inner lock, and state changes are published
/// on a watch channel so waiters suspend instead of polling.
pub struct StreamSession {
    fingerprint: StreamFingerprint,
    session_id: u64,
    source_url: Url,
    output_dir: PathBuf,
    created_at: Instant,
    created_at_utc: chrono::DateTime<chrono::Utc>,
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<SessionState>,
}

struct SessionInner {
    client_ref_count: usize,
    last_access_at: Instant,
    last_segment_at: Option<Instant>,
    process: Option<ProcessHandle>,
    last_error: Option<String>,
    diagnostics: VecDeque<String>,
}

impl StreamSession {
    /// Creates a session in the `Starting` state with no clients.
    pub fn new(
        fingerprint: StreamFingerprint,
        session_id: u64,
        source_url: Url,
        output_dir: PathBuf,
    ) -> Self {
        let now = Instant::now();
        let (state_tx, _) = watch::channel(SessionState::Starting);
        Self {
            fingerprint,
            session_id,
            source_url,
            output_dir,
            created_at: now,
            created_at_utc: chrono::Utc::now(),
            inner: Mutex::new(SessionInner {
                client_ref_count: 0,
                last_access_at: now,
                last_segment_at: None,
                process: None,
                last_error: None,
                diagnostics: VecDeque::with_capacity(DIAGNOSTIC_TAIL),
            }),
            state_tx,
        }
    }

    pub fn fingerprint(&self) -> StreamFingerprint {
        self.fingerprint
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn source_url(&self) -> &Url {
        &self.source_url
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Adds one client reference and returns the new count.
    pub fn retain(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.client_ref_count += 1;
        inner.last_access_at = Instant::now();
        inner.client_ref_count
    }

    /// Drops one client reference.
    ///
    /// Returns `None` without changing anything when the count is already 0.
    pub fn release(&self) -> Option<usize> {
        let mut inner = self.inner.lock();
        if inner.client_ref_count == 0 {
            return None;
        }
        inner.client_ref_count -= 1;
        inner.last_access_at = Instant::now();
        Some(inner.client_ref_count)
    }

    pub fn client_ref_count(&self) -> usize {
        self.inner.lock().client_ref_count
    }

    /// Records a manifest or segment fetch.
    pub fn touch(&self) {
        self.inner.lock().last_access_at = Instant::now();
    }

    pub fn last_access_at(&self) -> Instant {
        self.inner.lock().last_access_at
    }

    /// Time elapsed since the last fetch, acquire or release.
    pub fn idle_for(&self) -> Duration {
        self.last_access_at().elapsed()
    }

    /// Records evidence that the transcoder produced a new segment.
    pub fn mark_segment_written(&self) {
        self.inner.lock().last_segment_at = Some(Instant::now());
    }

    /// Time since the last segment evidence, or since creation if none yet.
    pub fn since_last_segment(&self) -> Duration {
        self.inner
            .lock()
            .last_segment_at
            .unwrap_or(self.created_at)
            .elapsed()
    }

    /// Keeps the most recent transcoder diagnostic lines.
    pub fn record_diagnostic(&self, line: &str) {
        let mut inner = self.inner.lock();
        if inner.diagnostics.len() == DIAGNOSTIC_TAIL {
            inner.diagnostics.pop_front();
        }
        inner.diagnostics.push_back(line.to_string());
    }

    /// Most recent diagnostic lines, oldest first.
    pub fn diagnostic_tail(&self) -> Vec<String> {
        self.inner.lock().diagnostics.iter().cloned().collect()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// PID of the transcoder, when one is running and exposes it.
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().process.as_ref().and_then(ProcessHandle::pid)
    }

    pub fn has_process(&self) -> bool {
        self.inner.lock().process.is_some()
    }

    /// Hands the running transcoder to the session.
    ///
    /// Only a `Starting` session accepts a process; otherwise the handle is
    /// given back so the caller can stop it.
    pub fn attach_process(&self, handle: ProcessHandle) -> Result<(), ProcessHandle> {
        let mut inner = self.inner.lock();
        if self.state() != SessionState::Starting || inner.process.is_some() {
            return Err(handle);
        }
        inner.process = Some(handle);
        Ok(())
    }

    /// `Starting -> Ready`. Returns false if the session moved on meanwhile.
    pub fn mark_ready(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.process.is_none() {
            return false;
        }
        if inner.last_segment_at.is_none() {
            inner.last_segment_at = Some(Instant::now());
        }
        self.transition(SessionState::Ready)
    }

    /// Moves a live session to `Errored`, recording `detail`.
    ///
    /// Returns the process handle (if any) so the caller can stop it outside
    /// the lock. A session that is already errored or stopped is left as is.
    pub fn mark_errored(&self, detail: impl Into<String>) -> Option<ProcessHandle> {
        let mut inner = self.inner.lock();
        if !self.state().is_live() {
            return None;
        }
        inner.last_error = Some(detail.into());
        self.transition(SessionState::Errored);
        inner.process.take()
    }

    /// Moves the session to the terminal `Stopped` state.
    ///
    /// Idempotent; the process handle is returned only on the first call.
    pub fn mark_stopped(&self) -> Option<ProcessHandle> {
        let mut inner = self.inner.lock();
        self.transition(SessionState::Stopped);
        inner.process.take()
    }

    fn transition(&self, next: SessionState) -> bool {
        let current = self.state();
        let changed = self.state_tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(
                "Session {} ({}) {} -> {}",
                self.session_id,
                self.fingerprint,
                current,
                next
            );
        }
        changed
    }

    /// Read-only view for the operational API.
    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock();
        SessionSnapshot {
            fingerprint: self.fingerprint.to_string(),
            session_id: self.session_id,
            source_url: self.source_url.to_string(),
            state: self.state(),
            client_ref_count: inner.client_ref_count,
            created_at: self.created_at_utc,
            idle_for: inner.last_access_at.elapsed(),
            last_error: inner.last_error.clone(),
            pid: inner.process.as_ref().and_then(ProcessHandle::pid),
        }
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("fingerprint", &self.fingerprint)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .field("output_dir", &self.output_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> StreamSession {
        StreamSession::new(
            StreamFingerprint::new([3u8; 20]),
            1,
            Url::parse("http://origin.test/live/1.ts").unwrap(),
            PathBuf::from("/tmp/sluice-test/session-1"),
        )
    }

    #[test]
    fn test_refcount_never_negative() {
        let session = session();
        assert_eq!(session.release(), None);
        assert_eq!(session.retain(), 1);
        assert_eq!(session.retain(), 2);
        assert_eq!(session.release(), Some(1));
        assert_eq!(session.release(), Some(0));
        assert_eq!(session.release(), None);
        assert_eq!(session.client_ref_count(), 0);
    }

    #[test]
    fn test_ready_requires_process() {
        let session = session();
        assert!(!session.mark_ready());
        assert_eq!(session.state(), SessionState::Starting);
    }

    #[test]
    fn test_errored_and_stopped_are_sticky() {
        let session = session();
        assert!(session.mark_errored("boom").is_none());
        assert_eq!(session.state(), SessionState::Errored);
        assert_eq!(session.last_error().as_deref(), Some("boom"));

        // A second failure does not overwrite the first diagnosis
        session.mark_errored("later");
        assert_eq!(session.last_error().as_deref(), Some("boom"));

        session.mark_stopped();
        session.mark_stopped();
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn test_diagnostic_tail_is_bounded() {
        let session = session();
        for i in 0..20 {
            session.record_diagnostic(&format!("line {i}"));
        }
        let tail = session.diagnostic_tail();
        assert_eq!(tail.len(), DIAGNOSTIC_TAIL);
        assert_eq!(tail.last().map(String::as_str), Some("line 19"));
    }

    #[tokio::test]
    async fn test_state_changes_wake_subscribers() {
        let session = session();
        let mut rx = session.subscribe();
        session.mark_errored("no manifest");
        let state = *rx.wait_for(|state| state.is_settled()).await.unwrap();
        assert_eq!(state, SessionState::Errored);
    }
}
