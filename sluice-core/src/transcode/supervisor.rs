//! Transcoder startup, readiness detection, health monitoring and teardown

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, error, info, warn};

use super::ffmpeg::{TranscodeJob, Transcoder, segment_written};
use super::process::{ProcessExit, ProcessHandle};
use crate::config::{ResolverConfig, TranscodeConfig};
use crate::resolve::UpstreamHeaders;
use crate::stream::session::StreamSession;
use crate::stream::{SessionState, StreamError, StreamResult};

/// Drives one transcoder per session from launch to teardown.
///
/// Readiness is decided by polling the manifest on disk; segment markers in
/// the transcoder's diagnostic stream only wake the poll early and feed the
/// stall detector.
pub struct TranscodeSupervisor {
    transcoder: Arc<dyn Transcoder>,
    config: TranscodeConfig,
    resolver: ResolverConfig,
}

impl TranscodeSupervisor {
    pub fn new(
        transcoder: Arc<dyn Transcoder>,
        config: TranscodeConfig,
        resolver: ResolverConfig,
    ) -> Self {
        Self {
            transcoder,
            config,
            resolver,
        }
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.config
    }

    /// Check if the underlying transcoder can be launched.
    pub async fn is_available(&self) -> bool {
        self.transcoder.is_available().await
    }

    /// Launches the transcoder for `session` and waits for a playable manifest.
    ///
    /// On success the session is `Ready` and a health monitor watches it. On
    /// failure the process is killed, partial output removed and the session
    /// left `Errored` with the diagnostic in `last_error`.
    ///
    /// # Errors
    /// - `StreamError::TranscodeStartupFailed` - No manifest within the startup bound,
    ///   the process exited first, or it could not be launched
    pub async fn start(&self, session: Arc<StreamSession>) -> StreamResult<()> {
        let started = Instant::now();

        if let Err(e) = tokio::fs::create_dir_all(session.output_dir()).await {
            return Err(self
                .fail(&session, format!("failed to create output directory: {e}"))
                .await);
        }

        let headers = UpstreamHeaders::for_hop(session.source_url(), &self.resolver);
        let job = TranscodeJob {
            source_url: session.source_url().clone(),
            output_dir: session.output_dir().to_path_buf(),
            user_agent: headers.user_agent.clone(),
            headers: headers.request_headers(),
        };

        let mut process = match self.transcoder.spawn(&job).await {
            Ok(process) => process,
            Err(e) => return Err(self.fail(&session, e.to_string()).await),
        };

        let segment_signal = Arc::new(Notify::new());
        if let Some(lines) = process.take_diagnostics() {
            tokio::spawn(pump_diagnostics(
                Arc::clone(&session),
                lines,
                Arc::clone(&segment_signal),
            ));
        }

        let handle = ProcessHandle::watch(process);
        let mut exit_rx = handle.exit_watcher();
        if let Err(handle) = session.attach_process(handle) {
            handle.stop(self.config.kill_grace).await;
            remove_output_dir(session.output_dir()).await;
            return Err(StreamError::TranscodeStartupFailed {
                detail: "session stopped during startup".to_string(),
            });
        }

        let manifest = job.manifest_path();
        let waited = tokio::time::timeout(
            self.config.startup_timeout,
            self.wait_for_manifest(&manifest, &mut exit_rx, &segment_signal),
        )
        .await;

        let detail = match waited {
            Ok(Ok(())) => {
                if !session.mark_ready() {
                    return Err(StreamError::TranscodeStartupFailed {
                        detail: "session stopped during startup".to_string(),
                    });
                }
                info!(
                    "Session {} for {} ready in {}ms",
                    session.session_id(),
                    session.fingerprint(),
                    started.elapsed().as_millis()
                );
                tokio::spawn(monitor_health(
                    Arc::clone(&session),
                    self.config.clone(),
                    manifest,
                    exit_rx,
                ));
                return Ok(());
            }
            Ok(Err(detail)) => detail,
            Err(_) => format!(
                "no playable manifest within {}ms",
                self.config.startup_timeout.as_millis()
            ),
        };

        Err(self.fail(&session, detail).await)
    }

    /// Polls for a non-empty manifest until the process exits.
    ///
    /// Bounded by attempt count here and by wall clock in the caller.
    async fn wait_for_manifest(
        &self,
        manifest: &Path,
        exit_rx: &mut watch::Receiver<Option<ProcessExit>>,
        segment_signal: &Notify,
    ) -> Result<(), String> {
        tokio::time::sleep(self.config.settle_delay).await;

        let poll_ms = self.config.poll_interval.as_millis().max(1);
        let max_attempts = (self.config.startup_timeout.as_millis() / poll_ms) as u64 + 1;

        for attempt in 1..=max_attempts {
            if manifest_ready(manifest).await {
                debug!("Manifest {} ready after {} checks", manifest.display(), attempt);
                return Ok(());
            }

            let exited = exit_rx.borrow().clone();
            if let Some(exit) = exited {
                return Err(format!("transcoder {exit} before producing a manifest"));
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = segment_signal.notified() => {}
                changed = exit_rx.changed() => {
                    if changed.is_err() && exit_rx.borrow().is_none() {
                        return Err("transcoder watcher ended unexpectedly".to_string());
                    }
                }
            }
        }

        Err(format!("no playable manifest after {max_attempts} checks"))
    }

    /// Records a startup failure and cleans up after it.
    async fn fail(&self, session: &StreamSession, detail: String) -> StreamError {
        let tail = session.diagnostic_tail();
        let detail = if tail.is_empty() {
            detail
        } else {
            format!("{detail}; last transcoder output: {}", tail.join(" | "))
        };

        error!(
            "Session {} for {} failed to start: {}",
            session.session_id(),
            session.fingerprint(),
            detail
        );

        if let Some(handle) = session.mark_errored(detail.clone()) {
            handle.stop(self.config.kill_grace).await;
        }
        remove_output_dir(session.output_dir()).await;

        StreamError::TranscodeStartupFailed { detail }
    }

    /// Kills the transcoder and deletes the session's output directory.
    ///
    /// Idempotent: a stopped session is left as is.
    pub async fn stop(&self, session: &StreamSession) {
        if let Some(handle) = session.mark_stopped() {
            let exit = handle.stop(self.config.kill_grace).await;
            debug!(
                "Transcoder for session {} stopped: {:?}",
                session.session_id(),
                exit
            );
        }
        remove_output_dir(session.output_dir()).await;
    }
}

/// Forwards diagnostic lines into the session and signals segment markers.
async fn pump_diagnostics(
    session: Arc<StreamSession>,
    mut lines: mpsc::UnboundedReceiver<String>,
    segment_signal: Arc<Notify>,
) {
    while let Some(line) = lines.recv().await {
        if let Some(path) = segment_written(&line) {
            debug!("Session {} segment {}", session.session_id(), path);
            session.mark_segment_written();
            segment_signal.notify_one();
        }
        session.record_diagnostic(&line);
    }
}

/// Watches a ready session for process exit and stalled output.
async fn monitor_health(
    session: Arc<StreamSession>,
    config: TranscodeConfig,
    manifest: PathBuf,
    mut exit_rx: watch::Receiver<Option<ProcessExit>>,
) {
    let mut ticker = tokio::time::interval(config.health_check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_modified = manifest_modified(&manifest).await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = exit_rx.changed() => {
                if changed.is_err() && exit_rx.borrow().is_none() {
                    return;
                }
            }
        }

        if session.state() != SessionState::Ready {
            return;
        }

        let exited = exit_rx.borrow().clone();
        if let Some(exit) = exited {
            let detail = format!("transcoder {exit} while streaming");
            warn!(
                "Session {} for {} errored: {}",
                session.session_id(),
                session.fingerprint(),
                detail
            );
            if let Some(handle) = session.mark_errored(detail) {
                handle.stop(config.kill_grace).await;
            }
            return;
        }

        let modified = manifest_modified(&manifest).await;
        if modified.is_some() && modified != last_modified {
            session.mark_segment_written();
            last_modified = modified;
        }

        let quiet_for = session.since_last_segment();
        if session.client_ref_count() > 0 && quiet_for > config.stall_timeout {
            let detail = format!("no new segment for {}ms", quiet_for.as_millis());
            warn!(
                "Session {} for {} stalled: {}",
                session.session_id(),
                session.fingerprint(),
                detail
            );
            if let Some(handle) = session.mark_errored(detail) {
                handle.stop(config.kill_grace).await;
            }
            return;
        }
    }
}

async fn manifest_ready(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

async fn manifest_modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

async fn remove_output_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed output directory {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove output directory {}: {}", dir.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use url::Url;

    use super::*;
    use crate::config::SluiceConfig;
    use crate::stream::StreamFingerprint;
    use crate::transcode::{SimulatedBehavior, SimulatedTranscoder};

    fn supervisor(transcoder: SimulatedTranscoder) -> TranscodeSupervisor {
        let config = SluiceConfig::for_testing();
        TranscodeSupervisor::new(Arc::new(transcoder), config.transcode, config.resolver)
    }

    fn session(root: &Path) -> Arc<StreamSession> {
        Arc::new(StreamSession::new(
            StreamFingerprint::new([9u8; 20]),
            1,
            Url::parse("http://origin.test/live/9.ts").unwrap(),
            root.join("session-1"),
        ))
    }

    #[tokio::test]
    async fn test_start_reaches_ready() {
        let root = tempfile::tempdir().unwrap();
        let supervisor = supervisor(SimulatedTranscoder::new());
        let session = session(root.path());

        supervisor.start(Arc::clone(&session)).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.output_dir().join("index.m3u8").exists());
        assert!(session.has_process());

        supervisor.stop(&session).await;
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!session.output_dir().exists());
        assert!(!session.has_process());

        // Second stop is a no-op
        supervisor.stop(&session).await;
    }

    #[tokio::test]
    async fn test_never_ready_times_out_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let supervisor =
            supervisor(SimulatedTranscoder::new().with_behavior(SimulatedBehavior::NeverReady));
        let session = session(root.path());

        let result = supervisor.start(Arc::clone(&session)).await;
        assert!(matches!(
            result,
            Err(StreamError::TranscodeStartupFailed { .. })
        ));
        assert_eq!(session.state(), SessionState::Errored);
        assert!(!session.output_dir().exists());
        assert!(!session.has_process());
        assert!(session.last_error().unwrap().contains("no playable manifest"));
    }

    #[tokio::test]
    async fn test_early_exit_fails_fast_with_diagnostics() {
        let root = tempfile::tempdir().unwrap();
        let supervisor = supervisor(
            SimulatedTranscoder::new()
                .with_behavior(SimulatedBehavior::ExitImmediately { code: 1 }),
        );
        let session = session(root.path());

        let started = Instant::now();
        let result = supervisor.start(Arc::clone(&session)).await;
        assert!(started.elapsed() < supervisor.config().startup_timeout);

        let Err(StreamError::TranscodeStartupFailed { detail }) = result else {
            panic!("expected startup failure, got {result:?}");
        };
        assert!(detail.contains("exited with code 1"), "detail: {detail}");
        assert_eq!(session.state(), SessionState::Errored);
    }

    #[tokio::test]
    async fn test_crash_while_ready_marks_errored() {
        let root = tempfile::tempdir().unwrap();
        let supervisor = supervisor(
            SimulatedTranscoder::new()
                .with_segment_interval(Duration::from_millis(20))
                .with_behavior(SimulatedBehavior::CrashAfter {
                    segments: 3,
                    code: 1,
                }),
        );
        let session = session(root.path());

        supervisor.start(Arc::clone(&session)).await.unwrap();
        let mut state_rx = session.subscribe();
        let state = tokio::time::timeout(
            Duration::from_secs(2),
            state_rx.wait_for(|state| *state == SessionState::Errored),
        )
        .await
        .unwrap()
        .map(|state| *state)
        .unwrap();
        assert_eq!(state, SessionState::Errored);
        assert!(session.last_error().unwrap().contains("while streaming"));
    }

    #[tokio::test]
    async fn test_stall_with_clients_marks_errored() {
        let root = tempfile::tempdir().unwrap();
        let supervisor = supervisor(
            SimulatedTranscoder::new()
                .with_segment_interval(Duration::from_millis(20))
                .with_behavior(SimulatedBehavior::StallAfter { segments: 2 }),
        );
        let session = session(root.path());
        session.retain();

        supervisor.start(Arc::clone(&session)).await.unwrap();
        let mut state_rx = session.subscribe();
        tokio::time::timeout(
            Duration::from_secs(3),
            state_rx.wait_for(|state| *state == SessionState::Errored),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(session.last_error().unwrap().contains("no new segment"));
        assert!(!session.has_process());
    }
}
