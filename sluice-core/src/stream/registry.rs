//! Reference-counted table of stream sessions keyed by fingerprint

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use super::fingerprint::StreamFingerprint;
use super::session::StreamSession;
use super::state::SessionState;
use super::types::{ReapReport, SessionHandle, SessionSnapshot, StreamError, StreamResult};
use crate::config::RegistryConfig;
use crate::transcode::{MANIFEST_FILE_NAME, TranscodeSupervisor};

/// Owns every stream session and enforces one transcode per fingerprint.
///
/// The map lock only guards lookup, insertion and removal; waiting for a
/// session to become ready happens on the session's own state channel with
/// the lock released.
pub struct StreamRegistry {
    sessions: RwLock<HashMap<StreamFingerprint, Arc<StreamSession>>>,
    supervisor: Arc<TranscodeSupervisor>,
    config: RegistryConfig,
    output_root: PathBuf,
    session_counter: AtomicU64,
}

impl StreamRegistry {
    pub fn new(supervisor: Arc<TranscodeSupervisor>, config: RegistryConfig) -> Self {
        let output_root = supervisor.config().output_root.clone();
        Self {
            sessions: RwLock::new(HashMap::new()),
            supervisor,
            config,
            output_root,
            session_counter: AtomicU64::new(1),
        }
    }

    pub fn supervisor(&self) -> &Arc<TranscodeSupervisor> {
        &self.supervisor
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Joins or starts the session for `fingerprint` and waits until it is ready.
    ///
    /// The caller holds one client reference on success and none on failure
    /// or when this future is dropped mid-wait. Startup runs in its own task,
    /// so dropping this future does not cancel the transcoder other clients
    /// may be waiting on.
    ///
    /// # Errors
    /// - `StreamError::TranscodeStartupFailed` - The session errored before becoming ready
    /// - `StreamError::StreamStartupTimeout` - Still starting when the wait bound expired
    pub async fn acquire(
        &self,
        fingerprint: StreamFingerprint,
        source_url: Url,
    ) -> StreamResult<SessionHandle> {
        let (session, created) = {
            let mut sessions = self.sessions.write().await;
            let existing = sessions.get(&fingerprint).cloned();

            match existing {
                Some(session) if session.state().is_live() => {
                    let clients = session.retain();
                    debug!(
                        "Joined session {} for {} ({} clients)",
                        session.session_id(),
                        fingerprint,
                        clients
                    );
                    (session, false)
                }
                stale => {
                    if let Some(dead) = stale {
                        info!(
                            "Replacing {} session {} for {}",
                            dead.state(),
                            dead.session_id(),
                            fingerprint
                        );
                        let supervisor = Arc::clone(&self.supervisor);
                        tokio::spawn(async move { supervisor.stop(&dead).await });
                    }

                    let session_id = self.session_counter.fetch_add(1, Ordering::SeqCst);
                    let output_dir = self.output_root.join(format!("{fingerprint}-{session_id}"));
                    let session = Arc::new(StreamSession::new(
                        fingerprint,
                        session_id,
                        source_url,
                        output_dir,
                    ));
                    session.retain();
                    sessions.insert(fingerprint, Arc::clone(&session));

                    info!(
                        "Created session {} for {} from {}",
                        session_id,
                        fingerprint,
                        session.source_url()
                    );
                    (session, true)
                }
            }
        };

        if created {
            let supervisor = Arc::clone(&self.supervisor);
            let starting = Arc::clone(&session);
            tokio::spawn(async move {
                if let Err(e) = supervisor.start(starting).await {
                    debug!("Startup task ended with error: {}", e);
                }
            });
        }

        // The creator's wait outlives the supervisor's own bound so it sees
        // the definitive outcome instead of a timeout.
        let bound = if created {
            self.supervisor.config().startup_timeout + self.supervisor.config().kill_grace
        } else {
            self.config.acquire_timeout
        };

        let claim = ClientClaim::new(Arc::clone(&session));
        let waited_from = Instant::now();
        let mut state_rx = session.subscribe();
        let settled =
            match tokio::time::timeout(bound, state_rx.wait_for(|state| state.is_settled())).await {
                Ok(Ok(state)) => Some(*state),
                Ok(Err(_)) | Err(_) => None,
            };

        match settled {
            Some(SessionState::Ready) => {
                claim.keep();
                Ok(SessionHandle {
                    fingerprint,
                    session_id: session.session_id(),
                    output_dir: session.output_dir().to_path_buf(),
                    manifest_url: manifest_url(fingerprint),
                })
            }
            Some(_) => {
                drop(claim);
                Err(StreamError::TranscodeStartupFailed {
                    detail: session
                        .last_error()
                        .unwrap_or_else(|| "session stopped before becoming ready".to_string()),
                })
            }
            None => {
                drop(claim);
                Err(StreamError::StreamStartupTimeout {
                    fingerprint,
                    waited_ms: waited_from.elapsed().as_millis() as u64,
                })
            }
        }
    }

    /// Drops one client reference.
    ///
    /// Teardown is left to the reaper so a quick reconnect reuses the session.
    /// When `session_id` names a session that has since been replaced under
    /// the same fingerprint, nothing is released and the current session's
    /// count is returned unchanged.
    ///
    /// # Errors
    /// - `StreamError::SessionNotFound` - No session for the fingerprint
    /// - `StreamError::NotAcquired` - The session has no client references
    pub async fn release(
        &self,
        fingerprint: StreamFingerprint,
        session_id: Option<u64>,
    ) -> StreamResult<usize> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(&fingerprint)
            .ok_or(StreamError::SessionNotFound { fingerprint })?;

        if let Some(stale) = session_id
            && stale != session.session_id()
        {
            debug!(
                "Ignoring release of replaced session {} for {} (current {})",
                stale,
                fingerprint,
                session.session_id()
            );
            return Ok(session.client_ref_count());
        }

        let remaining = session
            .release()
            .ok_or(StreamError::NotAcquired { fingerprint })?;
        debug!(
            "Released session {} for {} ({} clients left)",
            session.session_id(),
            fingerprint,
            remaining
        );
        Ok(remaining)
    }

    /// Tears down the session for `fingerprint` regardless of its clients.
    ///
    /// # Errors
    /// - `StreamError::SessionNotFound` - No session for the fingerprint
    pub async fn stop(&self, fingerprint: StreamFingerprint) -> StreamResult<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(&fingerprint)
            .ok_or(StreamError::SessionNotFound { fingerprint })?;

        self.supervisor.stop(&session).await;
        info!(
            "Stopped session {} for {}",
            session.session_id(),
            fingerprint
        );
        Ok(())
    }

    /// Live session for `fingerprint`, if any.
    pub async fn get(&self, fingerprint: StreamFingerprint) -> Option<Arc<StreamSession>> {
        self.sessions.read().await.get(&fingerprint).cloned()
    }

    /// Read-only view of one session.
    pub async fn session(&self, fingerprint: StreamFingerprint) -> Option<SessionSnapshot> {
        self.get(fingerprint).await.map(|session| session.snapshot())
    }

    /// Read-only views of all sessions, oldest first.
    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let mut entries: Vec<&Arc<StreamSession>> = sessions.values().collect();
        entries.sort_by_key(|session| session.created_at());
        entries.iter().map(|session| session.snapshot()).collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Runs one idle sweep.
    ///
    /// Removes unreferenced sessions that are idle past the threshold or no
    /// longer live. Sessions with clients are never reaped.
    pub async fn reap_now(&self) -> ReapReport {
        let mut report = ReapReport::default();

        let doomed: Vec<(Arc<StreamSession>, bool)> = {
            let mut sessions = self.sessions.write().await;
            let victims: Vec<(StreamFingerprint, bool)> = sessions
                .iter()
                .filter(|(_, session)| session.client_ref_count() == 0)
                .filter_map(|(fingerprint, session)| {
                    if !session.state().is_live() {
                        Some((*fingerprint, false))
                    } else if session.idle_for() > self.config.idle_threshold {
                        Some((*fingerprint, true))
                    } else {
                        None
                    }
                })
                .collect();

            victims
                .into_iter()
                .filter_map(|(fingerprint, idle)| {
                    sessions.remove(&fingerprint).map(|session| (session, idle))
                })
                .collect()
        };

        for (session, idle) in doomed {
            let fingerprint = session.fingerprint();
            info!(
                "Reaping {} session {} for {} (idle {}s)",
                session.state(),
                session.session_id(),
                fingerprint,
                session.idle_for().as_secs()
            );
            self.supervisor.stop(&session).await;
            if idle {
                report.idle.push(fingerprint);
            } else {
                report.errored.push(fingerprint);
            }
        }

        report
    }

    /// Stops every session; used on server shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<StreamSession>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, session)| session).collect()
        };

        if drained.is_empty() {
            return;
        }

        info!("Stopping {} stream sessions", drained.len());
        futures::future::join_all(
            drained
                .iter()
                .map(|session| self.supervisor.stop(session)),
        )
        .await;

        if let Err(e) = tokio::fs::remove_dir(&self.output_root).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                "Output root {} left in place: {}",
                self.output_root.display(),
                e
            );
        }
    }
}

/// Client reference taken during `acquire`, given back unless kept.
struct ClientClaim {
    session: Arc<StreamSession>,
    kept: bool,
}

impl ClientClaim {
    fn new(session: Arc<StreamSession>) -> Self {
        Self {
            session,
            kept: false,
        }
    }

    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for ClientClaim {
    fn drop(&mut self) {
        if !self.kept {
            self.session.release();
        }
    }
}

/// Relative URL under which the segment server exposes a session's manifest.
pub fn manifest_url(fingerprint: StreamFingerprint) -> String {
    format!("/segments/{fingerprint}/{MANIFEST_FILE_NAME}")
}
