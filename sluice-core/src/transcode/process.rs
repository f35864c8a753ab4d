//! Ownership of a running transcoder process

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

/// How a transcoder process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// The process exited on its own; `code` is `None` when killed by a signal
    Exited { code: Option<i32> },
    /// The process was killed on request
    Killed,
    /// Waiting on the process failed
    WaitFailed { reason: String },
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessExit::Exited { code: Some(code) } => write!(f, "exited with code {code}"),
            ProcessExit::Exited { code: None } => write!(f, "terminated by signal"),
            ProcessExit::Killed => write!(f, "killed"),
            ProcessExit::WaitFailed { reason } => write!(f, "wait failed: {reason}"),
        }
    }
}

/// A launched transcoder, real or simulated.
///
/// The exit code only tells whether the process crashed; success is judged
/// from the files it writes.
#[async_trait]
pub trait TranscodeProcess: Send {
    /// OS process id, if the implementation has one
    fn pid(&self) -> Option<u32>;

    /// Takes the diagnostic line stream (stderr). Yields `Some` at most once.
    fn take_diagnostics(&mut self) -> Option<mpsc::UnboundedReceiver<String>>;

    /// Waits for the process to exit. Must be cancel-safe.
    async fn wait(&mut self) -> ProcessExit;

    /// Forcefully terminates the process and reaps it.
    async fn kill(&mut self);
}

/// Handle stored in a session while its transcoder runs.
///
/// A watcher task owns the process and publishes its exit. Dropping the
/// handle kills the process.
pub struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    /// Spawns the watcher task for `process`.
    pub fn watch(mut process: Box<dyn TranscodeProcess>) -> Self {
        let pid = process.pid();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            let exit = tokio::select! {
                exit = process.wait() => exit,
                _ = kill_rx => {
                    process.kill().await;
                    ProcessExit::Killed
                }
            };
            tracing::debug!("Transcoder process {:?} {}", pid, exit);
            exit_tx.send_replace(Some(exit));
        });

        Self {
            pid,
            kill_tx: Some(kill_tx),
            exit_rx,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit outcome if the process has already ended.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        self.exit_rx.borrow().clone()
    }

    /// Receiver that observes the exit outcome.
    pub fn exit_watcher(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    /// Kills the process and waits up to `grace` for it to be reaped.
    ///
    /// Returns the exit outcome, or `None` if it was not observed in time.
    pub async fn stop(mut self, grace: Duration) -> Option<ProcessExit> {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }

        let mut exit_rx = self.exit_rx.clone();
        match tokio::time::timeout(grace, exit_rx.wait_for(Option::is_some)).await {
            Ok(Ok(exit)) => (*exit).clone(),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::warn!(
                    "Transcoder process {:?} not reaped within {}ms",
                    self.pid,
                    grace.as_millis()
                );
                None
            }
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("exit", &*self.exit_rx.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    struct ScriptedProcess {
        exit_after: Option<Duration>,
        killed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TranscodeProcess for ScriptedProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn take_diagnostics(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
            None
        }

        async fn wait(&mut self) -> ProcessExit {
            match self.exit_after {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    ProcessExit::Exited { code: Some(1) }
                }
                None => std::future::pending().await,
            }
        }

        async fn kill(&mut self) {
            self.killed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_stop_kills_running_process() {
        let killed = Arc::new(AtomicBool::new(false));
        let handle = ProcessHandle::watch(Box::new(ScriptedProcess {
            exit_after: None,
            killed: Arc::clone(&killed),
        }));
        assert_eq!(handle.pid(), Some(4242));
        assert_eq!(handle.exit_status(), None);

        let exit = handle.stop(Duration::from_secs(1)).await;
        assert_eq!(exit, Some(ProcessExit::Killed));
        assert!(killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_exit_is_published() {
        let handle = ProcessHandle::watch(Box::new(ScriptedProcess {
            exit_after: Some(Duration::from_millis(10)),
            killed: Arc::new(AtomicBool::new(false)),
        }));
        let mut watcher = handle.exit_watcher();
        let exit = watcher.wait_for(Option::is_some).await.unwrap().clone();
        assert_eq!(exit, Some(ProcessExit::Exited { code: Some(1) }));
        assert_eq!(exit.unwrap().to_string(), "exited with code 1");
    }

    #[tokio::test]
    async fn test_drop_kills_process() {
        let killed = Arc::new(AtomicBool::new(false));
        let handle = ProcessHandle::watch(Box::new(ScriptedProcess {
            exit_after: None,
            killed: Arc::clone(&killed),
        }));
        let mut watcher = handle.exit_watcher();
        drop(handle);
        watcher.wait_for(Option::is_some).await.unwrap();
        assert!(killed.load(Ordering::SeqCst));
    }
}
