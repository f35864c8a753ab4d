//! Periodic idle sweep over the stream registry

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::registry::StreamRegistry;

/// Background task that tears down unused sessions.
pub struct IdleReaper;

impl IdleReaper {
    /// Spawns the sweep loop; abort the returned handle to stop it.
    ///
    /// The first sweep runs one `period` after spawning.
    pub fn spawn(registry: Arc<StreamRegistry>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;
                let report = registry.reap_now().await;
                if report.removed() > 0 {
                    tracing::info!(
                        "Reaper removed {} sessions ({} idle, {} errored)",
                        report.removed(),
                        report.idle.len(),
                        report.errored.len()
                    );
                } else {
                    tracing::trace!("Reaper sweep found nothing to remove");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SluiceConfig;
    use crate::stream::StreamFingerprint;
    use crate::transcode::{SimulatedTranscoder, TranscodeSupervisor};

    #[tokio::test]
    async fn test_reaper_removes_idle_session() {
        let root = tempfile::tempdir().unwrap();
        let mut config = SluiceConfig::for_testing();
        config.transcode.output_root = root.path().to_path_buf();
        let supervisor = Arc::new(TranscodeSupervisor::new(
            Arc::new(SimulatedTranscoder::new()),
            config.transcode,
            config.resolver,
        ));
        let registry = Arc::new(StreamRegistry::new(supervisor, config.registry.clone()));

        let url = url::Url::parse("http://origin.test/live/reap.ts").unwrap();
        let fingerprint = StreamFingerprint::of_normalized(&url);
        let handle = registry.acquire(fingerprint, url).await.unwrap();
        registry.release(fingerprint, None).await.unwrap();

        let reaper = IdleReaper::spawn(Arc::clone(&registry), config.registry.reap_interval);

        let deadline = config.registry.idle_threshold * 4;
        let removed = tokio::time::timeout(deadline, async {
            while registry.get(fingerprint).await.is_some() || handle.output_dir.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        reaper.abort();

        assert!(removed.is_ok(), "idle session was not reaped");
    }
}
