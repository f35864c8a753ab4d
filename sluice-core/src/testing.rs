//! Test fixtures wiring a registry to the simulated transcoder.
//!
//! Provides a standardized stack with a private output root so lifecycle
//! tests across crates do not share state.

use std::path::Path;
use std::sync::Arc;

use crate::config::SluiceConfig;
use crate::stream::{SegmentServer, StreamRegistry};
use crate::transcode::{SimulatedTranscoder, TranscodeSupervisor};

/// Registry, supervisor and segment server backed by a simulated transcoder.
pub struct TestStack {
    pub config: SluiceConfig,
    pub transcoder: SimulatedTranscoder,
    pub supervisor: Arc<TranscodeSupervisor>,
    pub registry: Arc<StreamRegistry>,
    pub segments: Arc<SegmentServer>,
    output_root: tempfile::TempDir,
}

impl TestStack {
    /// Builds a stack with `SluiceConfig::for_testing` and a healthy simulation.
    pub fn new() -> Self {
        Self::with_transcoder(SimulatedTranscoder::new())
    }

    /// Builds a stack around a specific simulated transcoder.
    pub fn with_transcoder(transcoder: SimulatedTranscoder) -> Self {
        Self::with_config(SluiceConfig::for_testing(), transcoder)
    }

    /// Builds a stack with custom configuration; the output root is replaced
    /// by a fresh temporary directory.
    ///
    /// # Panics
    ///
    /// Panics if the temporary output root cannot be created. This is
    /// acceptable in fixtures where failure indicates an environment issue.
    pub fn with_config(mut config: SluiceConfig, transcoder: SimulatedTranscoder) -> Self {
        let output_root = tempfile::tempdir().unwrap();
        config.transcode.output_root = output_root.path().join("hls");

        let supervisor = Arc::new(TranscodeSupervisor::new(
            Arc::new(transcoder.clone()),
            config.transcode.clone(),
            config.resolver.clone(),
        ));
        let registry = Arc::new(StreamRegistry::new(
            Arc::clone(&supervisor),
            config.registry.clone(),
        ));
        let segments = Arc::new(SegmentServer::new(Arc::clone(&registry)));

        Self {
            config,
            transcoder,
            supervisor,
            registry,
            segments,
            output_root,
        }
    }

    /// Directory under which session output directories are created.
    pub fn output_root(&self) -> &Path {
        self.output_root.path()
    }
}

impl Default for TestStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_uses_private_output_root() {
        let stack = TestStack::new();
        assert!(
            stack
                .config
                .transcode
                .output_root
                .starts_with(stack.output_root())
        );
        assert_eq!(stack.transcoder.spawn_count(), 0);
    }
}
