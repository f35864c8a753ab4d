//! External transcoder integration
//!
//! The transcoder is an opaque subprocess that turns a source URL into a
//! rolling HLS window on disk. [`Transcoder`] launches it, [`ProcessHandle`]
//! owns it, and [`TranscodeSupervisor`] decides readiness and health from the
//! files it writes.

pub mod ffmpeg;
pub mod process;
pub mod simulation;
pub mod supervisor;

use std::sync::Arc;

pub use ffmpeg::{
    FfmpegTranscoder, HlsOptions, MANIFEST_FILE_NAME, SEGMENT_FILE_PATTERN, TranscodeJob,
    Transcoder, build_ffmpeg_args, segment_written,
};
pub use process::{ProcessExit, ProcessHandle, TranscodeProcess};
pub use simulation::{SimulatedBehavior, SimulatedTranscoder, render_media_playlist};
pub use supervisor::TranscodeSupervisor;

use crate::config::TranscodeConfig;
use crate::mode::RuntimeMode;

/// Picks the transcoder implementation for the runtime mode.
pub fn transcoder_for_mode(mode: RuntimeMode, config: &TranscodeConfig) -> Arc<dyn Transcoder> {
    match mode {
        RuntimeMode::Production => Arc::new(FfmpegTranscoder::new(config)),
        RuntimeMode::Development => Arc::new(SimulatedTranscoder::from_config(config)),
    }
}
