//! Simulated transcoder for development mode and tests
//!
//! Writes a synthetic rolling HLS window into the session directory with the
//! same file layout and stderr markers as FFmpeg, so registry, supervisor and
//! segment server run end to end without the real binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ffmpeg::{MANIFEST_FILE_NAME, TranscodeJob, Transcoder};
use super::process::{ProcessExit, TranscodeProcess};
use crate::config::TranscodeConfig;
use crate::stream::{StreamError, StreamResult};

/// Size of one MPEG-TS packet.
const TS_PACKET_SIZE: usize = 188;

/// Packets written per synthetic segment.
const PACKETS_PER_SEGMENT: usize = 16;

/// Scripted behaviour of every process the simulation launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedBehavior {
    /// Produces segments until killed
    Healthy,
    /// Runs but never writes a manifest
    NeverReady,
    /// Exits before producing output
    ExitImmediately { code: i32 },
    /// Produces `segments` segments then exits with `code`
    CrashAfter { segments: u64, code: i32 },
    /// Produces `segments` segments then hangs without output
    StallAfter { segments: u64 },
    /// Launch fails as if the binary were missing
    Unavailable,
}

/// Transcoder that fakes FFmpeg output on disk.
#[derive(Debug, Clone)]
pub struct SimulatedTranscoder {
    behavior: SimulatedBehavior,
    segment_interval: Duration,
    segment_duration: Duration,
    playlist_size: u32,
    spawn_count: Arc<AtomicUsize>,
}

impl SimulatedTranscoder {
    /// Creates a healthy simulation producing a segment every 100ms.
    pub fn new() -> Self {
        Self {
            behavior: SimulatedBehavior::Healthy,
            segment_interval: Duration::from_millis(100),
            segment_duration: Duration::from_secs(1),
            playlist_size: 4,
            spawn_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Creates a healthy simulation pacing segments in real time.
    pub fn from_config(config: &TranscodeConfig) -> Self {
        Self {
            segment_interval: config.segment_duration,
            segment_duration: config.segment_duration,
            playlist_size: config.playlist_size.max(1),
            ..Self::new()
        }
    }

    pub fn with_behavior(mut self, behavior: SimulatedBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_segment_interval(mut self, interval: Duration) -> Self {
        self.segment_interval = interval;
        self
    }

    pub fn with_playlist_size(mut self, playlist_size: u32) -> Self {
        self.playlist_size = playlist_size.max(1);
        self
    }

    /// Number of processes launched so far, shared across clones.
    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedTranscoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transcoder for SimulatedTranscoder {
    async fn spawn(&self, job: &TranscodeJob) -> StreamResult<Box<dyn TranscodeProcess>> {
        if self.behavior == SimulatedBehavior::Unavailable {
            return Err(StreamError::TranscoderUnavailable {
                reason: "simulated transcoder unavailable".to_string(),
            });
        }

        let launch = self.spawn_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(
            "Simulated transcoder launch #{} ({:?}) for {}",
            launch,
            self.behavior,
            job.source_url
        );

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let writer = SegmentWriter {
            output_dir: job.output_dir.clone(),
            segment_interval: self.segment_interval,
            segment_duration: self.segment_duration,
            playlist_size: self.playlist_size,
            lines: line_tx,
        };
        let task = tokio::spawn(writer.run(self.behavior));

        Ok(Box::new(SimulatedProcess {
            task: Some(task),
            exit: None,
            diagnostics: Some(line_rx),
        }))
    }

    async fn is_available(&self) -> bool {
        self.behavior != SimulatedBehavior::Unavailable
    }
}

struct SimulatedProcess {
    task: Option<JoinHandle<ProcessExit>>,
    exit: Option<ProcessExit>,
    diagnostics: Option<mpsc::UnboundedReceiver<String>>,
}

#[async_trait]
impl TranscodeProcess for SimulatedProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn take_diagnostics(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.diagnostics.take()
    }

    async fn wait(&mut self) -> ProcessExit {
        let Some(task) = self.task.as_mut() else {
            return self.exit.clone().unwrap_or(ProcessExit::Killed);
        };
        let exit = match task.await {
            Ok(exit) => exit,
            Err(e) if e.is_cancelled() => ProcessExit::Killed,
            Err(e) => ProcessExit::WaitFailed {
                reason: e.to_string(),
            },
        };
        self.task = None;
        self.exit = Some(exit.clone());
        exit
    }

    async fn kill(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            self.exit = Some(ProcessExit::Killed);
        }
    }
}

struct SegmentWriter {
    output_dir: PathBuf,
    segment_interval: Duration,
    segment_duration: Duration,
    playlist_size: u32,
    lines: mpsc::UnboundedSender<String>,
}

impl SegmentWriter {
    async fn run(self, behavior: SimulatedBehavior) -> ProcessExit {
        self.emit(format!(
            "Input #0, mpegts, from '{}':",
            self.output_dir.display()
        ));

        match behavior {
            SimulatedBehavior::Healthy => self
                .produce(None)
                .await
                .unwrap_or(ProcessExit::Exited { code: Some(0) }),
            SimulatedBehavior::NeverReady => std::future::pending().await,
            SimulatedBehavior::ExitImmediately { code } => {
                self.emit("Connection refused".to_string());
                ProcessExit::Exited { code: Some(code) }
            }
            SimulatedBehavior::CrashAfter { segments, code } => {
                if let Some(exit) = self.produce(Some(segments)).await {
                    return exit;
                }
                self.emit("Error in the pull function.".to_string());
                ProcessExit::Exited { code: Some(code) }
            }
            SimulatedBehavior::StallAfter { segments } => {
                if let Some(exit) = self.produce(Some(segments)).await {
                    return exit;
                }
                std::future::pending().await
            }
            SimulatedBehavior::Unavailable => ProcessExit::Exited { code: Some(127) },
        }
    }

    /// Writes `limit` segments (forever when `None`).
    ///
    /// Returns an exit only when writing fails.
    async fn produce(&self, limit: Option<u64>) -> Option<ProcessExit> {
        let mut sequence = 0u64;
        while limit.is_none_or(|limit| sequence < limit) {
            tokio::time::sleep(self.segment_interval).await;
            if let Err(e) = self.write_segment(sequence).await {
                self.emit(format!("Failed to write segment {sequence}: {e}"));
                return Some(ProcessExit::Exited { code: Some(1) });
            }
            sequence += 1;
        }
        None
    }

    async fn write_segment(&self, sequence: u64) -> std::io::Result<()> {
        let name = segment_file_name(sequence);
        let path = self.output_dir.join(&name);
        self.emit(format!("[hls @ sim] Opening '{}' for writing", path.display()));
        tokio::fs::write(&path, synthetic_segment(sequence)).await?;

        let window = u64::from(self.playlist_size);
        let first = (sequence + 1).saturating_sub(window);
        let playlist = render_media_playlist(first, sequence + 1 - first, self.segment_duration);
        write_atomically(&self.output_dir.join(MANIFEST_FILE_NAME), playlist.as_bytes()).await?;

        if sequence >= window {
            let expired = self.output_dir.join(segment_file_name(sequence - window));
            let _ = tokio::fs::remove_file(expired).await;
        }
        Ok(())
    }

    fn emit(&self, line: String) {
        let _ = self.lines.send(line);
    }
}

fn segment_file_name(sequence: u64) -> String {
    format!("segment_{sequence:05}.ts")
}

fn synthetic_segment(sequence: u64) -> Vec<u8> {
    let mut data = vec![0xffu8; TS_PACKET_SIZE * PACKETS_PER_SEGMENT];
    for (index, packet) in data.chunks_mut(TS_PACKET_SIZE).enumerate() {
        packet[0] = 0x47;
        packet[1] = 0x01;
        packet[2] = 0x00;
        packet[3] = 0x10 | ((sequence as usize + index) & 0x0f) as u8;
    }
    data
}

async fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let staging = path.with_extension("m3u8.tmp");
    tokio::fs::write(&staging, contents).await?;
    tokio::fs::rename(&staging, path).await
}

/// Renders a live media playlist covering `count` segments from `first_sequence`.
pub fn render_media_playlist(first_sequence: u64, count: u64, segment_duration: Duration) -> String {
    let seconds = segment_duration.as_secs_f64();
    let mut playlist = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{}\n#EXT-X-MEDIA-SEQUENCE:{}\n",
        seconds.ceil() as u64,
        first_sequence
    );
    for sequence in first_sequence..first_sequence + count {
        playlist.push_str(&format!(
            "#EXTINF:{seconds:.3},\n{}\n",
            segment_file_name(sequence)
        ));
    }
    playlist
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(dir: &Path) -> TranscodeJob {
        TranscodeJob {
            source_url: url::Url::parse("http://origin.test/live/1.ts").unwrap(),
            output_dir: dir.to_path_buf(),
            user_agent: "test".to_string(),
            headers: Vec::new(),
        }
    }

    #[test]
    fn test_playlist_rendering() {
        let playlist = render_media_playlist(3, 2, Duration::from_secs(2));
        assert!(playlist.starts_with("#EXTM3U\n"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:3\n"));
        assert!(playlist.contains("segment_00003.ts\n"));
        assert!(playlist.contains("segment_00004.ts\n"));
        assert!(!playlist.contains("segment_00005.ts"));
        assert!(!playlist.contains("#EXT-X-ENDLIST"));
    }

    #[tokio::test]
    async fn test_healthy_simulation_rolls_window() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = SimulatedTranscoder::new()
            .with_segment_interval(Duration::from_millis(10))
            .with_playlist_size(2);

        let mut process = transcoder.spawn(&job(dir.path())).await.unwrap();
        let mut lines = process.take_diagnostics().unwrap();
        assert!(process.take_diagnostics().is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        process.kill().await;

        let manifest = std::fs::read_to_string(dir.path().join(MANIFEST_FILE_NAME)).unwrap();
        assert!(manifest.contains("#EXTINF"));

        let segments = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "ts"))
            .count();
        assert!(segments <= 3, "old segments must be deleted, found {segments}");
        assert!(!dir.path().join("segment_00000.ts").exists());

        let mut saw_marker = false;
        while let Ok(line) = lines.try_recv() {
            saw_marker |= crate::transcode::ffmpeg::segment_written(&line).is_some();
        }
        assert!(saw_marker);
        assert_eq!(transcoder.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_crash_after_segments_exits_with_code() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = SimulatedTranscoder::new()
            .with_segment_interval(Duration::from_millis(5))
            .with_behavior(SimulatedBehavior::CrashAfter {
                segments: 2,
                code: 3,
            });

        let mut process = transcoder.spawn(&job(dir.path())).await.unwrap();
        assert_eq!(process.wait().await, ProcessExit::Exited { code: Some(3) });
        assert_eq!(process.wait().await, ProcessExit::Exited { code: Some(3) });
        assert!(dir.path().join(MANIFEST_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_unavailable_simulation() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = SimulatedTranscoder::new().with_behavior(SimulatedBehavior::Unavailable);
        assert!(!transcoder.is_available().await);
        assert!(matches!(
            transcoder.spawn(&job(dir.path())).await,
            Err(StreamError::TranscoderUnavailable { .. })
        ));
        assert_eq!(transcoder.spawn_count(), 0);
    }
}
