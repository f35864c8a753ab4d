//! Transcoder abstraction and the FFmpeg subprocess implementation

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use url::Url;

use super::process::{ProcessExit, TranscodeProcess};
use crate::config::{CodecPolicy, TranscodeConfig};
use crate::stream::{StreamError, StreamResult};

/// Manifest file written into every session output directory.
pub const MANIFEST_FILE_NAME: &str = "index.m3u8";

/// Segment file name pattern handed to the transcoder.
pub const SEGMENT_FILE_PATTERN: &str = "segment_%05d.ts";

/// Launches transcoder processes for stream sessions.
///
/// Implemented by the real FFmpeg launcher and by a simulation that writes
/// synthetic HLS output, so the supervisor can be exercised offline.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Starts a transcoder writing HLS output for `job`.
    ///
    /// # Errors
    /// - `StreamError::TranscoderUnavailable` - Binary missing or not executable
    async fn spawn(&self, job: &TranscodeJob) -> StreamResult<Box<dyn TranscodeProcess>>;

    /// Check if the transcoder can be launched at all.
    async fn is_available(&self) -> bool;
}

/// Everything a transcoder needs to start one session.
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    /// Input URL read by the transcoder
    pub source_url: Url,
    /// Session-private directory receiving manifest and segments
    pub output_dir: PathBuf,
    /// User-Agent presented to the source
    pub user_agent: String,
    /// Additional request headers (Referer, Origin, provider extras)
    pub headers: Vec<(String, String)>,
}

impl TranscodeJob {
    /// Path of the manifest inside the output directory.
    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(MANIFEST_FILE_NAME)
    }
}

/// HLS output shape shared by all sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct HlsOptions {
    pub segment_duration: Duration,
    pub playlist_size: u32,
    pub codec_policy: CodecPolicy,
}

impl From<&TranscodeConfig> for HlsOptions {
    fn from(config: &TranscodeConfig) -> Self {
        Self {
            segment_duration: config.segment_duration,
            playlist_size: config.playlist_size,
            codec_policy: config.codec_policy,
        }
    }
}

/// Builds the FFmpeg argument list for `job`.
pub fn build_ffmpeg_args(job: &TranscodeJob, options: &HlsOptions) -> Vec<String> {
    let segment_seconds = options.segment_duration.as_secs_f64().max(1.0);
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-nostdin".into(),
        "-nostats".into(),
        "-loglevel".into(),
        "info".into(),
    ];

    // Input options apply to the next -i
    args.extend(["-user_agent".into(), job.user_agent.clone()]);
    if !job.headers.is_empty() {
        let headers: String = job
            .headers
            .iter()
            .map(|(name, value)| format!("{name}: {value}\r\n"))
            .collect();
        args.extend(["-headers".into(), headers]);
    }
    for (flag, value) in [
        ("-reconnect", "1"),
        ("-reconnect_streamed", "1"),
        ("-reconnect_on_network_error", "1"),
        ("-reconnect_delay_max", "5"),
    ] {
        args.extend([flag.into(), value.into()]);
    }
    args.extend(["-i".into(), job.source_url.to_string()]);

    args.extend([
        "-map".into(),
        "0:v:0?".into(),
        "-map".into(),
        "0:a:0?".into(),
    ]);

    match options.codec_policy {
        CodecPolicy::Reencode => {
            args.extend(
                [
                    "-c:v",
                    "libx264",
                    "-preset",
                    "veryfast",
                    "-tune",
                    "zerolatency",
                    "-pix_fmt",
                    "yuv420p",
                    "-sc_threshold",
                    "0",
                ]
                .map(String::from),
            );
            args.extend([
                "-force_key_frames".into(),
                format!("expr:gte(t,n_forced*{segment_seconds})"),
            ]);
            args.extend(
                ["-c:a", "aac", "-b:a", "128k", "-ac", "2", "-ar", "48000"].map(String::from),
            );
        }
        CodecPolicy::Copy => {
            args.extend(["-c:v", "copy", "-c:a", "copy"].map(String::from));
        }
    }

    args.extend([
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        segment_seconds.to_string(),
        "-hls_list_size".into(),
        options.playlist_size.to_string(),
        "-hls_flags".into(),
        "delete_segments+independent_segments+omit_endlist".into(),
        "-hls_segment_filename".into(),
        job.output_dir
            .join(SEGMENT_FILE_PATTERN)
            .to_string_lossy()
            .into_owned(),
        job.manifest_path().to_string_lossy().into_owned(),
    ]);

    args
}

/// Extracts the segment path from an FFmpeg "Opening '...ts' for writing" line.
///
/// Returns `None` for any other line, including manifest writes.
pub fn segment_written(line: &str) -> Option<&str> {
    let start = line.find("Opening '")? + "Opening '".len();
    let rest = &line[start..];
    let end = rest.find("' for writing")?;
    let path = &rest[..end];
    path.ends_with(".ts").then_some(path)
}

/// Production transcoder that launches the FFmpeg binary.
pub struct FfmpegTranscoder {
    ffmpeg_path: PathBuf,
    options: HlsOptions,
}

impl FfmpegTranscoder {
    pub fn new(config: &TranscodeConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            options: HlsOptions::from(config),
        }
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg_path
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn spawn(&self, job: &TranscodeJob) -> StreamResult<Box<dyn TranscodeProcess>> {
        let args = build_ffmpeg_args(job, &self.options);
        tracing::debug!("FFmpeg command: {} {:?}", self.ffmpeg_path.display(), args);

        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamError::TranscoderUnavailable {
                reason: format!("failed to launch {}: {e}", self.ffmpeg_path.display()),
            })?;

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            tracing::trace!("FFmpeg: {}", line);
                            if line_tx.send(line.to_string()).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!("Error reading FFmpeg stderr: {}", e);
                            break;
                        }
                    }
                }
            });
        }

        tracing::info!(
            "Started FFmpeg (pid {:?}) for {}",
            child.id(),
            job.output_dir.display()
        );

        Ok(Box::new(FfmpegProcess {
            pid: child.id(),
            child,
            diagnostics: Some(line_rx),
        }))
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.ffmpeg_path)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

struct FfmpegProcess {
    pid: Option<u32>,
    child: Child,
    diagnostics: Option<mpsc::UnboundedReceiver<String>>,
}

#[async_trait]
impl TranscodeProcess for FfmpegProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn take_diagnostics(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.diagnostics.take()
    }

    async fn wait(&mut self) -> ProcessExit {
        match self.child.wait().await {
            Ok(status) => ProcessExit::Exited {
                code: status.code(),
            },
            Err(e) => ProcessExit::WaitFailed {
                reason: e.to_string(),
            },
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!("Failed to kill FFmpeg (pid {:?}): {}", self.pid, e);
        }
    }
}
