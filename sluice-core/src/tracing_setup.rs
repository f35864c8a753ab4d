//! Tracing setup for Sluice
//!
//! The console shows the operator's chosen level for sluice's own targets.
//! The HTTP stack underneath the resolver and the server (hyper, reqwest, h2)
//! is held at `warn` there, because every redirect hop and segment request
//! would otherwise flood it. The per-run log file keeps all of sluice at
//! trace, including each hop, readiness poll and FFmpeg diagnostic line, so a
//! failed stream can be reconstructed after the fact.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// File name of the per-run debug log inside the logs directory.
pub const LOG_FILE_NAME: &str = "sluice-last-run.log";

/// Transport crates that log every connection and frame.
const NOISY_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "tower_http"];

/// Filter directives for the console: `level` for sluice, `warn` for the
/// transport crates unless the operator asked for trace.
pub fn console_directives(level: Level) -> String {
    let mut directives = level.to_string().to_lowercase();
    if level < Level::TRACE {
        for target in NOISY_TARGETS {
            directives.push_str(&format!(",{target}=warn"));
        }
    }
    directives
}

/// Filter directives for the log file. Sluice is traced in full; the
/// transport crates stay at debug so the file remains readable under load.
pub fn file_directives() -> String {
    let mut directives = String::from("trace");
    for target in NOISY_TARGETS {
        directives.push_str(&format!(",{target}=debug"));
    }
    directives
}

/// Installs the console layer and the per-run file layer.
///
/// `RUST_LOG` replaces the console directives entirely. The log file under
/// `logs_dir` (default `./logs`) is truncated on every start and its path is
/// returned so the CLI can point the operator at it.
///
/// # Errors
///
/// - `Box<dyn std::error::Error>` - If the logs directory cannot be created, the
///   log file cannot be opened, or a global subscriber is already installed
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let logs_path = logs_dir.unwrap_or_else(|| Path::new("logs"));
    create_dir_all(logs_path)?;

    let log_file_path = logs_path.join(LOG_FILE_NAME);
    let log_file = File::create(&log_file_path)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_directives(console_level)));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(console_filter);

    // Thread ids tell concurrent sessions' supervisor tasks apart in the file.
    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new(file_directives()));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "Tracing initialized: console={}, debug_file={}",
        console_level,
        log_file_path.display()
    );

    Ok(log_file_path)
}

/// CLI log levels for user control
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Only error messages
    Error,
    /// Warning and error messages
    Warn,
    /// Informational, warning, and error messages
    Info,
    /// Debug, informational, warning, and error messages
    Debug,
    /// All messages including per-hop and per-poll detail
    Trace,
}

impl CliLogLevel {
    /// Converts CLI log level to tracing Level enum.
    ///
    /// # Examples
    /// ```
    /// use sluice_core::tracing_setup::CliLogLevel;
    ///
    /// let level = CliLogLevel::Debug.as_tracing_level();
    /// assert_eq!(level, tracing::Level::DEBUG);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CliLogLevel::Error => "error",
            CliLogLevel::Warn => "warn",
            CliLogLevel::Info => "info",
            CliLogLevel::Debug => "debug",
            CliLogLevel::Trace => "trace",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_level_mapping() {
        assert_eq!(CliLogLevel::Error.as_tracing_level(), Level::ERROR);
        assert_eq!(CliLogLevel::Trace.as_tracing_level(), Level::TRACE);
        assert_eq!(CliLogLevel::Warn.to_string(), "warn");
    }

    #[test]
    fn test_console_quiets_transport_crates() {
        let directives = console_directives(Level::DEBUG);
        assert!(directives.starts_with("debug,"));
        assert!(directives.contains("hyper=warn"));
        assert!(directives.contains("reqwest=warn"));
        assert!(EnvFilter::try_new(&directives).is_ok());

        assert_eq!(console_directives(Level::TRACE), "trace");
    }

    #[test]
    fn test_file_keeps_sluice_at_trace() {
        let directives = file_directives();
        assert!(directives.starts_with("trace,"));
        assert!(directives.contains("h2=debug"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }
}
