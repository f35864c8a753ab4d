//! Centralized configuration for Sluice.
//!
//! All tunable parameters are defined here to avoid hard-coded values
//! scattered throughout the codebase. Nothing is persisted; values come from
//! defaults plus `SLUICE_*` environment overrides.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Sluice components.
#[derive(Debug, Clone, Default)]
pub struct SluiceConfig {
    pub server: ServerConfig,
    pub resolver: ResolverConfig,
    pub transcode: TranscodeConfig,
    pub registry: RegistryConfig,
    pub fingerprint: FingerprintConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP surface binds to
    pub bind_address: SocketAddr,
    /// Allow cross-origin requests from the browser catalog
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 3000)),
            enable_cors: true,
        }
    }
}

/// Upstream request configuration used by the redirect resolver.
///
/// Provider-specific headers live in `extra_headers`; the resolver itself
/// only derives `Referer`/`Origin` from the current hop.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Maximum number of `Location` hops followed before giving up
    pub max_redirects: usize,
    /// Timeout for receiving response headers of a single hop
    pub request_timeout: Duration,
    /// TCP connect timeout for a single hop
    pub connect_timeout: Duration,
    /// Browser-like User-Agent sent upstream
    pub user_agent: String,
    /// Accept header sent upstream
    pub accept: String,
    /// Additional headers sent on every hop
    pub extra_headers: Vec<(String, String)>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_redirects: 5,
            request_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
                .to_string(),
            accept: "*/*".to_string(),
            extra_headers: Vec::new(),
        }
    }
}

/// Whether the transcoder re-encodes or copies the elementary streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecPolicy {
    /// Re-encode to H.264 + AAC (always playable)
    Reencode,
    /// Copy video and audio as-is (only valid for browser-compatible sources)
    Copy,
}

impl std::str::FromStr for CodecPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reencode" | "re-encode" | "transcode" => Ok(Self::Reencode),
            "copy" => Ok(Self::Copy),
            _ => Err(format!(
                "Invalid codec policy: '{s}'. Valid options are: reencode, copy"
            )),
        }
    }
}

/// Transcoder invocation and supervision configuration.
#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    /// Transcoder binary path
    pub ffmpeg_path: PathBuf,
    /// Root under which every session gets a private output directory
    pub output_root: PathBuf,
    /// Target HLS segment duration
    pub segment_duration: Duration,
    /// Number of segments kept in the rolling playlist
    pub playlist_size: u32,
    /// Codec policy applied to every session
    pub codec_policy: CodecPolicy,
    /// Upper bound on time to first playable manifest
    pub startup_timeout: Duration,
    /// Filesystem readiness poll period
    pub poll_interval: Duration,
    /// Delay before the first manifest existence check
    pub settle_delay: Duration,
    /// Maximum time without a new segment while ready
    pub stall_timeout: Duration,
    /// Period of the health check while ready
    pub health_check_interval: Duration,
    /// Time allowed for the process to exit after a kill request
    pub kill_grace: Duration,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            output_root: std::env::temp_dir().join("sluice-hls"),
            segment_duration: Duration::from_secs(2),
            playlist_size: 6,
            codec_policy: CodecPolicy::Reencode,
            startup_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(500),
            settle_delay: Duration::from_millis(250),
            stall_timeout: Duration::from_secs(15),
            health_check_interval: Duration::from_secs(2),
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Stream registry and idle reaper configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Period of the idle reaper sweep
    pub reap_interval: Duration,
    /// Unreferenced sessions idle longer than this are torn down
    pub idle_threshold: Duration,
    /// How long a joining `acquire` waits on an in-flight start
    pub acquire_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(10 * 60),  // 10 minutes
            idle_threshold: Duration::from_secs(30 * 60), // 30 minutes
            acquire_timeout: Duration::from_secs(20),
        }
    }
}

/// Source URL normalization applied before fingerprinting.
#[derive(Debug, Clone)]
pub struct FingerprintConfig {
    /// Query keys treated as cache-busting noise and dropped
    pub noise_query_keys: Vec<String>,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            noise_query_keys: ["_", "t", "ts", "cb", "nocache", "rand", "random"]
                .iter()
                .map(|key| key.to_string())
                .collect(),
        }
    }
}

impl SluiceConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Malformed values are ignored so a typo never prevents startup.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(addr) = env_parse::<SocketAddr>("SLUICE_BIND") {
            config.server.bind_address = addr;
        }

        if let Some(max) = env_parse::<usize>("SLUICE_MAX_REDIRECTS") {
            config.resolver.max_redirects = max;
        }

        if let Ok(agent) = std::env::var("SLUICE_USER_AGENT")
            && !agent.trim().is_empty()
        {
            config.resolver.user_agent = agent;
        }

        if let Ok(raw) = std::env::var("SLUICE_UPSTREAM_HEADERS") {
            config.resolver.extra_headers = parse_header_list(&raw);
        }

        if let Ok(path) = std::env::var("SLUICE_FFMPEG_PATH") {
            config.transcode.ffmpeg_path = PathBuf::from(path);
        }

        if let Ok(dir) = std::env::var("SLUICE_OUTPUT_DIR") {
            config.transcode.output_root = PathBuf::from(dir);
        }

        if let Some(seconds) = env_parse::<u64>("SLUICE_SEGMENT_SECONDS")
            && seconds > 0
        {
            config.transcode.segment_duration = Duration::from_secs(seconds);
        }

        if let Some(size) = env_parse::<u32>("SLUICE_PLAYLIST_SIZE")
            && size > 0
        {
            config.transcode.playlist_size = size;
        }

        if let Some(policy) = env_parse::<CodecPolicy>("SLUICE_CODEC_POLICY") {
            config.transcode.codec_policy = policy;
        }

        if let Some(seconds) = env_parse::<u64>("SLUICE_STARTUP_TIMEOUT_SECS") {
            config.transcode.startup_timeout = Duration::from_secs(seconds);
            config.registry.acquire_timeout = Duration::from_secs(seconds + 5);
        }

        if let Some(seconds) = env_parse::<u64>("SLUICE_STALL_TIMEOUT_SECS") {
            config.transcode.stall_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("SLUICE_IDLE_THRESHOLD_SECS") {
            config.registry.idle_threshold = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("SLUICE_REAP_INTERVAL_SECS")
            && seconds > 0
        {
            config.registry.reap_interval = Duration::from_secs(seconds);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Every bound shrinks to milliseconds so lifecycle tests finish quickly.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig {
                bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
                enable_cors: true,
            },
            resolver: ResolverConfig {
                request_timeout: Duration::from_secs(5),
                connect_timeout: Duration::from_secs(2),
                ..Default::default()
            },
            transcode: TranscodeConfig {
                segment_duration: Duration::from_secs(1),
                playlist_size: 4,
                startup_timeout: Duration::from_millis(1500),
                poll_interval: Duration::from_millis(20),
                settle_delay: Duration::from_millis(5),
                stall_timeout: Duration::from_millis(400),
                health_check_interval: Duration::from_millis(50),
                kill_grace: Duration::from_millis(500),
                ..Default::default()
            },
            registry: RegistryConfig {
                reap_interval: Duration::from_millis(100),
                idle_threshold: Duration::from_millis(300),
                acquire_timeout: Duration::from_millis(2500),
            },
            fingerprint: FingerprintConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

/// Parses `Name: value; Name: value` into header pairs, skipping malformed entries.
pub fn parse_header_list(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|entry| {
            let (name, value) = entry.split_once(':')?;
            let name = name.trim();
            let value = value.trim();
            if name.is_empty() || value.is_empty() {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = SluiceConfig::default();

        assert_eq!(config.resolver.max_redirects, 5);
        assert_eq!(config.transcode.startup_timeout, Duration::from_secs(15));
        assert_eq!(config.transcode.poll_interval, Duration::from_millis(500));
        assert_eq!(config.transcode.stall_timeout, Duration::from_secs(15));
        assert_eq!(config.transcode.codec_policy, CodecPolicy::Reencode);
        assert_eq!(config.registry.reap_interval, Duration::from_secs(600));
        assert_eq!(config.registry.idle_threshold, Duration::from_secs(1800));
        assert!(
            config
                .fingerprint
                .noise_query_keys
                .contains(&"nocache".to_string())
        );
    }

    #[test]
    fn test_header_list_parsing() {
        let headers = parse_header_list("X-Token: abc; Cookie: a=b:c ; broken; : empty");
        assert_eq!(
            headers,
            vec![
                ("X-Token".to_string(), "abc".to_string()),
                ("Cookie".to_string(), "a=b:c".to_string()),
            ]
        );
    }

    #[test]
    fn test_codec_policy_parsing() {
        assert_eq!("copy".parse::<CodecPolicy>(), Ok(CodecPolicy::Copy));
        assert_eq!("Reencode".parse::<CodecPolicy>(), Ok(CodecPolicy::Reencode));
        assert!("h265".parse::<CodecPolicy>().is_err());
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("SLUICE_MAX_REDIRECTS", "8");
            std::env::set_var("SLUICE_CODEC_POLICY", "copy");
            std::env::set_var("SLUICE_IDLE_THRESHOLD_SECS", "60");
            std::env::set_var("SLUICE_UPSTREAM_HEADERS", "X-Provider: iptv");
            std::env::set_var("SLUICE_PLAYLIST_SIZE", "not-a-number");
        }

        let config = SluiceConfig::from_env();

        assert_eq!(config.resolver.max_redirects, 8);
        assert_eq!(config.transcode.codec_policy, CodecPolicy::Copy);
        assert_eq!(config.registry.idle_threshold, Duration::from_secs(60));
        assert_eq!(
            config.resolver.extra_headers,
            vec![("X-Provider".to_string(), "iptv".to_string())]
        );
        assert_eq!(config.transcode.playlist_size, 6);

        // Cleanup
        unsafe {
            std::env::remove_var("SLUICE_MAX_REDIRECTS");
            std::env::remove_var("SLUICE_CODEC_POLICY");
            std::env::remove_var("SLUICE_IDLE_THRESHOLD_SECS");
            std::env::remove_var("SLUICE_UPSTREAM_HEADERS");
            std::env::remove_var("SLUICE_PLAYLIST_SIZE");
        }
    }
}
