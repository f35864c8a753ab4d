//! CLI command implementations

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result, bail};
use sluice_core::config::SluiceConfig;
use sluice_core::transcode::FfmpegTranscoder;
use sluice_core::{RedirectResolver, RuntimeMode, StreamFingerprint, Transcoder};
use tracing::info;

/// Start the proxy with environment configuration plus CLI overrides.
///
/// # Errors
/// - Invalid `--host` value
/// - Server failed to bind or terminated with an error
pub async fn serve(host: Option<String>, port: Option<u16>, mode: RuntimeMode) -> Result<()> {
    let mut config = SluiceConfig::from_env();
    config.server.bind_address = bind_address(config.server.bind_address, host, port)?;

    info!(
        "Starting Sluice in {} mode, transcoder {}",
        mode,
        config.transcode.ffmpeg_path.display()
    );
    sluice_web::run_server(config, mode).await?;
    Ok(())
}

/// Resolve `raw` once and print the decision.
///
/// # Errors
/// - Invalid source URL, redirect loop or unreachable source
pub async fn resolve(raw: &str) -> Result<()> {
    let config = SluiceConfig::from_env();
    let (fingerprint, normalized) =
        StreamFingerprint::from_source(raw, &config.fingerprint.noise_query_keys)?;
    let resolver = RedirectResolver::new(config.resolver)?;

    let resolved = resolver
        .resolve(&normalized, None)
        .await
        .with_context(|| format!("Failed to resolve {raw}"))?;

    println!("Source:      {normalized}");
    println!("Fingerprint: {fingerprint}");
    println!("Final URL:   {}", resolved.final_url);
    println!("Hops:        {}", resolved.hops);
    println!("Status:      {}", resolved.status());
    if let Some(content_type) = resolved
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
    {
        println!("Type:        {content_type}");
    }
    println!("Playback:    {}", resolved.playback_kind());

    Ok(())
}

/// Check that the configured transcoder binary runs.
///
/// # Errors
/// - The transcoder could not be launched
pub async fn check() -> Result<()> {
    let config = SluiceConfig::from_env();
    let transcoder = FfmpegTranscoder::new(&config.transcode);

    if transcoder.is_available().await {
        println!("Transcoder OK: {}", transcoder.ffmpeg_path().display());
        Ok(())
    } else {
        bail!(
            "Transcoder not available at {} (set SLUICE_FFMPEG_PATH)",
            transcoder.ffmpeg_path().display()
        )
    }
}

fn bind_address(
    current: SocketAddr,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    let ip = match host {
        Some(host) => host
            .parse::<IpAddr>()
            .with_context(|| format!("Invalid host address: {host}"))?,
        None => current.ip(),
    };
    Ok(SocketAddr::new(ip, port.unwrap_or(current.port())))
}
