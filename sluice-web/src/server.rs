//! HTTP server wiring for Sluice
//!
//! Builds the shared state for the runtime mode, mounts the routes and runs
//! the idle reaper next to the listener until a shutdown signal arrives.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use sluice_core::config::SluiceConfig;
use sluice_core::transcode::transcoder_for_mode;
use sluice_core::{
    IdleReaper, RedirectResolver, RuntimeMode, SegmentServer, SluiceError, StreamRegistry,
    TranscodeSupervisor,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::handlers::{
    health, list_sessions, release_session, resolve_source, serve_segment, stop_session,
};

/// Errors that prevent the server from starting or keep it from running.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to initialize server: {0}")]
    Init(#[from] SluiceError),

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server terminated: {0}")]
    Serve(#[source] std::io::Error),
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<StreamRegistry>,
    pub resolver: Arc<RedirectResolver>,
    pub segments: Arc<SegmentServer>,
    pub config: Arc<SluiceConfig>,
    pub mode: RuntimeMode,
    pub server_started_at: Instant,
    pub started_at_utc: DateTime<Utc>,
}

impl AppState {
    /// Builds the full component graph for `mode`.
    ///
    /// # Errors
    /// - `ServerError::Init` - The upstream HTTP client could not be built
    pub fn new(config: SluiceConfig, mode: RuntimeMode) -> Result<Self, ServerError> {
        let transcoder = transcoder_for_mode(mode, &config.transcode);
        let supervisor = Arc::new(TranscodeSupervisor::new(
            transcoder,
            config.transcode.clone(),
            config.resolver.clone(),
        ));
        let registry = Arc::new(StreamRegistry::new(supervisor, config.registry.clone()));
        let segments = Arc::new(SegmentServer::new(Arc::clone(&registry)));
        Self::from_parts(config, mode, registry, segments)
    }

    /// Builds state around an existing registry and segment server.
    ///
    /// # Errors
    /// - `ServerError::Init` - The upstream HTTP client could not be built
    pub fn from_parts(
        config: SluiceConfig,
        mode: RuntimeMode,
        registry: Arc<StreamRegistry>,
        segments: Arc<SegmentServer>,
    ) -> Result<Self, ServerError> {
        let resolver = RedirectResolver::new(config.resolver.clone())?;
        Ok(Self {
            registry,
            resolver: Arc::new(resolver),
            segments,
            config: Arc::new(config),
            mode,
            server_started_at: Instant::now(),
            started_at_utc: Utc::now(),
        })
    }
}

/// Mounts every route on a router bound to `state`.
pub fn build_router(state: AppState) -> Router {
    let enable_cors = state.config.server.enable_cors;

    let router = Router::new()
        // Player-facing endpoints
        .route("/resolve", get(resolve_source))
        .route("/segments/{fingerprint}/{file}", get(serve_segment))
        .route("/release", post(release_session))
        .route("/stop", post(stop_session))
        // Operational endpoints
        .route("/api/sessions", get(list_sessions))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Runs the proxy until Ctrl-C, then tears down every session.
///
/// # Errors
/// - `ServerError::Init` - Component construction failed
/// - `ServerError::Bind` - The listen address is unavailable
/// - `ServerError::Serve` - The listener failed while serving
pub async fn run_server(config: SluiceConfig, mode: RuntimeMode) -> Result<(), ServerError> {
    let address = config.server.bind_address;
    let reap_interval = config.registry.reap_interval;
    let state = AppState::new(config, mode)?;

    if !state.registry.supervisor().is_available().await {
        warn!("Transcoder is not available; sources that need transcoding will fail");
    }

    let registry = Arc::clone(&state.registry);
    let reaper = IdleReaper::spawn(Arc::clone(&registry), reap_interval);

    let listener = TcpListener::bind(address)
        .await
        .map_err(|source| ServerError::Bind { address, source })?;
    let local = listener.local_addr().unwrap_or(address);
    info!("Sluice ({}) listening on http://{}", mode, local);

    let served = axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    reaper.abort();
    registry.shutdown().await;
    info!("Sluice stopped");

    served.map_err(ServerError::Serve)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            warn!("Cannot listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
