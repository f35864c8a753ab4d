//! Mock upstream origin shared by integration and end-to-end tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use tokio::net::TcpListener;

#[derive(Clone)]
struct OriginState {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

/// Origin on `127.0.0.1:0` serving redirect chains and media of each kind.
///
/// - `/a` → `/b` (relative) → `http://<self>/c` (absolute) → MPEG-TS
/// - `/loop/{n}` → `/loop/{n+1}` forever
/// - `/hop/{target}` → absolute redirect to another origin address
/// - `/live/{file}` → MPEG-TS, `/movie.mp4` → MP4, `/channel.m3u8` → HLS
/// - `/echo` → request headers as JSON
pub struct MockOrigin {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl MockOrigin {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let state = OriginState {
            addr,
            hits: Arc::clone(&hits),
        };

        let app = Router::new()
            .route("/a", get(|| async { Redirect::temporary("/b") }))
            .route("/b", get(to_c))
            .route("/c", get(transport_stream))
            .route("/loop/{n}", get(redirect_loop))
            .route("/hop/{target}", get(hop_to))
            .route("/live/{file}", get(transport_stream))
            .route("/movie.mp4", get(mp4))
            .route(
                "/channel.m3u8",
                get(|| async {
                    (
                        [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
                        "#EXTM3U\n",
                    )
                }),
            )
            .route("/echo", get(echo))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, hits }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Requests received by every route.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn to_c(State(state): State<OriginState>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    Redirect::temporary(&format!("http://{}/c", state.addr)).into_response()
}

async fn redirect_loop(State(state): State<OriginState>, Path(n): Path<u32>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    Redirect::temporary(&format!("/loop/{}", n + 1)).into_response()
}

async fn hop_to(State(state): State<OriginState>, Path(target): Path<String>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    Redirect::temporary(&format!("http://{target}/echo")).into_response()
}

async fn transport_stream(State(state): State<OriginState>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    ([(header::CONTENT_TYPE, "video/mp2t")], vec![0x47u8; 188 * 4]).into_response()
}

async fn mp4(State(state): State<OriginState>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    ([(header::CONTENT_TYPE, "video/mp4")], "ftyp").into_response()
}

async fn echo(State(state): State<OriginState>, headers: HeaderMap) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let seen: serde_json::Map<String, serde_json::Value> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), serde_json::Value::from(v)))
        })
        .collect();
    (StatusCode::OK, axum::Json(seen)).into_response()
}
