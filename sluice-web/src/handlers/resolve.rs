//! Source resolution endpoint

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, header};
use serde::{Deserialize, Serialize};
use sluice_core::{PlaybackKind, StreamError, StreamFingerprint};
use tracing::{debug, info};

use super::errors::ApiError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    pub url: String,
}

/// Playback decision returned to the player.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResponse {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    pub hops: usize,
}

/// Resolves `url` through its redirects and decides how the player should load it.
///
/// Sources that need transcoding are acquired on the registry before the
/// response is sent, so the returned manifest is already playable.
pub async fn resolve_source(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
    headers: HeaderMap,
) -> Result<Json<ResolveResponse>, ApiError> {
    let (fingerprint, normalized) =
        StreamFingerprint::from_source(&query.url, &state.config.fingerprint.noise_query_keys)?;
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());

    let resolved = state.resolver.resolve(&normalized, range).await?;
    let status = resolved.status();
    if !status.is_success() {
        return Err(StreamError::SourceUnreachable {
            url: resolved.final_url.to_string(),
            reason: format!("origin responded {status}"),
        }
        .into());
    }

    let kind = resolved.playback_kind();
    let hops = resolved.hops;
    let final_url = resolved.final_url.clone();
    // Only the headers were needed; close the upstream body.
    drop(resolved);

    debug!(
        "Resolved {} to {} after {} hops: {}",
        normalized, final_url, hops, kind
    );

    match kind {
        PlaybackKind::Direct | PlaybackKind::HlsNative => Ok(Json(ResolveResponse {
            kind: kind.as_str(),
            url: Some(final_url.to_string()),
            manifest_url: None,
            fingerprint: None,
            session_id: None,
            hops,
        })),
        PlaybackKind::NeedsTranscode => {
            let handle = state.registry.acquire(fingerprint, final_url).await?;
            info!(
                "Serving {} through session {} at {}",
                fingerprint, handle.session_id, handle.manifest_url
            );
            Ok(Json(ResolveResponse {
                kind: kind.as_str(),
                url: None,
                manifest_url: Some(handle.manifest_url),
                fingerprint: Some(fingerprint.to_string()),
                session_id: Some(handle.session_id),
                hops,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::{IntoResponse, Redirect};
    use axum::routing::get;
    use sluice_core::testing::TestStack;
    use tokio::net::TcpListener;

    use super::*;
    use crate::handlers::test_support::{app, json_body, send};

    async fn ts_feed() -> impl IntoResponse {
        ([(header::CONTENT_TYPE, "video/mp2t")], vec![0x47u8; 188])
    }

    async fn mp4_file() -> impl IntoResponse {
        ([(header::CONTENT_TYPE, "video/mp4")], "mp4")
    }

    async fn spawn_origin() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let origin = Router::new()
            .route("/live/1.ts", get(ts_feed))
            .route("/movie.mp4", get(mp4_file))
            .route("/short/movie", get(|| async { Redirect::temporary("/movie.mp4") }))
            .route(
                "/channel.m3u8",
                get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "#EXTM3U\n") }),
            )
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }));
        tokio::spawn(async move {
            axum::serve(listener, origin).await.unwrap();
        });
        addr
    }

    fn resolve_request(target: &str) -> Request<Body> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("url", target)
            .finish();
        Request::builder()
            .uri(format!("/resolve?{query}"))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_direct_source_returns_final_url() {
        let origin = spawn_origin().await;
        let stack = TestStack::new();
        let app = app(&stack);

        let response = send(&app, resolve_request(&format!("http://{origin}/short/movie"))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["type"], "direct");
        assert_eq!(body["url"], format!("http://{origin}/movie.mp4"));
        assert_eq!(body["hops"], 1);
        assert!(body.get("manifestUrl").is_none());
        assert_eq!(stack.transcoder.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_hls_source_detected_by_suffix() {
        let origin = spawn_origin().await;
        let stack = TestStack::new();
        let app = app(&stack);

        let response = send(&app, resolve_request(&format!("http://{origin}/channel.m3u8"))).await;
        let body = json_body(response).await;
        assert_eq!(body["type"], "hls");
    }

    #[tokio::test]
    async fn test_transport_stream_is_transcoded() {
        let origin = spawn_origin().await;
        let stack = TestStack::new();
        let app = app(&stack);

        let response = send(&app, resolve_request(&format!("http://{origin}/live/1.ts"))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["type"], "transcode");
        let fingerprint = body["fingerprint"].as_str().unwrap().to_string();
        assert_eq!(
            body["manifestUrl"],
            format!("/segments/{fingerprint}/index.m3u8")
        );
        assert_eq!(stack.transcoder.spawn_count(), 1);

        stack.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let origin = spawn_origin().await;
        let stack = TestStack::new();
        let app = app(&stack);

        let response = send(&app, resolve_request("ftp://origin.test/a.ts")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "invalid_source_url");
        assert_eq!(body["retryable"], false);

        let response = send(&app, resolve_request(&format!("http://{origin}/missing"))).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert_eq!(body["error"], "source_unreachable");
    }
}
