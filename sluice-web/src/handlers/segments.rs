//! Manifest and segment streaming

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::Response;
use sluice_core::stream::SegmentKind;
use sluice_core::{StreamError, StreamFingerprint};
use tokio_util::io::ReaderStream;

use super::errors::ApiError;
use crate::server::AppState;

/// Streams a manifest or segment from a ready session's output directory.
///
/// Malformed fingerprints and file names are answered like a missing
/// session so players take their restart path.
pub async fn serve_segment(
    State(state): State<AppState>,
    Path((fingerprint, file)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let fingerprint = StreamFingerprint::from_hex(&fingerprint)
        .map_err(|_| ApiError::not_found("Unknown stream"))?;

    let segment = match state.segments.serve(fingerprint, &file).await {
        Ok(segment) => segment,
        Err(StreamError::InvalidSegmentName { .. }) => {
            return Err(ApiError::not_found("Unknown segment"));
        }
        Err(e) => return Err(e.into()),
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, segment.content_type)
        .header(header::CACHE_CONTROL, segment.cache_control.as_str());
    // Segments never change after they are written; manifests may be
    // rewritten while being read.
    if segment.kind == SegmentKind::Segment {
        builder = builder.header(header::CONTENT_LENGTH, segment.len);
    }

    builder
        .body(Body::from_stream(ReaderStream::new(segment.file)))
        .map_err(|e| ApiError::internal(format!("Failed to build segment response: {e}")))
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use axum::http::Request;
    use sluice_core::testing::TestStack;
    use url::Url;

    use super::*;
    use crate::handlers::test_support::{app, send};

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_serves_manifest_and_segment() {
        let stack = TestStack::new();
        let app = app(&stack);
        let url = Url::parse("http://origin.test/live/9.ts").unwrap();
        let fingerprint = StreamFingerprint::of_normalized(&url);
        let handle = stack.registry.acquire(fingerprint, url).await.unwrap();

        let response = send(&app, get(&handle.manifest_url)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/vnd.apple.mpegurl"
        );
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "no-cache, no-store, must-revalidate"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let manifest = String::from_utf8(body.to_vec()).unwrap();
        assert!(manifest.starts_with("#EXTM3U"));

        let segment = manifest
            .lines()
            .rfind(|line| line.ends_with(".ts"))
            .unwrap()
            .to_string();
        let response = send(&app, get(&format!("/segments/{fingerprint}/{segment}"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp2t");
        assert!(
            response.headers()[header::CACHE_CONTROL]
                .to_str()
                .unwrap()
                .starts_with("public, max-age=")
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body[0], 0x47);

        stack.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_or_malformed_requests_are_not_found() {
        let stack = TestStack::new();
        let app = app(&stack);
        let fingerprint = StreamFingerprint::new([9u8; 20]);

        for uri in [
            format!("/segments/{fingerprint}/index.m3u8"),
            "/segments/not-a-fingerprint/index.m3u8".to_string(),
            format!("/segments/{fingerprint}/..%2Fsecret.ts"),
            format!("/segments/{fingerprint}/index.txt"),
        ] {
            let response = send(&app, get(&uri)).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }
}
