//! Session release, explicit stop and operational endpoints

use axum::Json;
use axum::extract::State;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};
use sluice_core::StreamFingerprint;
use sluice_core::stream::SessionSnapshot;
use tracing::info;

use super::errors::ApiError;
use crate::server::AppState;

/// Body of `/release` and `/stop`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintRequest {
    pub fingerprint: String,
    /// Session the client was handed by `/resolve`. Only `/release` uses it.
    #[serde(default)]
    pub session_id: Option<u64>,
}

/// Parses the body as JSON whatever the declared content type.
///
/// Browsers posting through `navigator.sendBeacon` send `text/plain`.
fn parse_request(body: &[u8]) -> Result<(StreamFingerprint, Option<u64>), ApiError> {
    let request: FingerprintRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request(format!("Expected {{\"fingerprint\": ...}}: {e}")))?;
    let fingerprint = StreamFingerprint::from_hex(request.fingerprint.trim())?;
    Ok((fingerprint, request.session_id))
}

/// Drops one client reference; teardown is left to the idle reaper.
///
/// A release naming a session that has already been replaced is acknowledged
/// without touching the current one.
pub async fn release_session(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let (fingerprint, session_id) = parse_request(&body)?;
    let clients = state.registry.release(fingerprint, session_id).await?;
    Ok(Json(json!({ "ok": true, "clients": clients })))
}

/// Tears the session down immediately regardless of its clients.
pub async fn stop_session(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let (fingerprint, _) = parse_request(&body)?;
    state.registry.stop(fingerprint).await?;
    info!("Stopped session for {} on request", fingerprint);
    Ok(Json(json!({ "ok": true })))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.registry.snapshot().await)
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let transcoder_available = state.registry.supervisor().is_available().await;
    Json(json!({
        "status": "ok",
        "mode": state.mode.to_string().to_lowercase(),
        "transcoder_available": transcoder_available,
        "active_sessions": state.registry.len().await,
        "started_at": state.started_at_utc,
        "uptime_seconds": state.server_started_at.elapsed().as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use sluice_core::SimulatedTranscoder;
    use sluice_core::stream::SessionState;
    use sluice_core::testing::TestStack;
    use sluice_core::transcode::SimulatedBehavior;
    use url::Url;

    use super::*;
    use crate::handlers::test_support::{app, json_body, send};

    fn post(uri: &str, content_type: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap()
    }

    async fn acquired(stack: &TestStack, n: u32) -> StreamFingerprint {
        let url = Url::parse(&format!("http://origin.test/live/{n}.ts")).unwrap();
        let fingerprint = StreamFingerprint::of_normalized(&url);
        stack.registry.acquire(fingerprint, url).await.unwrap();
        fingerprint
    }

    #[tokio::test]
    async fn test_release_accepts_beacon_bodies() {
        let stack = TestStack::new();
        let app = app(&stack);
        let fingerprint = acquired(&stack, 1).await;
        let body = format!(r#"{{"fingerprint":"{fingerprint}"}}"#);

        let response = send(&app, post("/release", "text/plain;charset=UTF-8", body.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["ok"], true);
        assert_eq!(json["clients"], 0);

        let response = send(&app, post("/release", "application/json", body)).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["error"], "not_acquired");

        stack.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_late_beacon_from_crashed_session_is_acknowledged_only() {
        let stack = TestStack::with_transcoder(
            SimulatedTranscoder::new()
                .with_segment_interval(Duration::from_millis(30))
                .with_behavior(SimulatedBehavior::CrashAfter {
                    segments: 4,
                    code: 1,
                }),
        );
        let app = app(&stack);
        let url = Url::parse("http://origin.test/live/flaky.ts").unwrap();
        let fingerprint = StreamFingerprint::of_normalized(&url);

        let crashed = stack
            .registry
            .acquire(fingerprint, url.clone())
            .await
            .unwrap();
        let mut state_rx = stack.registry.get(fingerprint).await.unwrap().subscribe();
        tokio::time::timeout(
            Duration::from_secs(3),
            state_rx.wait_for(|state| *state == SessionState::Errored),
        )
        .await
        .unwrap()
        .unwrap();
        let current = stack.registry.acquire(fingerprint, url).await.unwrap();

        let stale = format!(
            r#"{{"fingerprint":"{fingerprint}","sessionId":{}}}"#,
            crashed.session_id
        );
        let response = send(&app, post("/release", "text/plain;charset=UTF-8", stale)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["ok"], true);
        assert_eq!(json["clients"], 1);
        assert_eq!(
            stack
                .registry
                .session(fingerprint)
                .await
                .unwrap()
                .client_ref_count,
            1
        );

        let own = format!(
            r#"{{"fingerprint":"{fingerprint}","sessionId":{}}}"#,
            current.session_id
        );
        let response = send(&app, post("/release", "text/plain;charset=UTF-8", own)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["clients"], 0);

        stack.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_release_rejects_bad_input() {
        let stack = TestStack::new();
        let app = app(&stack);

        let response = send(&app, post("/release", "text/plain", "nope".to_string())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(
            &app,
            post("/release", "text/plain", r#"{"fingerprint":"abc"}"#.to_string()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let unknown = StreamFingerprint::new([3u8; 20]);
        let response = send(
            &app,
            post(
                "/release",
                "application/json",
                format!(r#"{{"fingerprint":"{unknown}"}}"#),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stop_and_listing() {
        let stack = TestStack::new();
        let app = app(&stack);
        let fingerprint = acquired(&stack, 2).await;

        let response = send(
            &app,
            Request::builder()
                .uri("/api/sessions")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let sessions = json_body(response).await;
        assert_eq!(sessions.as_array().unwrap().len(), 1);
        assert_eq!(sessions[0]["fingerprint"], fingerprint.to_string());
        assert_eq!(sessions[0]["state"], "ready");
        assert_eq!(sessions[0]["client_ref_count"], 1);

        let body = format!(r#"{{"fingerprint":"{fingerprint}"}}"#);
        let response = send(&app, post("/stop", "application/json", body.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(stack.registry.is_empty().await);

        let response = send(&app, post("/stop", "application/json", body)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_reports_mode_and_sessions() {
        let stack = TestStack::new();
        let app = app(&stack);
        acquired(&stack, 3).await;

        let response = send(
            &app,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["mode"], "development");
        assert_eq!(json["transcoder_available"], true);
        assert_eq!(json["active_sessions"], 1);

        stack.registry.shutdown().await;
    }
}
