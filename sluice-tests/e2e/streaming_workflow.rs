//! Player workflow over real HTTP: resolve, play, release, reap

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sluice_core::testing::TestStack;
use sluice_core::{IdleReaper, RuntimeMode};
use sluice_web::{AppState, build_router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::common::MockOrigin;

struct RunningProxy {
    addr: SocketAddr,
    stack: TestStack,
    reaper: JoinHandle<()>,
    client: reqwest::Client,
}

impl RunningProxy {
    async fn start() -> Self {
        let stack = TestStack::new();
        let state = AppState::from_parts(
            stack.config.clone(),
            RuntimeMode::Development,
            Arc::clone(&stack.registry),
            Arc::clone(&stack.segments),
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let reaper = IdleReaper::spawn(
            Arc::clone(&stack.registry),
            stack.config.registry.reap_interval,
        );

        Self {
            addr,
            stack,
            reaper,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn resolve(&self, source: &str) -> reqwest::Response {
        self.client
            .get(self.url("/resolve"))
            .query(&[("url", source)])
            .send()
            .await
            .unwrap()
    }
}

impl Drop for RunningProxy {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

#[tokio::test]
async fn test_transcode_play_release_and_reap() {
    let origin = MockOrigin::start().await;
    let proxy = RunningProxy::start().await;

    // Resolve: a raw transport stream must be transcoded.
    let response = proxy.resolve(&origin.url("/live/123.ts")).await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["type"], "transcode");
    let fingerprint = body["fingerprint"].as_str().unwrap().to_string();
    let session_id = body["sessionId"].as_u64().unwrap();
    let manifest_url = body["manifestUrl"].as_str().unwrap().to_string();
    assert_eq!(manifest_url, format!("/segments/{fingerprint}/index.m3u8"));

    // Play: the manifest and its newest segment are served.
    let response = proxy
        .client
        .get(proxy.url(&manifest_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "application/vnd.apple.mpegurl"
    );
    let manifest = response.text().await.unwrap();
    let segment = manifest
        .lines()
        .rfind(|line| line.ends_with(".ts"))
        .unwrap()
        .to_string();

    let response = proxy
        .client
        .get(proxy.url(&format!("/segments/{fingerprint}/{segment}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "video/mp2t");
    let bytes = response.bytes().await.unwrap();
    assert!(!bytes.is_empty());
    assert_eq!(bytes[0], 0x47);

    // Release the way a page-unload beacon does.
    let response = proxy
        .client
        .post(proxy.url("/release"))
        .header("content-type", "text/plain;charset=UTF-8")
        .body(format!(
            r#"{{"fingerprint":"{fingerprint}","sessionId":{session_id}}}"#
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Reap: once idle past the threshold the session goes away. Polling the
    // manifest here would count as playback, so watch the registry instead.
    let deadline = proxy.stack.config.registry.idle_threshold * 5;
    let gone = tokio::time::timeout(deadline, async {
        while !proxy.stack.registry.is_empty().await {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "session was not reaped after release");

    let response = proxy
        .client
        .get(proxy.url(&manifest_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_concurrent_players_share_one_session() {
    let origin = MockOrigin::start().await;
    let proxy = RunningProxy::start().await;
    let source = origin.url("/live/popular.ts");

    let bodies = futures::future::join_all((0..5).map(|_| async {
        proxy
            .resolve(&source)
            .await
            .json::<serde_json::Value>()
            .await
            .unwrap()
    }))
    .await;

    assert!(
        bodies
            .iter()
            .all(|body| body["manifestUrl"] == bodies[0]["manifestUrl"])
    );
    assert_eq!(proxy.stack.transcoder.spawn_count(), 1);

    let sessions: serde_json::Value = proxy
        .client
        .get(proxy.url("/api/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sessions[0]["client_ref_count"], 5);

    proxy.stack.registry.shutdown().await;
}

#[tokio::test]
async fn test_direct_and_hls_sources_bypass_transcoding() {
    let origin = MockOrigin::start().await;
    let proxy = RunningProxy::start().await;

    let body: serde_json::Value = proxy
        .resolve(&origin.url("/movie.mp4"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["type"], "direct");
    assert_eq!(body["url"], origin.url("/movie.mp4"));

    let body: serde_json::Value = proxy
        .resolve(&origin.url("/channel.m3u8"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["type"], "hls");

    assert_eq!(proxy.stack.transcoder.spawn_count(), 0);
}

#[tokio::test]
async fn test_redirect_loop_is_a_gateway_error() {
    let origin = MockOrigin::start().await;
    let proxy = RunningProxy::start().await;

    let response = proxy.resolve(&origin.url("/loop/0")).await;
    assert_eq!(response.status(), 502);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "redirect_loop_or_too_deep");
    assert_eq!(body["retryable"], false);
}
