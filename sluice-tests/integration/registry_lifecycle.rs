//! Session sharing, failure recovery and reaping through the registry

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use sluice_core::stream::SessionState;
use sluice_core::testing::TestStack;
use sluice_core::transcode::SimulatedBehavior;
use sluice_core::{SimulatedTranscoder, StreamFingerprint};
use url::Url;

fn source(path: &str) -> (StreamFingerprint, Url) {
    let url = Url::parse(&format!("http://origin.test{path}")).unwrap();
    (StreamFingerprint::of_normalized(&url), url)
}

async fn wait_for_state(stack: &TestStack, fingerprint: StreamFingerprint, wanted: SessionState) {
    let session = stack.registry.get(fingerprint).await.unwrap();
    let mut state_rx = session.subscribe();
    tokio::time::timeout(
        Duration::from_secs(3),
        state_rx.wait_for(|state| *state == wanted),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_concurrent_acquires_share_one_transcoder() {
    let stack = TestStack::new();
    let (fingerprint, url) = source("/live/shared.ts");

    let handles = join_all((0..10).map(|_| {
        let registry = Arc::clone(&stack.registry);
        let url = url.clone();
        async move { registry.acquire(fingerprint, url).await }
    }))
    .await;

    let handles: Vec<_> = handles.into_iter().map(Result::unwrap).collect();
    assert_eq!(stack.transcoder.spawn_count(), 1);
    assert!(handles.iter().all(|h| h.session_id == handles[0].session_id));
    assert!(handles.iter().all(|h| h.output_dir == handles[0].output_dir));
    assert_eq!(
        stack
            .registry
            .session(fingerprint)
            .await
            .unwrap()
            .client_ref_count,
        10
    );

    stack.registry.shutdown().await;
}

#[tokio::test]
async fn test_equivalent_urls_join_the_same_session() {
    let stack = TestStack::new();
    let noise = &stack.config.fingerprint.noise_query_keys;

    let (first, first_url) =
        StreamFingerprint::from_source("http://Origin.test:80/live/1.ts?b=2&a=1&_=111", noise)
            .unwrap();
    let (second, second_url) =
        StreamFingerprint::from_source("http://origin.test/live/1.ts?a=1&b=2#player", noise)
            .unwrap();
    assert_eq!(first, second);

    let a = stack.registry.acquire(first, first_url).await.unwrap();
    let b = stack.registry.acquire(second, second_url).await.unwrap();
    assert_eq!(a.session_id, b.session_id);
    assert_eq!(stack.transcoder.spawn_count(), 1);

    stack.registry.shutdown().await;
}

#[tokio::test]
async fn test_crash_leads_to_fresh_session_in_new_directory() {
    let stack = TestStack::with_transcoder(
        SimulatedTranscoder::new()
            .with_segment_interval(Duration::from_millis(30))
            .with_behavior(SimulatedBehavior::CrashAfter {
                segments: 4,
                code: 1,
            }),
    );
    let (fingerprint, url) = source("/live/crashy.ts");

    let first = stack.registry.acquire(fingerprint, url.clone()).await.unwrap();
    wait_for_state(&stack, fingerprint, SessionState::Errored).await;
    let snapshot = stack.registry.session(fingerprint).await.unwrap();
    assert!(snapshot.last_error.unwrap().contains("while streaming"));

    let second = stack.registry.acquire(fingerprint, url).await.unwrap();
    assert_ne!(second.session_id, first.session_id);
    assert_ne!(second.output_dir, first.output_dir);
    assert_eq!(stack.transcoder.spawn_count(), 2);

    let cleaned = tokio::time::timeout(Duration::from_secs(2), async {
        while first.output_dir.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(cleaned.is_ok(), "output of the crashed session was left behind");

    stack.registry.shutdown().await;
}

#[tokio::test]
async fn test_errored_session_without_clients_is_reaped() {
    let stack = TestStack::with_transcoder(
        SimulatedTranscoder::new()
            .with_segment_interval(Duration::from_millis(30))
            .with_behavior(SimulatedBehavior::CrashAfter {
                segments: 4,
                code: 1,
            }),
    );
    let (fingerprint, url) = source("/live/reaped.ts");

    stack.registry.acquire(fingerprint, url).await.unwrap();
    wait_for_state(&stack, fingerprint, SessionState::Errored).await;

    // A client still holds it, so it stays visible.
    assert!(stack.registry.reap_now().await.errored.is_empty());

    stack.registry.release(fingerprint, None).await.unwrap();
    let report = stack.registry.reap_now().await;
    assert_eq!(report.errored, vec![fingerprint]);
    assert!(stack.registry.is_empty().await);
}

#[tokio::test]
async fn test_idle_reaper_tears_down_released_session() {
    let stack = TestStack::new();
    let (fingerprint, url) = source("/live/idle.ts");

    let handle = stack.registry.acquire(fingerprint, url).await.unwrap();
    stack.registry.release(fingerprint, None).await.unwrap();

    let reaper = sluice_core::IdleReaper::spawn(
        Arc::clone(&stack.registry),
        stack.config.registry.reap_interval,
    );
    let removed = tokio::time::timeout(stack.config.registry.idle_threshold * 4, async {
        while stack.registry.get(fingerprint).await.is_some() || handle.output_dir.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    reaper.abort();

    assert!(removed.is_ok(), "idle session was not reaped");
}
