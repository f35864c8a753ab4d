//! Redirect resolution and classification against a live origin

use sluice_core::config::SluiceConfig;
use sluice_core::{PlaybackKind, RedirectResolver, StreamError};
use url::Url;

use crate::common::MockOrigin;

fn resolver() -> RedirectResolver {
    RedirectResolver::new(SluiceConfig::for_testing().resolver).unwrap()
}

#[tokio::test]
async fn test_mixed_relative_and_absolute_chain() {
    let origin = MockOrigin::start().await;

    let resolved = resolver()
        .resolve(&Url::parse(&origin.url("/a")).unwrap(), None)
        .await
        .unwrap();

    assert_eq!(resolved.final_url.as_str(), origin.url("/c"));
    assert_eq!(resolved.hops, 2);
    assert_eq!(resolved.playback_kind(), PlaybackKind::NeedsTranscode);
}

#[tokio::test]
async fn test_loop_is_bounded_by_max_redirects() {
    let origin = MockOrigin::start().await;
    let config = SluiceConfig::for_testing().resolver;
    let max_redirects = config.max_redirects;
    let resolver = RedirectResolver::new(config).unwrap();

    let result = resolver
        .resolve(&Url::parse(&origin.url("/loop/0")).unwrap(), None)
        .await;

    assert!(matches!(
        result,
        Err(StreamError::RedirectLoopOrTooDeep { .. })
    ));
    assert!(origin.hits() <= max_redirects + 1);
}

#[tokio::test]
async fn test_headers_recomputed_for_each_origin() {
    let first = MockOrigin::start().await;
    let second = MockOrigin::start().await;

    let start = Url::parse(&first.url(&format!("/hop/{}", second.addr))).unwrap();
    let resolved = resolver().resolve(&start, None).await.unwrap();
    assert_eq!(resolved.hops, 1);

    let seen: serde_json::Value = resolved.response.json().await.unwrap();
    let expected_origin = format!("http://{}", second.addr);
    assert_eq!(seen["origin"], expected_origin);
    assert_eq!(seen["referer"], format!("{expected_origin}/"));
    assert!(seen["user-agent"].as_str().unwrap().starts_with("Mozilla"));
}

#[tokio::test]
async fn test_classification_of_terminal_responses() {
    let origin = MockOrigin::start().await;
    let resolver = resolver();

    let cases = [
        ("/movie.mp4", PlaybackKind::Direct),
        ("/channel.m3u8", PlaybackKind::HlsNative),
        ("/live/123.ts", PlaybackKind::NeedsTranscode),
    ];
    for (path, expected) in cases {
        let resolved = resolver
            .resolve(&Url::parse(&origin.url(path)).unwrap(), None)
            .await
            .unwrap();
        assert_eq!(resolved.playback_kind(), expected, "{path}");
    }
}
