//! Client reference counts under arbitrary acquire/release sequences

use proptest::prelude::*;
use sluice_core::StreamFingerprint;
use sluice_core::stream::StreamError;
use sluice_core::testing::TestStack;
use url::Url;

/// Replays `ops` (true = acquire, false = release) and checks every step
/// against a plain counter that saturates at zero.
async fn replay(ops: Vec<bool>) {
    let stack = TestStack::new();
    let url = Url::parse("http://origin.test/live/counted.ts").unwrap();
    let fingerprint = StreamFingerprint::of_normalized(&url);
    let mut expected = 0usize;

    for acquire in ops {
        if acquire {
            stack
                .registry
                .acquire(fingerprint, url.clone())
                .await
                .unwrap();
            expected += 1;
        } else {
            let result = stack.registry.release(fingerprint, None).await;
            match (expected, result) {
                (0, Err(StreamError::SessionNotFound { .. } | StreamError::NotAcquired { .. })) => {}
                (n, Ok(remaining)) if n > 0 => {
                    expected -= 1;
                    assert_eq!(remaining, expected);
                }
                (n, other) => panic!("release with {n} clients returned {other:?}"),
            }
        }

        if let Some(snapshot) = stack.registry.session(fingerprint).await {
            assert_eq!(snapshot.client_ref_count, expected);
        }
    }

    stack.registry.shutdown().await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_refcount_never_negative(ops in proptest::collection::vec(any::<bool>(), 1..24)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(replay(ops));
    }
}

#[tokio::test]
async fn test_extra_releases_are_rejected_not_fatal() {
    replay(vec![true, false, false, false, true, false]).await;
}
