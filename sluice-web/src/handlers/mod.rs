//! HTTP request handlers organized by functionality

pub mod errors;
pub mod resolve;
pub mod segments;
pub mod sessions;

// Re-export handler functions
pub use errors::{ApiError, ApiErrorBody};
pub use resolve::{ResolveQuery, ResolveResponse, resolve_source};
pub use segments::serve_segment;
pub use sessions::{FingerprintRequest, health, list_sessions, release_session, stop_session};

#[cfg(test)]
pub(crate) mod test_support {
    use axum::Router;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, Response};
    use sluice_core::RuntimeMode;
    use sluice_core::testing::TestStack;
    use tower::ServiceExt;

    use crate::server::{AppState, build_router};

    /// Router over a simulated stack; the stack owns the output root.
    pub fn app(stack: &TestStack) -> Router {
        let state = AppState::from_parts(
            stack.config.clone(),
            RuntimeMode::Development,
            stack.registry.clone(),
            stack.segments.clone(),
        )
        .unwrap();
        build_router(state)
    }

    pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
        app.clone().oneshot(request).await.unwrap()
    }

    pub async fn json_body(response: Response<Body>) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}
