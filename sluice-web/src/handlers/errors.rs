//! Mapping of stream errors onto HTTP responses

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use sluice_core::StreamError;

/// Seconds a client should wait before retrying a still-starting stream.
const STARTUP_RETRY_AFTER_SECS: u64 = 2;

/// JSON body returned for every failed request.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    /// Stable machine-readable error kind
    pub error: String,
    /// Human-readable message
    pub message: String,
    /// Whether re-issuing the request may succeed
    pub retryable: bool,
}

/// API error that renders as `{ error, message, retryable }`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: String,
    pub message: String,
    pub retryable: bool,
    pub retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            kind: kind.into(),
            message: message.into(),
            retryable: false,
            retry_after: None,
        }
    }

    /// Create a 400 Bad Request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    /// Create a 404 Not Found error.
    ///
    /// Players treat this as "stream needs restart" and re-resolve.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(StatusCode::NOT_FOUND, "not_found", message)
        }
    }

    /// Create a 500 Internal Server Error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl From<StreamError> for ApiError {
    fn from(error: StreamError) -> Self {
        let status = match &error {
            StreamError::InvalidSourceUrl { .. }
            | StreamError::InvalidFingerprint { .. }
            | StreamError::InvalidSegmentName { .. } => StatusCode::BAD_REQUEST,
            StreamError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            StreamError::NotAcquired { .. } => StatusCode::CONFLICT,
            StreamError::RedirectLoopOrTooDeep { .. }
            | StreamError::SourceUnreachable { .. }
            | StreamError::TranscodeStartupFailed { .. } => StatusCode::BAD_GATEWAY,
            StreamError::StreamStartupTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            StreamError::TranscoderUnavailable { .. } | StreamError::Io { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            tracing::warn!("Request failed with {}: {}", status, error);
        } else {
            tracing::debug!("Request rejected with {}: {}", status, error);
        }

        let retry_after = matches!(error, StreamError::StreamStartupTimeout { .. })
            .then_some(STARTUP_RETRY_AFTER_SECS);

        Self {
            status,
            kind: error.kind().to_string(),
            message: error.to_string(),
            retryable: error.is_retryable(),
            retry_after,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.kind,
            message: self.message,
            retryable: self.retryable,
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(seconds) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use sluice_core::StreamFingerprint;

    use super::*;

    #[test]
    fn test_status_mapping() {
        let fingerprint = StreamFingerprint::new([2u8; 20]);
        let cases = [
            (
                StreamError::InvalidSourceUrl {
                    url: "x".to_string(),
                    reason: "relative".to_string(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                StreamError::SessionNotFound { fingerprint },
                StatusCode::NOT_FOUND,
            ),
            (StreamError::NotAcquired { fingerprint }, StatusCode::CONFLICT),
            (
                StreamError::RedirectLoopOrTooDeep {
                    url: "http://a/".to_string(),
                    hops: 5,
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                StreamError::TranscodeStartupFailed {
                    detail: "no manifest".to_string(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                StreamError::StreamStartupTimeout {
                    fingerprint,
                    waited_ms: 10,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(ApiError::from(error).status, expected);
        }
    }

    #[test]
    fn test_startup_timeout_sets_retry_after() {
        let error = ApiError::from(StreamError::StreamStartupTimeout {
            fingerprint: StreamFingerprint::new([2u8; 20]),
            waited_ms: 10,
        });
        assert!(error.retryable);

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "2");
    }
}
