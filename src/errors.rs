//! Error taxonomy for the proxy pipeline.
//!
//! Every failure a client can observe is a `ProxyError` variant. The
//! `IntoResponse` impl renders the OpenAI-style `{"error": {...}}` body so
//! downstream SDKs can parse proxy-originated failures the same way they
//! parse upstream ones. Upstream status errors are passed through verbatim.

use axum::Json;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;

/// Seconds advertised in `Retry-After` when the admission queue is full.
const QUEUE_OVERFLOW_RETRY_AFTER_SECS: u32 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid or missing API key")]
    InvalidKey,

    #[error("endpoint {0} is not allowed")]
    EndpointNotAllowed(String),

    #[error("model {0} is not allowed")]
    ModelNotAllowed(String),

    #[error("malformed request body: {0}")]
    MalformedRequest(String),

    #[error("rate limit queue is full, try again later")]
    QueueOverflow,

    #[error("too many concurrent uploads for this key")]
    UploadQuotaExceeded,

    /// Upstream answered with >= 400 after retries. Status, headers, and
    /// body are forwarded to the client unchanged.
    #[error("upstream returned status {status}")]
    UpstreamStatus {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },

    #[error("upstream transport failure: {0}")]
    UpstreamTransport(String),

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("proxy is shutting down")]
    ShutdownInProgress,

    #[error("internal proxy error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidKey
            | ProxyError::EndpointNotAllowed(_)
            | ProxyError::ModelNotAllowed(_) => StatusCode::FORBIDDEN,
            ProxyError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::QueueOverflow | ProxyError::ShutdownInProgress => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::UploadQuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::UpstreamStatus { status, .. } => *status,
            ProxyError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable tag for the `type` field and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::InvalidKey => "invalid_key",
            ProxyError::EndpointNotAllowed(_) => "endpoint_not_allowed",
            ProxyError::ModelNotAllowed(_) => "model_not_allowed",
            ProxyError::MalformedRequest(_) => "malformed_request",
            ProxyError::QueueOverflow => "queue_overflow",
            ProxyError::UploadQuotaExceeded => "upload_quota_exceeded",
            ProxyError::UpstreamStatus { .. } => "upstream_status",
            ProxyError::UpstreamTransport(_) => "upstream_transport",
            ProxyError::UpstreamTimeout => "upstream_timeout",
            ProxyError::ShutdownInProgress => "shutdown_in_progress",
            ProxyError::Internal(_) => "internal_error",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        crate::metrics::record_rejection(kind, status);

        match self {
            // Pass-through: the upstream's own error body is more useful to
            // the client than anything we could synthesize.
            ProxyError::UpstreamStatus {
                status,
                headers,
                body,
            } => {
                let mut response = Response::new(axum::body::Body::from(body));
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            other => {
                let advisory_retry = matches!(other, ProxyError::QueueOverflow);
                let body = ErrorBody {
                    error: ErrorDetail {
                        message: other.to_string(),
                        r#type: kind.to_string(),
                        code: Some(status.as_u16().to_string()),
                    },
                };
                let mut response = (status, Json(body)).into_response();
                if advisory_retry {
                    response.headers_mut().insert(
                        header::RETRY_AFTER,
                        QUEUE_OVERFLOW_RETRY_AFTER_SECS.into(),
                    );
                }
                response
            }
        }
    }
}
