//! Metric names and recording helpers.
//!
//! HTTP-level request metrics come from the `axum-prometheus` layer wired in
//! `lib.rs`; everything proxy-specific is recorded here through the
//! `metrics` facade so it lands in the same registry and renders on
//! `/metrics`.

use axum::http::StatusCode;
use std::time::Duration;

pub const REQUESTS: &str = "tollgate_proxy_requests_total";
pub const REQUEST_DURATION: &str = "tollgate_proxy_request_duration_seconds";
pub const REJECTIONS: &str = "tollgate_rejections_total";
pub const QUEUE_OVERFLOWS: &str = "tollgate_queue_overflows_total";
pub const QUEUE_DEPTH: &str = "tollgate_queue_depth";
pub const UPSTREAM_RETRIES: &str = "tollgate_upstream_retries_total";
pub const TOKENS: &str = "tollgate_tokens_total";
pub const UPLOAD_REJECTIONS: &str = "tollgate_upload_rejections_total";

pub fn record_request(status: StatusCode, latency: Duration) {
    metrics::counter!(REQUESTS, "status" => status.as_u16().to_string()).increment(1);
    metrics::histogram!(REQUEST_DURATION).record(latency.as_secs_f64());
}

pub fn record_rejection(kind: &'static str, status: StatusCode) {
    metrics::counter!(
        REJECTIONS,
        "kind" => kind,
        "status" => status.as_u16().to_string()
    )
    .increment(1);
}

/// A submission found a limiter queue at its high-water mark.
pub fn record_queue_overflow(level: &'static str) {
    metrics::counter!(QUEUE_OVERFLOWS, "level" => level).increment(1);
}

pub fn set_queue_depth(level: &'static str, depth: usize) {
    metrics::gauge!(QUEUE_DEPTH, "level" => level).set(depth as f64);
}

pub fn record_upstream_retry() {
    metrics::counter!(UPSTREAM_RETRIES).increment(1);
}

pub fn record_tokens(prompt: u64, completion: u64) {
    metrics::counter!(TOKENS, "kind" => "prompt").increment(prompt);
    metrics::counter!(TOKENS, "kind" => "completion").increment(completion);
}

pub fn record_upload_rejection() {
    metrics::counter!(UPLOAD_REJECTIONS).increment(1);
}
