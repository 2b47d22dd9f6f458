//! Tollgate - a multi-tenant reverse proxy for an upstream LLM API.
//!
//! Local clients authenticate with opaque API keys; the proxy enforces
//! endpoint/model allowlists and a hierarchical rate limiter, then forwards
//! JSON, SSE-streaming, and multipart-upload traffic to the upstream with
//! retries, idempotency keys, and usage accounting.

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod access_log;
pub mod allowlist;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod keys;
pub mod lifecycle;
pub mod metrics;
pub mod scheduler;
pub mod sse;
pub mod staging;
pub mod transport;
pub mod usage;

use access_log::AccessLog;
use allowlist::Allowlist;
use handlers::{health_handler, metrics_handler, proxy_handler};
use keys::KeyStore;
use scheduler::Scheduler;
use staging::{StagingArea, UploadSlots};
use transport::{HttpClient, Upstream};
use usage::UsageSink;

/// Everything a request handler needs, wired once at startup and passed
/// through axum state. No module-level globals.
pub struct AppState<T: HttpClient> {
    pub keys: Arc<KeyStore>,
    pub allowlist: Arc<Allowlist>,
    pub scheduler: Arc<Scheduler>,
    pub upstream: Arc<Upstream<T>>,
    pub usage: Arc<dyn UsageSink>,
    pub access_log: Arc<AccessLog>,
    pub staging: StagingArea,
    pub upload_slots: Arc<UploadSlots>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl<T: HttpClient> std::fmt::Debug for AppState<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("keys", &self.keys.len())
            .field("scheduler", &self.scheduler)
            .field("upstream", &self.upstream)
            .finish()
    }
}

// Manual impl: every field is shared, so no `T: Clone` bound is needed.
impl<T: HttpClient> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            keys: Arc::clone(&self.keys),
            allowlist: Arc::clone(&self.allowlist),
            scheduler: Arc::clone(&self.scheduler),
            upstream: Arc::clone(&self.upstream),
            usage: Arc::clone(&self.usage),
            access_log: Arc::clone(&self.access_log),
            staging: self.staging.clone(),
            upload_slots: Arc::clone(&self.upload_slots),
            metrics_handle: self.metrics_handle.clone(),
        }
    }
}

/// Build the proxy router:
/// - `/health` - scheduler and allowlist snapshot
/// - `/metrics` - Prometheus exposition (404 when disabled)
/// - everything else - the proxy pipeline
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/{*path}", any(proxy_handler))
        .layer(DefaultBodyLimit::max(handlers::MAX_BODY_BYTES))
        .with_state(state)
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds the prometheus layer and exposition handle. The registry is
/// process-global, so this is called exactly once at startup.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}

/// Test doubles shared by unit and integration tests.
pub mod test_utils {
    use super::*;
    use crate::config::Settings;
    use crate::keys::Principal;
    use crate::transport::UpstreamError;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::StatusCode;
    use axum::response::Response;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        pub method: String,
        pub uri: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    #[derive(Debug, Clone)]
    pub enum Scripted {
        Buffered {
            status: u16,
            headers: Vec<(String, String)>,
            body: String,
        },
        Streaming {
            status: u16,
            chunks: Vec<String>,
        },
        Error(UpstreamError),
    }

    impl Scripted {
        pub fn json(status: u16, body: &str) -> Self {
            Scripted::Buffered {
                status,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: body.to_string(),
            }
        }

        pub fn status_with_headers(status: u16, headers: &[(&str, &str)], body: &str) -> Self {
            Scripted::Buffered {
                status,
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                body: body.to_string(),
            }
        }
    }

    /// A recording fake for the upstream seam. Scripted responses are
    /// consumed in order; once the script is exhausted the last entry
    /// repeats. Tracks the peak number of concurrent calls for the
    /// concurrency-bound tests.
    pub struct MockHttpClient {
        requests: Arc<Mutex<Vec<RecordedRequest>>>,
        script: Arc<Mutex<VecDeque<Scripted>>>,
        last: Arc<Mutex<Scripted>>,
        delay: Option<Duration>,
        in_flight: Arc<AtomicUsize>,
        peak_in_flight: Arc<AtomicUsize>,
    }

    impl std::fmt::Debug for MockHttpClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockHttpClient")
                .field("requests", &self.requests.lock().unwrap().len())
                .finish()
        }
    }

    impl Clone for MockHttpClient {
        fn clone(&self) -> Self {
            Self {
                requests: Arc::clone(&self.requests),
                script: Arc::clone(&self.script),
                last: Arc::clone(&self.last),
                delay: self.delay,
                in_flight: Arc::clone(&self.in_flight),
                peak_in_flight: Arc::clone(&self.peak_in_flight),
            }
        }
    }

    impl MockHttpClient {
        pub fn new(status: StatusCode, body: &str) -> Self {
            Self::with_script(vec![Scripted::json(status.as_u16(), body)])
        }

        pub fn new_streaming(status: StatusCode, chunks: Vec<String>) -> Self {
            Self::with_script(vec![Scripted::Streaming {
                status: status.as_u16(),
                chunks,
            }])
        }

        pub fn with_script(mut script: Vec<Scripted>) -> Self {
            assert!(!script.is_empty(), "script must have at least one entry");
            let last = script.last().cloned().unwrap();
            let script: VecDeque<Scripted> = script.drain(..).collect();
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                script: Arc::new(Mutex::new(script)),
                last: Arc::new(Mutex::new(last)),
                delay: None,
                in_flight: Arc::new(AtomicUsize::new(0)),
                peak_in_flight: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Hold each call open for `delay` so tests can observe concurrency.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn get_requests(&self) -> Vec<RecordedRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn peak_in_flight(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }

        fn next_scripted(&self) -> Scripted {
            let mut script = self.script.lock().unwrap();
            match script.pop_front() {
                Some(entry) => {
                    if script.is_empty() {
                        *self.last.lock().unwrap() = entry.clone();
                    }
                    entry
                }
                None => self.last.lock().unwrap().clone(),
            }
        }

        fn render(scripted: Scripted) -> Result<Response, UpstreamError> {
            match scripted {
                Scripted::Buffered {
                    status,
                    headers,
                    body,
                } => {
                    let mut builder = Response::builder().status(status);
                    for (name, value) in headers {
                        builder = builder.header(name, value);
                    }
                    Ok(builder.body(Body::from(body)).unwrap())
                }
                Scripted::Streaming { status, chunks } => {
                    let stream = futures_util::stream::iter(
                        chunks
                            .into_iter()
                            .map(|chunk| Ok::<_, std::io::Error>(chunk.into_bytes())),
                    );
                    Ok(Response::builder()
                        .status(status)
                        .header("content-type", "text/event-stream")
                        .header("cache-control", "no-cache")
                        .header("connection", "keep-alive")
                        .body(Body::from_stream(stream))
                        .unwrap())
                }
                Scripted::Error(e) => Err(e),
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn execute(&self, req: Request) -> Result<Response, UpstreamError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let headers = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();
            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .map(|b| b.to_vec())
                .unwrap_or_default();
            self.requests.lock().unwrap().push(RecordedRequest {
                method,
                uri,
                headers,
                body,
            });

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Self::render(self.next_scripted())
        }
    }

    pub fn test_principals() -> Vec<Principal> {
        vec![
            Principal {
                key: "test-user-1".to_string(),
                name: "Test User One".to_string(),
                email: "one@example.com".to_string(),
            },
            Principal {
                key: "test-user-2".to_string(),
                name: "Test User Two".to_string(),
                email: "two@example.com".to_string(),
            },
        ]
    }

    /// Wire a complete `AppState` around a mock client: in-memory usage
    /// sink, disabled access log, temp staging directory.
    pub async fn build_test_state(
        client: MockHttpClient,
        settings: &Settings,
        staging_dir: PathBuf,
    ) -> (AppState<MockHttpClient>, Arc<crate::usage::MemoryUsageSink>) {
        let usage = crate::usage::MemoryUsageSink::new();
        let state = AppState {
            keys: KeyStore::from_principals(test_principals()),
            allowlist: Arc::new(Allowlist::from_settings(&settings.allowlist)),
            scheduler: Scheduler::new(&settings.rate_limiting),
            upstream: Arc::new(Upstream::new(
                client,
                "https://upstream.example.com".parse().unwrap(),
                "sk-upstream-test".to_string(),
                &settings.http_client,
            )),
            usage: usage.clone(),
            access_log: AccessLog::disabled(),
            staging: StagingArea::new(staging_dir)
                .await
                .expect("staging dir for tests"),
            upload_slots: UploadSlots::new(3),
            metrics_handle: None,
        };
        (state, usage)
    }
}
