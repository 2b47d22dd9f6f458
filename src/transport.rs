//! Upstream transport: the HTTPS client seam and the retry engine.
//!
//! The injectable boundary is [`HttpClient`]: a single
//! `execute(request) -> response | error` capability with a hyper-based
//! production implementation and recording fakes in tests. Everything above
//! it (retry with jittered exponential backoff, `Retry-After` honoring,
//! idempotency-key injection, the three body shapes) is a pure loop around
//! that primitive in [`Upstream`].

use crate::config::HttpClientSettings;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bon::Builder;
use bytes::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Transport-level failure classification. Only connection-shaped failures
/// are retryable; DNS failures and everything else surface immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request timed out")]
    Timeout,
    #[error("connection refused by upstream")]
    ConnectionRefused,
    #[error("connection reset by upstream")]
    ConnectionReset,
    #[error("upstream DNS resolution failed")]
    Dns,
    #[error("upstream transport error: {0}")]
    Other(String),
}

impl UpstreamError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamError::Timeout | UpstreamError::ConnectionRefused | UpstreamError::ConnectionReset
        )
    }
}

#[async_trait]
pub trait HttpClient: std::fmt::Debug {
    async fn execute(&self, req: Request) -> Result<Response, UpstreamError>;
}

pub type HyperClient = Client<hyper_tls::HttpsConnector<HttpConnector>, Body>;

#[async_trait]
impl HttpClient for HyperClient {
    async fn execute(&self, req: Request) -> Result<Response, UpstreamError> {
        self.request(req)
            .await
            .map(|res| res.into_response())
            .map_err(classify_client_error)
    }
}

/// Build the production HTTPS client. The connector binds to the IPv4
/// unspecified address so dual-stack hosts never attempt IPv6 to upstreams
/// that only route v4.
pub fn create_hyper_client() -> HyperClient {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_local_address(Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
    let tls = hyper_tls::native_tls::TlsConnector::new().expect("native TLS initialization");
    let https = hyper_tls::HttpsConnector::from((http, tokio_native_tls::TlsConnector::from(tls)));
    Client::builder(TokioExecutor::new()).build(https)
}

/// Map a hyper client error onto the retryability taxonomy by walking its
/// source chain for the underlying io error.
fn classify_client_error(error: hyper_util::client::legacy::Error) -> UpstreamError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&error);
    while let Some(current) = source {
        if let Some(io) = current.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => return UpstreamError::ConnectionRefused,
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                    return UpstreamError::ConnectionReset;
                }
                std::io::ErrorKind::TimedOut => return UpstreamError::Timeout,
                _ => {}
            }
        }
        source = current.source();
    }
    let rendered = error.to_string();
    let lowered = rendered.to_ascii_lowercase();
    if lowered.contains("dns") || lowered.contains("lookup") {
        UpstreamError::Dns
    } else {
        UpstreamError::Other(rendered)
    }
}

#[derive(Debug, Clone, Builder)]
pub struct RetryPolicy {
    #[builder(default = 3)]
    pub max_retries: u32,
    #[builder(default = Duration::from_millis(500))]
    pub base_delay: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub max_delay: Duration,
    #[builder(default = vec![429, 500, 502, 503, 504])]
    pub retry_statuses: Vec<u16>,
}

impl RetryPolicy {
    pub fn from_settings(settings: &HttpClientSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            retry_statuses: settings.retry_statuses.clone(),
        }
    }

    fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }

    /// Exponential backoff with up to one second of uniform jitter, capped
    /// at `max_delay`. `retry_index` 0 is the delay before the second
    /// attempt.
    fn backoff_delay(&self, retry_index: u32) -> Duration {
        let pow = 1u64 << retry_index.min(20);
        let base_ms = (self.base_delay.as_millis() as u64).saturating_mul(pow);
        let jitter_ms = rand::thread_rng().gen_range(0..=1000);
        let capped = base_ms
            .saturating_add(jitter_ms)
            .min(self.max_delay.as_millis() as u64);
        Duration::from_millis(capped)
    }

    /// Delay dictated by an upstream `Retry-After: <seconds>` header, capped
    /// at `max_delay`.
    fn retry_after_delay(&self, headers: &HeaderMap) -> Option<Duration> {
        let seconds: u64 = headers
            .get(header::RETRY_AFTER)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()?;
        Some(Duration::from_secs(seconds).min(self.max_delay))
    }
}

/// The body shape of one upstream call.
#[derive(Debug, Clone)]
pub enum UpstreamBody {
    Json(Bytes),
    Multipart { boundary: String, data: Bytes },
}

/// A prepared upstream request. Constructed once per inbound request and
/// moved into the transport; retries rebuild the wire request from it.
#[derive(Debug)]
pub struct UpstreamRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
    pub timeout: Option<Duration>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug)]
pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug)]
pub struct StreamingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamCallError {
    /// Upstream answered >= 400 after retries; carries everything needed
    /// for a verbatim pass-through.
    #[error("upstream returned status {status}")]
    Status {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    #[error(transparent)]
    Transport(#[from] UpstreamError),
}

#[derive(Debug)]
pub struct Upstream<T: HttpClient> {
    client: T,
    base_url: Url,
    api_key: String,
    policy: RetryPolicy,
    json_timeout: Duration,
    multipart_timeout: Duration,
}

impl<T: HttpClient> Upstream<T> {
    pub fn new(client: T, base_url: Url, api_key: String, settings: &HttpClientSettings) -> Self {
        Self {
            client,
            base_url: normalize_base_url(base_url),
            api_key,
            policy: RetryPolicy::from_settings(settings),
            json_timeout: Duration::from_secs(settings.timeout_secs),
            multipart_timeout: Duration::from_secs(settings.multipart_timeout_secs),
        }
    }

    /// Buffered JSON call. Upstream statuses >= 400 (after retries) surface
    /// as `UpstreamCallError::Status` with the full body.
    pub async fn send_json(&self, req: UpstreamRequest) -> Result<BufferedResponse, UpstreamCallError> {
        let timeout = req.timeout.unwrap_or(self.json_timeout);
        let response = self.dispatch(&req, timeout).await?;
        self.buffer_response(response).await
    }

    /// Buffered multipart call with the shorter default timeout.
    pub async fn send_multipart(
        &self,
        req: UpstreamRequest,
    ) -> Result<BufferedResponse, UpstreamCallError> {
        let timeout = req.timeout.unwrap_or(self.multipart_timeout);
        let response = self.dispatch(&req, timeout).await?;
        self.buffer_response(response).await
    }

    /// Streaming call: returns as soon as headers arrive. Retries apply only
    /// to pre-headers failures; once a success stream has begun nothing is
    /// replayed.
    pub async fn send_streaming(
        &self,
        req: UpstreamRequest,
    ) -> Result<StreamingResponse, UpstreamCallError> {
        let timeout = req.timeout.unwrap_or(self.json_timeout);
        let response = self.dispatch(&req, timeout).await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            // Error responses are buffered so the client gets the upstream
            // body verbatim.
            let buffered = self.buffer_response(response).await;
            return match buffered {
                Ok(_) => unreachable!("status >= 400 always maps to Status"),
                Err(e) => Err(e),
            };
        }
        let (parts, body) = response.into_parts();
        Ok(StreamingResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }

    async fn buffer_response(&self, response: Response) -> Result<BufferedResponse, UpstreamCallError> {
        let (parts, body) = response.into_parts();
        let bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| UpstreamError::Other(format!("reading upstream body: {e}")))?;
        if parts.status.as_u16() >= 400 {
            return Err(UpstreamCallError::Status {
                status: parts.status,
                headers: parts.headers,
                body: bytes,
            });
        }
        Ok(BufferedResponse {
            status: parts.status,
            headers: parts.headers,
            body: bytes,
        })
    }

    /// The retry loop. Returns the first non-retryable response (any
    /// status), or the last error once attempts are exhausted.
    async fn dispatch(
        &self,
        req: &UpstreamRequest,
        timeout: Duration,
    ) -> Result<Response, UpstreamError> {
        let idempotency_key = self.idempotency_key_for(req);
        let max_retries = self.policy.max_retries;

        let mut attempt = 0;
        loop {
            let wire = self.build_request(req, idempotency_key.as_deref())?;
            let outcome = tokio::time::timeout(timeout, self.client.execute(wire)).await;

            let error = match outcome {
                Ok(Ok(response)) => {
                    let status = response.status().as_u16();
                    if self.policy.is_retryable_status(status) && attempt < max_retries {
                        let delay = self
                            .policy
                            .retry_after_delay(response.headers())
                            .unwrap_or_else(|| self.policy.backoff_delay(attempt));
                        debug!(
                            status,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Retryable upstream status, backing off"
                        );
                        crate::metrics::record_upstream_retry();
                        drop(response);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(response);
                }
                Ok(Err(e)) => e,
                Err(_elapsed) => UpstreamError::Timeout,
            };

            if error.is_retryable() && attempt < max_retries {
                let delay = self.policy.backoff_delay(attempt);
                warn!(
                    error = %error,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retryable upstream transport error, backing off"
                );
                crate::metrics::record_upstream_retry();
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(error);
        }
    }

    /// One idempotency key per logical call, shared by every retry so the
    /// upstream can deduplicate replayed mutations.
    fn idempotency_key_for(&self, req: &UpstreamRequest) -> Option<String> {
        if let Some(key) = &req.idempotency_key {
            return Some(key.clone());
        }
        let mutating = req.method == Method::POST
            || req.method == Method::PUT
            || req.method == Method::PATCH;
        if mutating {
            Some(generate_idempotency_key())
        } else {
            None
        }
    }

    fn build_request(
        &self,
        req: &UpstreamRequest,
        idempotency_key: Option<&str>,
    ) -> Result<Request, UpstreamError> {
        let target = self
            .base_url
            .join(req.path_and_query.trim_start_matches('/'))
            .map_err(|e| UpstreamError::Other(format!("invalid upstream path: {e}")))?;
        let uri = Uri::try_from(target.as_str())
            .map_err(|e| UpstreamError::Other(format!("invalid upstream uri: {e}")))?;

        let mut headers = req.headers.clone();
        if let Some(host) = uri.host() {
            let host_value = match uri.port_u16() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            headers.insert(
                header::HOST,
                host_value
                    .parse()
                    .map_err(|_| UpstreamError::Other("invalid host header".to_string()))?,
            );
        }

        // The proxy always authenticates as itself upstream; any client
        // credential was already stripped by the pipeline.
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {}", self.api_key)
                .parse()
                .map_err(|_| UpstreamError::Other("invalid upstream key".to_string()))?,
        );

        let body_bytes = match &req.body {
            UpstreamBody::Json(bytes) => {
                if !headers.contains_key(header::CONTENT_TYPE) {
                    headers.insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/json"),
                    );
                }
                bytes.clone()
            }
            UpstreamBody::Multipart { boundary, data } => {
                let content_type = format!("multipart/form-data; boundary={boundary}");
                headers.insert(
                    header::CONTENT_TYPE,
                    content_type
                        .parse()
                        .map_err(|_| UpstreamError::Other("invalid boundary".to_string()))?,
                );
                data.clone()
            }
        };
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_bytes.len()));
        headers.remove(header::TRANSFER_ENCODING);

        if let Some(key) = idempotency_key {
            headers.insert(
                "idempotency-key",
                key.parse()
                    .map_err(|_| UpstreamError::Other("invalid idempotency key".to_string()))?,
            );
        }

        let mut wire = Request::builder()
            .method(req.method.clone())
            .uri(uri)
            .body(Body::from(body_bytes))
            .map_err(|e| UpstreamError::Other(format!("building upstream request: {e}")))?;
        *wire.headers_mut() = headers;
        Ok(wire)
    }
}

/// `Url::join` treats a base without a trailing slash as having a file
/// component that gets replaced, so the base is normalized once up front.
fn normalize_base_url(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    url
}

pub fn generate_idempotency_key() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!("req_{millis}_{suffix}")
}
