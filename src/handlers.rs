//! The request admission and dispatch pipeline.
//!
//! One catch-all handler carries every proxy request through the same
//! sequence: API-key extraction and lookup, endpoint allowlisting, scheduler
//! admission, body-shape classification, the upstream call, and response
//! adaptation with usage/metrics recording. `/health` and `/metrics` are the
//! only locally answered routes.

use crate::AppState;
use crate::errors::ProxyError;
use crate::keys::Principal;
use crate::scheduler::{AdmissionPermit, ScheduleError};
use crate::sse::{SseBufferedStream, UsageScanner};
use crate::staging::StagedPart;
use crate::transport::{
    BufferedResponse, HttpClient, StreamingResponse, UpstreamBody, UpstreamCallError,
    UpstreamError, UpstreamRequest,
};
use crate::usage::{UsageRecord, extract_usage};
use axum::Json;
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::multipart::{Field, Multipart};
use axum::extract::{FromRequest, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures_util::StreamExt;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

/// Maximum inbound body size, JSON or multipart.
pub const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Maximum size of a single multipart part.
const MAX_PART_BYTES: usize = 50 * 1024 * 1024;

/// Maximum number of parts in a multipart body.
const MAX_PARTS: usize = 5;

/// Header names probed for the client API key, in precedence order. Axum
/// canonicalizes inbound header names to lowercase, so one lookup per name
/// covers every case variant clients send.
const API_KEY_HEADERS: [&str; 4] = ["api-key", "x-api-key", "apikey", "authorization"];

/// First non-empty key header, trimmed. `Authorization` values are taken
/// verbatim; a `Bearer ` prefix is part of the key, not stripped.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    for name in API_KEY_HEADERS {
        if let Some(value) = headers.get(name) {
            if let Ok(text) = value.to_str() {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyShape {
    Json,
    Multipart,
}

/// Classify the inbound body. Multipart handling only applies to audio
/// endpoints; everything else takes the JSON path, where POST bodies are
/// parsed and model-checked and non-POST requests forward opaquely.
pub fn classify_body(method: &Method, content_type: Option<&str>, path: &str) -> BodyShape {
    let content_type = content_type.unwrap_or("");
    if *method != Method::POST || content_type.starts_with("application/json") {
        return BodyShape::Json;
    }
    if path.contains("/audio/") && content_type.starts_with("multipart/form-data") {
        return BodyShape::Multipart;
    }
    BodyShape::Json
}

/// Hop-by-hop headers, client credentials, and browser context never reach
/// the upstream; the transport installs its own authorization.
const STRIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
    "transfer-encoding",
    "host",
    "content-length",
    "authorization",
    "api-key",
    "x-api-key",
    "apikey",
    "cookie",
    "origin",
    "referer",
];

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    for name in STRIPPED_HEADERS {
        forwarded.remove(*name);
    }
    forwarded
}

#[instrument(skip(state, req), fields(method = %req.method(), path = %req.uri().path()))]
pub async fn proxy_handler<T: HttpClient + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
    req: Request,
) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = match handle_proxy(&state, req).await {
        Ok(response) => response,
        Err(error) => {
            debug!(error = %error, "Request rejected");
            // Policy and pipeline failures land in the access log too; the
            // happy paths log with full principal and body detail instead.
            if !matches!(error, ProxyError::UpstreamStatus { .. }) {
                state.access_log.append(
                    "-",
                    "-",
                    "-",
                    method.as_str(),
                    &path,
                    Some(&json!({"error": error.kind()})),
                );
            }
            error.into_response()
        }
    };
    crate::metrics::record_request(response.status(), started.elapsed());
    response
}

async fn handle_proxy<T: HttpClient + Send + Sync + 'static>(
    state: &AppState<T>,
    req: Request,
) -> Result<Response, ProxyError> {
    if req.method() == Method::OPTIONS {
        return Ok(cors_preflight());
    }

    let method = req.method().clone();
    let headers = req.headers().clone();
    let path = req.uri().path().to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let client_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string())
        .unwrap_or_else(|| "-".to_string());

    let api_key = extract_api_key(&headers).ok_or(ProxyError::InvalidKey)?;
    let principal = state.keys.lookup(&api_key).ok_or(ProxyError::InvalidKey)?;

    if !state.allowlist.endpoint_allowed(&path) {
        return Err(ProxyError::EndpointNotAllowed(path));
    }

    let permit = state
        .scheduler
        .admit(&principal.key)
        .await
        .map_err(|e| match e {
            ScheduleError::QueueOverflow => ProxyError::QueueOverflow,
            ScheduleError::ShuttingDown => ProxyError::ShutdownInProgress,
        })?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let ctx = RequestContext {
        principal,
        method,
        path,
        path_and_query,
        client_addr,
        content_type,
    };

    match classify_body(&ctx.method, ctx.content_type.as_deref(), &ctx.path) {
        BodyShape::Json => handle_json(state, req, &headers, ctx, permit).await,
        BodyShape::Multipart => handle_multipart(state, req, ctx, permit).await,
    }
}

struct RequestContext {
    principal: Principal,
    method: Method,
    path: String,
    path_and_query: String,
    client_addr: String,
    content_type: Option<String>,
}

async fn handle_json<T: HttpClient + Send + Sync + 'static>(
    state: &AppState<T>,
    req: Request,
    headers: &HeaderMap,
    ctx: RequestContext,
    permit: AdmissionPermit,
) -> Result<Response, ProxyError> {
    let body_bytes = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| ProxyError::MalformedRequest(format!("reading request body: {e}")))?;

    let mut stream_requested = false;
    let mut requested_model: Option<String> = None;
    let outgoing_body: Bytes;

    // Everything classified onto this path gets parsed and normalized,
    // whatever content-type label the client put on it. A body that does
    // not parse as JSON is rejected, never forwarded unchecked.
    if ctx.method == Method::POST && !body_bytes.is_empty() {
        // Parse and normalize on an outgoing copy; the inbound bytes are
        // never mutated observably.
        let inbound: Value = serde_json::from_slice(&body_bytes)
            .map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;
        state.access_log.append(
            &ctx.principal.name,
            &ctx.principal.email,
            &ctx.client_addr,
            ctx.method.as_str(),
            &ctx.path_and_query,
            Some(&inbound),
        );

        stream_requested = inbound
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut outgoing = inbound;
        let model = state
            .allowlist
            .normalize_model(&mut outgoing, &ctx.path)?;
        requested_model = Some(model);
        outgoing_body = Bytes::from(
            serde_json::to_vec(&outgoing)
                .map_err(|e| ProxyError::Internal(format!("serializing body: {e}")))?,
        );
    } else {
        state.access_log.append(
            &ctx.principal.name,
            &ctx.principal.email,
            &ctx.client_addr,
            ctx.method.as_str(),
            &ctx.path_and_query,
            None,
        );
        outgoing_body = body_bytes;
    }

    let mut upstream_headers = forwardable_headers(headers);
    if requested_model.is_some() {
        // The body was re-serialized from the normalized JSON value; the
        // client's original label no longer describes it.
        upstream_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }

    let upstream_req = UpstreamRequest {
        method: ctx.method.clone(),
        path_and_query: ctx.path_and_query.clone(),
        headers: upstream_headers,
        body: UpstreamBody::Json(outgoing_body),
        timeout: None,
        idempotency_key: None,
    };

    if stream_requested {
        let streaming = state
            .upstream
            .send_streaming(upstream_req)
            .await
            .map_err(map_call_error)?;
        return Ok(stream_response(state, streaming, ctx, permit));
    }

    // The upstream call runs in its own task: a client disconnect cancels
    // this handler but the call still runs to completion, usage is still
    // recorded, and the admission slots are still released.
    let upstream = Arc::clone(&state.upstream);
    let usage_sink = Arc::clone(&state.usage);
    let call = tokio::spawn(async move {
        let result = upstream.send_json(upstream_req).await;
        if let Ok(buffered) = &result {
            record_usage_from_response(
                &usage_sink,
                buffered,
                &ctx.principal.key,
                &ctx.path,
                requested_model.as_deref(),
            );
        }
        drop(permit);
        result
    });
    match call.await {
        Ok(Ok(buffered)) => Ok(buffered_to_response(buffered)),
        Ok(Err(e)) => Err(map_call_error(e)),
        Err(e) => Err(ProxyError::Internal(format!("upstream task failed: {e}"))),
    }
}

/// Forward a streaming upstream response as SSE. The pump task owns the
/// admission permit and the upstream stream: a client disconnect stops
/// downstream writes but the upstream body is still drained to completion,
/// so terminal usage is recorded and the scheduler slots are released
/// exactly once.
fn stream_response<T: HttpClient>(
    state: &AppState<T>,
    upstream: StreamingResponse,
    ctx: RequestContext,
    permit: AdmissionPermit,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    let usage_sink = Arc::clone(&state.usage);

    tokio::spawn(async move {
        let _permit = permit;
        let mut scanner = UsageScanner::new();
        let mut events = SseBufferedStream::new(upstream.body.into_data_stream());
        while let Some(next) = events.next().await {
            match next {
                Ok(event) => {
                    scanner.observe(&event);
                    // A send failure means the client went away; keep
                    // draining the upstream and discard the output.
                    let _ = tx.send(Ok(event)).await;
                }
                Err(e) => {
                    warn!("Upstream stream error: {e}");
                    let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                    break;
                }
            }
        }
        if let Some((usage, model)) = scanner.finish() {
            let record = UsageRecord::new(
                ctx.principal.key.clone(),
                model.unwrap_or_default(),
                ctx.path.clone(),
                usage.prompt_tokens,
                usage.completion_tokens,
            );
            if record.should_record() {
                crate::metrics::record_tokens(record.prompt_tokens, record.completion_tokens);
                usage_sink.record(record);
            }
        }
    });

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    *response.status_mut() = upstream.status;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, "text/event-stream".parse().unwrap());
    headers.insert(header::CACHE_CONTROL, "no-cache".parse().unwrap());
    headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
    // Disable buffering in intermediary proxies (nginx convention).
    headers.insert("x-accel-buffering", "no".parse().unwrap());
    response
}

async fn handle_multipart<T: HttpClient + Send + Sync + 'static>(
    state: &AppState<T>,
    req: Request,
    ctx: RequestContext,
    permit: AdmissionPermit,
) -> Result<Response, ProxyError> {
    let slot = state.upload_slots.try_acquire(&ctx.principal.key)?;

    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;

    let mut staged = crate::staging::StagedUpload::new();
    let mut text_fields: Vec<(String, String)> = Vec::new();
    let mut part_count = 0usize;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ProxyError::MalformedRequest(e.to_string()))?
    {
        part_count += 1;
        if part_count > MAX_PARTS {
            return Err(ProxyError::MalformedRequest(format!(
                "too many multipart parts (max {MAX_PARTS})"
            )));
        }

        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let mime = field.content_type().map(str::to_string);

        if let Some(file_name) = file_name {
            if !is_audio_mime(mime.as_deref()) {
                return Err(ProxyError::MalformedRequest(format!(
                    "part '{name}' has non-audio content type {}",
                    mime.as_deref().unwrap_or("unknown")
                )));
            }
            let data = read_field_limited(field).await?;
            let part = state
                .staging
                .stage(&name, Some(file_name), mime, data)
                .await
                .map_err(|e| ProxyError::Internal(format!("staging upload: {e}")))?;
            staged.push(part);
        } else {
            let text = field
                .text()
                .await
                .map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;
            text_fields.push((name, text));
        }
    }

    // Model validation mirrors the JSON path, over the small text fields.
    let requested_model = text_fields
        .iter()
        .find(|(name, _)| name == "model")
        .map(|(_, value)| value.clone())
        .unwrap_or_default();
    let effective_model = if requested_model.is_empty() {
        let default = state.allowlist.default_model().to_string();
        info!(
            endpoint = %ctx.path,
            default_model = %default,
            "No model specified, substituting default"
        );
        text_fields.retain(|(name, _)| name != "model");
        text_fields.push(("model".to_string(), default.clone()));
        default
    } else if !state.allowlist.model_allowed(&requested_model) {
        return Err(ProxyError::ModelNotAllowed(requested_model));
    } else {
        requested_model
    };

    state.access_log.append(
        &ctx.principal.name,
        &ctx.principal.email,
        &ctx.client_addr,
        ctx.method.as_str(),
        &ctx.path_and_query,
        Some(&json!({
            "multipart": true,
            "parts": part_count,
            "fields": text_fields.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>(),
            "model": effective_model.clone(),
        })),
    );

    // Reassemble behind a fresh boundary; file parts are copied
    // byte-for-byte from staging.
    let boundary = fresh_boundary();
    let data = build_multipart_body(&boundary, &text_fields, staged.parts())
        .await
        .map_err(|e| ProxyError::Internal(format!("assembling multipart body: {e}")))?;

    let upstream_req = UpstreamRequest {
        method: Method::POST,
        path_and_query: ctx.path_and_query.clone(),
        headers: HeaderMap::new(),
        body: UpstreamBody::Multipart { boundary, data },
        timeout: None,
        idempotency_key: None,
    };

    // Detached like the JSON path: the staged files, the upload slot, and
    // the admission are all released inside the task on every outcome,
    // client disconnect included.
    let upstream = Arc::clone(&state.upstream);
    let usage_sink = Arc::clone(&state.usage);
    let call = tokio::spawn(async move {
        let result = upstream.send_multipart(upstream_req).await;
        staged.cleanup().await;
        if let Ok(buffered) = &result {
            record_usage_from_response(
                &usage_sink,
                buffered,
                &ctx.principal.key,
                &ctx.path,
                Some(&effective_model),
            );
        }
        drop(slot);
        drop(permit);
        result
    });
    match call.await {
        Ok(Ok(buffered)) => Ok(buffered_to_response(buffered)),
        Ok(Err(e)) => Err(map_call_error(e)),
        Err(e) => Err(ProxyError::Internal(format!("upstream task failed: {e}"))),
    }
}

async fn read_field_limited(mut field: Field<'_>) -> Result<Bytes, ProxyError> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ProxyError::MalformedRequest(e.to_string()))?
    {
        if buffer.len() + chunk.len() > MAX_PART_BYTES {
            return Err(ProxyError::MalformedRequest(format!(
                "multipart part exceeds {MAX_PART_BYTES} bytes"
            )));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

fn is_audio_mime(mime: Option<&str>) -> bool {
    mime.is_some_and(|m| m.starts_with("audio/"))
}

fn fresh_boundary() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("tollgate-{suffix}")
}

async fn build_multipart_body(
    boundary: &str,
    text_fields: &[(String, String)],
    parts: &[StagedPart],
) -> Result<Bytes, std::io::Error> {
    let mut out = BytesMut::new();
    for (name, value) in text_fields {
        out.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    for part in parts {
        let file_name = part.file_name.as_deref().unwrap_or("file");
        let mime = part.mime.as_deref().unwrap_or("application/octet-stream");
        out.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{file_name}\"\r\nContent-Type: {mime}\r\n\r\n",
                part.field_name
            )
            .as_bytes(),
        );
        out.extend_from_slice(&tokio::fs::read(&part.path).await?);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    Ok(out.freeze())
}

fn map_call_error(error: UpstreamCallError) -> ProxyError {
    match error {
        UpstreamCallError::Status {
            status,
            headers,
            body,
        } => ProxyError::UpstreamStatus {
            status,
            headers,
            body,
        },
        UpstreamCallError::Transport(UpstreamError::Timeout) => ProxyError::UpstreamTimeout,
        UpstreamCallError::Transport(e) => ProxyError::UpstreamTransport(e.to_string()),
    }
}

fn buffered_to_response(buffered: BufferedResponse) -> Response {
    let mut response = Response::new(Body::from(buffered.body));
    *response.status_mut() = buffered.status;
    *response.headers_mut() = buffered.headers;
    response
}

/// Parse token usage out of a buffered JSON/text response and record it.
/// Anything that is not parseable usage is silently skipped; usage recording
/// never fails a request.
fn record_usage_from_response(
    sink: &Arc<dyn crate::usage::UsageSink>,
    buffered: &BufferedResponse,
    principal_key: &str,
    endpoint: &str,
    requested_model: Option<&str>,
) {
    let content_type = buffered
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !(content_type.starts_with("application/json") || content_type.starts_with("text/")) {
        return;
    }
    let Ok(value) = serde_json::from_slice::<Value>(&buffered.body) else {
        return;
    };
    let Some((usage, model)) = extract_usage(&value) else {
        return;
    };
    let model = model
        .or_else(|| requested_model.map(str::to_string))
        .unwrap_or_default();
    let record = UsageRecord::new(
        principal_key.to_string(),
        model,
        endpoint.to_string(),
        usage.prompt_tokens,
        usage.completion_tokens,
    );
    if record.should_record() {
        crate::metrics::record_tokens(record.prompt_tokens, record.completion_tokens);
        sink.record(record);
    }
}

fn cors_preflight() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert("access-control-allow-origin", "*".parse().unwrap());
    headers.insert(
        "access-control-allow-methods",
        "POST, OPTIONS".parse().unwrap(),
    );
    headers.insert(
        "access-control-allow-headers",
        "Content-Type, Api-Key, User-Agent".parse().unwrap(),
    );
    response
}

pub async fn health_handler<T: HttpClient + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
) -> Json<Value> {
    let status = if state.scheduler.is_draining() {
        "draining"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "timestamp": Utc::now().to_rfc3339(),
        "queue": state.scheduler.snapshot(),
        "allowlist": state.allowlist.summary(),
    }))
}

pub async fn metrics_handler<T: HttpClient + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
