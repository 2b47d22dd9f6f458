//! End-to-end tests for the proxy pipeline.
//!
//! Each test stands up the full router around a scripted mock upstream and
//! drives it through real HTTP, covering authentication, allowlisting,
//! admission control, retry behavior, streaming, and multipart staging.

use axum::http::StatusCode;
use axum_test::TestServer;
use chrono::Utc;
use futures_util::future::join_all;
use rstest::rstest;
use serde_json::{Value, json};
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tollgate::AppState;
use tollgate::build_router;
use tollgate::config::{
    AllowlistSettings, HttpClientSettings, LimiterSettings, RateLimitSettings, Settings,
};
use tollgate::test_utils::{MockHttpClient, Scripted, build_test_state};
use tollgate::usage::MemoryUsageSink;

fn test_settings() -> Settings {
    Settings {
        rate_limiting: RateLimitSettings {
            global: LimiterSettings {
                requests_per_minute: 600,
                concurrent_limit: 50,
                queue_size: 100,
            },
            per_user: LimiterSettings {
                requests_per_minute: 60,
                concurrent_limit: 5,
                queue_size: 20,
            },
            enabled: true,
            metrics_enabled: false,
        },
        allowlist: AllowlistSettings {
            enabled: true,
            endpoints: vec![
                "/v1/chat/completions".to_string(),
                "/v1/embeddings".to_string(),
                "/v1/audio/transcriptions".to_string(),
            ],
            models: vec!["gpt-4o-mini".to_string(), "whisper-1".to_string()],
            default_model: "gpt-4o-mini".to_string(),
        },
        http_client: HttpClientSettings {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 50,
            timeout_secs: 5,
            multipart_timeout_secs: 5,
            retry_statuses: vec![429, 500, 502, 503, 504],
        },
        openai_api_key: Some("sk-upstream-test".to_string()),
    }
}

struct Harness {
    server: TestServer,
    client: MockHttpClient,
    usage: Arc<MemoryUsageSink>,
    state: AppState<MockHttpClient>,
    staging_dir: tempfile::TempDir,
}

async fn harness(client: MockHttpClient, settings: Settings) -> Harness {
    let staging_dir = tempfile::tempdir().unwrap();
    let (state, usage) =
        build_test_state(client.clone(), &settings, staging_dir.path().to_path_buf()).await;
    let server = TestServer::new(build_router(state.clone())).unwrap();
    Harness {
        server,
        client,
        usage,
        state,
        staging_dir,
    }
}

fn chat_body() -> Value {
    json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "hi"}]
    })
}

const UPSTREAM_OK: &str = r#"{"choices":[{"message":{"role":"assistant","content":"hello"}}],"usage":{"prompt_tokens":2,"completion_tokens":3,"total_tokens":5},"model":"gpt-4o-mini"}"#;

// --- Happy-path JSON proxying with usage accounting ---

#[tokio::test]
async fn json_request_passes_through_and_records_usage() {
    let h = harness(
        MockHttpClient::new(StatusCode::OK, UPSTREAM_OK),
        test_settings(),
    )
    .await;

    let response = h
        .server
        .post("/v1/chat/completions")
        .add_header("api-key", "test-user-1")
        .json(&chat_body())
        .await;

    assert_eq!(response.status_code(), 200);
    assert_eq!(response.text(), UPSTREAM_OK);

    // Exactly one upstream call, authenticated as the proxy.
    let requests = h.client.get_requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, "POST");
    assert_eq!(
        request.uri,
        "https://upstream.example.com/v1/chat/completions"
    );
    let auth = request
        .headers
        .iter()
        .find(|(k, _)| k == "authorization")
        .map(|(_, v)| v.clone());
    assert_eq!(auth.as_deref(), Some("Bearer sk-upstream-test"));
    // The client key never reaches the upstream.
    assert!(!request.headers.iter().any(|(_, v)| v == "test-user-1"));
    // Mutating requests carry a generated idempotency key.
    let idem = request
        .headers
        .iter()
        .find(|(k, _)| k == "idempotency-key")
        .map(|(_, v)| v.clone());
    assert!(idem.unwrap().starts_with("req_"));

    // One usage record for (principal, today, model, endpoint, 2, 3).
    let records = h.usage.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.principal_key, "test-user-1");
    assert_eq!(record.date, Utc::now().format("%Y-%m-%d").to_string());
    assert_eq!(record.model, "gpt-4o-mini");
    assert_eq!(record.endpoint, "/v1/chat/completions");
    assert_eq!(record.prompt_tokens, 2);
    assert_eq!(record.completion_tokens, 3);
}

// --- Authentication closure ---

#[rstest]
#[case::unknown_key(Some("who-is-this"))]
#[case::blank_key(Some("   "))]
#[case::missing_key(None)]
#[tokio::test]
async fn unauthenticated_requests_are_rejected_without_admission(#[case] key: Option<&str>) {
    let h = harness(
        MockHttpClient::new(StatusCode::OK, UPSTREAM_OK),
        test_settings(),
    )
    .await;

    let mut request = h.server.post("/v1/chat/completions").json(&chat_body());
    if let Some(key) = key {
        request = request.add_header("api-key", key);
    }
    let response = request.await;

    assert_eq!(response.status_code(), 403);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "invalid_key");
    // No upstream call and no scheduler admission happened.
    assert_eq!(h.client.get_requests().len(), 0);
    assert_eq!(h.state.scheduler.snapshot().total_users, 0);
    assert!(h.usage.records().is_empty());
}

#[tokio::test]
async fn api_key_header_fallbacks_authenticate() {
    for header in ["api-key", "x-api-key", "apikey", "authorization"] {
        let h = harness(
            MockHttpClient::new(StatusCode::OK, UPSTREAM_OK),
            test_settings(),
        )
        .await;
        let response = h
            .server
            .post("/v1/chat/completions")
            .add_header(header, "test-user-1")
            .json(&chat_body())
            .await;
        assert_eq!(response.status_code(), 200, "header {header} should work");
    }
}

// --- Endpoint allowlist closure ---

#[tokio::test]
async fn disallowed_endpoint_is_rejected_before_upstream() {
    let h = harness(
        MockHttpClient::new(StatusCode::OK, UPSTREAM_OK),
        test_settings(),
    )
    .await;

    let response = h
        .server
        .post("/v1/models")
        .add_header("api-key", "test-user-1")
        .json(&json!({}))
        .await;

    assert_eq!(response.status_code(), 403);
    assert!(response.text().contains("not allowed"));
    assert_eq!(h.client.get_requests().len(), 0);
}

// --- Model allowlist closure ---

#[tokio::test]
async fn disallowed_model_is_rejected_before_upstream() {
    let h = harness(
        MockHttpClient::new(StatusCode::OK, UPSTREAM_OK),
        test_settings(),
    )
    .await;

    let response = h
        .server
        .post("/v1/chat/completions")
        .add_header("api-key", "test-user-1")
        .json(&json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .await;

    assert_eq!(response.status_code(), 403);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "model_not_allowed");
    assert_eq!(h.client.get_requests().len(), 0);
}

#[tokio::test]
async fn mislabeled_content_type_cannot_bypass_model_allowlist() {
    let h = harness(
        MockHttpClient::new(StatusCode::OK, UPSTREAM_OK),
        test_settings(),
    )
    .await;

    // A JSON-shaped body naming a disallowed model, labeled as opaque
    // bytes, still goes through model validation.
    let response = h
        .server
        .post("/v1/chat/completions")
        .add_header("api-key", "test-user-1")
        .content_type("application/octet-stream")
        .bytes(r#"{"model":"gpt-4","messages":[{"role":"user","content":"hi"}]}"#.into())
        .await;

    assert_eq!(response.status_code(), 403);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "model_not_allowed");
    assert_eq!(h.client.get_requests().len(), 0);
}

#[tokio::test]
async fn mislabeled_non_json_post_body_is_rejected_not_forwarded() {
    let h = harness(
        MockHttpClient::new(StatusCode::OK, UPSTREAM_OK),
        test_settings(),
    )
    .await;

    let response = h
        .server
        .post("/v1/chat/completions")
        .add_header("api-key", "test-user-1")
        .content_type("application/octet-stream")
        .bytes("raw bytes, not json".into())
        .await;

    assert_eq!(response.status_code(), 400);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "malformed_request");
    assert_eq!(h.client.get_requests().len(), 0);
}

// --- Model defaulting ---

#[tokio::test]
async fn missing_model_is_defaulted_in_upstream_body() {
    let h = harness(
        MockHttpClient::new(StatusCode::OK, UPSTREAM_OK),
        test_settings(),
    )
    .await;

    let response = h
        .server
        .post("/v1/chat/completions")
        .add_header("api-key", "test-user-1")
        .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
        .await;

    assert_eq!(response.status_code(), 200);
    let requests = h.client.get_requests();
    assert_eq!(requests.len(), 1);
    let forwarded: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(forwarded["model"], "gpt-4o-mini");
    assert_eq!(forwarded["messages"][0]["content"], "hi");
}

// --- Malformed bodies ---

#[tokio::test]
async fn invalid_json_body_is_a_local_400() {
    let h = harness(
        MockHttpClient::new(StatusCode::OK, UPSTREAM_OK),
        test_settings(),
    )
    .await;

    let response = h
        .server
        .post("/v1/chat/completions")
        .add_header("api-key", "test-user-1")
        .content_type("application/json")
        .bytes("this is not json".into())
        .await;

    assert_eq!(response.status_code(), 400);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "malformed_request");
    assert_eq!(h.client.get_requests().len(), 0);
}

// --- Retry with Retry-After honoring and idempotency-key stability ---

#[tokio::test]
async fn retries_honor_retry_after_and_reuse_idempotency_key() {
    let mut settings = test_settings();
    settings.http_client.max_delay_ms = 10_000;
    let h = harness(
        MockHttpClient::with_script(vec![
            Scripted::status_with_headers(429, &[("retry-after", "1")], "{}"),
            Scripted::status_with_headers(429, &[("retry-after", "1")], "{}"),
            Scripted::json(200, UPSTREAM_OK),
        ]),
        settings,
    )
    .await;

    let started = Instant::now();
    let response = h
        .server
        .post("/v1/chat/completions")
        .add_header("api-key", "test-user-1")
        .json(&chat_body())
        .await;
    let elapsed = started.elapsed();

    assert_eq!(response.status_code(), 200);
    let requests = h.client.get_requests();
    assert_eq!(requests.len(), 3, "exactly three upstream attempts");
    assert!(
        elapsed >= Duration::from_secs(2),
        "two Retry-After: 1 waits mean >= 2s, got {elapsed:?}"
    );

    let keys: Vec<String> = requests
        .iter()
        .map(|r| {
            r.headers
                .iter()
                .find(|(k, _)| k == "idempotency-key")
                .map(|(_, v)| v.clone())
                .expect("every attempt carries the key")
        })
        .collect();
    assert_eq!(keys[0], keys[1]);
    assert_eq!(keys[1], keys[2]);
}

#[rstest]
#[case(400)]
#[case(401)]
#[case(403)]
#[case(404)]
#[tokio::test]
async fn non_retryable_statuses_pass_through_after_one_attempt(#[case] status: u16) {
    let h = harness(
        MockHttpClient::with_script(vec![Scripted::json(
            status,
            r#"{"error":{"message":"upstream says no","type":"invalid_request_error"}}"#,
        )]),
        test_settings(),
    )
    .await;

    let response = h
        .server
        .post("/v1/chat/completions")
        .add_header("api-key", "test-user-1")
        .json(&chat_body())
        .await;

    assert_eq!(response.status_code(), status);
    // Upstream error body is passed through verbatim.
    let body: Value = response.json();
    assert_eq!(body["error"]["message"], "upstream says no");
    assert_eq!(h.client.get_requests().len(), 1);
}

#[tokio::test]
async fn retryable_statuses_are_retried_to_success() {
    let h = harness(
        MockHttpClient::with_script(vec![
            Scripted::json(500, "{}"),
            Scripted::json(502, "{}"),
            Scripted::json(200, UPSTREAM_OK),
        ]),
        test_settings(),
    )
    .await;

    let response = h
        .server
        .post("/v1/chat/completions")
        .add_header("api-key", "test-user-1")
        .json(&chat_body())
        .await;

    assert_eq!(response.status_code(), 200);
    assert_eq!(h.client.get_requests().len(), 3);
}

#[tokio::test]
async fn transport_failure_after_retries_is_502() {
    let h = harness(
        MockHttpClient::with_script(vec![Scripted::Error(
            tollgate::transport::UpstreamError::ConnectionReset,
        )]),
        test_settings(),
    )
    .await;

    let response = h
        .server
        .post("/v1/chat/completions")
        .add_header("api-key", "test-user-1")
        .json(&chat_body())
        .await;

    assert_eq!(response.status_code(), 502);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "upstream_transport");
    // max_retries = 3 means four attempts in total.
    assert_eq!(h.client.get_requests().len(), 4);
}

#[tokio::test]
async fn upstream_timeout_is_504() {
    let mut settings = test_settings();
    settings.http_client.max_retries = 0;
    settings.http_client.timeout_secs = 1;
    let h = harness(
        MockHttpClient::new(StatusCode::OK, UPSTREAM_OK).with_delay(Duration::from_millis(1500)),
        settings,
    )
    .await;

    let response = h
        .server
        .post("/v1/chat/completions")
        .add_header("api-key", "test-user-1")
        .json(&chat_body())
        .await;

    assert_eq!(response.status_code(), 504);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "upstream_timeout");
}

// --- Concurrency bounds and queue overflow ---

#[tokio::test]
async fn saturated_principal_gets_queue_overflow_503() {
    let mut settings = test_settings();
    settings.rate_limiting.per_user = LimiterSettings {
        requests_per_minute: 60,
        concurrent_limit: 2,
        queue_size: 5,
    };
    let h = harness(
        MockHttpClient::new(StatusCode::OK, UPSTREAM_OK).with_delay(Duration::from_millis(200)),
        settings,
    )
    .await;

    let futures: Vec<_> = (0..10)
        .map(|_| {
            h.server
                .post("/v1/chat/completions")
                .add_header("api-key", "test-user-1")
                .json(&chat_body())
                .into_future()
        })
        .collect();
    let responses = join_all(futures).await;

    let ok = responses.iter().filter(|r| r.status_code() == 200).count();
    let rejected: Vec<_> = responses
        .iter()
        .filter(|r| r.status_code() == 503)
        .collect();
    // concurrent_limit + queue_size complete, the rest overflow.
    assert_eq!(ok, 7);
    assert_eq!(rejected.len(), 3);
    for response in rejected {
        assert_eq!(response.header("retry-after"), "30");
        let body: Value = response.json();
        assert_eq!(body["error"]["type"], "queue_overflow");
    }
    assert_eq!(h.client.get_requests().len(), 7);
}

#[tokio::test]
async fn two_principals_are_bounded_independently() {
    let mut settings = test_settings();
    settings.rate_limiting.per_user = LimiterSettings {
        requests_per_minute: 60,
        concurrent_limit: 2,
        queue_size: 5,
    };
    let h = harness(
        MockHttpClient::new(StatusCode::OK, UPSTREAM_OK).with_delay(Duration::from_millis(150)),
        settings,
    )
    .await;

    let futures: Vec<_> = (0..20)
        .map(|i| {
            let key = if i % 2 == 0 { "test-user-1" } else { "test-user-2" };
            h.server
                .post("/v1/chat/completions")
                .add_header("api-key", key)
                .json(&chat_body())
                .into_future()
        })
        .collect();
    let responses = join_all(futures).await;

    let ok = responses.iter().filter(|r| r.status_code() == 200).count();
    let overflow = responses.iter().filter(|r| r.status_code() == 503).count();
    // min(10, 2 + 5) = 7 per principal.
    assert_eq!(ok, 14);
    assert_eq!(overflow, 6);
    // At most 2 in flight per principal means at most 4 at once globally.
    assert!(h.client.peak_in_flight() <= 4);
}

#[tokio::test]
async fn global_limiter_bounds_total_concurrency() {
    let mut settings = test_settings();
    settings.rate_limiting.global = LimiterSettings {
        requests_per_minute: 600,
        concurrent_limit: 2,
        queue_size: 100,
    };
    settings.rate_limiting.per_user = LimiterSettings {
        requests_per_minute: 60,
        concurrent_limit: 10,
        queue_size: 20,
    };
    let h = harness(
        MockHttpClient::new(StatusCode::OK, UPSTREAM_OK).with_delay(Duration::from_millis(100)),
        settings,
    )
    .await;

    let futures: Vec<_> = (0..8)
        .map(|i| {
            let key = if i % 2 == 0 { "test-user-1" } else { "test-user-2" };
            h.server
                .post("/v1/chat/completions")
                .add_header("api-key", key)
                .json(&chat_body())
                .into_future()
        })
        .collect();
    let responses = join_all(futures).await;

    assert!(responses.iter().all(|r| r.status_code() == 200));
    assert!(h.client.peak_in_flight() <= 2);
}

// --- Streaming pass-through with usage capture ---

#[tokio::test]
async fn streaming_request_pipes_sse_and_records_terminal_usage() {
    let chunks = vec![
        "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n".to_string(),
        "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2,\"total_tokens\":3},\"model\":\"gpt-4o-mini\"}\n\n"
            .to_string(),
        "data: [DONE]\n\n".to_string(),
    ];
    let h = harness(
        MockHttpClient::new_streaming(StatusCode::OK, chunks.clone()),
        test_settings(),
    )
    .await;

    let response = h
        .server
        .post("/v1/chat/completions")
        .add_header("api-key", "test-user-1")
        .json(&json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }))
        .await;

    assert_eq!(response.status_code(), 200);
    assert_eq!(response.header("content-type"), "text/event-stream");
    assert_eq!(response.header("cache-control"), "no-cache");
    assert_eq!(response.header("x-accel-buffering"), "no");
    assert_eq!(response.text(), chunks.join(""));

    // No retries once streaming succeeded.
    assert_eq!(h.client.get_requests().len(), 1);

    // The pump task records usage at stream end.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let records = h.usage.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].prompt_tokens, 1);
    assert_eq!(records[0].completion_tokens, 2);
    assert_eq!(records[0].model, "gpt-4o-mini");
}

// --- Multipart upload with fresh boundary and staging cleanup ---

fn wav_multipart(boundary: &str, wav: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\nwhisper-1\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"clip.wav\"\r\nContent-Type: audio/wav\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(wav);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

async fn staging_is_empty(h: &Harness) -> bool {
    let mut entries = tokio::fs::read_dir(h.staging_dir.path()).await.unwrap();
    entries.next_entry().await.unwrap().is_none()
}

#[tokio::test]
async fn multipart_audio_upload_is_rebuilt_and_staging_cleaned() {
    let h = harness(
        MockHttpClient::new(StatusCode::OK, r#"{"text":"hello world"}"#),
        test_settings(),
    )
    .await;

    let wav = vec![0x52u8; 17 * 1024]; // 17 kB of RIFF-ish bytes
    let response = h
        .server
        .post("/v1/audio/transcriptions")
        .add_header("api-key", "test-user-1")
        .add_header("content-type", "multipart/form-data; boundary=CLIENTBOUNDARY")
        .bytes(wav_multipart("CLIENTBOUNDARY", &wav).into())
        .await;

    assert_eq!(response.status_code(), 200);
    assert_eq!(response.text(), r#"{"text":"hello world"}"#);

    let requests = h.client.get_requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    let content_type = request
        .headers
        .iter()
        .find(|(k, _)| k == "content-type")
        .map(|(_, v)| v.clone())
        .unwrap();
    // Fresh boundary, not the client's.
    assert!(content_type.starts_with("multipart/form-data; boundary=tollgate-"));
    assert!(!content_type.contains("CLIENTBOUNDARY"));

    let body_text = String::from_utf8_lossy(&request.body);
    assert!(body_text.contains("name=\"model\"\r\n\r\nwhisper-1"));
    assert!(body_text.contains("name=\"file\"; filename=\"clip.wav\""));
    assert!(request.body.len() > wav.len());

    // No staged file survives the request.
    assert!(staging_is_empty(&h).await);
}

#[tokio::test]
async fn multipart_disallowed_model_is_403_and_staging_cleaned() {
    let h = harness(
        MockHttpClient::new(StatusCode::OK, "{}"),
        test_settings(),
    )
    .await;

    let mut body = Vec::new();
    body.extend_from_slice(
        b"--B\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\nforbidden-model\r\n",
    );
    body.extend_from_slice(
        b"--B\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.wav\"\r\nContent-Type: audio/wav\r\n\r\nabc\r\n--B--\r\n",
    );

    let response = h
        .server
        .post("/v1/audio/transcriptions")
        .add_header("api-key", "test-user-1")
        .add_header("content-type", "multipart/form-data; boundary=B")
        .bytes(body.into())
        .await;

    assert_eq!(response.status_code(), 403);
    assert_eq!(h.client.get_requests().len(), 0);
    assert!(staging_is_empty(&h).await);
}

#[tokio::test]
async fn multipart_upstream_failure_still_cleans_staging() {
    let h = harness(
        MockHttpClient::with_script(vec![Scripted::Error(
            tollgate::transport::UpstreamError::ConnectionReset,
        )]),
        test_settings(),
    )
    .await;

    let response = h
        .server
        .post("/v1/audio/transcriptions")
        .add_header("api-key", "test-user-1")
        .add_header("content-type", "multipart/form-data; boundary=B")
        .bytes(wav_multipart("B", b"tinyclip").into())
        .await;

    assert_eq!(response.status_code(), 502);
    assert!(staging_is_empty(&h).await);
}

#[tokio::test]
async fn multipart_rejects_non_audio_parts() {
    let h = harness(
        MockHttpClient::new(StatusCode::OK, "{}"),
        test_settings(),
    )
    .await;

    let mut body = Vec::new();
    body.extend_from_slice(
        b"--B\r\nContent-Disposition: form-data; name=\"file\"; filename=\"x.png\"\r\nContent-Type: image/png\r\n\r\npng\r\n--B--\r\n",
    );

    let response = h
        .server
        .post("/v1/audio/transcriptions")
        .add_header("api-key", "test-user-1")
        .add_header("content-type", "multipart/form-data; boundary=B")
        .bytes(body.into())
        .await;

    assert_eq!(response.status_code(), 400);
    assert_eq!(h.client.get_requests().len(), 0);
    assert!(staging_is_empty(&h).await);
}

// --- Graceful drain ---

#[tokio::test]
async fn drained_scheduler_refuses_new_requests() {
    let h = harness(
        MockHttpClient::new(StatusCode::OK, UPSTREAM_OK),
        test_settings(),
    )
    .await;

    h.state.scheduler.begin_drain();
    let response = h
        .server
        .post("/v1/chat/completions")
        .add_header("api-key", "test-user-1")
        .json(&chat_body())
        .await;

    assert_eq!(response.status_code(), 503);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "shutdown_in_progress");
    assert_eq!(h.client.get_requests().len(), 0);
}

// --- Local endpoints ---

#[tokio::test]
async fn health_reports_queue_and_allowlist() {
    let h = harness(
        MockHttpClient::new(StatusCode::OK, UPSTREAM_OK),
        test_settings(),
    )
    .await;

    // Generate one admission so the snapshot has a user.
    h.server
        .post("/v1/chat/completions")
        .add_header("api-key", "test-user-1")
        .json(&chat_body())
        .await;

    let response = h.server.get("/health").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].is_string());
    assert_eq!(body["queue"]["running"], 0);
    assert_eq!(body["queue"]["totalUsers"], 1);
    assert!(body["queue"]["reservoir"].is_number());
    assert_eq!(body["allowlist"]["enabled"], true);
}

#[tokio::test]
async fn metrics_endpoint_is_404_when_disabled() {
    let h = harness(
        MockHttpClient::new(StatusCode::OK, UPSTREAM_OK),
        test_settings(),
    )
    .await;
    let response = h.server.get("/metrics").await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn options_preflight_gets_cors_headers() {
    let h = harness(
        MockHttpClient::new(StatusCode::OK, UPSTREAM_OK),
        test_settings(),
    )
    .await;

    let response = h
        .server
        .method(axum::http::Method::OPTIONS, "/v1/chat/completions")
        .await;
    assert_eq!(response.status_code(), 204);
    assert_eq!(response.header("access-control-allow-origin"), "*");
    assert_eq!(response.header("access-control-allow-methods"), "POST, OPTIONS");
    assert_eq!(
        response.header("access-control-allow-headers"),
        "Content-Type, Api-Key, User-Agent"
    );
}

// --- Non-POST passthrough ---

#[tokio::test]
async fn get_requests_forward_without_model_validation() {
    let h = harness(
        MockHttpClient::new(StatusCode::OK, r#"{"data":[]}"#),
        test_settings(),
    )
    .await;

    let response = h
        .server
        .get("/v1/embeddings")
        .add_header("api-key", "test-user-1")
        .await;

    assert_eq!(response.status_code(), 200);
    let requests = h.client.get_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    // Non-mutating methods carry no idempotency key.
    assert!(!requests[0].headers.iter().any(|(k, _)| k == "idempotency-key"));
}

// --- Per-minute reservoir enforcement ---

#[tokio::test]
async fn per_minute_reservoir_caps_admissions() {
    let mut settings = test_settings();
    settings.rate_limiting.per_user = LimiterSettings {
        requests_per_minute: 3,
        concurrent_limit: 10,
        queue_size: 2,
    };
    let h = harness(MockHttpClient::new(StatusCode::OK, UPSTREAM_OK), settings).await;

    // Three immediate admissions exhaust the reservoir.
    for _ in 0..3 {
        let response = h
            .server
            .post("/v1/chat/completions")
            .add_header("api-key", "test-user-1")
            .json(&chat_body())
            .await;
        assert_eq!(response.status_code(), 200);
    }
    assert_eq!(
        h.state
            .scheduler
            .user_snapshot("test-user-1")
            .unwrap()
            .reservoir,
        0
    );

    // The fourth queues behind a refill a minute away; it must not have
    // completed within a short observation window.
    let pending = h
        .server
        .post("/v1/chat/completions")
        .add_header("api-key", "test-user-1")
        .json(&chat_body());
    let outcome = tokio::time::timeout(Duration::from_millis(150), pending).await;
    assert!(outcome.is_err(), "fourth request must wait for the refill");
    assert_eq!(h.client.get_requests().len(), 3);
}
