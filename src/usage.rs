//! Usage accounting: token counts per principal, day, model, and endpoint.
//!
//! The sink is fire-and-forget by contract: `record` never blocks the
//! request path and write failures are logged, not surfaced. The file-backed
//! sink feeds an external reporting pipeline through an append-only tabular
//! log; swapping in a database-backed sink is a matter of implementing
//! `UsageSink`.

use chrono::Utc;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub principal_key: String,
    /// `YYYY-MM-DD`, UTC.
    pub date: String,
    pub model: String,
    pub endpoint: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl UsageRecord {
    pub fn new(
        principal_key: impl Into<String>,
        model: impl Into<String>,
        endpoint: impl Into<String>,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Self {
        Self {
            principal_key: principal_key.into(),
            date: Utc::now().format("%Y-%m-%d").to_string(),
            model: model.into(),
            endpoint: endpoint.into(),
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Records with no model or no tokens carry no information and are
    /// dropped at the sink boundary.
    pub fn should_record(&self) -> bool {
        !self.model.is_empty() && self.model != "unknown" && self.total_tokens() > 0
    }

    fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
            self.principal_key,
            self.date,
            self.model,
            self.endpoint,
            self.prompt_tokens,
            self.completion_tokens,
            self.total_tokens(),
        )
    }
}

/// Token counts parsed out of an upstream response body or SSE frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Pull `usage` and `model` out of a parsed upstream JSON value. Returns
/// `None` when there is no usage object at all.
pub fn extract_usage(value: &Value) -> Option<(TokenUsage, Option<String>)> {
    let usage = value.get("usage")?;
    let tokens = TokenUsage {
        prompt_tokens: usage
            .get("prompt_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        completion_tokens: usage
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    };
    let model = value
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some((tokens, model))
}

pub trait UsageSink: fmt::Debug + Send + Sync {
    /// Fire-and-forget append. Must not block the request path.
    fn record(&self, record: UsageRecord);
}

/// Appends tab-separated records to a file through a writer task.
#[derive(Debug)]
pub struct FileUsageSink {
    tx: mpsc::UnboundedSender<UsageRecord>,
}

impl FileUsageSink {
    pub fn spawn(path: PathBuf) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<UsageRecord>();
        tokio::spawn(async move {
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) => {
                    error!("Cannot open usage log {}: {e}", path.display());
                    // Drain the channel so senders never observe an error.
                    while rx.recv().await.is_some() {}
                    return;
                }
            };
            while let Some(record) = rx.recv().await {
                match file.write_all(record.to_line().as_bytes()).await {
                    Ok(()) => {
                        let _ = file.flush().await;
                    }
                    Err(e) => warn!("Usage record write failed: {e}"),
                }
            }
        });
        Arc::new(Self { tx })
    }
}

impl UsageSink for FileUsageSink {
    fn record(&self, record: UsageRecord) {
        if self.tx.send(record).is_err() {
            warn!("Usage sink writer task is gone; dropping record");
        }
    }
}

/// In-memory sink for tests and for running without a usage log.
#[derive(Debug, Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemoryUsageSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl UsageSink for MemoryUsageSink {
    fn record(&self, record: UsageRecord) {
        self.records.lock().unwrap().push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn should_record_requires_model_and_tokens() {
        let good = UsageRecord::new("k", "gpt-4o-mini", "/v1/chat/completions", 2, 3);
        assert!(good.should_record());
        assert_eq!(good.total_tokens(), 5);

        let no_model = UsageRecord::new("k", "", "/v1/chat/completions", 2, 3);
        assert!(!no_model.should_record());

        let unknown_model = UsageRecord::new("k", "unknown", "/v1/chat/completions", 2, 3);
        assert!(!unknown_model.should_record());

        let no_tokens = UsageRecord::new("k", "gpt-4o-mini", "/v1/chat/completions", 0, 0);
        assert!(!no_tokens.should_record());
    }

    #[test]
    fn date_is_utc_day() {
        let record = UsageRecord::new("k", "m", "/e", 1, 1);
        assert_eq!(record.date, Utc::now().format("%Y-%m-%d").to_string());
    }

    #[test]
    fn extract_usage_reads_tokens_and_model() {
        let body = json!({
            "model": "gpt-4o-mini",
            "usage": {"prompt_tokens": 2, "completion_tokens": 3, "total_tokens": 5}
        });
        let (tokens, model) = extract_usage(&body).unwrap();
        assert_eq!(tokens.prompt_tokens, 2);
        assert_eq!(tokens.completion_tokens, 3);
        assert_eq!(model.as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    fn extract_usage_absent_when_no_usage_object() {
        assert!(extract_usage(&json!({"choices": []})).is_none());
    }

    #[tokio::test]
    async fn file_sink_appends_tab_separated_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.log");
        let sink = FileUsageSink::spawn(path.clone());
        sink.record(UsageRecord::new(
            "test-user-1",
            "gpt-4o-mini",
            "/v1/chat/completions",
            2,
            3,
        ));

        // Writer task runs asynchronously; give it a moment.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let fields: Vec<&str> = contents.trim_end().split('\t').collect();
        assert_eq!(fields[0], "test-user-1");
        assert_eq!(fields[2], "gpt-4o-mini");
        assert_eq!(fields[3], "/v1/chat/completions");
        assert_eq!(fields[4], "2");
        assert_eq!(fields[5], "3");
        assert_eq!(fields[6], "5");
    }
}
