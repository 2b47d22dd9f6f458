//! Access logging with body redaction and size-based rotation.
//!
//! One line per request: timestamp, principal, client address, method, path,
//! and a JSON rendering of the body with large base64 payloads redacted so
//! image uploads do not balloon the log. Appends go through a writer task
//! and never block or fail the request.

use chrono::Utc;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Body fields subject to redaction when they hold large base64 blobs.
const REDACTED_FIELDS: &[&str] = &["image", "data", "content", "image_data"];

/// Minimum string length before redaction is considered.
const REDACTION_THRESHOLD: usize = 100;

/// Characters of the original value kept in the redaction marker.
const REDACTION_PREFIX_LEN: usize = 32;

#[derive(Debug)]
pub struct AccessLog {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl AccessLog {
    pub fn spawn(path: PathBuf) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            // Reopened lazily so a rotation rename starts a fresh file
            // instead of appending to the renamed backup forever.
            let mut file: Option<tokio::fs::File> = None;
            while let Some(line) = rx.recv().await {
                if tokio::fs::metadata(&path).await.is_err() {
                    file = None;
                }
                if file.is_none() {
                    match tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .await
                    {
                        Ok(opened) => file = Some(opened),
                        Err(e) => {
                            error!("Cannot open access log {}: {e}", path.display());
                            continue;
                        }
                    }
                }
                if let Some(open_file) = file.as_mut() {
                    match open_file.write_all(line.as_bytes()).await {
                        Ok(()) => {
                            let _ = open_file.flush().await;
                        }
                        Err(e) => {
                            warn!("Access log write failed: {e}");
                            file = None;
                        }
                    }
                }
            }
        });
        Arc::new(Self { tx: Some(tx) })
    }

    /// A no-op log for tests and for running without an access log.
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self { tx: None })
    }

    pub fn append(
        &self,
        principal_name: &str,
        principal_email: &str,
        client_addr: &str,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) {
        let Some(tx) = &self.tx else {
            return;
        };
        let rendered = body
            .map(|b| redact_body(b).to_string())
            .unwrap_or_else(|| "-".to_string());
        let line = format!(
            "{} {} <{}> {} {} {} {}\n",
            Utc::now().to_rfc3339(),
            principal_name,
            principal_email,
            client_addr,
            method,
            path,
            rendered,
        );
        let _ = tx.send(line);
    }

    /// Rename the log with a timestamp suffix once it exceeds `max_bytes`,
    /// keeping only the `keep` most recent backups. Returns whether a
    /// rotation happened.
    pub async fn rotate_if_needed(
        path: &Path,
        max_bytes: u64,
        keep: usize,
    ) -> Result<bool, anyhow::Error> {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return Ok(false);
        };
        if meta.len() <= max_bytes {
            return Ok(false);
        }

        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let rotated = path.with_extension(format!("log.{stamp}"));
        tokio::fs::rename(path, &rotated).await?;

        // Prune old backups beyond the retention count.
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let mut backups = Vec::new();
        let mut entries = tokio::fs::read_dir(parent).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&format!("{stem}.log.")) {
                backups.push(entry.path());
            }
        }
        backups.sort();
        while backups.len() > keep {
            let oldest = backups.remove(0);
            if let Err(e) = tokio::fs::remove_file(&oldest).await {
                warn!("Could not remove old log backup {}: {e}", oldest.display());
            }
        }
        Ok(true)
    }
}

/// Produce a copy of `body` with oversized base64 image payloads replaced by
/// a short marker. Only string values under the well-known field names are
/// touched; everything else is preserved byte-for-byte.
pub fn redact_body(body: &Value) -> Value {
    match body {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if let Value::String(s) = v {
                        if REDACTED_FIELDS.contains(&k.as_str()) && should_redact(s) {
                            return (k.clone(), Value::String(redaction_marker(s)));
                        }
                    }
                    (k.clone(), redact_body(v))
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_body).collect()),
        other => other.clone(),
    }
}

fn should_redact(value: &str) -> bool {
    value.len() > REDACTION_THRESHOLD && (is_data_url(value) || is_base64_run(value))
}

fn is_data_url(value: &str) -> bool {
    value.starts_with("data:")
}

/// A long unbroken run of base64 alphabet characters.
fn is_base64_run(value: &str) -> bool {
    value
        .bytes()
        .take(REDACTION_THRESHOLD + 1)
        .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
}

fn redaction_marker(value: &str) -> String {
    let prefix: String = value.chars().take(REDACTION_PREFIX_LEN).collect();
    format!("[BASE64_IMAGE_REDACTED: prefix={prefix}...]")
}
