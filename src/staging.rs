//! On-disk staging for multipart upload parts, plus the per-principal
//! upload slot counter.
//!
//! Every staged file is owned by exactly one `StagedUpload`, which deletes
//! its files on drop. The drop path is synchronous best-effort so cleanup
//! survives panics and early returns; the happy path calls the async
//! `cleanup` explicitly. A periodic sweep removes any orphan the drop path
//! missed (e.g. after a hard crash of a worker task).

use crate::errors::ProxyError;
use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// One multipart part written to disk.
#[derive(Debug)]
pub struct StagedPart {
    pub field_name: String,
    pub file_name: Option<String>,
    pub mime: Option<String>,
    pub path: PathBuf,
    pub len: u64,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub async fn new(dir: PathBuf) -> Result<Self, anyhow::Error> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Write one part's bytes to a uniquely named file.
    pub async fn stage(
        &self,
        field_name: &str,
        file_name: Option<String>,
        mime: Option<String>,
        data: Bytes,
    ) -> Result<StagedPart, std::io::Error> {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let millis = chrono::Utc::now().timestamp_millis();
        let path = self.dir.join(format!("part_{millis}_{suffix}.bin"));
        tokio::fs::write(&path, &data).await?;
        Ok(StagedPart {
            field_name: field_name.to_string(),
            file_name,
            mime,
            path,
            len: data.len() as u64,
            created_at: SystemTime::now(),
        })
    }

    /// Delete any staged file older than `max_age`. Returns the number of
    /// files removed.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let mut removed = 0;
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return 0;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .unwrap_or_default();
            if age >= max_age {
                if tokio::fs::remove_file(entry.path()).await.is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!("Swept {removed} orphaned staging files");
        }
        removed
    }
}

/// Owns the staged parts of one request; files are deleted on every exit
/// path from the multipart handler.
#[derive(Debug, Default)]
pub struct StagedUpload {
    parts: Vec<StagedPart>,
    cleaned: bool,
}

impl StagedUpload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, part: StagedPart) {
        self.parts.push(part);
    }

    pub fn parts(&self) -> &[StagedPart] {
        &self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub async fn cleanup(&mut self) {
        for part in &self.parts {
            if let Err(e) = tokio::fs::remove_file(&part.path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove staged file {}: {e}", part.path.display());
                }
            }
        }
        self.cleaned = true;
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        if self.cleaned {
            return;
        }
        for part in &self.parts {
            let _ = std::fs::remove_file(&part.path);
        }
    }
}

/// Per-principal bound on concurrent multipart uploads, orthogonal to the
/// scheduler's concurrency limit.
#[derive(Debug)]
pub struct UploadSlots {
    max_per_principal: usize,
    counts: DashMap<String, usize>,
}

impl UploadSlots {
    pub fn new(max_per_principal: usize) -> Arc<Self> {
        Arc::new(Self {
            max_per_principal,
            counts: DashMap::new(),
        })
    }

    pub fn try_acquire(self: &Arc<Self>, principal_key: &str) -> Result<UploadSlot, ProxyError> {
        let mut entry = self.counts.entry(principal_key.to_string()).or_insert(0);
        if *entry >= self.max_per_principal {
            crate::metrics::record_upload_rejection();
            return Err(ProxyError::UploadQuotaExceeded);
        }
        *entry += 1;
        drop(entry);
        Ok(UploadSlot {
            slots: Arc::clone(self),
            principal_key: principal_key.to_string(),
        })
    }

    pub fn in_flight(&self, principal_key: &str) -> usize {
        self.counts.get(principal_key).map(|c| *c).unwrap_or(0)
    }

    fn release(&self, principal_key: &str) {
        let remove = match self.counts.get_mut(principal_key) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if remove {
            self.counts.remove_if(principal_key, |_, count| *count == 0);
        }
    }
}

/// RAII guard for one upload slot.
#[derive(Debug)]
pub struct UploadSlot {
    slots: Arc<UploadSlots>,
    principal_key: String,
}

impl Drop for UploadSlot {
    fn drop(&mut self) {
        self.slots.release(&self.principal_key);
    }
}
