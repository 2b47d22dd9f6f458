//! API-key store: maps opaque client keys to principal records.
//!
//! The backing file is a JSON array of `{key, name, email}` objects,
//! provisioned by external tooling. Lookups never block: they clone an `Arc`
//! snapshot of the whole mapping. Reload swaps the snapshot atomically, so a
//! single lookup always observes one consistent generation; when two reloads
//! race, the most recent swap wins. Key equality uses constant-time
//! comparison to avoid leaking key prefixes through timing.

use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::{error, info};

/// A wrapper around String that uses constant-time equality comparison
/// to prevent timing attacks on API key validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConstantTimeString(String);

impl From<String> for ConstantTimeString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConstantTimeString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl PartialEq for ConstantTimeString {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl Eq for ConstantTimeString {}

impl Hash for ConstantTimeString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// An authenticated identity bound to an opaque key string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Principal {
    pub key: String,
    pub name: String,
    pub email: String,
}

type KeyMap = HashMap<ConstantTimeString, Principal>;

#[derive(Debug)]
pub struct KeyStore {
    path: PathBuf,
    map: RwLock<Arc<KeyMap>>,
}

impl KeyStore {
    /// Load the key file, failing if it is missing or malformed. Later
    /// reloads are tolerant; the initial load is not.
    pub fn load(path: &Path) -> Result<Arc<Self>, anyhow::Error> {
        let map = read_key_file(path)?;
        info!("Loaded {} API keys from {}", map.len(), path.display());
        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            map: RwLock::new(Arc::new(map)),
        }))
    }

    /// Build a store directly from records, bypassing the file. Used by the
    /// test harness; `reload` on such a store fails until a path exists.
    pub fn from_principals(principals: Vec<Principal>) -> Arc<Self> {
        let map = principals
            .into_iter()
            .map(|p| (ConstantTimeString::from(p.key.clone()), p))
            .collect();
        Arc::new(Self {
            path: PathBuf::new(),
            map: RwLock::new(Arc::new(map)),
        })
    }

    /// Non-blocking lookup against the current snapshot.
    pub fn lookup(&self, key: &str) -> Option<Principal> {
        let snapshot = Arc::clone(&self.map.read().expect("key map lock poisoned"));
        snapshot.get(&ConstantTimeString::from(key)).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().expect("key map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-read the backing file and swap the snapshot. A malformed file
    /// leaves the prior mapping intact.
    pub fn reload(&self) -> Result<usize, anyhow::Error> {
        let map = read_key_file(&self.path)?;
        let count = map.len();
        *self.map.write().expect("key map lock poisoned") = Arc::new(map);
        info!("Reloaded {} API keys from {}", count, self.path.display());
        Ok(count)
    }

    /// Watch the backing file and reload on every modification. Reload
    /// failures are logged and the previous mapping stays live.
    pub fn watch(self: &Arc<Self>) -> Result<(), anyhow::Error> {
        let (file_tx, mut file_rx) = mpsc::channel(16);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = file_tx.blocking_send(res);
            },
            NotifyConfig::default(),
        )?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        let store = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(res) = file_rx.recv().await {
                match res {
                    Ok(event) => {
                        if event.kind.is_modify() || event.kind.is_create() {
                            if let Err(e) = store.reload() {
                                error!("Key file reload failed, keeping prior keys: {e}");
                            }
                        }
                    }
                    Err(e) => error!("Key file watch error: {e}"),
                }
            }
        });

        // Keep the watcher alive for the process lifetime.
        std::mem::forget(watcher);
        Ok(())
    }
}

fn read_key_file(path: &Path) -> Result<KeyMap, anyhow::Error> {
    let contents = std::fs::read_to_string(path)?;
    let principals: Vec<Principal> = serde_json::from_str(&contents)?;
    Ok(principals
        .into_iter()
        .map(|p| (ConstantTimeString::from(p.key.clone()), p))
        .collect())
}
