//! Configuration for the proxy server.
//!
//! Two layers: command-line flags (listen port, file locations, upstream
//! base URL) and a JSON policy document holding the rate-limit, allowlist,
//! and HTTP-client sections. The policy document is loaded once at startup;
//! the API-key file is the only hot-reloaded input.

use anyhow::{Context, anyhow};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// The port on which the proxy server will listen.
    #[arg(short = 'p', long, default_value_t = 8787)]
    pub port: u16,

    /// Path to the JSON policy document.
    #[arg(short = 'c', long, default_value = "config.json")]
    pub config: PathBuf,

    /// Path to the API-key file (JSON array of {key, name, email}).
    #[arg(short = 'k', long, default_value = "api_keys.json")]
    pub keys: PathBuf,

    /// Base URL of the upstream API.
    #[arg(long, default_value = "https://api.openai.com")]
    pub upstream: Url,

    /// Directory for staged multipart uploads.
    #[arg(long, default_value = "uploads")]
    pub staging_dir: PathBuf,

    /// Access log file.
    #[arg(long, default_value = "access.log")]
    pub access_log: PathBuf,

    /// Usage record file.
    #[arg(long, default_value = "usage.log")]
    pub usage_log: PathBuf,

    /// Whether to keep watching the key file for changes.
    #[arg(short = 'w', long, default_value_t = true)]
    pub watch: bool,
}

impl Cli {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if !self.config.exists() {
            return Err(anyhow!(
                "Config file '{}' does not exist",
                self.config.display()
            ));
        }
        if !self.keys.exists() {
            return Err(anyhow!(
                "Key file '{}' does not exist",
                self.keys.display()
            ));
        }
        Ok(self)
    }
}

/// One limiter's parameters inside the `RATE_LIMITING` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    pub requests_per_minute: u32,
    pub concurrent_limit: usize,
    pub queue_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub global: LimiterSettings,
    pub per_user: LimiterSettings,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
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
            metrics_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Default for AllowlistSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoints: vec![
                "/v1/chat/completions".to_string(),
                "/v1/embeddings".to_string(),
                "/v1/audio/transcriptions".to_string(),
            ],
            models: vec![default_model()],
            default_model: default_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_multipart_timeout_secs")]
    pub multipart_timeout_secs: u64,
    #[serde(default = "default_retry_statuses")]
    pub retry_statuses: Vec<u16>,
}

impl Default for HttpClientSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_secs: default_timeout_secs(),
            multipart_timeout_secs: default_multipart_timeout_secs(),
            retry_statuses: default_retry_statuses(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_multipart_timeout_secs() -> u64 {
    30
}

fn default_retry_statuses() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

/// The JSON policy document. Section names mirror the deployed config files,
/// hence the SCREAMING_CASE keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "RATE_LIMITING", default)]
    pub rate_limiting: RateLimitSettings,

    #[serde(rename = "ALLOWLIST", default)]
    pub allowlist: AllowlistSettings,

    #[serde(rename = "HTTP_CLIENT", default)]
    pub http_client: HttpClientSettings,

    #[serde(rename = "OPENAI_API_KEY", default)]
    pub openai_api_key: Option<String>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(settings)
    }

    /// The upstream key from the config file, falling back to the
    /// `OPENAI_API_KEY` environment variable when the file omits it.
    pub fn resolve_upstream_key(&self) -> Result<String, anyhow::Error> {
        if let Some(key) = &self.openai_api_key {
            if !key.trim().is_empty() {
                return Ok(key.trim().to_string());
            }
        }
        std::env::var("OPENAI_API_KEY")
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                anyhow!("No upstream API key: set OPENAI_API_KEY in the config file or environment")
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_full_document() {
        let raw = r#"{
            "RATE_LIMITING": {
                "global": {"requests_per_minute": 600, "concurrent_limit": 50, "queue_size": 100},
                "per_user": {"requests_per_minute": 60, "concurrent_limit": 5, "queue_size": 20},
                "enabled": true,
                "metrics_enabled": false
            },
            "ALLOWLIST": {
                "enabled": true,
                "endpoints": ["/v1/chat/completions"],
                "models": ["gpt-4o-mini"],
                "default_model": "gpt-4o-mini"
            },
            "HTTP_CLIENT": {
                "max_retries": 2,
                "base_delay_ms": 100,
                "max_delay_ms": 5000,
                "timeout_secs": 60,
                "multipart_timeout_secs": 15,
                "retry_statuses": [429, 503]
            },
            "OPENAI_API_KEY": "sk-test"
        }"#;
        let settings: Settings = serde_json::from_str(raw).unwrap();
        assert_eq!(settings.rate_limiting.global.requests_per_minute, 600);
        assert_eq!(settings.rate_limiting.per_user.queue_size, 20);
        assert!(!settings.rate_limiting.metrics_enabled);
        assert_eq!(settings.allowlist.endpoints.len(), 1);
        assert_eq!(settings.http_client.max_retries, 2);
        assert_eq!(settings.http_client.retry_statuses, vec![429, 503]);
        assert_eq!(settings.openai_api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert!(settings.rate_limiting.enabled);
        assert_eq!(settings.http_client.timeout_secs, 120);
        assert_eq!(settings.http_client.multipart_timeout_secs, 30);
        assert_eq!(
            settings.http_client.retry_statuses,
            vec![429, 500, 502, 503, 504]
        );
    }

    #[test]
    fn config_key_takes_precedence_over_env() {
        let settings = Settings {
            openai_api_key: Some("sk-from-file".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.resolve_upstream_key().unwrap(), "sk-from-file");
    }

    #[test]
    fn load_rejects_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(Settings::load(file.path()).is_err());
    }
}
