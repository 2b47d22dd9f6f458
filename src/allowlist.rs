//! Endpoint and model allowlisting.
//!
//! Stateless policy decisions over the immutable `ALLOWLIST` config section:
//! which upstream endpoints may be called, which models may be requested,
//! and substitution of the default model when a request omits one.

use crate::config::AllowlistSettings;
use crate::errors::ProxyError;
use serde_json::{Value, json};
use std::collections::HashSet;
use tracing::info;

#[derive(Debug, Clone)]
pub struct Allowlist {
    enabled: bool,
    endpoints: HashSet<String>,
    models: HashSet<String>,
    default_model: String,
}

impl Allowlist {
    pub fn from_settings(settings: &AllowlistSettings) -> Self {
        Self {
            enabled: settings.enabled,
            endpoints: settings.endpoints.iter().cloned().collect(),
            models: settings.models.iter().cloned().collect(),
            default_model: settings.default_model.clone(),
        }
    }

    #[cfg(test)]
    pub fn permissive() -> Self {
        Self {
            enabled: false,
            endpoints: HashSet::new(),
            models: HashSet::new(),
            default_model: "gpt-4o-mini".to_string(),
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Normalize a request path for the endpoint check: drop the query
    /// string and ensure the `/v1/` prefix.
    fn canonical_endpoint(path: &str) -> String {
        let path = path.split('?').next().unwrap_or(path);
        if path.starts_with("/v1/") {
            path.to_string()
        } else {
            format!("/v1/{}", path.trim_start_matches('/'))
        }
    }

    pub fn endpoint_allowed(&self, path: &str) -> bool {
        if !self.enabled {
            return true;
        }
        self.endpoints.contains(&Self::canonical_endpoint(path))
    }

    pub fn model_allowed(&self, model: &str) -> bool {
        if !self.enabled {
            return true;
        }
        // An empty model is allowed here; it gets defaulted in normalize.
        if model.is_empty() {
            return true;
        }
        self.models.contains(model)
    }

    /// Validate the `model` field of an outgoing JSON body, substituting the
    /// default when absent. Mutates only the outgoing copy; callers keep the
    /// inbound body untouched. Returns the effective model name.
    pub fn normalize_model(
        &self,
        body: &mut Value,
        endpoint: &str,
    ) -> Result<String, ProxyError> {
        let Some(object) = body.as_object_mut() else {
            return Err(ProxyError::MalformedRequest(
                "request body must be a JSON object".to_string(),
            ));
        };

        let requested = object
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if requested.is_empty() {
            info!(
                endpoint,
                default_model = %self.default_model,
                "No model specified, substituting default"
            );
            object.insert("model".to_string(), json!(self.default_model));
            return Ok(self.default_model.clone());
        }

        if !self.model_allowed(&requested) {
            return Err(ProxyError::ModelNotAllowed(requested));
        }
        Ok(requested)
    }

    /// Summary rendered into the `/health` payload.
    pub fn summary(&self) -> Value {
        json!({
            "enabled": self.enabled,
            "endpoints": self.endpoints.len(),
            "models": self.models.len(),
            "default_model": self.default_model,
        })
    }
}
