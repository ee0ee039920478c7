use std::fmt;

use serde::{Deserialize, Serialize};

/// A concrete `provider/model` pair a prompt can be pinned to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(rename = "providerID", alias = "provider_id", alias = "providerId")]
    pub provider_id: String,
    #[serde(rename = "modelID", alias = "model_id", alias = "modelId")]
    pub model_id: String,
}

impl ModelSpec {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }

    /// Parses a `provider/model` reference. The split happens at the first
    /// slash, so model ids may themselves contain slashes
    /// (`openrouter/moonshotai/kimi-k2.5`).
    pub fn parse(reference: &str) -> Option<Self> {
        let (provider, model) = reference.split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider, model))
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}
