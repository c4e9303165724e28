//! LLM backends for decision policies.

use std::sync::Arc;

pub mod ollama;
pub mod openai;
pub mod provider;

pub use provider::{Provider, ProviderError, Result};

use crate::config::DecisionSettings;

/// Provider factory.
pub fn create_provider(settings: &DecisionSettings) -> Result<Arc<dyn Provider>> {
    match settings.provider.as_str() {
        "ollama" => {
            let mut p = match &settings.base_url {
                Some(url) => ollama::OllamaProvider::with_base_url(url.clone()),
                None => ollama::OllamaProvider::new(),
            };
            if let Some(model) = &settings.model {
                p = p.model(model.clone());
            }
            Ok(Arc::new(p))
        }
        "openai" => {
            let mut p = openai::OpenAiProvider::new();
            if let Some(url) = &settings.base_url {
                p = p.base_url(url.clone());
            }
            if let Some(model) = &settings.model {
                p = p.model(model.clone());
            }
            Ok(Arc::new(p))
        }
        other => Err(ProviderError::Unknown(other.to_string())),
    }
}
