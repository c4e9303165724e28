//! Text completion provider trait.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not available: {0}")]
    NotAvailable(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Unknown provider: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Check if the backend is reachable and configured.
    async fn is_available(&self) -> bool;

    /// Complete a prompt. `model` overrides the default model.
    async fn complete(&self, prompt: &str, model: Option<&str>) -> Result<String>;

    fn default_model(&self) -> Option<&str>;
}
