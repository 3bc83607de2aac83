//! LLM provider implementations for Rondo.
//!
//! All providers implement the `rondo_core::Provider` trait. The
//! [`CompletionPort`] wraps one with a validated configuration and is what the
//! rest of the workspace talks to.

pub mod batch;
pub mod completion;
pub mod embedder;
pub mod openai_compat;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use rondo_config::AppConfig;
use rondo_core::Provider;
use rondo_core::error::ProviderError;

pub use batch::{BatchHandle, BatchOutput, BatchRunner, MessageChunk};
pub use completion::{CompletionConfig, CompletionPort, CompletionResult, StreamResponse};
pub use embedder::ProviderEmbedder;
pub use openai_compat::OpenAiCompatProvider;
pub use retry::{RetryPolicy, Retryable};

/// Build the configured provider. Requires an API key.
pub fn build_from_config(config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let api_key = config.api_key.clone().ok_or_else(|| {
        ProviderError::NotConfigured(
            "no API key: set RONDO_API_KEY or OPENAI_API_KEY, or api_key in config.toml".into(),
        )
    })?;

    let provider = OpenAiCompatProvider::new(
        "openai",
        config.completion.base_url.clone(),
        api_key,
        Duration::from_secs(config.completion.timeout_secs),
    )?;
    Ok(Arc::new(provider))
}
