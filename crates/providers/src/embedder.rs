//! Remote embedder backed by a provider's `/embeddings` endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use rondo_core::error::ProviderError;
use rondo_core::provider::{EmbeddingRequest, Provider};
use rondo_core::rag::Embedder;

pub struct ProviderEmbedder {
    provider: Arc<dyn Provider>,
    model: String,
}

impl ProviderEmbedder {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .provider
            .embed(EmbeddingRequest {
                model: self.model.clone(),
                inputs: inputs.to_vec(),
            })
            .await?;

        if response.embeddings.len() != inputs.len() {
            return Err(ProviderError::ApiError {
                status_code: 200,
                message: format!(
                    "expected {} embeddings, got {}",
                    inputs.len(),
                    response.embeddings.len()
                ),
            });
        }
        Ok(response.embeddings)
    }
}
