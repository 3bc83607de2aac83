//! Provider trait: the abstraction over LLM backends.
//!
//! A Provider knows how to send a conversation to an LLM and get a response
//! back, either as a complete message or as a stream of deltas. Providers that
//! speak the OpenAI wire format also expose embeddings, moderation and the
//! Files/Batches endpoints used for asynchronous batch generation.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ProviderError;
use crate::message::ChatMessage;

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "gpt-4o-mini")
    pub model: String,

    /// The conversation messages
    pub messages: Vec<ChatMessage>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Whether to stream the response
    #[serde(default)]
    pub stream: bool,
}

fn default_temperature() -> f32 {
    0.7
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    FunctionCall,
}

impl FinishReason {
    /// Parse the wire value; unknown values map to `None`.
    pub fn from_api(value: &str) -> Option<Self> {
        match value {
            "stop" => Some(Self::Stop),
            "length" => Some(Self::Length),
            "content_filter" => Some(Self::ContentFilter),
            "tool_calls" => Some(Self::ToolCalls),
            "function_call" => Some(Self::FunctionCall),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ContentFilter => "content_filter",
            Self::ToolCalls => "tool_calls",
            Self::FunctionCall => "function_call",
        }
    }
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated message
    pub message: ChatMessage,

    /// Why generation stopped
    pub finish_reason: FinishReason,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,
}

/// Token usage information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Set on the final chunk only
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

/// The boxed stream type returned by [`Provider::stream`].
///
/// Dropping the stream drops the underlying transport.
pub type ProviderStream = BoxStream<'static, Result<StreamChunk, ProviderError>>;

/// An embedding request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// The model to use for embeddings (e.g., "text-embedding-3-small").
    pub model: String,

    /// The texts to embed.
    pub inputs: Vec<String>,
}

/// An embedding response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// The embedding vectors, one per input text.
    pub embeddings: Vec<Vec<f32>>,

    /// Which model was used.
    pub model: String,
}

/// Verdict from an external content classifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModerationVerdict {
    pub flagged: bool,

    /// Category name → whether it was flagged.
    #[serde(default)]
    pub categories: BTreeMap<String, bool>,
}

impl ModerationVerdict {
    /// Names of the categories that were flagged, in sorted order.
    pub fn flagged_categories(&self) -> Vec<String> {
        self.categories
            .iter()
            .filter(|(_, hit)| **hit)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Server-side batch lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelled,
    Cancelling,
}

impl BatchStatus {
    /// Whether polling should stop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Expired | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::InProgress => "in_progress",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::Cancelling => "cancelling",
        }
    }
}

/// Parameters for creating a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBatchRequest {
    pub input_file_id: String,
    pub endpoint: String,
    pub completion_window: String,
}

/// A batch job as reported by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub status: BatchStatus,
    pub input_file_id: String,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
}

/// The core Provider trait.
///
/// The completion port, the moderation guard and the embedders call this
/// trait without knowing which backend is in use.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openai").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Send a request and get a lazy stream of response chunks.
    ///
    /// Default implementation calls `complete()` and yields a single final chunk.
    async fn stream(&self, request: ProviderRequest) -> Result<ProviderStream, ProviderError> {
        let response = self.complete(request).await?;
        let chunk = StreamChunk {
            content: Some(response.message.content),
            finish_reason: Some(response.finish_reason),
        };
        Ok(Box::pin(futures::stream::once(async move { Ok(chunk) })))
    }

    /// Generate embeddings for the given texts.
    async fn embed(&self, _request: EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
        Err(ProviderError::NotConfigured(format!(
            "Provider '{}' does not support embeddings",
            self.name()
        )))
    }

    /// Classify text with the provider's moderation endpoint.
    async fn moderate(&self, _input: &str) -> Result<ModerationVerdict, ProviderError> {
        Err(ProviderError::NotConfigured(format!(
            "Provider '{}' does not support moderation",
            self.name()
        )))
    }

    /// Upload a JSONL file for batch processing; returns the file id.
    async fn upload_batch_file(&self, _path: &Path) -> Result<String, ProviderError> {
        Err(ProviderError::NotConfigured(format!(
            "Provider '{}' does not support batches",
            self.name()
        )))
    }

    /// Create a batch over an uploaded input file.
    async fn create_batch(&self, _request: CreateBatchRequest) -> Result<BatchJob, ProviderError> {
        Err(ProviderError::NotConfigured(format!(
            "Provider '{}' does not support batches",
            self.name()
        )))
    }

    /// Fetch the current state of a batch.
    async fn retrieve_batch(&self, _batch_id: &str) -> Result<BatchJob, ProviderError> {
        Err(ProviderError::NotConfigured(format!(
            "Provider '{}' does not support batches",
            self.name()
        )))
    }

    /// Download a file's raw content.
    async fn file_content(&self, _file_id: &str) -> Result<String, ProviderError> {
        Err(ProviderError::NotConfigured(format!(
            "Provider '{}' does not support files",
            self.name()
        )))
    }

    /// Health check: can we reach the provider?
    async fn health_check(&self) -> Result<bool, ProviderError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(ProviderResponse {
                message: ChatMessage::assistant(last),
                finish_reason: FinishReason::Stop,
                usage: None,
                model: request.model,
            })
        }
    }

    fn request(text: &str) -> ProviderRequest {
        ProviderRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![ChatMessage::user(text)],
            temperature: default_temperature(),
            max_tokens: None,
            stream: false,
        }
    }

    #[test]
    fn provider_request_defaults() {
        let req = request("hi");
        assert!((req.temperature - 0.7).abs() < f32::EPSILON);
        assert!(!req.stream);
    }

    #[tokio::test]
    async fn default_stream_yields_one_final_chunk() {
        let mut stream = EchoProvider.stream(request("hello")).await.unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(chunk.content.as_deref(), Some("hello"));
        assert_eq!(chunk.finish_reason, Some(FinishReason::Stop));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn optional_capabilities_default_to_not_configured() {
        let err = EchoProvider.moderate("x").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }

    #[test]
    fn finish_reason_wire_values() {
        assert_eq!(FinishReason::from_api("length"), Some(FinishReason::Length));
        assert_eq!(FinishReason::from_api("weird"), None);
        assert_eq!(
            serde_json::to_string(&FinishReason::ContentFilter).unwrap(),
            "\"content_filter\""
        );
    }

    #[test]
    fn batch_status_terminal_states() {
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Expired.is_terminal());
        assert!(!BatchStatus::Finalizing.is_terminal());
        let parsed: BatchStatus = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(parsed, BatchStatus::InProgress);
    }

    #[test]
    fn moderation_flagged_categories_sorted() {
        let verdict = ModerationVerdict {
            flagged: true,
            categories: BTreeMap::from([
                ("violence".to_string(), true),
                ("hate".to_string(), true),
                ("sexual".to_string(), false),
            ]),
        };
        assert_eq!(verdict.flagged_categories(), vec!["hate", "violence"]);
    }
}
