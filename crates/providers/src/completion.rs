//! The LLM completion port.
//!
//! Wraps a [`Provider`] with a validated completion configuration. Every
//! history handed to the port is trimmed to the configured token budget
//! before it reaches the provider; a leading system prompt is pinned and its
//! tokens are charged against that budget.
//!
//! The port never retries. Transient failures surface as errors (single-shot)
//! or as a final error chunk (streaming) and the caller decides what to do.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use rondo_config::CompletionSettings;
use rondo_core::error::{Error, ProviderError, Result};
use rondo_core::message::{ChatMessage, Role};
use rondo_core::provider::{FinishReason, Provider, ProviderRequest, ProviderStream, StreamChunk};
use rondo_core::token::{Tokenizer, TokenizerFamily};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Validated settings shared by every completion mode.
#[derive(Clone)]
pub struct CompletionConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub streaming: bool,
    pub history_max_tokens: usize,
    pub timeout: Duration,
}

impl std::fmt::Debug for CompletionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("streaming", &self.streaming)
            .field("history_max_tokens", &self.history_max_tokens)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CompletionConfig {
    pub fn from_settings(settings: &CompletionSettings, api_key: Option<String>) -> Self {
        Self {
            api_key,
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            streaming: settings.streaming,
            history_max_tokens: settings.history_max_tokens,
            timeout: Duration::from_secs(settings.timeout_secs),
        }
    }

    /// Check the ranges and resolve the tokenizer family of the model tag.
    pub fn validate(&self) -> Result<TokenizerFamily> {
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(Error::invalid_config(format!(
                "temperature {} is outside [0, 1]",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(Error::invalid_config("max_tokens must be positive"));
        }
        TokenizerFamily::for_model(&self.model)
            .ok_or_else(|| Error::invalid_config(format!("unknown model tag '{}'", self.model)))
    }
}

/// A complete, non-streamed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub role: Role,
    pub content: String,
    pub finish_reason: FinishReason,
}

impl CompletionResult {
    pub fn into_message(self) -> ChatMessage {
        ChatMessage::new(self.role, self.content)
    }
}

/// One element of a streamed reply. The final element carries a
/// `finish_reason`; every earlier one carries `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamResponse {
    pub content: Option<String>,
    pub finish_reason: Option<FinishReason>,
}

impl StreamResponse {
    /// The terminal element emitted when the transport fails mid-stream.
    pub fn failure(error: &ProviderError) -> Self {
        Self {
            content: Some(error.to_string()),
            finish_reason: Some(FinishReason::Stop),
        }
    }

    pub fn is_final(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Render as one Server-Sent-Events frame.
    pub fn to_sse_frame(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".into());
        format!("data: {json}\n\n")
    }
}

impl From<StreamChunk> for StreamResponse {
    fn from(chunk: StreamChunk) -> Self {
        Self {
            content: chunk.content,
            finish_reason: chunk.finish_reason,
        }
    }
}

/// Provider-agnostic completion entry point.
pub struct CompletionPort {
    provider: Arc<dyn Provider>,
    config: CompletionConfig,
    tokenizer: Tokenizer,
}

impl CompletionPort {
    /// Build a port; rejects out-of-range temperature and unknown model tags.
    pub fn new(provider: Arc<dyn Provider>, config: CompletionConfig) -> Result<Self> {
        let family = config.validate()?;
        Ok(Self {
            provider,
            config,
            tokenizer: Tokenizer::new(family),
        })
    }

    pub fn config(&self) -> &CompletionConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Trim a history to the token budget, keeping a leading system prompt.
    pub fn prepare_history(&self, history: &[ChatMessage]) -> Vec<ChatMessage> {
        let budget = self.config.history_max_tokens;
        match history.split_first() {
            Some((first, rest)) if first.role == Role::System => {
                let pinned = self.tokenizer.count_message_tokens(first);
                let remaining = budget.saturating_sub(pinned);
                let mut out = Vec::with_capacity(history.len());
                out.push(first.clone());
                out.extend(self.tokenizer.trim_history(rest, remaining));
                out
            }
            _ => self.tokenizer.trim_history(history, budget),
        }
    }

    fn request(&self, history: &[ChatMessage], stream: bool) -> ProviderRequest {
        ProviderRequest {
            model: self.config.model.clone(),
            messages: self.prepare_history(history),
            temperature: self.config.temperature,
            max_tokens: Some(self.config.max_tokens),
            stream,
        }
    }

    /// Single-shot completion.
    pub async fn complete(&self, history: &[ChatMessage]) -> Result<CompletionResult> {
        let request = self.request(history, false);
        debug!(
            provider = self.provider.name(),
            model = %request.model,
            messages = request.messages.len(),
            "Requesting completion"
        );

        let response = tokio::time::timeout(self.config.timeout, self.provider.complete(request))
            .await
            .map_err(|_| {
                ProviderError::Timeout(format!("completion exceeded {:?}", self.config.timeout))
            })??;

        if response.finish_reason == FinishReason::Length {
            debug!(model = %response.model, "Completion truncated by max_tokens");
        }

        Ok(CompletionResult {
            role: response.message.role,
            content: response.message.content,
            finish_reason: response.finish_reason,
        })
    }

    /// Convenience: one system prompt plus one user prompt, content only.
    pub async fn generate(&self, system: &str, user: &str) -> Result<String> {
        let history = [ChatMessage::system(system), ChatMessage::user(user)];
        Ok(self.complete(&history).await?.content)
    }

    /// Streaming completion. The returned stream is finite, always ends with a
    /// chunk whose `finish_reason` is set, and reports transport failures as
    /// that final chunk instead of an error.
    pub async fn stream(&self, history: &[ChatMessage]) -> BoxStream<'static, StreamResponse> {
        let request = self.request(history, true);
        debug!(provider = self.provider.name(), model = %request.model, "Requesting stream");

        match tokio::time::timeout(self.config.timeout, self.provider.stream(request)).await {
            Ok(Ok(inner)) => into_responses(inner),
            Ok(Err(e)) => failure_stream(e),
            Err(_) => failure_stream(ProviderError::Timeout(format!(
                "stream did not start within {:?}",
                self.config.timeout
            ))),
        }
    }
}

fn failure_stream(error: ProviderError) -> BoxStream<'static, StreamResponse> {
    warn!(error = %error, "Streaming completion failed");
    futures::stream::once(async move { StreamResponse::failure(&error) }).boxed()
}

enum Relay {
    Open(ProviderStream),
    Closed,
}

fn into_responses(inner: ProviderStream) -> BoxStream<'static, StreamResponse> {
    futures::stream::unfold(Relay::Open(inner), |state| async move {
        let Relay::Open(mut inner) = state else {
            return None;
        };
        match inner.next().await {
            Some(Ok(chunk)) => {
                let response = StreamResponse::from(chunk);
                let next = if response.is_final() {
                    Relay::Closed
                } else {
                    Relay::Open(inner)
                };
                Some((response, next))
            }
            Some(Err(e)) => {
                warn!(error = %e, "Stream interrupted");
                Some((StreamResponse::failure(&e), Relay::Closed))
            }
            None => Some((
                StreamResponse {
                    content: None,
                    finish_reason: Some(FinishReason::Stop),
                },
                Relay::Closed,
            )),
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rondo_core::provider::ProviderResponse;
    use std::sync::Mutex;

    /// Records the last request and replies with a fixed script.
    struct ScriptProvider {
        seen: Mutex<Option<ProviderRequest>>,
        chunks: Vec<std::result::Result<StreamChunk, ProviderError>>,
        fail_with: Option<ProviderError>,
    }

    impl ScriptProvider {
        fn new() -> Self {
            Self {
                seen: Mutex::new(None),
                chunks: Vec::new(),
                fail_with: None,
            }
        }
    }

    #[async_trait]
    impl Provider for ScriptProvider {
        fn name(&self) -> &str {
            "script"
        }

        async fn complete(
            &self,
            request: ProviderRequest,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            *self.seen.lock().unwrap() = Some(request.clone());
            if let Some(e) = &self.fail_with {
                return Err(e.clone());
            }
            Ok(ProviderResponse {
                message: ChatMessage::assistant("ok"),
                finish_reason: FinishReason::Length,
                usage: None,
                model: request.model,
            })
        }

        async fn stream(
            &self,
            _request: ProviderRequest,
        ) -> std::result::Result<ProviderStream, ProviderError> {
            if let Some(e) = &self.fail_with {
                return Err(e.clone());
            }
            Ok(futures::stream::iter(self.chunks.clone()).boxed())
        }
    }

    fn config(history_max_tokens: usize) -> CompletionConfig {
        CompletionConfig {
            api_key: Some("sk-test".into()),
            model: "gpt-4o-mini".into(),
            temperature: 0.5,
            max_tokens: 100,
            streaming: false,
            history_max_tokens,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn rejects_out_of_range_temperature() {
        let mut cfg = config(100);
        cfg.temperature = 1.2;
        let err = CompletionPort::new(Arc::new(ScriptProvider::new()), cfg).err().unwrap();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn rejects_unknown_model() {
        let mut cfg = config(100);
        cfg.model = "not-a-model".into();
        assert!(matches!(
            CompletionPort::new(Arc::new(ScriptProvider::new()), cfg),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn debug_redacts_key() {
        let debug = format!("{:?}", config(10));
        assert!(!debug.contains("sk-test"));
    }

    #[test]
    fn prepare_history_pins_system_prompt() {
        let port = CompletionPort::new(Arc::new(ScriptProvider::new()), config(40)).unwrap();
        let system = ChatMessage::system("rules");
        let pinned = port.tokenizer().count_message_tokens(&system);
        let history = vec![
            system.clone(),
            ChatMessage::user("a".repeat(400)),
            ChatMessage::user("short"),
        ];

        let prepared = port.prepare_history(&history);
        assert_eq!(prepared[0], system);
        assert_eq!(prepared.last().unwrap().content, "short");
        let rest: usize = prepared[1..]
            .iter()
            .map(|m| port.tokenizer().count_message_tokens(m))
            .sum();
        assert!(rest <= 40 - pinned);
    }

    #[tokio::test]
    async fn complete_sends_trimmed_history_and_keeps_length_reason() {
        let provider = Arc::new(ScriptProvider::new());
        let port = CompletionPort::new(provider.clone(), config(12)).unwrap();
        let history = vec![
            ChatMessage::user("one two three four five six seven eight nine ten"),
            ChatMessage::user("hi"),
        ];

        let result = port.complete(&history).await.unwrap();
        assert_eq!(result.role, Role::Assistant);
        assert_eq!(result.finish_reason, FinishReason::Length);

        let seen = provider.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.messages.last().unwrap().content, "hi");
        assert!(seen.messages.len() < history.len());
        assert_eq!(seen.max_tokens, Some(100));
    }

    #[tokio::test]
    async fn complete_surfaces_auth_failure() {
        let mut provider = ScriptProvider::new();
        provider.fail_with = Some(ProviderError::AuthenticationFailed("bad key".into()));
        let port = CompletionPort::new(Arc::new(provider), config(100)).unwrap();

        let err = port.complete(&[ChatMessage::user("x")]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Provider(ProviderError::AuthenticationFailed(_))
        ));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn stream_ends_with_finish_reason() {
        let mut provider = ScriptProvider::new();
        provider.chunks = vec![
            Ok(StreamChunk {
                content: Some("Hel".into()),
                finish_reason: None,
            }),
            Ok(StreamChunk {
                content: Some("lo".into()),
                finish_reason: None,
            }),
            Ok(StreamChunk {
                content: None,
                finish_reason: Some(FinishReason::Stop),
            }),
        ];
        let port = CompletionPort::new(Arc::new(provider), config(100)).unwrap();

        let out: Vec<StreamResponse> = port.stream(&[ChatMessage::user("x")]).await.collect().await;
        assert_eq!(out.len(), 3);
        assert!(out[..2].iter().all(|r| r.finish_reason.is_none()));
        assert_eq!(out[2].finish_reason, Some(FinishReason::Stop));
        let text: String = out.iter().filter_map(|r| r.content.clone()).collect();
        assert_eq!(text, "Hello");
    }

    #[tokio::test]
    async fn stream_transport_failure_becomes_final_chunk() {
        let mut provider = ScriptProvider::new();
        provider.chunks = vec![
            Ok(StreamChunk {
                content: Some("partial".into()),
                finish_reason: None,
            }),
            Err(ProviderError::StreamInterrupted("connection reset".into())),
            Ok(StreamChunk {
                content: Some("never seen".into()),
                finish_reason: None,
            }),
        ];
        let port = CompletionPort::new(Arc::new(provider), config(100)).unwrap();

        let out: Vec<StreamResponse> = port.stream(&[ChatMessage::user("x")]).await.collect().await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].finish_reason, Some(FinishReason::Stop));
        assert!(out[1].content.as_deref().unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn stream_start_failure_is_single_chunk() {
        let mut provider = ScriptProvider::new();
        provider.fail_with = Some(ProviderError::Network("dns".into()));
        let port = CompletionPort::new(Arc::new(provider), config(100)).unwrap();

        let out: Vec<StreamResponse> = port.stream(&[ChatMessage::user("x")]).await.collect().await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_final());
    }

    #[test]
    fn sse_frame_format() {
        let frame = StreamResponse {
            content: Some("hi".into()),
            finish_reason: None,
        }
        .to_sse_frame();
        assert_eq!(frame, "data: {\"content\":\"hi\",\"finish_reason\":null}\n\n");

        let last = StreamResponse {
            content: None,
            finish_reason: Some(FinishReason::Stop),
        }
        .to_sse_frame();
        assert!(last.contains("\"finish_reason\":\"stop\""));
    }

    #[test]
    fn stream_response_json_roundtrip() {
        let chunks = [
            StreamResponse {
                content: Some("東京駅は".into()),
                finish_reason: None,
            },
            StreamResponse {
                content: None,
                finish_reason: Some(FinishReason::Length),
            },
            StreamResponse::failure(&ProviderError::Network("connection reset".into())),
        ];
        for chunk in chunks {
            let json = serde_json::to_string(&chunk).unwrap();
            let back: StreamResponse = serde_json::from_str(&json).unwrap();
            assert_eq!(back, chunk);

            let frame = chunk.to_sse_frame();
            let payload = frame.strip_prefix("data: ").unwrap().trim_end();
            assert_eq!(serde_json::from_str::<StreamResponse>(payload).unwrap(), chunk);
        }
    }
}
