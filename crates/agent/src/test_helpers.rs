//! Shared test helpers: a scripted provider and ready-made ports.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rondo_core::error::ProviderError;
use rondo_core::message::ChatMessage;
use rondo_core::provider::{FinishReason, ModerationVerdict, Provider, ProviderRequest, ProviderResponse, Usage};
use rondo_providers::{CompletionConfig, CompletionPort};

/// A mock provider that returns a sequence of scripted results.
///
/// Each call to `complete` pops the next result and records the request.
/// Panics if more calls are made than results provided.
pub struct SequentialMockProvider {
    responses: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    moderation: Option<ModerationVerdict>,
}

impl SequentialMockProvider {
    pub fn new(responses: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            moderation: None,
        }
    }

    /// Plain text answers in order.
    pub fn texts(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Ok(make_text_response(t))).collect())
    }

    /// Answer moderation calls with `flagged` (unset: moderation unsupported).
    pub fn with_moderation(mut self, flagged: bool) -> Self {
        self.moderation = Some(ModerationVerdict {
            flagged,
            categories: BTreeMap::from([("violence".to_string(), flagged)]),
        });
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut requests = self.requests.lock().unwrap();
        let call = requests.len();
        requests.push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("SequentialMockProvider: no more responses (call #{call})"))
    }

    async fn moderate(&self, _input: &str) -> Result<ModerationVerdict, ProviderError> {
        self.moderation
            .clone()
            .ok_or_else(|| ProviderError::NotConfigured("moderation not scripted".into()))
    }
}

/// Create a simple text response.
pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: ChatMessage::assistant(text),
        finish_reason: FinishReason::Stop,
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
    }
}

pub fn test_config() -> CompletionConfig {
    CompletionConfig {
        api_key: None,
        model: "gpt-4o-mini".into(),
        temperature: 0.0,
        max_tokens: 256,
        streaming: false,
        history_max_tokens: 3000,
        timeout: Duration::from_secs(5),
    }
}

pub fn port(provider: Arc<dyn Provider>) -> Arc<CompletionPort> {
    Arc::new(CompletionPort::new(provider, test_config()).unwrap())
}
