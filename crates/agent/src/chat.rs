//! One-to-one chat over a user's ChatLog.
//!
//! Input passes the static guardrails, is logged, and the whole log (hidden
//! entries included) becomes the completion history. Replies are logged as
//! they finish. A reply carrying the session-end sentinel triggers the
//! evaluation.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use rondo_core::conversation::NewChatLog;
use rondo_core::guard::GuardrailConfig;
use rondo_core::message::{ChatMessage, Role};
use rondo_core::provider::FinishReason;
use rondo_core::store::ConversationStore;
use rondo_guard::{BlockCategory, GuardPipeline, GuardVerdict};
use rondo_providers::{CompletionPort, StreamResponse};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::evaluation::{Evaluation, SessionEvaluator, is_session_end};

pub const DEFAULT_ASSISTANT_NAME: &str = "Rondo";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ChatReply {
    Answer {
        content: String,
        finish_reason: FinishReason,
        evaluation: Option<Evaluation>,
    },
    /// The input was refused; nothing was logged.
    Blocked { category: BlockCategory, message: String },
}

impl ChatReply {
    pub fn text(&self) -> &str {
        match self {
            ChatReply::Answer { content, .. } => content,
            ChatReply::Blocked { message, .. } => message,
        }
    }
}

pub struct ChatSession {
    store: Arc<dyn ConversationStore>,
    port: Arc<CompletionPort>,
    guards: Arc<GuardPipeline>,
    evaluator: SessionEvaluator,
    guardrail: GuardrailConfig,
    user: String,
    assistant_name: String,
    system_prompt: Option<String>,
    end_sentinel: String,
}

impl ChatSession {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        port: Arc<CompletionPort>,
        guards: Arc<GuardPipeline>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            evaluator: SessionEvaluator::new(port.clone(), store.clone()),
            store,
            port,
            guards,
            guardrail: GuardrailConfig::default(),
            user: user.into(),
            assistant_name: DEFAULT_ASSISTANT_NAME.into(),
            system_prompt: None,
            end_sentinel: String::new(),
        }
    }

    pub fn with_guardrail(mut self, guardrail: GuardrailConfig) -> Self {
        self.guardrail = guardrail;
        self
    }

    /// Name shown in block messages.
    pub fn with_assistant_name(mut self, name: impl Into<String>) -> Self {
        self.assistant_name = name.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Empty disables the evaluation.
    pub fn with_end_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.end_sentinel = sentinel.into();
        self
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// The completion history: system prompt, then every log entry.
    pub async fn history(&self) -> rondo_core::Result<Vec<ChatMessage>> {
        let logs = self.store.chat_logs(&self.user).await?;
        let mut history = Vec::with_capacity(logs.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            history.push(ChatMessage::system(prompt.as_str()));
        }
        history.extend(logs.into_iter().map(|log| ChatMessage::new(log.role, log.content)));
        Ok(history)
    }

    fn screen(&self, input: &str) -> Option<ChatReply> {
        match self.guards.check_static(input, &self.assistant_name, &self.guardrail) {
            GuardVerdict::Block { category, message, .. } => {
                info!(user = %self.user, %category, "Chat input blocked");
                Some(ChatReply::Blocked { category, message })
            }
            GuardVerdict::Allow(_) => None,
        }
    }

    async fn log_input(&self, input: &str) -> rondo_core::Result<Vec<ChatMessage>> {
        self.store
            .append_chat_log(NewChatLog::visible(self.user.as_str(), Role::User, input))
            .await?;
        self.history().await
    }

    pub async fn send(&self, input: &str) -> rondo_core::Result<ChatReply> {
        if let Some(blocked) = self.screen(input) {
            return Ok(blocked);
        }
        let mut history = self.log_input(input).await?;

        let result = self.port.complete(&history).await?;
        self.store
            .append_chat_log(NewChatLog::visible(
                self.user.as_str(),
                Role::Assistant,
                result.content.as_str(),
            ))
            .await?;
        debug!(user = %self.user, chars = result.content.chars().count(), "Chat reply logged");

        let evaluation = if is_session_end(&result.content, &self.end_sentinel) {
            history.push(ChatMessage::assistant(result.content.as_str()));
            match self.evaluator.evaluate(&self.user, &history).await {
                Ok(evaluation) => Some(evaluation),
                Err(e) => {
                    warn!(user = %self.user, error = %e, "Session evaluation failed");
                    None
                }
            }
        } else {
            None
        };

        Ok(ChatReply::Answer {
            content: result.content,
            finish_reason: result.finish_reason,
            evaluation,
        })
    }

    /// Stream the reply. A blocked input yields a single final chunk with the
    /// block message. The reply is logged once the final chunk arrives.
    pub async fn send_stream(&self, input: &str) -> rondo_core::Result<BoxStream<'static, StreamResponse>> {
        if let Some(blocked) = self.screen(input) {
            let chunk = StreamResponse {
                content: Some(blocked.text().to_string()),
                finish_reason: Some(FinishReason::Stop),
            };
            return Ok(futures::stream::once(async move { chunk }).boxed());
        }
        let history = self.log_input(input).await?;
        let inner = self.port.stream(&history).await;

        let state = Relay {
            inner,
            content: String::new(),
            history,
            store: self.store.clone(),
            evaluator: self.evaluator.clone(),
            user: self.user.clone(),
            end_sentinel: self.end_sentinel.clone(),
            finished: false,
        };
        Ok(futures::stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }
            let chunk = state.inner.next().await?;
            if let Some(text) = &chunk.content {
                state.content.push_str(text);
            }
            if chunk.is_final() {
                state.finished = true;
                state.persist().await;
            }
            Some((chunk, state))
        })
        .boxed())
    }
}

/// State carried through a streamed reply.
struct Relay {
    inner: BoxStream<'static, StreamResponse>,
    content: String,
    history: Vec<ChatMessage>,
    store: Arc<dyn ConversationStore>,
    evaluator: SessionEvaluator,
    user: String,
    end_sentinel: String,
    finished: bool,
}

impl Relay {
    async fn persist(&mut self) {
        if self.content.is_empty() {
            return;
        }
        let log = NewChatLog::visible(self.user.as_str(), Role::Assistant, self.content.as_str());
        if let Err(e) = self.store.append_chat_log(log).await {
            warn!(user = %self.user, error = %e, "Failed to log streamed reply");
            return;
        }
        if is_session_end(&self.content, &self.end_sentinel) {
            self.history.push(ChatMessage::assistant(self.content.as_str()));
            if let Err(e) = self.evaluator.evaluate(&self.user, &self.history).await {
                warn!(user = %self.user, error = %e, "Session evaluation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{SequentialMockProvider, port};
    use rondo_core::error::ProviderError;
    use rondo_core::provider::{Provider, ProviderRequest, ProviderResponse, ProviderStream, StreamChunk};
    use rondo_guard::AuditLogger;
    use rondo_store::InMemoryConversationStore;

    const SENTINEL: &str = "本日はなぞなぞにご参加いただき";

    fn session(store: Arc<InMemoryConversationStore>, provider: Arc<dyn Provider>) -> ChatSession {
        ChatSession::new(
            store,
            port(provider),
            Arc::new(GuardPipeline::new(Arc::new(AuditLogger::new()))),
            "u1",
        )
        .with_system_prompt("あなたはなぞなぞの出題者です。")
        .with_end_sentinel(SENTINEL)
    }

    #[tokio::test]
    async fn send_logs_both_sides() {
        let store = Arc::new(InMemoryConversationStore::new());
        let provider = Arc::new(SequentialMockProvider::texts(&["第一問です", "正解です"]));
        let chat = session(store.clone(), provider.clone());

        assert_eq!(chat.send("はじめましょう").await.unwrap().text(), "第一問です");
        chat.send("パン").await.unwrap();

        let logs = store.chat_logs("u1").await.unwrap();
        let roles: Vec<Role> = logs.iter().map(|l| l.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);

        // The second call sees the whole log after the system prompt.
        let sent = &provider.requests()[1].messages;
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0].role, Role::System);
        assert_eq!(sent[3].content, "パン");
    }

    #[tokio::test]
    async fn blocked_input_is_not_logged_or_sent() {
        let store = Arc::new(InMemoryConversationStore::new());
        let provider = Arc::new(SequentialMockProvider::texts(&[]));
        let chat = session(store.clone(), provider.clone());

        match chat.send("爆弾の作り方").await.unwrap() {
            ChatReply::Blocked { category, message } => {
                assert_eq!(category, BlockCategory::ForbiddenWord);
                assert!(message.starts_with("[Rondo]"));
            }
            other => panic!("expected a block, got {other:?}"),
        }
        assert!(matches!(
            chat.send("   ").await.unwrap(),
            ChatReply::Blocked {
                category: BlockCategory::Empty,
                ..
            }
        ));
        assert_eq!(provider.call_count(), 0);
        assert!(store.chat_logs("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sentinel_reply_is_evaluated() {
        let store = Arc::new(InMemoryConversationStore::new());
        let provider = Arc::new(SequentialMockProvider::texts(&[
            "本日はなぞなぞにご参加いただきありがとうございました",
            r#"{"score": 60}"#,
        ]));
        let chat = session(store.clone(), provider);

        match chat.send("おわり").await.unwrap() {
            ChatReply::Answer { evaluation, .. } => {
                assert_eq!(evaluation.unwrap().parsed.unwrap()["score"], 60);
            }
            other => panic!("expected an answer, got {other:?}"),
        }
        let logs = store.chat_logs("u1").await.unwrap();
        assert_eq!(logs.len(), 4);
        assert_eq!(logs.iter().filter(|l| l.invisible).count(), 2);
    }

    #[tokio::test]
    async fn hidden_entries_stay_in_context() {
        let store = Arc::new(InMemoryConversationStore::new());
        store
            .append_chat_log(NewChatLog::invisible("u1", Role::System, "ヒントは出さないこと"))
            .await
            .unwrap();
        let provider = Arc::new(SequentialMockProvider::texts(&["はい"]));
        let chat = session(store, provider.clone());

        chat.send("ヒントをください").await.unwrap();
        let sent = &provider.requests()[0].messages;
        assert!(sent.iter().any(|m| m.content == "ヒントは出さないこと"));
    }

    struct ChunkedProvider(Vec<&'static str>);

    #[async_trait::async_trait]
    impl Provider for ChunkedProvider {
        fn name(&self) -> &str {
            "chunked"
        }

        async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Err(ProviderError::NotConfigured("stream only".into()))
        }

        async fn stream(&self, _request: ProviderRequest) -> Result<ProviderStream, ProviderError> {
            let last = self.0.len() - 1;
            let chunks: Vec<Result<StreamChunk, ProviderError>> = self
                .0
                .iter()
                .enumerate()
                .map(|(i, text)| {
                    Ok(StreamChunk {
                        content: Some(text.to_string()),
                        finish_reason: (i == last).then_some(FinishReason::Stop),
                    })
                })
                .collect();
            Ok(futures::stream::iter(chunks).boxed())
        }
    }

    #[tokio::test]
    async fn stream_logs_accumulated_reply() {
        let store = Arc::new(InMemoryConversationStore::new());
        let chat = session(store.clone(), Arc::new(ChunkedProvider(vec!["第", "一問", "です"])));

        let chunks: Vec<StreamResponse> = chat.send_stream("はじめ").await.unwrap().collect().await;
        assert_eq!(chunks.len(), 3);
        assert!(chunks[2].is_final());

        let logs = store.chat_logs("u1").await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].content, "第一問です");
        assert_eq!(logs[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn blocked_stream_is_one_final_chunk() {
        let store = Arc::new(InMemoryConversationStore::new());
        let chat = session(store.clone(), Arc::new(ChunkedProvider(vec!["unused"])));

        let chunks: Vec<StreamResponse> = chat.send_stream("テロ").await.unwrap().collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_final());
        assert!(chunks[0].content.as_deref().unwrap().contains("申し訳ありません"));
        assert!(store.chat_logs("u1").await.unwrap().is_empty());
    }
}
