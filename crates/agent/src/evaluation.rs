//! End-of-session evaluation.
//!
//! When a reply contains the session-end sentinel, one extra completion asks
//! for a structured JSON evaluation of the transcript. Both the prompt and the
//! answer are stored as invisible chat log entries: they stay in the LLM
//! context but are hidden from the UI.

use std::sync::Arc;

use rondo_core::conversation::NewChatLog;
use rondo_core::message::{ChatMessage, Role};
use rondo_core::store::ConversationStore;
use rondo_providers::CompletionPort;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const EVALUATION_PROMPT: &str = r#"これまでのなぞなぞセッションを評価してください。次のJSON形式のみで出力してください。
{"score": 0から100の整数, "summary": "全体の講評", "strengths": ["良かった点"], "improvements": ["改善点"]}"#;

/// Whether `content` ends the session.
pub fn is_session_end(content: &str, sentinel: &str) -> bool {
    !sentinel.is_empty() && content.contains(sentinel)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// The completion text as returned.
    pub raw: String,
    /// Parsed JSON, when the completion was valid JSON (fences allowed).
    pub parsed: Option<serde_json::Value>,
}

/// Parse an evaluation, tolerating a Markdown code fence around the JSON.
pub fn parse_evaluation(raw: &str) -> Evaluation {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    Evaluation {
        raw: raw.to_string(),
        parsed: serde_json::from_str(body).ok(),
    }
}

#[derive(Clone)]
pub struct SessionEvaluator {
    port: Arc<CompletionPort>,
    store: Arc<dyn ConversationStore>,
}

impl SessionEvaluator {
    pub fn new(port: Arc<CompletionPort>, store: Arc<dyn ConversationStore>) -> Self {
        Self { port, store }
    }

    /// Evaluate `transcript` and store the exchange under `user` as
    /// invisible entries.
    pub async fn evaluate(&self, user: &str, transcript: &[ChatMessage]) -> rondo_core::Result<Evaluation> {
        let mut history = transcript.to_vec();
        history.push(ChatMessage::user(EVALUATION_PROMPT));

        self.store
            .append_chat_log(NewChatLog::invisible(user, Role::User, EVALUATION_PROMPT))
            .await?;
        let result = self.port.complete(&history).await?;
        self.store
            .append_chat_log(NewChatLog::invisible(user, Role::Assistant, result.content.as_str()))
            .await?;

        let evaluation = parse_evaluation(&result.content);
        if evaluation.parsed.is_none() {
            warn!(user, "Session evaluation was not valid JSON");
        } else {
            info!(user, "Session evaluated");
        }
        Ok(evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{SequentialMockProvider, port};
    use rondo_store::InMemoryConversationStore;

    #[test]
    fn sentinel_detection() {
        let sentinel = "本日はなぞなぞにご参加いただき";
        assert!(is_session_end("本日はなぞなぞにご参加いただきありがとうございました", sentinel));
        assert!(!is_session_end("次の問題です", sentinel));
        assert!(!is_session_end("anything", ""));
    }

    #[test]
    fn parses_fenced_json() {
        let eval = parse_evaluation("```json\n{\"score\": 80}\n```");
        assert_eq!(eval.parsed.unwrap()["score"], 80);
        assert!(parse_evaluation("not json").parsed.is_none());
    }

    #[tokio::test]
    async fn stores_prompt_and_result_invisibly() {
        let provider = Arc::new(SequentialMockProvider::texts(&[r#"{"score": 90, "summary": "good"}"#]));
        let store = Arc::new(InMemoryConversationStore::new());
        let evaluator = SessionEvaluator::new(port(provider.clone()), store.clone());

        let transcript = vec![ChatMessage::assistant("本日はなぞなぞにご参加いただきありがとうございました")];
        let eval = evaluator.evaluate("u1", &transcript).await.unwrap();
        assert_eq!(eval.parsed.unwrap()["score"], 90);

        let logs = store.chat_logs("u1").await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.invisible));
        assert_eq!(logs[0].content, EVALUATION_PROMPT);

        let sent = &provider.requests()[0].messages;
        assert_eq!(sent.last().unwrap().content, EVALUATION_PROMPT);
    }
}
