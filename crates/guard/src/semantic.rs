//! Semantic guardrail over two vector collections.
//!
//! `knowledge` decides whether an input is covered by curated material (a RAG
//! hit is GREEN). On a miss, a general-purpose LLM may answer instead, and its
//! answer is checked for semantic proximity to the `forbidden_words`
//! collection. A hit raises [`ForbiddenWordDetected`].

use async_trait::async_trait;
use rondo_core::error::{ForbiddenWordDetected, StoreError};
use rondo_core::guard::{GuardReason, SemanticGuardResult, Signal};
use rondo_core::rag::Document;
use rondo_providers::{CompletionPort, RetryPolicy};
use rondo_store::{FORBIDDEN_WORDS_COLLECTION, RagCollection};
use thiserror::Error;
use tracing::{debug, info};

/// Cosine distance under which generated text counts as a forbidden-word hit.
pub const DEFAULT_FORBIDDEN_THRESHOLD: f32 = 0.35;

const GENERAL_SYSTEM_PROMPT: &str = "あなたは親切なアシスタントです。質問に簡潔に答えてください。";

/// A general-purpose LLM consulted on a RAG miss.
#[async_trait]
pub trait GeneralLlm: Send + Sync {
    async fn answer(&self, prompt: &str) -> rondo_core::Result<String>;
}

#[async_trait]
impl GeneralLlm for CompletionPort {
    async fn answer(&self, prompt: &str) -> rondo_core::Result<String> {
        CompletionPort::generate(self, GENERAL_SYSTEM_PROMPT, prompt).await
    }
}

#[derive(Debug, Error)]
pub enum SemanticGuardError {
    #[error(transparent)]
    ForbiddenWord(#[from] ForbiddenWordDetected),

    #[error("Semantic guard store error: {0}")]
    Store(#[from] StoreError),

    #[error("General LLM failed: {0}")]
    Provider(rondo_core::Error),
}

impl From<SemanticGuardError> for rondo_core::Error {
    fn from(e: SemanticGuardError) -> Self {
        match e {
            SemanticGuardError::ForbiddenWord(hit) => hit.into(),
            SemanticGuardError::Store(e) => e.into(),
            SemanticGuardError::Provider(e) => e,
        }
    }
}

pub fn forbidden_word_detail(word: &str) -> String {
    format!("禁止ワード「{word}」に意味的にヒットしました")
}

pub struct SemanticGuard {
    knowledge: RagCollection,
    forbidden: RagCollection,
    threshold: f32,
    rag_hit_max_distance: Option<f32>,
    retry: RetryPolicy,
}

impl SemanticGuard {
    /// Guard over `knowledge` and its `forbidden_words` sibling collection.
    pub fn new(knowledge: RagCollection) -> Self {
        let forbidden = knowledge.sibling(FORBIDDEN_WORDS_COLLECTION);
        Self {
            knowledge,
            forbidden,
            threshold: DEFAULT_FORBIDDEN_THRESHOLD,
            rag_hit_max_distance: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Require the nearest knowledge document to be at most this far away.
    pub fn with_rag_hit_max_distance(mut self, max_distance: Option<f32>) -> Self {
        self.rag_hit_max_distance = max_distance;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn knowledge(&self) -> &RagCollection {
        &self.knowledge
    }

    pub fn forbidden(&self) -> &RagCollection {
        &self.forbidden
    }

    /// Replace the forbidden-word collection with one document per word.
    ///
    /// Concurrent checks keep matching the previous list until the new one
    /// is in place.
    pub async fn setup_forbidden_words(&self, words: &[String]) -> Result<usize, StoreError> {
        let documents: Vec<Document> = words
            .iter()
            .enumerate()
            .map(|(i, word)| Document::new(format!("word_{i}"), word.as_str()).with_metadata("word", word.as_str()))
            .collect();
        let count = documents.len();
        self.forbidden.replace(documents).await?;
        info!(count, "Forbidden words loaded");
        Ok(count)
    }

    /// Whether `text` is covered by the knowledge collection.
    pub async fn check_rag_hit(&self, text: &str) -> Result<bool, StoreError> {
        let hits = self
            .retry
            .run("knowledge query", || self.knowledge.query(text, 1, None))
            .await?;
        let hit = match (hits.first(), self.rag_hit_max_distance) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(top), Some(max)) => top.distance <= max,
        };
        debug!(hit, nearest = hits.first().map(|h| h.distance), "RAG hit check");
        Ok(hit)
    }

    /// Fail when the nearest forbidden word is closer than the threshold.
    pub async fn check_forbidden_words(&self, text: &str) -> Result<(), SemanticGuardError> {
        let hits = self
            .retry
            .run("forbidden-word query", || self.forbidden.query(text, 1, None))
            .await?;
        let Some(top) = hits.into_iter().next() else {
            return Ok(());
        };
        if top.distance >= self.threshold {
            return Ok(());
        }

        let word = top
            .document
            .metadata
            .get("word")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or(top.document.page_content);
        info!(%word, distance = top.distance, "Forbidden word hit");
        Err(ForbiddenWordDetected {
            result: SemanticGuardResult::red(GuardReason::ForbiddenWordDetected, forbidden_word_detail(&word)),
            word,
            distance: top.distance,
        }
        .into())
    }

    /// RAG hit → GREEN; otherwise YELLOW after an optional general-LLM pass
    /// whose answer must not land near a forbidden word.
    pub async fn evaluate(
        &self,
        user_input: &str,
        general_llm: Option<&dyn GeneralLlm>,
    ) -> Result<SemanticGuardResult, SemanticGuardError> {
        if self.check_rag_hit(user_input).await? {
            return Ok(SemanticGuardResult::with_reason(Signal::Green, GuardReason::RagHit));
        }
        let miss = SemanticGuardResult::with_reason(Signal::Yellow, GuardReason::RagMiss);
        let Some(llm) = general_llm else {
            return Ok(miss);
        };

        let answer = llm.answer(user_input).await.map_err(SemanticGuardError::Provider)?;
        self.check_forbidden_words(&answer).await?;
        Ok(miss)
    }
}
