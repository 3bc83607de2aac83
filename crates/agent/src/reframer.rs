//! Context reframing: rewrite recent dialogue through an entity's lens.

use std::collections::HashMap;
use std::sync::Arc;

use rondo_core::conversation::Entity;
use rondo_providers::CompletionPort;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const KEYWORD_PROMPT: &str = "次の資料から重要なキーワードを10〜15個抽出し、カンマ区切りで出力してください。キーワード以外は出力しないでください。";

/// Cached keyword lists beyond this many RAG texts are dropped wholesale.
const KEYWORD_CACHE_LIMIT: usize = 256;

pub struct Reframer {
    port: Arc<CompletionPort>,
    keywords: RwLock<HashMap<String, String>>,
}

impl Reframer {
    pub fn new(port: Arc<CompletionPort>) -> Self {
        Self {
            port,
            keywords: RwLock::new(HashMap::new()),
        }
    }

    pub fn system_prompt(display_name: &str) -> String {
        format!(
            "あなたは{display_name}の専門家です。以下の会話を{display_name}の視点から捉え直し、論点を簡潔にまとめてください。"
        )
    }

    /// 10–15 comma-separated keywords for `rag_text`, cached per text.
    pub async fn extract_keywords(&self, rag_text: &str) -> rondo_core::Result<String> {
        if let Some(cached) = self.keywords.read().await.get(rag_text) {
            return Ok(cached.clone());
        }

        let keywords = self.port.generate(KEYWORD_PROMPT, rag_text).await?;
        let keywords = normalize_keywords(&keywords);

        let mut cache = self.keywords.write().await;
        if cache.len() >= KEYWORD_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(rag_text.to_string(), keywords.clone());
        Ok(keywords)
    }

    /// Reframe `context` for `entity`. Never fails: any completion error or an
    /// empty answer yields `context` unchanged.
    pub async fn reframe(&self, context: &str, entity: &Entity, display_name: &str, rag_source: Option<&str>) -> String {
        match self.try_reframe(context, display_name, rag_source).await {
            Ok(reframed) if !reframed.trim().is_empty() => {
                debug!(entity = %entity.name, "Context reframed");
                reframed
            }
            Ok(_) => context.to_string(),
            Err(e) => {
                warn!(entity = %entity.name, error = %e, "Reframing failed, using original context");
                context.to_string()
            }
        }
    }

    async fn try_reframe(&self, context: &str, display_name: &str, rag_source: Option<&str>) -> rondo_core::Result<String> {
        let keywords = match rag_source.filter(|s| !s.trim().is_empty()) {
            Some(text) => Some(self.extract_keywords(text).await?),
            None => None,
        };

        let user = match keywords {
            Some(k) if !k.is_empty() => format!("キーワード: {k}\n\n会話:\n{context}"),
            _ => format!("会話:\n{context}"),
        };
        self.port.generate(&Self::system_prompt(display_name), &user).await
    }
}

/// Trim entries, drop empties, accept full-width commas and newlines.
fn normalize_keywords(raw: &str) -> String {
    raw.split([',', '、', '，', '\n'])
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}
