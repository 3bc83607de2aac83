//! Thinking engines: what each `thinking_type` can talk about.
//!
//! An engine is data, not code: a display name for prompts, the RAG material
//! that backs it, and the keywords an input must hit. Built-ins cover the
//! shipped thinking types; `[[engines]]` entries in the config override or
//! extend them. Unknown tags resolve to an open engine that always responds.

use std::collections::HashMap;
use std::sync::Arc;

use rondo_config::EngineConfig;
use rondo_core::conversation::Entity;
use rondo_core::guard::STRICT_SUFFIX;
use rondo_core::store::ConversationStore;
use tracing::debug;

/// Returned by `get_content` when the engine has no material.
pub const CONTENT_NOT_FOUND: &str = "該当する資料が見つかりませんでした。";

/// Characters of material quoted in a RAG response.
const EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Material must exist and the input must contain a keyword.
    KeywordMatch,
    /// Responds to anything.
    AlwaysOpen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThinkingEngine {
    pub tag: String,
    pub display_name: String,
    pub material_type: Option<String>,
    pub keywords: Vec<String>,
    pub capability: Capability,
}

impl ThinkingEngine {
    pub fn keyword_match(
        tag: impl Into<String>,
        display_name: impl Into<String>,
        material_type: impl Into<String>,
        keywords: &[&str],
    ) -> Self {
        Self {
            tag: tag.into(),
            display_name: display_name.into(),
            material_type: Some(material_type.into()),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            capability: Capability::KeywordMatch,
        }
    }

    pub fn open(tag: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            display_name: display_name.into(),
            material_type: None,
            keywords: Vec::new(),
            capability: Capability::AlwaysOpen,
        }
    }

    fn from_config(config: &EngineConfig) -> Self {
        Self {
            tag: config.thinking_type.clone(),
            display_name: config
                .display_name
                .clone()
                .unwrap_or_else(|| config.thinking_type.clone()),
            material_type: config.material_type.clone(),
            keywords: config.keywords.clone(),
            capability: if config.always_respond {
                Capability::AlwaysOpen
            } else {
                Capability::KeywordMatch
            },
        }
    }

    /// Case-insensitive keyword hit.
    pub fn matches_keywords(&self, input: &str) -> bool {
        let input = input.to_lowercase();
        self.keywords
            .iter()
            .any(|k| !k.is_empty() && input.contains(&k.to_lowercase()))
    }
}

/// The shipped engines.
pub fn builtin_engines() -> Vec<ThinkingEngine> {
    vec![
        ThinkingEngine::keyword_match(
            "cloud_act_based",
            "クラウド法",
            "cloud_act",
            &["法律", "law", "cloud", "act", "クラウド", "法案"],
        ),
        ThinkingEngine::keyword_match(
            "declining_birth_rate_based",
            "少子化対策",
            "declining_birth_rate",
            &["少子化", "出生率", "子育て", "育児", "結婚", "出産", "人口減少"],
        ),
        ThinkingEngine::open("google_maps_based", "地図・位置情報"),
    ]
}

/// Strip the strict suffix: `cloud_act_based_strict` → `cloud_act_based`.
pub fn base_thinking_type(thinking_type: &str) -> &str {
    thinking_type.strip_suffix(STRICT_SUFFIX).unwrap_or(thinking_type)
}

/// Resolves thinking types to engines and answers capability questions
/// against the material store.
pub struct EngineRegistry {
    engines: HashMap<String, ThinkingEngine>,
    store: Arc<dyn ConversationStore>,
}

impl EngineRegistry {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        let engines = builtin_engines()
            .into_iter()
            .map(|e| (e.tag.clone(), e))
            .collect();
        Self { engines, store }
    }

    /// Built-ins overridden or extended by config entries.
    pub fn from_config(store: Arc<dyn ConversationStore>, configs: &[EngineConfig]) -> Self {
        let mut registry = Self::new(store);
        for config in configs {
            registry.register(ThinkingEngine::from_config(config));
        }
        registry
    }

    pub fn register(&mut self, engine: ThinkingEngine) {
        debug!(tag = %engine.tag, "Registering thinking engine");
        self.engines.insert(engine.tag.clone(), engine);
    }

    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.engines.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// The engine for `thinking_type`, or an open engine named after it.
    pub fn resolve(&self, thinking_type: &str) -> ThinkingEngine {
        let base = base_thinking_type(thinking_type);
        self.engines
            .get(base)
            .cloned()
            .unwrap_or_else(|| ThinkingEngine::open(base, base))
    }

    pub fn display_name(&self, thinking_type: &str) -> String {
        self.resolve(thinking_type).display_name
    }

    async fn has_material(&self, engine: &ThinkingEngine) -> rondo_core::Result<bool> {
        match &engine.material_type {
            Some(material_type) => Ok(self.store.count_materials(material_type).await? > 0),
            None => Ok(true),
        }
    }

    /// Whether `entity` can speak to `input`.
    pub async fn can_respond(&self, input: &str, entity: &Entity) -> rondo_core::Result<bool> {
        let engine = self.resolve(&entity.thinking_type);
        match engine.capability {
            Capability::AlwaysOpen => Ok(true),
            Capability::KeywordMatch => Ok(self.has_material(&engine).await? && engine.matches_keywords(input)),
        }
    }

    /// The first stored material text for the engine, or [`CONTENT_NOT_FOUND`].
    pub async fn get_content(&self, thinking_type: &str) -> rondo_core::Result<String> {
        let engine = self.resolve(thinking_type);
        let Some(material_type) = &engine.material_type else {
            return Ok(CONTENT_NOT_FOUND.to_string());
        };
        Ok(self
            .store
            .first_material(material_type)
            .await?
            .map(|m| m.source_text)
            .unwrap_or_else(|| CONTENT_NOT_FOUND.to_string()))
    }

    /// An answer composed from the engine's material, without an LLM.
    pub async fn generate_rag_response(&self, entity: &Entity, input: &str) -> rondo_core::Result<Option<String>> {
        if !self.can_respond(input, entity).await? {
            return Ok(None);
        }
        let engine = self.resolve(&entity.thinking_type);
        let content = self.get_content(&entity.thinking_type).await?;
        let excerpt: String = content.chars().take(EXCERPT_CHARS).collect();
        let source = engine.material_type.as_deref().unwrap_or(&engine.tag);

        Ok(Some(format!(
            "{}です。{}の観点からお答えします。\n[{source}] の資料によると: {excerpt}",
            entity.name, engine.display_name
        )))
    }
}
