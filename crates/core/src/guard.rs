//! Guard signals and per-entity guardrail configuration.
//!
//! Every guard in the pipeline reports a [`SemanticGuardResult`]: a traffic
//! light ([`Signal`]) with an optional machine-readable reason and a
//! user-facing detail text.

use serde::{Deserialize, Serialize};

use crate::conversation::{Entity, EntityId};

/// Thinking-type suffix that turns on strict (fail-closed) guardrails.
pub const STRICT_SUFFIX: &str = "_strict";

/// Default maximum input length in characters.
pub const DEFAULT_MAX_INPUT_LENGTH: usize = 500;

/// Seed list used when an entity has no stored guardrail config.
pub const DEFAULT_FORBIDDEN_WORDS: &[&str] = &["殺人", "自殺", "爆弾", "麻薬", "テロ"];

/// Traffic-light guard signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    /// Allowed
    Green,
    /// Caution (advisory only)
    Yellow,
    /// Blocked
    Red,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Signal::Green => "GREEN",
            Signal::Yellow => "YELLOW",
            Signal::Red => "RED",
        })
    }
}

/// Machine-readable reason attached to a guard result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardReason {
    RagHit,
    RagMiss,
    ModerationFlagged,
    ModerationError,
    ForbiddenWordDetected,
    SemanticError,
}

impl GuardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RagHit => "RAG_HIT",
            Self::RagMiss => "RAG_MISS",
            Self::ModerationFlagged => "MODERATION_FLAGGED",
            Self::ModerationError => "MODERATION_ERROR",
            Self::ForbiddenWordDetected => "FORBIDDEN_WORD_DETECTED",
            Self::SemanticError => "SEMANTIC_ERROR",
        }
    }
}

impl std::fmt::Display for GuardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq<&str> for GuardReason {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// Result of one guard evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticGuardResult {
    pub signal: Signal,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<GuardReason>,

    /// User-facing text; canonical for block messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SemanticGuardResult {
    pub fn green() -> Self {
        Self {
            signal: Signal::Green,
            reason: None,
            detail: None,
        }
    }

    pub fn with_reason(signal: Signal, reason: GuardReason) -> Self {
        Self {
            signal,
            reason: Some(reason),
            detail: None,
        }
    }

    pub fn red(reason: GuardReason, detail: impl Into<String>) -> Self {
        Self {
            signal: Signal::Red,
            reason: Some(reason),
            detail: Some(detail.into()),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn is_red(&self) -> bool {
        self.signal == Signal::Red
    }
}

/// Guardrail settings for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailConfig {
    #[serde(default)]
    pub entity_id: Option<EntityId>,

    /// Case-insensitive substrings that block input.
    #[serde(default)]
    pub forbidden_words: Vec<String>,

    /// Maximum input length in characters.
    #[serde(default = "default_max_input_length")]
    pub max_input_length: usize,

    /// Call the external moderation classifier.
    #[serde(default = "default_true")]
    pub use_external_moderation: bool,

    /// Fail closed when a guard call errors.
    #[serde(default)]
    pub strict_mode: bool,
}

fn default_max_input_length() -> usize {
    DEFAULT_MAX_INPUT_LENGTH
}

fn default_true() -> bool {
    true
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            entity_id: None,
            forbidden_words: DEFAULT_FORBIDDEN_WORDS.iter().map(|w| w.to_string()).collect(),
            max_input_length: DEFAULT_MAX_INPUT_LENGTH,
            use_external_moderation: true,
            strict_mode: false,
        }
    }
}

impl GuardrailConfig {
    /// The config used when none is stored for `entity`: the seed list plus
    /// the entity's own keywords, strict mode from the `_strict` suffix.
    pub fn default_for(entity: &Entity) -> Self {
        let mut config = Self {
            entity_id: Some(entity.id),
            strict_mode: entity.is_strict(),
            ..Self::default()
        };
        config.merge_keywords(&entity.forbidden_keywords);
        config
    }

    /// Add keywords that are not present yet.
    pub fn merge_keywords(&mut self, keywords: &[String]) {
        for word in keywords {
            if !self.forbidden_words.iter().any(|w| w == word) {
                self.forbidden_words.push(word.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Signal::Yellow).unwrap(), "\"YELLOW\"");
    }

    #[test]
    fn reason_compares_with_wire_string() {
        let result = SemanticGuardResult::with_reason(Signal::Green, GuardReason::RagHit);
        assert_eq!(result.reason.unwrap(), "RAG_HIT");
        assert_eq!(
            serde_json::to_string(&GuardReason::ForbiddenWordDetected).unwrap(),
            "\"FORBIDDEN_WORD_DETECTED\""
        );
    }

    #[test]
    fn default_config_for_strict_entity() {
        let mut entity = Entity::new(7, "Ren", 5.0, "declining_birth_rate_based_strict");
        entity.forbidden_keywords = vec!["競馬".into(), "殺人".into()];
        let config = GuardrailConfig::default_for(&entity);
        assert!(config.strict_mode);
        assert!(config.use_external_moderation);
        assert_eq!(config.max_input_length, 500);
        assert_eq!(config.entity_id, Some(7));
        assert_eq!(config.forbidden_words.iter().filter(|w| *w == "殺人").count(), 1);
        assert!(config.forbidden_words.contains(&"競馬".to_string()));
    }

    #[test]
    fn red_result_carries_detail() {
        let red = SemanticGuardResult::red(GuardReason::ModerationFlagged, "blocked");
        assert!(red.is_red());
        assert_eq!(red.detail.as_deref(), Some("blocked"));
    }
}
