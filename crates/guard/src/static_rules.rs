//! Static input rules: forbidden substrings, maximum length, non-empty.

use rondo_core::guard::GuardrailConfig;
use serde::{Deserialize, Serialize};

pub const FORBIDDEN_MESSAGE: &str = "申し訳ありませんが、その内容にはお答えできません";
pub const TOO_LONG_MESSAGE: &str = "メッセージが長すぎます";
pub const EMPTY_MESSAGE: &str = "メッセージが空です";

/// Why an input was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockCategory {
    ForbiddenWord,
    TooLong,
    Empty,
    Moderation,
    SemanticForbidden,
}

impl BlockCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ForbiddenWord => "forbidden_word",
            Self::TooLong => "too_long",
            Self::Empty => "empty",
            Self::Moderation => "moderation",
            Self::SemanticForbidden => "semantic_forbidden",
        }
    }
}

impl std::fmt::Display for BlockCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the static rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailCheck {
    pub blocked: bool,
    pub message: Option<String>,
    pub category: Option<BlockCategory>,
    /// The forbidden word that matched, for auditing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched: Option<String>,
}

impl GuardrailCheck {
    pub fn pass() -> Self {
        Self {
            blocked: false,
            message: None,
            category: None,
            matched: None,
        }
    }

    pub fn block(category: BlockCategory, message: String) -> Self {
        Self {
            blocked: true,
            message: Some(message),
            category: Some(category),
            matched: None,
        }
    }
}

/// Apply the static rules in order: forbidden substring, length, emptiness.
///
/// Substring matching is case-insensitive and length is counted in
/// characters. Block messages name the entity.
pub fn check_input(input: &str, entity_name: &str, config: &GuardrailConfig) -> GuardrailCheck {
    let lowered = input.to_lowercase();
    if let Some(word) = config
        .forbidden_words
        .iter()
        .filter(|w| !w.is_empty())
        .find(|w| lowered.contains(&w.to_lowercase()))
    {
        let mut check = GuardrailCheck::block(
            BlockCategory::ForbiddenWord,
            format!("[{entity_name}] {FORBIDDEN_MESSAGE}"),
        );
        check.matched = Some(word.clone());
        return check;
    }

    let length = input.chars().count();
    if length > config.max_input_length {
        return GuardrailCheck::block(
            BlockCategory::TooLong,
            format!(
                "[{entity_name}] {TOO_LONG_MESSAGE}（{length}文字 / 最大{}文字）",
                config.max_input_length
            ),
        );
    }

    if input.trim().is_empty() {
        return GuardrailCheck::block(BlockCategory::Empty, format!("[{entity_name}] {EMPTY_MESSAGE}"));
    }

    GuardrailCheck::pass()
}
