//! Conversation domain types.
//!
//! Entities take turns speaking. Each entity owns one [`ActionTimeline`]
//! (its virtual clock), any number of [`ActionHistory`] rows (planned or
//! completed turns) and the [`Message`]s it produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Role;

/// Primary key of an entity.
pub type EntityId = i64;

/// An autonomous participant in a multi-agent conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,

    pub name: String,

    /// Turn frequency; strictly positive.
    pub speed: f64,

    /// Selects a thinking engine (e.g. `cloud_act_based`). A `_strict`
    /// suffix turns on strict guardrail mode.
    pub thinking_type: String,

    /// Extra forbidden keywords merged into the entity's guardrail config.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbidden_keywords: Vec<String>,
}

impl Entity {
    pub fn new(id: EntityId, name: impl Into<String>, speed: f64, thinking_type: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            speed,
            thinking_type: thinking_type.into(),
            forbidden_keywords: Vec::new(),
        }
    }

    /// Whether the thinking type requests strict guardrails.
    pub fn is_strict(&self) -> bool {
        self.thinking_type.ends_with(crate::guard::STRICT_SUFFIX)
    }
}

/// Per-entity virtual clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTimeline {
    pub entity_id: EntityId,

    /// Lower means sooner; never negative.
    pub next_turn: f64,

    /// Entities that cannot act are skipped by the scheduler.
    pub can_act: bool,
}

/// A planned or completed turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionHistory {
    pub id: i64,
    pub entity_id: EntityId,

    /// Step index assigned when the action was materialized.
    pub acted_at_turn: i64,

    pub done: bool,
}

/// Something an entity said.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub entity_id: EntityId,
    pub content: String,

    /// The action this message was produced under, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<i64>,

    pub created_at: DateTime<Utc>,
}

/// A persisted knowledge text indexed by `material_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagMaterial {
    pub id: String,
    pub material_type: String,
    pub source_text: String,

    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl RagMaterial {
    pub fn new(id: impl Into<String>, material_type: impl Into<String>, source_text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            material_type: material_type.into(),
            source_text: source_text.into(),
            metadata: serde_json::Map::new(),
            embedding: None,
        }
    }
}

/// One entry of a user's chat history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatLog {
    pub id: i64,
    pub user: String,
    pub role: Role,
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_ref: Option<String>,

    /// Included in LLM context but hidden from UI.
    #[serde(default)]
    pub invisible: bool,

    pub created_at: DateTime<Utc>,
}

/// A chat log entry that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChatLog {
    pub user: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub file_ref: Option<String>,
    #[serde(default)]
    pub invisible: bool,
}

impl NewChatLog {
    pub fn visible(user: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            role,
            content: content.into(),
            file_ref: None,
            invisible: false,
        }
    }

    pub fn invisible(user: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            invisible: true,
            ..Self::visible(user, role, content)
        }
    }
}
