//! Relational conversation store trait.
//!
//! Holds entities, their timelines and action histories, messages, RAG
//! materials, chat logs and guardrail configs for one conversation.
//! Implementations live in `rondo-store` (in-memory and SQLite).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::conversation::{
    ActionHistory, ActionTimeline, ChatLog, Entity, EntityId, Message, NewChatLog, RagMaterial,
};
use crate::error::StoreError;
use crate::guard::GuardrailConfig;

/// An entity that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntity {
    pub name: String,
    pub speed: f64,
    pub thinking_type: String,
    #[serde(default)]
    pub forbidden_keywords: Vec<String>,
}

impl NewEntity {
    pub fn new(name: impl Into<String>, speed: f64, thinking_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            speed,
            thinking_type: thinking_type.into(),
            forbidden_keywords: Vec::new(),
        }
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Backend name (e.g. "sqlite", "in_memory").
    fn name(&self) -> &str;

    // --- Entities ---

    async fn create_entity(&self, entity: NewEntity) -> Result<Entity, StoreError>;

    async fn update_entity(&self, entity: &Entity) -> Result<(), StoreError>;

    async fn get_entity(&self, id: EntityId) -> Result<Option<Entity>, StoreError>;

    /// All entities ordered by id.
    async fn list_entities(&self) -> Result<Vec<Entity>, StoreError>;

    // --- Timelines ---

    async fn get_timeline(&self, entity_id: EntityId) -> Result<Option<ActionTimeline>, StoreError>;

    /// Insert or replace the timeline of `timeline.entity_id`.
    async fn save_timeline(&self, timeline: &ActionTimeline) -> Result<(), StoreError>;

    /// All timelines ordered by entity id.
    async fn list_timelines(&self) -> Result<Vec<ActionTimeline>, StoreError>;

    // --- Action histories ---

    async fn create_action(&self, entity_id: EntityId, acted_at_turn: i64) -> Result<ActionHistory, StoreError>;

    async fn get_action(&self, id: i64) -> Result<Option<ActionHistory>, StoreError>;

    /// The first pending action by `(acted_at_turn, entity_id, id)`.
    async fn next_pending_action(&self) -> Result<Option<ActionHistory>, StoreError>;

    /// Mark an action done. Returns `false` when it was already done.
    async fn mark_action_done(&self, id: i64) -> Result<bool, StoreError>;

    /// Record a taken turn in one step: append `content` under the action as
    /// a message of `timeline.entity_id`, mark the action done, and save the
    /// advanced `timeline`. Either all three writes land or none do.
    /// Returns `None`, writing nothing, when the action was already done.
    async fn complete_action(
        &self,
        action_id: i64,
        content: &str,
        timeline: &ActionTimeline,
    ) -> Result<Option<Message>, StoreError>;

    /// Set every action back to pending; returns how many changed.
    async fn reset_actions_pending(&self) -> Result<usize, StoreError>;

    async fn delete_all_actions(&self) -> Result<(), StoreError>;

    /// All actions ordered by `(acted_at_turn, entity_id, id)`.
    async fn list_actions(&self) -> Result<Vec<ActionHistory>, StoreError>;

    // --- Messages ---

    async fn append_message(
        &self,
        entity_id: EntityId,
        content: &str,
        action_id: Option<i64>,
    ) -> Result<Message, StoreError>;

    /// Up to `limit` messages, newest first.
    async fn recent_messages(&self, limit: usize) -> Result<Vec<Message>, StoreError>;

    async fn delete_all_messages(&self) -> Result<(), StoreError>;

    // --- RAG materials ---

    /// Insert or replace by `(material_type, id)`.
    async fn upsert_material(&self, material: &RagMaterial) -> Result<(), StoreError>;

    /// The first material (by id) of a type.
    async fn first_material(&self, material_type: &str) -> Result<Option<RagMaterial>, StoreError>;

    async fn count_materials(&self, material_type: &str) -> Result<usize, StoreError>;

    // --- Chat logs ---

    async fn append_chat_log(&self, log: NewChatLog) -> Result<ChatLog, StoreError>;

    /// A user's chat log in chronological order (invisible entries included).
    async fn chat_logs(&self, user: &str) -> Result<Vec<ChatLog>, StoreError>;

    // --- Guardrail configs ---

    async fn get_guardrail_config(&self, entity_id: EntityId) -> Result<Option<GuardrailConfig>, StoreError>;

    /// Insert or replace; `config.entity_id` must be set.
    async fn save_guardrail_config(&self, config: &GuardrailConfig) -> Result<(), StoreError>;
}
