//! In-memory conversation store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rondo_core::conversation::{
    ActionHistory, ActionTimeline, ChatLog, Entity, EntityId, Message, NewChatLog, RagMaterial,
};
use rondo_core::error::StoreError;
use rondo_core::guard::GuardrailConfig;
use rondo_core::store::{ConversationStore, NewEntity};
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    next_id: i64,
    entities: BTreeMap<EntityId, Entity>,
    timelines: BTreeMap<EntityId, ActionTimeline>,
    actions: BTreeMap<i64, ActionHistory>,
    messages: Vec<Message>,
    materials: BTreeMap<(String, String), RagMaterial>,
    chat_logs: Vec<ChatLog>,
    guardrails: HashMap<EntityId, GuardrailConfig>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl State {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    /// Wall-clock time, never earlier than the previous call.
    fn now(&mut self) -> DateTime<Utc> {
        let now = Utc::now().max(self.last_timestamp.unwrap_or_default());
        self.last_timestamp = Some(now);
        now
    }
}

fn action_order(a: &ActionHistory) -> (i64, EntityId, i64) {
    (a.acted_at_turn, a.entity_id, a.id)
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    state: RwLock<State>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create_entity(&self, entity: NewEntity) -> Result<Entity, StoreError> {
        let mut state = self.state.write().await;
        let id = state.id();
        let entity = Entity {
            id,
            name: entity.name,
            speed: entity.speed,
            thinking_type: entity.thinking_type,
            forbidden_keywords: entity.forbidden_keywords,
        };
        state.entities.insert(id, entity.clone());
        Ok(entity)
    }

    async fn update_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        match state.entities.get_mut(&entity.id) {
            Some(slot) => {
                *slot = entity.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("entity {}", entity.id))),
        }
    }

    async fn get_entity(&self, id: EntityId) -> Result<Option<Entity>, StoreError> {
        Ok(self.state.read().await.entities.get(&id).cloned())
    }

    async fn list_entities(&self) -> Result<Vec<Entity>, StoreError> {
        Ok(self.state.read().await.entities.values().cloned().collect())
    }

    async fn get_timeline(&self, entity_id: EntityId) -> Result<Option<ActionTimeline>, StoreError> {
        Ok(self.state.read().await.timelines.get(&entity_id).cloned())
    }

    async fn save_timeline(&self, timeline: &ActionTimeline) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.entities.contains_key(&timeline.entity_id) {
            return Err(StoreError::NotFound(format!("entity {}", timeline.entity_id)));
        }
        state.timelines.insert(timeline.entity_id, timeline.clone());
        Ok(())
    }

    async fn list_timelines(&self) -> Result<Vec<ActionTimeline>, StoreError> {
        Ok(self.state.read().await.timelines.values().cloned().collect())
    }

    async fn create_action(&self, entity_id: EntityId, acted_at_turn: i64) -> Result<ActionHistory, StoreError> {
        let mut state = self.state.write().await;
        let id = state.id();
        let action = ActionHistory {
            id,
            entity_id,
            acted_at_turn,
            done: false,
        };
        state.actions.insert(id, action.clone());
        Ok(action)
    }

    async fn get_action(&self, id: i64) -> Result<Option<ActionHistory>, StoreError> {
        Ok(self.state.read().await.actions.get(&id).cloned())
    }

    async fn next_pending_action(&self) -> Result<Option<ActionHistory>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .actions
            .values()
            .filter(|a| !a.done)
            .min_by_key(|a| action_order(a))
            .cloned())
    }

    async fn mark_action_done(&self, id: i64) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let action = state
            .actions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("action {id}")))?;
        if action.done {
            return Ok(false);
        }
        action.done = true;
        Ok(true)
    }

    async fn complete_action(
        &self,
        action_id: i64,
        content: &str,
        timeline: &ActionTimeline,
    ) -> Result<Option<Message>, StoreError> {
        let mut state = self.state.write().await;
        if !state.entities.contains_key(&timeline.entity_id) {
            return Err(StoreError::NotFound(format!("entity {}", timeline.entity_id)));
        }
        match state.actions.get(&action_id) {
            None => return Err(StoreError::NotFound(format!("action {action_id}"))),
            Some(action) if action.done => return Ok(None),
            Some(_) => {}
        }

        let id = state.id();
        let created_at = state.now();
        let message = Message {
            id,
            entity_id: timeline.entity_id,
            content: content.to_string(),
            action_id: Some(action_id),
            created_at,
        };
        state.messages.push(message.clone());
        if let Some(action) = state.actions.get_mut(&action_id) {
            action.done = true;
        }
        state.timelines.insert(timeline.entity_id, timeline.clone());
        Ok(Some(message))
    }

    async fn reset_actions_pending(&self) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let mut changed = 0;
        for a in state.actions.values_mut().filter(|a| a.done) {
            a.done = false;
            changed += 1;
        }
        Ok(changed)
    }

    async fn delete_all_actions(&self) -> Result<(), StoreError> {
        self.state.write().await.actions.clear();
        Ok(())
    }

    async fn list_actions(&self) -> Result<Vec<ActionHistory>, StoreError> {
        let mut actions: Vec<_> = self.state.read().await.actions.values().cloned().collect();
        actions.sort_by_key(action_order);
        Ok(actions)
    }

    async fn append_message(
        &self,
        entity_id: EntityId,
        content: &str,
        action_id: Option<i64>,
    ) -> Result<Message, StoreError> {
        let mut state = self.state.write().await;
        let id = state.id();
        let created_at = state.now();
        let message = Message {
            id,
            entity_id,
            content: content.to_string(),
            action_id,
            created_at,
        };
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn recent_messages(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .messages
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_all_messages(&self) -> Result<(), StoreError> {
        self.state.write().await.messages.clear();
        Ok(())
    }

    async fn upsert_material(&self, material: &RagMaterial) -> Result<(), StoreError> {
        self.state.write().await.materials.insert(
            (material.material_type.clone(), material.id.clone()),
            material.clone(),
        );
        Ok(())
    }

    async fn first_material(&self, material_type: &str) -> Result<Option<RagMaterial>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .materials
            .values()
            .find(|m| m.material_type == material_type)
            .cloned())
    }

    async fn count_materials(&self, material_type: &str) -> Result<usize, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .materials
            .values()
            .filter(|m| m.material_type == material_type)
            .count())
    }

    async fn append_chat_log(&self, log: NewChatLog) -> Result<ChatLog, StoreError> {
        let mut state = self.state.write().await;
        let id = state.id();
        let created_at = state.now();
        let entry = ChatLog {
            id,
            user: log.user,
            role: log.role,
            content: log.content,
            file_ref: log.file_ref,
            invisible: log.invisible,
            created_at,
        };
        state.chat_logs.push(entry.clone());
        Ok(entry)
    }

    async fn chat_logs(&self, user: &str) -> Result<Vec<ChatLog>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .chat_logs
            .iter()
            .filter(|l| l.user == user)
            .cloned()
            .collect())
    }

    async fn get_guardrail_config(&self, entity_id: EntityId) -> Result<Option<GuardrailConfig>, StoreError> {
        Ok(self.state.read().await.guardrails.get(&entity_id).cloned())
    }

    async fn save_guardrail_config(&self, config: &GuardrailConfig) -> Result<(), StoreError> {
        let entity_id = config
            .entity_id
            .ok_or_else(|| StoreError::Storage("guardrail config without entity_id".into()))?;
        self.state.write().await.guardrails.insert(entity_id, config.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conformance() {
        super::super::tests::exercise(&InMemoryConversationStore::new()).await;
    }
}
