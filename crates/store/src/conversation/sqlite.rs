//! SQLite conversation store.
//!
//! Tables: `entities`, `action_timelines`, `action_histories`, `messages`,
//! `rag_materials`, `chat_logs`, `guardrail_configs`. List-valued columns are
//! stored as JSON text, timestamps as RFC 3339.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rondo_core::conversation::{
    ActionHistory, ActionTimeline, ChatLog, Entity, EntityId, Message, NewChatLog, RagMaterial,
};
use rondo_core::error::StoreError;
use rondo_core::guard::GuardrailConfig;
use rondo_core::store::{ConversationStore, NewEntity};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::sqlite::open_pool;
use crate::vector;

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "entities table",
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            name                TEXT NOT NULL,
            speed               REAL NOT NULL,
            thinking_type       TEXT NOT NULL,
            forbidden_keywords  TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    ),
    (
        "action_timelines table",
        r#"
        CREATE TABLE IF NOT EXISTS action_timelines (
            entity_id  INTEGER PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
            next_turn  REAL NOT NULL,
            can_act    INTEGER NOT NULL DEFAULT 1
        )
        "#,
    ),
    (
        "action_histories table",
        r#"
        CREATE TABLE IF NOT EXISTS action_histories (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id      INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
            acted_at_turn  INTEGER NOT NULL,
            done           INTEGER NOT NULL DEFAULT 0
        )
        "#,
    ),
    (
        "action order index",
        "CREATE INDEX IF NOT EXISTS idx_actions_order ON action_histories(done, acted_at_turn, entity_id, id)",
    ),
    (
        "messages table",
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id   INTEGER NOT NULL,
            content     TEXT NOT NULL,
            action_id   INTEGER,
            created_at  TEXT NOT NULL
        )
        "#,
    ),
    (
        "rag_materials table",
        r#"
        CREATE TABLE IF NOT EXISTS rag_materials (
            material_type  TEXT NOT NULL,
            id             TEXT NOT NULL,
            source_text    TEXT NOT NULL,
            metadata       TEXT NOT NULL DEFAULT '{}',
            embedding      BLOB,
            PRIMARY KEY (material_type, id)
        )
        "#,
    ),
    (
        "chat_logs table",
        r#"
        CREATE TABLE IF NOT EXISTS chat_logs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user        TEXT NOT NULL,
            role        TEXT NOT NULL,
            content     TEXT NOT NULL,
            file_ref    TEXT,
            invisible   INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        )
        "#,
    ),
    (
        "chat_logs user index",
        "CREATE INDEX IF NOT EXISTS idx_chat_logs_user ON chat_logs(user, id)",
    ),
    (
        "guardrail_configs table",
        r#"
        CREATE TABLE IF NOT EXISTS guardrail_configs (
            entity_id                INTEGER PRIMARY KEY,
            forbidden_words          TEXT NOT NULL DEFAULT '[]',
            max_input_length         INTEGER NOT NULL,
            use_external_moderation  INTEGER NOT NULL,
            strict_mode              INTEGER NOT NULL
        )
        "#,
    ),
];

fn query_err(what: &str) -> impl Fn(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::QueryFailed(format!("{what}: {e}"))
}

fn storage_err(what: &str) -> impl Fn(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::Storage(format!("{what}: {e}"))
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Storage(format!("serialization: {e}")))
}

pub struct SqliteConversationStore {
    pool: SqlitePool,
}

impl SqliteConversationStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let pool = open_pool(path).await?;
        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite conversation store initialized at {path}");
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        for (what, sql) in MIGRATIONS {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("{what}: {e}")))?;
        }
        debug!("SQLite conversation migrations complete");
        Ok(())
    }

    fn row_to_entity(row: &SqliteRow) -> Result<Entity, StoreError> {
        let keywords: String = row.try_get("forbidden_keywords").map_err(query_err("forbidden_keywords"))?;
        Ok(Entity {
            id: row.try_get("id").map_err(query_err("id"))?,
            name: row.try_get("name").map_err(query_err("name"))?,
            speed: row.try_get("speed").map_err(query_err("speed"))?,
            thinking_type: row.try_get("thinking_type").map_err(query_err("thinking_type"))?,
            forbidden_keywords: serde_json::from_str(&keywords).unwrap_or_default(),
        })
    }

    fn row_to_timeline(row: &SqliteRow) -> Result<ActionTimeline, StoreError> {
        Ok(ActionTimeline {
            entity_id: row.try_get("entity_id").map_err(query_err("entity_id"))?,
            next_turn: row.try_get("next_turn").map_err(query_err("next_turn"))?,
            can_act: row.try_get("can_act").map_err(query_err("can_act"))?,
        })
    }

    fn row_to_action(row: &SqliteRow) -> Result<ActionHistory, StoreError> {
        Ok(ActionHistory {
            id: row.try_get("id").map_err(query_err("id"))?,
            entity_id: row.try_get("entity_id").map_err(query_err("entity_id"))?,
            acted_at_turn: row.try_get("acted_at_turn").map_err(query_err("acted_at_turn"))?,
            done: row.try_get("done").map_err(query_err("done"))?,
        })
    }

    fn row_to_message(row: &SqliteRow) -> Result<Message, StoreError> {
        let created_at: String = row.try_get("created_at").map_err(query_err("created_at"))?;
        Ok(Message {
            id: row.try_get("id").map_err(query_err("id"))?,
            entity_id: row.try_get("entity_id").map_err(query_err("entity_id"))?,
            content: row.try_get("content").map_err(query_err("content"))?,
            action_id: row.try_get("action_id").map_err(query_err("action_id"))?,
            created_at: parse_time(&created_at),
        })
    }

    fn row_to_material(row: &SqliteRow) -> Result<RagMaterial, StoreError> {
        let metadata: String = row.try_get("metadata").map_err(query_err("metadata"))?;
        let embedding: Option<Vec<u8>> = row.try_get("embedding").map_err(query_err("embedding"))?;
        Ok(RagMaterial {
            id: row.try_get("id").map_err(query_err("id"))?,
            material_type: row.try_get("material_type").map_err(query_err("material_type"))?,
            source_text: row.try_get("source_text").map_err(query_err("source_text"))?,
            metadata: serde_json::from_str(&metadata).unwrap_or_default(),
            embedding: embedding.map(|b| vector::blob_to_embedding(&b)),
        })
    }

    fn row_to_chat_log(row: &SqliteRow) -> Result<ChatLog, StoreError> {
        let role: String = row.try_get("role").map_err(query_err("role"))?;
        let created_at: String = row.try_get("created_at").map_err(query_err("created_at"))?;
        Ok(ChatLog {
            id: row.try_get("id").map_err(query_err("id"))?,
            user: row.try_get("user").map_err(query_err("user"))?,
            role: role.parse().map_err(StoreError::QueryFailed)?,
            content: row.try_get("content").map_err(query_err("content"))?,
            file_ref: row.try_get("file_ref").map_err(query_err("file_ref"))?,
            invisible: row.try_get("invisible").map_err(query_err("invisible"))?,
            created_at: parse_time(&created_at),
        })
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_entity(&self, entity: NewEntity) -> Result<Entity, StoreError> {
        let keywords = to_json(&entity.forbidden_keywords)?;
        let result = sqlx::query(
            "INSERT INTO entities (name, speed, thinking_type, forbidden_keywords) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&entity.name)
        .bind(entity.speed)
        .bind(&entity.thinking_type)
        .bind(&keywords)
        .execute(&self.pool)
        .await
        .map_err(storage_err("entity insert"))?;

        Ok(Entity {
            id: result.last_insert_rowid(),
            name: entity.name,
            speed: entity.speed,
            thinking_type: entity.thinking_type,
            forbidden_keywords: entity.forbidden_keywords,
        })
    }

    async fn update_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE entities SET name = ?2, speed = ?3, thinking_type = ?4, forbidden_keywords = ?5 WHERE id = ?1",
        )
        .bind(entity.id)
        .bind(&entity.name)
        .bind(entity.speed)
        .bind(&entity.thinking_type)
        .bind(to_json(&entity.forbidden_keywords)?)
        .execute(&self.pool)
        .await
        .map_err(storage_err("entity update"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("entity {}", entity.id)));
        }
        Ok(())
    }

    async fn get_entity(&self, id: EntityId) -> Result<Option<Entity>, StoreError> {
        sqlx::query("SELECT * FROM entities WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("entity lookup"))?
            .as_ref()
            .map(Self::row_to_entity)
            .transpose()
    }

    async fn list_entities(&self) -> Result<Vec<Entity>, StoreError> {
        sqlx::query("SELECT * FROM entities ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("entity list"))?
            .iter()
            .map(Self::row_to_entity)
            .collect()
    }

    async fn get_timeline(&self, entity_id: EntityId) -> Result<Option<ActionTimeline>, StoreError> {
        sqlx::query("SELECT * FROM action_timelines WHERE entity_id = ?1")
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("timeline lookup"))?
            .as_ref()
            .map(Self::row_to_timeline)
            .transpose()
    }

    async fn save_timeline(&self, timeline: &ActionTimeline) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO action_timelines (entity_id, next_turn, can_act)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(entity_id) DO UPDATE SET
                next_turn = excluded.next_turn,
                can_act = excluded.can_act
            "#,
        )
        .bind(timeline.entity_id)
        .bind(timeline.next_turn)
        .bind(timeline.can_act)
        .execute(&self.pool)
        .await
        .map_err(storage_err("timeline upsert"))?;
        Ok(())
    }

    async fn list_timelines(&self) -> Result<Vec<ActionTimeline>, StoreError> {
        sqlx::query("SELECT * FROM action_timelines ORDER BY entity_id")
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("timeline list"))?
            .iter()
            .map(Self::row_to_timeline)
            .collect()
    }

    async fn create_action(&self, entity_id: EntityId, acted_at_turn: i64) -> Result<ActionHistory, StoreError> {
        let result = sqlx::query(
            "INSERT INTO action_histories (entity_id, acted_at_turn, done) VALUES (?1, ?2, 0)",
        )
        .bind(entity_id)
        .bind(acted_at_turn)
        .execute(&self.pool)
        .await
        .map_err(storage_err("action insert"))?;

        Ok(ActionHistory {
            id: result.last_insert_rowid(),
            entity_id,
            acted_at_turn,
            done: false,
        })
    }

    async fn get_action(&self, id: i64) -> Result<Option<ActionHistory>, StoreError> {
        sqlx::query("SELECT * FROM action_histories WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("action lookup"))?
            .as_ref()
            .map(Self::row_to_action)
            .transpose()
    }

    async fn next_pending_action(&self) -> Result<Option<ActionHistory>, StoreError> {
        sqlx::query(
            "SELECT * FROM action_histories WHERE done = 0 ORDER BY acted_at_turn, entity_id, id LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err("next pending action"))?
        .as_ref()
        .map(Self::row_to_action)
        .transpose()
    }

    async fn mark_action_done(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE action_histories SET done = 1 WHERE id = ?1 AND done = 0")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err("action update"))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_action(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("action {id}"))),
        }
    }

    async fn complete_action(
        &self,
        action_id: i64,
        content: &str,
        timeline: &ActionTimeline,
    ) -> Result<Option<Message>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage_err("begin"))?;

        let marked = sqlx::query("UPDATE action_histories SET done = 1 WHERE id = ?1 AND done = 0")
            .bind(action_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err("action update"))?;
        if marked.rows_affected() == 0 {
            let exists = sqlx::query("SELECT id FROM action_histories WHERE id = ?1")
                .bind(action_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_err("action lookup"))?;
            return match exists {
                Some(_) => Ok(None),
                None => Err(StoreError::NotFound(format!("action {action_id}"))),
            };
        }

        let created_at = Utc::now();
        let inserted = sqlx::query(
            "INSERT INTO messages (entity_id, content, action_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(timeline.entity_id)
        .bind(content)
        .bind(action_id)
        .bind(created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(storage_err("message insert"))?;

        sqlx::query(
            r#"
            INSERT INTO action_timelines (entity_id, next_turn, can_act)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(entity_id) DO UPDATE SET
                next_turn = excluded.next_turn,
                can_act = excluded.can_act
            "#,
        )
        .bind(timeline.entity_id)
        .bind(timeline.next_turn)
        .bind(timeline.can_act)
        .execute(&mut *tx)
        .await
        .map_err(storage_err("timeline upsert"))?;

        tx.commit().await.map_err(storage_err("commit"))?;
        debug!(action_id, entity_id = timeline.entity_id, "Action completed");

        Ok(Some(Message {
            id: inserted.last_insert_rowid(),
            entity_id: timeline.entity_id,
            content: content.to_string(),
            action_id: Some(action_id),
            created_at,
        }))
    }

    async fn reset_actions_pending(&self) -> Result<usize, StoreError> {
        let result = sqlx::query("UPDATE action_histories SET done = 0 WHERE done = 1")
            .execute(&self.pool)
            .await
            .map_err(storage_err("action reset"))?;
        Ok(result.rows_affected() as usize)
    }

    async fn delete_all_actions(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM action_histories")
            .execute(&self.pool)
            .await
            .map_err(storage_err("action delete"))?;
        Ok(())
    }

    async fn list_actions(&self) -> Result<Vec<ActionHistory>, StoreError> {
        sqlx::query("SELECT * FROM action_histories ORDER BY acted_at_turn, entity_id, id")
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("action list"))?
            .iter()
            .map(Self::row_to_action)
            .collect()
    }

    async fn append_message(
        &self,
        entity_id: EntityId,
        content: &str,
        action_id: Option<i64>,
    ) -> Result<Message, StoreError> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO messages (entity_id, content, action_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(entity_id)
        .bind(content)
        .bind(action_id)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage_err("message insert"))?;

        Ok(Message {
            id: result.last_insert_rowid(),
            entity_id,
            content: content.to_string(),
            action_id,
            created_at,
        })
    }

    async fn recent_messages(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        sqlx::query("SELECT * FROM messages ORDER BY id DESC LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("recent messages"))?
            .iter()
            .map(Self::row_to_message)
            .collect()
    }

    async fn delete_all_messages(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM messages")
            .execute(&self.pool)
            .await
            .map_err(storage_err("message delete"))?;
        Ok(())
    }

    async fn upsert_material(&self, material: &RagMaterial) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO rag_materials (material_type, id, source_text, metadata, embedding)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(material_type, id) DO UPDATE SET
                source_text = excluded.source_text,
                metadata = excluded.metadata,
                embedding = excluded.embedding
            "#,
        )
        .bind(&material.material_type)
        .bind(&material.id)
        .bind(&material.source_text)
        .bind(to_json(&material.metadata)?)
        .bind(material.embedding.as_deref().map(vector::embedding_to_blob))
        .execute(&self.pool)
        .await
        .map_err(storage_err("material upsert"))?;
        Ok(())
    }

    async fn first_material(&self, material_type: &str) -> Result<Option<RagMaterial>, StoreError> {
        sqlx::query("SELECT * FROM rag_materials WHERE material_type = ?1 ORDER BY id LIMIT 1")
            .bind(material_type)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("material lookup"))?
            .as_ref()
            .map(Self::row_to_material)
            .transpose()
    }

    async fn count_materials(&self, material_type: &str) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM rag_materials WHERE material_type = ?1")
            .bind(material_type)
            .fetch_one(&self.pool)
            .await
            .map_err(query_err("material count"))?;
        Ok(row.get::<i64, _>("n") as usize)
    }

    async fn append_chat_log(&self, log: NewChatLog) -> Result<ChatLog, StoreError> {
        let created_at = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO chat_logs (user, role, content, file_ref, invisible, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&log.user)
        .bind(log.role.as_str())
        .bind(&log.content)
        .bind(&log.file_ref)
        .bind(log.invisible)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage_err("chat log insert"))?;

        Ok(ChatLog {
            id: result.last_insert_rowid(),
            user: log.user,
            role: log.role,
            content: log.content,
            file_ref: log.file_ref,
            invisible: log.invisible,
            created_at,
        })
    }

    async fn chat_logs(&self, user: &str) -> Result<Vec<ChatLog>, StoreError> {
        sqlx::query("SELECT * FROM chat_logs WHERE user = ?1 ORDER BY id")
            .bind(user)
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("chat logs"))?
            .iter()
            .map(Self::row_to_chat_log)
            .collect()
    }

    async fn get_guardrail_config(&self, entity_id: EntityId) -> Result<Option<GuardrailConfig>, StoreError> {
        let Some(row) = sqlx::query("SELECT * FROM guardrail_configs WHERE entity_id = ?1")
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("guardrail lookup"))?
        else {
            return Ok(None);
        };

        let words: String = row.try_get("forbidden_words").map_err(query_err("forbidden_words"))?;
        let max_input_length: i64 = row.try_get("max_input_length").map_err(query_err("max_input_length"))?;
        Ok(Some(GuardrailConfig {
            entity_id: Some(entity_id),
            forbidden_words: serde_json::from_str(&words).unwrap_or_default(),
            max_input_length: max_input_length as usize,
            use_external_moderation: row
                .try_get("use_external_moderation")
                .map_err(query_err("use_external_moderation"))?,
            strict_mode: row.try_get("strict_mode").map_err(query_err("strict_mode"))?,
        }))
    }

    async fn save_guardrail_config(&self, config: &GuardrailConfig) -> Result<(), StoreError> {
        let entity_id = config
            .entity_id
            .ok_or_else(|| StoreError::Storage("guardrail config without entity_id".into()))?;

        sqlx::query(
            r#"
            INSERT INTO guardrail_configs
                (entity_id, forbidden_words, max_input_length, use_external_moderation, strict_mode)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(entity_id) DO UPDATE SET
                forbidden_words = excluded.forbidden_words,
                max_input_length = excluded.max_input_length,
                use_external_moderation = excluded.use_external_moderation,
                strict_mode = excluded.strict_mode
            "#,
        )
        .bind(entity_id)
        .bind(to_json(&config.forbidden_words)?)
        .bind(config.max_input_length as i64)
        .bind(config.use_external_moderation)
        .bind(config.strict_mode)
        .execute(&self.pool)
        .await
        .map_err(storage_err("guardrail upsert"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conformance() {
        let store = SqliteConversationStore::new(":memory:").await.unwrap();
        super::super::tests::exercise(&store).await;
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversation.db");
        let path = path.to_str().unwrap();
        let id = {
            let store = SqliteConversationStore::new(path).await.unwrap();
            let e = store
                .create_entity(NewEntity::new("Aoi", 2.0, "google_maps_based"))
                .await
                .unwrap();
            store
                .save_timeline(&ActionTimeline {
                    entity_id: e.id,
                    next_turn: 0.5,
                    can_act: true,
                })
                .await
                .unwrap();
            e.id
        };
        let store = SqliteConversationStore::new(path).await.unwrap();
        assert_eq!(store.get_entity(id).await.unwrap().unwrap().name, "Aoi");
        assert_eq!(store.get_timeline(id).await.unwrap().unwrap().next_turn, 0.5);
    }
}
