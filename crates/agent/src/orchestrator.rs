//! The conversation orchestrator: drives one turn end to end.
//!
//! A turn takes the next pending action, gathers the recent dialogue,
//! reframes it for the acting entity, asks the entity's thinking engine
//! whether it can take part, runs the guard chain, generates a reply, and
//! persists the outcome under the action. Turns are serialized per
//! orchestrator by an async mutex.

use std::collections::HashMap;
use std::sync::Arc;

use rondo_config::{GuardrailDefaults, OrchestratorSettings};
use rondo_core::conversation::{ActionHistory, Entity, EntityId, Message};
use rondo_core::guard::GuardrailConfig;
use rondo_core::message::ChatMessage;
use rondo_core::rag::MetadataFilter;
use rondo_core::store::ConversationStore;
use rondo_core::{Error, Result};
use rondo_guard::{AuditEvent, AuditOutcome, BlockCategory, GuardPipeline, GuardVerdict};
use rondo_providers::{CompletionPort, RetryPolicy};
use rondo_store::RagCollection;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::engines::{EngineRegistry, ThinkingEngine};
use crate::evaluation::{Evaluation, SessionEvaluator, is_session_end};
use crate::reframer::Reframer;
use crate::scheduler::{ScheduledTurn, TurnScheduler};

/// Author id for conversation topics posted by an operator.
pub const TOPIC_ENTITY_ID: EntityId = 0;

/// Knowledge documents consulted per reframing.
const RAG_SOURCE_DOCUMENTS: usize = 3;

/// What happened during one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// The entity replied.
    Spoke {
        entity_id: EntityId,
        action_id: i64,
        content: String,
        /// The reply came from stored material after generation failed.
        from_material: bool,
        evaluation: Option<Evaluation>,
    },
    /// A guard blocked the turn; the block message was persisted.
    Blocked {
        entity_id: EntityId,
        action_id: i64,
        category: BlockCategory,
        message: String,
    },
    /// The thinking engine could not take part.
    Skipped {
        entity_id: EntityId,
        action_id: i64,
        message: String,
    },
    /// Stored state is inconsistent; nothing was persisted.
    Inconsistent { action_id: i64, message: String },
}

impl TurnOutcome {
    /// The text returned to the caller.
    pub fn text(&self) -> &str {
        match self {
            TurnOutcome::Spoke { content, .. } => content,
            TurnOutcome::Blocked { message, .. }
            | TurnOutcome::Skipped { message, .. }
            | TurnOutcome::Inconsistent { message, .. } => message,
        }
    }

    pub fn action_id(&self) -> i64 {
        match self {
            TurnOutcome::Spoke { action_id, .. }
            | TurnOutcome::Blocked { action_id, .. }
            | TurnOutcome::Skipped { action_id, .. }
            | TurnOutcome::Inconsistent { action_id, .. } => *action_id,
        }
    }
}

pub fn skip_message(entity: &Entity) -> String {
    format!("[ERROR]{}({}) could not participate", entity.name, entity.thinking_type)
}

fn missing_timeline_message(entity: &Entity) -> String {
    format!(
        "[CRITICAL] データ不整合: {}（id={}）の行動タイムラインが存在しません。管理者に連絡してください。",
        entity.name, entity.id
    )
}

/// Newest first, one message per line.
fn join_recent(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct Orchestrator {
    store: Arc<dyn ConversationStore>,
    scheduler: TurnScheduler,
    engines: EngineRegistry,
    port: Arc<CompletionPort>,
    reframer: Reframer,
    guards: GuardPipeline,
    evaluator: SessionEvaluator,
    knowledge: Option<RagCollection>,
    retry: RetryPolicy,
    settings: OrchestratorSettings,
    guardrail_defaults: GuardrailDefaults,
    turn_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        engines: EngineRegistry,
        port: Arc<CompletionPort>,
        guards: GuardPipeline,
    ) -> Self {
        Self {
            scheduler: TurnScheduler::new(store.clone()),
            reframer: Reframer::new(port.clone()),
            evaluator: SessionEvaluator::new(port.clone(), store.clone()),
            store,
            engines,
            port,
            guards,
            knowledge: None,
            retry: RetryPolicy::default(),
            settings: OrchestratorSettings::default(),
            guardrail_defaults: GuardrailDefaults::default(),
            turn_lock: Mutex::new(()),
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_guardrail_defaults(mut self, defaults: GuardrailDefaults) -> Self {
        self.guardrail_defaults = defaults;
        self
    }

    /// Knowledge collection used as the reframing source.
    pub fn with_knowledge(mut self, knowledge: RagCollection) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn scheduler(&self) -> &TurnScheduler {
        &self.scheduler
    }

    pub fn engines(&self) -> &EngineRegistry {
        &self.engines
    }

    pub fn guards(&self) -> &GuardPipeline {
        &self.guards
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Reset the conversation and materialize the first window.
    pub async fn reset(&self) -> Result<Vec<ScheduledTurn>> {
        let _turn = self.turn_lock.lock().await;
        self.scheduler.reset_timeline(self.settings.simulate_steps).await
    }

    /// Post an operator message that entities respond to.
    pub async fn post_topic(&self, text: &str) -> Result<Message> {
        let _turn = self.turn_lock.lock().await;
        info!(chars = text.chars().count(), "Topic posted");
        Ok(self.store.append_message(TOPIC_ENTITY_ID, text, None).await?)
    }

    /// Take the next pending action, materializing a new window when none is
    /// pending. `None` when no entity can act.
    pub async fn run_next_turn(&self) -> Result<Option<TurnOutcome>> {
        let _turn = self.turn_lock.lock().await;
        let action = match self.store.next_pending_action().await? {
            Some(action) => action,
            None => {
                let window = self
                    .scheduler
                    .simulate_next_actions(self.settings.simulate_steps)
                    .await?;
                if window.is_empty() {
                    info!("No entity can act");
                    return Ok(None);
                }
                self.store
                    .next_pending_action()
                    .await?
                    .ok_or_else(|| Error::Internal("materialized window has no pending action".into()))?
            }
        };
        self.take_turn(&action).await.map(Some)
    }

    /// Drive the turn for `action`.
    pub async fn advance_turn(&self, action: &ActionHistory) -> Result<TurnOutcome> {
        let _turn = self.turn_lock.lock().await;
        self.take_turn(action).await
    }

    async fn take_turn(&self, action: &ActionHistory) -> Result<TurnOutcome> {
        let current = self
            .store
            .get_action(action.id)
            .await?
            .ok_or_else(|| Error::DataInconsistency(format!("action {} does not exist", action.id)))?;
        if current.done {
            return Err(Error::Internal(format!("action {} is already done", action.id)));
        }

        let Some(entity) = self.store.get_entity(action.entity_id).await? else {
            let message = format!("[CRITICAL] データ不整合: 行動 {} の参加者（id={}）が存在しません。", action.id, action.entity_id);
            error!(critical = true, action_id = action.id, entity_id = action.entity_id, "Action without entity");
            return Ok(TurnOutcome::Inconsistent {
                action_id: action.id,
                message,
            });
        };
        if self.store.get_timeline(entity.id).await?.is_none() {
            error!(
                critical = true,
                action_id = action.id,
                entity = %entity.name,
                "Action without timeline; not repairing"
            );
            return Ok(TurnOutcome::Inconsistent {
                action_id: action.id,
                message: missing_timeline_message(&entity),
            });
        }

        let engine = self.engines.resolve(&entity.thinking_type);
        let recent = self.store.recent_messages(self.settings.recent_window).await?;
        let context = join_recent(&recent);
        let reframed = if context.trim().is_empty() {
            context
        } else {
            let rag_source = self.rag_source(&engine, &context).await;
            self.reframer
                .reframe(&context, &entity, &engine.display_name, rag_source.as_deref())
                .await
        };
        debug!(entity = %entity.name, action_id = action.id, "Context ready");

        if !self.engines.can_respond(&reframed, &entity).await? {
            let message = skip_message(&entity);
            self.guards.audit().log(
                AuditEvent::EngineDeclined {
                    thinking_type: entity.thinking_type.clone(),
                },
                &entity.name,
                &reframed,
                AuditOutcome::Blocked,
                None,
            );
            self.finish(&entity, action, &message).await?;
            info!(entity = %entity.name, action_id = action.id, "Entity could not participate");
            return Ok(TurnOutcome::Skipped {
                entity_id: entity.id,
                action_id: action.id,
                message,
            });
        }

        let config = self.guardrail_config(&entity).await?;
        if let GuardVerdict::Block { category, message, .. } = self.guards.check(&reframed, &entity.name, &config).await {
            self.finish(&entity, action, &message).await?;
            info!(entity = %entity.name, action_id = action.id, %category, "Turn blocked");
            return Ok(TurnOutcome::Blocked {
                entity_id: entity.id,
                action_id: action.id,
                category,
                message,
            });
        }

        let history = self.build_history(&entity, &engine, &recent, &reframed).await?;
        let (content, from_material) = match self.port.complete(&history).await {
            Ok(result) => (result.content, false),
            Err(e) if e.is_transient() && self.settings.rag_fallback_on_transient => {
                match self.engines.generate_rag_response(&entity, &reframed).await? {
                    Some(fallback) => {
                        warn!(entity = %entity.name, error = %e, "Generation failed, replying from material");
                        (fallback, true)
                    }
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        self.finish(&entity, action, &content).await?;
        info!(entity = %entity.name, action_id = action.id, from_material, "Entity spoke");

        let evaluation = if self.settings.evaluate_on_sentinel && is_session_end(&content, &self.settings.end_sentinel) {
            let mut transcript = history;
            transcript.push(ChatMessage::assistant(content.as_str()));
            match self
                .evaluator
                .evaluate(&self.settings.chat_log_user, &transcript)
                .await
            {
                Ok(evaluation) => Some(evaluation),
                Err(e) => {
                    warn!(error = %e, "Session evaluation failed");
                    None
                }
            }
        } else {
            None
        };

        Ok(TurnOutcome::Spoke {
            entity_id: entity.id,
            action_id: action.id,
            content,
            from_material,
            evaluation,
        })
    }

    /// Persist the turn's text under the action, mark it done, and move the
    /// entity's clock forward, all in one store write.
    async fn finish(&self, entity: &Entity, action: &ActionHistory, text: &str) -> Result<()> {
        let timeline = self.scheduler.next_clock(entity).await?;
        if self.store.complete_action(action.id, text, &timeline).await?.is_none() {
            warn!(action_id = action.id, "Action was already done; turn not recorded");
        }
        Ok(())
    }

    async fn guardrail_config(&self, entity: &Entity) -> Result<GuardrailConfig> {
        Ok(match self.store.get_guardrail_config(entity.id).await? {
            Some(mut stored) => {
                stored.merge_keywords(&entity.forbidden_keywords);
                stored.strict_mode |= entity.is_strict();
                stored
            }
            None => self.guardrail_defaults.for_entity(entity),
        })
    }

    /// Material for keyword extraction: nearest knowledge documents for the
    /// engine's material type, else its first stored material. Best effort.
    async fn rag_source(&self, engine: &ThinkingEngine, context: &str) -> Option<String> {
        let material_type = engine.material_type.as_deref()?;

        if let Some(knowledge) = &self.knowledge {
            let filter = MetadataFilter::eq("material_type", material_type);
            match self
                .retry
                .run("knowledge query", || knowledge.query(context, RAG_SOURCE_DOCUMENTS, Some(&filter)))
                .await
            {
                Ok(hits) if !hits.is_empty() => {
                    return Some(
                        hits.iter()
                            .map(|h| h.document.page_content.as_str())
                            .collect::<Vec<_>>()
                            .join("\n"),
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Knowledge query failed"),
            }
        }

        match self.store.first_material(material_type).await {
            Ok(material) => material.map(|m| m.source_text),
            Err(e) => {
                warn!(error = %e, "Material lookup failed");
                None
            }
        }
    }

    /// System prompt plus the recent window, oldest first. The entity's own
    /// lines are assistant turns; everyone else speaks as the user.
    async fn build_history(
        &self,
        entity: &Entity,
        engine: &ThinkingEngine,
        recent: &[Message],
        reframed: &str,
    ) -> Result<Vec<ChatMessage>> {
        let names: HashMap<EntityId, String> = self
            .store
            .list_entities()
            .await?
            .into_iter()
            .map(|e| (e.id, e.name))
            .collect();

        let mut history = Vec::with_capacity(recent.len() + 1);
        history.push(ChatMessage::system(format!(
            "あなたは「{}」です。{}の専門家として複数人の会話に参加しています。\
             自分の専門の視点から、直前の発言に簡潔に応答してください。\n\n論点の整理:\n{reframed}",
            entity.name, engine.display_name
        )));
        for message in recent.iter().rev() {
            if message.entity_id == entity.id {
                history.push(ChatMessage::assistant(message.content.as_str()));
            } else {
                let speaker = names
                    .get(&message.entity_id)
                    .map(String::as_str)
                    .unwrap_or("司会");
                history.push(ChatMessage::user(format!("{speaker}: {}", message.content)));
            }
        }
        if history.len() == 1 {
            history.push(ChatMessage::user("会話を始めてください。"));
        }
        Ok(history)
    }
}
