//! Composition root: config in, wired components out.

use std::sync::Arc;

use rondo_agent::{ChatSession, EngineRegistry, Orchestrator};
use rondo_config::AppConfig;
use rondo_core::provider::Provider;
use rondo_core::rag::{Embedder, VectorStore};
use rondo_core::store::ConversationStore;
use rondo_guard::{AuditLogger, GeneralLlm, GuardPipeline, ModerationGuard, SemanticGuard};
use rondo_providers::{CompletionConfig, CompletionPort, ProviderEmbedder, RetryPolicy};
use rondo_store::{
    HashingEmbedder, InMemoryConversationStore, InMemoryVectorStore, RagCollection, SqliteConversationStore,
    SqliteVectorStore,
};
use tracing::{debug, warn};

pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// `rag.embedding_model` value selecting the offline embedder.
pub const HASHING_EMBEDDER: &str = "hashing";

pub struct Runtime {
    pub config: AppConfig,
    pub store: Arc<dyn ConversationStore>,
    vectors: Arc<dyn VectorStore>,
    provider: Option<Arc<dyn Provider>>,
    audit: Arc<AuditLogger>,
}

impl Runtime {
    /// Load `~/.rondo/config.toml` and open the configured stores.
    pub async fn open() -> CliResult<Self> {
        let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
        Self::open_with(config).await
    }

    pub async fn open_with(config: AppConfig) -> CliResult<Self> {
        let (store, vectors): (Arc<dyn ConversationStore>, Arc<dyn VectorStore>) = match config.rag.backend.as_str() {
            "memory" => {
                warn!("rag.backend = \"memory\": nothing outlives this process");
                (
                    Arc::new(InMemoryConversationStore::new()),
                    Arc::new(InMemoryVectorStore::new()),
                )
            }
            _ => {
                std::fs::create_dir_all(&config.rag.persist_directory)?;
                let conversation = config.conversation_db_path();
                let vectors = config.vector_db_path();
                (
                    Arc::new(SqliteConversationStore::new(&conversation.to_string_lossy()).await?),
                    Arc::new(SqliteVectorStore::new(&vectors.to_string_lossy()).await?),
                )
            }
        };

        let provider = match rondo_providers::build_from_config(&config) {
            Ok(provider) => Some(provider),
            Err(e) => {
                debug!(error = %e, "No LLM provider");
                None
            }
        };

        Ok(Self::from_parts(config, store, vectors, provider))
    }

    pub fn from_parts(
        config: AppConfig,
        store: Arc<dyn ConversationStore>,
        vectors: Arc<dyn VectorStore>,
        provider: Option<Arc<dyn Provider>>,
    ) -> Self {
        Self {
            config,
            store,
            vectors,
            provider,
            audit: Arc::new(AuditLogger::with_tracing()),
        }
    }

    pub fn provider(&self) -> CliResult<Arc<dyn Provider>> {
        self.provider
            .clone()
            .ok_or_else(|| "No API key found: set RONDO_API_KEY or OPENAI_API_KEY, or api_key in config.toml".into())
    }

    pub fn port(&self) -> CliResult<Arc<CompletionPort>> {
        let config = CompletionConfig::from_settings(&self.config.completion, self.config.api_key.clone());
        Ok(Arc::new(CompletionPort::new(self.provider()?, config)?))
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy::from_settings(&self.config.retry)
    }

    pub fn embedder(&self) -> CliResult<Arc<dyn Embedder>> {
        let rag = &self.config.rag;
        if rag.embedding_model == HASHING_EMBEDDER {
            return Ok(Arc::new(HashingEmbedder::new(rag.hashing_dimensions)));
        }
        Ok(Arc::new(ProviderEmbedder::new(self.provider()?, rag.embedding_model.as_str())))
    }

    pub fn knowledge(&self) -> CliResult<RagCollection> {
        Ok(RagCollection::new(
            self.config.rag.collection_name.as_str(),
            self.vectors.clone(),
            self.embedder()?,
        ))
    }

    pub fn semantic(&self) -> CliResult<SemanticGuard> {
        Ok(SemanticGuard::new(self.knowledge()?)
            .with_threshold(self.config.rag.forbidden_threshold)
            .with_rag_hit_max_distance(self.config.rag.rag_hit_max_distance)
            .with_retry(self.retry()))
    }

    pub fn guards(&self) -> CliResult<GuardPipeline> {
        let mut guards = GuardPipeline::new(self.audit.clone());
        if self.config.guardrail.use_external_moderation {
            match &self.provider {
                Some(provider) => {
                    guards = guards.with_moderation(ModerationGuard::new(provider.clone(), self.retry()));
                }
                None => warn!("External moderation is enabled but no provider is configured"),
            }
        }
        if self.config.guardrail.semantic {
            let general: Arc<dyn GeneralLlm> = self.port()?;
            guards = guards.with_semantic(self.semantic()?, Some(general));
        }
        Ok(guards)
    }

    pub fn engines(&self) -> EngineRegistry {
        EngineRegistry::from_config(self.store.clone(), &self.config.engines)
    }

    pub fn orchestrator(&self) -> CliResult<Orchestrator> {
        let mut orchestrator = Orchestrator::new(self.store.clone(), self.engines(), self.port()?, self.guards()?)
            .with_settings(self.config.orchestrator.clone())
            .with_guardrail_defaults(self.config.guardrail.clone())
            .with_retry(self.retry());
        match self.knowledge() {
            Ok(knowledge) => orchestrator = orchestrator.with_knowledge(knowledge),
            Err(e) => warn!(error = %e, "Knowledge collection unavailable; using stored material only"),
        }
        Ok(orchestrator)
    }

    pub fn chat(&self, user: &str) -> CliResult<ChatSession> {
        let defaults = &self.config.guardrail;
        let guardrail = rondo_core::guard::GuardrailConfig {
            forbidden_words: defaults.forbidden_words.clone(),
            max_input_length: defaults.max_input_length,
            use_external_moderation: defaults.use_external_moderation,
            ..Default::default()
        };
        Ok(ChatSession::new(self.store.clone(), self.port()?, Arc::new(self.guards()?), user)
            .with_guardrail(guardrail)
            .with_end_sentinel(self.config.orchestrator.end_sentinel.as_str()))
    }
}
