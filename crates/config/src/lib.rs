//! Configuration loading, validation, and management for Rondo.
//!
//! Loads configuration from `~/.rondo/config.toml`. Only two environment
//! variables are consulted: the LLM API key (`RONDO_API_KEY`, then
//! `OPENAI_API_KEY`) and the RAG persistence path (`RONDO_PERSIST_DIR`).

use rondo_core::conversation::Entity;
use rondo_core::guard::{DEFAULT_FORBIDDEN_WORDS, DEFAULT_MAX_INPUT_LENGTH, GuardrailConfig};
use rondo_core::token::TokenizerFamily;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Sentinel that marks the end of a riddle session.
pub const DEFAULT_END_SENTINEL: &str = "本日はなぞなぞにご参加いただき";

/// The root configuration structure.
///
/// Maps directly to `~/.rondo/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the LLM provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default)]
    pub completion: CompletionSettings,

    #[serde(default)]
    pub rag: RagSettings,

    #[serde(default)]
    pub guardrail: GuardrailDefaults,

    #[serde(default)]
    pub orchestrator: OrchestratorSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub batch: BatchSettings,

    /// Extra or overriding thinking engines
    #[serde(default)]
    pub engines: Vec<EngineConfig>,

    /// Entities created by `rondo onboard`
    #[serde(default)]
    pub entities: Vec<EntitySeed>,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("completion", &self.completion)
            .field("rag", &self.rag)
            .field("guardrail", &self.guardrail)
            .field("orchestrator", &self.orchestrator)
            .field("retry", &self.retry)
            .field("batch", &self.batch)
            .field("engines", &self.engines)
            .field("entities", &self.entities)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionSettings {
    /// OpenAI-compatible base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Must lie in [0, 1]
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Stream replies in `rondo chat`
    #[serde(default)]
    pub streaming: bool,

    /// Token budget for the history sent to the model
    #[serde(default = "default_history_max_tokens")]
    pub history_max_tokens: usize,

    #[serde(default = "default_completion_timeout")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_history_max_tokens() -> usize {
    3000
}
fn default_completion_timeout() -> u64 {
    120
}
fn default_true() -> bool {
    true
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            streaming: false,
            history_max_tokens: default_history_max_tokens(),
            timeout_secs: default_completion_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagSettings {
    /// "sqlite" or "memory"
    #[serde(default = "default_rag_backend")]
    pub backend: String,

    /// Collection that `rondo knowledge ingest` writes to
    #[serde(default = "default_collection_name")]
    pub collection_name: String,

    /// Remote embedding model, or "hashing" for the offline embedder
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Dimensions of the offline hashing embedder
    #[serde(default = "default_hashing_dimensions")]
    pub hashing_dimensions: usize,

    #[serde(default = "default_persist_directory")]
    pub persist_directory: PathBuf,

    /// Cosine distance below which a forbidden word counts as hit
    #[serde(default = "default_forbidden_threshold")]
    pub forbidden_threshold: f32,

    /// Optional distance cap for a knowledge hit (unset = any neighbour)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag_hit_max_distance: Option<f32>,
}

fn default_rag_backend() -> String {
    "sqlite".into()
}
fn default_collection_name() -> String {
    "knowledge".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_hashing_dimensions() -> usize {
    256
}
fn default_persist_directory() -> PathBuf {
    AppConfig::config_dir().join("data")
}
fn default_forbidden_threshold() -> f32 {
    0.35
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            backend: default_rag_backend(),
            collection_name: default_collection_name(),
            embedding_model: default_embedding_model(),
            hashing_dimensions: default_hashing_dimensions(),
            persist_directory: default_persist_directory(),
            forbidden_threshold: default_forbidden_threshold(),
            rag_hit_max_distance: None,
        }
    }
}

/// Guardrail defaults for entities without a stored config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailDefaults {
    #[serde(default = "default_forbidden_words")]
    pub forbidden_words: Vec<String>,

    #[serde(default = "default_max_input_length")]
    pub max_input_length: usize,

    #[serde(default = "default_true")]
    pub use_external_moderation: bool,

    /// Run the semantic RAG/forbidden-word guard during turns
    #[serde(default)]
    pub semantic: bool,
}

fn default_forbidden_words() -> Vec<String> {
    DEFAULT_FORBIDDEN_WORDS.iter().map(|w| w.to_string()).collect()
}
fn default_max_input_length() -> usize {
    DEFAULT_MAX_INPUT_LENGTH
}

impl Default for GuardrailDefaults {
    fn default() -> Self {
        Self {
            forbidden_words: default_forbidden_words(),
            max_input_length: default_max_input_length(),
            use_external_moderation: true,
            semantic: false,
        }
    }
}

impl GuardrailDefaults {
    /// The config applied to `entity` when none is stored: these defaults,
    /// the entity's own keywords, and strict mode from its thinking type.
    pub fn for_entity(&self, entity: &Entity) -> GuardrailConfig {
        let mut config = GuardrailConfig {
            entity_id: Some(entity.id),
            forbidden_words: self.forbidden_words.clone(),
            max_input_length: self.max_input_length,
            use_external_moderation: self.use_external_moderation,
            strict_mode: entity.is_strict(),
        };
        config.merge_keywords(&entity.forbidden_keywords);
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Recent messages fed to reframing and generation
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,

    /// Actions materialized per scheduling window
    #[serde(default = "default_simulate_steps")]
    pub simulate_steps: usize,

    /// Content that ends a session and triggers the evaluation
    #[serde(default = "default_end_sentinel")]
    pub end_sentinel: String,

    #[serde(default = "default_true")]
    pub evaluate_on_sentinel: bool,

    /// Reply from RAG material when generation fails transiently
    #[serde(default = "default_true")]
    pub rag_fallback_on_transient: bool,

    /// Chat log owner for orchestrator-written invisible entries
    #[serde(default = "default_chat_log_user")]
    pub chat_log_user: String,
}

fn default_recent_window() -> usize {
    5
}
fn default_simulate_steps() -> usize {
    10
}
fn default_end_sentinel() -> String {
    DEFAULT_END_SENTINEL.into()
}
fn default_chat_log_user() -> String {
    "orchestrator".into()
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            recent_window: default_recent_window(),
            simulate_steps: default_simulate_steps(),
            end_sentinel: default_end_sentinel(),
            evaluate_on_sentinel: true,
            rag_fallback_on_transient: true,
            chat_log_user: default_chat_log_user(),
        }
    }
}

/// Retry policy for RAG and moderation calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Deadline for each external call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    2
}
fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_call_timeout() -> u64 {
    30
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Give up waiting after this long (the server window is 24h)
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,

    #[serde(default = "default_batch_max_tokens")]
    pub max_tokens: u32,
}

fn default_poll_interval() -> u64 {
    30
}
fn default_max_wait() -> u64 {
    24 * 60 * 60
}
fn default_batch_max_tokens() -> u32 {
    1000
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_wait_secs: default_max_wait(),
            max_tokens: default_batch_max_tokens(),
        }
    }
}

/// A thinking engine declared in config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub thinking_type: String,

    /// Name used in prompts ("クラウド法" etc.)
    #[serde(default)]
    pub display_name: Option<String>,

    /// RAG material backing the engine
    #[serde(default)]
    pub material_type: Option<String>,

    /// Case-insensitive keywords the input must contain
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Skip the material/keyword checks entirely
    #[serde(default)]
    pub always_respond: bool,
}

/// An entity to create on onboarding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySeed {
    pub name: String,
    pub speed: f64,
    pub thinking_type: String,
    #[serde(default)]
    pub forbidden_keywords: Vec<String>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.rondo/config.toml).
    ///
    /// Environment overrides:
    /// - `RONDO_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `RONDO_PERSIST_DIR`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if config.api_key.is_none() {
            config.api_key = std::env::var("RONDO_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(dir) = std::env::var("RONDO_PERSIST_DIR") {
            config.rag.persist_directory = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".rondo")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.completion;
        if !(0.0..=1.0).contains(&c.temperature) {
            return Err(ConfigError::ValidationError(
                "completion.temperature must be between 0.0 and 1.0".into(),
            ));
        }

        if TokenizerFamily::for_model(&c.model).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "completion.model '{}' is not a known model tag",
                c.model
            )));
        }

        if c.max_tokens == 0 || c.history_max_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "completion.max_tokens and completion.history_max_tokens must be > 0".into(),
            ));
        }

        if self.guardrail.max_input_length == 0 {
            return Err(ConfigError::ValidationError(
                "guardrail.max_input_length must be > 0".into(),
            ));
        }

        if !(self.rag.forbidden_threshold > 0.0 && self.rag.forbidden_threshold <= 2.0) {
            return Err(ConfigError::ValidationError(
                "rag.forbidden_threshold must be in (0, 2]".into(),
            ));
        }

        if !matches!(self.rag.backend.as_str(), "sqlite" | "memory") {
            return Err(ConfigError::ValidationError(format!(
                "rag.backend must be 'sqlite' or 'memory', got '{}'",
                self.rag.backend
            )));
        }

        if self.orchestrator.recent_window == 0 || self.orchestrator.simulate_steps == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.recent_window and orchestrator.simulate_steps must be > 0".into(),
            ));
        }

        if let Some(seed) = self.entities.iter().find(|e| !(e.speed > 0.0)) {
            return Err(ConfigError::ValidationError(format!(
                "entity '{}' must have a positive speed",
                seed.name
            )));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Path of the relational conversation database.
    pub fn conversation_db_path(&self) -> PathBuf {
        self.rag.persist_directory.join("conversation.db")
    }

    /// Path of the vector database.
    pub fn vector_db_path(&self) -> PathBuf {
        self.rag.persist_directory.join("vectors.db")
    }

    /// Generate a default config TOML string (for `onboard` command).
    pub fn default_toml() -> String {
        let config = Self {
            entities: vec![
                EntitySeed {
                    name: "クラウド法アナリスト".into(),
                    speed: 100.0,
                    thinking_type: "cloud_act_based".into(),
                    forbidden_keywords: vec![],
                },
                EntitySeed {
                    name: "少子化リサーチャー".into(),
                    speed: 10.0,
                    thinking_type: "declining_birth_rate_based".into(),
                    forbidden_keywords: vec![],
                },
            ],
            ..Self::default()
        };
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            completion: CompletionSettings::default(),
            rag: RagSettings::default(),
            guardrail: GuardrailDefaults::default(),
            orchestrator: OrchestratorSettings::default(),
            retry: RetrySettings::default(),
            batch: BatchSettings::default(),
            engines: vec![],
            entities: vec![],
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for rondo_core::Error {
    fn from(e: ConfigError) -> Self {
        rondo_core::Error::invalid_config(e.to_string())
    }
}
