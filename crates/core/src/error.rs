//! Error types for the Rondo domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use crate::guard::SemanticGuardResult;
use thiserror::Error;

/// The top-level error type for all Rondo operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Configuration errors ---
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // --- Guardrail errors ---
    #[error("{0}")]
    ForbiddenWordDetected(#[from] ForbiddenWordDetected),

    // --- Data errors ---
    #[error("Data inconsistency: {0}")]
    DataInconsistency(String),

    #[error("Resource budget exceeded: {0}")]
    BudgetExceeded(String),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for an [`Error::InvalidConfig`].
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Whether the caller may retry the failed operation.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Provider(e) => e.is_transient(),
            Error::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid provider configuration: {0}")]
    InvalidConfig(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Batch {batch_id} ended with status {status}")]
    BatchFailed { batch_id: String, status: String },

    #[error("Batch file error: {0}")]
    BatchFile(String),
}

impl ProviderError {
    /// Transient upstream failures: the caller decides whether to retry.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. }
            | ProviderError::Timeout(_)
            | ProviderError::Network(_)
            | ProviderError::StreamInterrupted(_) => true,
            ProviderError::ApiError { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Embedding dimension mismatch in collection '{collection}': expected {expected}, got {actual}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store call timed out: {0}")]
    Timeout(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::EmbeddingFailed(_))
    }
}

/// Raised by the semantic guardrail when generated text lands close to a
/// forbidden word. Carries the RED result that should be shown to the user.
#[derive(Debug, Clone, Error)]
#[error("Forbidden word detected: {word}")]
pub struct ForbiddenWordDetected {
    /// The forbidden word that was hit.
    pub word: String,
    /// Cosine distance between the checked text and the word.
    pub distance: f32,
    /// The RED result (reason `FORBIDDEN_WORD_DETECTED`).
    pub result: SemanticGuardResult,
}
