//! # Rondo Core
//!
//! Domain types, traits, and error definitions for the Rondo multi-agent
//! conversation turn engine. This crate has **no framework dependencies**: it
//! defines the model that every other crate implements against.
//!
//! ## Layout
//!
//! - [`message`]: chat messages exchanged with an LLM
//! - [`provider`]: the LLM backend trait (chat, streaming, embeddings,
//!   moderation, batch files)
//! - [`token`]: token counting and history trimming
//! - [`conversation`]: entities, timelines, action histories, messages
//! - [`guard`]: guard signals and per-entity guardrail configuration
//! - [`rag`]: documents, metadata filters, vector store and embedder traits
//! - [`store`]: the relational conversation store trait

pub mod conversation;
pub mod error;
pub mod guard;
pub mod message;
pub mod provider;
pub mod rag;
pub mod store;
pub mod token;

// Re-export key types at crate root for ergonomics
pub use conversation::{
    ActionHistory, ActionTimeline, ChatLog, Entity, EntityId, Message, NewChatLog, RagMaterial,
};
pub use error::{Error, ForbiddenWordDetected, ProviderError, Result, StoreError};
pub use guard::{GuardReason, GuardrailConfig, SemanticGuardResult, Signal};
pub use message::{ChatMessage, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk};
pub use rag::{Document, Embedder, MetadataFilter, ScoredDocument, VectorStore};
pub use store::{ConversationStore, NewEntity};
pub use token::{Tokenizer, TokenizerFamily};
