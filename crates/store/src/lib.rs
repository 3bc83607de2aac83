//! Storage backends for Rondo.
//!
//! Two families live here:
//!
//! - Vector stores implementing `rondo_core::VectorStore` ([`InMemoryVectorStore`],
//!   [`SqliteVectorStore`]) plus [`RagCollection`], the text-level view that
//!   pairs a store with an embedder.
//! - Conversation stores implementing `rondo_core::ConversationStore`
//!   ([`InMemoryConversationStore`], [`SqliteConversationStore`]).

pub mod collection;
pub mod conversation;
pub mod hashing;
pub mod in_memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod vector;

pub use collection::RagCollection;
pub use conversation::InMemoryConversationStore;
#[cfg(feature = "sqlite")]
pub use conversation::SqliteConversationStore;
pub use hashing::HashingEmbedder;
pub use in_memory::InMemoryVectorStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteVectorStore;

/// Collection holding one document per forbidden word.
pub const FORBIDDEN_WORDS_COLLECTION: &str = "forbidden_words";

/// Collection queried for RAG hits.
pub const KNOWLEDGE_COLLECTION: &str = "knowledge";
