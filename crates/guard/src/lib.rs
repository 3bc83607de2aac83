//! # Rondo Guard
//!
//! Input guardrails applied before an entity replies:
//!
//! - [`static_rules`]: forbidden substrings, maximum length, non-empty
//! - [`moderation`]: the external moderation classifier
//! - [`semantic`]: RAG-hit and forbidden-word similarity checks
//! - [`pipeline`]: the chain that runs them in order
//! - [`audit`]: a structured record of every decision

pub mod audit;
pub mod moderation;
pub mod pipeline;
pub mod semantic;
pub mod static_rules;

pub use audit::{AuditEntry, AuditEvent, AuditLogger, AuditOutcome, AuditSink, TracingSink};
pub use moderation::ModerationGuard;
pub use pipeline::{GuardPipeline, GuardVerdict};
pub use semantic::{GeneralLlm, SemanticGuard, SemanticGuardError};
pub use static_rules::{BlockCategory, GuardrailCheck, check_input};
