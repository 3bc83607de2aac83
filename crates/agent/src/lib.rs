//! The turn engine.
//!
//! A conversation runs in turns:
//!
//! 1. **Schedule**: [`TurnScheduler`] projects who acts next from the virtual
//!    clocks and materializes a window of pending actions
//! 2. **Reframe**: [`Reframer`] rewrites the recent dialogue through the
//!    acting entity's thinking engine
//! 3. **Guard**: the [`GuardPipeline`](rondo_guard::GuardPipeline) screens the
//!    reframed context
//! 4. **Speak**: [`Orchestrator`] generates the reply, persists it under the
//!    action, and advances the clock
//!
//! [`ChatSession`] is the one-to-one variant over a user's chat log.

pub mod chat;
pub mod engines;
pub mod evaluation;
pub mod orchestrator;
pub mod reframer;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use chat::{ChatReply, ChatSession};
pub use engines::{Capability, EngineRegistry, ThinkingEngine, builtin_engines};
pub use evaluation::{Evaluation, SessionEvaluator, is_session_end};
pub use orchestrator::{Orchestrator, TOPIC_ENTITY_ID, TurnOutcome};
pub use reframer::Reframer;
pub use scheduler::{ScheduledTurn, TurnScheduler, calculate_next_turn_increment};
