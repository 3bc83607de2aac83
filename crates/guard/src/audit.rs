//! Guard audit log: one structured entry per guard decision.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::static_rules::BlockCategory;

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
    /// Entity whose turn (or chat user whose message) was checked.
    pub actor: String,
    /// Short preview of the checked text.
    pub target: String,
    pub outcome: AuditOutcome,
    pub details: Option<String>,
}

/// Which guard produced the decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Forbidden substring, length, or empty input
    StaticRule { category: BlockCategory },
    /// External moderation classifier
    Moderation,
    /// Semantic guardrail (RAG hit, forbidden-word similarity)
    Semantic { reason: Option<String> },
    /// The thinking engine declined the input
    EngineDeclined { thinking_type: String },
}

/// Outcome of an audited decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Blocked,
    /// The guard call failed and the decision fell back to allow
    FailedOpen,
}

/// Where audit entries are written besides memory.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

const TARGET_PREVIEW_CHARS: usize = 40;

fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(TARGET_PREVIEW_CHARS).collect();
    if chars.next().is_some() { format!("{head}…") } else { head }
}

/// Entries kept in memory by default; older ones are dropped first.
pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

/// Audit logger fanning out to sinks, keeping the most recent entries in
/// memory.
pub struct AuditLogger {
    entries: std::sync::Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
    sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("entry_count", &self.count())
            .field("capacity", &self.capacity)
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLogger {
    pub fn new() -> Self {
        Self::with_sinks(Vec::new())
    }

    pub fn with_sinks(sinks: Vec<Box<dyn AuditSink>>) -> Self {
        Self {
            entries: std::sync::Mutex::new(VecDeque::new()),
            capacity: DEFAULT_AUDIT_CAPACITY,
            sinks,
        }
    }

    /// Keep at most `capacity` entries in memory; `0` keeps none and leaves
    /// the record to the sinks.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Logger that mirrors every entry to `tracing`.
    pub fn with_tracing() -> Self {
        Self::with_sinks(vec![Box::new(TracingSink)])
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditEntry>> {
        // A panic while holding the lock cannot leave a half-pushed entry.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a guard decision.
    pub fn log(&self, event: AuditEvent, actor: &str, text: &str, outcome: AuditOutcome, details: Option<String>) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            event,
            actor: actor.into(),
            target: preview(text),
            outcome,
            details,
        };

        if self.capacity > 0 {
            let mut entries = self.lock();
            while entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }
        for sink in &self.sinks {
            sink.record(&entry);
        }
    }

    /// Retained entries, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn entries_by_outcome(&self, outcome: &AuditOutcome) -> Vec<AuditEntry> {
        self.lock()
            .iter()
            .filter(|e| &e.outcome == outcome)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }
}

/// Sink that logs entries via `tracing`; blocks at `warn`, the rest at `info`.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, entry: &AuditEntry) {
        match entry.outcome {
            AuditOutcome::Blocked => tracing::warn!(
                event = ?entry.event,
                actor = %entry.actor,
                target = %entry.target,
                details = ?entry.details,
                "GUARD BLOCK"
            ),
            _ => tracing::info!(
                event = ?entry.event,
                actor = %entry.actor,
                target = %entry.target,
                outcome = ?entry.outcome,
                details = ?entry.details,
                "GUARD"
            ),
        }
    }
}
