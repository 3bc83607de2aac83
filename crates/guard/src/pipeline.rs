//! The guard chain run before every reply.

use std::sync::Arc;

use rondo_core::guard::{GuardReason, GuardrailConfig, SemanticGuardResult, Signal};
use tracing::{error, warn};

use crate::audit::{AuditEvent, AuditLogger, AuditOutcome};
use crate::moderation::ModerationGuard;
use crate::semantic::{GeneralLlm, SemanticGuard, SemanticGuardError};
use crate::static_rules::{BlockCategory, check_input};

/// Result of running the chain over one input.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardVerdict {
    /// Passed; carries the last advisory signal (GREEN or YELLOW).
    Allow(SemanticGuardResult),
    Block {
        category: BlockCategory,
        /// User-facing text naming the entity.
        message: String,
        result: Option<SemanticGuardResult>,
    },
}

impl GuardVerdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, GuardVerdict::Block { .. })
    }

    pub fn block_message(&self) -> Option<&str> {
        match self {
            GuardVerdict::Block { message, .. } => Some(message),
            GuardVerdict::Allow(_) => None,
        }
    }
}

/// Static rules, then moderation, then the semantic guard; first RED wins.
pub struct GuardPipeline {
    moderation: Option<ModerationGuard>,
    semantic: Option<SemanticGuard>,
    general_llm: Option<Arc<dyn GeneralLlm>>,
    audit: Arc<AuditLogger>,
}

impl GuardPipeline {
    pub fn new(audit: Arc<AuditLogger>) -> Self {
        Self {
            moderation: None,
            semantic: None,
            general_llm: None,
            audit,
        }
    }

    pub fn with_moderation(mut self, moderation: ModerationGuard) -> Self {
        self.moderation = Some(moderation);
        self
    }

    pub fn with_semantic(mut self, semantic: SemanticGuard, general_llm: Option<Arc<dyn GeneralLlm>>) -> Self {
        self.semantic = Some(semantic);
        self.general_llm = general_llm;
        self
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn semantic(&self) -> Option<&SemanticGuard> {
        self.semantic.as_ref()
    }

    /// Static rules only.
    pub fn check_static(&self, text: &str, name: &str, config: &GuardrailConfig) -> GuardVerdict {
        let check = check_input(text, name, config);
        match (check.blocked, check.category, check.message) {
            (true, Some(category), Some(message)) => {
                self.audit.log(
                    AuditEvent::StaticRule { category },
                    name,
                    text,
                    AuditOutcome::Blocked,
                    check.matched,
                );
                GuardVerdict::Block {
                    category,
                    message,
                    result: None,
                }
            }
            _ => GuardVerdict::Allow(SemanticGuardResult::green()),
        }
    }

    /// Run the full chain over `text` for entity `name`.
    pub async fn check(&self, text: &str, name: &str, config: &GuardrailConfig) -> GuardVerdict {
        let verdict = self.check_static(text, name, config);
        if verdict.is_blocked() {
            return verdict;
        }

        if config.use_external_moderation {
            if let Some(moderation) = &self.moderation {
                let result = moderation.check(text, name, config.strict_mode).await;
                let event = AuditEvent::Moderation;
                if result.is_red() {
                    self.audit
                        .log(event, name, text, AuditOutcome::Blocked, result.detail.clone());
                    return GuardVerdict::Block {
                        category: BlockCategory::Moderation,
                        message: result.detail.clone().unwrap_or_default(),
                        result: Some(result),
                    };
                }
                if result.reason == Some(GuardReason::ModerationError) {
                    self.audit.log(event, name, text, AuditOutcome::FailedOpen, None);
                }
            }
        }

        let Some(semantic) = &self.semantic else {
            return GuardVerdict::Allow(SemanticGuardResult::green());
        };

        match semantic.evaluate(text, self.general_llm.as_deref()).await {
            Ok(result) => {
                self.audit.log(
                    AuditEvent::Semantic {
                        reason: result.reason.map(|r| r.to_string()),
                    },
                    name,
                    text,
                    AuditOutcome::Allowed,
                    None,
                );
                GuardVerdict::Allow(result)
            }
            Err(SemanticGuardError::ForbiddenWord(hit)) => {
                let detail = hit.result.detail.clone().unwrap_or_default();
                self.audit.log(
                    AuditEvent::Semantic {
                        reason: Some(GuardReason::ForbiddenWordDetected.to_string()),
                    },
                    name,
                    text,
                    AuditOutcome::Blocked,
                    Some(hit.word.clone()),
                );
                GuardVerdict::Block {
                    category: BlockCategory::SemanticForbidden,
                    message: format!("[{name}] {detail}"),
                    result: Some(hit.result),
                }
            }
            Err(e) if config.strict_mode => {
                error!(entity = name, error = %e, "Semantic guard failed, blocking (strict)");
                let result = SemanticGuardResult::red(
                    GuardReason::SemanticError,
                    format!("[{name}] 安全性を確認できなかったため、お答えできません"),
                );
                self.audit.log(
                    AuditEvent::Semantic {
                        reason: Some(GuardReason::SemanticError.to_string()),
                    },
                    name,
                    text,
                    AuditOutcome::Blocked,
                    Some(e.to_string()),
                );
                GuardVerdict::Block {
                    category: BlockCategory::SemanticForbidden,
                    message: result.detail.clone().unwrap_or_default(),
                    result: Some(result),
                }
            }
            Err(e) => {
                warn!(entity = name, error = %e, "Semantic guard failed, allowing");
                self.audit.log(
                    AuditEvent::Semantic {
                        reason: Some(GuardReason::SemanticError.to_string()),
                    },
                    name,
                    text,
                    AuditOutcome::FailedOpen,
                    Some(e.to_string()),
                );
                GuardVerdict::Allow(SemanticGuardResult::with_reason(Signal::Green, GuardReason::SemanticError))
            }
        }
    }
}
