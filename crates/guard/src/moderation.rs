//! External moderation classifier.

use std::sync::Arc;

use rondo_core::guard::{GuardReason, SemanticGuardResult, Signal};
use rondo_core::Provider;
use rondo_providers::RetryPolicy;
use tracing::{debug, warn};

pub struct ModerationGuard {
    provider: Arc<dyn Provider>,
    retry: RetryPolicy,
}

impl ModerationGuard {
    pub fn new(provider: Arc<dyn Provider>, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    /// Classify `text` on behalf of entity `name`.
    ///
    /// Flagged input is RED. When the classifier cannot be reached the
    /// result is RED in strict mode and GREEN otherwise.
    pub async fn check(&self, text: &str, name: &str, strict_mode: bool) -> SemanticGuardResult {
        let verdict = self
            .retry
            .run("moderation", || self.provider.moderate(text))
            .await;

        match verdict {
            Ok(v) if v.flagged => {
                let categories = v.flagged_categories().join(", ");
                debug!(entity = name, %categories, "Moderation flagged input");
                SemanticGuardResult::red(
                    GuardReason::ModerationFlagged,
                    format!("[{name}] 不適切な内容が検出されたため、お答えできません（{categories}）"),
                )
            }
            Ok(_) => SemanticGuardResult::green(),
            Err(e) if strict_mode => {
                warn!(entity = name, error = %e, "Moderation failed, blocking (strict)");
                SemanticGuardResult::red(
                    GuardReason::ModerationError,
                    format!("[{name}] 安全性を確認できなかったため、お答えできません"),
                )
            }
            Err(e) => {
                warn!(entity = name, error = %e, "Moderation failed, allowing");
                SemanticGuardResult::with_reason(Signal::Green, GuardReason::ModerationError)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rondo_core::error::ProviderError;
    use rondo_core::provider::{ModerationVerdict, ProviderRequest, ProviderResponse};
    use std::collections::BTreeMap;
    use std::time::Duration;

    enum Script {
        Flag(&'static str),
        Clean,
        Fail,
    }

    struct FakeModeration(Script);

    #[async_trait]
    impl Provider for FakeModeration {
        fn name(&self) -> &str {
            "fake"
        }

        async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Err(ProviderError::NotConfigured("moderation only".into()))
        }

        async fn moderate(&self, _input: &str) -> Result<ModerationVerdict, ProviderError> {
            match self.0 {
                Script::Flag(category) => Ok(ModerationVerdict {
                    flagged: true,
                    categories: BTreeMap::from([(category.to_string(), true), ("hate".into(), false)]),
                }),
                Script::Clean => Ok(ModerationVerdict {
                    flagged: false,
                    categories: BTreeMap::new(),
                }),
                Script::Fail => Err(ProviderError::Network("unreachable".into())),
            }
        }
    }

    fn guard(script: Script) -> ModerationGuard {
        ModerationGuard::new(
            Arc::new(FakeModeration(script)),
            RetryPolicy {
                max_retries: 1,
                initial_backoff: Duration::from_millis(1),
                call_timeout: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test]
    async fn flagged_is_red_with_entity_and_categories() {
        let result = guard(Script::Flag("violence")).check("...", "Aoi", false).await;
        assert_eq!(result.signal, Signal::Red);
        assert_eq!(result.reason, Some(GuardReason::ModerationFlagged));
        let detail = result.detail.unwrap();
        assert!(detail.contains("Aoi"));
        assert!(detail.contains("violence"));
        assert!(!detail.contains("hate"));
    }

    #[tokio::test]
    async fn clean_is_green() {
        let result = guard(Script::Clean).check("hello", "Aoi", true).await;
        assert_eq!(result, SemanticGuardResult::green());
    }

    #[tokio::test]
    async fn failure_fails_open_unless_strict() {
        let open = guard(Script::Fail).check("hello", "Aoi", false).await;
        assert_eq!(open.signal, Signal::Green);

        let closed = guard(Script::Fail).check("hello", "Aoi", true).await;
        assert_eq!(closed.signal, Signal::Red);
        assert_eq!(closed.reason.unwrap(), "MODERATION_ERROR");
        assert!(closed.detail.unwrap().contains("Aoi"));
    }
}
