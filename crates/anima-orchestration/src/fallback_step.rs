//! The fallback wrapper around critical steps: run with a timeout, serve
//! the (possibly stale) cached artifact on any failure path, and report
//! the outcome as a [`StepOutcome`] for the orchestrator to match on.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use anima_resilience::FallbackCache;
use anima_types::StepOutcome;

/// Policy wrapper owning the cache handle and the refresh TTL.
pub struct FallbackStrategy {
    cache: Arc<FallbackCache>,
    ttl: Duration,
}

impl FallbackStrategy {
    /// Wrap a cache; successful step outputs are re-cached with `ttl`.
    pub fn new(cache: Arc<FallbackCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// The wrapped cache (for default registration and introspection).
    pub fn cache(&self) -> &Arc<FallbackCache> {
        &self.cache
    }

    /// Execute a step under `timeout`. Success refreshes the cache entry
    /// under the step's name; exception, timeout, or empty output falls
    /// through to the cache (stale entries allowed, with a warning).
    /// When no entry exists either, the outcome is `Failed` and the caller
    /// aborts the cycle.
    pub async fn execute<Fut>(&self, key: &str, timeout: Duration, step: Fut) -> StepOutcome
    where
        Fut: std::future::Future<Output = anyhow::Result<Value>>,
    {
        let reason = match tokio::time::timeout(timeout, step).await {
            Ok(Ok(value)) => {
                self.cache.set_with_ttl(key, value.clone(), self.ttl);
                return StepOutcome::Success { value };
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => format!("timeout after {:.0}s", timeout.as_secs_f64()),
        };

        match self.cache.get(key, None, true) {
            Some(value) => {
                warn!(step = key, reason = %reason, "serving fallback for failed step");
                StepOutcome::FallbackUsed { value, reason }
            }
            None => StepOutcome::Failed { reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strategy() -> FallbackStrategy {
        FallbackStrategy::new(
            Arc::new(FallbackCache::new(Duration::from_secs(300))),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn success_caches_and_returns_value() {
        let strategy = strategy();
        let outcome = strategy
            .execute("monologue", Duration::from_secs(1), async { Ok(json!("fresh thought")) })
            .await;
        assert_eq!(outcome, StepOutcome::Success { value: json!("fresh thought") });
        // The cached value now backs a failing run.
        let outcome = strategy
            .execute("monologue", Duration::from_secs(1), async {
                anyhow::bail!("LLM returned empty")
            })
            .await;
        assert!(matches!(outcome, StepOutcome::FallbackUsed { value, .. } if value == json!("fresh thought")));
    }

    #[tokio::test]
    async fn failure_with_no_cache_is_failed() {
        let strategy = strategy();
        let outcome = strategy
            .execute("goal", Duration::from_secs(1), async { anyhow::bail!("no backend") })
            .await;
        assert!(outcome.is_failed());
    }

    #[tokio::test]
    async fn registered_default_backs_first_failure() {
        let strategy = strategy();
        strategy.cache().set_default("goal", json!({"action_type": "observe"}));
        let outcome = strategy
            .execute("goal", Duration::from_secs(1), async { anyhow::bail!("down") })
            .await;
        // set_default is only consulted by get() when no entry exists; the
        // wrapper asks with no explicit default, so the registered one wins.
        assert!(matches!(outcome, StepOutcome::FallbackUsed { value, .. } if value["action_type"] == "observe"));
    }

    #[tokio::test]
    async fn timeout_falls_through_to_cache() {
        let strategy = strategy();
        strategy.cache().set("action", json!({"success": true}));
        let outcome = strategy
            .execute("action", Duration::from_millis(20), async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!("never"))
            })
            .await;
        match outcome {
            StepOutcome::FallbackUsed { reason, .. } => assert!(reason.contains("timeout")),
            other => panic!("expected fallback, got {other:?}"),
        }
    }
}
