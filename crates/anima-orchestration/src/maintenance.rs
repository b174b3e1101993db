//! Periodic maintenance behind the optional-step contract: weekly strategy
//! re-weighting, vector-store cleanup, and episodic archival, each on its
//! own cadence.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use anima_cognition::{CognitionContext, OptionalStep, SharedConfig, StrategyEngine};
use anima_store::{EpisodicStore, VectorStore};

/// Vector cleanup runs every this many heavy ticks (roughly weekly at the
/// default cadence).
pub const VECTOR_CLEANUP_TICKS: u64 = 1000;

/// Episodic archival runs every this many heavy ticks (roughly daily).
pub const ARCHIVE_TICKS: u64 = 2880;

/// Storage and strategy upkeep.
pub struct MaintenanceStep {
    episodic: Arc<EpisodicStore>,
    vectors: Arc<VectorStore>,
    strategy: Arc<StrategyEngine>,
    config: SharedConfig,
}

impl MaintenanceStep {
    /// Wrap the stores and the strategy engine.
    pub fn new(
        episodic: Arc<EpisodicStore>,
        vectors: Arc<VectorStore>,
        strategy: Arc<StrategyEngine>,
        config: SharedConfig,
    ) -> Self {
        Self { episodic, vectors, strategy, config }
    }

    async fn dominant_recent_action(&self) -> String {
        let recent = self.episodic.get_recent(50).await;
        let mut counts = std::collections::BTreeMap::new();
        for episode in recent {
            if let Some(action) = episode.event_type.strip_prefix("heavy_tick.") {
                *counts.entry(action.to_string()).or_insert(0u32) += 1;
            }
        }
        counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(action, _)| action)
            .unwrap_or_else(|| "observe".to_string())
    }
}

#[async_trait]
impl OptionalStep for MaintenanceStep {
    fn name(&self) -> &'static str {
        "maintenance"
    }

    fn llm_cost(&self) -> u32 {
        0
    }

    fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(60)
    }

    async fn run(&self, tick: u64, _ctx: &CognitionContext) -> anyhow::Result<serde_json::Value> {
        let mut performed = Vec::new();

        if self.strategy.should_update_weekly() {
            let dominant = self.dominant_recent_action().await;
            self.strategy.update_weekly(&dominant).await;
            performed.push("weekly_strategy".to_string());
        }

        if tick > 0 && tick % VECTOR_CLEANUP_TICKS == 0 {
            let days = self.config.read().memory.vector_retention_days as i64;
            let deleted = self.vectors.cleanup(days).await;
            performed.push(format!("vector_cleanup:{deleted}"));
        }

        if tick > 0 && tick % ARCHIVE_TICKS == 0 {
            let days = self.config.read().memory.episode_retention_days as i64;
            let archived = self.episodic.archive_old(days).await;
            performed.push(format!("episodic_archive:{archived}"));
        }

        Ok(json!({"performed": performed}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anima_bus_core::EventBus;
    use anima_types::Config;

    async fn fixture(dir: &std::path::Path) -> MaintenanceStep {
        MaintenanceStep::new(
            Arc::new(EpisodicStore::in_memory().await.unwrap()),
            Arc::new(VectorStore::in_memory(8).await.unwrap()),
            Arc::new(StrategyEngine::new(dir, Arc::new(EventBus::default()))),
            Arc::new(parking_lot::RwLock::new(Config::default())),
        )
    }

    #[tokio::test]
    async fn ordinary_tick_performs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let step = fixture(dir.path()).await;
        let result = step.run(17, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["performed"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn cleanup_ticks_touch_the_vector_store() {
        let dir = tempfile::tempdir().unwrap();
        let step = fixture(dir.path()).await;
        let result = step.run(VECTOR_CLEANUP_TICKS, &CognitionContext::default()).await.unwrap();
        let performed = result["performed"].as_array().unwrap();
        assert!(performed.iter().any(|p| p.as_str().unwrap().starts_with("vector_cleanup")));
    }
}
