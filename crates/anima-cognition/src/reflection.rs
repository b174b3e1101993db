//! Reflection engine: a periodic look back over recent experience that
//! counts open contradictions, distils an insight, and nudges the
//! self-model drift check.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use anima_bus_core::{topics, EventBus};
use anima_llm_gateway::LlmClient;
use anima_store::atomic::{atomic_write_json, load_json_or_default};
use anima_store::EpisodicStore;
use anima_types::{now_iso, Outcome};

use crate::{BeliefSystem, CognitionContext, OptionalStep, SelfModel, SharedConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReflectionEntry {
    tick: u64,
    at: String,
    insight: String,
    episodes_reviewed: usize,
    failures: usize,
    contradictions: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ReflectionState {
    entries: Vec<ReflectionEntry>,
    last_run_tick: u64,
}

const MAX_ENTRIES: usize = 30;

/// Periodic reviewer, persisted to `reflection_log.json`.
pub struct ReflectionEngine {
    path: PathBuf,
    llm: Arc<dyn LlmClient>,
    bus: Arc<EventBus>,
    episodic: Arc<EpisodicStore>,
    beliefs: Arc<BeliefSystem>,
    self_model: Arc<SelfModel>,
    config: SharedConfig,
    state: RwLock<ReflectionState>,
}

impl ReflectionEngine {
    /// Load (or default) the persisted log.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        memory_dir: &Path,
        llm: Arc<dyn LlmClient>,
        bus: Arc<EventBus>,
        episodic: Arc<EpisodicStore>,
        beliefs: Arc<BeliefSystem>,
        self_model: Arc<SelfModel>,
        config: SharedConfig,
    ) -> Self {
        let path = memory_dir.join("reflection_log.json");
        let state = load_json_or_default(&path);
        Self { path, llm, bus, episodic, beliefs, self_model, config, state: RwLock::new(state) }
    }

    fn persist(&self, state: &ReflectionState) {
        if let Err(e) = atomic_write_json(&self.path, state) {
            tracing::error!(error = %e, "failed to persist reflection log");
        }
    }

    /// Read model for introspection.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.read();
        json!({"entries": state.entries, "last_run_tick": state.last_run_tick})
    }
}

#[async_trait]
impl OptionalStep for ReflectionEngine {
    fn name(&self) -> &'static str {
        "reflection"
    }

    fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(40)
    }

    async fn run(&self, tick: u64, _ctx: &CognitionContext) -> anyhow::Result<serde_json::Value> {
        let cadence = self.config.read().reflection.every_n_ticks.max(1);
        if tick % cadence != 0 {
            return Ok(json!({"reflected": false, "reason": "not due"}));
        }

        let recent = self.episodic.get_recent(30).await;
        let failures = recent.iter().filter(|e| e.outcome == Outcome::Failure).count();
        let contradictions = self.beliefs.contradictions_resolved();

        let episodes_block = recent
            .iter()
            .take(15)
            .map(|e| {
                let desc: String = e.description.chars().take(100).collect();
                format!("- [{} | {}] {desc}", e.event_type, e.outcome)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Recent experience ({} episodes, {failures} failures):\n{episodes_block}\n\n\
             In ONE sentence: what should change about how you operate?",
            recent.len()
        );
        let insight = self
            .llm
            .chat(&prompt, "You review your own recent behaviour. One sentence.")
            .await;
        let insight = insight.trim().to_string();

        {
            let mut state = self.state.write();
            state.entries.push(ReflectionEntry {
                tick,
                at: now_iso(),
                insight: insight.clone(),
                episodes_reviewed: recent.len(),
                failures,
                contradictions,
            });
            while state.entries.len() > MAX_ENTRIES {
                state.entries.remove(0);
            }
            state.last_run_tick = tick;
            self.persist(&state);
        }

        self.self_model.check_drift().await;

        info!(tick, failures, contradictions, "reflection completed");
        self.bus
            .publish(
                topics::REFLECTION_COMPLETED,
                json!({"tick": tick, "contradictions": contradictions}),
            )
            .await;
        Ok(json!({"reflected": true, "failures": failures, "contradictions": contradictions}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anima_types::Config;

    struct ScriptedLlm;

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(&self, _prompt: &str, _system: &str) -> String {
            "Stop repeating the observe action when nothing changes.".to_string()
        }
        async fn embed(&self, _text: &str) -> Vec<f32> {
            Vec::new()
        }
        async fn is_available(&self) -> bool {
            true
        }
        fn reset_tick_counter(&self) {}
        fn calls_this_tick(&self) -> u32 {
            0
        }
    }

    async fn engine(dir: &Path, bus: Arc<EventBus>) -> ReflectionEngine {
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm);
        let episodic = Arc::new(EpisodicStore::in_memory().await.unwrap());
        episodic.add_episode("heavy_tick.observe", "tick", Outcome::Failure, None).await;
        ReflectionEngine::new(
            dir,
            Arc::clone(&llm),
            Arc::clone(&bus),
            episodic,
            Arc::new(BeliefSystem::new(dir, Arc::clone(&llm))),
            Arc::new(SelfModel::new(dir, Arc::clone(&bus))),
            Arc::new(parking_lot::RwLock::new(Config::default())),
        )
    }

    #[tokio::test]
    async fn reflects_on_cadence_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let reflection = engine(dir.path(), Arc::clone(&bus)).await;
        let mut tap = bus.tap();

        // Default cadence is 12.
        let result = reflection.run(12, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["reflected"], true);
        assert_eq!(result["failures"], 1);

        let event = tap.recv().await.unwrap();
        assert_eq!(event.topic, topics::REFLECTION_COMPLETED);
        assert_eq!(event.payload["tick"], 12);

        let snapshot = reflection.snapshot();
        assert_eq!(snapshot["entries"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn off_cadence_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let reflection = engine(dir.path(), Arc::new(EventBus::default())).await;
        let result = reflection.run(13, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["reflected"], false);
    }
}
