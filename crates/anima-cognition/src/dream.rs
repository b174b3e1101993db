//! Dream/consolidation: every few hours, recent episodes are compressed
//! into a single consolidated memory episode.

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
use anima_types::{now_epoch, now_iso, Outcome};

use crate::{CognitionContext, OptionalStep, SharedConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct DreamState {
    last_dream_at: f64,
    dreams: u64,
    last_summary: String,
}

/// Consolidation pass, persisted to `dream.json`.
pub struct DreamEngine {
    path: PathBuf,
    llm: Arc<dyn LlmClient>,
    bus: Arc<EventBus>,
    episodic: Arc<EpisodicStore>,
    config: SharedConfig,
    state: RwLock<DreamState>,
}

impl DreamEngine {
    /// Load (or default) the persisted dream clock.
    pub fn new(
        memory_dir: &Path,
        llm: Arc<dyn LlmClient>,
        bus: Arc<EventBus>,
        episodic: Arc<EpisodicStore>,
        config: SharedConfig,
    ) -> Self {
        let path = memory_dir.join("dream.json");
        let state = load_json_or_default(&path);
        Self { path, llm, bus, episodic, config, state: RwLock::new(state) }
    }

    fn persist(&self, state: &DreamState) {
        if let Err(e) = atomic_write_json(&self.path, state) {
            tracing::error!(error = %e, "failed to persist dream state");
        }
    }

    /// Read model for introspection.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.read();
        json!({
            "last_dream_at": state.last_dream_at,
            "dreams": state.dreams,
            "last_summary": state.last_summary,
        })
    }
}

#[async_trait]
impl OptionalStep for DreamEngine {
    fn name(&self) -> &'static str {
        "dream"
    }

    fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(45)
    }

    async fn run(&self, tick: u64, _ctx: &CognitionContext) -> anyhow::Result<serde_json::Value> {
        let interval_hours = self.config.read().dream.interval_hours;
        let due = {
            let state = self.state.read();
            now_epoch() - state.last_dream_at >= interval_hours * 3600.0
        };
        if !due {
            return Ok(json!({"dreamed": false, "reason": "not due"}));
        }

        let recent = self.episodic.get_recent(20).await;
        if recent.is_empty() {
            return Ok(json!({"dreamed": false, "reason": "nothing to consolidate"}));
        }
        let block = recent
            .iter()
            .map(|e| {
                let desc: String = e.description.chars().take(80).collect();
                format!("- [{}] {desc}", e.event_type)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "These are your recent memories:\n{block}\n\nConsolidate them into 2-3 sentences \
             capturing what mattered. First person, past tense."
        );
        let summary = self
            .llm
            .chat(&prompt, "You are consolidating memories during a dream pass.")
            .await;
        let summary = summary.trim().to_string();
        if summary.is_empty() {
            return Ok(json!({"dreamed": false, "reason": "llm unavailable"}));
        }

        let short: String = summary.chars().take(900).collect();
        self.episodic
            .add_episode(
                "dream.consolidation",
                &short,
                Outcome::Success,
                Some(json!({"tick": tick, "episodes": recent.len()})),
            )
            .await;

        {
            let mut state = self.state.write();
            state.last_dream_at = now_epoch();
            state.dreams += 1;
            state.last_summary = summary;
            self.persist(&state);
        }

        info!(tick, episodes = recent.len(), "dream consolidation complete");
        self.bus
            .publish(topics::DREAM_COMPLETED, json!({"tick": tick, "episodes": recent.len()}))
            .await;
        Ok(json!({"dreamed": true, "at": now_iso()}))
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
            "I spent the day watching files change and learned the rhythm of it.".to_string()
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

    #[tokio::test]
    async fn dreams_when_due_and_records_episode() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let episodic = Arc::new(EpisodicStore::in_memory().await.unwrap());
        episodic.add_episode("monologue", "first thought", Outcome::Unknown, None).await;

        let dream = DreamEngine::new(
            dir.path(),
            Arc::new(ScriptedLlm),
            Arc::clone(&bus),
            Arc::clone(&episodic),
            Arc::new(parking_lot::RwLock::new(Config::default())),
        );
        let mut tap = bus.tap();

        // last_dream_at defaults to 0, so the first run is due.
        let result = dream.run(10, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["dreamed"], true);

        let event = tap.recv().await.unwrap();
        assert_eq!(event.topic, topics::DREAM_COMPLETED);

        let consolidated = episodic.get_by_type("dream.consolidation", 1, None).await;
        assert_eq!(consolidated.len(), 1);

        // Immediately afterwards it is no longer due.
        let again = dream.run(11, &CognitionContext::default()).await.unwrap();
        assert_eq!(again["dreamed"], false);
    }
}
