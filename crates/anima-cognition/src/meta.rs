//! Meta-cognition: decision-quality analysis over the recent decision
//! episodes, kept as short insights that feed back into prompts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use anima_llm_gateway::LlmClient;
use anima_store::atomic::{atomic_write_json, load_json_or_default};
use anima_store::EpisodicStore;
use anima_types::{now_iso, Outcome};

use crate::{CognitionContext, OptionalStep};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct MetaState {
    insights: Vec<String>,
    last_success_rate: f64,
    updated_at: String,
}

/// Insights kept for prompting and introspection.
const MAX_INSIGHTS: usize = 10;

/// Decision-quality analyser, persisted to `meta_cognition.json`.
pub struct MetaCognition {
    path: PathBuf,
    llm: Arc<dyn LlmClient>,
    episodic: Arc<EpisodicStore>,
    state: RwLock<MetaState>,
}

impl MetaCognition {
    /// Load (or default) persisted insights.
    pub fn new(memory_dir: &Path, llm: Arc<dyn LlmClient>, episodic: Arc<EpisodicStore>) -> Self {
        let path = memory_dir.join("meta_cognition.json");
        let state = load_json_or_default(&path);
        Self { path, llm, episodic, state: RwLock::new(state) }
    }

    fn persist(&self, state: &MetaState) {
        if let Err(e) = atomic_write_json(&self.path, state) {
            tracing::error!(error = %e, "failed to persist meta-cognition");
        }
    }

    /// Prompt fragment with the latest insights.
    pub fn prompt_context(&self, top_n: usize) -> String {
        let state = self.state.read();
        if state.insights.is_empty() {
            return String::new();
        }
        let lines = state
            .insights
            .iter()
            .rev()
            .take(top_n)
            .map(|i| format!("  - {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        format!("Meta-cognition:\n{lines}")
    }

    /// Read model for introspection.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.read();
        json!({
            "insights": state.insights,
            "last_success_rate": state.last_success_rate,
            "updated_at": state.updated_at,
        })
    }
}

#[async_trait]
impl OptionalStep for MetaCognition {
    fn name(&self) -> &'static str {
        "meta_cognition"
    }

    fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(25)
    }

    async fn run(&self, _tick: u64, _ctx: &CognitionContext) -> anyhow::Result<serde_json::Value> {
        let recent = self.episodic.get_recent(30).await;
        let decisions: Vec<_> = recent
            .iter()
            .filter(|e| e.event_type.starts_with("heavy_tick."))
            .collect();
        if decisions.len() < 3 {
            return Ok(json!({"analyzed": false, "reason": "too few decisions"}));
        }

        let successes = decisions.iter().filter(|e| e.outcome == Outcome::Success).count();
        let success_rate = successes as f64 / decisions.len() as f64;
        let mut action_counts = std::collections::BTreeMap::new();
        for episode in &decisions {
            *action_counts.entry(episode.event_type.clone()).or_insert(0u32) += 1;
        }
        let dominant = action_counts
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(action, _)| action.clone())
            .unwrap_or_default();

        let prompt = format!(
            "Over your last {} decisions the success rate was {:.0}% and the most common \
             action was {dominant}. Formulate ONE short insight about your decision quality \
             (1 sentence). Answer with the insight only.",
            decisions.len(),
            success_rate * 100.0
        );
        let insight = self
            .llm
            .chat(&prompt, "You analyse your own decisions dispassionately.")
            .await;
        let insight = insight.trim().to_string();

        let mut state = self.state.write();
        state.last_success_rate = (success_rate * 1000.0).round() / 1000.0;
        if !insight.is_empty() && !state.insights.contains(&insight) {
            state.insights.push(insight);
            while state.insights.len() > MAX_INSIGHTS {
                state.insights.remove(0);
            }
        }
        state.updated_at = now_iso();
        self.persist(&state);
        debug!(success_rate, "decision quality analysed");
        Ok(json!({"analyzed": true, "success_rate": state.last_success_rate}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedLlm {
        reply: String,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(&self, _prompt: &str, _system: &str) -> String {
            self.reply.clone()
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
    async fn needs_enough_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let episodic = Arc::new(EpisodicStore::in_memory().await.unwrap());
        let meta = MetaCognition::new(
            dir.path(),
            Arc::new(ScriptedLlm { reply: "too eager".to_string() }),
            episodic,
        );
        let result = meta.run(1, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["analyzed"], false);
    }

    #[tokio::test]
    async fn computes_success_rate_and_stores_insight() {
        let dir = tempfile::tempdir().unwrap();
        let episodic = Arc::new(EpisodicStore::in_memory().await.unwrap());
        for i in 0..4 {
            let outcome = if i == 0 { Outcome::Failure } else { Outcome::Success };
            episodic
                .add_episode("heavy_tick.observe", &format!("tick {i}"), outcome, None)
                .await;
        }
        let meta = MetaCognition::new(
            dir.path(),
            Arc::new(ScriptedLlm { reply: "I observe too much and write too little.".to_string() }),
            episodic,
        );

        let result = meta.run(5, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["analyzed"], true);
        assert_eq!(result["success_rate"], 0.75);
        assert!(meta.prompt_context(2).contains("observe too much"));
    }

    #[tokio::test]
    async fn duplicate_insights_are_not_stacked() {
        let dir = tempfile::tempdir().unwrap();
        let episodic = Arc::new(EpisodicStore::in_memory().await.unwrap());
        for i in 0..4 {
            episodic
                .add_episode("heavy_tick.write", &format!("tick {i}"), Outcome::Success, None)
                .await;
        }
        let meta = MetaCognition::new(
            dir.path(),
            Arc::new(ScriptedLlm { reply: "same thought".to_string() }),
            episodic,
        );
        meta.run(1, &CognitionContext::default()).await.unwrap();
        meta.run(2, &CognitionContext::default()).await.unwrap();
        assert_eq!(meta.snapshot()["insights"].as_array().unwrap().len(), 1);
    }
}
