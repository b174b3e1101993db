//! Strategy engine: layered now/weekly/long-term direction, and the goal
//! selection that turns a monologue plus context into a structured goal.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use anima_bus_core::{topics, EventBus};
use anima_llm_gateway::LlmClient;
use anima_store::atomic::{atomic_write_json, load_json_or_default};
use anima_types::{clamp_score, now_iso, GoalSpec};

use crate::json_util;

/// Hours between weekly strategy re-weightings.
const WEEKLY_HOURS: f64 = 168.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct StrategyState {
    now_goal: String,
    now_action: String,
    now_set_at: String,
    weekly_direction: String,
    weekly_updated_at: String,
    longterm_vector: BTreeMap<String, f64>,
}

impl Default for StrategyState {
    fn default() -> Self {
        Self {
            now_goal: String::new(),
            now_action: String::new(),
            now_set_at: String::new(),
            weekly_direction: "map the environment and build reliable habits".to_string(),
            weekly_updated_at: now_iso(),
            longterm_vector: BTreeMap::from([
                ("explore".to_string(), 0.4),
                ("create".to_string(), 0.2),
                ("social".to_string(), 0.2),
                ("reflect".to_string(), 0.2),
            ]),
        }
    }
}

/// Inputs to one goal selection, assembled by the orchestrator from the
/// component snapshots.
#[derive(Debug, Clone, Default)]
pub struct GoalInputs {
    /// This cycle's monologue.
    pub monologue: String,
    /// Semantic recall block from the vector store.
    pub semantic_context: String,
    /// Emotion fragment.
    pub emotion_context: String,
    /// Resume fragment when the previous goal was interrupted.
    pub resume_context: String,
    /// Attention-filtered episode block.
    pub attention_context: String,
    /// One-line attention focus summary.
    pub focus_summary: String,
    /// Current value mode.
    pub mode: String,
    /// Whitelisted shell commands, empty when the shell path is disabled.
    pub allowed_commands: Vec<String>,
    /// How often the same action was recently chosen (novelty pressure).
    pub recent_similar: i64,
}

/// Layered strategy, persisted to `strategy.json`.
pub struct StrategyEngine {
    path: PathBuf,
    bus: Arc<EventBus>,
    state: RwLock<StrategyState>,
}

impl StrategyEngine {
    /// Load (or default) the persisted strategy.
    pub fn new(memory_dir: &Path, bus: Arc<EventBus>) -> Self {
        let path = memory_dir.join("strategy.json");
        let state = load_json_or_default(&path);
        Self { path, bus, state: RwLock::new(state) }
    }

    fn persist(&self, state: &StrategyState) {
        if let Err(e) = atomic_write_json(&self.path, state) {
            tracing::error!(error = %e, "failed to persist strategy");
        }
    }

    /// Record the goal that was just selected.
    pub fn set_now(&self, goal: &str, action_type: &str) {
        let mut state = self.state.write();
        state.now_goal = goal.to_string();
        state.now_action = action_type.to_string();
        state.now_set_at = now_iso();
        self.persist(&state);
    }

    /// Whether the weekly layer is due for a refresh.
    pub fn should_update_weekly(&self) -> bool {
        let state = self.state.read();
        hours_since(&state.weekly_updated_at) >= WEEKLY_HOURS
    }

    /// Re-weight the long-term vector toward the dominant recent activity
    /// and refresh the weekly direction. Publishes `strategy.vector_changed`.
    pub async fn update_weekly(&self, dominant_activity: &str) {
        let vector = {
            let mut state = self.state.write();
            let key = match dominant_activity {
                "write" => "create",
                "reflect" => "reflect",
                "shell" | "analyze" => "explore",
                _ => "explore",
            };
            for (k, v) in state.longterm_vector.iter_mut() {
                let delta = if k == key { 0.05 } else { -0.02 };
                *v = clamp_score(*v + delta);
            }
            state.weekly_direction = format!("lean into {key} while keeping the rest alive");
            state.weekly_updated_at = now_iso();
            self.persist(&state);
            state.longterm_vector.clone()
        };
        info!(dominant_activity, "weekly strategy updated");
        self.bus
            .publish(topics::STRATEGY_VECTOR_CHANGED, json!({"vector": vector}))
            .await;
    }

    /// Prompt fragment describing all three layers.
    pub fn prompt_context(&self) -> String {
        let state = self.state.read();
        let vector = state
            .longterm_vector
            .iter()
            .map(|(k, v)| format!("{k}={v:.2}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut out = format!("Strategy: {}. Long-term: {vector}.", state.weekly_direction);
        if !state.now_goal.is_empty() {
            out.push_str(&format!(" Last goal: '{}' ({}).", state.now_goal, state.now_action));
        }
        out
    }

    /// Read model for introspection.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.read();
        json!({
            "now": {"goal": state.now_goal, "action": state.now_action, "set_at": state.now_set_at},
            "weekly": {"direction": state.weekly_direction, "updated_at": state.weekly_updated_at},
            "longterm": state.longterm_vector,
        })
    }

    /// Select the next goal. Builds the prompt from the inputs, asks the
    /// model for a structured record, and substitutes the safe default
    /// (observe, low risk) whenever no valid structure comes back.
    pub async fn select_goal(&self, llm: &dyn LlmClient, inputs: &GoalInputs) -> GoalSpec {
        let mut prompt = String::new();
        prompt.push_str(&inputs.monologue);
        prompt.push('\n');
        for block in [
            &inputs.semantic_context,
            &inputs.emotion_context,
            &inputs.resume_context,
        ] {
            if !block.is_empty() {
                prompt.push('\n');
                prompt.push_str(block);
                prompt.push('\n');
            }
        }
        if !inputs.attention_context.is_empty() {
            prompt.push_str(&format!("\nSignificant episodes:\n{}\n", inputs.attention_context));
        }
        prompt.push_str(&format!("\nCurrent mode: {}\n", inputs.mode));
        prompt.push_str(&format!("Strategy context: {}\n", self.prompt_context()));
        if inputs.recent_similar > 3 {
            prompt.push_str(
                "You have repeated the same kind of action several times recently; \
                 prefer something different.\n",
            );
        }
        if !inputs.allowed_commands.is_empty() {
            prompt.push_str(&format!(
                "\nTo actively probe the environment use action_type=\"shell\" and put the \
                 command in \"shell_command\". Available commands: {}\n",
                inputs.allowed_commands.join(", ")
            ));
        }
        prompt.push_str(
            "\nChoose ONE goal. JSON only:\n\
             {\"goal\": \"...\", \"reasoning\": \"...\", \
             \"action_type\": \"observe|analyze|write|reflect|shell\", \
             \"risk_level\": \"low|medium|high\", \"shell_command\": \"...\"}",
        );

        let mut system = "You are an autonomous digital being choosing its next goal. \
             Answer ONLY with valid JSON."
            .to_string();
        if !inputs.focus_summary.is_empty() {
            system.push('\n');
            system.push_str(&inputs.focus_summary);
        }

        let raw = llm.chat(&prompt, &system).await;
        match json_util::parse_typed::<GoalSpec>(&raw) {
            Some(goal) if !goal.goal.trim().is_empty() => goal,
            _ => {
                warn!("goal selection produced no valid structure, using safe default");
                GoalSpec::safe_default()
            }
        }
    }
}

fn hours_since(timestamp: &str) -> f64 {
    chrono::NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S")
        .map(|t| {
            let delta = chrono::Local::now().naive_local() - t;
            (delta.num_seconds().max(0) as f64) / 3600.0
        })
        .unwrap_or(f64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anima_types::{ActionType, RiskLevel};
    use async_trait::async_trait;

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

    fn engine(dir: &Path) -> StrategyEngine {
        StrategyEngine::new(dir, Arc::new(EventBus::default()))
    }

    #[tokio::test]
    async fn valid_structure_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = engine(dir.path());
        let llm = ScriptedLlm {
            reply: r#"{"goal": "inspect config.toml", "reasoning": "it changed",
                       "action_type": "shell", "risk_level": "medium",
                       "shell_command": "cat config.toml"}"#
                .to_string(),
        };
        let goal = strategy.select_goal(&llm, &GoalInputs::default()).await;
        assert_eq!(goal.action_type, ActionType::Shell);
        assert_eq!(goal.risk_level, RiskLevel::Medium);
        assert_eq!(goal.shell_command.as_deref(), Some("cat config.toml"));
    }

    #[tokio::test]
    async fn empty_reply_yields_safe_default() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = engine(dir.path());
        let llm = ScriptedLlm { reply: String::new() };
        let goal = strategy.select_goal(&llm, &GoalInputs::default()).await;
        assert_eq!(goal, GoalSpec::safe_default());
    }

    #[tokio::test]
    async fn invalid_action_type_yields_safe_default() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = engine(dir.path());
        let llm = ScriptedLlm {
            reply: r#"{"goal": "x", "action_type": "conquer", "risk_level": "low"}"#.to_string(),
        };
        let goal = strategy.select_goal(&llm, &GoalInputs::default()).await;
        assert_eq!(goal.action_type, ActionType::Observe);
    }

    #[tokio::test]
    async fn weekly_update_publishes_vector() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let strategy = StrategyEngine::new(dir.path(), Arc::clone(&bus));
        let mut tap = bus.tap();

        strategy.update_weekly("write").await;
        let event = tap.recv().await.unwrap();
        assert_eq!(event.topic, topics::STRATEGY_VECTOR_CHANGED);
        assert!(event.payload["vector"]["create"].as_f64().unwrap() > 0.2);
        assert!(!strategy.should_update_weekly());
    }

    #[test]
    fn set_now_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let strategy = engine(dir.path());
            strategy.set_now("look around", "observe");
        }
        let strategy = engine(dir.path());
        assert!(strategy.prompt_context().contains("look around"));
    }
}
