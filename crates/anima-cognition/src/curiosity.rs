//! Curiosity engine: keeps a bounded set of open questions about the
//! environment, asking new ones on a cadence and trying to answer the
//! oldest in between.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use anima_llm_gateway::LlmClient;
use anima_store::atomic::{atomic_write_json, load_json_or_default};
use anima_types::now_iso;

use crate::{CognitionContext, OptionalStep, SharedConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Question {
    id: u64,
    question: String,
    asked_at_tick: u64,
    asked_at: String,
    answer: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct CuriosityState {
    next_id: u64,
    open: Vec<Question>,
    answered: Vec<Question>,
}

/// Open-question tracker, persisted to `curiosity.json`.
pub struct CuriosityEngine {
    path: PathBuf,
    llm: Arc<dyn LlmClient>,
    config: SharedConfig,
    state: RwLock<CuriosityState>,
}

/// Answered questions kept for introspection.
const MAX_ANSWERED: usize = 20;

impl CuriosityEngine {
    /// Load (or default) persisted questions.
    pub fn new(memory_dir: &Path, llm: Arc<dyn LlmClient>, config: SharedConfig) -> Self {
        let path = memory_dir.join("curiosity.json");
        let state = load_json_or_default(&path);
        Self { path, llm, config, state: RwLock::new(state) }
    }

    fn persist(&self, state: &CuriosityState) {
        if let Err(e) = atomic_write_json(&self.path, state) {
            tracing::error!(error = %e, "failed to persist curiosity");
        }
    }

    /// Texts of currently open questions, oldest first.
    pub fn open_questions(&self, limit: usize) -> Vec<String> {
        self.state
            .read()
            .open
            .iter()
            .take(limit)
            .map(|q| q.question.clone())
            .collect()
    }

    /// Read model for introspection.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.read();
        json!({
            "open": state.open,
            "answered": state.answered,
        })
    }

    async fn ask_new(&self, tick: u64, ctx: &CognitionContext) -> anyhow::Result<serde_json::Value> {
        let prompt = format!(
            "World: {}\nRecent significant episodes:\n{}\n\nAsk ONE short, concrete question \
             about this environment that you could answer by observing it. Answer with the \
             question text only.",
            ctx.world_summary, ctx.attention_context
        );
        let question = self
            .llm
            .chat(&prompt, "You are a curious autonomous system. One short question, nothing else.")
            .await;
        let question = question.trim().to_string();
        if question.is_empty() {
            return Ok(json!({"asked": false}));
        }

        let mut state = self.state.write();
        if state.open.iter().any(|q| q.question == question) {
            return Ok(json!({"asked": false, "duplicate": true}));
        }
        let id = state.next_id;
        state.next_id += 1;
        state.open.push(Question {
            id,
            question: question.clone(),
            asked_at_tick: tick,
            asked_at: now_iso(),
            answer: None,
        });
        self.persist(&state);
        info!(id, "curiosity question asked: {question}");
        Ok(json!({"asked": true, "id": id}))
    }

    async fn answer_oldest(&self, ctx: &CognitionContext) -> anyhow::Result<serde_json::Value> {
        let oldest = self.state.read().open.first().cloned();
        let Some(question) = oldest else {
            return Ok(json!({"answered": false, "reason": "no open questions"}));
        };
        let prompt = format!(
            "Question you asked earlier: {}\nWorld: {}\nRecent changes: {}\n\n\
             Answer the question in one or two sentences based on what you have observed. \
             If you still cannot answer, reply with exactly UNKNOWN.",
            question.question, ctx.world_summary, ctx.recent_changes
        );
        let answer = self
            .llm
            .chat(&prompt, "You answer your own earlier questions from observation.")
            .await;
        let answer = answer.trim().to_string();
        if answer.is_empty() || answer == "UNKNOWN" {
            debug!(id = question.id, "question stays open");
            return Ok(json!({"answered": false, "id": question.id}));
        }

        let mut state = self.state.write();
        if let Some(pos) = state.open.iter().position(|q| q.id == question.id) {
            let mut done = state.open.remove(pos);
            done.answer = Some(answer);
            state.answered.push(done);
            while state.answered.len() > MAX_ANSWERED {
                state.answered.remove(0);
            }
        }
        self.persist(&state);
        info!(id = question.id, "curiosity question answered");
        Ok(json!({"answered": true, "id": question.id}))
    }
}

#[async_trait]
impl OptionalStep for CuriosityEngine {
    fn name(&self) -> &'static str {
        "curiosity"
    }

    async fn run(&self, tick: u64, ctx: &CognitionContext) -> anyhow::Result<serde_json::Value> {
        let (cadence, cap) = {
            let cfg = self.config.read();
            (cfg.curiosity.ask_every_n_ticks.max(1), cfg.curiosity.max_open_questions)
        };
        let open_count = self.state.read().open.len();

        if tick % cadence == 0 && open_count < cap {
            self.ask_new(tick, ctx).await
        } else {
            self.answer_oldest(ctx).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anima_types::Config;

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

    fn engine(dir: &Path, reply: &str) -> CuriosityEngine {
        CuriosityEngine::new(
            dir,
            Arc::new(ScriptedLlm { reply: reply.to_string() }),
            Arc::new(parking_lot::RwLock::new(Config::default())),
        )
    }

    #[tokio::test]
    async fn asks_on_cadence_tick() {
        let dir = tempfile::tempdir().unwrap();
        let curiosity = engine(dir.path(), "what rewrites config.toml at night?");
        // Default cadence is 6; tick 6 is an asking tick.
        let result = curiosity.run(6, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["asked"], true);
        assert_eq!(curiosity.open_questions(10).len(), 1);
    }

    #[tokio::test]
    async fn answers_between_cadence_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let curiosity = engine(dir.path(), "the build job touches it");
        {
            let mut state = curiosity.state.write();
            state.open.push(Question {
                id: 0,
                question: "what rewrites config.toml?".to_string(),
                asked_at_tick: 6,
                asked_at: now_iso(),
                answer: None,
            });
            state.next_id = 1;
        }
        let result = curiosity.run(7, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["answered"], true);
        assert!(curiosity.open_questions(10).is_empty());
        assert_eq!(curiosity.snapshot()["answered"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_keeps_question_open() {
        let dir = tempfile::tempdir().unwrap();
        let curiosity = engine(dir.path(), "UNKNOWN");
        {
            let mut state = curiosity.state.write();
            state.open.push(Question {
                id: 0,
                question: "why?".to_string(),
                asked_at_tick: 6,
                asked_at: now_iso(),
                answer: None,
            });
        }
        let result = curiosity.run(7, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["answered"], false);
        assert_eq!(curiosity.open_questions(10).len(), 1);
    }

    #[tokio::test]
    async fn open_set_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let curiosity = engine(dir.path(), "another question?");
        {
            let mut state = curiosity.state.write();
            for i in 0..10 {
                state.open.push(Question {
                    id: i,
                    question: format!("q{i}"),
                    asked_at_tick: 0,
                    asked_at: now_iso(),
                    answer: None,
                });
            }
            state.next_id = 10;
        }
        // Tick 12 is an asking tick, but the cap (10) is reached, so the
        // engine answers instead.
        let result = curiosity.run(12, &CognitionContext::default()).await.unwrap();
        assert!(result.get("asked").is_none());
    }
}
