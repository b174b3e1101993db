//! Narrative engine: turns a cycle's inner life into a diary entry on a
//! configurable cadence.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use anima_bus_core::{topics, EventBus};
use anima_llm_gateway::LlmClient;
use anima_store::atomic::{atomic_write_json, load_json_or_default};
use anima_types::now_iso;

use crate::{CognitionContext, OptionalStep, SharedConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NarrativeEntry {
    tick: u64,
    written_at: String,
    text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct NarrativeState {
    entries: Vec<NarrativeEntry>,
    last_entry_tick: u64,
}

/// Entries kept in the JSON log; the full text lives in `diary.md`.
const MAX_ENTRIES: usize = 50;

/// Diary writer, persisted to `narrative_log.json` + `diary.md`.
pub struct NarrativeEngine {
    log_path: PathBuf,
    diary_path: PathBuf,
    llm: Arc<dyn LlmClient>,
    bus: Arc<EventBus>,
    config: SharedConfig,
    state: RwLock<NarrativeState>,
}

impl NarrativeEngine {
    /// Load (or default) the persisted log.
    pub fn new(
        memory_dir: &Path,
        llm: Arc<dyn LlmClient>,
        bus: Arc<EventBus>,
        config: SharedConfig,
    ) -> Self {
        let log_path = memory_dir.join("narrative_log.json");
        let diary_path = memory_dir.join("diary.md");
        let state = load_json_or_default(&log_path);
        Self { log_path, diary_path, llm, bus, config, state: RwLock::new(state) }
    }

    fn persist(&self, state: &NarrativeState) {
        if let Err(e) = atomic_write_json(&self.log_path, state) {
            error!(error = %e, "failed to persist narrative log");
        }
    }

    /// The raw diary text.
    pub async fn diary(&self) -> String {
        tokio::fs::read_to_string(&self.diary_path).await.unwrap_or_default()
    }

    /// Read model for introspection.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.read();
        json!({"entries": state.entries, "last_entry_tick": state.last_entry_tick})
    }
}

#[async_trait]
impl OptionalStep for NarrativeEngine {
    fn name(&self) -> &'static str {
        "narrative"
    }

    async fn run(&self, tick: u64, ctx: &CognitionContext) -> anyhow::Result<serde_json::Value> {
        let cadence = self.config.read().narrative.every_n_ticks.max(1);
        if tick % cadence != 0 {
            return Ok(json!({"written": false, "reason": "not due"}));
        }

        let prompt = format!(
            "Your monologue this cycle:\n{}\n\nYour emotions: {}\nWorld: {}\n\nWrite a short \
             diary paragraph (2-4 sentences) about this stretch of your existence, first \
             person, past tense.",
            ctx.monologue, ctx.emotion_context, ctx.world_summary
        );
        let text = self
            .llm
            .chat(&prompt, "You keep a private diary. Honest, compact, no headings.")
            .await;
        let text = text.trim().to_string();
        if text.is_empty() {
            return Ok(json!({"written": false, "reason": "llm unavailable"}));
        }

        // Diary file first, then the structured log.
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M");
        let block = format!("## {stamp} — tick {tick}\n\n{text}\n\n");
        {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.diary_path)
                .await?;
            file.write_all(block.as_bytes()).await?;
        }

        {
            let mut state = self.state.write();
            state.entries.push(NarrativeEntry {
                tick,
                written_at: now_iso(),
                text: text.clone(),
            });
            while state.entries.len() > MAX_ENTRIES {
                state.entries.remove(0);
            }
            state.last_entry_tick = tick;
            self.persist(&state);
        }

        info!(tick, "diary entry written");
        self.bus.publish(topics::NARRATIVE_ENTRY_WRITTEN, json!({"tick": tick})).await;
        Ok(json!({"written": true, "tick": tick}))
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

    fn engine(dir: &Path, reply: &str, bus: Arc<EventBus>) -> NarrativeEngine {
        NarrativeEngine::new(
            dir,
            Arc::new(ScriptedLlm { reply: reply.to_string() }),
            bus,
            Arc::new(parking_lot::RwLock::new(Config::default())),
        )
    }

    #[tokio::test]
    async fn writes_on_cadence_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let narrative = engine(dir.path(), "Today I watched the workspace settle.", Arc::clone(&bus));
        let mut tap = bus.tap();

        // Default cadence is 24.
        let result = narrative.run(24, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["written"], true);

        let event = tap.recv().await.unwrap();
        assert_eq!(event.topic, topics::NARRATIVE_ENTRY_WRITTEN);
        assert_eq!(event.payload["tick"], 24);

        let diary = narrative.diary().await;
        assert!(diary.contains("tick 24"));
        assert!(diary.contains("watched the workspace settle"));
    }

    #[tokio::test]
    async fn off_cadence_ticks_skip() {
        let dir = tempfile::tempdir().unwrap();
        let narrative = engine(dir.path(), "x", Arc::new(EventBus::default()));
        let result = narrative.run(25, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["written"], false);
        assert!(narrative.diary().await.is_empty());
    }

    #[tokio::test]
    async fn empty_llm_reply_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let narrative = engine(dir.path(), "", Arc::new(EventBus::default()));
        let result = narrative.run(24, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["written"], false);
    }
}
