//! Time perception: inter-tick interval statistics and activity-by-hour
//! patterns, surfaced as a prompt fragment.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;

use anima_store::atomic::{atomic_write_json, load_json_or_default};
use anima_types::{now_epoch, now_iso};

use crate::{CognitionContext, OptionalStep};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct TimeState {
    recent_ticks: VecDeque<f64>,
    activity_by_hour: BTreeMap<u8, u64>,
    patterns: Vec<String>,
    updated_at: String,
}

/// Tick timestamps kept for interval statistics.
const MAX_SAMPLES: usize = 100;

/// Patterns kept for prompting.
const MAX_PATTERNS: usize = 5;

/// Inter-tick clock model, persisted to `time_perception.json`.
pub struct TimePerception {
    path: PathBuf,
    state: RwLock<TimeState>,
}

impl TimePerception {
    /// Load (or default) the persisted model.
    pub fn new(memory_dir: &Path) -> Self {
        let path = memory_dir.join("time_perception.json");
        let state = load_json_or_default(&path);
        Self { path, state: RwLock::new(state) }
    }

    fn persist(&self, state: &TimeState) {
        if let Err(e) = atomic_write_json(&self.path, state) {
            tracing::error!(error = %e, "failed to persist time perception");
        }
    }

    /// Record the start of a heavy tick. Called by the orchestrator's
    /// preamble, not by the optional step.
    pub fn record_tick(&self) {
        let mut state = self.state.write();
        state.recent_ticks.push_back(now_epoch());
        while state.recent_ticks.len() > MAX_SAMPLES {
            state.recent_ticks.pop_front();
        }
        let hour = chrono::Local::now().format("%H").to_string().parse::<u8>().unwrap_or(0);
        *state.activity_by_hour.entry(hour).or_insert(0) += 1;
        state.updated_at = now_iso();
        self.persist(&state);
    }

    /// Mean seconds between recent ticks; zero with fewer than two samples.
    pub fn average_interval(&self) -> f64 {
        let state = self.state.read();
        if state.recent_ticks.len() < 2 {
            return 0.0;
        }
        let first = state.recent_ticks.front().copied().unwrap_or_default();
        let last = state.recent_ticks.back().copied().unwrap_or_default();
        (last - first) / (state.recent_ticks.len() - 1) as f64
    }

    /// Prompt fragment with the detected patterns.
    pub fn prompt_context(&self, top_n: usize) -> String {
        let state = self.state.read();
        if state.patterns.is_empty() {
            return String::new();
        }
        let lines = state
            .patterns
            .iter()
            .rev()
            .take(top_n)
            .map(|p| format!("  - {p}"))
            .collect::<Vec<_>>()
            .join("\n");
        format!("Time perception:\n{lines}")
    }

    /// Read model for introspection.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.read();
        json!({
            "samples": state.recent_ticks.len(),
            "average_interval_secs": self.average_interval(),
            "activity_by_hour": state.activity_by_hour,
            "patterns": state.patterns,
            "updated_at": state.updated_at,
        })
    }
}

#[async_trait]
impl OptionalStep for TimePerception {
    fn name(&self) -> &'static str {
        "time_perception"
    }

    fn llm_cost(&self) -> u32 {
        0
    }

    fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(5)
    }

    /// Pattern detection over the accumulated samples. Pure computation,
    /// no LLM involved.
    async fn run(&self, _tick: u64, _ctx: &CognitionContext) -> anyhow::Result<serde_json::Value> {
        let mut state = self.state.write();
        let mut found = Vec::new();

        if state.recent_ticks.len() >= 2 {
            let first = state.recent_ticks.front().copied().unwrap_or_default();
            let last = state.recent_ticks.back().copied().unwrap_or_default();
            let avg = (last - first) / (state.recent_ticks.len() - 1) as f64;
            found.push(format!("cycles run roughly every {avg:.0}s"));
        }
        if let Some((hour, count)) = state
            .activity_by_hour
            .iter()
            .max_by_key(|(_, count)| **count)
        {
            let total: u64 = state.activity_by_hour.values().sum();
            if total >= 10 && *count as f64 / total as f64 > 0.4 {
                found.push(format!("activity clusters around {hour:02}:00"));
            }
        }

        for pattern in &found {
            if !state.patterns.contains(pattern) {
                state.patterns.push(pattern.clone());
            }
        }
        while state.patterns.len() > MAX_PATTERNS {
            state.patterns.remove(0);
        }
        state.updated_at = now_iso();
        self.persist(&state);
        Ok(json!({"patterns": found.len()}))
    }
}
