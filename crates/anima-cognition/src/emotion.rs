//! Emotion engine: bounded emotion levels nudged by event outcomes and
//! decayed toward baseline every cycle.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;

use anima_store::atomic::{atomic_write_json, load_json_or_default};
use anima_types::{clamp_score, now_iso};

const BASELINES: [(&str, f64); 4] =
    [("joy", 0.5), ("fear", 0.2), ("interest", 0.6), ("frustration", 0.2)];

/// Fraction of the distance to baseline recovered per decay pass.
const DECAY_FACTOR: f64 = 0.1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct EmotionState {
    levels: BTreeMap<String, f64>,
    updated_at: String,
}

impl Default for EmotionState {
    fn default() -> Self {
        Self {
            levels: BASELINES.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            updated_at: now_iso(),
        }
    }
}

/// Emotion levels in [0, 1], persisted to `emotions.json`.
pub struct EmotionEngine {
    path: PathBuf,
    state: RwLock<EmotionState>,
}

impl EmotionEngine {
    /// Load (or default) persisted levels.
    pub fn new(memory_dir: &Path) -> Self {
        let path = memory_dir.join("emotions.json");
        let state = load_json_or_default(&path);
        Self { path, state: RwLock::new(state) }
    }

    fn persist(&self, state: &EmotionState) {
        if let Err(e) = atomic_write_json(&self.path, state) {
            tracing::error!(error = %e, "failed to persist emotions");
        }
    }

    /// Nudge levels by an event outcome. `event` is the dotted episode tag
    /// and only shapes urgency (user events spike interest).
    pub fn update(&self, event: &str, success: bool) {
        let mut state = self.state.write();
        let mut bump = |key: &str, delta: f64| {
            let entry = state.levels.entry(key.to_string()).or_insert(0.5);
            *entry = clamp_score(*entry + delta);
        };
        if success {
            bump("joy", 0.05);
            bump("frustration", -0.05);
            bump("interest", 0.02);
        } else {
            bump("frustration", 0.08);
            bump("joy", -0.03);
            bump("fear", 0.02);
        }
        if event.starts_with("user.") {
            bump("interest", 0.1);
        }
        state.updated_at = now_iso();
        self.persist(&state);
    }

    /// Pull every level a step back toward its baseline. Called once per
    /// heavy tick so spikes fade instead of saturating.
    pub fn decay(&self) {
        let mut state = self.state.write();
        for (key, baseline) in BASELINES {
            let entry = state.levels.entry(key.to_string()).or_insert(baseline);
            *entry = clamp_score(*entry + (baseline - *entry) * DECAY_FACTOR);
        }
        state.updated_at = now_iso();
        self.persist(&state);
    }

    fn dominant(levels: &BTreeMap<String, f64>) -> Option<(&str, f64)> {
        levels
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(k, v)| (k.as_str(), *v))
    }

    /// Prompt fragment describing the current levels.
    pub fn prompt_context(&self) -> String {
        let state = self.state.read();
        let levels = state
            .levels
            .iter()
            .map(|(k, v)| format!("{k}={v:.2}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("Emotions: {levels}.")
    }

    /// Tone instruction for the system prompt, driven by the dominant
    /// emotion once it is clearly elevated.
    pub fn tone_modifier(&self) -> String {
        let state = self.state.read();
        match Self::dominant(&state.levels) {
            Some(("joy", level)) if level > 0.65 => {
                "Tone: upbeat, a little playful.".to_string()
            }
            Some(("frustration", level)) if level > 0.5 => {
                "Tone: terse, focused on what went wrong.".to_string()
            }
            Some(("fear", level)) if level > 0.5 => {
                "Tone: careful, double-check before acting.".to_string()
            }
            Some(("interest", level)) if level > 0.7 => {
                "Tone: inquisitive, ask what else is there.".to_string()
            }
            _ => String::new(),
        }
    }

    /// Read model for introspection.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.read();
        json!({"levels": state.levels, "updated_at": state.updated_at})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_raises_joy() {
        let dir = tempfile::tempdir().unwrap();
        let emotions = EmotionEngine::new(dir.path());
        emotions.update("heavy_tick.write", true);
        let snapshot = emotions.snapshot();
        assert!(snapshot["levels"]["joy"].as_f64().unwrap() > 0.5);
    }

    #[test]
    fn repeated_failure_saturates_then_decays() {
        let dir = tempfile::tempdir().unwrap();
        let emotions = EmotionEngine::new(dir.path());
        for _ in 0..20 {
            emotions.update("heavy_tick.shell", false);
        }
        assert_eq!(emotions.snapshot()["levels"]["frustration"], 1.0);

        emotions.decay();
        let after = emotions.snapshot()["levels"]["frustration"].as_f64().unwrap();
        assert!(after < 1.0);
    }

    #[test]
    fn user_events_spike_interest() {
        let dir = tempfile::tempdir().unwrap();
        let emotions = EmotionEngine::new(dir.path());
        emotions.update("user.urgent", true);
        let interest = emotions.snapshot()["levels"]["interest"].as_f64().unwrap();
        assert!(interest > 0.65);
        assert!(emotions.tone_modifier().contains("inquisitive"));
    }

    #[test]
    fn levels_persist_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let emotions = EmotionEngine::new(dir.path());
            emotions.update("x", false);
        }
        let emotions = EmotionEngine::new(dir.path());
        assert!(emotions.snapshot()["levels"]["frustration"].as_f64().unwrap() > 0.2);
    }
}
