//! Value engine: named score dials that drift with action outcomes and
//! derive the current behavioural mode.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use anima_bus_core::{topics, EventBus};
use anima_store::atomic::{atomic_write_json, load_json_or_default};
use anima_types::{clamp_score, now_iso};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ValueState {
    scores: BTreeMap<String, f64>,
    updated_at: String,
}

impl Default for ValueState {
    fn default() -> Self {
        Self {
            scores: BTreeMap::from([
                ("curiosity".to_string(), 0.6),
                ("stability".to_string(), 0.5),
                ("exploration".to_string(), 0.55),
                ("caution".to_string(), 0.4),
                ("social".to_string(), 0.4),
            ]),
            updated_at: now_iso(),
        }
    }
}

/// Score dials in [0, 1], persisted to `values.json`, published on change.
pub struct ValueEngine {
    path: PathBuf,
    bus: Arc<EventBus>,
    state: RwLock<ValueState>,
}

impl ValueEngine {
    /// Load (or default) the persisted scores.
    pub fn new(memory_dir: &std::path::Path, bus: Arc<EventBus>) -> Self {
        let path = memory_dir.join("values.json");
        let state = load_json_or_default(&path);
        Self { path, bus, state: RwLock::new(state) }
    }

    fn persist(&self, state: &ValueState) {
        if let Err(e) = atomic_write_json(&self.path, state) {
            tracing::error!(error = %e, "failed to persist values");
        }
    }

    /// Derive the behavioural mode from the current dials.
    pub fn mode(&self) -> &'static str {
        let state = self.state.read();
        let get = |k: &str| state.scores.get(k).copied().unwrap_or(0.5);
        if get("caution") > 0.65 {
            "cautious"
        } else if get("curiosity") > 0.6 {
            "curious"
        } else {
            "normal"
        }
    }

    /// Shift dials by the outcome of the just-dispatched action, then
    /// publish `value.changed`.
    pub async fn update_after_action(&self, success: bool, context: &str) {
        let scores = {
            let mut state = self.state.write();
            let mut bump = |key: &str, delta: f64| {
                let entry = state.scores.entry(key.to_string()).or_insert(0.5);
                *entry = clamp_score(*entry + delta);
            };
            if success {
                bump("stability", 0.02);
                bump("curiosity", 0.01);
                bump("caution", -0.01);
            } else {
                bump("caution", 0.03);
                bump("stability", -0.02);
            }
            state.updated_at = now_iso();
            self.persist(&state);
            state.scores.clone()
        };
        let mode = self.mode();
        debug!(success, mode, "values updated");
        self.bus
            .publish(
                topics::VALUE_CHANGED,
                json!({"scores": scores, "mode": mode, "context": context}),
            )
            .await;
    }

    /// Current scores, for snapshots.
    pub fn scores(&self) -> BTreeMap<String, f64> {
        self.state.read().scores.clone()
    }

    /// Read model for introspection.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.read();
        json!({
            "scores": state.scores,
            "mode": self.mode_of(&state.scores),
            "updated_at": state.updated_at,
        })
    }

    fn mode_of(&self, scores: &BTreeMap<String, f64>) -> &'static str {
        let get = |k: &str| scores.get(k).copied().unwrap_or(0.5);
        if get("caution") > 0.65 {
            "cautious"
        } else if get("curiosity") > 0.6 {
            "curious"
        } else {
            "normal"
        }
    }

    /// Prompt fragment.
    pub fn prompt_context(&self) -> String {
        let state = self.state.read();
        let dials = state
            .scores
            .iter()
            .map(|(k, v)| format!("{k}={v:.2}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("Values: {dials}. Mode: {}.", self.mode_of(&state.scores))
    }
}
