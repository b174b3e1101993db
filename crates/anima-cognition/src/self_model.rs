//! Self-model: identity plus the accumulated principles, deduplicated by
//! exact text, with version tracking and drift detection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use anima_bus_core::{topics, EventBus};
use anima_store::atomic::{atomic_write_json, load_json_or_default};
use anima_types::{now_iso, MAX_PRINCIPLE_LEN};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct SelfModelState {
    identity: String,
    version: u64,
    principles: Vec<String>,
    last_drift_version: u64,
    updated_at: String,
}

impl Default for SelfModelState {
    fn default() -> Self {
        Self {
            identity: "An autonomous digital being observing a filesystem and learning from it."
                .to_string(),
            version: 1,
            principles: Vec::new(),
            last_drift_version: 1,
            updated_at: now_iso(),
        }
    }
}

/// How many versions may accumulate before a drift event is emitted.
const DRIFT_WINDOW: u64 = 5;

/// The persisted self-model (`self_model.json`).
pub struct SelfModel {
    path: PathBuf,
    bus: Arc<EventBus>,
    state: RwLock<SelfModelState>,
}

impl SelfModel {
    /// Load (or default) the persisted model.
    pub fn new(memory_dir: &Path, bus: Arc<EventBus>) -> Self {
        let path = memory_dir.join("self_model.json");
        let state = load_json_or_default(&path);
        Self { path, bus, state: RwLock::new(state) }
    }

    fn persist(&self, state: &SelfModelState) {
        if let Err(e) = atomic_write_json(&self.path, state) {
            tracing::error!(error = %e, "failed to persist self model");
        }
    }

    /// Add a principle. Returns `false` when the exact text already exists.
    /// A new principle bumps the version and publishes
    /// `self.principle_added`.
    pub async fn add_principle(&self, text: &str) -> bool {
        let text: String = text.trim().chars().take(MAX_PRINCIPLE_LEN).collect();
        if text.is_empty() {
            return false;
        }
        let version = {
            let mut state = self.state.write();
            if state.principles.iter().any(|p| p == &text) {
                return false;
            }
            state.principles.push(text.clone());
            state.version += 1;
            state.updated_at = now_iso();
            self.persist(&state);
            state.version
        };
        info!(version, "principle added: {}", text.chars().take(80).collect::<String>());
        self.bus
            .publish(topics::SELF_PRINCIPLE_ADDED, json!({"text": text, "version": version}))
            .await;
        true
    }

    /// Compare the current version against the last drift checkpoint and
    /// publish `self.drift_detected` when the model moved far enough.
    /// Called from the reflection cadence.
    pub async fn check_drift(&self) {
        let drift = {
            let mut state = self.state.write();
            let delta = state.version.saturating_sub(state.last_drift_version);
            if delta >= DRIFT_WINDOW {
                let past = state.last_drift_version;
                state.last_drift_version = state.version;
                self.persist(&state);
                Some((past, state.version, delta))
            } else {
                None
            }
        };
        if let Some((past, current, delta)) = drift {
            info!(past, current, delta, "self-model drift detected");
            self.bus
                .publish(
                    topics::SELF_DRIFT_DETECTED,
                    json!({"past_version": past, "current_version": current, "delta": delta}),
                )
                .await;
        }
    }

    /// All current principles.
    pub fn principles(&self) -> Vec<String> {
        self.state.read().principles.clone()
    }

    /// Prompt fragment: identity plus the most recent principles.
    pub fn prompt_context(&self) -> String {
        let state = self.state.read();
        let mut out = format!("Identity: {}", state.identity);
        if !state.principles.is_empty() {
            let recent = state
                .principles
                .iter()
                .rev()
                .take(5)
                .map(|p| format!("  - {p}"))
                .collect::<Vec<_>>()
                .join("\n");
            out.push_str(&format!("\nPrinciples:\n{recent}"));
        }
        out
    }

    /// Read model for introspection.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.read();
        json!({
            "identity": state.identity,
            "version": state.version,
            "principles": state.principles,
            "updated_at": state.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(dir: &Path) -> SelfModel {
        SelfModel::new(dir, Arc::new(EventBus::default()))
    }

    #[tokio::test]
    async fn principles_are_deduplicated_by_exact_text() {
        let dir = tempfile::tempdir().unwrap();
        let sm = model(dir.path());
        assert!(sm.add_principle("verify before acting").await);
        assert!(!sm.add_principle("verify before acting").await);
        assert_eq!(sm.principles().len(), 1);
    }

    #[tokio::test]
    async fn principle_event_carries_version() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let sm = SelfModel::new(dir.path(), Arc::clone(&bus));
        let mut tap = bus.tap();

        sm.add_principle("keep logs short").await;
        let event = tap.recv().await.unwrap();
        assert_eq!(event.topic, topics::SELF_PRINCIPLE_ADDED);
        assert_eq!(event.payload["version"], 2);
    }

    #[tokio::test]
    async fn drift_fires_after_enough_versions() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let sm = SelfModel::new(dir.path(), Arc::clone(&bus));

        for i in 0..5 {
            sm.add_principle(&format!("principle number {i}")).await;
        }
        let mut tap = bus.tap();
        sm.check_drift().await;
        let event = tap.recv().await.unwrap();
        assert_eq!(event.topic, topics::SELF_DRIFT_DETECTED);
        assert_eq!(event.payload["delta"], 5);

        // A second check without further changes stays quiet.
        sm.check_drift().await;
        assert!(tap.try_recv().is_err());
    }

    #[tokio::test]
    async fn model_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let sm = model(dir.path());
            sm.add_principle("persisted").await;
        }
        let sm = model(dir.path());
        assert_eq!(sm.principles(), vec!["persisted".to_string()]);
    }
}
