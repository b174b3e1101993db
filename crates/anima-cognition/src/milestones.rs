//! First-time achievements, announced once and persisted forever.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use anima_bus_core::{topics, EventBus};
use anima_store::atomic::{atomic_write_json, load_json_or_default};
use anima_types::now_iso;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MilestoneRecord {
    name: String,
    description: String,
    achieved_at: String,
    tick: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct MilestoneState {
    achieved: BTreeMap<String, MilestoneRecord>,
}

/// Milestone tracker, persisted to `milestones.json`.
pub struct Milestones {
    path: PathBuf,
    bus: Arc<EventBus>,
    state: RwLock<MilestoneState>,
}

impl Milestones {
    /// Load (or default) the persisted set.
    pub fn new(memory_dir: &Path, bus: Arc<EventBus>) -> Self {
        let path = memory_dir.join("milestones.json");
        let state = load_json_or_default(&path);
        Self { path, bus, state: RwLock::new(state) }
    }

    /// Record a milestone. Returns `false` when it was already achieved;
    /// a first achievement publishes `milestone.achieved`.
    pub async fn achieve(&self, name: &str, description: &str, tick: u64) -> bool {
        {
            let mut state = self.state.write();
            if state.achieved.contains_key(name) {
                return false;
            }
            state.achieved.insert(
                name.to_string(),
                MilestoneRecord {
                    name: name.to_string(),
                    description: description.to_string(),
                    achieved_at: now_iso(),
                    tick,
                },
            );
            if let Err(e) = atomic_write_json(&self.path, &*state) {
                tracing::error!(error = %e, "failed to persist milestones");
            }
        }
        info!(name, tick, "milestone achieved");
        self.bus
            .publish(
                topics::MILESTONE_ACHIEVED,
                json!({"name": name, "desc": description, "context": {"tick": tick}}),
            )
            .await;
        true
    }

    /// Whether a milestone has been achieved.
    pub fn has(&self, name: &str) -> bool {
        self.state.read().achieved.contains_key(name)
    }

    /// Read model for introspection.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.read();
        json!({"achieved": state.achieved, "count": state.achieved.len()})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_achievement_publishes_and_repeat_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let milestones = Milestones::new(dir.path(), Arc::clone(&bus));
        let mut tap = bus.tap();

        assert!(milestones.achieve("first_reply", "replied to the user", 4).await);
        let event = tap.recv().await.unwrap();
        assert_eq!(event.topic, topics::MILESTONE_ACHIEVED);
        assert_eq!(event.payload["name"], "first_reply");

        assert!(!milestones.achieve("first_reply", "again", 5).await);
        assert!(tap.try_recv().is_err());
    }

    #[tokio::test]
    async fn milestones_persist_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        {
            let milestones = Milestones::new(dir.path(), Arc::clone(&bus));
            milestones.achieve("first_scan", "scanned the world", 1).await;
        }
        let milestones = Milestones::new(dir.path(), bus);
        assert!(milestones.has("first_scan"));
    }
}
