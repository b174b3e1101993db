//! Goal persistence and recovery: the active goal lives in
//! `goal_state.json`, written atomically, with interruption detection and
//! resume context for the next goal prompt after a restart.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use anima_store::atomic::{atomic_write_json, load_json_or_default};
use anima_types::{now_iso, ActiveGoal, GoalSpec, GoalStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct GoalFileState {
    active_goal: Option<ActiveGoal>,
    interrupted_at: Option<String>,
    resume_count: u64,
    total_goals_completed: u64,
}

/// Atomic persistence of the active goal.
pub struct GoalPersistence {
    path: PathBuf,
    state: RwLock<GoalFileState>,
}

impl GoalPersistence {
    /// Load (or default) `goal_state.json` from the memory directory.
    pub fn new(memory_dir: &Path) -> Self {
        let path = memory_dir.join("goal_state.json");
        let state: GoalFileState = load_json_or_default(&path);
        if state.interrupted_at.is_some() {
            info!(
                interrupted_at = state.interrupted_at.as_deref().unwrap_or(""),
                "previous goal was interrupted; resume context will be injected"
            );
        }
        Self { path, state: RwLock::new(state) }
    }

    fn persist(&self, state: &GoalFileState) {
        if let Err(e) = atomic_write_json(&self.path, state) {
            error!(error = %e, "failed to persist goal state");
        }
    }

    /// Record a newly selected goal as active, clearing any prior
    /// interruption mark.
    pub fn set_active(&self, spec: GoalSpec, tick: u64) {
        let mut state = self.state.write();
        state.active_goal = Some(ActiveGoal {
            spec,
            started_tick: tick,
            started_at: now_iso(),
            status: GoalStatus::Active,
        });
        state.interrupted_at = None;
        self.persist(&state);
    }

    /// Mark the active goal completed. Only explicit completion counts
    /// toward the completed total; resumed goals that never complete do
    /// not.
    pub fn mark_completed(&self, _tick: u64) {
        let mut state = self.state.write();
        if let Some(goal) = state.active_goal.as_mut() {
            if goal.status == GoalStatus::Active || goal.status == GoalStatus::Interrupted {
                goal.status = GoalStatus::Completed;
                state.total_goals_completed += 1;
                state.interrupted_at = None;
                self.persist(&state);
            }
        }
    }

    /// Mark the active goal interrupted. Called only from the shutdown
    /// handler.
    pub fn mark_interrupted(&self) {
        let mut state = self.state.write();
        if let Some(goal) = state.active_goal.as_mut() {
            if goal.status == GoalStatus::Active {
                goal.status = GoalStatus::Interrupted;
                state.interrupted_at = Some(now_iso());
                self.persist(&state);
                info!("active goal marked interrupted");
            }
        }
    }

    /// Whether the stored goal is sitting in the interrupted state.
    pub fn was_interrupted(&self) -> bool {
        self.state
            .read()
            .active_goal
            .as_ref()
            .map_or(false, |g| g.status == GoalStatus::Interrupted)
    }

    /// Prompt fragment describing the interrupted goal. The strategy engine
    /// decides whether to resume it; only call when
    /// [`was_interrupted`](Self::was_interrupted) is true.
    pub fn resume_context(&self) -> String {
        let state = self.state.read();
        let Some(goal) = state.active_goal.as_ref() else {
            return String::new();
        };
        let when = state
            .interrupted_at
            .clone()
            .unwrap_or_else(|| goal.started_at.clone());
        format!(
            "Your previous goal '{}' ({}) was interrupted at {when}. Decide whether to \
             resume it or choose something new.",
            goal.spec.goal, goal.spec.action_type
        )
    }

    /// Count one resume decision.
    pub fn increment_resume(&self) {
        let mut state = self.state.write();
        state.resume_count += 1;
        self.persist(&state);
    }

    /// The stored goal, if it is active or interrupted.
    pub fn active(&self) -> Option<ActiveGoal> {
        self.state
            .read()
            .active_goal
            .clone()
            .filter(|g| g.status != GoalStatus::Completed)
    }

    /// Read model for introspection.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.read();
        json!({
            "active_goal": state.active_goal,
            "interrupted": self_was_interrupted(&state),
            "resume_count": state.resume_count,
            "total_goals_completed": state.total_goals_completed,
        })
    }
}

fn self_was_interrupted(state: &GoalFileState) -> bool {
    state
        .active_goal
        .as_ref()
        .map_or(false, |g| g.status == GoalStatus::Interrupted)
}
