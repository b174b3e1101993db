#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **anima-types** – Shared primitive data structures for the Anima runtime.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, networking, or storage.

use serde::{Deserialize, Serialize};

pub mod config;

pub use config::{Config, ConfigError, MutableKey, MUTABLE_KEYS};

//─────────────────────────────
//  Validation constants
//─────────────────────────────

/// Maximum allowed length for an episode description. Longer descriptions
/// are rejected at the store boundary rather than truncated silently.
pub const MAX_DESCRIPTION_LEN: usize = 1000;

/// Maximum allowed length for a self-model principle.
pub const MAX_PRINCIPLE_LEN: usize = 500;

//─────────────────────────────
//  Episode primitives
//─────────────────────────────

/// Outcome of an episode. Any value outside this set is normalized to
/// [`Outcome::Unknown`] on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The recorded activity succeeded.
    Success,
    /// The recorded activity failed.
    Failure,
    /// Outcome not determined (the default).
    Unknown,
}

impl Outcome {
    /// Stable string form used in the `episodes.outcome` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Unknown => "unknown",
        }
    }

    /// Parse a stored string, normalizing anything out of set to `Unknown`.
    pub fn normalize(raw: &str) -> Self {
        match raw {
            "success" => Outcome::Success,
            "failure" => Outcome::Failure,
            _ => Outcome::Unknown,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable, immutable row of the episodic log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// Monotonically assigned row id.
    pub id: i64,
    /// ISO-8601 local timestamp without sub-second precision.
    pub timestamp: String,
    /// Dotted event-type tag, e.g. `heavy_tick.write` or `shell.rejected`.
    pub event_type: String,
    /// Human-readable description, non-empty and bounded in length.
    pub description: String,
    /// Normalized outcome.
    pub outcome: Outcome,
    /// Optional structured payload, stored as JSON.
    pub data: Option<serde_json::Value>,
}

/// A single hit from a vector-store similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    /// Vector row id.
    pub id: i64,
    /// Back-reference to the episode this embedding was derived from.
    pub episode_id: i64,
    /// Event-type tag of the source episode.
    pub event_type: String,
    /// The short text that was embedded.
    pub text: String,
    /// Cosine similarity against the query, in [-1, 1].
    pub score: f32,
    /// Seconds-since-epoch creation time.
    pub created_at: f64,
}

//─────────────────────────────
//  Goals and actions
//─────────────────────────────

/// Action families a selected goal can dispatch into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// Passive tick, no side effect.
    Observe,
    /// Run the world model's anomaly detector.
    Analyze,
    /// Write a derived artifact into the sandbox directory.
    Write,
    /// Read recent error episodes and distil a principle.
    Reflect,
    /// Forward a command to the shell executor.
    Shell,
}

impl ActionType {
    /// Stable string form used in logs and episode tags.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Observe => "observe",
            ActionType::Analyze => "analyze",
            ActionType::Write => "write",
            ActionType::Reflect => "reflect",
            ActionType::Shell => "shell",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared risk of executing a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Safe to execute without hesitation.
    Low,
    /// Some caution warranted.
    Medium,
    /// Potentially disruptive.
    High,
}

impl RiskLevel {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

/// Structured goal record produced by the strategy engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalSpec {
    /// Short goal description.
    pub goal: String,
    /// Why this goal was chosen.
    #[serde(default)]
    pub reasoning: String,
    /// Which action family the goal dispatches into.
    pub action_type: ActionType,
    /// Declared risk level.
    pub risk_level: RiskLevel,
    /// Command to run, only meaningful for [`ActionType::Shell`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell_command: Option<String>,
}

impl GoalSpec {
    /// The safe default substituted whenever goal selection cannot produce
    /// a valid structured record.
    pub fn safe_default() -> Self {
        Self {
            goal: "observe the environment".to_string(),
            reasoning: "LLM unavailable or returned no valid structure".to_string(),
            action_type: ActionType::Observe,
            risk_level: RiskLevel::Low,
            shell_command: None,
        }
    }
}

/// Lifecycle status of the active goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalStatus {
    /// Currently being pursued.
    Active,
    /// Explicitly completed.
    Completed,
    /// Interrupted by shutdown; resume is delegated to the strategy engine.
    Interrupted,
}

/// The persisted active goal together with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveGoal {
    /// The structured goal record.
    #[serde(flatten)]
    pub spec: GoalSpec,
    /// Heavy-tick number the goal was set on.
    pub started_tick: u64,
    /// ISO-8601 timestamp the goal was set at.
    pub started_at: String,
    /// Current lifecycle status.
    pub status: GoalStatus,
}

//─────────────────────────────
//  Scheduling primitives
//─────────────────────────────

/// Budget priority classes. Critical work is never refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    /// Must always execute (monologue, goal, action).
    Critical,
    /// Executes while budget remains (beliefs, social).
    Important,
    /// Executes only with spare budget (curiosity, meta-cognition).
    Optional,
}

impl Priority {
    /// All classes, in descending strictness. Iteration order is used by
    /// the budget report.
    pub const ALL: [Priority; 3] = [Priority::Critical, Priority::Important, Priority::Optional];

    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::Important => "IMPORTANT",
            Priority::Optional => "OPTIONAL",
        }
    }
}

/// Result of one orchestrated step. The fallback wrapper decides policy by
/// matching on this instead of catching panics or errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The step's real implementation produced a value.
    Success {
        /// The produced artifact.
        value: serde_json::Value,
    },
    /// The real implementation failed and a cached substitute was served.
    FallbackUsed {
        /// The cached artifact.
        value: serde_json::Value,
        /// Why the real implementation was bypassed.
        reason: String,
    },
    /// Neither the real implementation nor the fallback cache produced
    /// anything.
    Failed {
        /// Why the step produced nothing.
        reason: String,
    },
}

impl StepOutcome {
    /// The carried value, if any.
    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            StepOutcome::Success { value } | StepOutcome::FallbackUsed { value, .. } => Some(value),
            StepOutcome::Failed { .. } => None,
        }
    }

    /// True when the step produced nothing at all.
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. })
    }

    /// True when a cached substitute was served.
    pub fn is_fallback(&self) -> bool {
        matches!(self, StepOutcome::FallbackUsed { .. })
    }
}

//─────────────────────────────
//  Numeric and time helpers
//─────────────────────────────

/// Clamp a score-like value to [0, 1] and round it to three decimals, the
/// canonical form for every persisted score field.
pub fn clamp_score(value: f64) -> f64 {
    (value.clamp(0.0, 1.0) * 1000.0).round() / 1000.0
}

/// Current local time as ISO-8601 without sub-second precision, the format
/// used in every persisted JSON file and episode row.
pub fn now_iso() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Current time as fractional seconds since the Unix epoch, the in-memory
/// timestamp representation.
pub fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_normalizes_out_of_set_values() {
        assert_eq!(Outcome::normalize("success"), Outcome::Success);
        assert_eq!(Outcome::normalize("failure"), Outcome::Failure);
        assert_eq!(Outcome::normalize("error"), Outcome::Unknown);
        assert_eq!(Outcome::normalize(""), Outcome::Unknown);
    }

    #[test]
    fn clamp_score_bounds_and_rounds() {
        assert_eq!(clamp_score(1.5), 1.0);
        assert_eq!(clamp_score(-0.2), 0.0);
        assert_eq!(clamp_score(0.12345), 0.123);
        assert_eq!(clamp_score(0.9995), 1.0);
    }

    #[test]
    fn goal_spec_roundtrips_through_json() {
        let goal = GoalSpec {
            goal: "check the config file".to_string(),
            reasoning: "it changed recently".to_string(),
            action_type: ActionType::Shell,
            risk_level: RiskLevel::Medium,
            shell_command: Some("ls -la".to_string()),
        };
        let raw = serde_json::to_string(&goal).unwrap();
        let back: GoalSpec = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, goal);
        assert!(raw.contains("\"action_type\":\"shell\""));
    }

    #[test]
    fn safe_default_goal_is_passive() {
        let goal = GoalSpec::safe_default();
        assert_eq!(goal.action_type, ActionType::Observe);
        assert_eq!(goal.risk_level, RiskLevel::Low);
        assert!(goal.shell_command.is_none());
    }

    #[test]
    fn step_outcome_value_access() {
        let ok = StepOutcome::Success { value: serde_json::json!({"x": 1}) };
        assert!(ok.value().is_some());
        assert!(!ok.is_failed());

        let failed = StepOutcome::Failed { reason: "no cache".to_string() };
        assert!(failed.value().is_none());
        assert!(failed.is_failed());
    }
}
