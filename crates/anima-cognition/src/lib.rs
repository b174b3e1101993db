#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **anima-cognition** – The cognitive collaborators of the Anima runtime.
//!
//! The orchestrator is deliberately ignorant of what these modules *think*;
//! it only knows the uniform [`OptionalStep`] contract and the immutable
//! [`CognitionContext`] snapshot bundle it hands to each step. Every module
//! here owns one JSON state file (written with the atomic-replace helpers),
//! exposes a `snapshot()` read model and a `prompt_context()` fragment, and
//! posts cross-component effects as bus events or via the owning
//! component's mutation API — never by reaching into another module's
//! state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use anima_types::{Config, Priority};

pub mod attention;
pub mod beliefs;
pub mod curiosity;
pub mod dream;
pub mod emotion;
pub mod json_util;
pub mod meta;
pub mod milestones;
pub mod modification;
pub mod narrative;
pub mod reflection;
pub mod self_model;
pub mod social;
pub mod strategy;
pub mod time_sense;
pub mod values;
pub mod world;

pub use attention::AttentionFilter;
pub use beliefs::{Belief, BeliefSystem, ContradictionStep};
pub use curiosity::CuriosityEngine;
pub use dream::DreamEngine;
pub use emotion::EmotionEngine;
pub use meta::MetaCognition;
pub use milestones::Milestones;
pub use modification::{Proposal, ProposalStatus, SelfModificationEngine};
pub use narrative::NarrativeEngine;
pub use reflection::ReflectionEngine;
pub use self_model::SelfModel;
pub use social::SocialLayer;
pub use strategy::{GoalInputs, StrategyEngine};
pub use time_sense::TimePerception;
pub use values::ValueEngine;
pub use world::{WorldModel, WorldWatcher};

/// Shared, runtime-mutable configuration handle.
pub type SharedConfig = Arc<parking_lot::RwLock<Config>>;

/// The read-only snapshot bundle assembled at the start of every heavy-tick
/// cycle and passed to each step. Steps never read each other's live state;
/// they read this.
#[derive(Debug, Clone, Default)]
pub struct CognitionContext {
    /// Current heavy-tick number.
    pub tick: u64,
    /// This cycle's monologue; empty while the monologue step itself runs.
    pub monologue: String,
    /// Self-model fragment (identity and principles).
    pub self_context: String,
    /// Value scores and mode fragment.
    pub values_context: String,
    /// Strategy layers fragment.
    pub strategy_context: String,
    /// Emotion levels fragment.
    pub emotion_context: String,
    /// Tone instruction derived from the dominant emotion.
    pub tone_modifier: String,
    /// Top beliefs fragment.
    pub beliefs_context: String,
    /// Time-perception fragment.
    pub time_context: String,
    /// Meta-cognition fragment.
    pub meta_context: String,
    /// World summary line.
    pub world_summary: String,
    /// Recent filesystem changes, compacted.
    pub recent_changes: String,
    /// Attention-filtered episode block.
    pub attention_context: String,
    /// One-line attention focus summary.
    pub focus_summary: String,
    /// Open curiosity questions.
    pub open_questions: Vec<String>,
    /// Semantic recall block from the vector store.
    pub semantic_context: String,
    /// Resume fragment when the previous goal was interrupted.
    pub resume_context: String,
}

/// The uniform contract every optional cognitive subsystem implements. The
/// orchestrator holds an ordered list of these and drives them inside its
/// own budget admission, timeout, and exception boundary.
#[async_trait]
pub trait OptionalStep: Send + Sync {
    /// Stable step name, used as the budget/skip label and log key.
    fn name(&self) -> &'static str;

    /// Budget class this step is admitted under.
    fn priority(&self) -> Priority {
        Priority::Optional
    }

    /// Estimated LLM calls one run consumes.
    fn llm_cost(&self) -> u32 {
        1
    }

    /// Per-run timeout enforced by the orchestrator.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Execute one run. Errors are recorded against the budget and logged
    /// by the orchestrator; they never affect sibling steps.
    async fn run(&self, tick: u64, ctx: &CognitionContext) -> anyhow::Result<serde_json::Value>;
}
