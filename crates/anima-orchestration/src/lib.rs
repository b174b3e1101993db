#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **anima-orchestration** – The two-frequency tick orchestrator for Anima.
//!
//! The [`HeavyTickOrchestrator`] drives all cognitive work: a strictly
//! sequential critical path (monologue → goal selection → action dispatch)
//! wrapped in the fallback strategy, followed by a concurrent optional
//! phase gated by the prioritized budget. The [`LightTick`] heartbeat runs
//! independently, ingesting the inbox and rotating state snapshots.
//! [`AnimaRuntime`] owns both loops with a deterministic `stop()`.
//!
//! Ordering guarantees: heavy cycles never overlap; within a cycle the
//! critical steps are strictly ordered; optional steps have no relative
//! order. No exception crosses a cycle boundary.

pub mod fallback_step;
pub mod goal_state;
pub mod heavy_tick;
pub mod light_tick;
pub mod maintenance;
pub mod runtime;

pub use fallback_step::FallbackStrategy;
pub use goal_state::GoalPersistence;
pub use heavy_tick::{CognitionSet, CycleResult, HeavyTickOrchestrator};
pub use light_tick::{LightTick, MAX_SNAPSHOTS, URGENT_PREFIX};
pub use maintenance::MaintenanceStep;
pub use runtime::AnimaRuntime;
