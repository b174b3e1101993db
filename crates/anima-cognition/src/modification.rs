//! Self-modification engine: bounded, whitelisted runtime config changes
//! behind a proposal pipeline with a post-apply monitoring window and
//! automatic rollback.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use anima_bus_core::{topics, EventBus};
use anima_llm_gateway::LlmClient;
use anima_store::atomic::{atomic_write_json, load_json_or_default};
use anima_store::EpisodicStore;
use anima_types::{now_iso, Outcome, MUTABLE_KEYS};

use crate::{json_util, CognitionContext, OptionalStep, SharedConfig};

/// Ticks an applied change is observed before the verdict.
pub const MONITOR_WINDOW_TICKS: u64 = 10;

/// Heavy ticks between self-suggestions.
const SUGGEST_EVERY: u64 = 50;

/// After-window failure count beyond `before * FACTOR + 1` triggers
/// rollback.
const ROLLBACK_FACTOR: f64 = 1.5;

const MAX_HISTORY: usize = 50;

/// Lifecycle of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    /// Awaiting an approve/reject decision.
    Pending,
    /// Applied; possibly still inside the monitoring window.
    Approved,
    /// Declined before application.
    Rejected,
    /// Applied, then reverted after the window showed degradation.
    RolledBack,
}

/// Failure-rate sample around an applied change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    /// Failure-outcome episodes among the recent window.
    pub failure_episodes: usize,
    /// When the sample was taken.
    pub sampled_at: String,
}

/// One modification proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    /// Stable id.
    pub id: String,
    /// Whitelisted dotted config key.
    pub key: String,
    /// Value before application.
    pub old_value: f64,
    /// Proposed value.
    pub new_value: f64,
    /// Why the change was suggested.
    pub reason: String,
    /// Lifecycle status.
    pub status: ProposalStatus,
    /// Creation timestamp.
    pub created_at: String,
    /// Decision timestamp, once decided.
    pub decided_at: Option<String>,
    /// Sample captured at application time.
    pub metrics_before: Option<MetricsSample>,
    /// Sample captured when the window closed.
    pub metrics_after: Option<MetricsSample>,
    /// Window verdict, once the window closed.
    pub verification: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MonitorWindow {
    proposal_id: String,
    applied_tick: u64,
    metrics_before: MetricsSample,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ModState {
    proposals: Vec<Proposal>,
    monitor: Option<MonitorWindow>,
}

#[derive(Debug, Deserialize)]
struct Suggestion {
    key: String,
    new_value: f64,
    #[serde(default)]
    reason: String,
}

/// The proposal pipeline, persisted to `modifications.json`.
pub struct SelfModificationEngine {
    path: PathBuf,
    llm: Arc<dyn LlmClient>,
    bus: Arc<EventBus>,
    episodic: Arc<EpisodicStore>,
    config: SharedConfig,
    state: RwLock<ModState>,
}

impl SelfModificationEngine {
    /// Load (or default) the persisted history.
    pub fn new(
        memory_dir: &Path,
        llm: Arc<dyn LlmClient>,
        bus: Arc<EventBus>,
        episodic: Arc<EpisodicStore>,
        config: SharedConfig,
    ) -> Self {
        let path = memory_dir.join("modifications.json");
        let state = load_json_or_default(&path);
        Self { path, llm, bus, episodic, config, state: RwLock::new(state) }
    }

    fn persist(&self, state: &ModState) {
        if let Err(e) = atomic_write_json(&self.path, state) {
            tracing::error!(error = %e, "failed to persist modifications");
        }
    }

    async fn capture_metrics(&self) -> MetricsSample {
        let recent = self.episodic.get_recent(50).await;
        MetricsSample {
            failure_episodes: recent.iter().filter(|e| e.outcome == Outcome::Failure).count(),
            sampled_at: now_iso(),
        }
    }

    /// Create a pending proposal. The key must be whitelisted and the value
    /// inside its bounds.
    pub fn propose(&self, key: &str, new_value: f64, reason: &str) -> Result<Proposal, String> {
        let bounds = MUTABLE_KEYS
            .iter()
            .find(|m| m.key == key)
            .ok_or_else(|| format!("key '{key}' is not runtime-mutable"))?;
        if !(bounds.min..=bounds.max).contains(&new_value) {
            return Err(format!(
                "value {new_value} for '{key}' outside bounds [{}, {}]",
                bounds.min, bounds.max
            ));
        }
        let old_value = self.config.read().get_numeric(key).unwrap_or_default();
        if (old_value - new_value).abs() < f64::EPSILON {
            return Err("proposed value equals the current value".to_string());
        }

        let proposal = Proposal {
            id: uuid::Uuid::new_v4().to_string(),
            key: key.to_string(),
            old_value,
            new_value,
            reason: reason.to_string(),
            status: ProposalStatus::Pending,
            created_at: now_iso(),
            decided_at: None,
            metrics_before: None,
            metrics_after: None,
            verification: None,
        };
        let mut state = self.state.write();
        state.proposals.push(proposal.clone());
        while state.proposals.len() > MAX_HISTORY {
            state.proposals.remove(0);
        }
        self.persist(&state);
        info!(key, new_value, "modification proposed");
        Ok(proposal)
    }

    /// Apply a pending proposal: mutate the config, open the monitoring
    /// window, publish `config.modified`.
    pub async fn approve(&self, id: &str, tick: u64) -> Result<Proposal, String> {
        let metrics_before = self.capture_metrics().await;

        let (proposal, payload) = {
            let mut state = self.state.write();
            let proposal = state
                .proposals
                .iter_mut()
                .find(|p| p.id == id)
                .ok_or_else(|| format!("unknown proposal '{id}'"))?;
            if proposal.status != ProposalStatus::Pending {
                return Err(format!("proposal '{id}' is not pending"));
            }

            let old = self
                .config
                .write()
                .set_numeric(&proposal.key, proposal.new_value)
                .map_err(|e| e.to_string())?;
            proposal.old_value = old;
            proposal.status = ProposalStatus::Approved;
            proposal.decided_at = Some(now_iso());
            proposal.metrics_before = Some(metrics_before.clone());
            let proposal = proposal.clone();

            let payload = json!({
                "key": proposal.key,
                "new_value": proposal.new_value,
                "old_value": old,
            });
            state.monitor = Some(MonitorWindow {
                proposal_id: id.to_string(),
                applied_tick: tick,
                metrics_before,
            });
            self.persist(&state);
            (proposal, payload)
        };

        info!(key = %proposal.key, "modification applied");
        self.bus.publish(topics::CONFIG_MODIFIED, payload).await;
        Ok(proposal)
    }

    /// Decline a pending proposal.
    pub fn reject(&self, id: &str) -> Result<Proposal, String> {
        let mut state = self.state.write();
        let proposal = state
            .proposals
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| format!("unknown proposal '{id}'"))?;
        if proposal.status != ProposalStatus::Pending {
            return Err(format!("proposal '{id}' is not pending"));
        }
        proposal.status = ProposalStatus::Rejected;
        proposal.decided_at = Some(now_iso());
        let proposal = proposal.clone();
        self.persist(&state);
        Ok(proposal)
    }

    async fn rollback(&self, proposal_id: &str, metrics_after: MetricsSample) {
        let payload = {
            let mut state = self.state.write();
            let Some(proposal) = state.proposals.iter_mut().find(|p| p.id == proposal_id) else {
                return;
            };
            if let Err(e) = self.config.write().set_numeric(&proposal.key, proposal.old_value) {
                warn!(error = %e, "rollback mutation failed");
            }
            proposal.status = ProposalStatus::RolledBack;
            proposal.metrics_after = Some(metrics_after);
            proposal.verification = Some("degraded, rolled back".to_string());
            let payload = json!({
                "key": proposal.key,
                "new_value": proposal.old_value,
                "old_value": proposal.new_value,
            });
            self.persist(&state);
            payload
        };
        warn!(proposal_id, "modification rolled back");
        self.bus.publish(topics::CONFIG_MODIFIED, payload).await;
    }

    /// Proposals, newest first.
    pub fn history(&self, limit: usize) -> Vec<Proposal> {
        let state = self.state.read();
        state.proposals.iter().rev().take(limit).cloned().collect()
    }

    /// Read model for introspection.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.read();
        json!({
            "proposals": state.proposals.iter().rev().collect::<Vec<_>>(),
            "monitoring": state.monitor,
        })
    }

    async fn close_window_if_due(&self, tick: u64) -> Option<serde_json::Value> {
        let window = {
            let state = self.state.read();
            state.monitor.clone()?
        };
        if tick < window.applied_tick + MONITOR_WINDOW_TICKS {
            return Some(json!({
                "monitoring": window.proposal_id,
                "ticks_left": window.applied_tick + MONITOR_WINDOW_TICKS - tick,
            }));
        }

        let after = self.capture_metrics().await;
        let threshold =
            window.metrics_before.failure_episodes as f64 * ROLLBACK_FACTOR + 1.0;
        let degraded = after.failure_episodes as f64 > threshold;

        if degraded {
            self.rollback(&window.proposal_id, after).await;
        } else {
            let mut state = self.state.write();
            if let Some(proposal) =
                state.proposals.iter_mut().find(|p| p.id == window.proposal_id)
            {
                proposal.metrics_after = Some(after);
                proposal.verification = Some("stable after monitoring window".to_string());
            }
            self.persist(&state);
        }
        {
            let mut state = self.state.write();
            state.monitor = None;
            self.persist(&state);
        }
        Some(json!({"window_closed": window.proposal_id, "rolled_back": degraded}))
    }

    async fn suggest(&self, _tick: u64) -> serde_json::Value {
        let current: Vec<String> = {
            let cfg = self.config.read();
            MUTABLE_KEYS
                .iter()
                .map(|m| {
                    format!(
                        "{} = {} (bounds {}..{})",
                        m.key,
                        cfg.get_numeric(m.key).unwrap_or_default(),
                        m.min,
                        m.max
                    )
                })
                .collect()
        };
        let prompt = format!(
            "You may tune exactly one of these runtime parameters:\n{}\n\nSuggest one change \
             that would improve your behaviour, or nothing if all is well. JSON only:\n\
             {{\"key\": \"...\", \"new_value\": number, \"reason\": \"...\"}}",
            current.join("\n")
        );
        let raw = self
            .llm
            .chat(&prompt, "You tune your own cadence parameters conservatively. Answer ONLY with valid JSON.")
            .await;
        let Some(suggestion) = json_util::parse_typed::<Suggestion>(&raw) else {
            return json!({"suggested": false});
        };
        match self.propose(&suggestion.key, suggestion.new_value, &suggestion.reason) {
            Ok(proposal) => json!({"suggested": true, "id": proposal.id}),
            Err(reason) => {
                warn!(reason, "self-suggestion refused");
                json!({"suggested": false, "reason": reason})
            }
        }
    }
}

#[async_trait]
impl OptionalStep for SelfModificationEngine {
    fn name(&self) -> &'static str {
        "self_modification"
    }

    async fn run(&self, tick: u64, _ctx: &CognitionContext) -> anyhow::Result<serde_json::Value> {
        if let Some(window_result) = self.close_window_if_due(tick).await {
            return Ok(window_result);
        }
        if tick > 0 && tick % SUGGEST_EVERY == 0 {
            return Ok(self.suggest(tick).await);
        }
        Ok(json!({"idle": true}))
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

    async fn engine(dir: &Path, reply: &str) -> (SelfModificationEngine, SharedConfig, Arc<EpisodicStore>) {
        let config: SharedConfig = Arc::new(parking_lot::RwLock::new(Config::default()));
        let episodic = Arc::new(EpisodicStore::in_memory().await.unwrap());
        let bus = Arc::new(EventBus::default());
        let engine = SelfModificationEngine::new(
            dir,
            Arc::new(ScriptedLlm { reply: reply.to_string() }),
            bus,
            Arc::clone(&episodic),
            Arc::clone(&config),
        );
        (engine, config, episodic)
    }

    #[tokio::test]
    async fn propose_validates_whitelist_and_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _, _) = engine(dir.path(), "").await;

        assert!(engine.propose("ticks.heavy_tick_sec", 10.0, "faster").is_err());
        assert!(engine.propose("attention.top_k", 99.0, "more").is_err());
        assert!(engine.propose("attention.top_k", 8.0, "more").is_ok());
    }

    #[tokio::test]
    async fn approve_applies_and_opens_window() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, config, _) = engine(dir.path(), "").await;

        let proposal = engine.propose("attention.top_k", 8.0, "wider attention").unwrap();
        let approved = engine.approve(&proposal.id, 100).await.unwrap();
        assert_eq!(approved.status, ProposalStatus::Approved);
        assert_eq!(config.read().attention.top_k, 8);
        assert!(engine.snapshot()["monitoring"].is_object());
    }

    #[tokio::test]
    async fn stable_window_closes_without_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, config, _) = engine(dir.path(), "").await;

        let proposal = engine.propose("attention.top_k", 8.0, "wider").unwrap();
        engine.approve(&proposal.id, 100).await.unwrap();

        let result = engine.run(100 + MONITOR_WINDOW_TICKS, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["rolled_back"], false);
        assert_eq!(config.read().attention.top_k, 8);

        let history = engine.history(1);
        assert_eq!(history[0].verification.as_deref(), Some("stable after monitoring window"));
    }

    #[tokio::test]
    async fn degraded_window_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, config, episodic) = engine(dir.path(), "").await;

        let proposal = engine.propose("attention.top_k", 8.0, "wider").unwrap();
        engine.approve(&proposal.id, 100).await.unwrap();

        // Flood failures so the after-sample clears the rollback threshold.
        for i in 0..10 {
            episodic
                .add_episode("heavy_tick.shell", &format!("boom {i}"), Outcome::Failure, None)
                .await;
        }

        let result = engine.run(100 + MONITOR_WINDOW_TICKS, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["rolled_back"], true);
        assert_eq!(config.read().attention.top_k, 5, "old value restored");
        assert_eq!(engine.history(1)[0].status, ProposalStatus::RolledBack);
    }

    #[tokio::test]
    async fn reject_leaves_config_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, config, _) = engine(dir.path(), "").await;
        let proposal = engine.propose("attention.min_score", 0.5, "stricter").unwrap();
        engine.reject(&proposal.id).unwrap();
        assert_eq!(config.read().attention.min_score, 0.3);
        assert!(engine.approve(&proposal.id, 5).await.is_err());
    }

    #[tokio::test]
    async fn suggestion_tick_creates_pending_proposal() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _, _) = engine(
            dir.path(),
            r#"{"key": "curiosity.ask_every_n_ticks", "new_value": 4, "reason": "ask more"}"#,
        )
        .await;
        let result = engine.run(SUGGEST_EVERY, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["suggested"], true);
        assert_eq!(engine.history(1)[0].status, ProposalStatus::Pending);
    }
}
