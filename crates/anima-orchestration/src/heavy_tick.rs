//! The fault-tolerant heavy tick: one orchestration cycle per firing.
//!
//! Phase A resets the per-tick accounting, Phase B runs the critical
//! sequential path (monologue → goal → action) under the fallback wrapper,
//! Phase C fans the optional steps out concurrently behind budget
//! admission, and Phase D logs utilization and produces the cycle result.
//! No exception crosses the cycle boundary.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use anima_bus_core::EventBus;
use anima_cognition::{
    AttentionFilter, BeliefSystem, CognitionContext, CuriosityEngine, EmotionEngine, GoalInputs,
    MetaCognition, Milestones, OptionalStep, SelfModel, SharedConfig, StrategyEngine,
    TimePerception, ValueEngine, WorldModel,
};
use anima_llm_gateway::LlmClient;
use anima_resilience::PriorityBudget;
use anima_shell::ShellExecutor;
use anima_store::atomic::{atomic_write_json, load_json_or_default};
use anima_store::{EpisodicStore, VectorStore};
use anima_types::config::PathsConfig;
use anima_types::{ActionType, GoalSpec, Outcome, Priority, StepOutcome};

use crate::fallback_step::FallbackStrategy;
use crate::goal_state::GoalPersistence;

/// Per-step timeouts and LLM cost estimates for the critical path.
const MONOLOGUE_TIMEOUT: Duration = Duration::from_secs(30);
const GOAL_TIMEOUT: Duration = Duration::from_secs(90);
const ACTION_TIMEOUT: Duration = Duration::from_secs(45);
const MONOLOGUE_LLM_COST: u32 = 1;
const GOAL_LLM_COST: u32 = 3;
const ACTION_LLM_COST: u32 = 2;

/// The cognitive collaborators the orchestrator snapshots and drives.
pub struct CognitionSet {
    /// Value dials.
    pub values: Arc<ValueEngine>,
    /// Emotion levels.
    pub emotions: Arc<EmotionEngine>,
    /// Identity and principles.
    pub self_model: Arc<SelfModel>,
    /// Beliefs.
    pub beliefs: Arc<BeliefSystem>,
    /// Goal selection and strategy layers.
    pub strategy: Arc<StrategyEngine>,
    /// Observed filesystem model.
    pub world: Arc<WorldModel>,
    /// Decision-quality insights.
    pub meta: Arc<MetaCognition>,
    /// Tick-interval perception.
    pub time_sense: Arc<TimePerception>,
    /// Open questions.
    pub curiosity: Arc<CuriosityEngine>,
    /// First-time achievements.
    pub milestones: Arc<Milestones>,
}

/// Summary of one orchestration cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleResult {
    /// Heavy-tick number.
    pub tick: u64,
    /// `success` or `error` (a critical step produced nothing).
    pub status: String,
    /// Wall time of the cycle.
    pub duration_secs: f64,
    /// Critical steps that produced a value (real or fallback).
    pub critical_completed: usize,
    /// Optional steps that completed.
    pub optional_completed: usize,
    /// Critical steps served from the fallback cache.
    pub fallbacks_used: usize,
    /// Collected step failure descriptions.
    pub errors: Vec<String>,
}

/// `state.json` — the aggregated snapshot the light tick copies. The heavy
/// tick counter persists here and is *not* reset by restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct RuntimeState {
    tick_count: u64,
    updated_at: String,
    mode: String,
    values: Value,
    last_cycle: Option<CycleResult>,
}

/// The orchestrator. All collaborators are injected; nothing here is a
/// global.
pub struct HeavyTickOrchestrator {
    config: SharedConfig,
    #[allow(dead_code)]
    bus: Arc<EventBus>,
    llm: Arc<dyn LlmClient>,
    episodic: Arc<EpisodicStore>,
    vectors: Arc<VectorStore>,
    budget: Arc<PriorityBudget>,
    fallback: FallbackStrategy,
    goals: Arc<GoalPersistence>,
    shell: Arc<ShellExecutor>,
    cognition: CognitionSet,
    optional_steps: Vec<Arc<dyn OptionalStep>>,
    tick_counter: AtomicU64,
    resume_noted: AtomicBool,
    state_path: PathBuf,
    sandbox_dir: PathBuf,
    monologue_log: PathBuf,
    decision_log: PathBuf,
    last_result: RwLock<Option<CycleResult>>,
}

impl HeavyTickOrchestrator {
    /// Assemble the orchestrator and register the fallback defaults for
    /// every critical step name.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SharedConfig,
        bus: Arc<EventBus>,
        llm: Arc<dyn LlmClient>,
        episodic: Arc<EpisodicStore>,
        vectors: Arc<VectorStore>,
        budget: Arc<PriorityBudget>,
        fallback: FallbackStrategy,
        goals: Arc<GoalPersistence>,
        shell: Arc<ShellExecutor>,
        cognition: CognitionSet,
        optional_steps: Vec<Arc<dyn OptionalStep>>,
        paths: &PathsConfig,
    ) -> Self {
        let state_path = paths.memory_dir.join("state.json");
        let persisted: RuntimeState = load_json_or_default(&state_path);

        fallback
            .cache()
            .set_default("monologue", json!("Thinking about the current situation..."));
        fallback.cache().set_default(
            "goal",
            serde_json::to_value(GoalSpec::safe_default()).unwrap_or_default(),
        );
        fallback
            .cache()
            .set_default("action", json!({"success": true, "outcome": "observed"}));

        info!(resume_tick = persisted.tick_count, "heavy tick orchestrator initialised");
        Self {
            config,
            bus,
            llm,
            episodic,
            vectors,
            budget,
            fallback,
            goals,
            shell,
            cognition,
            optional_steps,
            tick_counter: AtomicU64::new(persisted.tick_count),
            resume_noted: AtomicBool::new(false),
            state_path,
            sandbox_dir: paths.sandbox.clone(),
            monologue_log: paths.logs_dir.join("monologue.log"),
            decision_log: paths.logs_dir.join("decisions.log"),
            last_result: RwLock::new(persisted.last_cycle),
        }
    }

    /// Current heavy-tick number.
    pub fn tick(&self) -> u64 {
        self.tick_counter.load(Ordering::SeqCst)
    }

    /// The last completed cycle's summary.
    pub fn last_result(&self) -> Option<CycleResult> {
        self.last_result.read().clone()
    }

    /// Shutdown hook: mark the active goal interrupted and re-persist it.
    /// The only place allowed to interrupt a goal.
    pub fn shutdown(&self) {
        self.goals.mark_interrupted();
        self.persist_state(None);
    }

    //─────────────────────────────
    //  The cycle
    //─────────────────────────────

    /// Run one orchestration cycle. Never panics through, never raises;
    /// the worst outcome is a result with status `error`.
    pub async fn run_cycle(&self) -> CycleResult {
        let started = Instant::now();
        let tick = self.tick_counter.fetch_add(1, Ordering::SeqCst) + 1;
        info!(tick, "heavy tick starting");

        // Phase A — cycle preamble.
        self.llm.reset_tick_counter();
        self.budget.reset_cycle();
        self.fallback.cache().cleanup_expired();
        self.cognition.time_sense.record_tick();
        self.cognition.emotions.decay();

        let mut errors: Vec<String> = Vec::new();
        let mut fallbacks_used = 0usize;
        let mut critical_completed = 0usize;

        // Phase B — critical sequential path.
        let mut ctx = self.build_context(tick).await;

        let outcome = self
            .critical_step(
                "monologue",
                MONOLOGUE_TIMEOUT,
                MONOLOGUE_LLM_COST,
                self.step_monologue(tick, &ctx),
            )
            .await;
        let monologue = match &outcome {
            StepOutcome::Failed { reason } => {
                return self.abort_cycle(tick, started, "monologue", reason).await;
            }
            StepOutcome::FallbackUsed { value, .. } => {
                fallbacks_used += 1;
                value.as_str().unwrap_or_default().to_string()
            }
            StepOutcome::Success { value } => value.as_str().unwrap_or_default().to_string(),
        };
        critical_completed += 1;
        ctx.monologue = monologue.clone();
        ctx.semantic_context = self.semantic_context(&monologue).await;

        let outcome = self
            .critical_step("goal", GOAL_TIMEOUT, GOAL_LLM_COST, self.step_goal(tick, &ctx))
            .await;
        let goal: GoalSpec = match &outcome {
            StepOutcome::Failed { reason } => {
                return self.abort_cycle(tick, started, "goal", reason).await;
            }
            StepOutcome::FallbackUsed { value, .. } => {
                fallbacks_used += 1;
                serde_json::from_value(value.clone()).unwrap_or_else(|_| GoalSpec::safe_default())
            }
            StepOutcome::Success { value } => {
                serde_json::from_value(value.clone()).unwrap_or_else(|_| GoalSpec::safe_default())
            }
        };
        critical_completed += 1;

        let outcome = self
            .critical_step(
                "action",
                ACTION_TIMEOUT,
                ACTION_LLM_COST,
                self.step_action(tick, &goal, &ctx),
            )
            .await;
        let action_result = match &outcome {
            StepOutcome::Failed { reason } => {
                return self.abort_cycle(tick, started, "action", reason).await;
            }
            StepOutcome::FallbackUsed { value, .. } => {
                fallbacks_used += 1;
                value.clone()
            }
            StepOutcome::Success { value } => value.clone(),
        };
        critical_completed += 1;

        let action_success = action_result["success"].as_bool().unwrap_or(false);
        let action_outcome = action_result["outcome"].as_str().unwrap_or("unknown").to_string();
        self.after_action(tick, &goal, action_success, &action_outcome).await;

        // Phase C — optional parallel path.
        let ctx = Arc::new(ctx);
        let mut tasks = Vec::new();
        for step in &self.optional_steps {
            if self.budget.can_execute(step.priority(), step.llm_cost(), Duration::ZERO) {
                // Reserve the calls at admission so concurrent siblings
                // cannot collectively blow the class cap.
                self.budget.record_usage(step.priority(), step.llm_cost(), Duration::ZERO);
                let step = Arc::clone(step);
                let ctx = Arc::clone(&ctx);
                tasks.push(tokio::spawn(async move {
                    let step_started = Instant::now();
                    let result = tokio::time::timeout(step.timeout(), step.run(tick, &ctx)).await;
                    (step, step_started.elapsed(), result)
                }));
            } else {
                self.budget.record_skip(step.priority(), "budget exhausted");
            }
        }

        let mut optional_completed = 0usize;
        for task in tasks {
            match task.await {
                Ok((step, duration, Ok(Ok(result)))) => {
                    self.budget.record_duration(step.priority(), duration);
                    debug!(step = step.name(), ?result, "optional step completed");
                    optional_completed += 1;
                }
                Ok((step, _, Ok(Err(e)))) => {
                    let message = format!("{}: {e:#}", step.name());
                    self.budget.record_skip(step.priority(), &message);
                    warn!(step = step.name(), error = %format!("{e:#}"), "optional step failed");
                    errors.push(message);
                }
                Ok((step, _, Err(_))) => {
                    let message = format!("{}: timeout", step.name());
                    self.budget.record_skip(step.priority(), &message);
                    warn!(step = step.name(), "optional step timed out");
                    errors.push(message);
                }
                Err(join_error) => {
                    error!(error = %join_error, "optional step task died");
                    errors.push(format!("optional step task died: {join_error}"));
                }
            }
        }

        // Phase D — postamble.
        self.budget.log_summary();
        let result = CycleResult {
            tick,
            status: "success".to_string(),
            duration_secs: started.elapsed().as_secs_f64(),
            critical_completed,
            optional_completed,
            fallbacks_used,
            errors,
        };
        self.persist_state(Some(result.clone()));
        *self.last_result.write() = Some(result.clone());
        info!(
            tick,
            duration_secs = result.duration_secs,
            critical = critical_completed,
            optional = optional_completed,
            fallbacks = fallbacks_used,
            errors = result.errors.len(),
            "heavy tick completed"
        );
        result
    }

    async fn abort_cycle(
        &self,
        tick: u64,
        started: Instant,
        step: &str,
        reason: &str,
    ) -> CycleResult {
        error!(tick, step, reason, "FATAL: critical step produced nothing, aborting cycle");
        self.episodic
            .add_error("heavy_tick.fatal", &format!("critical step '{step}' failed: {reason}"), "external")
            .await;
        let result = CycleResult {
            tick,
            status: "error".to_string(),
            duration_secs: started.elapsed().as_secs_f64(),
            critical_completed: 0,
            optional_completed: 0,
            fallbacks_used: 0,
            errors: vec![format!("{step}: {reason}")],
        };
        self.persist_state(Some(result.clone()));
        *self.last_result.write() = Some(result.clone());
        result
    }

    async fn critical_step<Fut>(
        &self,
        name: &str,
        timeout: Duration,
        llm_cost: u32,
        step: Fut,
    ) -> StepOutcome
    where
        Fut: std::future::Future<Output = anyhow::Result<Value>>,
    {
        info!(step = name, timeout_secs = timeout.as_secs(), "critical step");
        let started = Instant::now();
        let outcome = self.fallback.execute(name, timeout, step).await;
        if !outcome.is_failed() {
            self.budget.record_usage(Priority::Critical, llm_cost, started.elapsed());
        }
        outcome
    }

    //─────────────────────────────
    //  Context assembly
    //─────────────────────────────

    async fn build_context(&self, tick: u64) -> CognitionContext {
        let (min_score, top_k) = {
            let cfg = self.config.read();
            (cfg.attention.min_score, cfg.attention.top_k)
        };
        let attention = AttentionFilter::new(min_score, top_k);
        let recent = self.episodic.get_recent(10).await;
        let filtered = attention.filter(&recent);

        let changes = self
            .cognition
            .world
            .recent_changes(3)
            .iter()
            .map(|c| format!("{}:{}", c.change_type, c.path))
            .collect::<Vec<_>>()
            .join(", ");

        let resume_context = if self.goals.was_interrupted() {
            self.goals.resume_context()
        } else {
            String::new()
        };

        CognitionContext {
            tick,
            monologue: String::new(),
            self_context: self.cognition.self_model.prompt_context(),
            values_context: self.cognition.values.prompt_context(),
            strategy_context: self.cognition.strategy.prompt_context(),
            emotion_context: self.cognition.emotions.prompt_context(),
            tone_modifier: self.cognition.emotions.tone_modifier(),
            beliefs_context: self.cognition.beliefs.prompt_context(3),
            time_context: self.cognition.time_sense.prompt_context(3),
            meta_context: self.cognition.meta.prompt_context(2),
            world_summary: self.cognition.world.summary(),
            recent_changes: if changes.is_empty() { "none".to_string() } else { changes },
            attention_context: attention.build_context(&filtered),
            focus_summary: attention.focus_summary(&filtered),
            open_questions: self.cognition.curiosity.open_questions(3),
            semantic_context: String::new(),
            resume_context,
        }
    }

    async fn semantic_context(&self, monologue: &str) -> String {
        if monologue.is_empty() || self.vectors.count().await == 0 {
            return String::new();
        }
        let query: String = monologue.chars().take(2000).collect();
        let embedding = self.llm.embed(&query).await;
        if embedding.is_empty() {
            return String::new();
        }
        let hits = self.vectors.search(&embedding, 3, None).await;
        if hits.is_empty() {
            return String::new();
        }
        let mut lines = vec!["Similar past experiences:".to_string()];
        for hit in hits {
            let when = chrono::DateTime::from_timestamp(hit.created_at as i64, 0)
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            let text: String = hit.text.chars().take(120).collect();
            lines.push(format!("  [{} | {when} | sim={:.2}] {text}", hit.event_type, hit.score));
        }
        lines.join("\n")
    }

    //─────────────────────────────
    //  Critical steps
    //─────────────────────────────

    async fn step_monologue(&self, tick: u64, ctx: &CognitionContext) -> anyhow::Result<Value> {
        let mut prompt = format!(
            "Your state:\n{}\n{}\n{}\nWorld: {}\nRecent changes: {}\nSignificant episodes:\n{}\n",
            ctx.self_context,
            ctx.values_context,
            ctx.strategy_context,
            ctx.world_summary,
            ctx.recent_changes,
            ctx.attention_context,
        );
        for block in [&ctx.time_context, &ctx.meta_context] {
            if !block.is_empty() {
                prompt.push('\n');
                prompt.push_str(block);
                prompt.push('\n');
            }
        }
        prompt.push_str(
            "\nWrite a short internal monologue (3-5 sentences): what do you notice right \
             now, what worries or interests you, what are you thinking about?",
        );
        if !ctx.beliefs_context.is_empty() {
            prompt.push('\n');
            prompt.push_str(&ctx.beliefs_context);
        }
        if !ctx.open_questions.is_empty() {
            prompt.push_str(&format!("\nOpen questions: {}", ctx.open_questions.join("; ")));
        }

        let mut system = "You are an autonomous digital being. First person, concise.".to_string();
        for extra in [&ctx.emotion_context, &ctx.tone_modifier, &ctx.focus_summary] {
            if !extra.is_empty() {
                system.push('\n');
                system.push_str(extra);
            }
        }

        let text = self.llm.chat(&prompt, &system).await;
        if text.trim().is_empty() {
            anyhow::bail!("LLM returned an empty monologue");
        }
        let text = text.trim().to_string();

        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        append_line(&self.monologue_log, &format!("[{stamp}] TICK #{tick}\n{text}\n---\n")).await;

        let short: String = text.chars().take(1000).collect();
        let episode_id = self
            .episodic
            .add_episode("monologue", &short, Outcome::Success, Some(json!({"tick": tick})))
            .await;

        // Best-effort semantic indexing of the thought.
        if let Some(episode_id) = episode_id {
            let excerpt: String = text.chars().take(500).collect();
            let embedding = self.llm.embed(&excerpt).await;
            if !embedding.is_empty() {
                self.vectors.add(episode_id, "monologue", &excerpt, &embedding).await;
            }
        }

        info!(tick, chars = text.len(), "monologue written");
        Ok(Value::String(text))
    }

    async fn step_goal(&self, tick: u64, ctx: &CognitionContext) -> anyhow::Result<Value> {
        if !ctx.resume_context.is_empty() && !self.resume_noted.swap(true, Ordering::SeqCst) {
            self.goals.increment_resume();
            info!(tick, "recovery tick, resume context injected");
        }

        let last_action = self
            .goals
            .active()
            .map(|g| g.spec.action_type)
            .unwrap_or(ActionType::Observe);
        let recent_similar = self
            .episodic
            .count_recent_similar(&format!("heavy_tick.{last_action}"), 2)
            .await;

        let inputs = GoalInputs {
            monologue: ctx.monologue.clone(),
            semantic_context: ctx.semantic_context.clone(),
            emotion_context: ctx.emotion_context.clone(),
            resume_context: ctx.resume_context.clone(),
            attention_context: ctx.attention_context.clone(),
            focus_summary: ctx.focus_summary.clone(),
            mode: self.cognition.values.mode().to_string(),
            allowed_commands: self
                .shell
                .allowed_commands()
                .into_iter()
                .map(str::to_string)
                .collect(),
            recent_similar,
        };

        let goal = self.cognition.strategy.select_goal(self.llm.as_ref(), &inputs).await;
        self.goals.set_active(goal.clone(), tick);
        info!(
            tick,
            goal = %goal.goal.chars().take(80).collect::<String>(),
            action = %goal.action_type,
            risk = goal.risk_level.as_str(),
            "goal selected"
        );
        Ok(serde_json::to_value(goal)?)
    }

    async fn step_action(
        &self,
        tick: u64,
        goal: &GoalSpec,
        ctx: &CognitionContext,
    ) -> anyhow::Result<Value> {
        let (success, outcome) = match goal.action_type {
            ActionType::Observe => {
                info!(tick, "action: observe (passive tick)");
                (true, "observed".to_string())
            }
            ActionType::Analyze => {
                let anomalies = self.cognition.world.detect_anomalies();
                if anomalies.is_empty() {
                    (true, "analyzed:no_anomalies".to_string())
                } else {
                    (true, format!("analyzed:{}_anomalies", anomalies.len()))
                }
            }
            ActionType::Write => self.action_write(tick, goal, ctx).await,
            ActionType::Reflect => self.action_reflect(tick).await,
            ActionType::Shell => self.action_shell(tick, goal).await,
        };
        Ok(json!({"success": success, "outcome": outcome}))
    }

    async fn action_write(&self, tick: u64, goal: &GoalSpec, ctx: &CognitionContext) -> (bool, String) {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let name = format!("thought_{stamp}_tick{tick}.txt");
        let path = self.sandbox_dir.join(&name);
        let content = format!(
            "=== Anima — Tick #{tick} ===\nGoal: {}\nTime: {}\n\nMonologue:\n{}\n",
            goal.goal,
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            ctx.monologue,
        );
        if let Err(e) = tokio::fs::create_dir_all(&self.sandbox_dir).await {
            error!(error = %e, "sandbox directory unavailable");
            return (false, "write_error".to_string());
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => {
                info!(tick, file = %name, "artifact written");
                (true, format!("written:{name}"))
            }
            Err(e) => {
                error!(error = %e, "write action failed");
                (false, "write_error".to_string())
            }
        }
    }

    async fn action_reflect(&self, tick: u64) -> (bool, String) {
        let mut error_episodes = self.episodic.get_by_type("error", 5, None).await;
        if error_episodes.is_empty() {
            error_episodes = self
                .episodic
                .get_recent(20)
                .await
                .into_iter()
                .filter(|e| e.outcome == Outcome::Failure)
                .take(5)
                .collect();
        }
        if error_episodes.is_empty() {
            info!(tick, "reflect: no errors found");
            return (true, "reflect:no_errors".to_string());
        }

        let block = error_episodes
            .iter()
            .map(|e| {
                let desc: String = e.description.chars().take(120).collect();
                format!("- [{}] {desc}", e.event_type)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Recent system errors:\n{block}\n\nFormulate ONE short rule (1 sentence) that \
             would avoid them. Answer with the rule text only."
        );
        let principle = self
            .llm
            .chat(&prompt, "You distil rules from your own mistakes.")
            .await;
        let principle = principle.trim().to_string();
        if principle.is_empty() {
            return (false, "reflect:empty_principle".to_string());
        }

        let added = self.cognition.self_model.add_principle(&principle).await;
        if added {
            self.episodic.add_principle(&principle, None).await;
            self.cognition
                .milestones
                .achieve("first_error_reflection", "derived a principle from errors", tick)
                .await;
            info!(tick, "reflect: new principle added");
            (true, "reflect:principle_added".to_string())
        } else {
            (true, "reflect:principle_duplicate".to_string())
        }
    }

    async fn action_shell(&self, tick: u64, goal: &GoalSpec) -> (bool, String) {
        let Some(command) = goal.shell_command.as_deref().filter(|c| !c.trim().is_empty()) else {
            warn!(tick, "shell action with no command");
            return (false, "shell:no_command".to_string());
        };
        info!(tick, command = %command.chars().take(80).collect::<String>(), "executing shell command");
        let result = self.shell.execute_safe(command, &self.episodic).await;
        if result.success {
            (true, format!("shell:executed:{}", result.exit_code))
        } else {
            (false, "shell:error".to_string())
        }
    }

    async fn after_action(&self, tick: u64, goal: &GoalSpec, success: bool, outcome: &str) {
        self.cognition
            .values
            .update_after_action(success, &format!("heavy_tick.{}", goal.action_type))
            .await;
        self.cognition
            .emotions
            .update(&format!("heavy_tick.{}", goal.action_type), success);
        self.cognition.strategy.set_now(&goal.goal, goal.action_type.as_str());

        if success {
            self.goals.mark_completed(tick);
        }

        let goal_short: String = goal.goal.chars().take(200).collect();
        self.episodic
            .add_episode(
                &format!("heavy_tick.{}", goal.action_type),
                &format!("Tick #{tick}: goal='{goal_short}' outcome={outcome}"),
                if success { Outcome::Success } else { Outcome::Failure },
                Some(json!({
                    "tick": tick,
                    "action_type": goal.action_type.as_str(),
                    "risk_level": goal.risk_level.as_str(),
                    "mode": self.cognition.values.mode(),
                })),
            )
            .await;

        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let goal_line: String = goal.goal.chars().take(80).collect();
        append_line(
            &self.decision_log,
            &format!(
                "[{stamp}] TICK #{tick} | goal={goal_line} | action={} | risk={} | outcome={outcome}\n",
                goal.action_type,
                goal.risk_level.as_str(),
            ),
        )
        .await;
        info!(tick, action = %goal.action_type, outcome, "action dispatched");
    }

    fn persist_state(&self, last_cycle: Option<CycleResult>) {
        let state = RuntimeState {
            tick_count: self.tick(),
            updated_at: anima_types::now_iso(),
            mode: self.cognition.values.mode().to_string(),
            values: self.cognition.values.snapshot(),
            last_cycle: last_cycle.or_else(|| self.last_result.read().clone()),
        };
        if let Err(e) = atomic_write_json(&self.state_path, &state) {
            error!(error = %e, "failed to persist runtime state");
        }
    }
}

async fn append_line(path: &std::path::Path, line: &str) {
    use tokio::io::AsyncWriteExt;
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    match tokio::fs::OpenOptions::new().create(true).append(true).open(path).await {
        Ok(mut file) => {
            if let Err(e) = file.write_all(line.as_bytes()).await {
                error!(path = %path.display(), error = %e, "log append failed");
            }
        }
        Err(e) => error!(path = %path.display(), error = %e, "log open failed"),
    }
}
