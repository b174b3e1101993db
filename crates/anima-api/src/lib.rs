#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **anima-api** – The introspection HTTP surface of the Anima runtime.
//!
//! Read-mostly JSON endpoints composed from each component's public query
//! contract, plus a narrow command surface: send a chat message, run a
//! shell command, approve or reject a self-modification proposal. CORS is
//! wide open and there is no authentication; this surface is meant for a
//! local operator watching the being think.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use anima_cognition::{
    BeliefSystem, CuriosityEngine, DreamEngine, EmotionEngine, MetaCognition, Milestones,
    NarrativeEngine, ReflectionEngine, SelfModel, SelfModificationEngine, SharedConfig,
    SocialLayer, StrategyEngine, TimePerception, ValueEngine, WorldModel,
};
use anima_llm_gateway::{LlmClient, LlmGateway};
use anima_orchestration::{GoalPersistence, HeavyTickOrchestrator};
use anima_resilience::{FallbackCache, HealthMonitor, PriorityBudget};
use anima_shell::ShellExecutor;
use anima_store::{EpisodicStore, VectorStore};

/// Everything the handlers read. All fields are shared handles; the server
/// owns nothing.
#[derive(Clone)]
pub struct ApiState {
    /// Runtime-mutable configuration.
    pub config: SharedConfig,
    /// Process start, for uptime.
    pub started: Instant,
    /// Embedding access for `/search`.
    pub llm: Arc<dyn LlmClient>,
    /// Concrete gateway for its stats block, when running with one.
    pub gateway: Option<Arc<LlmGateway>>,
    /// Episodic log.
    pub episodic: Arc<EpisodicStore>,
    /// Vector store.
    pub vectors: Arc<VectorStore>,
    /// Health monitor.
    pub health: Arc<HealthMonitor>,
    /// Prioritized budget.
    pub budget: Arc<PriorityBudget>,
    /// Fallback cache.
    pub fallback: Arc<FallbackCache>,
    /// The heavy tick orchestrator.
    pub orchestrator: Arc<HeavyTickOrchestrator>,
    /// Goal persistence.
    pub goals: Arc<GoalPersistence>,
    /// Shell executor.
    pub shell: Arc<ShellExecutor>,
    /// Social layer (outbox parsing).
    pub social: Arc<SocialLayer>,
    /// Value engine.
    pub values: Arc<ValueEngine>,
    /// Emotion engine.
    pub emotions: Arc<EmotionEngine>,
    /// Belief system.
    pub beliefs: Arc<BeliefSystem>,
    /// Strategy engine.
    pub strategy: Arc<StrategyEngine>,
    /// Self model.
    pub self_model: Arc<SelfModel>,
    /// Meta-cognition.
    pub meta: Arc<MetaCognition>,
    /// Time perception.
    pub time_sense: Arc<TimePerception>,
    /// Curiosity engine.
    pub curiosity: Arc<CuriosityEngine>,
    /// Milestones.
    pub milestones: Arc<Milestones>,
    /// World model.
    pub world: Arc<WorldModel>,
    /// Narrative engine.
    pub narrative: Arc<NarrativeEngine>,
    /// Reflection engine.
    pub reflection: Arc<ReflectionEngine>,
    /// Self-modification engine.
    pub modification: Arc<SelfModificationEngine>,
    /// Dream engine.
    pub dream: Arc<DreamEngine>,
    /// Inbox file `/chat/send` appends to.
    pub inbox_path: PathBuf,
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

/// Build the router over the shared state.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/memory", get(handle_memory))
        .route("/values", get(handle_values))
        .route("/strategy", get(handle_strategy))
        .route("/emotions", get(handle_emotions))
        .route("/beliefs", get(handle_beliefs))
        .route("/contradictions", get(handle_contradictions))
        .route("/milestones", get(handle_milestones))
        .route("/episodes", get(handle_episodes))
        .route("/search", get(handle_search))
        .route("/diary", get(handle_diary))
        .route("/reflection", get(handle_reflection))
        .route("/dream", get(handle_dream))
        .route("/time", get(handle_time))
        .route("/meta-cognition", get(handle_meta))
        .route("/skills", get(handle_skills))
        .route("/curiosity", get(handle_curiosity))
        .route("/modifications", get(handle_modifications))
        .route("/modifications/approve", post(handle_approve))
        .route("/modifications/reject", post(handle_reject))
        .route("/shell/stats", get(handle_shell_stats))
        .route("/shell/execute", post(handle_shell_execute))
        .route("/chat/outbox", get(handle_outbox))
        .route("/chat/send", post(handle_chat_send))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

//─────────────────────────────
//  Read endpoints
//─────────────────────────────

async fn handle_status(State(state): State<ApiState>) -> Json<Value> {
    let gateway = state.gateway.as_ref().map(|g| serde_json::to_value(g.stats()).unwrap_or_default());
    Json(json!({
        "uptime_secs": state.started.elapsed().as_secs(),
        "tick": state.orchestrator.tick(),
        "last_cycle": state.orchestrator.last_result(),
        "mode": state.values.mode(),
        "budget": state.budget.usage_report(),
        "gateway": gateway,
        "health": state.health.all_statuses(),
        "fallback_cache": state.fallback.stats(),
        "goal": state.goals.snapshot(),
    }))
}

async fn handle_memory(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "episodes": state.episodic.count().await,
        "recent": state.episodic.get_recent(10).await,
        "errors": state.episodic.recent_errors(5).await,
        "vectors": state.vectors.count().await,
        "principles": state.episodic.get_active_principles().await,
    }))
}

async fn handle_values(State(state): State<ApiState>) -> Json<Value> {
    Json(state.values.snapshot())
}

async fn handle_strategy(State(state): State<ApiState>) -> Json<Value> {
    Json(state.strategy.snapshot())
}

async fn handle_emotions(State(state): State<ApiState>) -> Json<Value> {
    Json(state.emotions.snapshot())
}

async fn handle_beliefs(State(state): State<ApiState>) -> Json<Value> {
    Json(state.beliefs.snapshot())
}

async fn handle_contradictions(State(state): State<ApiState>) -> Json<Value> {
    let candidates = state.beliefs.candidate_pairs();
    Json(json!({
        "resolved": state.beliefs.contradictions_resolved(),
        "open_candidates": candidates
            .iter()
            .map(|(a, b)| json!({"first": a.text, "second": b.text}))
            .collect::<Vec<_>>(),
    }))
}

async fn handle_milestones(State(state): State<ApiState>) -> Json<Value> {
    Json(state.milestones.snapshot())
}

#[derive(Deserialize)]
struct EpisodesQuery {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    event_type: Option<String>,
}

async fn handle_episodes(
    State(state): State<ApiState>,
    Query(query): Query<EpisodesQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    let episodes = match query.event_type.as_deref() {
        Some(event_type) => state.episodic.get_by_type(event_type, limit, None).await,
        None => state.episodic.get_recent(limit).await,
    };
    Json(json!({"episodes": episodes}))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default)]
    top_k: Option<usize>,
}

async fn handle_search(
    State(state): State<ApiState>,
    Query(query): Query<SearchQuery>,
) -> Response {
    if query.q.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "query 'q' must not be empty");
    }
    let embedding = state.llm.embed(&query.q).await;
    if embedding.is_empty() {
        return api_error(StatusCode::SERVICE_UNAVAILABLE, "embedding backend unavailable");
    }
    let hits = state.vectors.search(&embedding, query.top_k.unwrap_or(5).clamp(1, 50), None).await;
    Json(json!({"results": hits})).into_response()
}

async fn handle_diary(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "diary": state.narrative.diary().await,
        "log": state.narrative.snapshot(),
    }))
}

async fn handle_reflection(State(state): State<ApiState>) -> Json<Value> {
    Json(state.reflection.snapshot())
}

async fn handle_dream(State(state): State<ApiState>) -> Json<Value> {
    Json(state.dream.snapshot())
}

async fn handle_time(State(state): State<ApiState>) -> Json<Value> {
    Json(state.time_sense.snapshot())
}

async fn handle_meta(State(state): State<ApiState>) -> Json<Value> {
    Json(state.meta.snapshot())
}

async fn handle_skills(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "principles": state.self_model.principles(),
        "shell_commands": state.shell.allowed_commands(),
        "world": state.world.snapshot(),
    }))
}

async fn handle_curiosity(State(state): State<ApiState>) -> Json<Value> {
    Json(state.curiosity.snapshot())
}

async fn handle_modifications(State(state): State<ApiState>) -> Json<Value> {
    Json(state.modification.snapshot())
}

async fn handle_shell_stats(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "stats": state.shell.stats(),
        "allowed_commands": state.shell.allowed_commands(),
        "allowed_dir": state.shell.allowed_dir().display().to_string(),
    }))
}

async fn handle_outbox(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({"messages": state.social.read_outbox().await}))
}

//─────────────────────────────
//  Command endpoints
//─────────────────────────────

#[derive(Deserialize)]
struct ChatSendBody {
    message: String,
}

async fn handle_chat_send(
    State(state): State<ApiState>,
    Json(body): Json<ChatSendBody>,
) -> Response {
    if body.message.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "message must not be empty");
    }
    // Append a line; the light tick picks it up on its next pass.
    let mut line = body.message.trim().to_string();
    line.push('\n');
    let existing = tokio::fs::read_to_string(&state.inbox_path).await.unwrap_or_default();
    let combined = format!("{existing}{line}");
    if let Err(e) = tokio::fs::write(&state.inbox_path, combined).await {
        error!(error = %e, "inbox write failed");
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, "could not write inbox");
    }
    Json(json!({"queued": true})).into_response()
}

#[derive(Deserialize)]
struct ShellExecuteBody {
    command: String,
}

async fn handle_shell_execute(
    State(state): State<ApiState>,
    Json(body): Json<ShellExecuteBody>,
) -> Json<Value> {
    let result = state.shell.execute_safe(&body.command, &state.episodic).await;
    Json(serde_json::to_value(result).unwrap_or_default())
}

#[derive(Deserialize)]
struct ProposalBody {
    id: String,
}

async fn handle_approve(
    State(state): State<ApiState>,
    Json(body): Json<ProposalBody>,
) -> Response {
    match state.modification.approve(&body.id, state.orchestrator.tick()).await {
        Ok(proposal) => Json(serde_json::to_value(proposal).unwrap_or_default()).into_response(),
        Err(reason) => api_error(StatusCode::BAD_REQUEST, reason),
    }
}

async fn handle_reject(State(state): State<ApiState>, Json(body): Json<ProposalBody>) -> Response {
    match state.modification.reject(&body.id) {
        Ok(proposal) => Json(serde_json::to_value(proposal).unwrap_or_default()).into_response(),
        Err(reason) => api_error(StatusCode::BAD_REQUEST, reason),
    }
}

//─────────────────────────────
//  Server lifecycle
//─────────────────────────────

/// The running server task, stoppable and awaitable.
pub struct IntrospectionServer {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
    local_addr: std::net::SocketAddr,
}

impl IntrospectionServer {
    /// Bind and start serving.
    pub async fn start(state: ApiState, host: &str, port: u16) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let app = router(state);

        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                error!(error = %e, "introspection server failed");
            }
        });
        info!(%local_addr, "introspection server listening");
        Ok(Self { cancel, handle, local_addr })
    }

    /// The bound address (useful when port 0 was requested).
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Graceful shutdown; awaits the server task.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
        info!("introspection server stopped");
    }
}
