//! Endpoint tests driven through the router with `tower::ServiceExt`,
//! against in-memory stores and an LLM double.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use anima_api::{router, ApiState};
use anima_bus_core::EventBus;
use anima_cognition::{
    BeliefSystem, CuriosityEngine, DreamEngine, EmotionEngine, MetaCognition, Milestones,
    NarrativeEngine, ReflectionEngine, SelfModel, SelfModificationEngine, SharedConfig,
    SocialLayer, StrategyEngine, TimePerception, ValueEngine, WorldModel,
};
use anima_llm_gateway::LlmClient;
use anima_orchestration::{CognitionSet, FallbackStrategy, GoalPersistence, HeavyTickOrchestrator};
use anima_resilience::{FallbackCache, HealthMonitor, PriorityBudget};
use anima_shell::ShellExecutor;
use anima_store::{EpisodicStore, VectorStore};
use anima_types::config::PathsConfig;
use anima_types::Config;

struct StubLlm;

#[async_trait]
impl LlmClient for StubLlm {
    async fn chat(&self, _prompt: &str, _system: &str) -> String {
        String::new()
    }
    async fn embed(&self, _text: &str) -> Vec<f32> {
        vec![1.0, 0.0, 0.0, 0.0]
    }
    async fn is_available(&self) -> bool {
        false
    }
    fn reset_tick_counter(&self) {}
    fn calls_this_tick(&self) -> u32 {
        0
    }
}

async fn state(root: &std::path::Path) -> ApiState {
    let paths = PathsConfig::under(root);
    std::fs::create_dir_all(&paths.memory_dir).unwrap();
    std::fs::create_dir_all(&paths.sandbox).unwrap();
    std::fs::create_dir_all(&paths.logs_dir).unwrap();
    std::fs::write(&paths.inbox, "").unwrap();

    let config: SharedConfig = Arc::new(parking_lot::RwLock::new(Config::default()));
    let bus = Arc::new(EventBus::default());
    let llm: Arc<dyn LlmClient> = Arc::new(StubLlm);
    let episodic = Arc::new(EpisodicStore::in_memory().await.unwrap());
    let vectors = Arc::new(VectorStore::in_memory(4).await.unwrap());
    let budget = Arc::new(PriorityBudget::default());
    let fallback = Arc::new(FallbackCache::new(Duration::from_secs(300)));
    let goals = Arc::new(GoalPersistence::new(&paths.memory_dir));
    let shell = Arc::new(ShellExecutor::new(&paths.sandbox, &paths.memory_dir, 2000));
    let health = Arc::new(HealthMonitor::new(Duration::from_secs(30), 3));

    let values = Arc::new(ValueEngine::new(&paths.memory_dir, Arc::clone(&bus)));
    let emotions = Arc::new(EmotionEngine::new(&paths.memory_dir));
    let self_model = Arc::new(SelfModel::new(&paths.memory_dir, Arc::clone(&bus)));
    let beliefs = Arc::new(BeliefSystem::new(&paths.memory_dir, Arc::clone(&llm)));
    let strategy = Arc::new(StrategyEngine::new(&paths.memory_dir, Arc::clone(&bus)));
    let world = Arc::new(WorldModel::new(Arc::clone(&bus)));
    let meta = Arc::new(MetaCognition::new(&paths.memory_dir, Arc::clone(&llm), Arc::clone(&episodic)));
    let time_sense = Arc::new(TimePerception::new(&paths.memory_dir));
    let curiosity =
        Arc::new(CuriosityEngine::new(&paths.memory_dir, Arc::clone(&llm), Arc::clone(&config)));
    let milestones = Arc::new(Milestones::new(&paths.memory_dir, Arc::clone(&bus)));
    let social = Arc::new(SocialLayer::new(&paths.outbox, Arc::clone(&llm), Arc::clone(&episodic)));
    let narrative = Arc::new(NarrativeEngine::new(
        &paths.memory_dir,
        Arc::clone(&llm),
        Arc::clone(&bus),
        Arc::clone(&config),
    ));
    let reflection = Arc::new(ReflectionEngine::new(
        &paths.memory_dir,
        Arc::clone(&llm),
        Arc::clone(&bus),
        Arc::clone(&episodic),
        Arc::clone(&beliefs),
        Arc::clone(&self_model),
        Arc::clone(&config),
    ));
    let modification = Arc::new(SelfModificationEngine::new(
        &paths.memory_dir,
        Arc::clone(&llm),
        Arc::clone(&bus),
        Arc::clone(&episodic),
        Arc::clone(&config),
    ));
    let dream = Arc::new(DreamEngine::new(
        &paths.memory_dir,
        Arc::clone(&llm),
        Arc::clone(&bus),
        Arc::clone(&episodic),
        Arc::clone(&config),
    ));

    let cognition = CognitionSet {
        values: Arc::clone(&values),
        emotions: Arc::clone(&emotions),
        self_model: Arc::clone(&self_model),
        beliefs: Arc::clone(&beliefs),
        strategy: Arc::clone(&strategy),
        world: Arc::clone(&world),
        meta: Arc::clone(&meta),
        time_sense: Arc::clone(&time_sense),
        curiosity: Arc::clone(&curiosity),
        milestones: Arc::clone(&milestones),
    };
    let orchestrator = Arc::new(HeavyTickOrchestrator::new(
        Arc::clone(&config),
        Arc::clone(&bus),
        Arc::clone(&llm),
        Arc::clone(&episodic),
        Arc::clone(&vectors),
        Arc::clone(&budget),
        FallbackStrategy::new(Arc::clone(&fallback), Duration::from_secs(300)),
        Arc::clone(&goals),
        Arc::clone(&shell),
        cognition,
        Vec::new(),
        &paths,
    ));

    ApiState {
        config,
        started: Instant::now(),
        llm,
        gateway: None,
        episodic,
        vectors,
        health,
        budget,
        fallback,
        orchestrator,
        goals,
        shell,
        social,
        values,
        emotions,
        beliefs,
        strategy,
        self_model,
        meta,
        time_sense,
        curiosity,
        milestones,
        world,
        narrative,
        reflection,
        modification,
        dream,
        inbox_path: paths.inbox.clone(),
    }
}

async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn post_json(app: &axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn status_reports_tick_and_budget() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(state(dir.path()).await);

    let (status, body) = get_json(&app, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tick"], 0);
    assert!(body["budget"]["priorities"]["CRITICAL"].is_object());
    assert!(body["gateway"].is_null());
}

#[tokio::test]
async fn episodes_filter_by_event_type() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path()).await;
    state
        .episodic
        .add_episode("monologue", "thought one", anima_types::Outcome::Success, None)
        .await;
    state
        .episodic
        .add_episode("shell.executed", "ran ls", anima_types::Outcome::Success, None)
        .await;
    let app = router(state);

    let (status, body) = get_json(&app, "/episodes?event_type=monologue&limit=5").await;
    assert_eq!(status, StatusCode::OK);
    let episodes = body["episodes"].as_array().unwrap();
    assert_eq!(episodes.len(), 1);
    assert_eq!(episodes[0]["event_type"], "monologue");
}

#[tokio::test]
async fn shell_rejection_is_visible_through_episodes() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(state(dir.path()).await);

    let (status, body) =
        post_json(&app, "/shell/execute", json!({"command": "ls | rm -rf /"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("'|'"));

    let (_, episodes) = get_json(&app, "/episodes?event_type=shell.rejected&limit=1").await;
    let episodes = episodes["episodes"].as_array().unwrap();
    assert_eq!(episodes.len(), 1);
    assert!(episodes[0]["description"].as_str().unwrap().contains("ls | rm -rf /"));
}

#[tokio::test]
async fn chat_send_appends_to_inbox() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path()).await;
    let inbox = state.inbox_path.clone();
    let app = router(state);

    let (status, body) = post_json(&app, "/chat/send", json!({"message": "hello being"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queued"], true);
    assert_eq!(std::fs::read_to_string(&inbox).unwrap(), "hello being\n");

    let (status, _) = post_json(&app, "/chat/send", json!({"message": "   "})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn search_uses_the_vector_store() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path()).await;
    state.vectors.add(1, "monologue", "about files", &[1.0, 0.0, 0.0, 0.0]).await;
    let app = router(state);

    let (status, body) = get_json(&app, "/search?q=files&top_k=3").await;
    assert_eq!(status, StatusCode::OK);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["text"], "about files");
}

#[tokio::test]
async fn proposal_approval_flow_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path()).await;
    let proposal = state.modification.propose("attention.top_k", 8.0, "wider").unwrap();
    let config = Arc::clone(&state.config);
    let app = router(state);

    let (status, body) = post_json(&app, "/modifications/approve", json!({"id": proposal.id})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "approved");
    assert_eq!(config.read().attention.top_k, 8);

    // Approving twice is a client error with the JSON error shape.
    let (status, body) = post_json(&app, "/modifications/approve", json!({"id": proposal.id})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn read_endpoints_answer_with_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(state(dir.path()).await);
    for uri in [
        "/values",
        "/strategy",
        "/emotions",
        "/beliefs",
        "/contradictions",
        "/milestones",
        "/diary",
        "/reflection",
        "/dream",
        "/time",
        "/meta-cognition",
        "/skills",
        "/curiosity",
        "/modifications",
        "/shell/stats",
        "/chat/outbox",
        "/memory",
    ] {
        let (status, _) = get_json(&app, uri).await;
        assert_eq!(status, StatusCode::OK, "endpoint {uri} failed");
    }
}
