#![forbid(unsafe_code)]

//! **anima-service** – The Anima daemon.
//!
//! Loads the configuration, constructs every component explicitly, injects
//! them into the orchestrator and the HTTP surface, and runs the two tick
//! loops until a shutdown signal. Exit code is 0 on clean shutdown and
//! non-zero only when the configuration fails to load.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use anima_api::{ApiState, IntrospectionServer};
use anima_bus_core::EventBus;
use anima_cognition::{
    BeliefSystem, ContradictionStep, CuriosityEngine, DreamEngine, EmotionEngine, MetaCognition,
    Milestones, NarrativeEngine, OptionalStep, ReflectionEngine, SelfModel,
    SelfModificationEngine, SharedConfig, SocialLayer, StrategyEngine, TimePerception,
    ValueEngine, WorldModel, WorldWatcher,
};
use anima_llm_gateway::{LlmClient, LlmGateway};
use anima_orchestration::{
    AnimaRuntime, CognitionSet, FallbackStrategy, GoalPersistence, HeavyTickOrchestrator,
    LightTick, MaintenanceStep,
};
use anima_resilience::{FallbackCache, HealthMonitor, PriorityBudget};
use anima_shell::ShellExecutor;
use anima_store::{EpisodicStore, VectorStore};
use anima_types::config::PathsConfig;
use anima_types::Config;

/// Exit code used when the configuration cannot be loaded.
const EXIT_CONFIG: i32 = 2;

#[derive(Parser)]
#[command(name = "anima")]
#[command(about = "Anima - an autonomous digital being runtime")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML). Missing file means defaults.
    #[arg(long, default_value = "anima.toml")]
    config: PathBuf,

    /// Base directory for memory, logs, sandbox, inbox and outbox.
    /// Overrides `paths` from the config file.
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Log filter (tracing syntax, e.g. `info` or `anima=debug`).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration {}: {e}", cli.config.display());
            std::process::exit(EXIT_CONFIG);
        }
    };
    if let Some(base) = &cli.base_dir {
        config.paths = PathsConfig::under(base);
    }

    match run(config).await {
        Ok(()) => info!("clean shutdown"),
        Err(e) => {
            // Runtime failures after a successful config load still exit 0;
            // the error is operator information, not a status code.
            error!(error = %format!("{e:#}"), "runtime error during shutdown");
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let paths = config.paths.clone();
    for dir in [&paths.memory_dir, &paths.sandbox, &paths.logs_dir, &paths.snapshots_dir] {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let started = Instant::now();
    let shared: SharedConfig = Arc::new(parking_lot::RwLock::new(config.clone()));
    let bus = Arc::new(EventBus::default());

    // Stores.
    let episodic = Arc::new(
        EpisodicStore::open(paths.memory_dir.join("episodic.db"))
            .await
            .context("opening episodic store")?,
    );
    let vectors = Arc::new(
        VectorStore::open(paths.memory_dir.join("vector.db"), config.memory.vector_dim)
            .await
            .context("opening vector store")?,
    );

    // Gateway and reliability substrate.
    let gateway = Arc::new(LlmGateway::new(&config).context("building LLM gateway")?);
    let llm: Arc<dyn LlmClient> = Arc::clone(&gateway) as Arc<dyn LlmClient>;
    let budget = Arc::new(PriorityBudget::default());
    let fallback = Arc::new(FallbackCache::new(Duration::from_secs(300)));
    let goals = Arc::new(GoalPersistence::new(&paths.memory_dir));
    let shell = Arc::new(ShellExecutor::new(&paths.root, &paths.memory_dir, 2000));

    // Cognitive components.
    let values = Arc::new(ValueEngine::new(&paths.memory_dir, Arc::clone(&bus)));
    let emotions = Arc::new(EmotionEngine::new(&paths.memory_dir));
    let self_model = Arc::new(SelfModel::new(&paths.memory_dir, Arc::clone(&bus)));
    let beliefs = Arc::new(BeliefSystem::new(&paths.memory_dir, Arc::clone(&llm)));
    let strategy = Arc::new(StrategyEngine::new(&paths.memory_dir, Arc::clone(&bus)));
    let world = Arc::new(WorldModel::new(Arc::clone(&bus)));
    let meta = Arc::new(MetaCognition::new(&paths.memory_dir, Arc::clone(&llm), Arc::clone(&episodic)));
    let time_sense = Arc::new(TimePerception::new(&paths.memory_dir));
    let curiosity =
        Arc::new(CuriosityEngine::new(&paths.memory_dir, Arc::clone(&llm), Arc::clone(&shared)));
    let milestones = Arc::new(Milestones::new(&paths.memory_dir, Arc::clone(&bus)));
    let social = Arc::new(SocialLayer::new(&paths.outbox, Arc::clone(&llm), Arc::clone(&episodic)));
    let narrative = Arc::new(NarrativeEngine::new(
        &paths.memory_dir,
        Arc::clone(&llm),
        Arc::clone(&bus),
        Arc::clone(&shared),
    ));
    let reflection = Arc::new(ReflectionEngine::new(
        &paths.memory_dir,
        Arc::clone(&llm),
        Arc::clone(&bus),
        Arc::clone(&episodic),
        Arc::clone(&beliefs),
        Arc::clone(&self_model),
        Arc::clone(&shared),
    ));
    let modification = Arc::new(SelfModificationEngine::new(
        &paths.memory_dir,
        Arc::clone(&llm),
        Arc::clone(&bus),
        Arc::clone(&episodic),
        Arc::clone(&shared),
    ));
    let dream = Arc::new(DreamEngine::new(
        &paths.memory_dir,
        Arc::clone(&llm),
        Arc::clone(&bus),
        Arc::clone(&episodic),
        Arc::clone(&shared),
    ));

    // Wire the bus consumers and the world.
    social.subscribe(&bus).await;
    world.subscribe(&bus).await;
    world.scan(&paths.watch_dir).await;
    let watcher = match WorldWatcher::start(Arc::clone(&bus), &paths.watch_dir) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "file watcher unavailable, world runs on scans only");
            None
        }
    };

    // Health monitoring.
    let health = Arc::new(HealthMonitor::new(Duration::from_secs(30), 3));
    {
        let gateway = Arc::clone(&gateway);
        health.register("ollama", Duration::from_secs(10), move || {
            let gateway = Arc::clone(&gateway);
            async move { gateway.is_available().await }
        });
    }
    {
        let episodic = Arc::clone(&episodic);
        health.register("episodic", Duration::from_secs(1), move || {
            let episodic = Arc::clone(&episodic);
            async move { episodic.health_check().await }
        });
    }
    {
        let vectors = Arc::clone(&vectors);
        health.register("vector", Duration::from_secs(1), move || {
            let vectors = Arc::clone(&vectors);
            async move { vectors.health_check().await }
        });
    }
    health.add_listener(Arc::new(|service, status| {
        if status.healthy {
            info!(service, "service recovered, leaving degraded mode");
        } else {
            warn!(service, "service unhealthy, entering degraded mode");
        }
    }));
    health.start();

    // The orchestrator and its optional steps.
    let optional_steps: Vec<Arc<dyn OptionalStep>> = vec![
        Arc::clone(&beliefs) as Arc<dyn OptionalStep>,
        Arc::new(ContradictionStep::new(Arc::clone(&beliefs), Arc::clone(&llm))),
        Arc::clone(&curiosity) as Arc<dyn OptionalStep>,
        Arc::clone(&social) as Arc<dyn OptionalStep>,
        Arc::clone(&meta) as Arc<dyn OptionalStep>,
        Arc::clone(&time_sense) as Arc<dyn OptionalStep>,
        Arc::clone(&narrative) as Arc<dyn OptionalStep>,
        Arc::clone(&reflection) as Arc<dyn OptionalStep>,
        Arc::clone(&dream) as Arc<dyn OptionalStep>,
        Arc::clone(&modification) as Arc<dyn OptionalStep>,
        Arc::new(MaintenanceStep::new(
            Arc::clone(&episodic),
            Arc::clone(&vectors),
            Arc::clone(&strategy),
            Arc::clone(&shared),
        )),
    ];

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
        Arc::clone(&shared),
        Arc::clone(&bus),
        Arc::clone(&llm),
        Arc::clone(&episodic),
        Arc::clone(&vectors),
        Arc::clone(&budget),
        FallbackStrategy::new(Arc::clone(&fallback), Duration::from_secs(300)),
        Arc::clone(&goals),
        Arc::clone(&shell),
        cognition,
        optional_steps,
        &paths,
    ));

    let cancel = CancellationToken::new();
    let light = Arc::new(LightTick::new(
        Duration::from_secs_f64(config.ticks.light_tick_sec),
        Arc::clone(&bus),
        &paths,
        cancel.clone(),
    ));
    let runtime = AnimaRuntime::new(
        Arc::clone(&orchestrator),
        light,
        Duration::from_secs_f64(config.ticks.heavy_tick_sec),
        cancel.clone(),
    );
    runtime.start();

    // Introspection surface.
    let api_state = ApiState {
        config: Arc::clone(&shared),
        started,
        llm: Arc::clone(&llm),
        gateway: Some(Arc::clone(&gateway)),
        episodic: Arc::clone(&episodic),
        vectors: Arc::clone(&vectors),
        health: Arc::clone(&health),
        budget: Arc::clone(&budget),
        fallback: Arc::clone(&fallback),
        orchestrator: Arc::clone(&orchestrator),
        goals: Arc::clone(&goals),
        shell: Arc::clone(&shell),
        social: Arc::clone(&social),
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
    };
    let server = IntrospectionServer::start(api_state, &config.http.host, config.http.port)
        .await
        .context("starting introspection server")?;

    info!(
        address = %server.local_addr(),
        heavy_tick_sec = config.ticks.heavy_tick_sec,
        light_tick_sec = config.ticks.light_tick_sec,
        "anima is awake"
    );

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    // Ordered teardown: tick loops first (marks the goal interrupted),
    // then the background services.
    runtime.stop().await;
    health.stop().await;
    if let Some(watcher) = watcher {
        watcher.stop().await;
    }
    server.stop().await;
    episodic.close().await;
    vectors.close().await;
    Ok(())
}
