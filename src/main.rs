//! ArchMerge - Entry Point
//!
//! Modes:
//! - Default / --serve: HTTP API
//! - --demo: run the reference scenarios in process and print their reports

use anyhow::Context;
use archmerge::{
    Agent, AuditLog, Config, ContextStore, Environment, InMemoryStore, LegacyAdapter, LegacyModule,
    MetaController, ModuleAdapter, Observation, RetryPolicy, ScriptedHandler, Server,
    SqliteStore, TaskRequest,
};
use futures_util::future::join_all;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const LEGACY_CAPABILITIES: [&str; 5] = [
    "data_processing",
    "classification",
    "summarization",
    "ingestion",
    "process_dataset",
];

const LOCAL_CAPABILITIES: [&str; 3] = ["process_dataset", "data_processing", "echo"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let demo_mode = args.iter().any(|a| a == "--demo" || a == "-d");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        print_help();
        return Ok(());
    }

    let config = Config::from_env()?;
    init_logging(&config)?;

    if demo_mode {
        info!("ArchMerge demo v{}", env!("CARGO_PKG_VERSION"));
        run_demo(config).await
    } else {
        info!("ArchMerge server v{}", env!("CARGO_PKG_VERSION"));
        let controller = build_controller(&config)?;
        Server::new(config, controller).run().await
    }
}

fn print_help() {
    println!("ArchMerge v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: archmerge [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --serve            Run the HTTP API (default)");
    println!("  --demo, -d         Run the reference scenarios and print reports");
    println!("  --help, -h         Show this help");
    println!();
    println!("Environment variables:");
    println!("  ARCHMERGE_BIND_ADDR          Bind address (default: 127.0.0.1)");
    println!("  ARCHMERGE_PORT               HTTP port (default: 8080)");
    println!("  ARCHMERGE_RESOURCE_CEILING   Concurrent resource units (default: 8)");
    println!("  ARCHMERGE_MAX_ALTERNATIVES   Alternative strategies per task (default: 3)");
    println!("  ARCHMERGE_DEFAULT_TIMEOUT_MS Task deadline when none is given (default: 60000)");
    println!("  ARCHMERGE_MAX_TIMEOUT_MS     Largest accepted deadline (default: 300000)");
    println!("  ARCHMERGE_MAX_RETRIES        Retries per action (default: 3)");
    println!("  ARCHMERGE_RETRY_INITIAL_MS   First backoff delay (default: 2000)");
    println!("  ARCHMERGE_RETRY_MAX_MS       Backoff cap (default: 30000)");
    println!("  ARCHMERGE_BREAKER_FAILURES   Failures before a circuit opens (default: 5)");
    println!("  ARCHMERGE_BREAKER_SUCCESSES  Successes to close a half-open circuit (default: 2)");
    println!("  ARCHMERGE_BREAKER_OPEN_SECS  Open period (default: 30)");
    println!("  ARCHMERGE_HISTORY_LIMIT      Context history entries kept (default: 50)");
    println!("  ARCHMERGE_LEDGER_CAPACITY    Idempotency ledger size (default: 10000)");
    println!("  ARCHMERGE_LEDGER_TTL_SECS    Idempotency ledger retention (default: 3600)");
    println!("  ARCHMERGE_SQLITE_PATH        SQLite context store (default: in memory)");
    println!("  ARCHMERGE_AUDIT_PATH         JSON-lines audit mirror (default: none)");
    println!("  ARCHMERGE_LOG_JSON           Log as JSON when 1/true");
    println!("  RUST_LOG                     Log filter (default: info)");
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

fn build_controller(config: &Config) -> anyhow::Result<Arc<MetaController>> {
    let memory: Arc<dyn ContextStore> = match &config.sqlite_path {
        Some(path) => Arc::new(
            SqliteStore::open(path)
                .with_context(|| format!("opening context store at {}", path.display()))?,
        ),
        None => Arc::new(InMemoryStore::new()),
    };
    let audit = match &config.audit_path {
        Some(path) => AuditLog::with_file(path)
            .with_context(|| format!("opening audit log at {}", path.display()))?,
        None => AuditLog::new(),
    };
    info!("Context store: {}", memory.backend());

    let controller = Arc::new(MetaController::new(config.clone(), memory, audit));

    let legacy = Arc::new(Environment::new(
        Arc::new(LegacyModule::default()),
        config.ledger_capacity,
        config.ledger_ttl(),
    ));
    let local = Arc::new(Environment::new(
        Arc::new(ScriptedHandler::new()),
        config.ledger_capacity,
        config.ledger_ttl(),
    ));

    controller.register_agent(
        Agent::new("legacy", &LEGACY_CAPABILITIES, legacy).with_retry(config.retry_policy()),
    );
    controller.register_agent(
        Agent::new("local", &LOCAL_CAPABILITIES, local).with_retry(config.retry_policy()),
    );

    Ok(controller)
}

async fn run_demo(config: Config) -> anyhow::Result<()> {
    let controller = Arc::new(MetaController::new(
        config.clone(),
        Arc::new(InMemoryStore::new()),
        AuditLog::new(),
    ));

    let analyst = Arc::new(ScriptedHandler::new());
    analyst.push("process_dataset", Observation::success(json!({"rows_processed": 10000})));
    analyst.push("flaky_ingest", Observation::transient("upstream_busy"));
    analyst.push("flaky_ingest", Observation::transient("upstream_busy"));
    analyst.push("flaky_ingest", Observation::success(json!({"rows_ingested": 250})));
    analyst.push("validate_dataset", Observation::permanent("corrupt_header"));

    let analyst_env = Arc::new(Environment::new(analyst, config.ledger_capacity, config.ledger_ttl()));
    let legacy_env = Arc::new(Environment::new(
        Arc::new(LegacyModule::default()),
        config.ledger_capacity,
        config.ledger_ttl(),
    ));

    // Millisecond backoff keeps the demo short; the schedule shape is unchanged
    controller.register_agent(
        Agent::new(
            "analyst",
            &["process_dataset", "flaky_ingest", "validate_dataset"],
            analyst_env,
        )
        .with_retry(RetryPolicy::fast()),
    );
    controller.register_agent(Agent::new("legacy", &LEGACY_CAPABILITIES, legacy_env));

    let adapter = LegacyAdapter::new();
    let legacy_job = adapter.to_canonical(&json!({
        "id": "job_2025_001",
        "type": "data_processing",
        "priority": "2",
        "payload": "{\"input_file\": \"data.csv\"}",
    }))?;

    let tasks = vec![
        TaskRequest::new("T1", "process_dataset", json!({"dataset_id": "DS123"})),
        TaskRequest::new("T2", "flaky_ingest", json!({"source": "s3://bucket/raw"})),
        TaskRequest::new("T3", "validate_dataset", json!({"dataset_id": "DS999"})),
        TaskRequest::new("T4", "render_video", json!({})),
        legacy_job,
    ];

    let reports = join_all(tasks.into_iter().map(|task| {
        let controller = controller.clone();
        async move { controller.submit(task).await }
    }))
    .await;

    for report in &reports {
        println!("{}", serde_json::to_string_pretty(report)?);
    }
    if let Some(job) = reports.iter().find(|r| r.task_id == "job_2025_001") {
        println!("{}", serde_json::to_string_pretty(&adapter.from_canonical(job))?);
    }

    println!("{}", serde_json::to_string_pretty(&controller.metrics().snapshot())?);
    Ok(())
}
