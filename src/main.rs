use anyhow::Context;
use billing_pipeline::{
    api::{build_router, AppState},
    config::{Config, StageKind},
    messaging::{
        create_transport, init_messaging_metrics, DeadLetterSink, InMemoryDeadLetterSink,
        LoggingDeadLetterSink, MessagingSystem,
    },
    pipeline::{init_stage_metrics, PipelineRuntime},
    state::create_stores,
    telemetry::init_tracing,
};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;

#[derive(Parser)]
#[command(name = "billing-pipeline")]
#[command(about = "Billing, payment and invoice pipeline", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file layered over the embedded defaults
    #[arg(short, long, env = "CONFIG_PATH", default_value = "config/default.toml")]
    config: String,

    /// Stages to host; repeat to host several (defaults to the configured set)
    #[arg(short, long, value_enum)]
    stage: Vec<StageArg>,

    /// Override the messaging backend
    #[arg(short, long, value_enum)]
    messaging: Option<SystemArg>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum StageArg {
    Billing,
    Payment,
    Invoice,
}

impl From<StageArg> for StageKind {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Billing => StageKind::Billing,
            StageArg::Payment => StageKind::Payment,
            StageArg::Invoice => StageKind::Invoice,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum SystemArg {
    Kafka,
    Queue,
    Amqp,
    InMemory,
}

impl From<SystemArg> for MessagingSystem {
    fn from(arg: SystemArg) -> Self {
        match arg {
            SystemArg::Kafka => MessagingSystem::Kafka,
            SystemArg::Queue => MessagingSystem::Queue,
            SystemArg::Amqp => MessagingSystem::Amqp,
            SystemArg::InMemory => MessagingSystem::InMemory,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config))?;
    if !cli.stage.is_empty() {
        config.pipeline.stages = cli.stage.iter().copied().map(StageKind::from).collect();
    }
    if let Some(system) = cli.messaging {
        config.messaging.system = system.into();
    }

    // Initialize tracing
    init_tracing(&config.observability).context("Failed to initialize tracing")?;

    tracing::info!(
        service = %config.observability.service_name,
        version = env!("CARGO_PKG_VERSION"),
        messaging = %config.messaging.system,
        stages = ?config.pipeline.stages,
        "Starting billing pipeline"
    );

    // Initialize Prometheus metrics
    if config.observability.prometheus_enabled {
        init_messaging_metrics();
        init_stage_metrics();
        tracing::info!("Prometheus metrics initialized");
    }

    // Initialize storage backend
    let stores = create_stores(&config.store).context("Failed to initialize record stores")?;
    tracing::info!(backend = %config.store.backend, "Storage backend initialized");

    // Dead letters are always logged; keep the recent ones when inspection is on
    let inspected = (config.messaging.dead_letter_capacity > 0)
        .then(|| Arc::new(InMemoryDeadLetterSink::new(config.messaging.dead_letter_capacity)));
    let dead_letters: Arc<dyn DeadLetterSink> = match &inspected {
        Some(sink) => sink.clone() as Arc<dyn DeadLetterSink>,
        None => Arc::new(LoggingDeadLetterSink),
    };

    // Connect the configured broker
    let transport = create_transport(&config.messaging, dead_letters)
        .await
        .context("Failed to initialize messaging transport")?;

    let runtime = PipelineRuntime::start(&config, transport, stores)
        .await
        .context("Failed to start pipeline stages")?;
    tracing::info!(subscriptions = ?runtime.subscribed(), "Pipeline stages subscribed");

    let mut app_state = AppState::new(&runtime);
    if let Some(sink) = inspected {
        app_state = app_state.with_dead_letters(sink);
    }
    let app = build_router(app_state).layer(TimeoutLayer::new(Duration::from_secs(
        config.server.request_timeout_secs,
    )));

    // Start HTTP server
    let http_addr = format!("{}:{}", config.server.host, config.server.http_port);
    let http_listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", http_addr))?;

    tracing::info!("HTTP API listening on http://{}", http_addr);
    if config.pipeline.hosts(StageKind::Billing) {
        tracing::info!("   Billing entry: POST http://{}/api/billing", http_addr);
    }
    tracing::info!("   Health check: http://{}/health", http_addr);

    axum::serve(http_listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    tracing::info!("Shutting down gracefully...");
    runtime.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
