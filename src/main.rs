//! turnstile server
//!
//! Interruptible tool-calling conversations over HTTP and SSE.

use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turnstile::api::{create_router, AppState};
use turnstile::config::Config;
use turnstile::db::Database;
use turnstile::llm::{LoggingClient, ModelClient, OpenAIClient};
use turnstile::runtime::{DatabaseStorage, Orchestrator, OrchestratorConfig};
use turnstile::tools::ToolRegistry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "turnstile=info,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();

    // Ensure database directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(&config.db_path)?;

    // Repair threads a previous process left mid-turn
    let report = db.recover_interrupted()?;
    tracing::info!(
        threads_reset = report.threads_reset,
        results_injected = report.results_injected,
        suspended_kept = report.suspended_kept,
        "Startup recovery complete"
    );

    let api_key = config
        .llm
        .api_key
        .clone()
        .ok_or("OPENAI_API_KEY is not set")?;
    let model = LoggingClient::new(OpenAIClient::new(api_key, &config.llm)?);
    tracing::info!(model = %model.model_id(), "Model client initialized");

    let tools = ToolRegistry::standard()?;
    tracing::info!(
        tools = ?tools.definitions().iter().map(|d| d.name.clone()).collect::<Vec<_>>(),
        gated = ?tools.gated_tools(),
        "Tool registry initialized"
    );

    let orchestrator = Arc::new(Orchestrator::new(
        DatabaseStorage::new(db),
        model,
        tools,
        OrchestratorConfig {
            max_llm_attempts: config.max_llm_attempts,
            ..OrchestratorConfig::default()
        },
    ));

    let sweeper = config.approval_timeout.map(|timeout| {
        tracing::info!(timeout_secs = timeout.as_secs(), "Pending approvals expire");
        orchestrator.spawn_expiry_sweeper(timeout, Config::sweep_interval(timeout))
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(AppState::new(orchestrator.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("turnstile listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    orchestrator.shutdown();
    if let Some(sweeper) = sweeper {
        sweeper.await?;
    }
    tracing::info!("Server stopped");

    Ok(())
}

/// Returns when the server should shut down
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for SIGINT");
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM - shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT - shutting down");
        }
    }
}
