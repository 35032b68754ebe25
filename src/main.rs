//! chatflow - guided multi-step chat conversations
//!
//! A per-user conversation state machine with durable state, background
//! generation behind guardrails, and an HTTP transport adapter.

mod api;
mod config;
mod db;
mod flows;
mod generation;
mod guardrails;
mod llm;
mod runtime;
mod state_machine;

use api::{create_router, AppState};
use config::AppConfig;
use db::Database;
use flows::FlowRegistry;
use generation::{GenerationCoordinator, OutcomeWriter};
use guardrails::GuardrailPipeline;
use llm::LlmConfig;
use runtime::{
    recovery::recovery_report, sweeper::spawn_sweeper, ConversationMachine, DatabaseStorage,
    RuntimeManager, StateStore,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatflow=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = AppConfig::from_env();
    let llm_config = LlmConfig::from_env();

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path, "Opening database");
    let db = Database::open(&config.db_path)?;
    let store: Arc<dyn StateStore> = Arc::new(DatabaseStorage::new(db));

    // Everything is durable; just report what is waiting
    recovery_report(store.as_ref(), chrono::Utc::now()).await?.log();

    let registry = Arc::new(FlowRegistry::builtin());
    let (prompts_tx, _) = broadcast::channel(256);

    let generative = llm_config.generative_service();
    tracing::info!(model = %generative.model_id(), "Generative service configured");
    let pipeline = Arc::new(GuardrailPipeline::standard(llm_config.moderation_service()));
    let coordinator = GenerationCoordinator::new(
        generative,
        pipeline,
        config.generation,
        OutcomeWriter::new(
            store.clone(),
            registry.clone(),
            prompts_tx.clone(),
            config.store_retry,
        ),
    );

    let machine = ConversationMachine::new(
        registry,
        store.clone(),
        Arc::new(coordinator),
        config.store_retry,
    );
    let runtime = Arc::new(RuntimeManager::new(machine, prompts_tx, config.workers));

    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(
        store,
        config.retention,
        config.sweep_interval,
        shutdown.clone(),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(AppState::new(runtime))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("chatflow server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Sweeper task ended abnormally");
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
