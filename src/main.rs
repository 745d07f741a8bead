use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use followup_engine::ai::{LlmProvider, OpenAiCompatibleProvider};
use followup_engine::app::{EngineSettings, Services};
use followup_engine::channels::{ChannelRouter, CloudApiAdapter, EvolutionAdapter};
use followup_engine::clock::{Clock, SystemClock};
use followup_engine::config::AppConfig;
use followup_engine::http;
use followup_engine::store::{Database, LibSqlBackend};
use tracing_subscriber::EnvFilter;

/// Per-request timeout for channel sends.
const CHANNEL_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export LLM_API_KEY=sk-...");
        std::process::exit(1);
    });

    // Initialize tracing; the guard flushes the file writer on exit.
    let _log_guard = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "followup-engine.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .with_target(false)
                .init();
            None
        }
    };

    eprintln!("📨 Follow-up Engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   HTTP: http://0.0.0.0:{}", config.http_port);
    eprintln!("   Events WS: ws://0.0.0.0:{}/ws/events?workspace_id=...", config.http_port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── LLM + channels ───────────────────────────────────────────────────
    let llm: Arc<dyn LlmProvider> =
        Arc::new(OpenAiCompatibleProvider::new(&config.llm).context("failed to build LLM client")?);
    let router = ChannelRouter::new()
        .with_adapter(Arc::new(CloudApiAdapter::new(CHANNEL_TIMEOUT)))
        .with_adapter(Arc::new(EvolutionAdapter::new(CHANNEL_TIMEOUT)));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let services = Services::build(
        db,
        clock,
        llm,
        router,
        EngineSettings {
            coordinator: config.coordinator.clone(),
            batch_queue: config.batch_queue.clone(),
            sequence_queue: config.sequence_queue.clone(),
            api_token: config.api_token.clone(),
        },
    );

    // Jobs left `processing` by a previous crash go back to the queue.
    services.batch_queue.recover_stalled().await?;
    services.sequence_queue.recover_stalled().await?;
    let pools = services.spawn_workers();

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = http::router(services.app_state());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.http_port))?;
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP server stopped");
        }
    });

    tracing::info!("Follow-up engine running");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("Shutting down");

    server.abort();
    for pool in pools {
        pool.shutdown().await;
    }
    Ok(())
}
