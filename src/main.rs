use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use punchpass::api::{self, AppState};
use punchpass::config::Config;
use punchpass::db;
use punchpass::jobs::expiration_sweep;
use punchpass::services::{notifier::TracingNotifier, signer::SigningCredentialStore};
use punchpass::store::{MemoryStore, PassStore, PostgresStore, TagClock};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "punchpass=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Punchpass server...");

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    // Select the storage backend
    let store: Arc<dyn PassStore> = match &config.database_url {
        Some(database_url) => {
            let pool = db::create_pool(database_url).await?;
            tracing::info!("Database pool created");

            db::run_migrations(&pool).await?;
            tracing::info!("Database migrations completed");

            Arc::new(PostgresStore::from_pool(pool, TagClock::WallClock))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            Arc::new(MemoryStore::default())
        }
    };

    let credentials = SigningCredentialStore::from_files(
        &config.pass_certificate_path,
        config.pass_certificate_password.clone(),
        &config.wwdr_certificate_path,
    );

    // Build application state
    let state = AppState::new(config.clone(), store, credentials, Arc::new(TracingNotifier));

    // Schedule the expiration sweep
    let mut scheduler = expiration_sweep::start_scheduler(
        &config.expiration_sweep_schedule,
        state.loyalty.clone(),
        state.ledger.clone(),
    )
    .await?;

    let app = api::app(state);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("Listening on {}", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!(error = %e, "Scheduler did not shut down cleanly");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install CTRL+C signal handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, cleaning up...");
}
