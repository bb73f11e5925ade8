use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashboard::{config::Config, db, routes, snapshot::BootSource, AppState, RemoteClient};
use tracing::info;
use tracing_subscriber::EnvFilter;

const CONFIG_ENV: &str = "RIOTPOT_DASHBOARD_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("dashboard=info,riotpot_dashboard=info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from);
    let config = Config::load_or_default(config_path.as_deref())?;

    info!("Using database: {}", config.storage.db_path.display());
    let conn = db::init_db(&config.storage.db_path).context("Failed to initialize database")?;

    let state = AppState::new(Arc::new(RemoteClient::new()), conn);
    let source = state
        .bootstrap(config.storage.seed_path.as_deref())
        .await
        .context("Failed to restore dashboard state")?;
    match source {
        BootSource::Persisted => info!("Resumed from previous run"),
        BootSource::Seed => info!("Started from seed document"),
        BootSource::Empty => info!("Started with empty registries"),
    }

    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.api.listen))?;
    info!("Listening on {}", config.api.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("Server error")?;

    Ok(())
}
