/// Server setup and initialization
///
/// Wires together all components: storage, table catalog, scheduler and lineage
/// clients, the sync orchestrator and HTTP routes.

use crate::{
    api::{create_catalog_routes, create_sync_routes, create_version_routes, AppState},
    config::Config,
    runtime::{HttpLineageInferencer, LineageEdgeInferencer, RuntimeSyncOrchestrator, SchedulerClient},
    workflow::{
        registry::{CatalogRegistry, TableCatalog},
        storage::SqliteStore,
        VersionManager,
    },
};
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Create the main Axum application with all routes
///
/// Opens the version store, loads the table catalog and builds the orchestrator.
pub async fn create_app(config: Config) -> Result<Router> {
    if let Some(dir) = sqlite_parent_dir(&config.database.url) {
        tracing::info!("📁 Ensuring database directory exists: {}", dir.display());
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow::anyhow!("Failed to create database directory: {}", e))?;
    }

    tracing::info!("📋 Opening version store at {}", config.database.url);
    let store = Arc::new(
        SqliteStore::connect(&config.database.url)
            .await
            .context("Failed to open version store")?,
    );

    let catalog = match &config.catalog.path {
        Some(path) => {
            tracing::info!("📥 Loading table catalog from {}", path);
            CatalogRegistry::load_file(path).await?
        }
        None => {
            tracing::warn!("No table catalog configured, lineage will not resolve any table until PUT /api/catalog");
            TableCatalog::default()
        }
    };
    let catalog = Arc::new(CatalogRegistry::new(catalog));

    tracing::info!("🌍 Scheduler at {}, lineage service at {}", config.scheduler.base_url, config.lineage.endpoint);
    let source = Arc::new(SchedulerClient::new(
        config.scheduler.base_url.clone(),
        config.scheduler.token.clone(),
    ));
    let settings = config.sync.settings();
    let lineage = LineageEdgeInferencer::new(Arc::new(HttpLineageInferencer::new(config.lineage.endpoint.clone())))
        .with_timeout(settings.fetch_timeout);

    let versions = VersionManager::new(store, config.sync.commit_retry_budget);
    let orchestrator = Arc::new(RuntimeSyncOrchestrator::new(
        source,
        lineage,
        Arc::clone(&catalog),
        versions.clone(),
        settings,
    ));

    let app_state = AppState {
        orchestrator,
        versions,
        catalog,
    };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let app = Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        .merge(create_sync_routes())
        .merge(create_version_routes())
        .merge(create_catalog_routes())
        .with_state(app_state);

    tracing::info!("✅ Application initialized successfully");

    Ok(app)
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    let level = config.log_level.parse::<tracing::Level>().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_max_level(level)
        .init();

    tracing::info!("Starting Mechasync server...");
    if !config.sync.enabled {
        tracing::warn!("Runtime sync is disabled; every execute will be declined");
    }

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

/// Directory holding a file-backed SQLite database, if the URL names one
fn sqlite_parent_dir(url: &str) -> Option<&Path> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    Path::new(path).parent().filter(|dir| !dir.as_os_str().is_empty())
}

async fn health_check() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_parent_dir() {
        assert_eq!(sqlite_parent_dir("sqlite://data/mechasync.db"), Some(Path::new("data")));
        assert_eq!(sqlite_parent_dir("sqlite:/var/lib/sync.db?mode=rwc"), Some(Path::new("/var/lib")));
        assert_eq!(sqlite_parent_dir("sqlite::memory:"), None);
        assert_eq!(sqlite_parent_dir("sqlite://local.db"), None);
        assert_eq!(sqlite_parent_dir("postgres://db/sync"), None);
    }
}
