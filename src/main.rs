/// Mechasync: runtime workflow reconciliation service
///
/// Main entry point. Loads configuration from the environment and starts the HTTP
/// server with the runtime sync, version history and catalog endpoints.

use mechasync::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Runtime sync preview/execute at /api/runtime-sync/*
/// - Version history, compare and rollback at /api/workflows/{id}/versions/*
/// - Table catalog reload at /api/catalog
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (defaults to 0.0.0.0:3005 and a local SQLite file)
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
