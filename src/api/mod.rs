/// HTTP API Layer
///
/// Thin adapters over the sync orchestrator, the version manager and the table
/// catalog. Handlers only decode requests and render results; every rule lives
/// in the engine.

use crate::error::{ErrorKind, SyncError};
use crate::runtime::RuntimeSyncOrchestrator;
use crate::workflow::registry::CatalogRegistry;
use crate::workflow::VersionManager;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;

// Runtime sync preview / execute and sync record queries
pub mod sync;

// Version history, compare and rollback
pub mod versions;

// Table catalog hot reload
pub mod catalog;

pub use catalog::create_catalog_routes;
pub use sync::create_sync_routes;
pub use versions::create_version_routes;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RuntimeSyncOrchestrator>,
    pub versions: VersionManager,
    /// Hot-reload registry of registered tables
    pub catalog: Arc<CatalogRegistry>,
}

/// HTTP status for an error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::ExternalDependency => StatusCode::BAD_GATEWAY,
        ErrorKind::Disabled => StatusCode::FORBIDDEN,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = status_for(self.kind());
        if status.is_server_error() {
            tracing::error!("❌ Request failed: {}", self.detail());
        }
        (status, Json(self.to_external_json())).into_response()
    }
}
