/// Table catalog endpoints
///
/// The catalog is swapped as a whole; in-flight syncs keep the snapshot they
/// started with.

use super::AppState;
use crate::error::SyncError;
use crate::workflow::registry::TableRef;
use axum::{
    extract::State,
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;

#[derive(Debug, Deserialize)]
pub struct CatalogRequest {
    pub tables: Vec<TableRef>,
}

pub fn create_catalog_routes() -> Router<AppState> {
    Router::new().route("/api/catalog", get(get_catalog).put(replace_catalog))
}

/// GET /api/catalog
async fn get_catalog(State(state): State<AppState>) -> Json<Value> {
    let catalog = state.catalog.snapshot();
    let tables: Vec<&TableRef> = catalog.tables().collect();
    Json(json!({ "tables": tables }))
}

/// PUT /api/catalog
/// Body: { "tables": [{ "id": 1, "database": "ods", "name": "orders" }] }
async fn replace_catalog(
    State(state): State<AppState>,
    Json(request): Json<CatalogRequest>,
) -> Result<Json<Value>, SyncError> {
    validate_tables(&request.tables)?;
    let count = state.catalog.reload(request.tables);
    Ok(Json(json!({ "tables": count })))
}

fn validate_tables(tables: &[TableRef]) -> Result<(), SyncError> {
    let mut seen = BTreeSet::new();
    for table in tables {
        if table.name.trim().is_empty() {
            return Err(SyncError::Validation(format!("table {} has no name", table.id)));
        }
        if !seen.insert(table.id) {
            return Err(SyncError::Validation(format!("table id {} appears more than once", table.id)));
        }
    }
    Ok(())
}
