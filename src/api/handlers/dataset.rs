use std::collections::HashSet;

use axum::{
    extract::{Path, State},
    Json,
};

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::{RegisterDatasetRequest, RegisterDatasetResponse, SchemaResponse};
use crate::services::schema_store::SchemaPreview;

/// Register a SQLite file as a queryable dataset. Introspection happens
/// here; re-registering an id replaces the entry atomically.
pub async fn register_dataset(
    State(state): State<AppState>,
    Json(request): Json<RegisterDatasetRequest>,
) -> Result<Json<RegisterDatasetResponse>, AppError> {
    if request.id.trim().is_empty() {
        return Err(AppError::Validation("dataset id must not be empty".to_string()));
    }
    if !std::path::Path::new(&request.path).is_file() {
        return Err(AppError::Dataset(format!(
            "No such dataset file: {}",
            request.path
        )));
    }

    let columns = state
        .adapter
        .introspect(&request.path)
        .await
        .map_err(|e| AppError::Dataset(format!("Introspection failed: {}", e)))?;

    let preview = SchemaPreview::new(&request.id, columns);
    let tables = preview
        .columns
        .iter()
        .map(|col| col.table.as_str())
        .collect::<HashSet<_>>()
        .len();
    let response = RegisterDatasetResponse {
        id: request.id.clone(),
        tables,
        columns: preview.columns.len(),
        fingerprint: preview.fingerprint(),
    };
    state.schemas.register(&request.id, &request.path, preview);
    Ok(Json(response))
}

/// Return the rendered schema preview and fingerprint for one dataset.
pub async fn get_schema(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SchemaResponse>, AppError> {
    let entry = state
        .schemas
        .lookup(&id)
        .ok_or_else(|| AppError::NotFound(format!("Dataset not found: {}", id)))?;

    Ok(Json(SchemaResponse {
        id,
        columns: entry.preview.columns.clone(),
        preview: entry.preview.render(),
        fingerprint: entry.preview.fingerprint(),
        registered_at: entry.registered_at,
    }))
}
