// Request and response DTOs for the HTTP surface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::services::schema_store::ColumnInfo;

/// Body of `POST /api/nl2sql`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NlQueryRequest {
    pub question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    /// Answers keyed by the clarification question they respond to.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub clarify_answers: BTreeMap<String, String>,
}

/// Body of `POST /api/datasets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDatasetRequest {
    pub id: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDatasetResponse {
    pub id: String,
    pub tables: usize,
    pub columns: usize,
    pub fingerprint: String,
}

/// Response of `GET /api/datasets/{id}/schema`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaResponse {
    pub id: String,
    pub columns: Vec<ColumnInfo>,
    pub preview: String,
    pub fingerprint: String,
    pub registered_at: chrono::DateTime<chrono::Utc>,
}
