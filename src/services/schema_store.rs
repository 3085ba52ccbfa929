// Dataset registry and schema previews.
//
// The store is one of the two pieces of state shared across concurrent runs
// (the other is the result cache). Entries are replaced atomically on
// registration; a run holding an Arc to a preview keeps seeing the snapshot
// it started with.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One (table, column, type) triple from dataset introspection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub table: String,
    pub column: String,
    pub data_type: String,
}

/// Ordered, read-only schema snapshot for one dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaPreview {
    pub dataset_id: String,
    pub columns: Vec<ColumnInfo>,
}

impl SchemaPreview {
    pub fn new(dataset_id: impl Into<String>, columns: Vec<ColumnInfo>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            columns,
        }
    }

    /// Stable digest over the ordered triples, used as a cache-key component.
    /// Two datasets with identical schemas produce identical fingerprints.
    pub fn fingerprint(&self) -> String {
        let mut hasher = DefaultHasher::new();
        for col in &self.columns {
            col.table.hash(&mut hasher);
            col.column.hash(&mut hasher);
            col.data_type.hash(&mut hasher);
        }
        format!("{:x}", hasher.finish())
    }

    /// Render a compact textual preview for LLM prompts,
    /// one `table(col:type, ...)` line per table.
    pub fn render(&self) -> String {
        let mut lines: Vec<String> = Vec::new();
        let mut current_table: Option<&str> = None;
        let mut cols: Vec<String> = Vec::new();

        for col in &self.columns {
            if current_table != Some(col.table.as_str()) {
                if let Some(table) = current_table {
                    lines.push(format!("{}({})", table, cols.join(", ")));
                }
                current_table = Some(col.table.as_str());
                cols.clear();
            }
            cols.push(format!("{}:{}", col.column, col.data_type));
        }
        if let Some(table) = current_table {
            lines.push(format!("{}({})", table, cols.join(", ")));
        }

        lines.join("\n")
    }
}

/// Registered dataset: on-disk location plus its schema snapshot.
#[derive(Debug)]
pub struct DatasetEntry {
    pub path: String,
    pub preview: SchemaPreview,
    pub registered_at: DateTime<Utc>,
}

/// Shared dataset registry.
///
/// Read-mostly: lookups take a read lock and clone an Arc; registration
/// swaps the entry wholesale so in-flight runs are never invalidated
/// mid-request.
pub struct SchemaStore {
    datasets: RwLock<HashMap<String, Arc<DatasetEntry>>>,
}

impl SchemaStore {
    pub fn new() -> Self {
        Self {
            datasets: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace a dataset. Replacement is atomic; existing runs
    /// keep their snapshot.
    pub fn register(&self, dataset_id: &str, path: &str, preview: SchemaPreview) {
        let entry = Arc::new(DatasetEntry {
            path: path.to_string(),
            preview,
            registered_at: Utc::now(),
        });
        let mut datasets = self.datasets.write().unwrap();
        let replaced = datasets.insert(dataset_id.to_string(), entry).is_some();
        if replaced {
            tracing::info!("Replaced dataset registration: {}", dataset_id);
        } else {
            tracing::info!("Registered dataset: {}", dataset_id);
        }
    }

    pub fn lookup(&self, dataset_id: &str) -> Option<Arc<DatasetEntry>> {
        self.datasets.read().unwrap().get(dataset_id).cloned()
    }

    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.datasets.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for SchemaStore {
    fn default() -> Self {
        Self::new()
    }
}
