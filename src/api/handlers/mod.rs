pub mod dataset;
pub mod query;

use std::sync::Arc;

use crate::pipeline::Orchestrator;
use crate::services::database::DatabaseAdapter;
use crate::services::schema_store::SchemaStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub adapter: Arc<dyn DatabaseAdapter>,
    pub schemas: Arc<SchemaStore>,
}
