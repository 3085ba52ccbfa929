pub mod database;
pub mod executor;
pub mod llm_client;
pub mod metrics;
pub mod query_cache;
pub mod schema_store;

pub use executor::SandboxExecutor;
pub use llm_client::{HttpLlmClient, LlmClient, LlmError, RepairTarget};
pub use metrics::{LogMetrics, MetricsSink, NoopMetrics};
pub use query_cache::{normalize_query, CacheKey, QueryCache};
pub use schema_store::{ColumnInfo, SchemaPreview, SchemaStore};
