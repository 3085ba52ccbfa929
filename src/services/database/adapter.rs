// Database adapter trait for sandboxed dataset access.

use serde_json::Value;

use crate::pipeline::types::ErrorCode;
use crate::services::schema_store::ColumnInfo;

/// Result of executing one vetted statement.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Value>,
}

impl QueryOutput {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Classified database failure. `code` determines repair eligibility:
/// a correctable SQL defect (unknown table/column, syntax error) is
/// retryable, resource or connectivity failures are not.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct DbError {
    pub code: ErrorCode,
    pub message: String,
}

impl DbError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

/// Read-only access to one dataset. Each `execute` call runs exactly one
/// statement on a fresh connection, so no transaction state can leak
/// across calls.
#[async_trait::async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Introspect the dataset schema as ordered (table, column, type) triples.
    async fn introspect(&self, path: &str) -> Result<Vec<ColumnInfo>, DbError>;

    /// Execute one vetted statement against a read-only connection.
    async fn execute(&self, path: &str, sql: &str) -> Result<QueryOutput, DbError>;

    fn dialect(&self) -> &'static str;
}
