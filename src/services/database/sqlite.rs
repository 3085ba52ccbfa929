// Read-only SQLite adapter.
//
// Connections are opened per call with SQLITE_OPEN_READ_ONLY and run on the
// blocking pool; the handle is dropped before the call returns, whether or
// not the caller is still waiting.

use rusqlite::{Connection, OpenFlags};
use serde_json::Value;

use crate::pipeline::types::ErrorCode;
use crate::services::database::adapter::{DatabaseAdapter, DbError, QueryOutput};
use crate::services::schema_store::ColumnInfo;

pub struct SqliteAdapter;

impl SqliteAdapter {
    pub fn new() -> Self {
        Self
    }

    fn open_read_only(path: &str) -> Result<Connection, DbError> {
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| classify_sqlite_error(&e))
    }

    fn introspect_blocking(path: &str) -> Result<Vec<ColumnInfo>, DbError> {
        let conn = Self::open_read_only(path)?;

        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .map_err(|e| classify_sqlite_error(&e))?;
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| classify_sqlite_error(&e))?
            .collect::<Result<_, _>>()
            .map_err(|e| classify_sqlite_error(&e))?;

        let mut columns = Vec::new();
        for table in &tables {
            let mut info = conn
                .prepare(&format!("PRAGMA table_info(\"{}\")", table))
                .map_err(|e| classify_sqlite_error(&e))?;
            let cols = info
                .query_map([], |row| {
                    Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?))
                })
                .map_err(|e| classify_sqlite_error(&e))?;
            for col in cols {
                let (name, data_type) = col.map_err(|e| classify_sqlite_error(&e))?;
                columns.push(ColumnInfo {
                    table: table.clone(),
                    column: name,
                    data_type,
                });
            }
        }

        Ok(columns)
    }

    fn execute_blocking(path: &str, sql: &str) -> Result<QueryOutput, DbError> {
        let conn = Self::open_read_only(path)?;

        let mut stmt = conn.prepare(sql).map_err(|e| classify_sqlite_error(&e))?;
        let column_names: Vec<String> =
            stmt.column_names().iter().map(|s| s.to_string()).collect();

        let mut rows = Vec::new();
        let mut result_rows = stmt.query([]).map_err(|e| classify_sqlite_error(&e))?;
        while let Some(row) = result_rows.next().map_err(|e| classify_sqlite_error(&e))? {
            let mut obj = serde_json::Map::new();
            for (idx, name) in column_names.iter().enumerate() {
                let value = match row.get_ref(idx).map_err(|e| classify_sqlite_error(&e))? {
                    rusqlite::types::ValueRef::Null => Value::Null,
                    rusqlite::types::ValueRef::Integer(v) => Value::Number(v.into()),
                    rusqlite::types::ValueRef::Real(v) => serde_json::Number::from_f64(v)
                        .map(Value::Number)
                        .unwrap_or(Value::Null),
                    rusqlite::types::ValueRef::Text(bytes) => {
                        Value::String(String::from_utf8_lossy(bytes).to_string())
                    }
                    rusqlite::types::ValueRef::Blob(bytes) => {
                        Value::String(format!("<blob {} bytes>", bytes.len()))
                    }
                };
                obj.insert(name.clone(), value);
            }
            rows.push(Value::Object(obj));
        }

        Ok(QueryOutput {
            columns: column_names,
            rows,
        })
    }
}

impl Default for SqliteAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DatabaseAdapter for SqliteAdapter {
    async fn introspect(&self, path: &str) -> Result<Vec<ColumnInfo>, DbError> {
        let path = path.to_string();
        tokio::task::spawn_blocking(move || Self::introspect_blocking(&path))
            .await
            .map_err(|e| DbError::new(ErrorCode::DbFailure, format!("introspection task failed: {}", e)))?
    }

    async fn execute(&self, path: &str, sql: &str) -> Result<QueryOutput, DbError> {
        let path = path.to_string();
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || Self::execute_blocking(&path, &sql))
            .await
            .map_err(|e| DbError::new(ErrorCode::DbFailure, format!("execution task failed: {}", e)))?
    }

    fn dialect(&self) -> &'static str {
        "sqlite"
    }
}

/// Map a rusqlite error to the pipeline's failure taxonomy.
fn classify_sqlite_error(err: &rusqlite::Error) -> DbError {
    let message = err.to_string();
    let lower = message.to_lowercase();

    let code = if lower.contains("no such table") {
        ErrorCode::DbNoSuchTable
    } else if lower.contains("no such column") {
        ErrorCode::DbNoSuchColumn
    } else if lower.contains("syntax error") || lower.contains("incomplete input") {
        ErrorCode::DbSyntaxError
    } else if lower.contains("database is locked") || lower.contains("database table is locked") {
        ErrorCode::DbLocked
    } else {
        ErrorCode::DbFailure
    };

    DbError::new(code, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_db() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let conn = Connection::open(file.path()).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT);
            CREATE TABLE invoices (id INTEGER PRIMARY KEY, customer_id INTEGER, total REAL);
            INSERT INTO customers (id, name) VALUES (1, 'Alice'), (2, 'Bob');
            INSERT INTO invoices (id, customer_id, total) VALUES
                (1, 1, 10.5), (2, 1, 4.5), (3, 2, 20.0);
            "#,
        )
        .unwrap();
        file
    }

    #[tokio::test]
    async fn test_introspect_orders_tables_and_columns() {
        let db = fixture_db();
        let adapter = SqliteAdapter::new();
        let columns = adapter
            .introspect(db.path().to_str().unwrap())
            .await
            .unwrap();

        let tables: Vec<&str> = columns.iter().map(|c| c.table.as_str()).collect();
        assert!(tables.starts_with(&["customers", "customers"]));
        assert!(columns
            .iter()
            .any(|c| c.table == "invoices" && c.column == "total" && c.data_type == "REAL"));
    }

    #[tokio::test]
    async fn test_execute_returns_rows_and_columns() {
        let db = fixture_db();
        let adapter = SqliteAdapter::new();
        let out = adapter
            .execute(
                db.path().to_str().unwrap(),
                "SELECT name, COUNT(*) AS n FROM customers GROUP BY name ORDER BY name",
            )
            .await
            .unwrap();

        assert_eq!(out.columns, vec!["name", "n"]);
        assert_eq!(out.row_count(), 2);
        assert_eq!(out.rows[0]["name"], "Alice");
    }

    #[tokio::test]
    async fn test_read_only_connection_rejects_writes() {
        let db = fixture_db();
        let adapter = SqliteAdapter::new();
        let err = adapter
            .execute(db.path().to_str().unwrap(), "DELETE FROM customers")
            .await
            .unwrap_err();
        // The sandbox itself refuses writes even if validation were bypassed.
        assert!(!matches!(err.code, ErrorCode::DbNoSuchTable));
    }

    #[tokio::test]
    async fn test_unknown_table_classified_retryable() {
        let db = fixture_db();
        let adapter = SqliteAdapter::new();
        let err = adapter
            .execute(db.path().to_str().unwrap(), "SELECT * FROM missing_table")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DbNoSuchTable);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_syntax_error_classified_retryable() {
        let db = fixture_db();
        let adapter = SqliteAdapter::new();
        let err = adapter
            .execute(db.path().to_str().unwrap(), "SELEC name FROM customers")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DbSyntaxError);
        assert!(err.is_retryable());
    }
}
