use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::config::SafetyConfig;
use crate::pipeline::types::ErrorCode;

/// Keywords that must not appear anywhere in a candidate statement, even
/// where the grammar would allow them as identifiers. String literals are
/// excluded automatically because the scan runs over tokens, not text.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "create", "alter", "truncate", "attach", "detach",
    "pragma", "reindex", "vacuum", "grant", "revoke", "execute",
];

/// Schema-introspection pseudo-tables, blocked whether quoted or not.
const FORBIDDEN_TABLES: &[&str] = &[
    "sqlite_master",
    "sqlite_temp_master",
    "sqlite_schema",
    "sqlite_temp_schema",
];

/// Outcome of a successful safety check: the lightly normalized statement
/// plus annotations consumed by the executor's cost preflight.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyVerdict {
    pub sql: String,
    pub has_limit: bool,
}

/// A rejected statement, carrying the specific rule that fired.
/// Only a parse failure is retryable: a broken candidate is a correctable
/// SQL defect, a policy violation is not.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct SafetyViolation {
    pub code: ErrorCode,
    pub message: String,
}

impl SafetyViolation {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

/// SQL safety validator: deterministic allow/deny policy over the parsed
/// statement. Rules run in a fixed order; the first rule that fires wins.
pub struct SqlValidator {
    max_sql_len: usize,
    allow_explain: bool,
}

impl SqlValidator {
    pub fn new(config: &SafetyConfig) -> Self {
        Self {
            max_sql_len: config.max_sql_len,
            allow_explain: config.allow_explain,
        }
    }

    pub fn check(&self, sql: &str) -> Result<SafetyVerdict, SafetyViolation> {
        // Rule 1: empty or whitespace-only input
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return Err(SafetyViolation::new(
                ErrorCode::SafetyEmptyStatement,
                "Empty SQL statement",
            ));
        }

        // Rule 2: configured maximum length
        if sql.len() > self.max_sql_len {
            return Err(SafetyViolation::new(
                ErrorCode::SafetyTooLong,
                format!(
                    "Statement length {} exceeds maximum of {}",
                    sql.len(),
                    self.max_sql_len
                ),
            ));
        }

        // Rule 3: parse; exactly one statement
        let dialect = SQLiteDialect {};
        let statements = Parser::new(&dialect)
            .try_with_sql(trimmed)
            .and_then(|mut p| p.parse_statements())
            .map_err(|e| {
                SafetyViolation::new(
                    ErrorCode::SafetyParseError,
                    format!("SQL parsing error: {}", e),
                )
            })?;

        if statements.is_empty() {
            return Err(SafetyViolation::new(
                ErrorCode::SafetyEmptyStatement,
                "Empty SQL statement",
            ));
        }
        if statements.len() > 1 {
            return Err(SafetyViolation::new(
                ErrorCode::SafetyMultiStatement,
                format!("Multiple statements detected ({})", statements.len()),
            ));
        }

        // Rules 4 and 6: root statement type
        let statement = &statements[0];
        match statement {
            Statement::Query(query) => Self::check_query_body(&query.body)?,
            Statement::Explain { statement, .. } => {
                if !self.allow_explain {
                    return Err(SafetyViolation::new(
                        ErrorCode::SafetyExplainBlocked,
                        "EXPLAIN statements are not allowed",
                    ));
                }
                match statement.as_ref() {
                    Statement::Query(query) => Self::check_query_body(&query.body)?,
                    _ => {
                        return Err(SafetyViolation::new(
                            ErrorCode::SafetyNonSelect,
                            "EXPLAIN is only allowed on SELECT statements",
                        ));
                    }
                }
            }
            other => {
                return Err(SafetyViolation::new(
                    ErrorCode::SafetyNonSelect,
                    format!(
                        "Only SELECT or WITH statements are permitted, found: {}",
                        statement_kind(other)
                    ),
                ));
            }
        }

        // Rule 5: forbidden constructs anywhere in the token stream
        Self::scan_forbidden_tokens(trimmed, &dialect)?;

        let has_limit = match statement {
            Statement::Query(query) => query.limit_clause.is_some(),
            Statement::Explain { .. } => true, // plan output, never a scan
            _ => false,
        };

        Ok(SafetyVerdict {
            sql: trimmed.trim_end_matches(';').trim_end().to_string(),
            has_limit,
        })
    }

    /// Only SELECT bodies, nested queries and set operations are allowed at
    /// the root; bare VALUES and DML-returning bodies are not.
    fn check_query_body(body: &SetExpr) -> Result<(), SafetyViolation> {
        match body {
            SetExpr::Select(_) => Ok(()),
            SetExpr::Query(inner) => Self::check_query_body(&inner.body),
            SetExpr::SetOperation { left, right, .. } => {
                Self::check_query_body(left)?;
                Self::check_query_body(right)
            }
            _ => Err(SafetyViolation::new(
                ErrorCode::SafetyNonSelect,
                "Query body must be a SELECT",
            )),
        }
    }

    fn scan_forbidden_tokens(sql: &str, dialect: &SQLiteDialect) -> Result<(), SafetyViolation> {
        let tokens = Tokenizer::new(dialect, sql).tokenize().map_err(|e| {
            SafetyViolation::new(
                ErrorCode::SafetyParseError,
                format!("SQL tokenizer error: {}", e),
            )
        })?;

        for token in &tokens {
            if let Token::Word(word) = token {
                let lower = word.value.to_lowercase();

                if FORBIDDEN_TABLES.contains(&lower.as_str()) || lower.starts_with("pragma_") {
                    return Err(SafetyViolation::new(
                        ErrorCode::SafetyForbiddenConstruct,
                        format!("Schema introspection is not allowed: {}", word.value),
                    ));
                }

                // Quoted words are identifiers chosen by the schema author,
                // not statement keywords.
                if word.quote_style.is_none() && FORBIDDEN_KEYWORDS.contains(&lower.as_str()) {
                    return Err(SafetyViolation::new(
                        ErrorCode::SafetyForbiddenConstruct,
                        format!("Forbidden keyword: {}", word.value),
                    ));
                }
            }
        }

        Ok(())
    }
}

fn statement_kind(statement: &Statement) -> &'static str {
    match statement {
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::Drop { .. } => "DROP",
        Statement::CreateTable { .. } => "CREATE TABLE",
        Statement::AlterTable { .. } => "ALTER TABLE",
        Statement::AttachDatabase { .. } => "ATTACH",
        Statement::Pragma { .. } => "PRAGMA",
        _ => "non-SELECT statement",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> SqlValidator {
        SqlValidator::new(&SafetyConfig {
            max_sql_len: 4096,
            allow_explain: false,
        })
    }

    #[test]
    fn test_accepts_plain_select() {
        let verdict = validator().check("SELECT id, name FROM customers").unwrap();
        assert_eq!(verdict.sql, "SELECT id, name FROM customers");
        assert!(!verdict.has_limit);
    }

    #[test]
    fn test_accepts_with_cte() {
        let sql = "WITH t AS (SELECT customer_id, SUM(total) AS s FROM invoices GROUP BY customer_id) \
                   SELECT * FROM t ORDER BY s DESC LIMIT 5";
        let verdict = validator().check(sql).unwrap();
        assert!(verdict.has_limit);
    }

    #[test]
    fn test_strips_trailing_semicolon() {
        let verdict = validator().check("SELECT 1;").unwrap();
        assert_eq!(verdict.sql, "SELECT 1");
    }

    #[test]
    fn test_rejects_empty_input() {
        let err = validator().check("   \n\t ").unwrap_err();
        assert_eq!(err.code, ErrorCode::SafetyEmptyStatement);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rejects_oversized_input() {
        let sql = format!("SELECT '{}'", "x".repeat(5000));
        let err = validator().check(&sql).unwrap_err();
        assert_eq!(err.code, ErrorCode::SafetyTooLong);
    }

    #[test]
    fn test_rejects_multiple_statements() {
        let err = validator()
            .check("SELECT 1; SELECT 2")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SafetyMultiStatement);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rejects_delete_as_non_select_root() {
        let err = validator().check("DELETE FROM users;").unwrap_err();
        assert_eq!(err.code, ErrorCode::SafetyNonSelect);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rejects_other_dml_and_ddl_roots() {
        for sql in [
            "INSERT INTO users VALUES (1)",
            "UPDATE users SET name = 'x'",
            "DROP TABLE users",
            "CREATE TABLE t (id INTEGER)",
        ] {
            let err = validator().check(sql).unwrap_err();
            assert_eq!(err.code, ErrorCode::SafetyNonSelect, "sql: {}", sql);
        }
    }

    #[test]
    fn test_rejects_schema_introspection_tables() {
        let err = validator()
            .check("SELECT name FROM sqlite_master")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SafetyForbiddenConstruct);

        // Quoting does not bypass the introspection block.
        let err = validator()
            .check("SELECT name FROM \"sqlite_master\"")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SafetyForbiddenConstruct);
    }

    #[test]
    fn test_rejects_pragma_pseudo_tables() {
        let err = validator()
            .check("SELECT * FROM pragma_table_info('users')")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SafetyForbiddenConstruct);
    }

    #[test]
    fn test_forbidden_keyword_in_string_literal_is_allowed() {
        let verdict = validator()
            .check("SELECT * FROM logs WHERE message = 'please delete me' LIMIT 10")
            .unwrap();
        assert!(verdict.has_limit);
    }

    #[test]
    fn test_parse_failure_is_retryable() {
        let err = validator().check("SELEC * FORM users").unwrap_err();
        assert_eq!(err.code, ErrorCode::SafetyParseError);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_explain_blocked_by_default() {
        let err = validator()
            .check("EXPLAIN SELECT * FROM users")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SafetyExplainBlocked);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_explain_allowed_by_configuration() {
        let permissive = SqlValidator::new(&SafetyConfig {
            max_sql_len: 4096,
            allow_explain: true,
        });
        assert!(permissive.check("EXPLAIN SELECT * FROM users").is_ok());
    }

    #[test]
    fn test_limit_detection_uses_ast_not_text() {
        // Identifiers containing "limit" must not count as a LIMIT clause.
        let verdict = validator().check("SELECT limit_value FROM quotas").unwrap();
        assert!(!verdict.has_limit);

        let verdict = validator()
            .check("SELECT * FROM quotas LIMIT 100 OFFSET 10")
            .unwrap();
        assert!(verdict.has_limit);
    }
}
