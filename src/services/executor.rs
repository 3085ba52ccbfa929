// Sandbox executor: cost preflight plus bounded read-only execution.
//
// The preflight is a static heuristic over the sanitized statement; it
// never touches a connection. Execution goes through the DatabaseAdapter
// under a deadline, so one slow query cannot hang the pipeline.

use std::sync::Arc;
use std::time::Duration;

use sqlparser::ast::{Expr, GroupByExpr, Select, SelectItem, SetExpr, Statement};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

use crate::config::ExecutorConfig;
use crate::pipeline::types::ErrorCode;
use crate::services::database::{DatabaseAdapter, DbError, QueryOutput};
use crate::validation::SafetyVerdict;

const AGGREGATE_FUNCTIONS: &[&str] = &[
    "count",
    "sum",
    "avg",
    "min",
    "max",
    "total",
    "group_concat",
];

pub struct SandboxExecutor {
    adapter: Arc<dyn DatabaseAdapter>,
    statement_timeout: Duration,
    max_joins: usize,
}

impl SandboxExecutor {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, config: &ExecutorConfig) -> Self {
        Self {
            adapter,
            statement_timeout: Duration::from_secs(config.statement_timeout_secs),
            max_joins: config.max_joins,
        }
    }

    /// Run one vetted statement against the dataset at `path`.
    /// A preflight rejection returns `CostGuardrailBlocked` before any
    /// connection is opened.
    pub async fn run(&self, path: &str, verdict: &SafetyVerdict) -> Result<QueryOutput, DbError> {
        self.preflight(verdict)?;

        let fut = self.adapter.execute(path, &verdict.sql);
        match tokio::time::timeout(self.statement_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DbError::new(
                ErrorCode::DbTimeout,
                format!(
                    "Statement did not complete within {}s",
                    self.statement_timeout.as_secs()
                ),
            )),
        }
    }

    /// Static cost estimate. Blocks unconstrained full scans and excessive
    /// join fan-out; the blocked reason is carried in the error message.
    pub fn preflight(&self, verdict: &SafetyVerdict) -> Result<(), DbError> {
        let selects = match parse_selects(&verdict.sql) {
            Some(selects) => selects,
            // The validator has already parsed this SQL; anything it let
            // through that we cannot re-parse is left to the database.
            None => return Ok(()),
        };

        let join_count: usize = selects
            .iter()
            .map(|select| {
                select
                    .from
                    .iter()
                    .map(|table| table.joins.len())
                    .sum::<usize>()
            })
            .sum();
        if join_count > self.max_joins {
            tracing::warn!(
                "Cost guardrail blocked query: join fan-out {} exceeds {}",
                join_count,
                self.max_joins
            );
            return Err(DbError::new(
                ErrorCode::CostGuardrailBlocked,
                format!("blocked: join_fanout ({} joins)", join_count),
            ));
        }

        if !verdict.has_limit {
            let unconstrained = selects.iter().any(|select| {
                !select.from.is_empty()
                    && select.selection.is_none()
                    && !has_group_by(select)
                    && !has_aggregate(select)
            });
            if unconstrained {
                tracing::warn!("Cost guardrail blocked query: full scan without LIMIT");
                return Err(DbError::new(
                    ErrorCode::CostGuardrailBlocked,
                    "blocked: full_scan_without_limit",
                ));
            }
        }

        Ok(())
    }
}

fn parse_selects(sql: &str) -> Option<Vec<Select>> {
    let dialect = SQLiteDialect {};
    let statements = Parser::new(&dialect)
        .try_with_sql(sql)
        .and_then(|mut p| p.parse_statements())
        .ok()?;

    let mut selects = Vec::new();
    for statement in &statements {
        if let Statement::Query(query) = statement {
            collect_selects(&query.body, &mut selects);
            if let Some(with) = &query.with {
                for cte in &with.cte_tables {
                    collect_selects(&cte.query.body, &mut selects);
                }
            }
        }
    }
    Some(selects)
}

fn collect_selects(body: &SetExpr, out: &mut Vec<Select>) {
    match body {
        SetExpr::Select(select) => out.push(*select.clone()),
        SetExpr::Query(query) => collect_selects(&query.body, out),
        SetExpr::SetOperation { left, right, .. } => {
            collect_selects(left, out);
            collect_selects(right, out);
        }
        _ => {}
    }
}

fn has_group_by(select: &Select) -> bool {
    match &select.group_by {
        GroupByExpr::All(_) => true,
        GroupByExpr::Expressions(exprs, _) => !exprs.is_empty(),
    }
}

fn has_aggregate(select: &Select) -> bool {
    select.projection.iter().any(|item| {
        let expr = match item {
            SelectItem::UnnamedExpr(expr) => expr,
            SelectItem::ExprWithAlias { expr, .. } => expr,
            _ => return false,
        };
        if let Expr::Function(function) = expr {
            let name = function.name.to_string().to_lowercase();
            AGGREGATE_FUNCTIONS.contains(&name.as_str())
        } else {
            false
        }
    })
}
