// Stage wrappers around the LLM collaborator.
//
// Each stage performs one collaborator call under a caller-supplied
// deadline, times it, and folds the outcome into a StageRecord. Prompt
// construction lives in the LlmClient; policy lives in the orchestrator.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::pipeline::types::{ErrorCode, StageName, StageRecord};
use crate::services::llm_client::{LlmClient, LlmError, RepairTarget};

/// Result of one stage invocation: a payload when the stage succeeded,
/// always a trace record.
pub struct StageOutcome<T> {
    pub value: Option<T>,
    pub record: StageRecord,
}

impl<T> StageOutcome<T> {
    fn ok(value: T, stage: StageName, started: Instant) -> Self {
        Self {
            value: Some(value),
            record: StageRecord::ok(stage, elapsed_ms(started)),
        }
    }

    fn failed(stage: StageName, code: ErrorCode, detail: String, started: Instant) -> Self {
        Self {
            value: None,
            record: StageRecord::failed(stage, code, elapsed_ms(started), detail),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Run one collaborator call under a deadline; exceeding it is an ordinary
/// timeout failure, never a hang.
async fn timed_call<T, F>(stage: StageName, deadline: Duration, fut: F) -> StageOutcome<T>
where
    F: Future<Output = Result<T, LlmError>>,
{
    let started = Instant::now();
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(value)) => StageOutcome::ok(value, stage, started),
        Ok(Err(err)) => StageOutcome::failed(stage, err.error_code(), err.to_string(), started),
        Err(_) => StageOutcome::failed(
            stage,
            ErrorCode::LlmTimeout,
            format!("stage exceeded {}s deadline", deadline.as_secs()),
            started,
        ),
    }
}

pub struct Detector {
    llm: Arc<dyn LlmClient>,
    deadline: Duration,
}

impl Detector {
    pub fn new(llm: Arc<dyn LlmClient>, deadline: Duration) -> Self {
        Self { llm, deadline }
    }

    pub async fn run(&self, question: &str, schema: &str) -> StageOutcome<Vec<String>> {
        let mut outcome = timed_call(
            StageName::Detect,
            self.deadline,
            self.llm.detect(question, schema),
        )
        .await;
        if let Some(questions) = &outcome.value {
            if !questions.is_empty() {
                outcome.record = outcome
                    .record
                    .with_detail(format!("{} clarification question(s)", questions.len()));
            }
        }
        outcome
    }
}

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    deadline: Duration,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, deadline: Duration) -> Self {
        Self { llm, deadline }
    }

    pub async fn run(&self, question: &str, schema: &str) -> StageOutcome<String> {
        timed_call(
            StageName::Plan,
            self.deadline,
            self.llm.plan(question, schema),
        )
        .await
    }
}

pub struct Generator {
    llm: Arc<dyn LlmClient>,
    deadline: Duration,
}

/// Generated artifact: SQL plus the model's rationale.
#[derive(Debug, Clone)]
pub struct GeneratedSql {
    pub sql: String,
    pub rationale: String,
}

impl Generator {
    pub fn new(llm: Arc<dyn LlmClient>, deadline: Duration) -> Self {
        Self { llm, deadline }
    }

    pub async fn run(
        &self,
        question: &str,
        schema: &str,
        plan: &str,
        clarify_answers: &BTreeMap<String, String>,
    ) -> StageOutcome<GeneratedSql> {
        let outcome = timed_call(
            StageName::Generate,
            self.deadline,
            self.llm.generate(question, schema, plan, clarify_answers),
        )
        .await;
        StageOutcome {
            value: outcome
                .value
                .map(|(sql, rationale)| GeneratedSql { sql, rationale }),
            record: outcome.record,
        }
    }
}

pub struct Verifier {
    llm: Arc<dyn LlmClient>,
    deadline: Duration,
}

impl Verifier {
    pub fn new(llm: Arc<dyn LlmClient>, deadline: Duration) -> Self {
        Self { llm, deadline }
    }

    /// A negative verdict is a stage failure (VerificationFailed), distinct
    /// from a collaborator failure.
    pub async fn run(
        &self,
        question: &str,
        sql: &str,
        columns: &[String],
        row_count: usize,
    ) -> StageOutcome<bool> {
        let started = Instant::now();
        let outcome = timed_call(
            StageName::Verify,
            self.deadline,
            self.llm.verify(question, sql, columns, row_count),
        )
        .await;

        match outcome.value {
            Some((true, _)) => StageOutcome {
                value: Some(true),
                record: outcome.record,
            },
            Some((false, reason)) => StageOutcome::failed(
                StageName::Verify,
                ErrorCode::VerificationFailed,
                reason.unwrap_or_else(|| "result does not answer the question".to_string()),
                started,
            ),
            None => StageOutcome {
                value: None,
                record: outcome.record,
            },
        }
    }
}

/// Repair controller: one collaborator call per invocation. The attempt
/// bound is enforced by the orchestrator, not here.
pub struct RepairController {
    llm: Arc<dyn LlmClient>,
    deadline: Duration,
}

impl RepairController {
    pub fn new(llm: Arc<dyn LlmClient>, deadline: Duration) -> Self {
        Self { llm, deadline }
    }

    pub async fn run(
        &self,
        target: RepairTarget,
        artifact: &str,
        error_text: &str,
        schema: &str,
    ) -> StageOutcome<String> {
        timed_call(
            StageName::Repair,
            self.deadline,
            self.llm.repair(target, artifact, error_text, schema),
        )
        .await
    }
}
