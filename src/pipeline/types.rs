// Core pipeline data model: stage identities, failure classification,
// per-stage trace records and the terminal FinalResult.

use serde::{Deserialize, Serialize};

/// One discrete step of the query pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Cache,
    Detect,
    Plan,
    Generate,
    Safety,
    Execute,
    Verify,
    Repair,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Cache => "cache",
            StageName::Detect => "detect",
            StageName::Plan => "plan",
            StageName::Generate => "generate",
            StageName::Safety => "safety",
            StageName::Execute => "execute",
            StageName::Verify => "verify",
            StageName::Repair => "repair",
        }
    }
}

/// Failure classification for stage results.
///
/// Codes are stable strings used in traces and metrics labels; they are
/// observability data, never repair prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Safety
    SafetyEmptyStatement,
    SafetyTooLong,
    SafetyParseError,
    SafetyMultiStatement,
    SafetyNonSelect,
    SafetyForbiddenConstruct,
    SafetyExplainBlocked,

    // Executor
    CostGuardrailBlocked,
    DbNoSuchTable,
    DbNoSuchColumn,
    DbSyntaxError,
    DbLocked,
    DbTimeout,
    DbFailure,

    // LLM collaborator
    LlmTimeout,
    LlmBadOutput,
    LlmTransport,

    // Verifier
    VerificationFailed,

    // Repair policy
    RepairExhausted,
}

impl ErrorCode {
    /// Whether a failure with this code may trigger a repair attempt.
    /// Safety policy violations and cost-guardrail blocks are hard stops.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::SafetyParseError
                | ErrorCode::DbNoSuchTable
                | ErrorCode::DbNoSuchColumn
                | ErrorCode::DbSyntaxError
                | ErrorCode::LlmTimeout
                | ErrorCode::LlmBadOutput
                | ErrorCode::LlmTransport
                | ErrorCode::VerificationFailed
        )
    }
}

/// Record of one stage invocation, appended to the run trace.
///
/// Invariant: `ok == false` implies `error_code` is present,
/// `ok == true` implies it is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageName,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub retryable: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StageRecord {
    pub fn ok(stage: StageName, duration_ms: u64) -> Self {
        Self {
            stage,
            ok: true,
            error_code: None,
            retryable: false,
            duration_ms,
            detail: None,
        }
    }

    pub fn failed(stage: StageName, code: ErrorCode, duration_ms: u64, detail: String) -> Self {
        Self {
            stage,
            ok: false,
            error_code: Some(code),
            retryable: code.is_retryable(),
            duration_ms,
            detail: Some(detail),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Overall outcome of one pipeline run, reported to the metrics sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Ok,
    Ambiguous,
    Error,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Ok => "ok",
            RunOutcome::Ambiguous => "ambiguous",
            RunOutcome::Error => "error",
        }
    }
}

/// Terminal, immutable result of one run. Always carries the full trace so
/// failures can be inspected without exposing raw internal faults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub ok: bool,
    pub ambiguous: bool,
    pub error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub questions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
    pub cache_hit: bool,
    pub trace: Vec<StageRecord>,
    pub total_duration_ms: u64,
}

impl FinalResult {
    pub fn outcome(&self) -> RunOutcome {
        if self.ambiguous {
            RunOutcome::Ambiguous
        } else if self.ok {
            RunOutcome::Ok
        } else {
            RunOutcome::Error
        }
    }
}
