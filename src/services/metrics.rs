// Metrics sink: one event per stage result, one per run outcome.
//
// Push-only. The orchestrator never blocks on a sink and a sink can never
// fail a run.

use crate::pipeline::types::{RunOutcome, StageRecord};

pub trait MetricsSink: Send + Sync {
    fn stage_completed(&self, record: &StageRecord);
    fn run_completed(&self, outcome: RunOutcome, duration_ms: u64);
}

/// Emits metrics as structured log events.
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn stage_completed(&self, record: &StageRecord) {
        tracing::info!(
            stage = record.stage.as_str(),
            ok = record.ok,
            retryable = record.retryable,
            duration_ms = record.duration_ms,
            error_code = ?record.error_code,
            "stage completed"
        );
    }

    fn run_completed(&self, outcome: RunOutcome, duration_ms: u64) {
        tracing::info!(
            outcome = outcome.as_str(),
            duration_ms = duration_ms,
            "pipeline run completed"
        );
    }
}

/// Discards every event; used where no collector is configured.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn stage_completed(&self, _record: &StageRecord) {}
    fn run_completed(&self, _outcome: RunOutcome, _duration_ms: u64) {}
}
