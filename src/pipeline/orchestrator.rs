// Pipeline orchestrator.
//
// Owns stage sequencing, the repair policy and cache mediation for one run:
// cache lookup, DETECT, PLAN, GENERATE, SAFETY, EXECUTE, VERIFY, with a
// bounded REPAIR sub-state reachable from the eligible stages. The trace is
// built here and only here.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::{Config, RepairPolicy};
use crate::pipeline::stages::{Detector, Generator, Planner, RepairController, Verifier};
use crate::pipeline::types::{FinalResult, RunOutcome, StageName, StageRecord};
use crate::services::database::{DatabaseAdapter, QueryOutput};
use crate::services::llm_client::{LlmClient, RepairTarget};
use crate::services::metrics::MetricsSink;
use crate::services::query_cache::{CacheKey, QueryCache};
use crate::services::schema_store::SchemaStore;
use crate::services::SandboxExecutor;
use crate::validation::{SafetyVerdict, SqlValidator};

/// One natural-language query request. Immutable for the lifetime of a run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub question: String,
    pub dataset_id: Option<String>,
    pub clarify_answers: BTreeMap<String, String>,
}

impl RunRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            dataset_id: None,
            clarify_answers: BTreeMap::new(),
        }
    }
}

/// Request-level failure, distinct from any pipeline-stage error.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),
}

/// Tracks the single-repair bound. Scope depends on the configured policy.
struct RepairBudget {
    policy: RepairPolicy,
    used_stages: HashSet<StageName>,
    used_total: u32,
}

impl RepairBudget {
    fn new(policy: RepairPolicy) -> Self {
        Self {
            policy,
            used_stages: HashSet::new(),
            used_total: 0,
        }
    }

    /// Consume one attempt for the given stage; returns false once the
    /// stage (per-stage policy) or the run (per-run policy) is exhausted.
    fn try_consume(&mut self, stage: StageName) -> bool {
        match self.policy {
            RepairPolicy::PerStage => self.used_stages.insert(stage),
            RepairPolicy::PerRun => {
                if self.used_total > 0 {
                    false
                } else {
                    self.used_total = 1;
                    true
                }
            }
        }
    }
}

enum Phase {
    Safety,
    Execute,
    Verify,
}

pub struct Orchestrator {
    detector: Detector,
    planner: Planner,
    generator: Generator,
    validator: SqlValidator,
    executor: SandboxExecutor,
    verifier: Verifier,
    repair: RepairController,
    cache: Arc<QueryCache>,
    schemas: Arc<SchemaStore>,
    metrics: Arc<dyn MetricsSink>,
    repair_policy: RepairPolicy,
    default_dataset: String,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        adapter: Arc<dyn DatabaseAdapter>,
        cache: Arc<QueryCache>,
        schemas: Arc<SchemaStore>,
        metrics: Arc<dyn MetricsSink>,
        config: &Config,
    ) -> Self {
        let deadline = Duration::from_secs(config.llm.timeout_secs);
        Self {
            detector: Detector::new(llm.clone(), deadline),
            planner: Planner::new(llm.clone(), deadline),
            generator: Generator::new(llm.clone(), deadline),
            validator: SqlValidator::new(&config.safety),
            executor: SandboxExecutor::new(adapter, &config.executor),
            verifier: Verifier::new(llm.clone(), deadline),
            repair: RepairController::new(llm, deadline),
            cache,
            schemas,
            metrics,
            repair_policy: config.pipeline.repair_policy,
            default_dataset: config.datasets.default_dataset.clone(),
        }
    }

    /// Run the full pipeline for one request. Every pipeline failure yields
    /// `Ok(FinalResult)` with a complete trace; `Err` is reserved for
    /// request-level failures.
    pub async fn run(&self, request: &RunRequest) -> Result<FinalResult, RunError> {
        let started = Instant::now();
        let run_id = Uuid::new_v4();

        let dataset_id = request
            .dataset_id
            .clone()
            .unwrap_or_else(|| self.default_dataset.clone());
        let dataset = self
            .schemas
            .lookup(&dataset_id)
            .ok_or_else(|| RunError::DatasetNotFound(dataset_id.clone()))?;
        let schema_text = dataset.preview.render();
        let key = CacheKey::new(&dataset_id, &request.question, &dataset.preview.fingerprint());

        tracing::info!(%run_id, dataset = %dataset_id, "pipeline run started");

        if let Some(mut hit) = self.cache.get(&key) {
            hit.cache_hit = true;
            hit.trace = vec![StageRecord::ok(StageName::Cache, 0).with_detail("cache hit")];
            hit.total_duration_ms = started.elapsed().as_millis() as u64;
            self.metrics.stage_completed(&hit.trace[0]);
            self.metrics
                .run_completed(RunOutcome::Ok, hit.total_duration_ms);
            return Ok(hit);
        }

        let mut trace: Vec<StageRecord> = Vec::new();
        let mut budget = RepairBudget::new(self.repair_policy);

        // DETECT: one or more clarification questions is a valid terminal
        // outcome, not a failure.
        let detect = self.detector.run(&request.question, &schema_text).await;
        self.push(&mut trace, detect.record.clone());
        let questions = match detect.value {
            Some(questions) => questions,
            None => return Ok(self.finish_error(detect.record, trace, started, None, None)),
        };
        if !questions.is_empty() {
            return Ok(self.finish_ambiguous(questions, trace, started));
        }

        // PLAN: a repaired plan feeds GENERATE, the step downstream of the
        // failure.
        let plan_outcome = self.planner.run(&request.question, &schema_text).await;
        self.push(&mut trace, plan_outcome.record.clone());
        let plan = match plan_outcome.value {
            Some(plan) => plan,
            None => {
                let original = plan_outcome.record;
                if original.retryable && budget.try_consume(StageName::Plan) {
                    let detail = original.detail.clone().unwrap_or_default();
                    match self
                        .attempt_repair(RepairTarget::Plan, "", &detail, &schema_text, &mut trace)
                        .await
                    {
                        Some(plan) => plan,
                        None => return Ok(self.finish_error(original, trace, started, None, None)),
                    }
                } else {
                    return Ok(self.finish_error(original, trace, started, None, None));
                }
            }
        };

        // GENERATE: repaired SQL re-enters SAFETY rather than re-running
        // the generator.
        let gen_outcome = self
            .generator
            .run(&request.question, &schema_text, &plan, &request.clarify_answers)
            .await;
        self.push(&mut trace, gen_outcome.record.clone());
        let (mut sql, rationale) = match gen_outcome.value {
            Some(generated) => (generated.sql, generated.rationale),
            None => {
                let original = gen_outcome.record;
                if original.retryable && budget.try_consume(StageName::Generate) {
                    let detail = original.detail.clone().unwrap_or_default();
                    match self
                        .attempt_repair(RepairTarget::Sql, "", &detail, &schema_text, &mut trace)
                        .await
                    {
                        Some(sql) => (sql, String::new()),
                        None => return Ok(self.finish_error(original, trace, started, None, None)),
                    }
                } else {
                    return Ok(self.finish_error(original, trace, started, None, None));
                }
            }
        };

        // SAFETY -> EXECUTE -> VERIFY, re-entered from SAFETY after any
        // successful SQL repair. Terminates because each stage can consume
        // the repair budget at most once.
        let mut verdict: Option<SafetyVerdict> = None;
        let mut output: Option<QueryOutput> = None;
        let mut phase = Phase::Safety;
        loop {
            match phase {
                Phase::Safety => {
                    let stage_started = Instant::now();
                    match self.validator.check(&sql) {
                        Ok(v) => {
                            self.push(
                                &mut trace,
                                StageRecord::ok(
                                    StageName::Safety,
                                    stage_started.elapsed().as_millis() as u64,
                                ),
                            );
                            verdict = Some(v);
                            phase = Phase::Execute;
                        }
                        Err(violation) => {
                            let record = StageRecord::failed(
                                StageName::Safety,
                                violation.code,
                                stage_started.elapsed().as_millis() as u64,
                                violation.message.clone(),
                            );
                            self.push(&mut trace, record.clone());
                            // Policy violations are a hard stop; only a
                            // parse failure is a correctable defect.
                            if violation.is_retryable() && budget.try_consume(StageName::Safety) {
                                match self
                                    .attempt_repair(
                                        RepairTarget::Sql,
                                        &sql,
                                        &violation.message,
                                        &schema_text,
                                        &mut trace,
                                    )
                                    .await
                                {
                                    Some(fixed) => sql = fixed,
                                    None => {
                                        return Ok(self.finish_error(
                                            record,
                                            trace,
                                            started,
                                            Some(sql),
                                            Some(rationale),
                                        ))
                                    }
                                }
                            } else {
                                return Ok(self.finish_error(
                                    record,
                                    trace,
                                    started,
                                    Some(sql),
                                    Some(rationale),
                                ));
                            }
                        }
                    }
                }
                Phase::Execute => {
                    let v = verdict.as_ref().unwrap();
                    let stage_started = Instant::now();
                    match self.executor.run(&dataset.path, v).await {
                        Ok(out) => {
                            self.push(
                                &mut trace,
                                StageRecord::ok(
                                    StageName::Execute,
                                    stage_started.elapsed().as_millis() as u64,
                                )
                                .with_detail(format!("{} row(s)", out.row_count())),
                            );
                            output = Some(out);
                            phase = Phase::Verify;
                        }
                        Err(db_err) => {
                            let record = StageRecord::failed(
                                StageName::Execute,
                                db_err.code,
                                stage_started.elapsed().as_millis() as u64,
                                db_err.message.clone(),
                            );
                            self.push(&mut trace, record.clone());
                            if db_err.is_retryable() && budget.try_consume(StageName::Execute) {
                                match self
                                    .attempt_repair(
                                        RepairTarget::Sql,
                                        &sql,
                                        &db_err.message,
                                        &schema_text,
                                        &mut trace,
                                    )
                                    .await
                                {
                                    Some(fixed) => {
                                        sql = fixed;
                                        phase = Phase::Safety;
                                    }
                                    None => {
                                        return Ok(self.finish_error(
                                            record,
                                            trace,
                                            started,
                                            Some(sql),
                                            Some(rationale),
                                        ))
                                    }
                                }
                            } else {
                                return Ok(self.finish_error(
                                    record,
                                    trace,
                                    started,
                                    Some(sql),
                                    Some(rationale),
                                ));
                            }
                        }
                    }
                }
                Phase::Verify => {
                    let out = output.as_ref().unwrap();
                    let verify_outcome = self
                        .verifier
                        .run(&request.question, &sql, &out.columns, out.row_count())
                        .await;
                    self.push(&mut trace, verify_outcome.record.clone());
                    if verify_outcome.record.ok {
                        break;
                    }
                    let record = verify_outcome.record;
                    if record.retryable && budget.try_consume(StageName::Verify) {
                        let detail = record.detail.clone().unwrap_or_default();
                        match self
                            .attempt_repair(
                                RepairTarget::Sql,
                                &sql,
                                &detail,
                                &schema_text,
                                &mut trace,
                            )
                            .await
                        {
                            Some(fixed) => {
                                sql = fixed;
                                phase = Phase::Safety;
                            }
                            None => {
                                return Ok(self.finish_error(
                                    record,
                                    trace,
                                    started,
                                    Some(sql),
                                    Some(rationale),
                                ))
                            }
                        }
                    } else {
                        return Ok(self.finish_error(
                            record,
                            trace,
                            started,
                            Some(sql),
                            Some(rationale),
                        ));
                    }
                }
            }
        }

        let out = output.unwrap();
        let sanitized_sql = verdict.unwrap().sql;
        let total_duration_ms = started.elapsed().as_millis() as u64;
        let row_count = out.row_count();
        let result = FinalResult {
            ok: true,
            ambiguous: false,
            error: false,
            questions: None,
            sql: Some(sanitized_sql),
            rationale: Some(rationale),
            columns: Some(out.columns),
            rows: Some(out.rows),
            row_count: Some(row_count),
            verified: Some(true),
            error_code: None,
            details: None,
            cache_hit: false,
            trace,
            total_duration_ms,
        };

        // Populate only on full success; abandoned or failed runs must
        // never leave a partial entry behind.
        self.cache.put(key, result.clone());
        self.metrics.run_completed(RunOutcome::Ok, total_duration_ms);
        tracing::info!(%run_id, duration_ms = total_duration_ms, "pipeline run ok");
        Ok(result)
    }

    async fn attempt_repair(
        &self,
        target: RepairTarget,
        artifact: &str,
        error_text: &str,
        schema: &str,
        trace: &mut Vec<StageRecord>,
    ) -> Option<String> {
        tracing::info!("attempting repair: {}", error_text);
        let outcome = self.repair.run(target, artifact, error_text, schema).await;
        self.push(trace, outcome.record);
        outcome.value
    }

    fn push(&self, trace: &mut Vec<StageRecord>, record: StageRecord) {
        self.metrics.stage_completed(&record);
        trace.push(record);
    }

    fn finish_ambiguous(
        &self,
        questions: Vec<String>,
        trace: Vec<StageRecord>,
        started: Instant,
    ) -> FinalResult {
        let total_duration_ms = started.elapsed().as_millis() as u64;
        self.metrics
            .run_completed(RunOutcome::Ambiguous, total_duration_ms);
        FinalResult {
            ok: false,
            ambiguous: true,
            error: false,
            questions: Some(questions),
            sql: None,
            rationale: None,
            columns: None,
            rows: None,
            row_count: None,
            verified: None,
            error_code: None,
            details: None,
            cache_hit: false,
            trace,
            total_duration_ms,
        }
    }

    /// Terminal error result. `original` is the failing stage's record; its
    /// error is what gets reported even when a later repair attempt also
    /// failed.
    fn finish_error(
        &self,
        original: StageRecord,
        trace: Vec<StageRecord>,
        started: Instant,
        sql: Option<String>,
        rationale: Option<String>,
    ) -> FinalResult {
        let total_duration_ms = started.elapsed().as_millis() as u64;
        self.metrics
            .run_completed(RunOutcome::Error, total_duration_ms);
        FinalResult {
            ok: false,
            ambiguous: false,
            error: true,
            questions: None,
            sql,
            rationale,
            columns: None,
            rows: None,
            row_count: None,
            verified: None,
            error_code: original.error_code,
            details: original.detail.map(|d| vec![d]),
            cache_hit: false,
            trace,
            total_duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::config::{
        CacheConfig, DatasetConfig, ExecutorConfig, LlmConfig, LoggingConfig, PipelineConfig,
        SafetyConfig, ServerConfig,
    };
    use crate::pipeline::types::ErrorCode;
    use crate::services::database::SqliteAdapter;
    use crate::services::llm_client::{LlmClient, LlmError};
    use crate::services::metrics::test_support::RecordingMetrics;

    const TOP5_SQL: &str = "SELECT c.name, SUM(i.total) AS total_amount \
         FROM customers c JOIN invoices i ON i.customer_id = c.id \
         GROUP BY c.name ORDER BY total_amount DESC LIMIT 5";

    /// Scripted collaborator: per-stage queues of outcomes, falling back to
    /// sensible defaults when a queue is empty.
    struct ScriptedLlm {
        questions: Vec<String>,
        plans: Mutex<VecDeque<Result<String, LlmError>>>,
        generations: Mutex<VecDeque<Result<(String, String), LlmError>>>,
        verdicts: Mutex<VecDeque<Result<(bool, Option<String>), LlmError>>>,
        repairs: Mutex<VecDeque<Result<String, LlmError>>>,
        plan_calls: AtomicUsize,
        generate_calls: AtomicUsize,
        repair_calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new() -> Self {
            Self {
                questions: Vec::new(),
                plans: Mutex::new(VecDeque::new()),
                generations: Mutex::new(VecDeque::new()),
                verdicts: Mutex::new(VecDeque::new()),
                repairs: Mutex::new(VecDeque::new()),
                plan_calls: AtomicUsize::new(0),
                generate_calls: AtomicUsize::new(0),
                repair_calls: AtomicUsize::new(0),
            }
        }

        fn with_questions(questions: Vec<&str>) -> Self {
            let mut llm = Self::new();
            llm.questions = questions.into_iter().map(String::from).collect();
            llm
        }

        fn script_generation(&self, result: Result<(String, String), LlmError>) {
            self.generations.lock().unwrap().push_back(result);
        }

        fn script_plan(&self, result: Result<String, LlmError>) {
            self.plans.lock().unwrap().push_back(result);
        }

        fn script_verdict(&self, result: Result<(bool, Option<String>), LlmError>) {
            self.verdicts.lock().unwrap().push_back(result);
        }

        fn script_repair(&self, result: Result<String, LlmError>) {
            self.repairs.lock().unwrap().push_back(result);
        }
    }

    #[async_trait::async_trait]
    impl LlmClient for ScriptedLlm {
        async fn detect(&self, _q: &str, _s: &str) -> Result<Vec<String>, LlmError> {
            Ok(self.questions.clone())
        }

        async fn plan(&self, _q: &str, _s: &str) -> Result<String, LlmError> {
            self.plan_calls.fetch_add(1, Ordering::SeqCst);
            self.plans
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("join customers to invoices, sum, sort, limit".to_string()))
        }

        async fn generate(
            &self,
            _q: &str,
            _s: &str,
            _p: &str,
            _c: &BTreeMap<String, String>,
        ) -> Result<(String, String), LlmError> {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            self.generations
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok((TOP5_SQL.to_string(), "sum and rank".to_string())))
        }

        async fn verify(
            &self,
            _q: &str,
            _sql: &str,
            _c: &[String],
            _n: usize,
        ) -> Result<(bool, Option<String>), LlmError> {
            self.verdicts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok((true, None)))
        }

        async fn repair(
            &self,
            _t: RepairTarget,
            _a: &str,
            _e: &str,
            _s: &str,
        ) -> Result<String, LlmError> {
            self.repair_calls.fetch_add(1, Ordering::SeqCst);
            self.repairs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::BadOutput("no repair scripted".to_string())))
        }
    }

    fn test_config(policy: RepairPolicy) -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            llm: LlmConfig {
                gateway_url: "http://localhost:0".to_string(),
                api_key: None,
                timeout_secs: 5,
            },
            safety: SafetyConfig {
                max_sql_len: 4096,
                allow_explain: false,
            },
            executor: ExecutorConfig {
                statement_timeout_secs: 5,
                max_joins: 4,
            },
            cache: CacheConfig {
                capacity: 100,
                ttl_secs: 60,
            },
            pipeline: PipelineConfig {
                repair_policy: policy,
            },
            datasets: DatasetConfig {
                data_dir: "./data".to_string(),
                default_dataset: "demo".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }

    fn fixture_db() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let conn = rusqlite::Connection::open(file.path()).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT);
            CREATE TABLE invoices (id INTEGER PRIMARY KEY, customer_id INTEGER, total REAL);
            INSERT INTO customers (id, name) VALUES
                (1, 'Alice'), (2, 'Bob'), (3, 'Cara'),
                (4, 'Dev'), (5, 'Eve'), (6, 'Finn');
            INSERT INTO invoices (id, customer_id, total) VALUES
                (1, 1, 100.0), (2, 2, 90.0), (3, 3, 80.0),
                (4, 4, 70.0), (5, 5, 60.0), (6, 6, 50.0),
                (7, 1, 5.0);
            "#,
        )
        .unwrap();
        file
    }

    struct Harness {
        orchestrator: Orchestrator,
        cache: Arc<QueryCache>,
        metrics: Arc<RecordingMetrics>,
        _db: tempfile::NamedTempFile,
    }

    async fn harness(llm: Arc<ScriptedLlm>, policy: RepairPolicy) -> Harness {
        let config = test_config(policy);
        let db = fixture_db();
        let adapter = Arc::new(SqliteAdapter::new());
        let schemas = Arc::new(SchemaStore::new());
        let path = db.path().to_str().unwrap().to_string();
        let columns = adapter.introspect(&path).await.unwrap();
        schemas.register(
            "demo",
            &path,
            crate::services::SchemaPreview::new("demo", columns),
        );

        let cache = Arc::new(QueryCache::new(
            config.cache.capacity,
            Duration::from_secs(config.cache.ttl_secs),
        ));
        let metrics = Arc::new(RecordingMetrics::default());
        let orchestrator = Orchestrator::new(
            llm,
            adapter,
            cache.clone(),
            schemas,
            metrics.clone(),
            &config,
        );
        Harness {
            orchestrator,
            cache,
            metrics,
            _db: db,
        }
    }

    fn stages(result: &FinalResult) -> Vec<StageName> {
        result.trace.iter().map(|r| r.stage).collect()
    }

    #[tokio::test]
    async fn test_happy_path_top_five_customers() {
        let llm = Arc::new(ScriptedLlm::new());
        let h = harness(llm.clone(), RepairPolicy::PerStage).await;

        let result = h
            .orchestrator
            .run(&RunRequest::new("Top 5 customers by total invoice amount"))
            .await
            .unwrap();

        assert!(result.ok);
        assert!(!result.ambiguous);
        let sql = result.sql.as_deref().unwrap();
        assert!(sql.to_uppercase().starts_with("SELECT"));
        assert_eq!(result.rows.as_ref().unwrap().len(), 5);
        assert_eq!(result.rows.as_ref().unwrap()[0]["name"], "Alice");
        assert_eq!(result.verified, Some(true));
        assert_eq!(
            stages(&result),
            vec![
                StageName::Detect,
                StageName::Plan,
                StageName::Generate,
                StageName::Safety,
                StageName::Execute,
                StageName::Verify
            ]
        );
        assert_eq!(h.cache.size(), 1);
        assert_eq!(h.metrics.runs.lock().unwrap().as_slice(), &[RunOutcome::Ok]);
    }

    #[tokio::test]
    async fn test_ambiguous_terminates_without_planning() {
        let llm = Arc::new(ScriptedLlm::with_questions(vec![
            "Which notion of 'recent' do you mean?",
        ]));
        let h = harness(llm.clone(), RepairPolicy::PerStage).await;

        let result = h
            .orchestrator
            .run(&RunRequest::new("recent orders"))
            .await
            .unwrap();

        assert!(result.ambiguous);
        assert!(!result.ok);
        assert!(!result.error);
        assert_eq!(result.questions.as_ref().unwrap().len(), 1);
        assert_eq!(llm.plan_calls.load(Ordering::SeqCst), 0);
        assert_eq!(stages(&result), vec![StageName::Detect]);
        assert_eq!(h.cache.size(), 0);
        assert_eq!(
            h.metrics.runs.lock().unwrap().as_slice(),
            &[RunOutcome::Ambiguous]
        );
    }

    #[tokio::test]
    async fn test_delete_statement_blocked_without_repair_or_execution() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script_generation(Ok(("DELETE FROM users;".to_string(), String::new())));
        let h = harness(llm.clone(), RepairPolicy::PerStage).await;

        let result = h
            .orchestrator
            .run(&RunRequest::new("remove all users"))
            .await
            .unwrap();

        assert!(result.error);
        assert_eq!(result.error_code, Some(ErrorCode::SafetyNonSelect));
        assert_eq!(llm.repair_calls.load(Ordering::SeqCst), 0);
        assert!(!stages(&result).contains(&StageName::Execute));
        assert!(!stages(&result).contains(&StageName::Repair));
        assert_eq!(h.cache.size(), 0);
    }

    #[tokio::test]
    async fn test_multi_statement_blocked_without_repair() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script_generation(Ok((
            "SELECT 1; SELECT 2".to_string(),
            String::new(),
        )));
        let h = harness(llm.clone(), RepairPolicy::PerStage).await;

        let result = h.orchestrator.run(&RunRequest::new("two things")).await.unwrap();

        assert!(result.error);
        assert_eq!(result.error_code, Some(ErrorCode::SafetyMultiStatement));
        assert_eq!(llm.repair_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parse_failure_repaired_once_then_succeeds() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script_generation(Ok(("SELEC * FORM customers".to_string(), String::new())));
        llm.script_repair(Ok(TOP5_SQL.to_string()));
        let h = harness(llm.clone(), RepairPolicy::PerStage).await;

        let result = h
            .orchestrator
            .run(&RunRequest::new("top 5 customers by spend"))
            .await
            .unwrap();

        assert!(result.ok);
        assert_eq!(llm.repair_calls.load(Ordering::SeqCst), 1);
        // Failed safety, repair, then safety again on the repaired SQL.
        assert_eq!(
            stages(&result),
            vec![
                StageName::Detect,
                StageName::Plan,
                StageName::Generate,
                StageName::Safety,
                StageName::Repair,
                StageName::Safety,
                StageName::Execute,
                StageName::Verify
            ]
        );
    }

    #[tokio::test]
    async fn test_repair_failure_reports_original_error() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script_generation(Ok(("SELEC * FORM customers".to_string(), String::new())));
        llm.script_repair(Err(LlmError::BadOutput("garbage".to_string())));
        let h = harness(llm.clone(), RepairPolicy::PerStage).await;

        let result = h.orchestrator.run(&RunRequest::new("q")).await.unwrap();

        assert!(result.error);
        // The original parse failure is reported, not the repair attempt's
        // own failure.
        assert_eq!(result.error_code, Some(ErrorCode::SafetyParseError));
        assert_eq!(llm.repair_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_failure_of_same_stage_is_terminal() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script_generation(Ok((
            "SELECT * FROM missing_table LIMIT 5".to_string(),
            String::new(),
        )));
        // The repair output still references a missing table.
        llm.script_repair(Ok("SELECT * FROM also_missing LIMIT 5".to_string()));
        let h = harness(llm.clone(), RepairPolicy::PerStage).await;

        let result = h.orchestrator.run(&RunRequest::new("q")).await.unwrap();

        assert!(result.error);
        assert_eq!(result.error_code, Some(ErrorCode::DbNoSuchTable));
        assert_eq!(llm.repair_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.cache.size(), 0);
    }

    #[tokio::test]
    async fn test_execution_failure_repaired_then_succeeds() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script_generation(Ok((
            "SELECT * FROM missing_table LIMIT 5".to_string(),
            String::new(),
        )));
        llm.script_repair(Ok(TOP5_SQL.to_string()));
        let h = harness(llm.clone(), RepairPolicy::PerStage).await;

        let result = h.orchestrator.run(&RunRequest::new("q")).await.unwrap();

        assert!(result.ok);
        assert_eq!(llm.repair_calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.rows.as_ref().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_verification_failure_repaired_then_succeeds() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script_verdict(Ok((false, Some("wrong aggregation".to_string()))));
        llm.script_repair(Ok(TOP5_SQL.to_string()));
        let h = harness(llm.clone(), RepairPolicy::PerStage).await;

        let result = h.orchestrator.run(&RunRequest::new("q")).await.unwrap();

        assert!(result.ok);
        assert_eq!(llm.repair_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            stages(&result),
            vec![
                StageName::Detect,
                StageName::Plan,
                StageName::Generate,
                StageName::Safety,
                StageName::Execute,
                StageName::Verify,
                StageName::Repair,
                StageName::Safety,
                StageName::Execute,
                StageName::Verify
            ]
        );
    }

    #[tokio::test]
    async fn test_cost_guardrail_block_is_terminal_without_repair() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script_generation(Ok((
            "SELECT * FROM customers".to_string(),
            String::new(),
        )));
        let h = harness(llm.clone(), RepairPolicy::PerStage).await;

        let result = h.orchestrator.run(&RunRequest::new("everything")).await.unwrap();

        assert!(result.error);
        assert_eq!(result.error_code, Some(ErrorCode::CostGuardrailBlocked));
        assert_eq!(llm.repair_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_per_stage_policy_allows_one_repair_per_stage() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script_plan(Err(LlmError::Transport("gateway down".to_string())));
        llm.script_repair(Ok("use invoices joined to customers".to_string()));
        llm.script_generation(Err(LlmError::BadOutput("not json".to_string())));
        llm.script_repair(Ok(TOP5_SQL.to_string()));
        let h = harness(llm.clone(), RepairPolicy::PerStage).await;

        let result = h.orchestrator.run(&RunRequest::new("q")).await.unwrap();

        assert!(result.ok);
        assert_eq!(llm.repair_calls.load(Ordering::SeqCst), 2);
        // The generator repair feeds SAFETY directly; the generator itself
        // runs only once.
        assert_eq!(llm.generate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_per_run_policy_exhausts_after_one_repair() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script_plan(Err(LlmError::Transport("gateway down".to_string())));
        llm.script_repair(Ok("use invoices joined to customers".to_string()));
        llm.script_generation(Err(LlmError::BadOutput("not json".to_string())));
        let h = harness(llm.clone(), RepairPolicy::PerRun).await;

        let result = h.orchestrator.run(&RunRequest::new("q")).await.unwrap();

        assert!(result.error);
        assert_eq!(result.error_code, Some(ErrorCode::LlmBadOutput));
        assert_eq!(llm.repair_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_run_served_from_cache_with_identical_payload() {
        let llm = Arc::new(ScriptedLlm::new());
        let h = harness(llm.clone(), RepairPolicy::PerStage).await;
        let request = RunRequest::new("Top 5 customers by total invoice amount");

        let first = h.orchestrator.run(&request).await.unwrap();
        let second = h.orchestrator.run(&request).await.unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(first.sql, second.sql);
        assert_eq!(first.rows, second.rows);
        assert_eq!(first.columns, second.columns);
        assert_eq!(second.trace.len(), 1);
        assert_eq!(second.trace[0].stage, StageName::Cache);
        // The pipeline itself ran only once.
        assert_eq!(llm.generate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_key_normalization_folds_case_and_whitespace() {
        let llm = Arc::new(ScriptedLlm::new());
        let h = harness(llm.clone(), RepairPolicy::PerStage).await;

        h.orchestrator
            .run(&RunRequest::new("Top 5 customers by total invoice amount"))
            .await
            .unwrap();
        let second = h
            .orchestrator
            .run(&RunRequest::new("  top 5   CUSTOMERS by total invoice amount "))
            .await
            .unwrap();

        assert!(second.cache_hit);
        assert_eq!(h.cache.size(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_leave_one_cache_entry() {
        let llm = Arc::new(ScriptedLlm::new());
        let h = harness(llm.clone(), RepairPolicy::PerStage).await;
        let orchestrator = Arc::new(h.orchestrator);

        let a = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .run(&RunRequest::new("Top 5 customers by total invoice amount"))
                    .await
                    .unwrap()
            })
        };
        let b = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .run(&RunRequest::new("Top 5 customers by total invoice amount"))
                    .await
                    .unwrap()
            })
        };

        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
        assert!(ra.ok && rb.ok);
        assert_eq!(ra.rows, rb.rows);
        assert_eq!(h.cache.size(), 1);
    }

    #[tokio::test]
    async fn test_unknown_dataset_is_request_level_error() {
        let llm = Arc::new(ScriptedLlm::new());
        let h = harness(llm.clone(), RepairPolicy::PerStage).await;

        let mut request = RunRequest::new("q");
        request.dataset_id = Some("nope".to_string());
        let err = h.orchestrator.run(&request).await.unwrap_err();
        assert!(matches!(err, RunError::DatasetNotFound(_)));
        // Nothing ran, nothing was recorded.
        assert!(h.metrics.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metrics_receive_stage_and_run_events() {
        let llm = Arc::new(ScriptedLlm::new());
        let h = harness(llm.clone(), RepairPolicy::PerStage).await;

        h.orchestrator
            .run(&RunRequest::new("Top 5 customers by total invoice amount"))
            .await
            .unwrap();

        let stage_events = h.metrics.stages.lock().unwrap();
        assert_eq!(stage_events.len(), 6);
        assert!(stage_events.iter().all(|r| r.ok));
        assert_eq!(h.metrics.runs.lock().unwrap().as_slice(), &[RunOutcome::Ok]);
    }
}
