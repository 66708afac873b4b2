//! Step and case execution.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::extract::{extract, http_view};
use crate::functions::FunctionProvider;
use crate::hooks::HookExecutor;
use crate::http::{format_exchange, HttpExecutor, HttpTarget};
use crate::model::*;
use crate::runlog::RunLog;
use crate::sql::{resolve_database, DefaultSqlConnector, SqlConnector, SqlRequest};
use crate::step::{HttpRequestSpec, SqlRequestSpec, StepKind, StepSpec};
use crate::validator::validate;
use crate::variables::{Resolver, VariablePool};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, instrument, warn};

/// Runs test cases.
#[async_trait]
pub trait CaseRunner: Send + Sync {
    /// Execute one case against an environment. Failures are reported in the
    /// summary, never as an `Err`.
    async fn run(&self, case: &TestCase, env: &EnvironmentContext) -> CaseSummary;

    /// Run cases one after another, each with its own variable pool.
    async fn run_batch(
        &self,
        cases: &[TestCase],
        env: &EnvironmentContext,
    ) -> (Vec<CaseSummary>, BatchStatistics) {
        let mut summaries = Vec::with_capacity(cases.len());
        for (idx, case) in cases.iter().enumerate() {
            info!("Case {}/{}: {}", idx + 1, cases.len(), case.name);
            summaries.push(self.run(case, env).await);
        }
        let stats = BatchStatistics::from_summaries(&summaries);
        info!(
            "Batch finished: {} total, {} passed, {} failed ({})",
            stats.total, stats.success, stats.fail, stats.success_rate
        );
        (summaries, stats)
    }
}

/// Where a step is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    SetupHooks,
    Executing,
    /// Teardown hooks run with `request` and `response` bound to the call's
    /// views. Both names are reserved: for the rest of the step they shadow
    /// any variable of the same name. The session pool is not touched.
    TeardownHooks,
    Extracting,
    Asserting,
    Success,
    Failed,
}

/// Shared per-case inputs of a step.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub env: &'a EnvironmentContext,
    pub base_url: &'a str,
    pub verify_ssl: bool,
}

impl<'a> StepContext<'a> {
    pub fn new(env: &'a EnvironmentContext, case: &'a CaseConfig) -> Self {
        let base_url = if env.base_url.is_empty() {
            case.base_url.as_deref().unwrap_or_default()
        } else {
            env.base_url.as_str()
        };
        Self {
            env,
            base_url,
            verify_ssl: env.verify_ssl && case.verify.unwrap_or(true),
        }
    }
}

/// What executing the step's call produced.
struct CallOutput {
    data: StepData,
    attachment: Option<String>,
    /// Addressed by extraction paths and assertion checks.
    view: Value,
    request: Value,
}

/// Default case runner: reqwest for HTTP, a [`SqlConnector`] for SQL.
pub struct DefaultCaseRunner {
    http: HttpExecutor,
    sql: Arc<dyn SqlConnector>,
    functions: Arc<dyn FunctionProvider>,
    config: EngineConfig,
}

impl DefaultCaseRunner {
    pub fn new(config: EngineConfig, functions: Arc<dyn FunctionProvider>) -> Result<Self> {
        Ok(Self {
            http: HttpExecutor::new(config.http_timeout())?,
            sql: Arc::new(DefaultSqlConnector::new(config.sql_timeout())),
            functions,
            config,
        })
    }

    /// Replace the SQL connector.
    pub fn with_sql_connector(mut self, connector: Arc<dyn SqlConnector>) -> Self {
        self.sql = connector;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one step against `pool` (left untouched). Exported variables are
    /// in the result.
    pub async fn run_step(
        &self,
        spec: &StepSpec,
        ctx: StepContext<'_>,
        pool: &VariablePool,
    ) -> StepResult {
        self.execute_step(spec, ctx, pool).await.0
    }

    /// Drive the step state machine. The error is returned when it should
    /// abort the rest of the case.
    #[instrument(skip_all, fields(step = %spec.name))]
    async fn execute_step(
        &self,
        spec: &StepSpec,
        ctx: StepContext<'_>,
        session: &VariablePool,
    ) -> (StepResult, Option<EngineError>) {
        let started = Instant::now();
        let resolver = Resolver::lenient(&*self.functions);
        let hooks = HookExecutor::new(&*self.functions, ctx.env, &*self.sql);

        let mut state = StepState::Pending;
        let mut base = session.clone();
        let mut pool = VariablePool::new();
        let mut attempts = 0u32;
        let mut retries_left = spec.retry_times;
        let mut call: Option<CallOutput> = None;
        let mut exports = VarMap::new();
        let mut outcomes = Vec::new();
        let mut fatal: Option<EngineError> = None;

        loop {
            debug!("Step '{}' -> {:?}", spec.name, state);
            state = match state {
                StepState::Pending => {
                    match resolver.resolve_mapping(&spec.variables, &base) {
                        Ok(vars) => base.extend(&vars),
                        Err(e) => warn!("Step variables of '{}' unresolved: {}", spec.name, e),
                    }
                    StepState::SetupHooks
                }
                StepState::SetupHooks => {
                    attempts += 1;
                    pool = base.clone();
                    hooks.run(&spec.setup_hooks, &mut pool).await;
                    StepState::Executing
                }
                StepState::Executing => {
                    let output = match &spec.kind {
                        StepKind::Http(http) => self.call_http(http, ctx, &resolver, &pool).await,
                        StepKind::Sql(sql) => self.call_sql(sql, ctx, &resolver, &pool).await,
                    };
                    match output {
                        (output, Ok(())) => {
                            call = Some(output);
                            StepState::TeardownHooks
                        }
                        (output, Err(e)) => {
                            error!("Step '{}' failed: {}", spec.name, e);
                            call = Some(output);
                            fatal = Some(e);
                            StepState::Failed
                        }
                    }
                }
                StepState::TeardownHooks => {
                    if let Some(output) = &call {
                        for name in ["request", "response"] {
                            if pool.contains(name) {
                                warn!(
                                    "Variable '{}' is shadowed by the step's {} view during teardown",
                                    name, name
                                );
                            }
                        }
                        pool.insert("request", output.request.clone());
                        pool.insert("response", output.view.clone());
                    }
                    hooks.run(&spec.teardown_hooks, &mut pool).await;
                    StepState::Extracting
                }
                StepState::Extracting => {
                    let view = call.as_ref().map(|c| c.view.clone()).unwrap_or(Value::Null);
                    match extract(&spec.extract, &view, &resolver, &pool) {
                        Ok(vars) => {
                            pool.extend(&vars);
                            exports = vars;
                        }
                        Err(e) => warn!("Extraction for '{}' failed: {}", spec.name, e),
                    }
                    StepState::Asserting
                }
                StepState::Asserting => {
                    let view = call.as_ref().map(|c| c.view.clone()).unwrap_or(Value::Null);
                    let (passed, results) = validate(&spec.validators, &view, &resolver, &pool);
                    outcomes = results;
                    if passed {
                        StepState::Success
                    } else if retries_left > 0 {
                        retries_left -= 1;
                        info!(
                            "Step '{}' assertions failed, retrying in {:?} ({} left)",
                            spec.name, spec.retry_interval, retries_left
                        );
                        tokio::time::sleep(spec.retry_interval).await;
                        StepState::SetupHooks
                    } else {
                        StepState::Failed
                    }
                }
                StepState::Success | StepState::Failed => break,
            };
        }

        let success = state == StepState::Success;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "Step '{}' finished: {} after {} attempt(s) ({} ms)",
            spec.name,
            if success { "success" } else { "failed" },
            attempts,
            elapsed_ms
        );

        let error = match &fatal {
            Some(e) => Some(e.to_string()),
            None if !success => Some(assertion_error(&outcomes)),
            None => None,
        };
        let (data, attachment) = match call {
            Some(c) => (Some(c.data), c.attachment),
            None => (None, None),
        };

        let result = StepResult {
            name: spec.name.clone(),
            kind: spec.kind.interface_type(),
            success,
            error,
            elapsed_ms,
            attempts,
            data,
            validators: outcomes,
            export_vars: exports,
            attachment,
        };
        (result, fatal.filter(EngineError::is_fatal_to_case))
    }

    async fn call_http(
        &self,
        spec: &HttpRequestSpec,
        ctx: StepContext<'_>,
        resolver: &Resolver<'_>,
        pool: &VariablePool,
    ) -> (CallOutput, Result<()>) {
        let target = HttpTarget {
            base_url: ctx.base_url,
            verify_ssl: ctx.verify_ssl,
            global_headers: &ctx.env.global_headers,
        };
        let exchange = self.http.send(spec, target, resolver, pool).await;
        let (response, outcome) = match exchange.response {
            Ok(resp) => (Some(resp), Ok(())),
            Err(e) => (None, Err(e)),
        };

        let attachment = format_exchange(&exchange.request, response.as_ref());
        let view = response.as_ref().map(http_view).unwrap_or(Value::Null);
        let request = serde_json::to_value(&exchange.request).unwrap_or(Value::Null);
        let output = CallOutput {
            data: StepData::Http {
                request: exchange.request,
                response,
            },
            attachment: Some(attachment),
            view,
            request,
        };
        (output, outcome)
    }

    async fn call_sql(
        &self,
        spec: &SqlRequestSpec,
        ctx: StepContext<'_>,
        resolver: &Resolver<'_>,
        pool: &VariablePool,
    ) -> (CallOutput, Result<()>) {
        let mut database = None;
        let mut sql_text = spec.sql.clone();

        let result: Result<Value> = async {
            sql_text = resolver.render_string(&spec.sql, pool)?;
            let params = match &spec.params {
                Some(raw) => match resolver.render(&Value::Object(raw.clone()), pool)? {
                    Value::Object(map) => Some(map),
                    _ => None,
                },
                None => None,
            };
            let selector = match &spec.db {
                Some(raw) => Some(resolver.render(raw, pool)?),
                None => None,
            };
            let db = resolve_database(ctx.env, selector.as_ref())?;
            database = Some(db.masked_connection_string());
            info!("Executing SQL ({}) on {}", spec.method, db.masked_connection_string());

            self.sql
                .execute(
                    db,
                    SqlRequest {
                        sql: sql_text.clone(),
                        method: spec.method,
                        params,
                        size: spec.size,
                    },
                )
                .await
        }
        .await;

        let (value, outcome) = match result {
            Ok(v) => (Some(v), Ok(())),
            Err(e) => (None, Err(e)),
        };
        let request = json!({"sql": sql_text, "method": spec.method.as_str()});
        let attachment = format!(
            "SQL ({}) on {}:\n{}\n\nResult:\n{}",
            spec.method,
            database.as_deref().unwrap_or("-"),
            sql_text,
            value
                .as_ref()
                .and_then(|v| serde_json::to_string_pretty(v).ok())
                .unwrap_or_else(|| "-".to_string())
        );
        let output = CallOutput {
            view: value.clone().unwrap_or(Value::Null),
            data: StepData::Sql {
                sql: sql_text,
                method: spec.method.as_str().to_string(),
                database,
                result: value,
            },
            attachment: Some(attachment),
            request,
        };
        (output, outcome)
    }

    async fn run_case(&self, case: &TestCase, env: &EnvironmentContext, case_id: String) -> CaseSummary {
        let started = Instant::now();
        let start_at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        info!("Starting test case: {}", case.name);

        let mut summary = CaseSummary {
            case_id,
            name: case.name.clone(),
            success: false,
            error: None,
            time: CaseTime {
                start_at,
                duration_ms: 0,
            },
            variables: CaseVariables::default(),
            step_results: Vec::new(),
            log_path: None,
        };

        let prepared = self.prepare(case, env);
        let (specs, mut pool) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("Test case '{}' is invalid: {}", case.name, e);
                summary.error = Some(e.to_string());
                summary.time.duration_ms = started.elapsed().as_millis() as u64;
                return summary;
            }
        };
        summary.variables.config_vars = pool.snapshot();

        let ctx = StepContext::new(env, &case.config);
        for (idx, spec) in specs.iter().enumerate() {
            info!("Running step {}/{}: {}", idx + 1, specs.len(), spec.name);
            let (result, fatal) = self.execute_step(spec, ctx, &pool).await;
            pool.extend(&result.export_vars);
            summary.step_results.push(result);

            if let Some(e) = fatal {
                if !self.config.continue_on_error {
                    info!("Stopping test case due to step error");
                    summary.error = Some(format!("step '{}' aborted the case: {e}", spec.name));
                    break;
                }
            }
        }

        summary.success = summary.step_results.iter().all(|r| r.success);
        summary.variables.session_vars = pool.snapshot();
        summary.variables.export_vars = case
            .config
            .export
            .iter()
            .filter_map(|name| pool.get(name).map(|v| (name.clone(), v.clone())))
            .collect();
        summary.time.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            "Test case finished: {} ({} ms) - Success: {}",
            case.name, summary.time.duration_ms, summary.success
        );
        summary
    }

    /// Build every step and seed the pool: environment variables, then the
    /// case config variables resolved strictly.
    fn prepare(
        &self,
        case: &TestCase,
        env: &EnvironmentContext,
    ) -> Result<(Vec<StepSpec>, VariablePool)> {
        let specs = case
            .steps
            .iter()
            .map(|step| StepSpec::from_case_step(step, self.config.strict_comparators))
            .collect::<Result<Vec<_>>>()?;

        let mut pool = VariablePool::from_map(env.variables.clone());
        let config_vars =
            Resolver::strict(&*self.functions).resolve_mapping(&case.config.variables, &pool)?;
        pool.extend(&config_vars);
        Ok((specs, pool))
    }
}

#[async_trait]
impl CaseRunner for DefaultCaseRunner {
    #[instrument(skip(self, case, env), fields(name = %case.name))]
    async fn run(&self, case: &TestCase, env: &EnvironmentContext) -> CaseSummary {
        let case_id = case
            .id
            .map(|id| id.to_string())
            .unwrap_or_else(|| case.name.clone());
        let log = RunLog::open(self.config.log_dir.as_deref(), &case_id);

        let run = self.run_case(case, env, case_id);
        let mut summary = match log.dispatch() {
            Some(dispatch) => run.with_subscriber(dispatch).await,
            None => run.await,
        };
        summary.log_path = log.path().map(|p| p.display().to_string());
        summary
    }
}

fn assertion_error(outcomes: &[AssertionOutcome]) -> String {
    let failed: Vec<String> = outcomes
        .iter()
        .filter(|o| !o.passed)
        .map(|o| match &o.message {
            Some(m) => m.clone(),
            None => format!("{} {} {} (actual: {})", o.check, o.comparator, o.expect_value, o.check_value),
        })
        .collect();
    if failed.is_empty() {
        "step failed".to_string()
    } else {
        format!("assertion failed: {}", failed.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::FunctionRegistry;
    use serde_json::json;

    fn runner(config: EngineConfig) -> DefaultCaseRunner {
        DefaultCaseRunner::new(config, Arc::new(FunctionRegistry::with_builtins())).unwrap()
    }

    fn sqlite_env(dir: &tempfile::TempDir) -> EnvironmentContext {
        let path = dir.path().join("runner.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO items (name) VALUES ('x'), ('y'), ('z');",
        )
        .unwrap();
        EnvironmentContext {
            database_config: Some(DatabaseConfig::sqlite(path.to_string_lossy())),
            variables: [("env_only".to_string(), json!("env"))].into_iter().collect(),
            ..Default::default()
        }
    }

    fn sql_step(name: &str, sql: &str) -> CaseStep {
        CaseStep {
            name: name.to_string(),
            interface_id: None,
            definition: InterfaceDefinition {
                kind: InterfaceType::Sql,
                sql: Some(sql.to_string()),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_retry_bound_counts_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let env = sqlite_env(&dir);
        let mut step = sql_step("never passes", "SELECT COUNT(*) AS n FROM items");
        step.definition.retry_times = 2;
        step.definition.validators = vec![json!({"eq": ["0.n", 99]})];

        let case = TestCase {
            id: Some(1),
            name: "retry".into(),
            project_id: None,
            config: CaseConfig::default(),
            steps: vec![step],
        };
        let summary = runner(EngineConfig::default()).run(&case, &env).await;

        assert!(!summary.success);
        assert_eq!(summary.step_results[0].attempts, 3);
        assert!(summary.step_results[0].error.as_deref().unwrap().contains("assertion failed"));
    }

    #[tokio::test]
    async fn test_exports_flow_to_later_steps_even_after_assertion_failure() {
        let dir = tempfile::tempdir().unwrap();
        let env = sqlite_env(&dir);

        let mut first = sql_step("first", "SELECT name FROM items WHERE id = 1");
        first.definition.sql_method = Some("fetchone".into());
        first.definition.extract = [("first_name".to_string(), "name".to_string())].into_iter().collect();
        first.definition.validators = vec![json!({"eq": ["name", "not x"]})];

        let mut second = sql_step("second", "SELECT id FROM items WHERE name = '$first_name'");
        second.definition.sql_method = Some("fetchone".into());
        second.definition.validators = vec![json!({"eq": ["id", 1]})];

        let case = TestCase {
            id: None,
            name: "flow".into(),
            project_id: None,
            config: CaseConfig::default(),
            steps: vec![first, second],
        };
        let summary = runner(EngineConfig::default()).run(&case, &env).await;

        assert_eq!(summary.step_results.len(), 2);
        assert!(!summary.step_results[0].success);
        assert_eq!(summary.step_results[0].export_vars["first_name"], json!("x"));
        assert!(summary.step_results[1].success);
        assert!(!summary.success);
        assert_eq!(summary.variables.session_vars["env_only"], json!("env"));
    }

    #[tokio::test]
    async fn test_sql_error_aborts_case_unless_continue_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = sqlite_env(&dir);
        let case = TestCase {
            id: None,
            name: "abort".into(),
            project_id: None,
            config: CaseConfig::default(),
            steps: vec![
                sql_step("broken", "SELECT * FROM missing"),
                sql_step("after", "SELECT 1 AS one"),
            ],
        };

        let summary = runner(EngineConfig::default()).run(&case, &env).await;
        assert_eq!(summary.step_results.len(), 1);
        assert!(summary.error.is_some());
        assert!(!summary.success);

        let config = EngineConfig {
            continue_on_error: true,
            ..Default::default()
        };
        let summary = runner(config).run(&case, &env).await;
        assert_eq!(summary.step_results.len(), 2);
        assert!(summary.step_results[1].success);
        assert!(!summary.success);
    }

    #[tokio::test]
    async fn test_definition_error_yields_no_step_results() {
        let env = EnvironmentContext::default();
        let mut bad = sql_step("bad", "SELECT 1");
        bad.definition.url = Some("/mixed".into());
        let case = TestCase {
            id: None,
            name: "invalid".into(),
            project_id: None,
            config: CaseConfig::default(),
            steps: vec![bad],
        };
        let summary = runner(EngineConfig::default()).run(&case, &env).await;
        assert!(!summary.success);
        assert!(summary.step_results.is_empty());
        assert!(summary.error.unwrap().contains("Invalid step definition"));
    }

    #[tokio::test]
    async fn test_unrepresentable_retry_interval_fails_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let env = sqlite_env(&dir);
        let mut step = sql_step("slow", "SELECT 1");
        step.definition.retry_interval = 1e30;
        let case = TestCase {
            id: None,
            name: "huge interval".into(),
            project_id: None,
            config: CaseConfig::default(),
            steps: vec![sql_step("fine", "SELECT 1"), step],
        };
        let summary = runner(EngineConfig::default()).run(&case, &env).await;
        assert!(!summary.success);
        assert!(summary.step_results.is_empty());
        assert!(summary.error.unwrap().contains("retry_interval"));
    }

    #[tokio::test]
    async fn test_response_view_shadows_only_inside_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let env = sqlite_env(&dir);
        let mut step = sql_step("lookup", "SELECT name FROM items WHERE id = 1");
        step.definition.sql_method = Some("fetchone".into());
        step.definition.extract = [("seen".to_string(), "$response".to_string())]
            .into_iter()
            .collect();
        let case = TestCase {
            id: None,
            name: "reserved names".into(),
            project_id: None,
            config: CaseConfig {
                variables: [("response".to_string(), json!("mine"))].into_iter().collect(),
                ..Default::default()
            },
            steps: vec![step],
        };

        let summary = runner(EngineConfig::default()).run(&case, &env).await;
        assert!(summary.success, "{:?}", summary.step_results[0].error);
        assert_eq!(summary.step_results[0].export_vars["seen"], json!({"name": "x"}));
        assert_eq!(summary.variables.session_vars["response"], json!("mine"));
    }

    #[tokio::test]
    async fn test_undefined_config_variable_is_fatal() {
        let env = EnvironmentContext::default();
        let case = TestCase {
            id: None,
            name: "undefined".into(),
            project_id: None,
            config: CaseConfig {
                variables: [("a".to_string(), json!("$nowhere"))].into_iter().collect(),
                ..Default::default()
            },
            steps: vec![sql_step("q", "SELECT 1")],
        };
        let summary = runner(EngineConfig::default()).run(&case, &env).await;
        assert!(!summary.success);
        assert!(summary.step_results.is_empty());
        assert!(summary.error.unwrap().contains("nowhere"));
    }

    #[tokio::test]
    async fn test_run_log_is_written_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let env = sqlite_env(&dir);
        let logs = dir.path().join("logs");
        let config = EngineConfig {
            log_dir: Some(logs.clone()),
            ..Default::default()
        };
        let case = TestCase {
            id: Some(7),
            name: "logged".into(),
            project_id: None,
            config: CaseConfig::default(),
            steps: vec![sql_step("q", "SELECT 1 AS one")],
        };

        let summary = runner(config).run(&case, &env).await;
        let path = summary.log_path.expect("log path");
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("Starting test case: logged"));
    }

    #[tokio::test]
    async fn test_batch_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let env = sqlite_env(&dir);
        let ok = TestCase {
            id: None,
            name: "ok".into(),
            project_id: None,
            config: CaseConfig::default(),
            steps: vec![sql_step("q", "SELECT 1 AS one")],
        };
        let bad = TestCase {
            name: "bad".into(),
            steps: vec![sql_step("q", "SELECT * FROM nope")],
            ..ok.clone()
        };

        let (summaries, stats) = runner(EngineConfig::default())
            .run_batch(&[ok, bad], &env)
            .await;
        assert_eq!(summaries.len(), 2);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.fail, 1);
        assert_eq!(stats.success_rate, "50.00%");
    }
}
