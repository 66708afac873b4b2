//! stepflow CLI: run test cases against an environment.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use stepflow::{
    load_environment, load_function_records, load_functions, CaseLoader, CaseRunner, CaseSummary,
    DefaultCaseRunner, EngineConfig, EnvironmentContext, FunctionRegistry, StepData, TestCase,
};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Run declarative HTTP/SQL test cases.
#[derive(Parser, Debug)]
#[command(name = "stepflow", version, about)]
struct Cli {
    /// Case file or directory.
    #[arg(short = 'p', long = "path")]
    case_path: Option<PathBuf>,

    /// Environment file (YAML or JSON).
    #[arg(short = 'e', long = "env", env = "STEPFLOW_ENV")]
    env_file: Option<PathBuf>,

    /// Custom function records file.
    #[arg(long = "functions", env = "STEPFLOW_FUNCTIONS")]
    functions: Option<PathBuf>,

    /// Project whose function records are loaded.
    #[arg(long = "project", env = "STEPFLOW_PROJECT")]
    project: Option<u64>,

    /// Filter cases by name (partial match).
    #[arg(short = 'f', long = "filter")]
    case_filter: Option<String>,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// HTTP timeout in seconds.
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,

    /// Base URL override for the environment.
    #[arg(short = 'b', long = "base-url")]
    base_url: Option<String>,

    /// Directory to save case reports.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,

    /// Engine config file.
    #[arg(short = 'c', long = "config", env = "STEPFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for per-run log files.
    #[arg(long = "log-dir", env = "STEPFLOW_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Keep running steps after transport or SQL errors.
    #[arg(long = "continue-on-error")]
    continue_on_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .try_init();
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...(truncated)", &text[..idx]),
        None => text.to_string(),
    }
}

fn print_case_summary(summary: &CaseSummary, verbose: bool) {
    let status = if summary.success {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    info!(
        "{} case: {} ({} ms)",
        status, summary.name, summary.time.duration_ms
    );
    if let Some(error) = &summary.error {
        error!("   \x1b[31m{}\x1b[0m", error);
    }

    for (i, step) in summary.step_results.iter().enumerate() {
        let step_status = if step.success {
            "\x1b[32m✓\x1b[0m"
        } else {
            "\x1b[31m✗\x1b[0m"
        };
        info!(
            "  {}. {} {} ({} ms, {} attempt(s))",
            i + 1,
            step_status,
            step.name,
            step.elapsed_ms,
            step.attempts
        );
        if let Some(error) = &step.error {
            error!("     \x1b[31mError: {}\x1b[0m", error);
        }

        if verbose {
            match &step.data {
                Some(StepData::Http { request, response }) => {
                    debug!("     Request: {} {}", request.method, request.url);
                    if let Some(body) = &request.body {
                        debug!("     Request body: {}", truncate(body, 500));
                    }
                    if let Some(response) = response {
                        debug!("     Response: Status {}", response.status);
                        if let Some(body) = &response.body {
                            debug!("     Response body: {}", truncate(body, 500));
                        }
                    }
                }
                Some(StepData::Sql { sql, result, .. }) => {
                    debug!("     SQL: {}", sql);
                    if let Some(result) = result {
                        debug!("     Result: {}", truncate(&result.to_string(), 500));
                    }
                }
                None => {}
            }
        }
    }
}

fn save_case_report(summary: &CaseSummary, report_dir: &Path, format: ReportFormat) -> Result<PathBuf> {
    fs::create_dir_all(report_dir)?;

    let timestamp = Utc::now().timestamp();
    let sanitized_name = summary.name.replace([' ', '/'], "_");

    let (filename, content) = match format {
        ReportFormat::Json => (
            format!("{sanitized_name}-{timestamp}.json"),
            serde_json::to_string_pretty(summary)?,
        ),
        ReportFormat::Yaml => (
            format!("{sanitized_name}-{timestamp}.yaml"),
            serde_yaml::to_string(summary)?,
        ),
        ReportFormat::Text => {
            let mut content = String::new();
            content.push_str(&format!("Case: {}\n", summary.name));
            content.push_str(&format!(
                "Status: {}\n",
                if summary.success { "PASS" } else { "FAIL" }
            ));
            if let Some(error) = &summary.error {
                content.push_str(&format!("Error: {error}\n"));
            }
            content.push_str(&format!("Started: {}\n", summary.time.start_at));
            content.push_str(&format!("Duration: {} ms\n\n", summary.time.duration_ms));
            content.push_str("Steps:\n");
            for (i, step) in summary.step_results.iter().enumerate() {
                content.push_str(&format!(
                    "  {}. {} ({})\n",
                    i + 1,
                    step.name,
                    if step.success { "PASS" } else { "FAIL" }
                ));
                if let Some(error) = &step.error {
                    content.push_str(&format!("     Error: {error}\n"));
                }
                content.push_str(&format!(
                    "     Duration: {} ms, attempts: {}\n",
                    step.elapsed_ms, step.attempts
                ));
            }
            (format!("{sanitized_name}-{timestamp}.txt"), content)
        }
    };

    let file_path = report_dir.join(filename);
    let mut file = File::create(&file_path)?;
    file.write_all(content.as_bytes())?;
    Ok(file_path)
}

fn load_cases(case_path: Option<PathBuf>, filter: Option<&str>) -> Result<Vec<TestCase>> {
    let mut loader = CaseLoader::new();
    for path in ["testcase/cases", "test/cases"] {
        if Path::new(path).exists() {
            loader.add_path(path);
        }
    }

    let cases = match case_path {
        Some(path) if path.is_file() => vec![loader
            .load_case(&path)
            .context(format!("Failed to load case: {}", path.display()))?],
        Some(path) if path.is_dir() => loader.load_cases_from_dir(&path).context(format!(
            "Failed to load cases from directory: {}",
            path.display()
        ))?,
        Some(path) => return Err(anyhow!("Path does not exist: {}", path.display())),
        None => loader.load_all_cases()?,
    };

    let cases: Vec<TestCase> = match filter {
        Some(filter) => {
            let filter = filter.to_lowercase();
            cases
                .into_iter()
                .filter(|c| c.name.to_lowercase().contains(&filter))
                .collect()
        }
        None => cases,
    };

    if cases.is_empty() {
        return Err(anyhow!("No test cases found"));
    }
    Ok(cases)
}

fn engine_config(args: &Cli) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(timeout) = args.timeout {
        config.http_timeout_secs = timeout;
    }
    if args.continue_on_error {
        config.continue_on_error = true;
    }
    if args.log_dir.is_some() {
        config.log_dir = args.log_dir.clone();
    }
    Ok(config)
}

fn function_registry(args: &Cli) -> Result<FunctionRegistry> {
    let Some(path) = &args.functions else {
        return Ok(FunctionRegistry::with_builtins());
    };
    let project = args
        .project
        .ok_or_else(|| anyhow!("--project is required with --functions"))?;
    let records = load_function_records(path)?;
    Ok(load_functions(project, &records))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.verbose);

    let config = engine_config(&args)?;
    let functions = function_registry(&args)?;
    info!("{} custom function(s) available", functions.len());

    let mut env = match &args.env_file {
        Some(path) => load_environment(path)?,
        None => EnvironmentContext::default(),
    };
    if let Some(base_url) = &args.base_url {
        env.base_url = base_url.clone();
    }

    let cases = load_cases(args.case_path.clone(), args.case_filter.as_deref())?;
    info!("Running {} case(s)...", cases.len());

    let runner = DefaultCaseRunner::new(config, Arc::new(functions))?;
    let (summaries, stats) = runner.run_batch(&cases, &env).await;

    for summary in &summaries {
        print_case_summary(summary, args.verbose);
        if let Some(dir) = &args.report_dir {
            match save_case_report(summary, dir, args.report_format) {
                Ok(path) => info!("Report saved: {}", path.display()),
                Err(e) => error!("Failed to save report: {}", e),
            }
        }
    }

    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Success rate: {}",
        stats.total, stats.success, stats.fail, stats.success_rate
    );

    if stats.fail > 0 {
        exit(1);
    }
    Ok(())
}
