//! Engine configuration and case/environment/function file loading.

use crate::model::{CustomFunctionRecord, EnvironmentContext, TestCase};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Knobs of the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-request HTTP timeout.
    #[serde(default = "default_timeout_secs")]
    pub http_timeout_secs: u64,
    /// Deadline for one SQL call.
    #[serde(default = "default_timeout_secs")]
    pub sql_timeout_secs: u64,
    /// Keep running later steps after a transport or SQL error.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Reject unknown comparators instead of skipping them.
    #[serde(default)]
    pub strict_comparators: bool,
    /// Directory for per-run log files; none disables them.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: default_timeout_secs(),
            sql_timeout_secs: default_timeout_secs(),
            continue_on_error: false,
            strict_comparators: false,
            log_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn sql_timeout(&self) -> Duration {
        Duration::from_secs(self.sql_timeout_secs)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_document(path.as_ref())
    }
}

/// Load an environment file (YAML or JSON).
pub fn load_environment<P: AsRef<Path>>(path: P) -> Result<EnvironmentContext> {
    load_document(path.as_ref())
}

/// Load custom function records from a YAML/JSON list.
pub fn load_function_records<P: AsRef<Path>>(path: P) -> Result<Vec<CustomFunctionRecord>> {
    load_document(path.as_ref())
}

fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .context(format!("Failed to read file: {}", path.display()))?;
    if is_json(path) {
        serde_json::from_str(&content)
            .context(format!("Failed to parse JSON from {}", path.display()))
    } else {
        serde_yaml::from_str(&content)
            .context(format!("Failed to parse YAML from {}", path.display()))
    }
}

/// Finds and loads test case files.
#[derive(Debug)]
pub struct CaseLoader {
    pub case_paths: Vec<PathBuf>,
}

impl CaseLoader {
    pub fn new() -> Self {
        Self {
            case_paths: vec![PathBuf::from("tests/cases")],
        }
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.case_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load a single `.yaml`, `.yml` or `.json` case file.
    pub fn load_case<P: AsRef<Path>>(&self, path: P) -> Result<TestCase> {
        let path = path.as_ref();
        info!("Loading test case from {}", path.display());
        let case: TestCase = load_document(path)?;
        debug!("Successfully loaded test case: {}", case.name);
        Ok(case)
    }

    /// Load every case file directly inside `dir`, sorted by file name.
    /// Files that fail to parse are logged and skipped.
    pub fn load_cases_from_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<TestCase>> {
        let dir = dir.as_ref();
        info!("Loading test cases from directory: {}", dir.display());

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)
            .context(format!("Failed to read directory: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && is_case_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut cases = Vec::new();
        for path in paths {
            match self.load_case(&path) {
                Ok(case) => cases.push(case),
                Err(err) => debug!("Failed to load case from {}: {:#}", path.display(), err),
            }
        }

        info!("Loaded {} test cases from {}", cases.len(), dir.display());
        Ok(cases)
    }

    /// Load from every configured path that exists.
    pub fn load_all_cases(&self) -> Result<Vec<TestCase>> {
        let mut all_cases = Vec::new();
        for path in &self.case_paths {
            if path.is_dir() {
                match self.load_cases_from_dir(path) {
                    Ok(mut cases) => all_cases.append(&mut cases),
                    Err(err) => debug!("Failed to load cases from {}: {}", path.display(), err),
                }
            }
        }
        info!("Loaded {} test cases in total", all_cases.len());
        Ok(all_cases)
    }
}

impl Default for CaseLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

/// `.yaml`, `.yml` or `.json`.
fn is_case_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json")
}
