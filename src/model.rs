//! Inbound definitions supplied by the orchestration layer and the
//! outbound run reports handed back to it.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ordered variable mapping.
pub type VarMap = IndexMap<String, Value>;

/// Which field group of an [`InterfaceDefinition`] is in use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    #[default]
    Http,
    Sql,
}

impl InterfaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceType::Http => "http",
            InterfaceType::Sql => "sql",
        }
    }
}

/// A stored HTTP or SQL operation, either the live interface or the frozen
/// copy held by a test case step.
///
/// Loosely typed on purpose: headers, params, hooks and validators arrive in
/// several historical shapes and are normalized when a
/// [`StepSpec`](crate::step::StepSpec) is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceDefinition {
    #[serde(rename = "type", default)]
    pub kind: InterfaceType,

    // ── http group ──────────────────────────────────
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Object or list of `{key, value, enabled}` pairs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Value>,
    /// Object or list of `{key, value, enabled}` pairs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    // ── sql group ───────────────────────────────────
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    /// Named bind parameters (`:name`) passed to the driver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_params: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_size: Option<usize>,
    /// Database selector for SQL steps: numeric id or configured name.
    #[serde(
        default,
        alias = "db_key",
        skip_serializing_if = "Option::is_none"
    )]
    pub db_id: Option<Value>,

    // ── shared ──────────────────────────────────────
    #[serde(default)]
    pub setup_hooks: Vec<Value>,
    #[serde(default)]
    pub teardown_hooks: Vec<Value>,
    #[serde(default)]
    pub variables: VarMap,
    #[serde(default)]
    pub validators: Vec<Value>,
    #[serde(default)]
    pub extract: IndexMap<String, String>,
    #[serde(default)]
    pub retry_times: u32,
    /// Seconds between retries.
    #[serde(default)]
    pub retry_interval: f64,
}

/// Connection settings for one database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_db_type")]
    pub db_type: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    #[serde(default = "default_charset")]
    pub charset: String,
}

fn default_db_type() -> String {
    "mysql".to_string()
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

impl DatabaseConfig {
    /// SQLite configuration pointing at a database file.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            id: None,
            name: None,
            db_type: "sqlite".to_string(),
            host: String::new(),
            port: 0,
            username: String::new(),
            password: String::new(),
            database: path.into(),
            charset: default_charset(),
        }
    }

    pub fn is_sqlite(&self) -> bool {
        self.db_type.eq_ignore_ascii_case("sqlite")
    }

    /// Engine-specific connection URI. Unknown engines fall back to mysql.
    pub fn connection_string(&self) -> String {
        self.render_uri(&self.password)
    }

    /// Connection URI with the password masked, for logs.
    pub fn masked_connection_string(&self) -> String {
        if self.password.is_empty() {
            self.connection_string()
        } else {
            self.render_uri("******")
        }
    }

    fn render_uri(&self, password: &str) -> String {
        let (user, host, port, db) =
            (&self.username, &self.host, self.port, &self.database);
        match self.db_type.to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => {
                format!("postgresql://{user}:{password}@{host}:{port}/{db}")
            }
            "sqlite" => format!("sqlite:///{db}"),
            "oracle" => {
                format!("oracle://{user}:{password}@{host}:{port}/{db}")
            }
            "sqlserver" | "mssql" => format!(
                "mssql+pymssql://{user}:{password}@{host}:{port}/{db}"
            ),
            _ => format!(
                "mysql+pymysql://{user}:{password}@{host}:{port}/{db}?charset={}",
                self.charset
            ),
        }
    }
}

/// A project-wide header applied to every HTTP step unless the step names
/// the same header itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalHeader {
    pub name: String,
    pub value: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Runtime environment a case executes against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentContext {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    /// Already flattened through parent environments.
    #[serde(default)]
    pub variables: VarMap,
    /// Default database for SQL steps and hooks without a selector.
    #[serde(default)]
    pub database_config: Option<DatabaseConfig>,
    /// Additional databases addressable by id or name.
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
    #[serde(default)]
    pub global_headers: Vec<GlobalHeader>,
}

impl Default for EnvironmentContext {
    fn default() -> Self {
        Self {
            name: None,
            base_url: String::new(),
            verify_ssl: true,
            variables: VarMap::new(),
            database_config: None,
            databases: Vec::new(),
            global_headers: Vec::new(),
        }
    }
}

impl EnvironmentContext {
    /// Flatten `parent` underneath `self`: the child's variables, headers and
    /// database win, anything it leaves unset comes from the parent.
    pub fn inherit(mut self, parent: &EnvironmentContext) -> Self {
        let mut variables = parent.variables.clone();
        for (k, v) in self.variables.drain(..) {
            variables.insert(k, v);
        }
        self.variables = variables;

        if self.base_url.is_empty() {
            self.base_url = parent.base_url.clone();
        }
        if self.database_config.is_none() {
            self.database_config = parent.database_config.clone();
        }
        for db in &parent.databases {
            let known = self
                .databases
                .iter()
                .any(|d| d.id.is_some() && d.id == db.id);
            if !known {
                self.databases.push(db.clone());
            }
        }
        for header in &parent.global_headers {
            if !self
                .global_headers
                .iter()
                .any(|h| h.name.eq_ignore_ascii_case(&header.name))
            {
                self.global_headers.push(header.clone());
            }
        }
        self
    }

    /// Find a database by numeric id or by name.
    pub fn database(&self, selector: &DbSelector) -> Option<&DatabaseConfig> {
        let all = self.database_config.iter().chain(self.databases.iter());
        match selector {
            DbSelector::Id(id) => all.into_iter().find(|d| d.id == Some(*id)),
            DbSelector::Name(name) => all
                .into_iter()
                .find(|d| d.name.as_deref() == Some(name.as_str())),
        }
    }
}

/// How a SQL step or hook names its database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DbSelector {
    Id(u64),
    Name(String),
}

impl DbSelector {
    /// Interpret a raw JSON selector. Numeric strings are ids.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(DbSelector::Id),
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(
                s.trim()
                    .parse::<u64>()
                    .map(DbSelector::Id)
                    .unwrap_or_else(|_| DbSelector::Name(s.clone())),
            ),
            _ => None,
        }
    }
}

impl std::fmt::Display for DbSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbSelector::Id(id) => write!(f, "#{id}"),
            DbSelector::Name(name) => f.write_str(name),
        }
    }
}

/// User-supplied function source scoped to a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomFunctionRecord {
    #[serde(default)]
    pub id: Option<u64>,
    pub name: String,
    pub code: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Project id the record belongs to.
    pub scope: u64,
}

/// A test case: config plus ordered frozen steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub id: Option<u64>,
    pub name: String,
    #[serde(default)]
    pub project_id: Option<u64>,
    #[serde(default)]
    pub config: CaseConfig,
    pub steps: Vec<CaseStep>,
}

impl TestCase {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

/// Case-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaseConfig {
    /// Used when the environment has no base url.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub verify: Option<bool>,
    #[serde(default)]
    pub variables: VarMap,
    /// Session variables to surface in the summary.
    #[serde(default)]
    pub export: Vec<String>,
}

/// One step of a case, carrying its frozen interface copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseStep {
    pub name: String,
    #[serde(default)]
    pub interface_id: Option<u64>,
    #[serde(flatten)]
    pub definition: InterfaceDefinition,
}

// ── outbound ────────────────────────────────────────────

/// Captured HTTP request for a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub body: Option<String>,
}

/// Captured HTTP response for a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: IndexMap<String, String>,
    pub body: Option<String>,
    pub elapsed_ms: u64,
    pub content_size: usize,
}

/// What a step's call produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepData {
    Http {
        request: RequestInfo,
        response: Option<ResponseInfo>,
    },
    Sql {
        sql: String,
        method: String,
        database: Option<String>,
        result: Option<Value>,
    },
}

/// Outcome of a single comparator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionOutcome {
    pub comparator: String,
    pub check: Value,
    pub check_value: Value,
    pub expect: Value,
    pub expect_value: Value,
    pub message: Option<String>,
    pub passed: bool,
}

/// Result of running one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub kind: InterfaceType,
    pub success: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    /// Number of attempts made, including retries.
    pub attempts: u32,
    pub data: Option<StepData>,
    pub validators: Vec<AssertionOutcome>,
    pub export_vars: VarMap,
    /// Formatted request/response details.
    pub attachment: Option<String>,
}

/// Start time and duration of a case run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseTime {
    pub start_at: String,
    pub duration_ms: u64,
}

/// Variable snapshots taken around a case run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaseVariables {
    pub config_vars: VarMap,
    pub session_vars: VarMap,
    pub export_vars: VarMap,
}

/// Result of running one case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseSummary {
    pub case_id: String,
    pub name: String,
    pub success: bool,
    /// Set when the case stopped early or never started.
    pub error: Option<String>,
    pub time: CaseTime,
    pub variables: CaseVariables,
    pub step_results: Vec<StepResult>,
    pub log_path: Option<String>,
}

/// Aggregate over a batch of case runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatistics {
    pub total: usize,
    pub success: usize,
    pub fail: usize,
    pub success_rate: String,
}

impl BatchStatistics {
    pub fn from_summaries(summaries: &[CaseSummary]) -> Self {
        let total = summaries.len();
        let success = summaries.iter().filter(|s| s.success).count();
        let rate = if total == 0 {
            0.0
        } else {
            success as f64 / total as f64 * 100.0
        };
        Self {
            total,
            success,
            fail: total - success,
            success_rate: format!("{rate:.2}%"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_case_yaml_roundtrip_keeps_steps() {
        let yaml = r#"
name: login flow
config:
  variables:
    user: alice
steps:
  - name: login
    type: http
    method: POST
    url: /login
    body: {"user": "$user"}
    extract:
      token: body.token
  - name: count users
    type: sql
    sql_method: fetchone
    sql: SELECT COUNT(*) AS n FROM users
"#;
        let case = TestCase::from_yaml(yaml).unwrap();
        assert_eq!(case.steps.len(), 2);
        assert_eq!(case.steps[0].definition.kind, InterfaceType::Http);
        assert_eq!(case.steps[1].definition.kind, InterfaceType::Sql);
        assert_eq!(case.config.variables["user"], json!("alice"));

        let again = TestCase::from_yaml(&case.to_yaml().unwrap()).unwrap();
        assert_eq!(again.steps[0].definition, case.steps[0].definition);
    }

    #[test]
    fn test_connection_string_per_engine() {
        let mut db = DatabaseConfig {
            id: Some(1),
            name: Some("main".into()),
            db_type: "mysql".into(),
            host: "db".into(),
            port: 3306,
            username: "root".into(),
            password: "secret".into(),
            database: "app".into(),
            charset: "utf8mb4".into(),
        };
        assert_eq!(
            db.connection_string(),
            "mysql+pymysql://root:secret@db:3306/app?charset=utf8mb4"
        );
        assert_eq!(
            db.masked_connection_string(),
            "mysql+pymysql://root:******@db:3306/app?charset=utf8mb4"
        );

        db.db_type = "postgresql".into();
        db.port = 5432;
        assert_eq!(
            db.connection_string(),
            "postgresql://root:secret@db:5432/app"
        );

        let lite = DatabaseConfig::sqlite("/tmp/x.db");
        assert_eq!(lite.connection_string(), "sqlite:////tmp/x.db");
        assert!(lite.is_sqlite());
    }

    #[test]
    fn test_environment_inherit_prefers_child() {
        let parent = EnvironmentContext {
            base_url: "http://parent".into(),
            variables: [("a".to_string(), json!(1)), ("b".to_string(), json!(1))]
                .into_iter()
                .collect(),
            global_headers: vec![GlobalHeader {
                name: "X-Env".into(),
                value: "parent".into(),
                is_enabled: true,
            }],
            ..Default::default()
        };
        let child = EnvironmentContext {
            variables: [("b".to_string(), json!(2))].into_iter().collect(),
            ..Default::default()
        }
        .inherit(&parent);

        assert_eq!(child.base_url, "http://parent");
        assert_eq!(child.variables["a"], json!(1));
        assert_eq!(child.variables["b"], json!(2));
        assert_eq!(child.global_headers.len(), 1);
    }

    #[test]
    fn test_db_selector_parsing() {
        assert_eq!(DbSelector::from_value(&json!(3)), Some(DbSelector::Id(3)));
        assert_eq!(
            DbSelector::from_value(&json!("7")),
            Some(DbSelector::Id(7))
        );
        assert_eq!(
            DbSelector::from_value(&json!("reporting")),
            Some(DbSelector::Name("reporting".into()))
        );
        assert_eq!(DbSelector::from_value(&json!("")), None);
        assert_eq!(DbSelector::from_value(&Value::Null), None);
    }

    #[test]
    fn test_batch_statistics() {
        let stats = BatchStatistics::from_summaries(&[]);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.success_rate, "0.00%");
    }
}
