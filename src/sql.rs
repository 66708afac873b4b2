//! SQL execution behind the [`SqlConnector`] trait.

use crate::error::{EngineError, Result};
use crate::model::{DatabaseConfig, DbSelector, EnvironmentContext};
use async_trait::async_trait;
use regex::Regex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, InterruptHandle, Statement};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlMethod {
    FetchOne,
    FetchMany,
    FetchAll,
    Insert,
    Update,
    Delete,
    /// Any other statement; reports the affected row count.
    Execute,
}

impl SqlMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlMethod::FetchOne => "fetchone",
            SqlMethod::FetchMany => "fetchmany",
            SqlMethod::FetchAll => "fetchall",
            SqlMethod::Insert => "insert",
            SqlMethod::Update => "update",
            SqlMethod::Delete => "delete",
            SqlMethod::Execute => "execute",
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(
            self,
            SqlMethod::FetchOne | SqlMethod::FetchMany | SqlMethod::FetchAll
        )
    }
}

impl fmt::Display for SqlMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SqlMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fetchone" => Ok(SqlMethod::FetchOne),
            "fetchmany" => Ok(SqlMethod::FetchMany),
            "fetchall" => Ok(SqlMethod::FetchAll),
            "insert" => Ok(SqlMethod::Insert),
            "update" => Ok(SqlMethod::Update),
            "delete" => Ok(SqlMethod::Delete),
            "execute" => Ok(SqlMethod::Execute),
            other => Err(EngineError::Definition(format!(
                "unknown SQL method '{other}'"
            ))),
        }
    }
}

static LIMIT_ONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bLIMIT\s+1\b").expect("failed to compile limit regex")
});

static QUALIFIED_TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(FROM|JOIN|INTO|UPDATE|TABLE)(\s+)[A-Za-z_]\w*\.([A-Za-z_]\w*)")
        .expect("failed to compile qualified table regex")
});

/// Choose a fetch strategy from the statement text: `SELECT ... LIMIT 1`
/// fetches one row, other `SELECT`s fetch all, anything else executes.
pub fn infer_method(sql: &str) -> SqlMethod {
    let trimmed = sql.trim_start();
    let is_select = trimmed
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("select"));
    if !is_select {
        SqlMethod::Execute
    } else if LIMIT_ONE_RE.is_match(trimmed) {
        SqlMethod::FetchOne
    } else {
        SqlMethod::FetchAll
    }
}

/// Drop `schema.` from table positions (`FROM s.t` → `FROM t`). SQLite has
/// no schemas; column qualifiers and literals are left alone.
pub fn strip_schema_qualifiers(sql: &str) -> Cow<'_, str> {
    QUALIFIED_TABLE_RE.replace_all(sql, "$1$2$3")
}

/// Collapse single-value results: a one-column row becomes its value, a
/// list of one-column rows becomes a list of values, `{rowcount}` becomes
/// the count.
pub fn unwrap_scalar(value: Value) -> Value {
    match value {
        Value::Object(map) if map.len() == 1 => {
            map.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null)
        }
        Value::Array(rows)
            if !rows.is_empty()
                && rows
                    .iter()
                    .all(|r| r.as_object().is_some_and(|m| m.len() == 1)) =>
        {
            let mut values: Vec<Value> = rows.into_iter().map(unwrap_scalar).collect();
            if values.len() == 1 {
                values.remove(0)
            } else {
                Value::Array(values)
            }
        }
        other => other,
    }
}

/// Pick the database named by `selector`, else the environment default.
pub fn resolve_database<'e>(
    env: &'e EnvironmentContext,
    selector: Option<&Value>,
) -> Result<&'e DatabaseConfig> {
    match selector.and_then(DbSelector::from_value) {
        Some(sel) => env.database(&sel).ok_or_else(|| {
            EngineError::SqlExecution(format!("database {sel} is not configured"))
        }),
        None => env.database_config.as_ref().ok_or_else(|| {
            EngineError::SqlExecution("no database configured for this environment".to_string())
        }),
    }
}

/// A rendered statement ready to run.
#[derive(Debug, Clone)]
pub struct SqlRequest {
    pub sql: String,
    pub method: SqlMethod,
    /// Named bind parameters; keys may omit the `:` prefix.
    pub params: Option<Map<String, Value>>,
    pub size: usize,
}

/// Runs statements against configured databases.
///
/// Query methods yield a row object (or `null`) for `fetchone` and a list of
/// row objects otherwise; mutating methods yield `{"rowcount": n}`.
#[async_trait]
pub trait SqlConnector: Send + Sync {
    async fn execute(&self, db: &DatabaseConfig, request: SqlRequest) -> Result<Value>;
}

/// SQLite via rusqlite; other engines report a missing driver.
#[derive(Debug, Clone)]
pub struct DefaultSqlConnector {
    timeout: Duration,
}

impl DefaultSqlConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for DefaultSqlConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl SqlConnector for DefaultSqlConnector {
    #[instrument(skip(self, db, request), fields(db = %db.masked_connection_string(), method = %request.method))]
    async fn execute(&self, db: &DatabaseConfig, mut request: SqlRequest) -> Result<Value> {
        if !db.is_sqlite() {
            return Err(EngineError::SqlExecution(format!(
                "no driver for database type '{}'",
                db.db_type
            )));
        }

        request.sql = strip_schema_qualifiers(&request.sql).into_owned();
        debug!("Executing SQL: {}", request.sql);

        let path = db.database.clone();
        let deadline = self.timeout;
        let cancelled = Arc::new(AtomicBool::new(false));
        let (handle_tx, handle_rx) = oneshot::channel::<InterruptHandle>();

        let task_cancelled = cancelled.clone();
        let task = tokio::task::spawn_blocking(move || -> Result<Value> {
            let conn = Connection::open(&path)?;
            conn.busy_timeout(deadline)?;
            let _ = handle_tx.send(conn.get_interrupt_handle());
            if task_cancelled.load(Ordering::SeqCst) {
                return Err(EngineError::SqlExecution("SQL cancelled before it started".into()));
            }
            run_sqlite(&conn, &request)
        });

        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(EngineError::SqlExecution(format!(
                "SQL task failed: {join}"
            ))),
            Err(_) => {
                // Interrupt the running statement so the blocking task
                // returns and drops its connection.
                cancelled.store(true, Ordering::SeqCst);
                tokio::spawn(async move {
                    if let Ok(handle) = handle_rx.await {
                        handle.interrupt();
                    }
                });
                warn!("SQL timed out after {:?}, interrupting", deadline);
                Err(EngineError::SqlExecution(format!(
                    "SQL timed out after {deadline:?}"
                )))
            }
        }
    }
}

fn run_sqlite(conn: &Connection, request: &SqlRequest) -> Result<Value> {

    if !request.method.is_query() {
        let tx = conn.unchecked_transaction()?;
        let rowcount = {
            let mut stmt = prepare_bound(&tx, &request.sql, request.params.as_ref())?;
            stmt.raw_execute()?
        };
        tx.commit()?;
        let mut out = Map::new();
        out.insert("rowcount".to_string(), Value::from(rowcount));
        return Ok(Value::Object(out));
    }

    let mut stmt = prepare_bound(conn, &request.sql, request.params.as_ref())?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let limit = match request.method {
        SqlMethod::FetchOne => 1,
        SqlMethod::FetchMany => request.size,
        _ => usize::MAX,
    };

    let mut rows = stmt.raw_query();
    let mut out = Vec::new();
    while out.len() < limit {
        let Some(row) = rows.next()? else {
            break;
        };
        let mut obj = Map::with_capacity(columns.len());
        for (idx, name) in columns.iter().enumerate() {
            obj.insert(name.clone(), column_to_json(row.get_ref(idx)?));
        }
        out.push(Value::Object(obj));
    }

    Ok(match request.method {
        SqlMethod::FetchOne => out.into_iter().next().unwrap_or(Value::Null),
        _ => Value::Array(out),
    })
}

fn prepare_bound<'c>(
    conn: &'c Connection,
    sql: &str,
    params: Option<&Map<String, Value>>,
) -> Result<Statement<'c>> {
    let mut stmt = conn.prepare(sql)?;
    for (key, value) in params.into_iter().flatten() {
        let name = if key.starts_with([':', '@', '$']) {
            key.clone()
        } else {
            format!(":{key}")
        };
        if let Some(idx) = stmt.parameter_index(&name)? {
            stmt.raw_bind_parameter(idx, json_to_sql(value))?;
        }
    }
    Ok(stmt)
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn column_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn seeded_db() -> (TempDir, DatabaseConfig) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, score REAL);
             INSERT INTO users (name, score) VALUES ('alice', 1.5), ('bob', 2.0), ('carol', 3.25);",
        )
        .unwrap();
        (dir, DatabaseConfig::sqlite(path.to_string_lossy()))
    }

    fn request(sql: &str, method: SqlMethod) -> SqlRequest {
        SqlRequest {
            sql: sql.to_string(),
            method,
            params: None,
            size: 10,
        }
    }

    #[test]
    fn test_infer_method() {
        assert_eq!(infer_method("SELECT * FROM t LIMIT 1"), SqlMethod::FetchOne);
        assert_eq!(infer_method("  select id from t limit 1 offset 2"), SqlMethod::FetchOne);
        assert_eq!(infer_method("SELECT * FROM t LIMIT 10"), SqlMethod::FetchAll);
        assert_eq!(infer_method("SELECT * FROM t"), SqlMethod::FetchAll);
        assert_eq!(infer_method("DELETE FROM t"), SqlMethod::Execute);
        assert_eq!(infer_method("sel"), SqlMethod::Execute);
    }

    #[test]
    fn test_strip_schema_qualifiers() {
        assert_eq!(
            strip_schema_qualifiers("SELECT u.name, 1.5 FROM app.users u JOIN app.roles r ON u.id = r.uid"),
            "SELECT u.name, 1.5 FROM users u JOIN roles r ON u.id = r.uid"
        );
        assert_eq!(
            strip_schema_qualifiers("insert into main.t values (1)"),
            "insert into t values (1)"
        );
        assert_eq!(strip_schema_qualifiers("UPDATE s.t SET a = 1"), "UPDATE t SET a = 1");
    }

    #[test]
    fn test_unwrap_scalar() {
        assert_eq!(unwrap_scalar(json!({"total": 3})), json!(3));
        assert_eq!(unwrap_scalar(json!([{"total": 3}])), json!(3));
        assert_eq!(unwrap_scalar(json!([{"id": 1}, {"id": 2}])), json!([1, 2]));
        assert_eq!(unwrap_scalar(json!({"rowcount": 2})), json!(2));
        assert_eq!(
            unwrap_scalar(json!([{"id": 1, "n": "a"}])),
            json!([{"id": 1, "n": "a"}])
        );
        assert_eq!(unwrap_scalar(json!([])), json!([]));
    }

    #[tokio::test]
    async fn test_fetch_shapes() {
        let (_dir, db) = seeded_db();
        let connector = DefaultSqlConnector::default();

        let one = connector
            .execute(&db, request("SELECT name FROM users ORDER BY id", SqlMethod::FetchOne))
            .await
            .unwrap();
        assert_eq!(one, json!({"name": "alice"}));

        let many = SqlRequest {
            size: 2,
            ..request("SELECT id, score FROM users ORDER BY id", SqlMethod::FetchMany)
        };
        let many = connector.execute(&db, many).await.unwrap();
        assert_eq!(many, json!([{"id": 1, "score": 1.5}, {"id": 2, "score": 2.0}]));

        let all = connector
            .execute(&db, request("SELECT id FROM users", SqlMethod::FetchAll))
            .await
            .unwrap();
        assert_eq!(all.as_array().unwrap().len(), 3);

        let none = connector
            .execute(&db, request("SELECT id FROM users WHERE id = 99", SqlMethod::FetchOne))
            .await
            .unwrap();
        assert_eq!(none, Value::Null);
    }

    #[tokio::test]
    async fn test_mutation_commits_and_reports_rowcount() {
        let (_dir, db) = seeded_db();
        let connector = DefaultSqlConnector::default();

        let updated = connector
            .execute(&db, request("UPDATE main.users SET score = 0 WHERE score > 1.9", SqlMethod::Update))
            .await
            .unwrap();
        assert_eq!(updated, json!({"rowcount": 2}));

        let zeroes = connector
            .execute(&db, request("SELECT COUNT(*) AS n FROM users WHERE score = 0", SqlMethod::FetchOne))
            .await
            .unwrap();
        assert_eq!(zeroes, json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_named_parameters() {
        let (_dir, db) = seeded_db();
        let connector = DefaultSqlConnector::default();
        let mut params = Map::new();
        params.insert("name".to_string(), json!("bob"));
        let req = SqlRequest {
            params: Some(params),
            ..request("SELECT id FROM users WHERE name = :name", SqlMethod::FetchOne)
        };
        assert_eq!(connector.execute(&db, req).await.unwrap(), json!({"id": 2}));
    }

    #[tokio::test]
    async fn test_timeout_interrupts_and_releases_the_database() {
        let (_dir, db) = seeded_db();
        let endless = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                       SELECT count(*) AS n FROM c, users";

        let err = DefaultSqlConnector::new(Duration::from_millis(200))
            .execute(&db, request(endless, SqlMethod::FetchAll))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));

        // The writer only gets its lock once the timed-out reader is gone.
        let inserted = DefaultSqlConnector::new(Duration::from_secs(10))
            .execute(
                &db,
                request("INSERT INTO users (name, score) VALUES ('dave', 4.0)", SqlMethod::Insert),
            )
            .await
            .unwrap();
        assert_eq!(inserted, json!({"rowcount": 1}));
    }

    #[tokio::test]
    async fn test_other_engines_have_no_driver() {
        let db = DatabaseConfig {
            db_type: "postgresql".into(),
            ..DatabaseConfig::sqlite("app")
        };
        let err = DefaultSqlConnector::default()
            .execute(&db, request("SELECT 1", SqlMethod::FetchOne))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SqlExecution(msg) if msg.contains("no driver")));
    }

    #[tokio::test]
    async fn test_sql_error_is_sql_execution() {
        let (_dir, db) = seeded_db();
        let err = DefaultSqlConnector::default()
            .execute(&db, request("SELECT * FROM missing_table", SqlMethod::FetchAll))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SqlExecution(_)));
    }

    #[test]
    fn test_resolve_database() {
        let mut env = EnvironmentContext::default();
        assert!(resolve_database(&env, None).is_err());

        env.database_config = Some(DatabaseConfig {
            id: Some(1),
            ..DatabaseConfig::sqlite("default.db")
        });
        env.databases.push(DatabaseConfig {
            id: Some(2),
            name: Some("reporting".into()),
            ..DatabaseConfig::sqlite("reporting.db")
        });

        assert_eq!(resolve_database(&env, None).unwrap().database, "default.db");
        assert_eq!(
            resolve_database(&env, Some(&json!("reporting"))).unwrap().database,
            "reporting.db"
        );
        assert_eq!(resolve_database(&env, Some(&json!(2))).unwrap().database, "reporting.db");
        assert!(resolve_database(&env, Some(&json!(9))).is_err());
    }
}
