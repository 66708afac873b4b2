//! Setup/teardown hook execution.
//!
//! Hooks never fail a step: every error is logged and the hook is skipped.

use crate::error::Result;
use crate::functions::FunctionProvider;
use crate::model::{EnvironmentContext, VarMap};
use crate::sql::{infer_method, resolve_database, unwrap_scalar, SqlConnector, SqlRequest};
use crate::step::{HookSpec, SqlHook, DEFAULT_SQL_SIZE};
use crate::variables::{Resolver, VariablePool};
use serde_json::Value;
use tracing::{debug, warn};

pub struct HookExecutor<'a> {
    functions: &'a dyn FunctionProvider,
    env: &'a EnvironmentContext,
    connector: &'a dyn SqlConnector,
}

impl<'a> HookExecutor<'a> {
    pub fn new(
        functions: &'a dyn FunctionProvider,
        env: &'a EnvironmentContext,
        connector: &'a dyn SqlConnector,
    ) -> Self {
        Self {
            functions,
            env,
            connector,
        }
    }

    /// Run `hooks` in declaration order and return the variables they set.
    /// Each assignment lands in `pool` before the next hook runs.
    pub async fn run(&self, hooks: &[HookSpec], pool: &mut VariablePool) -> VarMap {
        let resolver = Resolver::lenient(self.functions);
        let mut produced = VarMap::new();

        for hook in hooks {
            match hook {
                HookSpec::FunctionCall(expr) => match resolver.render_str(expr, pool) {
                    Ok(result) => debug!("Hook '{}' returned {}", expr, result),
                    Err(e) => warn!("Hook '{}' failed: {}", expr, e),
                },
                HookSpec::Assign { name, expr } => match resolver.render(expr, pool) {
                    Ok(value) => {
                        debug!("Hook set '{}' = {}", name, value);
                        pool.insert(name.clone(), value.clone());
                        produced.insert(name.clone(), value);
                    }
                    Err(e) => warn!("Hook assignment to '{}' failed: {}", name, e),
                },
                HookSpec::SqlQuery(sql_hook) => {
                    let outcome = self.run_sql(sql_hook, &resolver, pool).await;
                    match outcome {
                        Ok(result) => {
                            let value = unwrap_scalar(result);
                            match &sql_hook.var_name {
                                Some(name) => {
                                    debug!("SQL hook set '{}' = {}", name, value);
                                    pool.insert(name.clone(), value.clone());
                                    produced.insert(name.clone(), value);
                                }
                                None => debug!("SQL hook returned {}", value),
                            }
                        }
                        Err(e) => warn!("SQL hook '{}' failed: {}", sql_hook.sql, e),
                    }
                }
            }
        }

        produced
    }

    async fn run_sql(
        &self,
        hook: &SqlHook,
        resolver: &Resolver<'_>,
        pool: &VariablePool,
    ) -> Result<Value> {
        let sql = resolver.render_string(&hook.sql, pool)?;
        let selector = match &hook.db {
            Some(raw) => Some(resolver.render(raw, pool)?),
            None => None,
        };
        let db = resolve_database(self.env, selector.as_ref())?;
        let method = infer_method(&sql);
        debug!(
            "Running SQL hook ({}) on {}: {}",
            method,
            db.masked_connection_string(),
            sql
        );

        self.connector
            .execute(
                db,
                SqlRequest {
                    sql,
                    method,
                    params: None,
                    size: DEFAULT_SQL_SIZE,
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{Callable, FunctionRegistry};
    use crate::model::DatabaseConfig;
    use crate::sql::DefaultSqlConnector;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Records every call so hook order can be observed.
    #[derive(Debug, Default)]
    struct Trace(Mutex<Vec<String>>);

    impl Callable for Arc<Trace> {
        fn call(&self, args: &[Value]) -> Result<Value> {
            let label = args.first().map(crate::variables::stringify).unwrap_or_default();
            self.0.lock().unwrap().push(label.clone());
            Ok(Value::String(label))
        }
    }

    fn sqlite_env() -> (tempfile::TempDir, EnvironmentContext) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hooks.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO users (name) VALUES ('a'), ('b'), ('c');",
        )
        .unwrap();
        let env = EnvironmentContext {
            database_config: Some(DatabaseConfig {
                id: Some(1),
                name: Some("main".into()),
                ..DatabaseConfig::sqlite(path.to_string_lossy())
            }),
            ..Default::default()
        };
        (dir, env)
    }

    #[tokio::test]
    async fn test_hooks_run_in_order_and_see_earlier_assignments() {
        let trace = Arc::new(Trace::default());
        let mut functions = FunctionRegistry::default();
        functions.insert("mark", Arc::new(trace.clone()));
        let env = EnvironmentContext::default();
        let connector = DefaultSqlConnector::default();
        let executor = HookExecutor::new(&functions, &env, &connector);

        let hooks = HookSpec::parse_all(&[
            json!("${mark(A)}"),
            json!({"x": "${mark(B)}"}),
            json!({"y": "$x-suffix"}),
        ])
        .unwrap();

        let mut pool = VariablePool::new();
        let produced = executor.run(&hooks, &mut pool).await;

        assert_eq!(*trace.0.lock().unwrap(), ["A", "B"]);
        assert_eq!(pool.get("x"), Some(&json!("B")));
        assert_eq!(pool.get("y"), Some(&json!("B-suffix")));
        assert_eq!(produced.len(), 2);
    }

    #[tokio::test]
    async fn test_sql_hook_count_unwraps_to_scalar() {
        let (_dir, env) = sqlite_env();
        let functions = FunctionRegistry::default();
        let connector = DefaultSqlConnector::default();
        let executor = HookExecutor::new(&functions, &env, &connector);

        let hooks = HookSpec::parse_all(&[
            json!({"total": {"type": "sql", "sql": "SELECT COUNT(*) as total FROM users"}}),
            json!({"type": "sql", "sql": "SELECT name FROM users ORDER BY id", "db_key": "main", "var_name": "names"}),
            json!({"type": "sql", "sql": "SELECT name FROM users WHERE id = $uid LIMIT 1", "db_id": 1, "var_name": "first"}),
        ])
        .unwrap();

        let mut pool = VariablePool::new();
        pool.insert("uid", json!(2));
        executor.run(&hooks, &mut pool).await;

        assert_eq!(pool.get("total"), Some(&json!(3)));
        assert_eq!(pool.get("names"), Some(&json!(["a", "b", "c"])));
        assert_eq!(pool.get("first"), Some(&json!("b")));
    }

    #[tokio::test]
    async fn test_failing_hooks_are_skipped() {
        let (_dir, env) = sqlite_env();
        let functions = FunctionRegistry::default();
        let connector = DefaultSqlConnector::default();
        let executor = HookExecutor::new(&functions, &env, &connector);

        let hooks = HookSpec::parse_all(&[
            json!({"type": "sql", "sql": "SELECT * FROM nowhere", "var_name": "bad"}),
            json!({"type": "sql", "sql": "SELECT 1", "db_id": "unknown", "var_name": "bad2"}),
            json!("${not_loaded()}"),
            json!({"after": "still runs"}),
        ])
        .unwrap();

        let mut pool = VariablePool::new();
        executor.run(&hooks, &mut pool).await;

        assert!(!pool.contains("bad"));
        assert!(!pool.contains("bad2"));
        assert_eq!(pool.get("after"), Some(&json!("still runs")));
    }
}
