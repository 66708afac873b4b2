//! Normalized, validated step definitions built from stored interface data.

use crate::error::{EngineError, Result};
use crate::model::{CaseStep, InterfaceDefinition, InterfaceType, VarMap};
use crate::sql::{infer_method, SqlMethod};
use crate::validator::AssertionSpec;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::warn;

/// Row count used by `fetchmany` when the definition gives none.
pub const DEFAULT_SQL_SIZE: usize = 10;

/// A step ready for execution. Built once per run and then discarded.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub name: String,
    pub kind: StepKind,
    pub variables: VarMap,
    pub setup_hooks: Vec<HookSpec>,
    pub teardown_hooks: Vec<HookSpec>,
    pub validators: Vec<AssertionSpec>,
    pub extract: IndexMap<String, String>,
    pub retry_times: u32,
    pub retry_interval: Duration,
}

#[derive(Debug, Clone)]
pub enum StepKind {
    Http(HttpRequestSpec),
    Sql(SqlRequestSpec),
}

impl StepKind {
    pub fn interface_type(&self) -> InterfaceType {
        match self {
            StepKind::Http(_) => InterfaceType::Http,
            StepKind::Sql(_) => InterfaceType::Sql,
        }
    }
}

/// Unrendered HTTP request; templates are resolved at send time.
#[derive(Debug, Clone)]
pub struct HttpRequestSpec {
    pub method: String,
    pub url: String,
    pub headers: IndexMap<String, Value>,
    pub params: IndexMap<String, Value>,
    pub body: BodySpec,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BodySpec {
    None,
    Json(Value),
    /// Sent as JSON if the rendered text decodes as JSON, otherwise verbatim.
    Raw(Value),
    Form(IndexMap<String, Value>),
    Multipart(IndexMap<String, Value>),
}

/// Unrendered SQL statement.
#[derive(Debug, Clone)]
pub struct SqlRequestSpec {
    pub method: SqlMethod,
    pub sql: String,
    pub params: Option<Map<String, Value>>,
    pub size: usize,
    /// Raw selector, rendered before lookup.
    pub db: Option<Value>,
}

/// One hook, parsed from its stored JSON form.
#[derive(Debug, Clone, PartialEq)]
pub enum HookSpec {
    /// Evaluated for side effects; the result is dropped.
    FunctionCall(String),
    Assign { name: String, expr: Value },
    SqlQuery(SqlHook),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlHook {
    pub db: Option<Value>,
    pub sql: String,
    pub var_name: Option<String>,
}

impl HookSpec {
    /// Parse one stored hook entry. A mapping with several keys yields one
    /// assignment per key, in order.
    pub fn parse(raw: &Value) -> Result<Vec<HookSpec>> {
        match raw {
            Value::String(expr) if expr.trim().is_empty() => Ok(Vec::new()),
            Value::String(expr) => Ok(vec![HookSpec::FunctionCall(expr.clone())]),
            Value::Object(map) if is_sql_hook(map) => {
                Ok(vec![HookSpec::SqlQuery(parse_sql_hook(map, None)?)])
            }
            Value::Object(map) => map
                .iter()
                .map(|(name, expr)| match expr {
                    Value::Object(inner) if is_sql_hook(inner) => {
                        Ok(HookSpec::SqlQuery(parse_sql_hook(inner, Some(name))?))
                    }
                    _ => Ok(HookSpec::Assign {
                        name: name.clone(),
                        expr: expr.clone(),
                    }),
                })
                .collect(),
            other => Err(EngineError::Definition(format!(
                "unsupported hook form: {other}"
            ))),
        }
    }

    pub fn parse_all(raw: &[Value]) -> Result<Vec<HookSpec>> {
        let mut hooks = Vec::with_capacity(raw.len());
        for item in raw {
            hooks.extend(HookSpec::parse(item)?);
        }
        Ok(hooks)
    }
}

fn is_sql_hook(map: &Map<String, Value>) -> bool {
    map.get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.eq_ignore_ascii_case("sql"))
}

fn parse_sql_hook(map: &Map<String, Value>, assign_to: Option<&String>) -> Result<SqlHook> {
    let sql = map
        .get("sql")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| EngineError::Definition("SQL hook without 'sql' text".to_string()))?;

    let var_name = assign_to.cloned().or_else(|| {
        map.get("var_name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    });

    let db = map
        .get("db_id")
        .or_else(|| map.get("db_key"))
        .filter(|v| !v.is_null())
        .cloned();

    Ok(SqlHook {
        db,
        sql: sql.to_string(),
        var_name,
    })
}

impl StepSpec {
    pub fn from_case_step(step: &CaseStep, strict_comparators: bool) -> Result<Self> {
        Self::build(&step.name, &step.definition, strict_comparators)
    }

    /// Validate a stored definition and normalize it.
    pub fn build(name: &str, def: &InterfaceDefinition, strict_comparators: bool) -> Result<Self> {
        let invalid = |msg: String| EngineError::Definition(format!("step '{name}': {msg}"));

        let kind = match def.kind {
            InterfaceType::Http => {
                if def.sql.is_some() || def.sql_method.is_some() {
                    return Err(invalid("http step carries SQL fields".to_string()));
                }
                StepKind::Http(build_http(def).map_err(|e| invalid(e.to_string()))?)
            }
            InterfaceType::Sql => {
                if def.url.is_some() || def.body.is_some() {
                    return Err(invalid("sql step carries HTTP fields".to_string()));
                }
                StepKind::Sql(build_sql(name, def).map_err(|e| invalid(e.to_string()))?)
            }
        };

        let retry_interval = Duration::try_from_secs_f64(def.retry_interval).map_err(|e| {
            invalid(format!(
                "retry_interval must be a non-negative number of seconds, got {}: {e}",
                def.retry_interval
            ))
        })?;

        let mut validators = Vec::with_capacity(def.validators.len());
        for raw in &def.validators {
            if let Some(spec) = AssertionSpec::parse(raw, strict_comparators)? {
                validators.push(spec);
            }
        }

        Ok(StepSpec {
            name: name.to_string(),
            kind,
            variables: def.variables.clone(),
            setup_hooks: HookSpec::parse_all(&def.setup_hooks)?,
            teardown_hooks: HookSpec::parse_all(&def.teardown_hooks)?,
            validators,
            extract: def.extract.clone(),
            retry_times: def.retry_times,
            retry_interval,
        })
    }
}

fn build_http(def: &InterfaceDefinition) -> std::result::Result<HttpRequestSpec, String> {
    let url = def
        .url
        .clone()
        .filter(|u| !u.trim().is_empty())
        .ok_or("missing url")?;
    let method = def
        .method
        .as_deref()
        .unwrap_or("GET")
        .trim()
        .to_ascii_uppercase();
    reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| format!("invalid http method '{method}'"))?;

    Ok(HttpRequestSpec {
        method,
        url,
        headers: normalize_pairs(def.headers.as_ref()).map_err(|e| format!("headers: {e}"))?,
        params: normalize_pairs(def.params.as_ref()).map_err(|e| format!("params: {e}"))?,
        body: parse_body(def.body.as_ref())?,
    })
}

fn build_sql(name: &str, def: &InterfaceDefinition) -> std::result::Result<SqlRequestSpec, String> {
    let sql = def
        .sql
        .clone()
        .filter(|s| !s.trim().is_empty())
        .ok_or("missing sql")?;

    // `method` doubles as the SQL method on older sql definitions.
    let method = match def.sql_method.as_deref().or(def.method.as_deref()) {
        None => infer_method(&sql),
        Some(raw) => raw.parse::<SqlMethod>().unwrap_or_else(|_| {
            warn!("Step '{}': unknown SQL method '{}', using fetchone", name, raw);
            SqlMethod::FetchOne
        }),
    };

    Ok(SqlRequestSpec {
        method,
        sql,
        params: def.sql_params.clone(),
        size: def.sql_size.unwrap_or(DEFAULT_SQL_SIZE),
        db: def.db_id.clone().filter(|v| !v.is_null()),
    })
}

/// Headers/params arrive as an object or as `[{key, value, enabled}]`.
pub fn normalize_pairs(raw: Option<&Value>) -> std::result::Result<IndexMap<String, Value>, String> {
    let mut out = IndexMap::new();
    match raw {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (k, v) in map {
                out.insert(k.clone(), v.clone());
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                let Value::Object(pair) = item else {
                    return Err(format!("expected {{key, value}} pair, got {item}"));
                };
                if pair.get("enabled").and_then(Value::as_bool) == Some(false) {
                    continue;
                }
                let Some(key) = pair.get("key").and_then(Value::as_str) else {
                    return Err(format!("pair without key: {item}"));
                };
                if key.is_empty() {
                    continue;
                }
                out.insert(
                    key.to_string(),
                    pair.get("value").cloned().unwrap_or(Value::Null),
                );
            }
        }
        Some(other) => return Err(format!("expected object or list, got {other}")),
    }
    Ok(out)
}

const BODY_TYPES: [&str; 6] = ["none", "raw", "json", "form", "x-www-form-urlencoded", "form-data"];

fn parse_body(raw: Option<&Value>) -> std::result::Result<BodySpec, String> {
    let value = match raw {
        None | Some(Value::Null) => return Ok(BodySpec::None),
        Some(v) => v,
    };

    // Only `{type, content}` objects with a known type are typed bodies;
    // anything else is a JSON payload that happens to have a "type" key.
    let typed = value.as_object().and_then(|map| {
        let kind = map.get("type")?.as_str()?;
        let only_typed_keys = map.keys().all(|k| k == "type" || k == "content");
        (only_typed_keys && BODY_TYPES.contains(&kind)).then(|| (kind, map.get("content")))
    });

    let Some((kind, content)) = typed else {
        return Ok(BodySpec::Json(value.clone()));
    };

    let content = content.cloned().unwrap_or(Value::Null);
    Ok(match kind {
        "none" => BodySpec::None,
        "raw" if content.is_null() => BodySpec::None,
        "raw" => BodySpec::Raw(content),
        "json" => BodySpec::Json(content),
        "form-data" => BodySpec::Multipart(normalize_pairs(Some(&content))?),
        _ => BodySpec::Form(normalize_pairs(Some(&content))?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn http_def(body: Option<Value>) -> InterfaceDefinition {
        InterfaceDefinition {
            method: Some("post".into()),
            url: Some("/users".into()),
            body,
            ..Default::default()
        }
    }

    #[test]
    fn test_http_step_normalizes_pairs_and_method() {
        let def = InterfaceDefinition {
            headers: Some(json!([
                {"key": "X-On", "value": "1"},
                {"key": "X-Off", "value": "2", "enabled": false}
            ])),
            params: Some(json!({"page": 1})),
            ..http_def(None)
        };
        let spec = StepSpec::build("create", &def, false).unwrap();
        let StepKind::Http(http) = spec.kind else {
            panic!("expected http step");
        };
        assert_eq!(http.method, "POST");
        assert_eq!(http.headers.len(), 1);
        assert_eq!(http.headers["X-On"], json!("1"));
        assert_eq!(http.params["page"], json!(1));
        assert_eq!(http.body, BodySpec::None);
    }

    #[test]
    fn test_body_forms() {
        let cases = [
            (json!({"type": "none"}), BodySpec::None),
            (json!({"type": "raw", "content": "hi"}), BodySpec::Raw(json!("hi"))),
            (
                json!({"type": "form", "content": {"a": "1"}}),
                BodySpec::Form([("a".to_string(), json!("1"))].into_iter().collect()),
            ),
            (
                json!({"type": "form-data", "content": [{"key": "f", "value": "v"}]}),
                BodySpec::Multipart([("f".to_string(), json!("v"))].into_iter().collect()),
            ),
            (
                json!({"type": "user", "name": "x"}),
                BodySpec::Json(json!({"type": "user", "name": "x"})),
            ),
        ];
        for (raw, expected) in cases {
            let spec = StepSpec::build("s", &http_def(Some(raw.clone())), false).unwrap();
            let StepKind::Http(http) = spec.kind else {
                panic!("expected http step");
            };
            assert_eq!(http.body, expected, "body {raw}");
        }
    }

    #[test]
    fn test_mixed_field_groups_rejected() {
        let def = InterfaceDefinition {
            sql: Some("SELECT 1".into()),
            ..http_def(None)
        };
        let err = StepSpec::build("bad", &def, false).unwrap_err();
        assert!(matches!(err, EngineError::Definition(_)));

        let def = InterfaceDefinition {
            kind: InterfaceType::Sql,
            sql: Some("SELECT 1".into()),
            url: Some("/x".into()),
            ..Default::default()
        };
        assert!(StepSpec::build("bad", &def, false).is_err());
    }

    #[test]
    fn test_sql_step_method_fallbacks() {
        let mut def = InterfaceDefinition {
            kind: InterfaceType::Sql,
            sql: Some("SELECT * FROM t".into()),
            ..Default::default()
        };
        let spec = StepSpec::build("q", &def, false).unwrap();
        let StepKind::Sql(sql) = &spec.kind else {
            panic!("expected sql step");
        };
        assert_eq!(sql.method, SqlMethod::FetchAll);
        assert_eq!(sql.size, DEFAULT_SQL_SIZE);

        def.method = Some("fetchmany".into());
        let spec = StepSpec::build("q", &def, false).unwrap();
        let StepKind::Sql(sql) = &spec.kind else {
            panic!("expected sql step");
        };
        assert_eq!(sql.method, SqlMethod::FetchMany);

        def.sql_method = Some("explode".into());
        let spec = StepSpec::build("q", &def, false).unwrap();
        let StepKind::Sql(sql) = &spec.kind else {
            panic!("expected sql step");
        };
        assert_eq!(sql.method, SqlMethod::FetchOne);
    }

    #[test]
    fn test_hook_forms() {
        let hooks = HookSpec::parse_all(&[
            json!("${setup()}"),
            json!({"a": "$x", "b": 2}),
            json!({"total": {"type": "sql", "sql": "SELECT COUNT(*) FROM t", "db_id": 1}}),
            json!({"type": "SQL", "sql": "DELETE FROM t", "db_key": "main", "var_name": "n"}),
            json!(""),
        ])
        .unwrap();

        assert_eq!(hooks.len(), 5);
        assert_eq!(hooks[0], HookSpec::FunctionCall("${setup()}".into()));
        assert_eq!(
            hooks[1],
            HookSpec::Assign {
                name: "a".into(),
                expr: json!("$x")
            }
        );
        let HookSpec::SqlQuery(total) = &hooks[3] else {
            panic!("expected sql hook");
        };
        assert_eq!(total.var_name.as_deref(), Some("total"));
        assert_eq!(total.db, Some(json!(1)));
        let HookSpec::SqlQuery(delete) = &hooks[4] else {
            panic!("expected sql hook");
        };
        assert_eq!(delete.db, Some(json!("main")));
        assert_eq!(delete.var_name.as_deref(), Some("n"));
    }

    #[test]
    fn test_sql_hook_without_sql_is_definition_error() {
        let err = HookSpec::parse(&json!({"type": "sql"})).unwrap_err();
        assert!(matches!(err, EngineError::Definition(_)));
    }

    #[test]
    fn test_negative_retry_interval_rejected() {
        let def = InterfaceDefinition {
            retry_interval: -1.0,
            ..http_def(None)
        };
        assert!(StepSpec::build("r", &def, false).is_err());
    }

    #[test]
    fn test_unrepresentable_retry_interval_rejected() {
        for interval in [1e30, f64::NAN, f64::INFINITY] {
            let def = InterfaceDefinition {
                retry_interval: interval,
                ..http_def(None)
            };
            let err = StepSpec::build("r", &def, false).unwrap_err();
            assert!(matches!(err, EngineError::Definition(_)), "interval {interval}");
        }

        let def = InterfaceDefinition {
            retry_interval: 0.25,
            ..http_def(None)
        };
        let spec = StepSpec::build("r", &def, false).unwrap();
        assert_eq!(spec.retry_interval, Duration::from_millis(250));
    }
}
