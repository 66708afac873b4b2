//! Project-scoped user functions.
//!
//! Function source is written in CEL rather than a host language, so loading
//! and calling user code never leaves the expression sandbox:
//!
//! ```text
//! // one record may define several functions
//! fn full_name(first, last) = first + " " + last
//! fn is_adult(age) = age >= 18
//! ```
//!
//! Each definition starts on a line beginning with `fn`; its body may span
//! the following lines until the next definition. Lines starting with `//`
//! or `#` are comments.

use crate::error::{EngineError, Result};
use crate::model::CustomFunctionRecord;
use cel::{Context, Program};
use regex::Regex;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::{debug, error, info, warn};

/// Something a `${name(args)}` template can invoke.
pub trait Callable: Send + Sync + fmt::Debug {
    fn call(&self, args: &[Value]) -> Result<Value>;
}

/// Lookup boundary between templates and loaded functions.
pub trait FunctionProvider: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Callable>>;
}

/// A function compiled from CEL source.
#[derive(Debug, Clone)]
pub struct CelFunction {
    name: String,
    params: Vec<String>,
    program: Arc<Program>,
}

impl CelFunction {
    /// Validate the body and build the function.
    pub fn compile(
        name: &str,
        params: Vec<String>,
        body: &str,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for param in &params {
            if !seen.insert(param.as_str()) {
                return Err(EngineError::FunctionLoad {
                    record: name.to_string(),
                    reason: format!("duplicate parameter '{param}'"),
                });
            }
        }
        let program = compile(body).map_err(|reason| EngineError::FunctionLoad {
            record: name.to_string(),
            reason,
        })?;
        Ok(Self {
            name: name.to_string(),
            params,
            program: Arc::new(program),
        })
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }
}

impl Callable for CelFunction {
    fn call(&self, args: &[Value]) -> Result<Value> {
        let fail = |reason: String| EngineError::FunctionCall {
            name: self.name.clone(),
            reason,
        };

        if args.len() != self.params.len() {
            return Err(fail(format!(
                "expected {} argument(s), got {}",
                self.params.len(),
                args.len()
            )));
        }

        let mut context = Context::default();
        for (param, arg) in self.params.iter().zip(args) {
            context
                .add_variable(param.as_str(), CelInput(arg))
                .map_err(|e| {
                    fail(format!("failed to bind '{param}': {e}"))
                })?;
        }
        register_custom_functions(&mut context);

        let result = self
            .program
            .execute(&context)
            .map_err(|e| fail(format!("CEL execution error: {e}")))?;
        result
            .json()
            .map_err(|e| fail(format!("unconvertible result: {e}")))
    }
}

/// A built-in implemented in Rust.
pub struct NativeFunction {
    name: &'static str,
    f: fn(&[Value]) -> std::result::Result<Value, String>,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .finish()
    }
}

impl Callable for NativeFunction {
    fn call(&self, args: &[Value]) -> Result<Value> {
        (self.f)(args).map_err(|reason| EngineError::FunctionCall {
            name: self.name.to_string(),
            reason,
        })
    }
}

fn builtin_get_timestamp(
    _args: &[Value],
) -> std::result::Result<Value, String> {
    Ok(Value::from(chrono::Utc::now().timestamp_millis()))
}

fn builtin_get_current_date(
    args: &[Value],
) -> std::result::Result<Value, String> {
    let fmt = match args.first() {
        None => "%Y-%m-%d",
        Some(Value::String(s)) => s.as_str(),
        Some(other) => {
            return Err(format!("format must be a string, got {other}"))
        }
    };
    Ok(Value::String(chrono::Local::now().format(fmt).to_string()))
}

fn builtin_urlencode(args: &[Value]) -> std::result::Result<Value, String> {
    let text = match args {
        [Value::String(s)] => s.clone(),
        [other] => other.to_string(),
        _ => return Err("expected exactly one argument".to_string()),
    };
    Ok(Value::String(
        url::form_urlencoded::byte_serialize(text.as_bytes()).collect(),
    ))
}

/// Name → callable namespace. Read-only once loading is done.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn Callable>>,
}

impl FunctionRegistry {
    /// Registry holding only the native built-ins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        for (name, f) in [
            (
                "get_timestamp",
                builtin_get_timestamp
                    as fn(&[Value]) -> std::result::Result<Value, String>,
            ),
            ("get_current_date", builtin_get_current_date),
            ("urlencode", builtin_urlencode),
        ] {
            registry
                .functions
                .insert(name.to_string(), Arc::new(NativeFunction { name, f }));
        }
        registry
    }

    /// Register a callable, replacing any earlier one of the same name.
    /// Returns `true` when an existing function was replaced.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        callable: Arc<dyn Callable>,
    ) -> bool {
        self.functions.insert(name.into(), callable).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> =
            self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl FunctionProvider for FunctionRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Callable>> {
        self.functions.get(name).cloned()
    }
}

/// Load every active record of `scope` into a registry seeded with the
/// built-ins.
///
/// A record that fails to compile, or defines nothing, is logged and
/// skipped; the remaining records still load. Later records win name
/// collisions.
pub fn load_functions(
    scope: u64,
    records: &[CustomFunctionRecord],
) -> FunctionRegistry {
    let mut registry = FunctionRegistry::with_builtins();
    let mut loaded = 0usize;
    let mut failed = 0usize;

    info!("Loading custom functions for project {}", scope);

    for record in records
        .iter()
        .filter(|r| r.scope == scope && r.is_active)
    {
        let functions = match parse_record(record) {
            Ok(functions) => functions,
            Err(e) => {
                error!("{}", e);
                failed += 1;
                continue;
            }
        };

        if functions.is_empty() {
            warn!("Function record '{}' defines no functions", record.name);
            failed += 1;
            continue;
        }

        let names: Vec<String> =
            functions.iter().map(|f| f.name.clone()).collect();
        for function in functions {
            let name = function.name.clone();
            if registry.insert(name.clone(), Arc::new(function)) {
                warn!(
                    "Function name collision: '{}', using the definition from '{}'",
                    name, record.name
                );
            }
        }
        loaded += 1;
        debug!("Loaded function record '{}': {:?}", record.name, names);
    }

    info!(
        "Custom functions for project {} loaded: {} succeeded, {} failed",
        scope, loaded, failed
    );
    registry
}

static DEFINITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^fn\s+([A-Za-z_]\w*)\s*\(([^)]*)\)\s*=(.*)$")
        .expect("failed to compile definition regex")
});

static IDENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_]\w*$").expect("failed to compile ident regex")
});

/// Split one record's source into compiled functions.
fn parse_record(record: &CustomFunctionRecord) -> Result<Vec<CelFunction>> {
    let load_error = |reason: String| EngineError::FunctionLoad {
        record: record.name.clone(),
        reason,
    };

    // (name, params, body lines)
    let mut pending: Vec<(String, Vec<String>, Vec<String>)> = Vec::new();

    for (lineno, line) in record.code.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty()
            || trimmed.starts_with("//")
            || trimmed.starts_with('#')
        {
            continue;
        }

        if let Some(caps) = DEFINITION_RE.captures(line) {
            let params = parse_params(&caps[2]).map_err(|e| {
                load_error(format!("line {}: {e}", lineno + 1))
            })?;
            pending.push((
                caps[1].to_string(),
                params,
                vec![caps[3].trim().to_string()],
            ));
        } else if let Some((_, _, body)) = pending.last_mut() {
            body.push(trimmed.to_string());
        } else {
            return Err(load_error(format!(
                "line {}: expected a function definition, found '{trimmed}'",
                lineno + 1
            )));
        }
    }

    pending
        .into_iter()
        .map(|(name, params, body)| {
            let body = body.join(" ");
            if body.trim().is_empty() {
                return Err(load_error(format!(
                    "function '{name}' has an empty body"
                )));
            }
            CelFunction::compile(&name, params, &body).map_err(|e| match e {
                EngineError::FunctionLoad { reason, .. } => {
                    load_error(format!("function '{name}': {reason}"))
                }
                other => other,
            })
        })
        .collect()
}

fn parse_params(raw: &str) -> std::result::Result<Vec<String>, String> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|p| {
            let p = p.trim();
            if IDENT_RE.is_match(p) {
                Ok(p.to_string())
            } else {
                Err(format!("invalid parameter name '{p}'"))
            }
        })
        .collect()
}

/// Rewrite common aliases:
/// - `len(x)` → `size(x)`
/// - `type(x)` → `type_of(x)` (avoid CEL keyword clash)
fn preprocess_expr(expr: &str) -> String {
    static LEN_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\blen\(").expect("failed to compile len regex")
    });

    static TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\btype\(").expect("failed to compile type regex")
    });

    let result = LEN_RE.replace_all(expr, "size(").into_owned();
    TYPE_RE.replace_all(&result, "type_of(").into_owned()
}

fn compile(expr: &str) -> std::result::Result<Program, String> {
    let processed = preprocess_expr(expr);
    Program::compile(&processed)
        .map_err(|e| format!("CEL compile error for '{processed}': {e}"))
}

fn register_custom_functions(context: &mut Context<'_>) {
    // type_of(x) - returns type name as string
    context.add_function("type_of", |v: cel::Value| -> Arc<String> {
        let t = match v {
            cel::Value::Int(_) => "int",
            cel::Value::UInt(_) => "uint",
            cel::Value::Float(_) => "double",
            cel::Value::String(_) => "string",
            cel::Value::Bool(_) => "bool",
            cel::Value::List(_) => "list",
            cel::Value::Map(_) => "map",
            cel::Value::Null => "null",
            cel::Value::Bytes(_) => "bytes",
            _ => "unknown",
        };
        Arc::new(t.to_string())
    });

    // urlencode(str) - URL-encode a string
    context.add_function("urlencode", |s: Arc<String>| -> Arc<String> {
        Arc::new(
            url::form_urlencoded::byte_serialize(s.as_bytes())
                .collect::<String>(),
        )
    });
}

/// Serializes JSON so that every integer that fits `i64` reaches CEL as an
/// `int`; plain `serde_json::Value` would hand positive numbers over as
/// `uint`, which then refuses arithmetic with integer literals.
struct CelInput<'a>(&'a Value);

impl Serialize for CelInput<'_> {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match self.0 {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    serializer.serialize_i64(i)
                } else if let Some(u) = n.as_u64() {
                    serializer.serialize_u64(u)
                } else {
                    serializer.serialize_f64(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(&CelInput(item))?;
                }
                seq.end()
            }
            Value::Object(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    out.serialize_entry(k, &CelInput(v))?;
                }
                out.end()
            }
        }
    }
}
