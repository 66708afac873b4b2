//! Variable pool and `$name` / `${...}` template rendering.

use crate::error::{EngineError, Result};
use crate::functions::FunctionProvider;
use crate::model::VarMap;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Ordered, last-write-wins variable scope of one run.
#[derive(Debug, Clone, Default)]
pub struct VariablePool {
    vars: VarMap,
}

impl VariablePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(vars: VarMap) -> Self {
        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.shift_remove(name)
    }

    /// Overlay `vars` on top of the pool.
    pub fn extend(&mut self, vars: &VarMap) {
        for (k, v) in vars {
            self.vars.insert(k.clone(), v.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn snapshot(&self) -> VarMap {
        self.vars.clone()
    }
}

/// What to do with a reference that cannot be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// Fail with an error.
    Strict,
    /// Log a warning and keep the reference text as written.
    Lenient,
}

/// Renders templates against a [`VariablePool`], calling loaded functions
/// for `${name(args)}` references.
pub struct Resolver<'a> {
    functions: &'a dyn FunctionProvider,
    strictness: Strictness,
}

impl<'a> Resolver<'a> {
    pub fn new(functions: &'a dyn FunctionProvider, strictness: Strictness) -> Self {
        Self {
            functions,
            strictness,
        }
    }

    pub fn strict(functions: &'a dyn FunctionProvider) -> Self {
        Self::new(functions, Strictness::Strict)
    }

    pub fn lenient(functions: &'a dyn FunctionProvider) -> Self {
        Self::new(functions, Strictness::Lenient)
    }

    /// Same functions, different handling of unresolved references.
    pub fn with_strictness(&self, strictness: Strictness) -> Resolver<'a> {
        Self::new(self.functions, strictness)
    }

    /// Render every string inside `value`, preserving structure.
    pub fn render(&self, value: &Value, pool: &VariablePool) -> Result<Value> {
        match value {
            Value::String(s) => self.render_str(s, pool),
            Value::Array(items) => items
                .iter()
                .map(|item| self.render(item, pool))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.render(v, pool)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Render one template string.
    ///
    /// A string made of a single reference yields the referenced value with
    /// its own type; mixed text yields a string.
    pub fn render_str(&self, input: &str, pool: &VariablePool) -> Result<Value> {
        if !input.contains('$') {
            return Ok(Value::String(input.to_string()));
        }

        let segments = parse_template(input);
        if let [segment] = segments.as_slice() {
            if !matches!(segment, Segment::Text(_)) {
                return Ok(self
                    .eval(segment, pool)?
                    .unwrap_or_else(|| Value::String(segment.raw().to_string())));
            }
        }

        let mut out = String::new();
        for segment in &segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                _ => match self.eval(segment, pool)? {
                    Some(value) => out.push_str(&stringify(&value)),
                    None => out.push_str(segment.raw()),
                },
            }
        }
        Ok(Value::String(out))
    }

    /// Like [`Resolver::render_str`], always producing text.
    pub fn render_string(&self, input: &str, pool: &VariablePool) -> Result<String> {
        self.render_str(input, pool).map(|v| stringify(&v))
    }

    /// Resolve a mapping whose entries may refer to one another.
    ///
    /// Entries are evaluated once every sibling they reference is resolved;
    /// the result keeps declaration order. A self reference (`token: $token`)
    /// reads the outer pool.
    pub fn resolve_mapping(&self, vars: &VarMap, pool: &VariablePool) -> Result<VarMap> {
        let mut working = pool.clone();
        let mut resolved = VarMap::with_capacity(vars.len());
        let mut remaining: Vec<(&String, &Value, HashSet<String>)> = vars
            .iter()
            .map(|(k, v)| {
                let mut deps = references(v);
                deps.retain(|d| d != k && vars.contains_key(d));
                (k, v, deps)
            })
            .collect();

        while !remaining.is_empty() {
            let ready = remaining
                .iter()
                .position(|(_, _, deps)| deps.iter().all(|d| resolved.contains_key(d)));

            let (name, raw, _) = match ready {
                Some(idx) => remaining.remove(idx),
                None => {
                    let names: Vec<&str> =
                        remaining.iter().map(|(k, _, _)| k.as_str()).collect();
                    if self.strictness == Strictness::Strict {
                        return Err(EngineError::UndefinedVariable(format!(
                            "circular reference among: {}",
                            names.join(", ")
                        )));
                    }
                    warn!("Circular variable references among: {}", names.join(", "));
                    remaining.remove(0)
                }
            };

            let value = self.render(raw, &working)?;
            working.insert(name.clone(), value.clone());
            resolved.insert(name.clone(), value);
        }

        // Restore declaration order.
        let mut ordered = VarMap::with_capacity(resolved.len());
        for key in vars.keys() {
            if let Some(v) = resolved.shift_remove(key) {
                ordered.insert(key.clone(), v);
            }
        }
        Ok(ordered)
    }

    /// `Ok(None)` means the reference stays unresolved (lenient mode only).
    fn eval(&self, segment: &Segment, pool: &VariablePool) -> Result<Option<Value>> {
        match segment {
            Segment::Text(text) => Ok(Some(Value::String(text.clone()))),
            Segment::Var { name, .. } => match pool.get(name) {
                Some(v) => Ok(Some(v.clone())),
                None => self.unresolved(EngineError::UndefinedVariable(name.clone())),
            },
            Segment::Call { name, args, .. } => {
                let Some(function) = self.functions.resolve(name) else {
                    return self.unresolved(EngineError::FunctionNotFound(name.clone()));
                };
                let mut values = Vec::new();
                for arg in split_args(args) {
                    match self.eval_arg(&arg, pool) {
                        Ok(v) => values.push(v),
                        Err(e) => return self.unresolved(e),
                    }
                }
                debug!("Calling function {}({:?})", name, values);
                match function.call(&values) {
                    Ok(v) => Ok(Some(v)),
                    Err(e) => self.unresolved(e),
                }
            }
        }
    }

    fn eval_arg(&self, arg: &str, pool: &VariablePool) -> Result<Value> {
        if let Some(quoted) = unquote(arg) {
            return Ok(Value::String(quoted.to_string()));
        }
        if arg.contains('$') {
            return self.render_str(arg, pool);
        }
        Ok(parse_literal(arg))
    }

    fn unresolved(&self, err: EngineError) -> Result<Option<Value>> {
        match self.strictness {
            Strictness::Strict => Err(err),
            Strictness::Lenient => {
                warn!("{}, keeping reference as written", err);
                Ok(None)
            }
        }
    }
}

/// Text form of a value inside mixed templates.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Names of all variables referenced anywhere in `value`.
pub fn references(value: &Value) -> HashSet<String> {
    let mut names = HashSet::new();
    collect_references(value, &mut names);
    names
}

fn collect_references(value: &Value, names: &mut HashSet<String>) {
    match value {
        Value::String(s) if s.contains('$') => {
            for segment in parse_template(s) {
                match segment {
                    Segment::Var { name, .. } => {
                        names.insert(name);
                    }
                    Segment::Call { args, .. } => {
                        for arg in split_args(&args) {
                            if unquote(&arg).is_none() && arg.contains('$') {
                                collect_references(&Value::String(arg), names);
                            }
                        }
                    }
                    Segment::Text(_) => {}
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, names)),
        Value::Object(map) => map.values().for_each(|v| collect_references(v, names)),
        _ => {}
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Var { name: String, raw: String },
    Call { name: String, args: String, raw: String },
}

impl Segment {
    fn raw(&self) -> &str {
        match self {
            Segment::Text(text) => text,
            Segment::Var { raw, .. } | Segment::Call { raw, .. } => raw,
        }
    }
}

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_]\w*$").expect("failed to compile ident regex"));

static CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^([A-Za-z_]\w*)\s*\((.*)\)$").expect("failed to compile call regex")
});

fn parse_template(input: &str) -> Vec<Segment> {
    let bytes = input.as_bytes();
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut last = 0;
    let mut i = 0;

    let flush = |text: &mut String, segments: &mut Vec<Segment>| {
        if !text.is_empty() {
            segments.push(Segment::Text(std::mem::take(text)));
        }
    };

    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        text.push_str(&input[last..i]);

        let parsed = match bytes.get(i + 1) {
            Some(b'$') => {
                text.push('$');
                i += 2;
                last = i;
                continue;
            }
            Some(b'{') => find_closing(bytes, i + 2).and_then(|end| {
                let inner = input[i + 2..end].trim();
                let raw = input[i..=end].to_string();
                parse_braced(inner, raw).map(|seg| (seg, end + 1))
            }),
            _ => {
                let len = ident_len(&input[i + 1..]);
                (len > 0).then(|| {
                    let name = input[i + 1..i + 1 + len].to_string();
                    let raw = format!("${name}");
                    (Segment::Var { name, raw }, i + 1 + len)
                })
            }
        };

        match parsed {
            Some((segment, next)) => {
                flush(&mut text, &mut segments);
                segments.push(segment);
                i = next;
            }
            None => {
                text.push('$');
                i += 1;
            }
        }
        last = i;
    }

    text.push_str(&input[last..]);
    flush(&mut text, &mut segments);
    segments
}

fn parse_braced(inner: &str, raw: String) -> Option<Segment> {
    if IDENT_RE.is_match(inner) {
        return Some(Segment::Var {
            name: inner.to_string(),
            raw,
        });
    }
    CALL_RE.captures(inner).map(|caps| Segment::Call {
        name: caps[1].to_string(),
        args: caps[2].to_string(),
        raw,
    })
}

/// Index of the `}` closing a `${` whose body starts at `start`.
fn find_closing(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 1usize;
    let mut quote: Option<u8> = None;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        match (quote, b) {
            (Some(q), _) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"' | b'\'') => quote = Some(b),
            (None, b'{') => depth += 1,
            (None, b'}') => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn ident_len(s: &str) -> usize {
    let mut chars = s.char_indices();
    match chars.next() {
        Some((_, c)) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return 0,
    }
    chars
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
        .map(|(idx, _)| idx)
        .unwrap_or(s.len())
}

/// Split call arguments on top-level commas.
fn split_args(args: &str) -> Vec<String> {
    if args.trim().is_empty() {
        return Vec::new();
    }
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;

    for c in args.chars() {
        match (quote, c) {
            (Some(q), _) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), _) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                current.push(c);
            }
            (None, '(' | '[' | '{') => {
                depth += 1;
                current.push(c);
            }
            (None, ')' | ']' | '}') => {
                depth -= 1;
                current.push(c);
            }
            (None, ',') if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    parts.push(current.trim().to_string());
    parts
}

fn unquote(arg: &str) -> Option<&str> {
    let arg = arg.trim();
    if arg.len() >= 2
        && ((arg.starts_with('"') && arg.ends_with('"'))
            || (arg.starts_with('\'') && arg.ends_with('\'')))
    {
        Some(&arg[1..arg.len() - 1])
    } else {
        None
    }
}

fn parse_literal(arg: &str) -> Value {
    let arg = arg.trim();
    match arg {
        "true" | "True" => return Value::Bool(true),
        "false" | "False" => return Value::Bool(false),
        "null" | "None" => return Value::Null,
        _ => {}
    }
    if let Ok(i) = arg.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = arg.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    Value::String(arg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{Callable, FunctionRegistry};
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Sum;

    impl Callable for Sum {
        fn call(&self, args: &[Value]) -> Result<Value> {
            Ok(Value::from(args.iter().filter_map(Value::as_i64).sum::<i64>()))
        }
    }

    #[derive(Debug)]
    struct Echo;

    impl Callable for Echo {
        fn call(&self, args: &[Value]) -> Result<Value> {
            Ok(Value::Array(args.to_vec()))
        }
    }

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::default();
        registry.insert("sum", Arc::new(Sum));
        registry.insert("echo", Arc::new(Echo));
        registry
    }

    fn pool() -> VariablePool {
        let mut pool = VariablePool::new();
        pool.insert("id", json!(42));
        pool.insert("name", json!("alice"));
        pool.insert("tags", json!(["a", "b"]));
        pool
    }

    #[test]
    fn test_whole_reference_keeps_type() {
        let functions = registry();
        let r = Resolver::strict(&functions);
        assert_eq!(r.render_str("$id", &pool()).unwrap(), json!(42));
        assert_eq!(r.render_str("${tags}", &pool()).unwrap(), json!(["a", "b"]));
    }

    #[test]
    fn test_mixed_text_stringifies() {
        let functions = registry();
        let r = Resolver::strict(&functions);
        assert_eq!(
            r.render_str("/users/$id/${name}", &pool()).unwrap(),
            json!("/users/42/alice")
        );
    }

    #[test]
    fn test_double_dollar_is_literal() {
        let functions = registry();
        let r = Resolver::strict(&functions);
        assert_eq!(r.render_str("cost: $$5", &pool()).unwrap(), json!("cost: $5"));
        assert_eq!(r.render_str("$$id", &pool()).unwrap(), json!("$id"));
        assert_eq!(r.render_str("price $5", &pool()).unwrap(), json!("price $5"));
    }

    #[test]
    fn test_function_arguments_resolve_innermost_first() {
        let functions = registry();
        let r = Resolver::strict(&functions);
        assert_eq!(
            r.render_str("${sum(${sum(1, 2)}, $id, 3)}", &pool()).unwrap(),
            json!(48)
        );
        assert_eq!(
            r.render_str("${echo('a, b', 1.5, true, None, bare)}", &pool())
                .unwrap(),
            json!(["a, b", 1.5, true, null, "bare"])
        );
        assert_eq!(r.render_str("${echo()}", &pool()).unwrap(), json!([]));
    }

    #[test]
    fn test_structure_is_preserved() {
        let functions = registry();
        let r = Resolver::strict(&functions);
        let rendered = r
            .render(&json!({"user": {"id": "$id", "tags": ["$name", 1]}}), &pool())
            .unwrap();
        assert_eq!(rendered, json!({"user": {"id": 42, "tags": ["alice", 1]}}));
    }

    #[test]
    fn test_strict_missing_variable_fails() {
        let functions = registry();
        let r = Resolver::strict(&functions);
        let err = r.render_str("$missing", &pool()).unwrap_err();
        assert!(matches!(err, EngineError::UndefinedVariable(name) if name == "missing"));

        let err = r.render_str("${nope()}", &pool()).unwrap_err();
        assert!(matches!(err, EngineError::FunctionNotFound(_)));
    }

    #[test]
    fn test_lenient_missing_variable_keeps_literal() {
        let functions = registry();
        let r = Resolver::lenient(&functions);
        assert_eq!(r.render_str("$missing", &pool()).unwrap(), json!("$missing"));
        assert_eq!(
            r.render_str("id=$id&x=${missing}", &pool()).unwrap(),
            json!("id=42&x=${missing}")
        );
        assert_eq!(
            r.render_str("${nope($id)}", &pool()).unwrap(),
            json!("${nope($id)}")
        );
    }

    #[test]
    fn test_resolve_mapping_in_dependency_order() {
        let functions = registry();
        let r = Resolver::strict(&functions);
        let vars: VarMap = [
            ("url".to_string(), json!("/users/$user_id")),
            ("user_id".to_string(), json!("${sum($id, 1)}")),
        ]
        .into_iter()
        .collect();

        let resolved = r.resolve_mapping(&vars, &pool()).unwrap();
        assert_eq!(resolved.keys().collect::<Vec<_>>(), ["url", "user_id"]);
        assert_eq!(resolved["user_id"], json!(43));
        assert_eq!(resolved["url"], json!("/users/43"));
    }

    #[test]
    fn test_resolve_mapping_self_reference_reads_outer_pool() {
        let functions = registry();
        let r = Resolver::strict(&functions);
        let vars: VarMap = [("name".to_string(), json!("$name-2"))].into_iter().collect();
        let resolved = r.resolve_mapping(&vars, &pool()).unwrap();
        assert_eq!(resolved["name"], json!("alice-2"));
    }

    #[test]
    fn test_resolve_mapping_cycle_is_strict_error() {
        let functions = registry();
        let vars: VarMap = [
            ("a".to_string(), json!("$b")),
            ("b".to_string(), json!("$a")),
        ]
        .into_iter()
        .collect();

        let err = Resolver::strict(&functions)
            .resolve_mapping(&vars, &VariablePool::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::UndefinedVariable(_)));

        let lenient = Resolver::lenient(&functions)
            .resolve_mapping(&vars, &VariablePool::new())
            .unwrap();
        assert_eq!(lenient.len(), 2);
    }

    #[test]
    fn test_references() {
        let refs = references(&json!({"a": "$x and ${y}", "b": ["${f($z, 'lit$')}"]}));
        let mut names: Vec<_> = refs.into_iter().collect();
        names.sort();
        assert_eq!(names, ["x", "y", "z"]);
    }
}
