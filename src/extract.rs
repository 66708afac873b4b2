//! Pull named values out of a step's result.

use crate::error::Result;
use crate::model::{ResponseInfo, VarMap};
use crate::variables::{Resolver, Strictness, VariablePool};
use indexmap::IndexMap;
use regex::Regex;
use serde_json::{Map, Number, Value};
use std::sync::LazyLock;
use tracing::debug;

/// JSON view of an HTTP response that extraction paths and assertion checks
/// address: `status_code`, `headers`, `body` (parsed JSON, else text),
/// `text` and `elapsed` (milliseconds).
pub fn http_view(response: &ResponseInfo) -> Value {
    let text = response.body.clone().unwrap_or_default();
    let body = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| Value::String(text.clone()));

    let headers: Map<String, Value> = response
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    let mut view = Map::new();
    view.insert("status_code".into(), Value::Number(Number::from(response.status)));
    view.insert("headers".into(), Value::Object(headers));
    view.insert("body".into(), body);
    view.insert("text".into(), Value::String(text));
    view.insert("elapsed".into(), Value::Number(Number::from(response.elapsed_ms)));
    Value::Object(view)
}

static INDEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]").expect("failed to compile index regex"));

/// Follow a dotted path (`body.items[0].id`, `body.items.0.id`). Lookups
/// directly under `headers` ignore ASCII case; `content` and `json` are
/// aliases of `body` at the root.
pub fn get_value_by_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let normalized = INDEX_RE.replace_all(path.trim(), ".$1");
    let mut current = value;
    let mut parent: Option<&str> = None;

    for (depth, part) in normalized.split('.').filter(|p| !p.is_empty()).enumerate() {
        let part = match part {
            "content" | "json" if depth == 0 && value.get(part).is_none() => "body",
            other => other,
        };

        current = match current {
            Value::Object(map) => match map.get(part) {
                Some(v) => v,
                None if parent == Some("headers") => map
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(part))
                    .map(|(_, v)| v)?,
                None => return None,
            },
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
        parent = Some(part);
    }

    Some(current)
}

/// Evaluate every `name → path` pair against `source`.
///
/// Paths that resolve to nothing are skipped. A path that is itself a
/// template (`$var`, `${f()}`) is rendered against the pool instead; one
/// with an undefined variable or a failing call is skipped too.
pub fn extract(
    paths: &IndexMap<String, String>,
    source: &Value,
    resolver: &Resolver<'_>,
    pool: &VariablePool,
) -> Result<VarMap> {
    let mut out = VarMap::with_capacity(paths.len());
    for (name, path) in paths {
        if path.contains('$') {
            // Rendered strictly: an unresolved template must not leak its
            // raw text into the exports.
            match resolver.with_strictness(Strictness::Strict).render_str(path, pool) {
                Ok(value) => {
                    debug!("Extracted '{}' from template '{}'", name, path);
                    out.insert(name.clone(), value);
                }
                Err(e) => debug!("Extract template '{}' for '{}' resolved to nothing: {}", path, name, e),
            }
            continue;
        }
        match get_value_by_path(source, path) {
            Some(value) => {
                debug!("Extracted '{}' = {}", name, value);
                out.insert(name.clone(), value.clone());
            }
            None => debug!("Extract path '{}' for '{}' resolved to nothing", path, name),
        }
    }
    Ok(out)
}
