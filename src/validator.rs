//! Assertion normalization and evaluation.

use crate::error::{EngineError, Result};
use crate::extract::get_value_by_path;
use crate::model::AssertionOutcome;
use crate::variables::{stringify, Resolver, VariablePool};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    ContainedBy,
    TypeMatch,
    RegexMatch,
    StartsWith,
    EndsWith,
    StrEq,
    LengthEqual,
    LengthGreaterThan,
    LengthLessThan,
    LengthGreaterOrEquals,
    LengthLessOrEquals,
}

impl Comparator {
    /// Accepts short names, the long httprunner spellings and symbols.
    pub fn parse(name: &str) -> Option<Self> {
        let c = match name.trim().to_ascii_lowercase().as_str() {
            "eq" | "equal" | "equals" | "==" => Comparator::Eq,
            "ne" | "not_equal" | "not_equals" | "!=" => Comparator::Ne,
            "gt" | "greater_than" | ">" => Comparator::Gt,
            "ge" | "greater_or_equals" | "greater_than_or_equals" | ">=" => Comparator::Ge,
            "lt" | "less_than" | "<" => Comparator::Lt,
            "le" | "less_or_equals" | "less_than_or_equals" | "<=" => Comparator::Le,
            "contains" => Comparator::Contains,
            "contained_by" => Comparator::ContainedBy,
            "type_match" => Comparator::TypeMatch,
            "regex_match" => Comparator::RegexMatch,
            "startswith" | "starts_with" => Comparator::StartsWith,
            "endswith" | "ends_with" => Comparator::EndsWith,
            "str_eq" | "string_equals" => Comparator::StrEq,
            "length_equal" | "length_equals" | "len_eq" | "count_eq" => Comparator::LengthEqual,
            "length_greater_than" | "len_gt" | "count_gt" => Comparator::LengthGreaterThan,
            "length_less_than" | "len_lt" | "count_lt" => Comparator::LengthLessThan,
            "length_greater_or_equals" | "len_ge" | "count_ge" => {
                Comparator::LengthGreaterOrEquals
            }
            "length_less_or_equals" | "len_le" | "count_le" => Comparator::LengthLessOrEquals,
            _ => return None,
        };
        Some(c)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Eq => "eq",
            Comparator::Ne => "ne",
            Comparator::Gt => "gt",
            Comparator::Ge => "ge",
            Comparator::Lt => "lt",
            Comparator::Le => "le",
            Comparator::Contains => "contains",
            Comparator::ContainedBy => "contained_by",
            Comparator::TypeMatch => "type_match",
            Comparator::RegexMatch => "regex_match",
            Comparator::StartsWith => "startswith",
            Comparator::EndsWith => "endswith",
            Comparator::StrEq => "str_eq",
            Comparator::LengthEqual => "length_equal",
            Comparator::LengthGreaterThan => "length_greater_than",
            Comparator::LengthLessThan => "length_less_than",
            Comparator::LengthGreaterOrEquals => "length_greater_or_equals",
            Comparator::LengthLessOrEquals => "length_less_or_equals",
        }
    }

    /// Apply the comparator to an actual and an expected value.
    pub fn compare(&self, actual: &Value, expected: &Value) -> bool {
        match self {
            Comparator::Eq => values_equal(actual, expected),
            Comparator::Ne => !values_equal(actual, expected),
            Comparator::Gt => ordering(actual, expected).is_some_and(|o| o.is_gt()),
            Comparator::Ge => ordering(actual, expected).is_some_and(|o| o.is_ge()),
            Comparator::Lt => ordering(actual, expected).is_some_and(|o| o.is_lt()),
            Comparator::Le => ordering(actual, expected).is_some_and(|o| o.is_le()),
            Comparator::Contains => contains(actual, expected),
            Comparator::ContainedBy => contains(expected, actual),
            Comparator::TypeMatch => type_matches(actual, expected),
            Comparator::RegexMatch => regex_matches(actual, expected),
            Comparator::StartsWith => stringify(actual).starts_with(&stringify(expected)),
            Comparator::EndsWith => stringify(actual).ends_with(&stringify(expected)),
            Comparator::StrEq => stringify(actual) == stringify(expected),
            Comparator::LengthEqual => length_cmp(actual, expected, |a, e| a == e),
            Comparator::LengthGreaterThan => length_cmp(actual, expected, |a, e| a > e),
            Comparator::LengthLessThan => length_cmp(actual, expected, |a, e| a < e),
            Comparator::LengthGreaterOrEquals => length_cmp(actual, expected, |a, e| a >= e),
            Comparator::LengthLessOrEquals => length_cmp(actual, expected, |a, e| a <= e),
        }
    }
}

/// One normalized assertion.
#[derive(Debug, Clone, PartialEq)]
pub struct AssertionSpec {
    pub comparator: Comparator,
    /// A path into the result, a template, or a literal.
    pub check: Value,
    pub expect: Value,
    pub message: Option<String>,
}

impl AssertionSpec {
    /// Normalize `{"check", "expect", "comparator"?, "message"?}` or
    /// `{"<comparator>": [check, expect, message?]}`.
    ///
    /// An unknown comparator is skipped with a warning (`Ok(None)`) unless
    /// `strict` is set.
    pub fn parse(raw: &Value, strict: bool) -> Result<Option<Self>> {
        let invalid = || EngineError::Definition(format!("unsupported validator form: {raw}"));
        let map = raw.as_object().ok_or_else(invalid)?;

        let (name, check, expect, message) = if let Some(check) = map.get("check") {
            let name = map
                .get("comparator")
                .and_then(Value::as_str)
                .unwrap_or("eq")
                .to_string();
            let message = map.get("message").and_then(Value::as_str).map(str::to_string);
            let expect = map.get("expect").cloned().unwrap_or(Value::Null);
            (name, check.clone(), expect, message)
        } else {
            let mut entries = map.iter();
            let (Some((name, Value::Array(args))), None) = (entries.next(), entries.next()) else {
                return Err(invalid());
            };
            let (check, expect, message) = match args.as_slice() {
                [check, expect] => (check.clone(), expect.clone(), None),
                [check, expect, message] => (
                    check.clone(),
                    expect.clone(),
                    Some(stringify(message)).filter(|m| !m.is_empty()),
                ),
                _ => return Err(invalid()),
            };
            (name.clone(), check, expect, message)
        };

        match Comparator::parse(&name) {
            Some(comparator) => Ok(Some(AssertionSpec {
                comparator,
                check,
                expect,
                message,
            })),
            None if strict => Err(EngineError::Definition(format!(
                "unknown comparator '{name}'"
            ))),
            None => {
                warn!("Unknown comparator '{}', validator skipped", name);
                Ok(None)
            }
        }
    }

    /// Evaluate against a result view.
    pub fn evaluate(
        &self,
        source: &Value,
        resolver: &Resolver<'_>,
        pool: &VariablePool,
    ) -> AssertionOutcome {
        let check_value = match &self.check {
            Value::String(s) if s.contains('$') => render_or_null(resolver, &self.check, pool),
            Value::String(path) => get_value_by_path(source, path)
                .cloned()
                .unwrap_or(Value::Null),
            literal => literal.clone(),
        };
        let expect_value = render_or_null(resolver, &self.expect, pool);
        let passed = self.comparator.compare(&check_value, &expect_value);

        if passed {
            debug!(
                "Assertion passed: {} {} {}",
                self.check, self.comparator.as_str(), expect_value
            );
        } else {
            warn!(
                "Assertion failed: {} {} {} (actual: {}){}",
                self.check,
                self.comparator.as_str(),
                expect_value,
                check_value,
                self.message.as_deref().map(|m| format!(" - {m}")).unwrap_or_default()
            );
        }

        AssertionOutcome {
            comparator: self.comparator.as_str().to_string(),
            check: self.check.clone(),
            check_value,
            expect: self.expect.clone(),
            expect_value,
            message: self.message.clone(),
            passed,
        }
    }
}

/// Evaluate all assertions; success iff every outcome passed.
pub fn validate(
    specs: &[AssertionSpec],
    source: &Value,
    resolver: &Resolver<'_>,
    pool: &VariablePool,
) -> (bool, Vec<AssertionOutcome>) {
    let outcomes: Vec<AssertionOutcome> = specs
        .iter()
        .map(|spec| spec.evaluate(source, resolver, pool))
        .collect();
    (outcomes.iter().all(|o| o.passed), outcomes)
}

fn render_or_null(resolver: &Resolver<'_>, value: &Value, pool: &VariablePool) -> Value {
    resolver.render(value, pool).unwrap_or_else(|e| {
        warn!("Failed to render {}: {}", value, e);
        Value::Null
    })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

fn ordering(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(container: &Value, item: &Value) -> bool {
    match container {
        Value::String(s) => s.contains(&stringify(item)),
        Value::Array(items) => items.iter().any(|v| values_equal(v, item)),
        Value::Object(map) => item.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}

fn type_matches(actual: &Value, expected: &Value) -> bool {
    let Some(name) = expected.as_str() else {
        return false;
    };
    match name.to_ascii_lowercase().as_str() {
        "int" | "integer" => actual.is_i64() || actual.is_u64(),
        "float" | "double" => actual.is_f64(),
        "number" => actual.is_number(),
        "str" | "string" => actual.is_string(),
        "list" | "array" | "tuple" => actual.is_array(),
        "dict" | "object" | "map" => actual.is_object(),
        "bool" | "boolean" => actual.is_boolean(),
        "none" | "null" | "nonetype" => actual.is_null(),
        _ => false,
    }
}

/// Anchored at the start of the text, like a prefix match.
fn regex_matches(actual: &Value, expected: &Value) -> bool {
    let pattern = stringify(expected);
    match Regex::new(&format!("^(?:{pattern})")) {
        Ok(re) => re.is_match(&stringify(actual)),
        Err(e) => {
            warn!("Invalid regex '{}': {}", pattern, e);
            false
        }
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => Some(map.len()),
        _ => None,
    }
}

fn length_cmp(actual: &Value, expected: &Value, cmp: fn(f64, f64) -> bool) -> bool {
    let expected = match expected {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match (length_of(actual), expected) {
        (Some(len), Some(exp)) => cmp(len as f64, exp),
        _ => false,
    }
}
