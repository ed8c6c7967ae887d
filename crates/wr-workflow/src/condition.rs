//! The small predicate language used by run conditions and loop conditions.
//!
//! Comparison is deliberately lenient: agents report context values as
//! strings more often than not, so numeric strings compare numerically,
//! `"yes"/"no"/"true"/"false"` coerce to booleans, and string equality is
//! case-insensitive. Missing variables are falsy rather than errors; the
//! caller receives structured guidance describing what was expected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Execution context: a flat JSON object of variables.
pub type Context = serde_json::Map<String, Value>;

/// A predicate over context variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    And { and: Vec<Condition> },
    Or { or: Vec<Condition> },
    Not { not: Box<Condition> },
    Compare(Comparison),
}

/// One comparison against a single variable. Exactly one operator should be
/// set; when several are, all must hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Comparison {
    pub var: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub le: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ge: Option<Value>,
}

/// Why a comparison did not hold: actionable for the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionGuidance {
    pub variable: String,
    pub comparison: String,
    pub expected: Value,

    /// Current value, absent when the variable is missing from context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
}

/// Evaluate a condition; missing variables are falsy.
pub fn evaluate(condition: &Condition, context: &Context) -> bool {
    evaluate_with_guidance(condition, context).0
}

/// Evaluate, collecting guidance for every comparison that did not hold.
pub fn evaluate_with_guidance(
    condition: &Condition,
    context: &Context,
) -> (bool, Vec<ConditionGuidance>) {
    let mut guidance = Vec::new();
    let holds = eval(condition, context, &mut guidance);
    (holds, guidance)
}

fn eval(condition: &Condition, context: &Context, guidance: &mut Vec<ConditionGuidance>) -> bool {
    match condition {
        Condition::And { and } => and.iter().all(|inner| eval(inner, context, guidance)),
        Condition::Or { or } => {
            // Guidance from failed branches is only interesting when the
            // whole disjunction fails.
            let mut branch_guidance = Vec::new();
            let holds = or
                .iter()
                .any(|inner| eval(inner, context, &mut branch_guidance));
            if !holds {
                guidance.append(&mut branch_guidance);
            }
            holds
        }
        Condition::Not { not } => !eval(not, context, &mut Vec::new()),
        Condition::Compare(comparison) => eval_comparison(comparison, context, guidance),
    }
}

fn eval_comparison(
    comparison: &Comparison,
    context: &Context,
    guidance: &mut Vec<ConditionGuidance>,
) -> bool {
    let actual = context.get(&comparison.var);
    let mut holds = true;

    let mut check = |name: &str, expected: &Option<Value>, test: &dyn Fn(&Value, &Value) -> bool| {
        let Some(expected) = expected else {
            return;
        };
        let ok = match actual {
            Some(actual) => test(actual, expected),
            None => false,
        };
        if !ok {
            guidance.push(ConditionGuidance {
                variable: comparison.var.clone(),
                comparison: name.to_string(),
                expected: expected.clone(),
                actual: actual.cloned(),
            });
            holds = false;
        }
    };

    check("equals", &comparison.equals, &lenient_equals);
    check("lt", &comparison.lt, &|a, b| numeric_cmp(a, b, |o| o.is_lt()));
    check("le", &comparison.le, &|a, b| numeric_cmp(a, b, |o| o.is_le()));
    check("gt", &comparison.gt, &|a, b| numeric_cmp(a, b, |o| o.is_gt()));
    check("ge", &comparison.ge, &|a, b| numeric_cmp(a, b, |o| o.is_ge()));
    holds
}

/// Coerce a value to a boolean.
///
/// Exactly `"yes"/"no"/"true"/"false"` (any case) coerce among strings;
/// numbers coerce by zero/non-zero. Anything else does not coerce.
pub fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "yes" | "true" => Some(true),
            "no" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Coerce a value to a number; numeric strings parse.
pub fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Lenient equality: boolean coercion, numeric parsing, case-insensitive
/// strings, strict fallback.
pub fn lenient_equals(actual: &Value, expected: &Value) -> bool {
    if let (Value::Bool(_), _) | (_, Value::Bool(_)) = (actual, expected) {
        return match (coerce_bool(actual), coerce_bool(expected)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
    }
    if let (Some(a), Some(b)) = (coerce_number(actual), coerce_number(expected)) {
        return a == b;
    }
    if let (Value::String(a), Value::String(b)) = (actual, expected) {
        return a.eq_ignore_ascii_case(b);
    }
    actual == expected
}

fn numeric_cmp(actual: &Value, expected: &Value, test: fn(std::cmp::Ordering) -> bool) -> bool {
    match (coerce_number(actual), coerce_number(expected)) {
        (Some(a), Some(b)) => a.partial_cmp(&b).map(test).unwrap_or(false),
        _ => false,
    }
}
