//! Rule-based validation criteria.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use wr_workflow::{Condition, Context, evaluate};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("schema_compilation_failed: {detail}")]
    SchemaCompilationFailed { detail: String },

    #[error("invalid_criteria_format: {detail}")]
    InvalidCriteriaFormat { detail: String },

    #[error("evaluation_threw: {detail}")]
    EvaluationThrew { detail: String },
}

/// Result of evaluating criteria against output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn passing() -> Self {
        Self {
            valid: true,
            ..Self::default()
        }
    }

    fn merge_all(mut reports: Vec<ValidationReport>, valid: bool) -> Self {
        let mut merged = ValidationReport {
            valid,
            ..Self::default()
        };
        for report in &mut reports {
            merged.issues.append(&mut report.issues);
            merged.suggestions.append(&mut report.suggestions);
            merged.warnings.append(&mut report.warnings);
        }
        merged
    }
}

/// One rule as authored. Exactly one of the rule fields should be present.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Rule {
    #[serde(default)]
    contains: Option<String>,

    #[serde(default)]
    regex: Option<String>,

    #[serde(default)]
    length: Option<LengthRule>,

    #[serde(default)]
    schema: Option<Value>,

    /// Overrides the default issue text on failure.
    #[serde(default)]
    message: Option<String>,

    /// Gates evaluation; a false condition skips the rule.
    #[serde(default)]
    condition: Option<Condition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LengthRule {
    #[serde(default)]
    min: Option<u64>,

    #[serde(default)]
    max: Option<u64>,
}

/// Evaluate criteria in any accepted form against step output.
pub fn evaluate_criteria(
    criteria: &Value,
    output: &str,
    context: &Context,
) -> Result<ValidationReport, ValidationError> {
    let mut report = eval_node(criteria, output, context)?;
    report
        .suggestions
        .extend(quoted_json_suggestions(criteria));
    Ok(report)
}

fn eval_node(
    criteria: &Value,
    output: &str,
    context: &Context,
) -> Result<ValidationReport, ValidationError> {
    match criteria {
        Value::Array(rules) => {
            // Legacy list form: all rules must pass.
            let reports = rules
                .iter()
                .map(|rule| eval_node(rule, output, context))
                .collect::<Result<Vec<_>, _>>()?;
            let valid = reports.iter().all(|r| r.valid);
            Ok(ValidationReport::merge_all(reports, valid))
        }
        Value::Object(map) => {
            if let Some(and) = map.get("and") {
                let branches = as_branch_list(and, "and")?;
                let reports = branches
                    .iter()
                    .map(|branch| eval_node(branch, output, context))
                    .collect::<Result<Vec<_>, _>>()?;
                let valid = reports.iter().all(|r| r.valid);
                return Ok(ValidationReport::merge_all(reports, valid));
            }
            if let Some(or) = map.get("or") {
                let branches = as_branch_list(or, "or")?;
                let reports = branches
                    .iter()
                    .map(|branch| eval_node(branch, output, context))
                    .collect::<Result<Vec<_>, _>>()?;
                let valid = reports.iter().any(|r| r.valid);
                if valid {
                    return Ok(ValidationReport::passing());
                }
                return Ok(ValidationReport::merge_all(reports, false));
            }
            if let Some(not) = map.get("not") {
                let inner = eval_node(not, output, context)?;
                return Ok(ValidationReport {
                    valid: !inner.valid,
                    issues: if inner.valid {
                        vec!["output satisfied criteria that must not hold".to_string()]
                    } else {
                        Vec::new()
                    },
                    suggestions: Vec::new(),
                    warnings: Vec::new(),
                });
            }
            eval_rule(criteria, output, context)
        }
        other => Err(ValidationError::InvalidCriteriaFormat {
            detail: format!("criteria must be an object or array, got {other}"),
        }),
    }
}

fn as_branch_list<'a>(value: &'a Value, keyword: &str) -> Result<&'a Vec<Value>, ValidationError> {
    value
        .as_array()
        .ok_or_else(|| ValidationError::InvalidCriteriaFormat {
            detail: format!("'{keyword}' must hold an array of criteria"),
        })
}

fn eval_rule(
    criteria: &Value,
    output: &str,
    context: &Context,
) -> Result<ValidationReport, ValidationError> {
    let rule: Rule = serde_json::from_value(criteria.clone()).map_err(|err| {
        ValidationError::InvalidCriteriaFormat {
            detail: err.to_string(),
        }
    })?;

    if let Some(condition) = &rule.condition {
        if !evaluate(condition, context) {
            // Gated off: the rule does not apply.
            return Ok(ValidationReport::passing());
        }
    }

    let mut issues = Vec::new();
    let mut suggestions = Vec::new();

    if let Some(needle) = &rule.contains {
        if !output.contains(needle.as_str()) {
            issues.push(
                rule.message
                    .clone()
                    .unwrap_or_else(|| format!("output must contain '{needle}'")),
            );
        }
    }

    if let Some(pattern) = &rule.regex {
        let compiled =
            regex::Regex::new(pattern).map_err(|err| ValidationError::InvalidCriteriaFormat {
                detail: format!("regex '{pattern}' does not compile: {err}"),
            })?;
        if !compiled.is_match(output) {
            issues.push(
                rule.message
                    .clone()
                    .unwrap_or_else(|| format!("output must match /{pattern}/")),
            );
        }
    }

    if let Some(length) = &rule.length {
        let actual = output.chars().count() as u64;
        if let Some(min) = length.min {
            if actual < min {
                issues.push(rule.message.clone().unwrap_or_else(|| {
                    format!("output is {actual} characters; at least {min} required")
                }));
            }
        }
        if let Some(max) = length.max {
            if actual > max {
                issues.push(rule.message.clone().unwrap_or_else(|| {
                    format!("output is {actual} characters; at most {max} allowed")
                }));
            }
        }
    }

    if let Some(schema) = &rule.schema {
        match serde_json::from_str::<Value>(output) {
            Err(_) => {
                issues.push(
                    rule.message
                        .clone()
                        .unwrap_or_else(|| "output is not valid JSON".to_string()),
                );
                suggestions
                    .push("return raw JSON, not JSON wrapped in prose or quotes".to_string());
            }
            Ok(instance) => {
                let validator = jsonschema::validator_for(schema).map_err(|err| {
                    ValidationError::SchemaCompilationFailed {
                        detail: err.to_string(),
                    }
                })?;
                if validator.validate(&instance).is_err() {
                    for err in validator.iter_errors(&instance) {
                        issues.push(format!("{err} at {}", err.instance_path));
                    }
                    if let Some(message) = &rule.message {
                        issues.push(message.clone());
                    }
                }
            }
        }
    }

    if rule.contains.is_none()
        && rule.regex.is_none()
        && rule.length.is_none()
        && rule.schema.is_none()
    {
        return Err(ValidationError::InvalidCriteriaFormat {
            detail: "rule declares no check (contains, regex, length, or schema)".to_string(),
        });
    }

    Ok(ValidationReport {
        valid: issues.is_empty(),
        issues,
        suggestions,
        warnings: Vec::new(),
    })
}

/// Authors who paste JSON snippets into rule messages induce agents to
/// return JSON-as-a-string. Flag them with suggestions instead of failing.
fn quoted_json_suggestions(criteria: &Value) -> Vec<String> {
    let mut suggestions = Vec::new();
    walk_messages(criteria, &mut |message| {
        if looks_like_quoted_json(message) {
            suggestions.push(format!(
                "a validation message quotes a JSON snippet ({}); agents may echo it \
                 as a string, so ask for structured output instead",
                truncate(message, 40)
            ));
        }
    });
    suggestions
}

fn walk_messages(criteria: &Value, visit: &mut impl FnMut(&str)) {
    match criteria {
        Value::Array(items) => {
            for item in items {
                walk_messages(item, visit);
            }
        }
        Value::Object(map) => {
            if let Some(Value::String(message)) = map.get("message") {
                visit(message);
            }
            for keyword in ["and", "or", "not"] {
                if let Some(inner) = map.get(keyword) {
                    walk_messages(inner, visit);
                }
            }
        }
        _ => {}
    }
}

fn looks_like_quoted_json(message: &str) -> bool {
    message.contains("```json")
        || message.contains("`{")
        || message.contains("\"{\"")
        || (message.contains("'{") && message.contains("}'"))
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{cut}…")
    }
}
