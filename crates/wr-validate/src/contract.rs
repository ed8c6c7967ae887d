//! Output-contract validation and typed artifact extraction.

use crate::rules::{ValidationError, ValidationReport};
use serde_json::Value;
use wr_workflow::{Artifact, Contract, LOOP_CONTROL_CONTRACT};

/// Result of validating step output against a typed contract.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractOutcome {
    pub report: ValidationReport,

    /// The extracted artifact when the output satisfies the contract.
    pub artifact: Option<Artifact>,
}

/// Validate output against a registered contract and extract the artifact.
///
/// Output that is not JSON, or JSON that fails the contract schema, yields
/// an invalid report (a retryable situation upstream), not an error. Errors
/// are reserved for a contract whose schema does not compile.
pub fn validate_output_contract(
    contract: &Contract,
    output: &str,
) -> Result<ContractOutcome, ValidationError> {
    let instance: Value = match serde_json::from_str(output.trim()) {
        Ok(value) => value,
        Err(_) => {
            return Ok(ContractOutcome {
                report: ValidationReport {
                    valid: false,
                    issues: vec![format!(
                        "output must be JSON satisfying contract '{}'",
                        contract.id
                    )],
                    suggestions: vec![
                        "return the artifact as raw JSON, not prose or a quoted string"
                            .to_string(),
                    ],
                    warnings: Vec::new(),
                },
                artifact: None,
            });
        }
    };

    let validator = jsonschema::validator_for(&contract.schema).map_err(|err| {
        ValidationError::SchemaCompilationFailed {
            detail: err.to_string(),
        }
    })?;

    if validator.validate(&instance).is_err() {
        let issues: Vec<String> = validator
            .iter_errors(&instance)
            .map(|err| format!("{err} at {}", err.instance_path))
            .collect();
        return Ok(ContractOutcome {
            report: ValidationReport {
                valid: false,
                issues,
                suggestions: vec![format!("match the '{}' contract exactly", contract.id)],
                warnings: Vec::new(),
            },
            artifact: None,
        });
    }

    let artifact = if contract.id == LOOP_CONTROL_CONTRACT {
        // Schema-valid loop-control data always lowers to an artifact.
        Artifact::loop_control(instance.clone())
    } else {
        Some(Artifact {
            kind: contract.id.clone(),
            loop_id: instance
                .get("loopId")
                .and_then(Value::as_str)
                .map(str::to_string),
            decision: None,
            data: instance.clone(),
        })
    };

    Ok(ContractOutcome {
        report: ValidationReport {
            valid: true,
            ..ValidationReport::default()
        },
        artifact,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wr_workflow::{ContractRegistry, LoopDecision};

    fn loop_control() -> Contract {
        ContractRegistry::builtin()
            .get(LOOP_CONTROL_CONTRACT)
            .unwrap()
            .clone()
    }

    #[test]
    fn test_valid_loop_control_output_yields_artifact() {
        let outcome = validate_output_contract(
            &loop_control(),
            r#"{"decision": "continue", "loopId": "refine", "reason": "more to fix"}"#,
        )
        .unwrap();

        assert!(outcome.report.valid);
        let artifact = outcome.artifact.unwrap();
        assert_eq!(artifact.kind, LOOP_CONTROL_CONTRACT);
        assert_eq!(artifact.loop_id.as_deref(), Some("refine"));
        assert_eq!(artifact.decision, Some(LoopDecision::Continue));
    }

    #[test]
    fn test_text_output_is_invalid_not_an_error() {
        let outcome = validate_output_contract(&loop_control(), "I think we should continue")
            .unwrap();
        assert!(!outcome.report.valid);
        assert!(outcome.artifact.is_none());
        assert!(outcome.report.issues[0].contains(LOOP_CONTROL_CONTRACT));
        assert!(!outcome.report.suggestions.is_empty());
    }

    #[test]
    fn test_schema_violation_lists_issues() {
        let outcome = validate_output_contract(
            &loop_control(),
            r#"{"decision": "pause", "loopId": "refine"}"#,
        )
        .unwrap();
        assert!(!outcome.report.valid);
        assert!(outcome.artifact.is_none());
        assert!(!outcome.report.issues.is_empty());
    }

    #[test]
    fn test_missing_loop_id_fails_schema() {
        let outcome =
            validate_output_contract(&loop_control(), r#"{"decision": "stop"}"#).unwrap();
        assert!(!outcome.report.valid);
    }

    #[test]
    fn test_whitespace_padded_json_accepted() {
        let outcome = validate_output_contract(
            &loop_control(),
            "\n  {\"decision\": \"stop\", \"loopId\": \"l\"}  \n",
        )
        .unwrap();
        assert!(outcome.report.valid);
        assert_eq!(
            outcome.artifact.unwrap().decision,
            Some(LoopDecision::Stop)
        );
    }

    #[test]
    fn test_custom_contract_artifact_has_no_decision() {
        let contract = Contract {
            id: "wr.contracts.report".to_string(),
            schema: json!({"type": "object", "required": ["summary"]}),
        };
        let outcome =
            validate_output_contract(&contract, r#"{"summary": "all good"}"#).unwrap();
        assert!(outcome.report.valid);
        let artifact = outcome.artifact.unwrap();
        assert_eq!(artifact.kind, "wr.contracts.report");
        assert_eq!(artifact.decision, None);
    }

    #[test]
    fn test_uncompilable_contract_schema_is_error() {
        let contract = Contract {
            id: "wr.contracts.broken".to_string(),
            schema: json!({"type": "not-a-type"}),
        };
        let err = validate_output_contract(&contract, "{}").unwrap_err();
        assert!(matches!(err, ValidationError::SchemaCompilationFailed { .. }));
    }
}
