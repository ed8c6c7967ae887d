//! Validation of step output against criteria and typed contracts.
//!
//! Three criteria forms are accepted: a single rule object, a list of rules
//! (legacy), or an `and`/`or`/`not` composition. Rules may carry a
//! `condition` gating their evaluation against current context. Failures
//! are data (`valid: false` plus issues), never errors; errors are reserved
//! for malformed criteria.

pub mod contract;
pub mod rules;

pub use contract::{ContractOutcome, validate_output_contract};
pub use rules::{ValidationError, ValidationReport, evaluate_criteria};
