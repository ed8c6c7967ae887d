//! Context budget enforcement.
//!
//! Incoming context must be a plain JSON object within a fixed depth and
//! canonical-size budget. Bounds violations surface as structured
//! validation errors naming the specific reason.

use crate::error::ToolError;
use serde_json::{Value, json};
use wr_core::{CanonicalJsonError, to_canonical_bytes};
use wr_workflow::Context;

/// Maximum nesting depth of a context value.
pub const MAX_CONTEXT_DEPTH: usize = 64;

/// Maximum canonical UTF-8 byte length of a context value.
pub const MAX_CONTEXT_BYTES: usize = 256 * 1024;

/// Validate a submitted context value and return it as a flat object.
pub fn validate_context(value: &Value) -> Result<Context, ToolError> {
    let Some(map) = value.as_object() else {
        return Err(ToolError::validation("context must be a JSON object")
            .with_details(json!({"reason": "not_an_object"})));
    };

    let depth = depth_of(value);
    if depth > MAX_CONTEXT_DEPTH {
        return Err(
            ToolError::validation(format!(
                "context depth {depth} exceeds the limit of {MAX_CONTEXT_DEPTH}"
            ))
            .with_details(json!({
                "reason": "depth_exceeded",
                "depth": depth,
                "maxDepth": MAX_CONTEXT_DEPTH,
            })),
        );
    }

    let bytes = match to_canonical_bytes(value) {
        Ok(bytes) => bytes,
        Err(CanonicalJsonError::NonFiniteNumber) => {
            return Err(
                ToolError::validation("context contains a non-finite number").with_details(
                    json!({"reason": "non_finite_number"}),
                ),
            );
        }
        Err(CanonicalJsonError::Serialize(detail)) => {
            return Err(
                ToolError::validation(format!("context is not plain JSON: {detail}"))
                    .with_details(json!({"reason": "not_plain_json"})),
            );
        }
    };
    if bytes.len() > MAX_CONTEXT_BYTES {
        return Err(
            ToolError::validation(format!(
                "context is {} canonical bytes; the limit is {MAX_CONTEXT_BYTES}",
                bytes.len()
            ))
            .with_details(json!({
                "reason": "size_exceeded",
                "bytes": bytes.len(),
                "maxBytes": MAX_CONTEXT_BYTES,
            })),
        );
    }

    Ok(map.clone())
}

fn depth_of(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(depth_of).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(depth_of).max().unwrap_or(0),
        _ => 1,
    }
}
