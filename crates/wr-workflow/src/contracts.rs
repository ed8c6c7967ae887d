//! Typed output contracts and the artifacts that satisfy them.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Contract id of the builtin loop-control artifact.
pub const LOOP_CONTROL_CONTRACT: &str = "wr.contracts.loop_control";

/// A registered, machine-checkable schema for step output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub id: String,
    pub schema: Value,
}

/// Registry of contracts known at compile time.
#[derive(Debug, Clone)]
pub struct ContractRegistry {
    contracts: BTreeMap<String, Contract>,
}

impl Default for ContractRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ContractRegistry {
    /// The builtin registry: currently only the loop-control contract.
    pub fn builtin() -> Self {
        let mut contracts = BTreeMap::new();
        contracts.insert(
            LOOP_CONTROL_CONTRACT.to_string(),
            Contract {
                id: LOOP_CONTROL_CONTRACT.to_string(),
                schema: json!({
                    "type": "object",
                    "required": ["decision", "loopId"],
                    "properties": {
                        "decision": {"enum": ["continue", "stop"]},
                        "loopId": {"type": "string"},
                        "reason": {"type": "string"},
                    },
                    "additionalProperties": true,
                }),
            },
        );
        Self { contracts }
    }

    pub fn register(&mut self, contract: Contract) {
        self.contracts.insert(contract.id.clone(), contract);
    }

    pub fn get(&self, id: &str) -> Option<&Contract> {
        self.contracts.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.contracts.contains_key(id)
    }
}

/// A loop continuation decision carried by a loop-control artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopDecision {
    Continue,
    Stop,
}

/// A typed artifact extracted from step output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Contract id this artifact claims to satisfy.
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<LoopDecision>,

    pub data: Value,
}

impl Artifact {
    /// Build a loop-control artifact from validated contract data.
    pub fn loop_control(data: Value) -> Option<Self> {
        let loop_id = data.get("loopId")?.as_str()?.to_string();
        let decision = match data.get("decision")?.as_str()? {
            "continue" => LoopDecision::Continue,
            "stop" => LoopDecision::Stop,
            _ => return None,
        };
        Some(Self {
            kind: LOOP_CONTROL_CONTRACT.to_string(),
            loop_id: Some(loop_id),
            decision: Some(decision),
            data,
        })
    }
}
