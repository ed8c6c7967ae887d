//! Execution preferences shared by workflows (recommendations) and sessions
//! (effective values).

use serde::{Deserialize, Serialize};

/// Agent autonomy preference. Ordered from most to least supervised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Autonomy {
    #[default]
    Guided,
    Autonomous,
}

/// Risk appetite preference. Ordered from most to least cautious.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskPolicy {
    #[default]
    Conservative,
    Bold,
}

/// A pair of execution preferences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(default)]
    pub autonomy: Autonomy,

    #[serde(default)]
    pub risk_policy: RiskPolicy,
}

impl Preferences {
    /// Fields where `self` is more permissive than `recommended`.
    pub fn exceeds(&self, recommended: &Preferences) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.autonomy > recommended.autonomy {
            fields.push("autonomy");
        }
        if self.risk_policy > recommended.risk_policy {
            fields.push("riskPolicy");
        }
        fields
    }
}
