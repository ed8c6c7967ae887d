//! Read-side projections over a loaded session log.

use serde_json::Value;
use std::collections::BTreeMap;
use wr_core::{NodeId, Preferences};
use wr_store::{EventBody, EventEnvelope, SessionLogState};
use wr_workflow::Context;

/// Effective context: shallow merge of every `context_set` patch in order.
pub fn effective_context(state: &SessionLogState) -> Context {
    let mut merged = Context::new();
    for event in state.events() {
        if let EventBody::ContextSet { patch } = &event.body {
            if let Value::Object(map) = patch {
                for (key, value) in map {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
    }
    merged
}

/// Effective preferences: the latest `preferences_changed`, defaults first.
pub fn effective_preferences(state: &SessionLogState) -> Preferences {
    state
        .events()
        .iter()
        .rev()
        .find_map(|event| match &event.body {
            EventBody::PreferencesChanged { preferences } => Some(*preferences),
            _ => None,
        })
        .unwrap_or_default()
}

/// Latest-wins observations (`observation_recorded`) keyed by name.
pub fn observations(state: &SessionLogState) -> BTreeMap<String, Value> {
    let mut merged = BTreeMap::new();
    for event in state.events() {
        if let EventBody::ObservationRecorded { key, value } = &event.body {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Per-node capability state from `capability_observed`, latest-wins by
/// event index.
pub fn capabilities_by_node(
    state: &SessionLogState,
) -> BTreeMap<NodeId, BTreeMap<String, Value>> {
    let mut merged: BTreeMap<NodeId, BTreeMap<String, Value>> = BTreeMap::new();
    for event in state.events() {
        if let EventBody::CapabilityObserved { name, value } = &event.body {
            let Some(node_id) = event.scope.as_ref().and_then(|s| s.node_id.clone()) else {
                continue;
            };
            merged
                .entry(node_id)
                .or_default()
                .insert(name.clone(), value.clone());
        }
    }
    merged
}

/// The most recent note appended anywhere in the session.
pub fn last_note(state: &SessionLogState) -> Option<&str> {
    state.events().iter().rev().find_map(|event| match &event.body {
        EventBody::NodeOutputAppended { markdown } => Some(markdown.as_str()),
        _ => None,
    })
}

/// The most recently created node: the resume tip.
pub fn latest_node(state: &SessionLogState) -> Option<&EventEnvelope> {
    state.events().iter().rev().find(|event| {
        matches!(event.body, EventBody::NodeCreated { .. })
    })
}
