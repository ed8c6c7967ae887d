//! Read-only session resume ranking.

use crate::error::ToolError;
use crate::orchestrator::{Orchestrator, node_view};
use crate::ports::WorkspaceSnapshot;
use crate::projection::{last_note, latest_node, observations};
use crate::response::ResumeCandidate;
use serde_json::Value;
use std::cmp::Reverse;
use std::path::Path;
use wr_store::{EventBody, list_session_ids, load_session_state, session_dir};
use wr_token::StatePayload;

/// Upper bound on returned candidates.
pub const MAX_RESUME_CANDIDATES: usize = 5;

impl Orchestrator {
    /// Rank candidate sessions for resumption. Pure query: takes no locks
    /// and writes nothing.
    ///
    /// Tiers: (1) exact git HEAD match, (2) branch match, (3) query match
    /// against recent notes, (4) query match against the workflow id,
    /// (5) recency. Ties break by most-recent event index, then session id.
    pub fn resume_session(
        &self,
        workspace_path: Option<&Path>,
        query: Option<&str>,
    ) -> Result<Vec<ResumeCandidate>, ToolError> {
        let workspace = workspace_path
            .map(|path| self.workspace.snapshot(path))
            .unwrap_or_default();

        let mut ranked: Vec<(u8, Reverse<u64>, Reverse<String>, ResumeCandidate)> = Vec::new();
        for session_id in list_session_ids(&self.data_dir)? {
            let path = session_dir(&self.data_dir, &session_id);
            let log = match load_session_state(&path, &session_id) {
                Ok(log) => log,
                Err(err) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %err,
                        "skipping unloadable session during resume ranking"
                    );
                    continue;
                }
            };

            let Some((_, run_event)) = log.latest_run() else {
                continue;
            };
            let EventBody::RunStarted { workflow_id, .. } = &run_event.body else {
                continue;
            };
            let workflow_id = workflow_id.clone();

            let Some(tip_event) = latest_node(&log) else {
                continue;
            };
            let tip_id = match &tip_event.body {
                EventBody::NodeCreated { node_id, .. } => node_id.clone(),
                _ => continue,
            };
            let Some(tip) = node_view(&log, &tip_id) else {
                continue;
            };

            let recorded = observations(&log);
            let note = last_note(&log).map(str::to_string);
            let tier = rank_tier(&workspace, &recorded, query, note.as_deref(), &workflow_id);

            let state_token = self.tokens.sign_state(&StatePayload {
                session_id: session_id.clone(),
                run_id: tip.run_id.clone(),
                node_id: tip.node_id.clone(),
                workflow_hash_ref: tip.workflow_hash.hash_ref(),
            });

            let max_index = log.next_event_index().saturating_sub(1);
            ranked.push((
                tier,
                Reverse(max_index),
                Reverse(session_id.as_str().to_string()),
                ResumeCandidate {
                    state_token,
                    workflow_id,
                    notes: note,
                    rank: tier,
                },
            ));
        }

        ranked.sort_by(|a, b| (a.0, &a.1, &a.2).cmp(&(b.0, &b.1, &b.2)));
        Ok(ranked
            .into_iter()
            .take(MAX_RESUME_CANDIDATES)
            .map(|(_, _, _, candidate)| candidate)
            .collect())
    }
}

fn rank_tier(
    workspace: &WorkspaceSnapshot,
    recorded: &std::collections::BTreeMap<String, Value>,
    query: Option<&str>,
    note: Option<&str>,
    workflow_id: &str,
) -> u8 {
    let recorded_head = recorded.get("git.head").and_then(Value::as_str);
    let recorded_branch = recorded.get("git.branch").and_then(Value::as_str);

    if let (Some(current), Some(recorded)) = (workspace.head.as_deref(), recorded_head) {
        if current == recorded {
            return 1;
        }
    }
    if let (Some(current), Some(recorded)) = (workspace.branch.as_deref(), recorded_branch) {
        if current == recorded || current.starts_with(recorded) || recorded.starts_with(current) {
            return 2;
        }
    }
    if let Some(query) = query {
        let query_lower = query.to_lowercase();
        if note
            .map(|note| note.to_lowercase().contains(&query_lower))
            .unwrap_or(false)
        {
            return 3;
        }
        if workflow_id.to_lowercase().contains(&query_lower) {
            return 4;
        }
    }
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn recorded(head: Option<&str>, branch: Option<&str>) -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        if let Some(head) = head {
            map.insert("git.head".to_string(), json!(head));
        }
        if let Some(branch) = branch {
            map.insert("git.branch".to_string(), json!(branch));
        }
        map
    }

    fn workspace(head: &str, branch: &str) -> WorkspaceSnapshot {
        WorkspaceSnapshot {
            head: Some(head.to_string()),
            branch: Some(branch.to_string()),
        }
    }

    #[test]
    fn test_head_match_is_tier_one() {
        let tier = rank_tier(
            &workspace("abc", "main"),
            &recorded(Some("abc"), Some("other")),
            None,
            None,
            "wf",
        );
        assert_eq!(tier, 1);
    }

    #[test]
    fn test_branch_match_is_tier_two() {
        let tier = rank_tier(
            &workspace("abc", "feature/login"),
            &recorded(Some("zzz"), Some("feature/login")),
            None,
            None,
            "wf",
        );
        assert_eq!(tier, 2);
    }

    #[test]
    fn test_branch_prefix_matches() {
        let tier = rank_tier(
            &workspace("abc", "feature/login-retries"),
            &recorded(None, Some("feature/login")),
            None,
            None,
            "wf",
        );
        assert_eq!(tier, 2);
    }

    #[test]
    fn test_note_query_is_tier_three() {
        let tier = rank_tier(
            &WorkspaceSnapshot::default(),
            &recorded(None, None),
            Some("flaky test"),
            Some("Investigating the FLAKY TEST in ci"),
            "wf",
        );
        assert_eq!(tier, 3);
    }

    #[test]
    fn test_workflow_id_query_is_tier_four() {
        let tier = rank_tier(
            &WorkspaceSnapshot::default(),
            &recorded(None, None),
            Some("release"),
            Some("unrelated note"),
            "release-train",
        );
        assert_eq!(tier, 4);
    }

    #[test]
    fn test_recency_fallback_is_tier_five() {
        let tier = rank_tier(
            &WorkspaceSnapshot::default(),
            &recorded(None, None),
            None,
            None,
            "wf",
        );
        assert_eq!(tier, 5);
    }
}
