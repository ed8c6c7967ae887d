use super::*;
use crate::event::{EventEnvelope, EventScope, NodeKind};
use tempfile::tempdir;
use wr_core::AttemptId as CoreAttemptId;

fn observation(session: &SessionId, index: u64) -> EventEnvelope {
    EventEnvelope::new(
        index,
        session.clone(),
        None,
        format!("observation:{index}"),
        EventBody::ObservationRecorded {
            key: "git.head".to_string(),
            value: serde_json::json!(format!("sha-{index}")),
        },
    )
}

fn observation_plan(session: &SessionId, first: u64, count: u64) -> AppendPlan {
    AppendPlan {
        events: (first..first + count)
            .map(|index| observation(session, index))
            .collect(),
        snapshot_pins: Vec::new(),
    }
}

fn node_created_plan(session: &SessionId, index: u64) -> (AppendPlan, ContentDigest) {
    let snapshot_ref = ContentDigest::of_bytes(format!("snapshot-{index}").as_bytes());
    let run = wr_core::RunId::mint();
    let node = NodeId::mint();
    let event = EventEnvelope::new(
        index,
        session.clone(),
        Some(EventScope::node(run, node.clone())),
        format!("node_created:{node}"),
        EventBody::NodeCreated {
            node_id: node,
            node_kind: NodeKind::Step,
            parent_node_id: None,
            workflow_hash: ContentDigest::of_bytes(b"wf"),
            snapshot_ref,
            attempt_id: CoreAttemptId::mint(),
        },
    );
    let pin = SnapshotPin {
        snapshot_ref,
        event_index: index,
        created_by_event_id: event.event_id.clone(),
    };
    (
        AppendPlan {
            events: vec![event],
            snapshot_pins: vec![pin],
        },
        snapshot_ref,
    )
}

#[test]
fn test_append_then_load_round_trips() {
    let tmp = tempdir().unwrap();
    let session = SessionId::mint();
    let dir = session_dir(tmp.path(), &session);

    let mut witness = open_session_healthy(&dir, &session, "test").unwrap();
    let outcome = witness.append(observation_plan(&session, 0, 3)).unwrap();
    assert_eq!(outcome, AppendOutcome::Committed);
    drop(witness);

    let state = load_session_state(&dir, &session).unwrap();
    assert_eq!(state.next_event_index(), 3);
    let indexes: Vec<u64> = state.events().iter().map(|e| e.event_index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
}

#[test]
fn test_snapshot_pin_recorded_and_loaded() {
    let tmp = tempdir().unwrap();
    let session = SessionId::mint();
    let dir = session_dir(tmp.path(), &session);

    let (plan, snapshot_ref) = node_created_plan(&session, 0);
    let mut witness = open_session_healthy(&dir, &session, "test").unwrap();
    witness.append(plan).unwrap();
    drop(witness);

    let state = load_session_state(&dir, &session).unwrap();
    assert!(state.pinned_snapshots().contains(&snapshot_ref));
}

#[test]
fn test_replay_plan_is_noop() {
    let tmp = tempdir().unwrap();
    let session = SessionId::mint();
    let dir = session_dir(tmp.path(), &session);

    let plan = observation_plan(&session, 0, 2);
    let mut witness = open_session_healthy(&dir, &session, "test").unwrap();
    witness.append(plan.clone()).unwrap();
    let before = witness.state().next_event_index();

    let outcome = witness.append(plan).unwrap();
    assert_eq!(outcome, AppendOutcome::Replayed);
    assert_eq!(witness.state().next_event_index(), before);
    drop(witness);

    // Post-state on disk equals pre-state: still two events, one segment.
    let state = load_session_state(&dir, &session).unwrap();
    assert_eq!(state.next_event_index(), 2);
}

#[test]
fn test_mixed_replay_and_new_is_conflict() {
    let tmp = tempdir().unwrap();
    let session = SessionId::mint();
    let dir = session_dir(tmp.path(), &session);

    let mut witness = open_session_healthy(&dir, &session, "test").unwrap();
    witness.append(observation_plan(&session, 0, 2)).unwrap();

    let mut mixed = observation_plan(&session, 1, 2);
    mixed.events[0] = observation(&session, 1); // already recorded key
    let err = witness.append(mixed).unwrap_err();
    assert!(matches!(err, SessionStoreError::InvariantViolation(_)));
}

#[test]
fn test_non_contiguous_plan_rejected() {
    let tmp = tempdir().unwrap();
    let session = SessionId::mint();
    let dir = session_dir(tmp.path(), &session);

    let mut witness = open_session_healthy(&dir, &session, "test").unwrap();
    let err = witness
        .append(observation_plan(&session, 5, 1))
        .unwrap_err();
    assert!(matches!(err, SessionStoreError::InvariantViolation(_)));
}

#[test]
fn test_snapshot_ref_without_pin_rejected() {
    let tmp = tempdir().unwrap();
    let session = SessionId::mint();
    let dir = session_dir(tmp.path(), &session);

    let (mut plan, _) = node_created_plan(&session, 0);
    plan.snapshot_pins.clear();

    let mut witness = open_session_healthy(&dir, &session, "test").unwrap();
    let err = witness.append(plan).unwrap_err();
    assert!(matches!(err, SessionStoreError::InvariantViolation(_)));
}

#[test]
fn test_crash_between_close_and_pin_is_unhealthy() {
    let tmp = tempdir().unwrap();
    let session = SessionId::mint();
    let dir = session_dir(tmp.path(), &session);

    let (plan, _) = node_created_plan(&session, 0);
    let mut witness = open_session_healthy(&dir, &session, "test").unwrap();
    witness.append(plan).unwrap();
    drop(witness);

    // Drop the trailing snapshot_pinned manifest record, simulating a crash
    // after segment_closed became durable but before the pin did.
    let manifest_path = dir.join("manifest.jsonl");
    let contents = std::fs::read_to_string(&manifest_path).unwrap();
    let mut lines: Vec<&str> = contents.lines().collect();
    assert!(lines.last().unwrap().contains("snapshot_pinned"));
    lines.pop();
    std::fs::write(&manifest_path, format!("{}\n", lines.join("\n"))).unwrap();

    let err = load_session_state(&dir, &session).unwrap_err();
    match err {
        SessionStoreError::CorruptionDetected { location, reason } => {
            assert_eq!(location, CorruptionLocation::Tail);
            assert!(matches!(reason, CorruptionReason::MissingSnapshotPin { .. }));
        }
        other => panic!("expected corruption, got {other}"),
    }
}

#[test]
fn test_orphan_segment_is_ignored() {
    let tmp = tempdir().unwrap();
    let session = SessionId::mint();
    let dir = session_dir(tmp.path(), &session);

    let mut witness = open_session_healthy(&dir, &session, "test").unwrap();
    witness.append(observation_plan(&session, 0, 1)).unwrap();
    drop(witness);

    std::fs::write(dir.join("events").join("99-99.jsonl"), b"garbage\n").unwrap();

    let state = load_session_state(&dir, &session).unwrap();
    assert_eq!(state.next_event_index(), 1);
}

#[test]
fn test_missing_attested_segment_is_corruption() {
    let tmp = tempdir().unwrap();
    let session = SessionId::mint();
    let dir = session_dir(tmp.path(), &session);

    let mut witness = open_session_healthy(&dir, &session, "test").unwrap();
    witness.append(observation_plan(&session, 0, 1)).unwrap();
    drop(witness);

    std::fs::remove_file(dir.join("events").join("0-0.jsonl")).unwrap();

    let err = load_session_state(&dir, &session).unwrap_err();
    assert!(matches!(
        err,
        SessionStoreError::CorruptionDetected {
            reason: CorruptionReason::MissingAttestedSegment { .. },
            ..
        }
    ));
}

#[test]
fn test_tampered_segment_is_hash_mismatch() {
    let tmp = tempdir().unwrap();
    let session = SessionId::mint();
    let dir = session_dir(tmp.path(), &session);

    let mut witness = open_session_healthy(&dir, &session, "test").unwrap();
    witness.append(observation_plan(&session, 0, 1)).unwrap();
    drop(witness);

    let segment_path = dir.join("events").join("0-0.jsonl");
    let mut bytes = std::fs::read(&segment_path).unwrap();
    bytes.extend_from_slice(b" \n");
    std::fs::write(&segment_path, bytes).unwrap();

    let err = load_session_state(&dir, &session).unwrap_err();
    assert!(matches!(
        err,
        SessionStoreError::CorruptionDetected {
            reason: CorruptionReason::SegmentHashMismatch { .. },
            ..
        }
    ));
}

fn write_manifested_segment(dir: &Path, name: &str, segment_bytes: &[u8]) {
    let events_dir = dir.join("events");
    std::fs::create_dir_all(&events_dir).unwrap();
    std::fs::write(events_dir.join(name), segment_bytes).unwrap();
    let record = ManifestRecord::segment_closed(
        name.to_string(),
        segment_bytes.len() as u64,
        segment_sha256(segment_bytes),
    );
    let line = format!("{}\n", serde_json::to_string(&record).unwrap());
    let mut manifest = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("manifest.jsonl"))
        .unwrap();
    std::io::Write::write_all(&mut manifest, line.as_bytes()).unwrap();
}

#[test]
fn test_invalid_event_record_is_schema_validation_failure() {
    let tmp = tempdir().unwrap();
    let session = SessionId::mint();
    let dir = session_dir(tmp.path(), &session);
    std::fs::create_dir_all(&dir).unwrap();

    write_manifested_segment(&dir, "0-0.jsonl", b"{\"v\":1,\"not\":\"an event\"}\n");

    let err = load_session_state(&dir, &session).unwrap_err();
    assert!(matches!(
        err,
        SessionStoreError::CorruptionDetected {
            reason: CorruptionReason::SchemaValidationFailed { .. },
            ..
        }
    ));
}

#[test]
fn test_unknown_event_version_is_distinct_from_schema_failure() {
    let tmp = tempdir().unwrap();
    let session = SessionId::mint();
    let dir = session_dir(tmp.path(), &session);
    std::fs::create_dir_all(&dir).unwrap();

    write_manifested_segment(&dir, "0-0.jsonl", b"{\"v\":9,\"kind\":\"mystery\"}\n");

    let err = load_session_state(&dir, &session).unwrap_err();
    assert!(matches!(
        err,
        SessionStoreError::CorruptionDetected {
            reason: CorruptionReason::UnknownSchemaVersion { version: 9, .. },
            ..
        }
    ));
}

#[test]
fn test_torn_manifest_tail_is_tail_corruption() {
    let tmp = tempdir().unwrap();
    let session = SessionId::mint();
    let dir = session_dir(tmp.path(), &session);

    let mut witness = open_session_healthy(&dir, &session, "test").unwrap();
    witness.append(observation_plan(&session, 0, 1)).unwrap();
    drop(witness);

    let manifest_path = dir.join("manifest.jsonl");
    let mut contents = std::fs::read(&manifest_path).unwrap();
    contents.extend_from_slice(b"{\"v\":1,\"record\":\"segment_clo");
    std::fs::write(&manifest_path, contents).unwrap();

    let err = load_session_state(&dir, &session).unwrap_err();
    match err {
        SessionStoreError::CorruptionDetected { location, reason } => {
            assert_eq!(location, CorruptionLocation::Tail);
            assert!(matches!(
                reason,
                CorruptionReason::ManifestRecordMalformed { .. }
            ));
        }
        other => panic!("expected tail corruption, got {other}"),
    }
}

#[test]
fn test_reentrant_open_is_fatal() {
    let tmp = tempdir().unwrap();
    let session = SessionId::mint();
    let dir = session_dir(tmp.path(), &session);

    let _witness = open_session_healthy(&dir, &session, "first").unwrap();
    let err = open_session_healthy(&dir, &session, "second").unwrap_err();
    assert!(matches!(err, SessionStoreError::LockReentrant(_)));
}

#[test]
fn test_fresh_session_loads_empty() {
    let tmp = tempdir().unwrap();
    let session = SessionId::mint();
    let dir = session_dir(tmp.path(), &session);
    std::fs::create_dir_all(&dir).unwrap();

    let state = load_session_state(&dir, &session).unwrap();
    assert_eq!(state.next_event_index(), 0);
    assert!(state.events().is_empty());
}

#[test]
fn test_list_session_ids_skips_foreign_entries() {
    let tmp = tempdir().unwrap();
    let a = SessionId::mint();
    let b = SessionId::mint();
    std::fs::create_dir_all(session_dir(tmp.path(), &a)).unwrap();
    std::fs::create_dir_all(session_dir(tmp.path(), &b)).unwrap();
    std::fs::create_dir_all(tmp.path().join("sessions").join("not-a-ulid")).unwrap();

    let ids = list_session_ids(tmp.path()).unwrap();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&a));
    assert!(ids.contains(&b));
}

#[test]
fn test_children_and_node_index() {
    let tmp = tempdir().unwrap();
    let session = SessionId::mint();
    let dir = session_dir(tmp.path(), &session);

    let run = wr_core::RunId::mint();
    let parent = NodeId::mint();
    let child = NodeId::mint();
    let snapshot = ContentDigest::of_bytes(b"snap-a");
    let child_snapshot = ContentDigest::of_bytes(b"snap-b");
    let hash = ContentDigest::of_bytes(b"wf");

    let mk_node = |index: u64, node: &NodeId, parent: Option<&NodeId>, snap: ContentDigest| {
        EventEnvelope::new(
            index,
            session.clone(),
            Some(EventScope::node(run.clone(), node.clone())),
            format!("node_created:{node}"),
            EventBody::NodeCreated {
                node_id: node.clone(),
                node_kind: NodeKind::Step,
                parent_node_id: parent.cloned(),
                workflow_hash: hash,
                snapshot_ref: snap,
                attempt_id: CoreAttemptId::mint(),
            },
        )
    };
    let edge = EventEnvelope::new(
        2,
        session.clone(),
        Some(EventScope::run(run.clone())),
        format!("edge:{parent}:{child}"),
        EventBody::EdgeCreated {
            from_node_id: parent.clone(),
            to_node_id: child.clone(),
            cause: crate::event::EdgeCause::AckedStep,
        },
    );

    let events = vec![
        mk_node(0, &parent, None, snapshot),
        mk_node(1, &child, Some(&parent), child_snapshot),
        edge,
    ];
    let pins = events
        .iter()
        .filter_map(|event| {
            event.body.introduced_snapshot_ref().map(|r| SnapshotPin {
                snapshot_ref: *r,
                event_index: event.event_index,
                created_by_event_id: event.event_id.clone(),
            })
        })
        .collect();

    let mut witness = open_session_healthy(&dir, &session, "test").unwrap();
    witness
        .append(AppendPlan {
            events,
            snapshot_pins: pins,
        })
        .unwrap();

    let state = witness.state();
    assert!(state.node_created(&parent).is_some());
    assert_eq!(state.children_of(&parent), &[child.clone()]);
    assert!(state.children_of(&child).is_empty());
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        // Any sequence of valid append batches loads back with eventIndex
        // values [0, 1, .., n-1] contiguously.
        #[test]
        fn appended_batches_load_contiguously(sizes in prop::collection::vec(1_u64..4, 1..4)) {
            let tmp = tempdir().unwrap();
            let session = SessionId::mint();
            let dir = session_dir(tmp.path(), &session);

            let mut next = 0;
            {
                let mut witness = open_session_healthy(&dir, &session, "prop").unwrap();
                for size in &sizes {
                    witness.append(observation_plan(&session, next, *size)).unwrap();
                    next += size;
                }
            }

            let state = load_session_state(&dir, &session).unwrap();
            let indexes: Vec<u64> = state.events().iter().map(|e| e.event_index).collect();
            let expected: Vec<u64> = (0..next).collect();
            prop_assert_eq!(indexes, expected);
        }
    }
}
