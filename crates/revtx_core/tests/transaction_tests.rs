//! End-to-end transaction behavior against the in-memory repository.

use revtx_core::{CoreError, ObjectState, Transaction, TransactionConfig};
use revtx_model::{
    BranchId, BranchPoint, FeatureValue, IdAndVersion, Lob, LockType, ObjectId, Timestamp, Version,
};
use revtx_protocol::{CommitTransactionResult, MockSession};
use revtx_testkit::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn transaction(session: &Arc<RepositorySession>) -> Transaction {
    Transaction::with_config(
        session.clone(),
        TransactionConfig::new().session_id(session.session_id()),
    )
}

fn clean_item(id: u64, name: &str) -> revtx_model::Revision {
    let mut revision = item(ObjectId::permanent(id), name);
    revision.set_version(Version::FIRST);
    revision
}

fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn savepoint_scenario_change_set() {
    init_tracing();
    let tx = Transaction::new(Arc::new(MockSession::new()));
    let b = ObjectId::permanent(5);
    tx.load_object(clean_item(5, "b")).unwrap();

    let a = tx.new_object(item_class()).unwrap();
    assert_eq!(a, ObjectId::temp(1));
    tx.set_savepoint().unwrap();
    tx.set(a, "name", "X").unwrap();
    tx.detach(b).unwrap();

    let data = tx.change_set_data().unwrap();
    assert_eq!(data.new_objects.len(), 1);
    assert_eq!(data.new_objects[0].id(), a);
    assert_eq!(data.new_objects[0].get("name"), Some(&FeatureValue::from("X")));
    assert_eq!(data.detached_objects, vec![IdAndVersion::new(b, Version::FIRST)]);
    assert!(!tx.revision_deltas().unwrap().contains_key(&a));
}

#[test]
fn committed_object_is_found_under_its_permanent_id() {
    let session = Arc::new(MockSession::new());
    let tx = Transaction::new(session.clone());
    tx.load_object(clean_item(5, "b")).unwrap();
    let a = tx.new_object(item_class()).unwrap();
    tx.set_savepoint().unwrap();
    tx.set(a, "name", "X").unwrap();
    tx.detach(ObjectId::permanent(5)).unwrap();

    session.set_commit_result(
        CommitTransactionResult::success(BranchPoint::new(BranchId::MAIN, Timestamp::new(20)), Timestamp::new(10))
            .with_mapping(a, ObjectId::permanent(77)),
    );
    let info = tx.commit().unwrap().unwrap();
    assert_eq!(info.id_mappings[&a], ObjectId::permanent(77));

    let committed = tx.object(ObjectId::permanent(77)).unwrap().unwrap();
    assert_eq!(committed.id(), ObjectId::permanent(77));
    assert_eq!(committed.state(), ObjectState::Clean);
    assert_eq!(committed.revision().get("name"), Some(&FeatureValue::from("X")));
    assert!(tx.object(a).unwrap().is_none());
    assert!(tx.object(ObjectId::permanent(5)).unwrap().is_none());
    assert!(!tx.is_dirty().unwrap());
}

#[test]
fn new_object_survives_detach_and_reattach() {
    let tx = Transaction::new(Arc::new(MockSession::new()));
    let kept = tx.new_object(item_class()).unwrap();
    tx.detach(kept).unwrap();
    tx.reattach(kept).unwrap();
    assert!(tx.is_new_object(kept).unwrap());

    let dropped = tx.new_object(item_class()).unwrap();
    tx.detach(dropped).unwrap();
    assert!(!tx.is_new_object(dropped).unwrap());
}

#[test]
fn commit_round_trip_through_repository() {
    let fixture = TestRepository::with_items(1);
    let tx = transaction(&fixture.session);
    let existing = fixture.id(0);
    tx.get_or_load(existing).unwrap();

    let created = tx.new_object(item_class()).unwrap();
    tx.set(created, "name", "fresh").unwrap();
    tx.push(existing, "links", created).unwrap();
    tx.set_commit_comment(Some("link fresh item".into())).unwrap();

    let info = tx.commit().unwrap().unwrap();
    let permanent = info.id_mappings[&created];
    assert!(!permanent.is_temporary());
    assert_eq!(info.comment.as_deref(), Some("link fresh item"));

    let stored = fixture.repository.revision(existing).unwrap();
    assert_eq!(stored.list("links").unwrap(), &[FeatureValue::Ref(permanent)]);
    assert_eq!(stored.version(), Version::new(2));
    let local = tx.object(existing).unwrap().unwrap();
    assert_eq!(local.revision().version(), Version::new(2));
    assert_eq!(local.state(), ObjectState::Clean);
    assert_eq!(
        fixture.repository.revision(permanent).unwrap().get("name"),
        Some(&FeatureValue::from("fresh"))
    );
    assert!(!tx.is_dirty().unwrap());
}

#[test]
fn outdated_commit_is_rejected_and_keeps_changes() {
    let fixture = TestRepository::with_items(1);
    let existing = fixture.id(0);
    let first = transaction(&fixture.session);
    let other = fixture.other_session("bob");
    let second = transaction(&other);
    first.get_or_load(existing).unwrap();
    second.get_or_load(existing).unwrap();

    first.set(existing, "name", "one").unwrap();
    second.set(existing, "name", "two").unwrap();
    first.commit().unwrap();

    let err = second.commit().unwrap_err();
    assert!(err.commit_failure().is_some(), "unexpected error: {err}");
    assert!(second.is_dirty().unwrap());
    assert_eq!(
        fixture.repository.revision(existing).unwrap().get("name"),
        Some(&FeatureValue::from("one"))
    );
}

#[test]
fn partial_commit_sends_only_committables() {
    let fixture = TestRepository::with_items(2);
    let tx = transaction(&fixture.session);
    let (a, b) = (fixture.id(0), fixture.id(1));
    tx.get_or_load(a).unwrap();
    tx.get_or_load(b).unwrap();
    tx.set(a, "size", 1i64).unwrap();
    tx.set(b, "size", 2i64).unwrap();

    tx.set_committables(Some(BTreeSet::from([a]))).unwrap();
    tx.commit().unwrap();

    assert_eq!(fixture.repository.revision(a).unwrap().get("size"), Some(&FeatureValue::Int(1)));
    assert_eq!(fixture.repository.revision(b).unwrap().get("size"), None);
    assert!(tx.is_dirty().unwrap());
    assert_eq!(tx.object(b).unwrap().unwrap().state(), ObjectState::Dirty);

    tx.commit().unwrap();
    assert_eq!(fixture.repository.revision(b).unwrap().get("size"), Some(&FeatureValue::Int(2)));
    assert!(!tx.is_dirty().unwrap());
}

#[test]
fn partial_commit_of_dangling_reference_is_refused() {
    let fixture = TestRepository::with_items(1);
    let tx = transaction(&fixture.session);
    let existing = fixture.id(0);
    tx.get_or_load(existing).unwrap();
    let created = tx.new_object(item_class()).unwrap();
    tx.push(existing, "links", created).unwrap();

    tx.set_committables(Some(BTreeSet::from([existing]))).unwrap();
    let err = tx.commit().unwrap_err();
    assert!(matches!(err, CoreError::IntegrityViolation { .. }), "unexpected error: {err}");
    assert!(err.is_local_validation());
    assert_eq!(fixture.repository.revision(existing).unwrap().version(), Version::FIRST);
}

#[test]
fn lobs_are_uploaded_once() {
    let fixture = TestRepository::with_items(1);
    let tx = transaction(&fixture.session);
    let existing = fixture.id(0);
    tx.get_or_load(existing).unwrap();
    let lob = Lob::blob(vec![7; 64]);
    let lob_id = lob.id();
    tx.set_lob(existing, "payload", lob).unwrap();
    tx.commit().unwrap();
    assert!(fixture.repository.has_lob(lob_id));
}

#[test]
fn write_lock_excludes_other_views() {
    let fixture = TestRepository::with_items(1);
    let existing = fixture.id(0);
    let holder = transaction(&fixture.session);
    let other = fixture.other_session("bob");
    let waiter = transaction(&other);
    holder.get_or_load(existing).unwrap();

    holder.lock_objects(&[existing], LockType::Write, None).unwrap();
    assert_eq!(holder.lock_states().unwrap().len(), 1);

    let err = waiter
        .lock_objects(&[existing], LockType::Write, Some(Duration::from_millis(20)))
        .unwrap_err();
    assert!(matches!(err, CoreError::LockNotGranted { timed_out: true, .. }), "unexpected error: {err}");

    holder.unlock_objects(None).unwrap();
    assert!(holder.lock_states().unwrap().is_empty());
    waiter
        .lock_objects(&[existing], LockType::Write, Some(Duration::from_millis(20)))
        .unwrap();
}

#[test]
fn stale_lock_request_reloads_object() {
    let fixture = TestRepository::with_items(1);
    let existing = fixture.id(0);
    let writer = transaction(&fixture.session);
    let other = fixture.other_session("bob");
    let reader = transaction(&other);
    writer.get_or_load(existing).unwrap();
    reader.get_or_load(existing).unwrap();

    writer.set(existing, "name", "renamed").unwrap();
    writer.commit().unwrap();

    let err = reader.lock_objects(&[existing], LockType::Read, None).unwrap_err();
    assert!(matches!(err, CoreError::LockNotGranted { ref stale, .. } if stale == &vec![existing]));
    let reloaded = reader.object(existing).unwrap().unwrap();
    assert_eq!(reloaded.revision().version(), Version::new(2));
    reader.lock_objects(&[existing], LockType::Read, None).unwrap();
}

#[test]
fn remote_commit_refreshes_clean_objects() {
    let fixture = TestRepository::with_items(1);
    let existing = fixture.id(0);
    let writer = transaction(&fixture.session);
    let other = fixture.other_session("bob");
    let reader = transaction(&other);
    writer.get_or_load(existing).unwrap();
    reader.get_or_load(existing).unwrap();
    reader.enable_remote_invalidation().unwrap();

    writer.set(existing, "name", "remote").unwrap();
    writer.commit().unwrap();

    eventually("remote invalidation", || {
        reader
            .object(existing)
            .unwrap()
            .is_some_and(|o| o.revision().get("name") == Some(&FeatureValue::from("remote")))
    });
    let refreshed = reader.object(existing).unwrap().unwrap();
    assert_eq!(refreshed.state(), ObjectState::Clean);
    assert_eq!(refreshed.revision().version(), Version::new(2));
    assert!(!reader.has_conflict().unwrap());
}

#[test]
fn remote_commit_on_dirty_object_raises_conflict() {
    let fixture = TestRepository::with_items(1);
    let existing = fixture.id(0);
    let writer = transaction(&fixture.session);
    let other = fixture.other_session("bob");
    let reader = transaction(&other);
    writer.get_or_load(existing).unwrap();
    reader.get_or_load(existing).unwrap();
    reader.enable_remote_invalidation().unwrap();
    reader.set(existing, "size", 3i64).unwrap();

    writer.set(existing, "name", "remote").unwrap();
    writer.commit().unwrap();

    eventually("conflict", || reader.has_conflict().unwrap());
    let err = reader.commit().unwrap_err();
    assert!(matches!(err, CoreError::ConflictsPending { count: 1 }), "unexpected error: {err}");

    reader.rollback().unwrap();
    assert!(!reader.is_dirty().unwrap());
    reader.close().unwrap();
    assert!(matches!(reader.is_dirty(), Err(CoreError::TransactionClosed)));
}
