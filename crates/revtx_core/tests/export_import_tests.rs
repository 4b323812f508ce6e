//! Moving pending changes between transactions through a file.

use revtx_core::{CoreError, ExportOptions, Transaction};
use revtx_model::{FeatureValue, IdAndVersion, ObjectId, Revision, Version};
use revtx_protocol::MockSession;
use revtx_testkit::prelude::*;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::sync::Arc;

fn stored(id: u64) -> Revision {
    let mut revision = item(ObjectId::permanent(id), &format!("item{id}"));
    revision.set_version(Version::FIRST);
    revision
}

/// A transaction with two savepoints' worth of edits.
fn edited_source() -> (Transaction, ObjectId) {
    let tx = Transaction::new(Arc::new(MockSession::new()));
    for id in 1..=2 {
        tx.load_object(stored(id)).unwrap();
    }
    let created = tx.new_object(item_class()).unwrap();
    tx.set(created, "name", "alpha").unwrap();
    tx.set(ObjectId::permanent(1), "name", "renamed").unwrap();
    tx.set_savepoint().unwrap();
    tx.set(created, "size", 5i64).unwrap();
    tx.detach(ObjectId::permanent(2)).unwrap();
    (tx, created)
}

fn importer() -> Transaction {
    let session = Arc::new(MockSession::new());
    for id in 1..=2 {
        session.add_revision(stored(id));
    }
    Transaction::new(session)
}

#[test]
fn changes_survive_a_round_trip_through_a_file() {
    init_tracing();
    let scratch = ScratchDir::new();
    let path = scratch.file("changes.bin");
    let (source, _) = edited_source();
    {
        let mut writer = BufWriter::new(File::create(&path).unwrap());
        let records = source.export_changes(&mut writer, ExportOptions::new()).unwrap();
        assert!(records >= 4);
    }

    let target = importer();
    let mut reader = BufReader::new(File::open(&path).unwrap());
    let handles = target.import_changes(&mut reader, false).unwrap();
    assert!(handles.is_empty());

    let data = target.change_set_data().unwrap();
    assert_eq!(data.new_objects.len(), 1);
    let created = &data.new_objects[0];
    assert!(created.id().is_temporary());
    assert_eq!(created.get("name"), Some(&FeatureValue::from("alpha")));
    assert_eq!(created.get("size"), Some(&FeatureValue::Int(5)));
    let changed: Vec<ObjectId> = data.changed_objects.iter().map(|d| d.id()).collect();
    assert_eq!(changed, vec![ObjectId::permanent(1)]);
    assert_eq!(
        data.detached_objects,
        vec![IdAndVersion::new(ObjectId::permanent(2), Version::FIRST)]
    );
    let renamed = target.object(ObjectId::permanent(1)).unwrap().unwrap();
    assert_eq!(renamed.revision().get("name"), Some(&FeatureValue::from("renamed")));
}

#[test]
fn savepoints_can_be_reconstructed() {
    let (source, _) = edited_source();
    let mut out = Vec::new();
    source.export_changes(&mut out, ExportOptions::new()).unwrap();

    let target = importer();
    let handles = target.import_changes(&mut out.as_slice(), true).unwrap();
    assert_eq!(handles.len(), 2);

    target.rollback_to(handles[1]).unwrap();
    let data = target.change_set_data().unwrap();
    assert!(data.detached_objects.is_empty());
    assert_eq!(data.new_objects.len(), 1);
    assert_eq!(data.new_objects[0].get("size"), None);
}

#[test]
fn imported_ids_follow_local_ones() {
    let (source, _) = edited_source();
    let mut out = Vec::new();
    source.export_changes(&mut out, ExportOptions::new()).unwrap();

    let target = importer();
    let local = target.new_object(item_class()).unwrap();
    target.import_changes(&mut out.as_slice(), false).unwrap();
    let ids: Vec<ObjectId> = target
        .change_set_data()
        .unwrap()
        .new_objects
        .iter()
        .map(Revision::id)
        .collect();
    assert!(ids.contains(&local));
    assert!(ids.iter().any(|id| id.temp_value() > local.temp_value()));
}

#[test]
fn dangling_references_can_be_dropped() {
    let tx = Transaction::new(Arc::new(MockSession::new()));
    tx.load_object(stored(1)).unwrap();
    let created = tx.new_object(item_class()).unwrap();
    tx.push(ObjectId::permanent(1), "links", created).unwrap();
    tx.detach(created).unwrap();

    let mut out = Vec::new();
    tx.export_changes(&mut out, ExportOptions::new().resolve_references(true))
        .unwrap();
    let target = importer();
    target.import_changes(&mut out.as_slice(), false).unwrap();
    let holder = target.object(ObjectId::permanent(1)).unwrap().unwrap();
    assert!(holder.revision().list("links").map_or(true, <[FeatureValue]>::is_empty));
}

#[test]
fn malformed_streams_are_rejected() {
    let target = importer();
    for stream in [vec![0, 0], vec![0, 0, 0, 0, 9], vec![0, 0, 0, 0, 1, 0, 0, 0, 1], vec![0, 0, 0, 0]] {
        let err = target.import_changes(&mut stream.as_slice(), false).unwrap_err();
        assert!(matches!(err, CoreError::InvalidFormat { .. }), "unexpected error: {err}");
    }
    assert!(!target.is_dirty().unwrap());
}
