//! Distributed commits across sessions and repositories.

use revtx_core::{
    CoreError, ParallelExecutor, Transaction, TransactionConfig, TransactionId, XaConfig, XaTransaction,
};
use revtx_model::{FeatureValue, ObjectId, Version};
use revtx_protocol::{CommitInfo, ProtocolError, SessionConfig};
use revtx_testkit::prelude::*;
use std::sync::Arc;

struct Participant {
    session: Arc<RepositorySession>,
    faults: Arc<FaultySession>,
    tx: Transaction,
}

fn participants(fixture: &TestRepository, count: usize) -> Vec<Participant> {
    (0..count)
        .map(|i| {
            let settings = SessionConfig::new(format!("user{i}"), fixture.repository.name());
            let session = fixture.other_session(&settings.user_id);
            let faults = Arc::new(FaultySession::new(session.clone()));
            let tx = Transaction::with_config(
                faults.clone(),
                TransactionConfig::from(&settings).session_id(session.session_id()),
            );
            Participant { session, faults, tx }
        })
        .collect()
}

fn edit(fixture: &TestRepository, participant: &Participant, index: usize) -> ObjectId {
    let existing = fixture.id(index);
    participant.tx.get_or_load(existing).unwrap();
    participant.tx.set(existing, "name", format!("edited{index}")).unwrap();
    let created = participant.tx.new_object(item_class()).unwrap();
    participant.tx.set(created, "owner", existing).unwrap();
    created
}

fn mapped(infos: &[(TransactionId, CommitInfo)], transaction: &Transaction, id: ObjectId) -> ObjectId {
    infos
        .iter()
        .find(|(owner, _)| *owner == transaction.id())
        .map(|(_, info)| info.id_mappings[&id])
        .unwrap()
}

#[test]
fn cross_repository_reference_is_resolved() {
    init_tracing();
    let left = TestRepository::with_items(0);
    let right = TestRepository::with_items(0);
    let a = Transaction::with_config(
        left.session.clone(),
        TransactionConfig::new().session_id(left.session.session_id()),
    );
    let b = Transaction::with_config(
        right.session.clone(),
        TransactionConfig::new().session_id(right.session.session_id()),
    );
    let xa = XaTransaction::new(XaConfig::new());
    xa.add(&a).unwrap();
    xa.add(&b).unwrap();

    let target = a.new_object(item_class()).unwrap();
    a.set(target, "name", "target").unwrap();
    let source = b.new_object(item_class()).unwrap();
    b.set(source, "owner", target).unwrap();

    let infos = xa.commit().unwrap();
    assert_eq!(infos.len(), 2);
    let target_id = infos
        .iter()
        .find(|(id, _)| *id == a.id())
        .map(|(_, info)| info.id_mappings[&target])
        .unwrap();
    let source_id = infos
        .iter()
        .find(|(id, _)| *id == b.id())
        .map(|(_, info)| info.id_mappings[&source])
        .unwrap();

    let stored = right.repository.revision(source_id).unwrap();
    assert_eq!(stored.get("owner"), Some(&FeatureValue::Ref(target_id)));
    let local = b.object(source_id).unwrap().unwrap();
    assert_eq!(local.revision().get("owner"), Some(&FeatureValue::Ref(target_id)));
    assert!(left.repository.revision(target_id).is_some());
    assert!(!a.is_dirty().unwrap());
    assert!(!b.is_dirty().unwrap());
}

#[test]
fn phase_one_rejection_cancels_every_participant() {
    for failing in 0..3 {
        let fixture = TestRepository::with_items(3);
        let group = participants(&fixture, 3);
        let xa = XaTransaction::new(XaConfig::new());
        for (i, participant) in group.iter().enumerate() {
            xa.add(&participant.tx).unwrap();
            edit(&fixture, participant, i);
        }
        group[failing].faults.reject(Call::XaPhase1, "validation failed");

        let err = xa.commit().unwrap_err();
        match &err {
            CoreError::Xa { phase, transaction, .. } => {
                assert_eq!(*phase, 1);
                assert_eq!(*transaction, group[failing].tx.id());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.commit_failure().is_some());

        for participant in &group {
            assert_eq!(participant.faults.count(Call::XaPhase3), 0);
            assert_eq!(participant.faults.count(Call::XaCancel), 1);
            assert!(!fixture
                .repository
                .is_prepared(participant.session.session_id(), participant.tx.id().as_u32()));
            assert!(participant.tx.is_dirty().unwrap());
        }
        assert_eq!(fixture.repository.object_count(), 3);
        for i in 0..3 {
            assert_eq!(fixture.repository.revision(fixture.id(i)).unwrap().version(), Version::FIRST);
        }

        let infos = xa.commit().unwrap();
        assert_eq!(infos.len(), 3);
        assert_eq!(fixture.repository.object_count(), 6);
        for participant in &group {
            assert!(!participant.tx.is_dirty().unwrap());
        }
    }
}

#[test]
fn phase_two_failure_leaves_repository_untouched() {
    let fixture = TestRepository::with_items(2);
    let group = participants(&fixture, 2);
    let xa = XaTransaction::new(XaConfig::new());
    for (i, participant) in group.iter().enumerate() {
        xa.add(&participant.tx).unwrap();
        edit(&fixture, participant, i);
    }
    group[1]
        .faults
        .fail(Call::XaPhase2, revtx_protocol::ProtocolError::transport_fatal("link down"));

    let err = xa.commit().unwrap_err();
    assert!(matches!(err, CoreError::Xa { phase: 2, .. }), "unexpected error: {err}");
    for participant in &group {
        assert_eq!(participant.faults.count(Call::XaCancel), 1);
        assert!(participant.tx.is_dirty().unwrap());
    }
    assert_eq!(fixture.repository.object_count(), 2);
}

#[test]
fn phase_three_failure_only_cancels_the_failing_participant() {
    let fixture = TestRepository::with_items(2);
    let group = participants(&fixture, 2);
    let xa = XaTransaction::new(XaConfig::new());
    for (i, participant) in group.iter().enumerate() {
        xa.add(&participant.tx).unwrap();
        edit(&fixture, participant, i);
    }
    group[0]
        .faults
        .fail(Call::XaPhase3, ProtocolError::transport_fatal("link down"));

    let err = xa.commit().unwrap_err();
    match &err {
        CoreError::Xa { phase, transaction, .. } => {
            assert_eq!(*phase, 3);
            assert_eq!(*transaction, group[0].tx.id());
        }
        other => panic!("unexpected error: {other}"),
    }

    let (failed, finished) = (&group[0], &group[1]);
    assert_eq!(failed.faults.count(Call::XaCancel), 1);
    assert!(!fixture
        .repository
        .is_prepared(failed.session.session_id(), failed.tx.id().as_u32()));
    assert!(failed.tx.is_dirty().unwrap());
    assert_eq!(fixture.repository.revision(fixture.id(0)).unwrap().version(), Version::FIRST);

    assert_eq!(finished.faults.count(Call::XaPhase3), 1);
    assert_eq!(finished.faults.count(Call::XaCancel), 0);
    assert!(!fixture
        .repository
        .is_prepared(finished.session.session_id(), finished.tx.id().as_u32()));
    assert!(!finished.tx.is_dirty().unwrap());
    assert_eq!(
        fixture.repository.revision(fixture.id(1)).unwrap().get("name"),
        Some(&FeatureValue::from("edited1"))
    );

    finished.tx.new_object(item_class()).unwrap();
    failed.tx.rollback().unwrap();
    assert!(!failed.tx.is_dirty().unwrap());
}

#[test]
fn cross_references_resolve_in_every_round() {
    let fixture = TestRepository::with_items(0);
    let group = participants(&fixture, 2);
    let (a, b) = (&group[0].tx, &group[1].tx);
    let xa = XaTransaction::new(XaConfig::new());
    xa.add(a).unwrap();
    xa.add(b).unwrap();

    for round in 0..3 {
        let target = a.new_object(item_class()).unwrap();
        a.set(target, "name", format!("target{round}")).unwrap();
        let own = b.new_object(item_class()).unwrap();
        let source = b.new_object(item_class()).unwrap();
        b.set(source, "owner", target).unwrap();
        assert_ne!(own, target, "round {round}");

        let infos = xa.commit().unwrap();
        let target_id = mapped(&infos, a, target);
        let own_id = mapped(&infos, b, own);
        let stored = fixture.repository.revision(mapped(&infos, b, source)).unwrap();
        assert_eq!(stored.get("owner"), Some(&FeatureValue::Ref(target_id)), "round {round}");
        assert_ne!(target_id, own_id);
    }
    assert_eq!(fixture.repository.object_count(), 9);
}

#[test]
fn parallel_executor_commits_all_participants() {
    let fixture = TestRepository::with_items(3);
    let group = participants(&fixture, 3);
    let xa = XaTransaction::new(XaConfig::new().executor(Arc::new(ParallelExecutor)));
    let mut created = Vec::new();
    for (i, participant) in group.iter().enumerate() {
        xa.add(&participant.tx).unwrap();
        created.push(edit(&fixture, participant, i));
    }

    let infos = xa.commit().unwrap();
    assert_eq!(infos.len(), 3);
    for (i, participant) in group.iter().enumerate() {
        let info = infos
            .iter()
            .find(|(id, _)| *id == participant.tx.id())
            .map(|(_, info)| info)
            .unwrap();
        let permanent = info.id_mappings[&created[i]];
        let stored = fixture.repository.revision(permanent).unwrap();
        assert_eq!(stored.get("owner"), Some(&FeatureValue::Ref(fixture.id(i))));
        assert_eq!(
            fixture.repository.revision(fixture.id(i)).unwrap().get("name"),
            Some(&FeatureValue::from(format!("edited{i}")))
        );
    }
}

#[test]
fn parallel_phase_one_failure_cancels_prepared_participants() {
    let fixture = TestRepository::with_items(3);
    let group = participants(&fixture, 3);
    let xa = XaTransaction::new(XaConfig::new().executor(Arc::new(ParallelExecutor)));
    for (i, participant) in group.iter().enumerate() {
        xa.add(&participant.tx).unwrap();
        edit(&fixture, participant, i);
    }
    group[2].faults.reject(Call::XaPhase1, "quota exceeded");

    assert!(xa.commit().is_err());
    for participant in &group {
        assert_eq!(participant.faults.count(Call::XaPhase1), 1);
        assert_eq!(participant.faults.count(Call::XaCancel), 1);
        assert!(!fixture
            .repository
            .is_prepared(participant.session.session_id(), participant.tx.id().as_u32()));
    }
    assert_eq!(fixture.repository.object_count(), 3);
}

#[test]
fn xa_savepoint_rolls_back_every_participant() {
    let fixture = TestRepository::with_items(2);
    let group = participants(&fixture, 2);
    let xa = XaTransaction::new(XaConfig::new());
    for participant in &group {
        xa.add(&participant.tx).unwrap();
    }
    for (i, participant) in group.iter().enumerate() {
        participant.tx.get_or_load(fixture.id(i)).unwrap();
        participant.tx.set(fixture.id(i), "size", 1i64).unwrap();
    }
    let savepoint = xa.set_savepoint().unwrap();
    for (i, participant) in group.iter().enumerate() {
        participant.tx.set(fixture.id(i), "size", 2i64).unwrap();
    }

    xa.rollback_to(savepoint).unwrap();
    for (i, participant) in group.iter().enumerate() {
        let object = participant.tx.object(fixture.id(i)).unwrap().unwrap();
        assert_eq!(object.revision().get("size"), Some(&FeatureValue::Int(1)));
    }

    xa.rollback().unwrap();
    for participant in &group {
        assert!(!participant.tx.is_dirty().unwrap());
    }
}
