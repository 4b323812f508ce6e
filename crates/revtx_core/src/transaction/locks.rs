//! Explicit object locks.

use super::Transaction;
use crate::error::{CoreError, CoreResult};
use crate::object::ObjectState;
use revtx_model::{IdAndVersion, LockOwner, LockState, LockTarget, LockType, ObjectId, Revision};
use revtx_protocol::{with_retry, LoadRevisionsRequest, LockObjectsRequest, UnlockObjectsRequest};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

impl Transaction {
    /// The lock owner this transaction acts as.
    #[must_use]
    pub fn lock_owner(&self) -> LockOwner {
        LockOwner::new(self.config().session_id, self.id().as_u32())
    }

    /// Locks `ids`.
    ///
    /// New objects are locked locally; their lock states travel with the
    /// commit. If the repository reports stale versions, those objects are
    /// reloaded and the call fails with [`CoreError::LockNotGranted`].
    pub fn lock_objects(&self, ids: &[ObjectId], lock_type: LockType, timeout: Option<Duration>) -> CoreResult<()> {
        let config = self.config();
        let owner = self.lock_owner();
        let request = self.with_state(|state| {
            let mut targets = Vec::new();
            for id in ids {
                if id.is_temporary() {
                    state.objects.require_live(*id)?;
                    let target = LockTarget::for_object(*id, state.branch_point.branch, config.supports_branching);
                    let lock = state
                        .lock_states
                        .entry(*id)
                        .or_insert_with(|| LockState::new(target));
                    lock.add_owner(lock_type, owner.clone());
                } else {
                    let version = state
                        .objects
                        .live(*id)
                        .map(|o| o.revision.version())
                        .unwrap_or_default();
                    targets.push(IdAndVersion::new(*id, version));
                }
            }
            Ok(LockObjectsRequest {
                view_id: state.id.as_u32(),
                branch_point: state.branch_point,
                targets,
                lock_type,
                recursive: false,
                timeout: timeout.unwrap_or(config.lock_timeout),
                wait_for_update: false,
            })
        })?;
        if request.targets.is_empty() {
            return Ok(());
        }

        let result = self
            .session()
            .lock_objects(&request)
            .map_err(CoreError::from_lock_error)?;
        if !result.successful {
            let stale: Vec<ObjectId> = result.stale_revisions.iter().map(|s| s.id).collect();
            if !stale.is_empty() {
                self.reload_stale(&stale)?;
            }
            info!(transaction = %self.id(), timed_out = result.timed_out, stale = stale.len(), "lock not granted");
            return Err(CoreError::LockNotGranted {
                timed_out: result.timed_out,
                stale,
            });
        }

        self.with_state(|state| {
            merge_lock_states(&mut state.lock_states, result.new_lock_states);
            debug!(transaction = %state.id, held = state.lock_states.len(), "locks granted");
            Ok(())
        })
    }

    /// Releases locks on `ids`, or every lock of the transaction for `None`.
    pub fn unlock_objects(&self, ids: Option<&[ObjectId]>) -> CoreResult<()> {
        let request = UnlockObjectsRequest {
            targets: ids.map(|ids| ids.iter().copied().filter(|id| !id.is_temporary()).collect()),
            ..UnlockObjectsRequest::all(self.id().as_u32())
        };
        let result = self
            .session()
            .unlock_objects(&request)
            .map_err(CoreError::from_lock_error)?;

        self.with_state(|state| {
            match ids {
                None => state.lock_states.clear(),
                Some(ids) => {
                    for id in ids {
                        state.lock_states.remove(id);
                    }
                }
            }
            merge_lock_states(&mut state.lock_states, result.new_lock_states);
            debug!(transaction = %state.id, held = state.lock_states.len(), "locks released");
            Ok(())
        })
    }

    fn reload_stale(&self, ids: &[ObjectId]) -> CoreResult<()> {
        let point = self.with_state(|state| Ok(state.branch_point))?;
        let request = LoadRevisionsRequest::new(ids.to_vec(), point);
        let revisions: Vec<Revision> =
            with_retry(&self.config().retry, || self.session().load_revisions(&request))?;

        self.with_state(|state| {
            for revision in revisions {
                let id = revision.id();
                match state.objects.state_of(id) {
                    Some(ObjectState::Clean) => {
                        if let Some(object) = state.objects.get_mut(id) {
                            object.revision = revision;
                        }
                    }
                    Some(ObjectState::Dirty) => {
                        if let Some(object) = state.objects.get_mut(id) {
                            object.remote_revision = Some(revision);
                        }
                        state.set_conflict(id);
                    }
                    _ => {}
                }
            }
            Ok(())
        })
    }
}

fn merge_lock_states(held: &mut HashMap<ObjectId, LockState>, states: Vec<LockState>) {
    for lock in states {
        let id = lock.target().id();
        if lock.is_unlocked() {
            held.remove(&id);
        } else {
            held.insert(id, lock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revtx_model::{BranchId, ClassInfo, FeatureInfo, Timestamp, Version};
    use revtx_protocol::{LockObjectsResult, MockSession, ProtocolError};
    use std::sync::Arc;

    fn class() -> Arc<ClassInfo> {
        Arc::new(ClassInfo::new("shop", "Item").with_feature(FeatureInfo::attribute("name")))
    }

    fn revision(id: u64, version: u32) -> Revision {
        let mut revision = Revision::new(ObjectId::permanent(id), class(), BranchId::MAIN);
        revision.set_version(Version::new(version));
        revision
    }

    fn granted(tx: &Transaction, id: ObjectId) -> LockObjectsResult {
        let mut lock = LockState::new(LockTarget::for_object(id, BranchId::MAIN, true));
        lock.add_owner(LockType::Write, tx.lock_owner());
        LockObjectsResult::granted(vec![lock], Timestamp::new(5))
    }

    #[test]
    fn granted_locks_are_recorded() {
        let session = Arc::new(MockSession::new());
        let tx = Transaction::new(session.clone());
        let id = ObjectId::permanent(3);
        tx.load_object(revision(3, 1)).unwrap();
        session.set_lock_result(granted(&tx, id));

        tx.lock_objects(&[id], LockType::Write, None).unwrap();
        let locks = tx.lock_states().unwrap();
        assert_eq!(locks.len(), 1);
        assert!(locks[0].is_locked_by(LockType::Write, &tx.lock_owner()));

        tx.unlock_objects(None).unwrap();
        assert!(tx.lock_states().unwrap().is_empty());
    }

    #[test]
    fn stale_objects_are_reloaded() {
        let session = Arc::new(MockSession::new());
        let tx = Transaction::new(session.clone());
        let id = ObjectId::permanent(3);
        tx.load_object(revision(3, 1)).unwrap();
        session.add_revision(revision(3, 2));
        session.set_lock_result(LockObjectsResult::stale(vec![IdAndVersion::new(id, Version::FIRST)]));

        let err = tx.lock_objects(&[id], LockType::Write, None).unwrap_err();
        match err {
            CoreError::LockNotGranted { timed_out, stale } => {
                assert!(!timed_out);
                assert_eq!(stale, vec![id]);
            }
            other => panic!("unexpected error: {other}"),
        }
        let object = tx.object(id).unwrap().unwrap();
        assert_eq!(object.revision().version(), Version::new(2));
    }

    #[test]
    fn new_objects_are_locked_locally() {
        let session = Arc::new(MockSession::new());
        let tx = Transaction::new(session.clone());
        let id = tx.new_object(class()).unwrap();

        tx.lock_objects(&[id], LockType::Write, None).unwrap();
        assert!(!session.calls().iter().any(|c| c == "lock_objects"));
        let context = tx.commit_context().unwrap().unwrap();
        let request = context.request(tx.config());
        assert_eq!(request.locks_on_new_objects.len(), 1);
    }

    #[test]
    fn transport_errors_stay_protocol_errors() {
        let session = Arc::new(MockSession::new());
        let tx = Transaction::new(session.clone());
        session.set_connected(false);
        let err = tx
            .lock_objects(&[ObjectId::permanent(1)], LockType::Read, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::Protocol(ProtocolError::NotConnected)));
    }
}
