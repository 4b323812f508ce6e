//! Arena of the objects a transaction manages.

use crate::error::{CoreError, CoreResult};
use crate::object::state::{ObjectEvent, ObjectState, Transition};
use revtx_model::{ObjectId, Revision, RevisionDelta};
use std::collections::HashMap;

/// Container links saved when an object is detached from its container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ContainerLinks {
    pub(crate) container: Option<ObjectId>,
    pub(crate) feature: Option<String>,
    pub(crate) resource: Option<ObjectId>,
}

impl ContainerLinks {
    pub(crate) fn of(revision: &Revision) -> Self {
        Self {
            container: revision.container(),
            feature: revision.containing_feature().map(str::to_owned),
            resource: revision.resource(),
        }
    }

    pub(crate) fn restore(self, revision: &mut Revision) {
        revision.set_container(self.container, self.feature);
        revision.set_resource(self.resource);
    }
}

/// One object as seen by its transaction.
///
/// Snapshots of this type are handed out by
/// [`Transaction::object`](crate::Transaction::object).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedObject {
    pub(crate) id: ObjectId,
    pub(crate) state: ObjectState,
    pub(crate) conflict: bool,
    pub(crate) revision: Revision,
    pub(crate) remote_revision: Option<Revision>,
    pub(crate) pre_detach_state: Option<ObjectState>,
    pub(crate) detached_links: Option<ContainerLinks>,
    pub(crate) stashed_delta: Option<RevisionDelta>,
}

impl ManagedObject {
    pub(crate) fn new(state: ObjectState, revision: Revision) -> Self {
        Self {
            id: revision.id(),
            state,
            conflict: false,
            revision,
            remote_revision: None,
            pre_detach_state: None,
            detached_links: None,
            stashed_delta: None,
        }
    }

    /// Object identity.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ObjectState {
        self.state
    }

    /// Returns true if a remote change conflicts with local edits.
    #[must_use]
    pub fn has_conflict(&self) -> bool {
        self.conflict
    }

    /// Working revision, including uncommitted edits.
    #[must_use]
    pub fn revision(&self) -> &Revision {
        &self.revision
    }

    /// Remote revision that caused the current conflict, if any.
    #[must_use]
    pub fn remote_revision(&self) -> Option<&Revision> {
        self.remote_revision.as_ref()
    }
}

/// All objects ever registered with one transaction, keyed by ID.
///
/// Detached and transient entries stay in the arena so that a reattach or a
/// rollback can bring them back; only live entries are visible to lookups.
#[derive(Debug, Clone, Default)]
pub(crate) struct ObjectRegistry {
    objects: HashMap<ObjectId, ManagedObject>,
}

impl ObjectRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, object: ManagedObject) -> Option<ManagedObject> {
        self.objects.insert(object.id, object)
    }

    pub(crate) fn get(&self, id: ObjectId) -> Option<&ManagedObject> {
        self.objects.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ObjectId) -> Option<&mut ManagedObject> {
        self.objects.get_mut(&id)
    }

    pub(crate) fn live(&self, id: ObjectId) -> Option<&ManagedObject> {
        self.objects.get(&id).filter(|o| o.state.is_live())
    }

    pub(crate) fn require_live(&self, id: ObjectId) -> CoreResult<&ManagedObject> {
        self.live(id).ok_or(CoreError::ObjectNotFound(id))
    }

    pub(crate) fn require_live_mut(&mut self, id: ObjectId) -> CoreResult<&mut ManagedObject> {
        self.objects
            .get_mut(&id)
            .filter(|o| o.state.is_live())
            .ok_or(CoreError::ObjectNotFound(id))
    }

    pub(crate) fn state_of(&self, id: ObjectId) -> Option<ObjectState> {
        self.objects.get(&id).map(|o| o.state)
    }

    pub(crate) fn is_live(&self, id: ObjectId) -> bool {
        self.live(id).is_some()
    }

    /// Returns true if `id` is known to be gone: detached or transient here.
    pub(crate) fn is_retired(&self, id: ObjectId) -> bool {
        self.objects
            .get(&id)
            .is_some_and(|o| matches!(o.state, ObjectState::Detached | ObjectState::Transient))
    }

    pub(crate) fn remove(&mut self, id: ObjectId) -> Option<ManagedObject> {
        self.objects.remove(&id)
    }

    /// Moves an entry to a new key, rewriting its revision ID.
    pub(crate) fn remap(&mut self, from: ObjectId, to: ObjectId) -> bool {
        match self.objects.remove(&from) {
            Some(mut object) => {
                object.id = to;
                object.revision.set_id(to);
                self.objects.insert(to, object);
                true
            }
            None => false,
        }
    }

    pub(crate) fn live_objects(&self) -> impl Iterator<Item = &ManagedObject> {
        self.objects.values().filter(|o| o.state.is_live())
    }

    /// Every entry, live or not.
    pub(crate) fn all_mut(&mut self) -> impl Iterator<Item = &mut ManagedObject> {
        self.objects.values_mut()
    }

    /// Live objects whose container is `id`, in ID order.
    pub(crate) fn children_of(&self, id: ObjectId) -> Vec<ObjectId> {
        let mut children: Vec<_> = self
            .objects
            .values()
            .filter(|o| o.state.is_live() && o.revision.container() == Some(id))
            .map(|o| o.id)
            .collect();
        children.sort();
        children
    }

    /// Drops every entry that is no longer live.
    pub(crate) fn purge_retired(&mut self) -> usize {
        let before = self.objects.len();
        self.objects.retain(|_, o| o.state.is_live());
        before - self.objects.len()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.objects.values().filter(|o| o.state.is_live()).count()
    }

    /// Feeds `event` to the state machine of `id`.
    ///
    /// Returns the state before the event and the transition taken.
    pub(crate) fn fire(&mut self, id: ObjectId, event: ObjectEvent) -> CoreResult<(ObjectState, Transition)> {
        let object = self
            .objects
            .get_mut(&id)
            .ok_or(CoreError::ObjectNotFound(id))?;
        let before = object.state;
        let transition = before
            .transition(event)
            .ok_or(CoreError::IllegalTransition {
                id,
                state: before,
                event,
            })?;
        match transition {
            Transition::Ignore => {}
            Transition::Enter(state) => object.state = state,
            Transition::Restore => {
                object.state = object.pre_detach_state.take().unwrap_or(ObjectState::Clean);
            }
            Transition::Conflict => object.conflict = true,
        }
        if object.state == ObjectState::Detached && before != ObjectState::Detached {
            object.pre_detach_state = Some(before);
        }
        Ok((before, transition))
    }
}
