//! Integrity check for partial commits.
//!
//! A partial commit must not leave the repository with a half-applied
//! change: a committed new object whose container stays behind, a moved
//! object without its old container, and so on. Only objects the
//! transaction itself changed can be missing; everything else is already
//! in the repository.

use super::context::CommitContext;
use crate::config::IntegrityStyle;
use crate::error::{CoreError, CoreResult};
use crate::transaction::state::TransactionState;
use revtx_model::{FeatureDelta, ObjectId};
use std::collections::BTreeSet;
use tracing::debug;

struct Checker<'a> {
    context: &'a CommitContext,
    pending: BTreeSet<ObjectId>,
    style: IntegrityStyle,
    missing: Vec<(ObjectId, String)>,
}

impl Checker<'_> {
    fn require(&mut self, id: ObjectId, role: impl FnOnce() -> String) -> CoreResult<()> {
        if !self.pending.contains(&id) || self.context.includes(id) {
            return Ok(());
        }
        let role = role();
        if self.style == IntegrityStyle::ExceptionFast {
            return Err(CoreError::integrity_violation(
                format!("{id} is required as {role} but is not part of the commit"),
                vec![id],
            ));
        }
        if !self.missing.iter().any(|(m, _)| *m == id) {
            self.missing.push((id, role));
        }
        Ok(())
    }
}

/// Checks that `context` can be committed on its own.
pub(crate) fn check(state: &TransactionState, context: &CommitContext, style: IntegrityStyle) -> CoreResult<()> {
    let mut pending = state.chain.all_new_objects();
    pending.extend(state.chain.all_dirty_objects());
    pending.extend(state.chain.all_detached_objects());
    pending.extend(state.chain.all_revision_deltas().into_keys());
    let mut checker = Checker {
        context,
        pending,
        style,
        missing: Vec::new(),
    };

    for (id, revision) in context.new_objects() {
        if let Some(container) = revision.container_or_resource() {
            checker.require(container, || format!("container of new object {id}"))?;
        }
        let mut targets = Vec::new();
        revision.for_each_reference(|feature, target| targets.push((feature.to_owned(), target)));
        for (feature, target) in targets {
            checker.require(target, || format!("target of reference '{feature}' of new object {id}"))?;
        }
    }

    for (id, delta) in context.revision_deltas() {
        let clean = state.clean_revisions.get(id);
        for change in delta.feature_deltas() {
            match change {
                FeatureDelta::Container {
                    container, resource, ..
                } => {
                    if let Some(former) = clean.and_then(|c| c.container_or_resource()) {
                        checker.require(former, || format!("former container of moved object {id}"))?;
                    }
                    if let Some(target) = container.or(*resource) {
                        checker.require(target, || format!("container of moved object {id}"))?;
                    }
                }
                FeatureDelta::Set { feature, value, .. } => {
                    if let Some(target) = value.as_id() {
                        checker.require(target, || format!("target of reference '{feature}' of {id}"))?;
                    }
                }
                FeatureDelta::List { feature, changes } => {
                    let containment = state
                        .objects
                        .get(*id)
                        .and_then(|o| o.revision.feature_info(feature).ok())
                        .is_some_and(|info| info.is_containment());
                    for change in changes {
                        check_list_change(&mut checker, *id, feature, containment, change)?;
                    }
                }
                _ => {}
            }
        }
    }

    for id in context.detached_objects().keys() {
        let former = state
            .clean_revisions
            .get(id)
            .or_else(|| state.objects.get(*id).map(|o| o.revision()))
            .and_then(|r| r.container_or_resource());
        if let Some(former) = former {
            checker.require(former, || format!("former container of detached object {id}"))?;
        }
    }

    if checker.missing.is_empty() {
        return Ok(());
    }
    let message = checker
        .missing
        .iter()
        .map(|(id, role)| format!("{id} ({role})"))
        .collect::<Vec<_>>()
        .join(", ");
    debug!(transaction = %state.id, missing = checker.missing.len(), "partial commit is incomplete");
    Err(CoreError::integrity_violation(
        format!("objects missing from partial commit: {message}"),
        checker.missing.into_iter().map(|(id, _)| id).collect(),
    ))
}

fn check_list_change(
    checker: &mut Checker<'_>,
    owner: ObjectId,
    feature: &str,
    containment: bool,
    change: &FeatureDelta,
) -> CoreResult<()> {
    match change {
        FeatureDelta::Add { value, .. } => {
            if let Some(target) = value.as_id() {
                if containment {
                    checker.require(target, || format!("added child of {owner}"))?;
                } else {
                    checker.require(target, || format!("refTarget of '{feature}' of {owner}"))?;
                }
            }
        }
        FeatureDelta::Remove { value, .. } if containment => {
            if let Some(target) = value.as_id() {
                checker.require(target, || format!("removed child of {owner}"))?;
            }
        }
        _ => {}
    }
    Ok(())
}
