//! Exporting pending changes to a byte stream and importing them into
//! another transaction.
//!
//! Stream layout, big-endian:
//!
//! ```text
//! i32 new-object count (all savepoints)
//! per savepoint:
//!   u8 1
//!   i32 n, n x (i32 len, CBOR Revision)       new objects
//!   i32 n, n x (i32 len, CBOR RevisionDelta)  changed objects
//!   i32 n, n x (i32 len, CBOR IdAndVersion)   detached objects
//! u8 0
//! ```
//!
//! Empty savepoints are skipped. Temporary IDs in the stream are renumbered
//! on import so they never collide with the importer's own.

use super::state::TransactionState;
use super::Transaction;
use crate::error::{CoreError, CoreResult};
use crate::savepoint::SavepointHandle;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use revtx_model::{
    from_cbor, to_cbor, FeatureDelta, FeatureValue, IdAndVersion, IdMapper, ObjectId, ReferenceAdjuster,
    Revision, RevisionDelta,
};
use revtx_protocol::{with_retry, LoadRevisionsRequest};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::{Read, Write};
use tracing::{debug, info};

const SEGMENT: u8 = 1;
const END: u8 = 0;

/// Options for [`Transaction::export_changes`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportOptions {
    /// Drop references to new objects that are not part of the export.
    pub resolve_references: bool,
}

impl ExportOptions {
    /// Creates the default options.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            resolve_references: false,
        }
    }

    /// Sets whether dangling references to new objects are dropped.
    #[must_use]
    pub const fn resolve_references(mut self, value: bool) -> Self {
        self.resolve_references = value;
        self
    }
}

#[derive(Debug, Default)]
struct Segment {
    new_objects: Vec<Revision>,
    changed_objects: Vec<RevisionDelta>,
    detached_objects: Vec<IdAndVersion>,
}

impl Segment {
    fn is_empty(&self) -> bool {
        self.new_objects.is_empty() && self.changed_objects.is_empty() && self.detached_objects.is_empty()
    }
}

impl TransactionState {
    fn export_segments(&self) -> Vec<Segment> {
        let last = self.chain.len() - 1;
        self.chain
            .iter()
            .enumerate()
            .map(|(index, log)| Segment {
                new_objects: log
                    .new_objects
                    .iter()
                    .filter_map(|id| {
                        if index < last {
                            log.base_new_objects.get(id).cloned()
                        } else {
                            self.objects.live(*id).map(|o| o.revision.clone())
                        }
                    })
                    .collect(),
                changed_objects: log
                    .revision_deltas
                    .values()
                    .filter(|d| !d.is_empty())
                    .cloned()
                    .collect(),
                detached_objects: log
                    .detached_objects
                    .iter()
                    .map(|id| IdAndVersion::new(*id, self.detached_version(*id)))
                    .collect(),
            })
            .filter(|segment| !segment.is_empty())
            .collect()
    }
}

impl Transaction {
    /// Writes the pending changes, savepoint by savepoint, to `writer`.
    ///
    /// Returns the number of records written.
    pub fn export_changes(&self, writer: &mut impl Write, options: ExportOptions) -> CoreResult<usize> {
        let mut segments = self.with_state(|state| Ok(state.export_segments()))?;

        if options.resolve_references {
            let exported: BTreeSet<ObjectId> = segments
                .iter()
                .flat_map(|s| s.new_objects.iter().map(Revision::id))
                .collect();
            let dangling = |id: ObjectId| id.is_temporary() && !exported.contains(&id);
            for segment in &mut segments {
                for revision in &mut segment.new_objects {
                    revision.remove_references(dangling);
                }
                for delta in &mut segment.changed_objects {
                    *delta = without_references(delta, &dangling);
                }
            }
        }

        let total: usize = segments.iter().map(|s| s.new_objects.len()).sum();
        let mut buf = BytesMut::new();
        buf.put_i32(count(total)?);
        let mut records = 0;
        for segment in &segments {
            buf.put_u8(SEGMENT);
            records += put_records(&mut buf, &segment.new_objects)?;
            records += put_records(&mut buf, &segment.changed_objects)?;
            records += put_records(&mut buf, &segment.detached_objects)?;
        }
        buf.put_u8(END);
        writer.write_all(&buf)?;
        writer.flush()?;

        info!(transaction = %self.id(), segments = segments.len(), records, "exported changes");
        Ok(records)
    }

    /// Reads changes written by [`export_changes`](Self::export_changes) and
    /// replays them as edits of this transaction.
    ///
    /// With `reconstruct_savepoints`, a savepoint is set before each
    /// exported savepoint is replayed; the handles are returned. Objects a
    /// delta refers to are loaded first if this transaction does not have
    /// them.
    pub fn import_changes(&self, reader: &mut impl Read, reconstruct_savepoints: bool) -> CoreResult<Vec<SavepointHandle>> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;
        let (total, segments) = decode(Bytes::from(raw))?;
        let imported_new: usize = segments.iter().map(|s| s.new_objects.len()).sum();
        if imported_new > total {
            return Err(CoreError::invalid_format(format!(
                "header announces {total} new objects, stream holds {imported_new}"
            )));
        }

        let wanted: BTreeSet<ObjectId> = segments
            .iter()
            .flat_map(|s| {
                s.changed_objects
                    .iter()
                    .map(RevisionDelta::id)
                    .chain(s.detached_objects.iter().map(|d| d.id))
            })
            .filter(|id| !id.is_temporary())
            .collect();
        let (missing, point) = self.with_state(|state| {
            let missing: Vec<ObjectId> = wanted
                .iter()
                .copied()
                .filter(|id| state.objects.get(*id).is_none())
                .collect();
            Ok((missing, state.branch_point))
        })?;
        let loaded = if missing.is_empty() {
            Vec::new()
        } else {
            let request = LoadRevisionsRequest::new(missing, point);
            with_retry(&self.config().retry, || self.session().load_revisions(&request))?
        };

        self.with_state(|state| {
            state.check_writable()?;
            for revision in loaded {
                state.load_object(revision)?;
            }

            let mut mapper = IdMapper::new();
            let start = state.ids.last();
            state.ids.reserve(count(total)? as u32);
            let mut next = start;
            for revision in segments.iter().flat_map(|s| s.new_objects.iter()) {
                if revision.id().is_temporary() {
                    next += 1;
                    mapper.insert(revision.id(), ObjectId::temp(next));
                }
            }

            let mut handles = Vec::new();
            for segment in segments {
                if reconstruct_savepoints {
                    handles.push(state.set_savepoint());
                }
                state.import_segment(segment, &mapper)?;
            }
            debug!(transaction = %state.id, renumbered = mapper.mappings().len(), "imported changes");
            Ok(handles)
        })
    }
}

impl TransactionState {
    fn import_segment(&mut self, segment: Segment, mapper: &IdMapper) -> CoreResult<()> {
        for mut revision in segment.new_objects {
            revision.set_id(mapper.adjust(revision.id()));
            revision.adjust_references(mapper);
            self.attach_new(revision)?;
        }

        for mut delta in segment.changed_objects {
            delta.set_id(mapper.adjust(delta.id()));
            delta.adjust_references(mapper);
            let id = delta.id();
            let local = self.objects.require_live(id)?;
            let outdated = !id.is_temporary() && delta.version() < local.revision.version();
            let mut goal = local.revision.clone();
            self.merge_delta(&mut goal, &delta)?;
            self.replace_revision(id, goal)?;
            if outdated {
                self.set_conflict(id);
            }
        }

        for detached in segment.detached_objects {
            let id = mapper.adjust(detached.id);
            if self.objects.is_live(id) {
                self.detach(id)?;
            }
        }
        Ok(())
    }
}

fn without_references(delta: &RevisionDelta, dangling: &impl Fn(ObjectId) -> bool) -> RevisionDelta {
    let mut kept = RevisionDelta::new(delta.id(), delta.branch(), delta.version());
    for change in delta.feature_deltas() {
        match change {
            FeatureDelta::List { changes, .. } => {
                for inner in changes.iter().filter(|c| !mentions(c, dangling)) {
                    kept.add_feature_delta(inner.clone());
                }
            }
            other if !mentions(other, dangling) => kept.add_feature_delta(other.clone()),
            _ => {}
        }
    }
    kept
}

fn mentions(change: &FeatureDelta, dangling: &impl Fn(ObjectId) -> bool) -> bool {
    let value_mentions = |value: &FeatureValue| {
        let mut hit = false;
        value.for_each_id(&mut |id| hit |= dangling(id));
        hit
    };
    match change {
        FeatureDelta::Set { value, .. }
        | FeatureDelta::Add { value, .. }
        | FeatureDelta::Remove { value, .. }
        | FeatureDelta::Move { value, .. } => value_mentions(value),
        FeatureDelta::Container {
            container, resource, ..
        } => container.is_some_and(dangling) || resource.is_some_and(dangling),
        FeatureDelta::List { changes, .. } => changes.iter().any(|c| mentions(c, dangling)),
        FeatureDelta::Unset { .. } | FeatureDelta::Clear { .. } => false,
    }
}

fn count(n: usize) -> CoreResult<i32> {
    i32::try_from(n).map_err(|_| CoreError::invalid_format(format!("{n} records do not fit the stream")))
}

fn put_records<T: Serialize>(buf: &mut BytesMut, records: &[T]) -> CoreResult<usize> {
    buf.put_i32(count(records.len())?);
    for record in records {
        let bytes = to_cbor(record)?;
        buf.put_i32(count(bytes.len())?);
        buf.put_slice(&bytes);
    }
    Ok(records.len())
}

fn decode(mut buf: Bytes) -> CoreResult<(usize, Vec<Segment>)> {
    let total = get_count(&mut buf)?;
    let mut segments = Vec::new();
    loop {
        if !buf.has_remaining() {
            return Err(CoreError::invalid_format("missing end marker"));
        }
        match buf.get_u8() {
            END => break,
            SEGMENT => segments.push(Segment {
                new_objects: get_records(&mut buf)?,
                changed_objects: get_records(&mut buf)?,
                detached_objects: get_records(&mut buf)?,
            }),
            other => {
                return Err(CoreError::invalid_format(format!("unexpected marker {other}")));
            }
        }
    }
    if buf.has_remaining() {
        return Err(CoreError::invalid_format(format!(
            "{} trailing bytes after end marker",
            buf.remaining()
        )));
    }
    Ok((total, segments))
}

fn get_count(buf: &mut Bytes) -> CoreResult<usize> {
    if buf.remaining() < 4 {
        return Err(CoreError::invalid_format("truncated length"));
    }
    let value = buf.get_i32();
    usize::try_from(value).map_err(|_| CoreError::invalid_format(format!("negative length {value}")))
}

fn get_records<T: DeserializeOwned>(buf: &mut Bytes) -> CoreResult<Vec<T>> {
    let n = get_count(buf)?;
    let mut records = Vec::with_capacity(n.min(1024));
    for _ in 0..n {
        let len = get_count(buf)?;
        if buf.remaining() < len {
            return Err(CoreError::invalid_format(format!(
                "record of {len} bytes, {} left",
                buf.remaining()
            )));
        }
        let bytes = buf.split_to(len);
        records.push(from_cbor(&bytes).map_err(|err| CoreError::invalid_format(err.to_string()))?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use revtx_model::{BranchId, ClassInfo, FeatureInfo, Version};
    use revtx_protocol::MockSession;
    use std::sync::Arc;

    fn class() -> Arc<ClassInfo> {
        Arc::new(
            ClassInfo::new("shop", "Folder")
                .with_feature(FeatureInfo::attribute("name"))
                .with_feature(FeatureInfo::references("links")),
        )
    }

    fn persisted(id: u64) -> Revision {
        let mut revision = Revision::new(ObjectId::permanent(id), class(), BranchId::MAIN);
        revision.set_version(Version::FIRST);
        revision
    }

    #[test]
    fn empty_transaction_exports_header_only() {
        let tx = Transaction::new(Arc::new(MockSession::new()));
        let mut out = Vec::new();
        assert_eq!(tx.export_changes(&mut out, ExportOptions::new()).unwrap(), 0);
        assert_eq!(out, vec![0, 0, 0, 0, END]);
    }

    #[test]
    fn import_renumbers_past_local_ids() {
        let source = Transaction::new(Arc::new(MockSession::new()));
        let a = source.new_object(class()).unwrap();
        source.set(a, "name", "imported").unwrap();
        let mut out = Vec::new();
        source.export_changes(&mut out, ExportOptions::new()).unwrap();

        let target = Transaction::new(Arc::new(MockSession::new()));
        let local = target.new_object(class()).unwrap();
        target.import_changes(&mut out.as_slice(), false).unwrap();

        assert_eq!(local, ObjectId::temp(1));
        let imported = target.object(ObjectId::temp(2)).unwrap().unwrap();
        assert_eq!(imported.revision().get("name"), Some(&FeatureValue::from("imported")));
        assert_eq!(target.new_object(class()).unwrap(), ObjectId::temp(3));
    }

    #[test]
    fn savepoints_are_reconstructed() {
        let session = Arc::new(MockSession::new());
        session.add_revision(persisted(5));
        let source = Transaction::new(session.clone());
        source.load_object(persisted(5)).unwrap();
        source.set(ObjectId::permanent(5), "name", "first").unwrap();
        source.set_savepoint().unwrap();
        source.new_object(class()).unwrap();
        let mut out = Vec::new();
        source.export_changes(&mut out, ExportOptions::new()).unwrap();

        let target = Transaction::new(session);
        let handles = target.import_changes(&mut out.as_slice(), true).unwrap();
        assert_eq!(handles.len(), 2);
        let object = target.object(ObjectId::permanent(5)).unwrap().unwrap();
        assert_eq!(object.revision().get("name"), Some(&FeatureValue::from("first")));

        target.rollback_to(handles[1]).unwrap();
        assert_eq!(target.change_set_data().unwrap().new_objects.len(), 0);
        assert_eq!(target.change_set_data().unwrap().changed_objects.len(), 1);
    }

    #[test]
    fn dangling_references_can_be_dropped() {
        let delta = {
            let mut delta = RevisionDelta::new(ObjectId::permanent(1), BranchId::MAIN, Version::FIRST);
            delta.add_feature_delta(FeatureDelta::Add {
                feature: "links".into(),
                index: 0,
                value: FeatureValue::Ref(ObjectId::temp(9)),
            });
            delta.add_feature_delta(FeatureDelta::Set {
                feature: "name".into(),
                value: "kept".into(),
                old_value: None,
            });
            delta
        };
        let stripped = without_references(&delta, &|id: ObjectId| id == ObjectId::temp(9));
        assert_eq!(stripped.feature_deltas().len(), 1);
        assert_eq!(stripped.feature_deltas()[0].feature(), "name");
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let tx = Transaction::new(Arc::new(MockSession::new()));
        let err = tx.import_changes(&mut [0u8, 0, 0, 1, SEGMENT, 0].as_slice(), false).unwrap_err();
        assert!(matches!(err, CoreError::InvalidFormat { .. }));
        let err = tx.import_changes(&mut [0u8, 0, 0, 0, 7].as_slice(), false).unwrap_err();
        assert!(err.to_string().contains("unexpected marker"));
    }
}
