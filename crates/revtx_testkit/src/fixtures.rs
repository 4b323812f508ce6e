//! Test fixtures: a small schema, seeded repositories and scratch files.

use crate::repository::{InMemoryRepository, RepositorySession};
use revtx_model::{BranchId, ClassInfo, FeatureInfo, FeatureValue, ObjectId, Revision};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Installs a test-friendly tracing subscriber once per process.
///
/// The filter comes from `RUST_LOG`, defaulting to `warn`.
pub fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// The class every fixture object uses.
///
/// Features: `name`, `size` and `payload` attributes, `links` (many
/// references), `owner` (single reference) and `children` (containment).
pub fn item_class() -> Arc<ClassInfo> {
    static CLASS: OnceLock<Arc<ClassInfo>> = OnceLock::new();
    Arc::clone(CLASS.get_or_init(|| {
        Arc::new(
            ClassInfo::new("catalog", "Item")
                .with_feature(FeatureInfo::attribute("name"))
                .with_feature(FeatureInfo::attribute("size"))
                .with_feature(FeatureInfo::attribute("payload"))
                .with_feature(FeatureInfo::references("links"))
                .with_feature(FeatureInfo::reference("owner"))
                .with_feature(FeatureInfo::contents("children")),
        )
    }))
}

/// A revision of [`item_class`] named `name`.
pub fn item(id: ObjectId, name: &str) -> Revision {
    let mut revision = Revision::new(id, item_class(), BranchId::MAIN);
    revision
        .set("name", FeatureValue::from(name))
        .expect("item class has a name feature");
    revision
}

/// A repository with one open session and `count` committed items.
pub struct TestRepository {
    /// The repository.
    pub repository: Arc<InMemoryRepository>,
    /// A session on it.
    pub session: Arc<RepositorySession>,
    /// The seeded items, with permanent IDs.
    pub items: Vec<Revision>,
}

impl TestRepository {
    /// Seeds `count` items named `item0`, `item1`, ...
    pub fn with_items(count: usize) -> Self {
        let repository = InMemoryRepository::new("test");
        let items = (0..count)
            .map(|i| repository.seed(item(ObjectId::temp(1), &format!("item{i}"))))
            .collect();
        let session = repository.open_session("tester");
        Self {
            repository,
            session,
            items,
        }
    }

    /// Permanent ID of the seeded item at `index`.
    #[must_use]
    pub fn id(&self, index: usize) -> ObjectId {
        self.items[index].id()
    }

    /// Opens another session on the same repository.
    pub fn other_session(&self, user_id: &str) -> Arc<RepositorySession> {
        self.repository.open_session(user_id)
    }
}

/// A scratch directory that lives as long as the value.
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    /// Creates a fresh directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Path of `name` inside the directory.
    #[must_use]
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

impl Default for ScratchDir {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_items_get_distinct_permanent_ids() {
        let fixture = TestRepository::with_items(3);
        assert_eq!(fixture.items.len(), 3);
        assert!(!fixture.id(0).is_temporary());
        assert_ne!(fixture.id(0), fixture.id(1));
        assert_eq!(fixture.repository.object_count(), 3);
        assert_eq!(
            fixture.repository.revision(fixture.id(2)).unwrap().get("name"),
            Some(&FeatureValue::from("item2"))
        );
    }

    #[test]
    fn scratch_files_live_in_the_directory() {
        let scratch = ScratchDir::new();
        let path = scratch.file("changes.bin");
        std::fs::write(&path, b"x").unwrap();
        assert!(path.exists());
    }
}
