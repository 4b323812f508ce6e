//! Branch points and the branch tree.

use crate::error::{ModelError, ModelResult};
use crate::types::{BranchId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A `(branch, timestamp)` coordinate identifying one state of the repository.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct BranchPoint {
    /// The branch.
    pub branch: BranchId,
    /// Time on that branch; unspecified means the branch head.
    pub timestamp: Timestamp,
}

impl BranchPoint {
    /// Creates a branch point.
    #[must_use]
    pub const fn new(branch: BranchId, timestamp: Timestamp) -> Self {
        Self { branch, timestamp }
    }

    /// The moving head of a branch.
    #[must_use]
    pub const fn head(branch: BranchId) -> Self {
        Self::new(branch, Timestamp::UNSPECIFIED)
    }

    /// Returns true if this point follows the branch head.
    #[must_use]
    pub const fn is_head(&self) -> bool {
        !self.timestamp.is_specified()
    }
}

impl fmt::Display for BranchPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.branch, self.timestamp)
    }
}

/// A line of history forked from a base point on its parent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// Branch identity.
    pub id: BranchId,
    /// Human-readable name.
    pub name: String,
    /// Fork point on the parent branch; `None` for the main branch.
    pub base: Option<BranchPoint>,
}

impl Branch {
    /// Returns the parent branch, if any.
    #[must_use]
    pub fn parent(&self) -> Option<BranchId> {
        self.base.map(|b| b.branch)
    }
}

/// The tree of known branches.
///
/// Every branch except [`BranchId::MAIN`] has exactly one parent, fixed by the
/// base point it was created from.
#[derive(Debug, Clone)]
pub struct BranchRegistry {
    branches: BTreeMap<BranchId, Branch>,
    next_id: u32,
}

impl Default for BranchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BranchRegistry {
    /// Creates a registry containing only the main branch.
    #[must_use]
    pub fn new() -> Self {
        let mut branches = BTreeMap::new();
        branches.insert(
            BranchId::MAIN,
            Branch {
                id: BranchId::MAIN,
                name: "MAIN".into(),
                base: None,
            },
        );
        Self {
            branches,
            next_id: 1,
        }
    }

    /// Forks a new branch at `base`.
    pub fn create_branch(&mut self, name: impl Into<String>, base: BranchPoint) -> ModelResult<Branch> {
        if !self.branches.contains_key(&base.branch) {
            return Err(ModelError::UnknownBranch(base.branch.as_u32()));
        }
        let id = BranchId::new(self.next_id);
        self.next_id += 1;
        let branch = Branch {
            id,
            name: name.into(),
            base: Some(base),
        };
        self.branches.insert(id, branch.clone());
        Ok(branch)
    }

    /// Records a branch created elsewhere (e.g. announced by the repository).
    pub fn register(&mut self, branch: Branch) -> ModelResult<()> {
        if let Some(parent) = branch.parent() {
            if !self.branches.contains_key(&parent) {
                return Err(ModelError::UnknownBranch(parent.as_u32()));
            }
        }
        self.next_id = self.next_id.max(branch.id.as_u32() + 1);
        self.branches.insert(branch.id, branch);
        Ok(())
    }

    /// Looks up a branch.
    #[must_use]
    pub fn get(&self, id: BranchId) -> Option<&Branch> {
        self.branches.get(&id)
    }

    /// Returns the chain of branch points from `point` up to the main branch.
    ///
    /// The first element is `point` itself; each following element is the
    /// base point of the previous branch.
    pub fn path_to_root(&self, point: BranchPoint) -> ModelResult<Vec<BranchPoint>> {
        let mut path = vec![point];
        let mut current = point.branch;
        loop {
            let branch = self
                .branches
                .get(&current)
                .ok_or(ModelError::UnknownBranch(current.as_u32()))?;
            match branch.base {
                Some(base) => {
                    path.push(base);
                    current = base.branch;
                }
                None => return Ok(path),
            }
        }
    }

    /// Returns the number of known branches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.branches.len()
    }

    /// Returns true if only the main branch is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.branches.len() <= 1
    }
}
