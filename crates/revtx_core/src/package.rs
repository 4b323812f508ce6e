//! Package units known to a transaction.

use revtx_model::ClassInfo;
use revtx_protocol::{PackageState, PackageUnit};
use std::collections::BTreeMap;

/// Tracks which packages the repository already knows.
///
/// Packages of loaded objects are known; a package first seen on a new
/// object is sent with the next commit and marked loaded once it succeeds.
#[derive(Debug, Clone, Default)]
pub(crate) struct PackageRegistry {
    states: BTreeMap<String, PackageState>,
}

impl PackageRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records the package of an object loaded from the repository.
    pub(crate) fn register_loaded(&mut self, class: &ClassInfo) {
        self.states
            .insert(class.package.clone(), PackageState::Loaded);
    }

    /// Records the package of a new object unless it is already known.
    pub(crate) fn register_new(&mut self, class: &ClassInfo) {
        self.states
            .entry(class.package.clone())
            .or_insert(PackageState::New);
    }

    pub(crate) fn state(&self, uri: &str) -> Option<PackageState> {
        self.states.get(uri).copied()
    }

    /// Units that still have to be sent, in URI order.
    pub(crate) fn new_units(&self) -> Vec<PackageUnit> {
        self.states
            .iter()
            .filter(|(_, state)| **state == PackageState::New)
            .map(|(uri, state)| PackageUnit {
                uri: uri.clone(),
                state: *state,
            })
            .collect()
    }

    pub(crate) fn mark_loaded(&mut self, units: &[PackageUnit]) {
        for unit in units {
            self.states.insert(unit.uri.clone(), PackageState::Loaded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_packages_are_sent_once() {
        let mut packages = PackageRegistry::new();
        packages.register_new(&ClassInfo::new("shop", "Order"));
        packages.register_new(&ClassInfo::new("shop", "Line"));
        packages.register_loaded(&ClassInfo::new("base", "Folder"));

        let units = packages.new_units();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].uri, "shop");

        packages.mark_loaded(&units);
        assert!(packages.new_units().is_empty());
        assert_eq!(packages.state("shop"), Some(PackageState::Loaded));
    }

    #[test]
    fn loaded_package_is_never_new() {
        let mut packages = PackageRegistry::new();
        packages.register_loaded(&ClassInfo::new("shop", "Order"));
        packages.register_new(&ClassInfo::new("shop", "Line"));
        assert!(packages.new_units().is_empty());
    }
}
