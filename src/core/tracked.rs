use std::{
    collections::BTreeSet,
    sync::{Mutex, MutexGuard},
};

/// Names the supervisor actively polls. Disjoint from the registry: a record can
/// exist without being tracked.
#[derive(Debug, Default)]
pub struct TrackedSet {
    names: Mutex<BTreeSet<String>>,
}

impl TrackedSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn names(&self) -> MutexGuard<'_, BTreeSet<String>> {
        // the set stays consistent even if a holder panicked
        self.names.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false if the name was already tracked.
    pub fn add(&self, name: &str) -> bool {
        self.names().insert(name.to_string())
    }

    /// Returns false if the name was not tracked.
    pub fn remove(&self, name: &str) -> bool {
        self.names().remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().contains(name)
    }

    /// Copy of the current names in sorted order.
    pub fn snapshot(&self) -> Vec<String> {
        self.names().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names().is_empty()
    }
}
