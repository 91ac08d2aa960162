use ahash::AHashSet as HashSet;

/// Records which sets and policies changed since the last successful flush.
///
/// A key is in at most one of its upsert/delete pair: marking it for one clears the other, so
/// repeated mutation of a key within a cycle collapses to its latest intent.
#[derive(Debug, Default)]
pub(crate) struct DirtyCache {
    pub(crate) upsert_sets: HashSet<String>,
    pub(crate) delete_sets: HashSet<String>,
    pub(crate) upsert_policies: HashSet<String>,
    pub(crate) delete_policies: HashSet<String>,
}

impl DirtyCache {
    pub(crate) fn upsert_set(&mut self, name: &str) {
        self.delete_sets.remove(name);
        if !self.upsert_sets.contains(name) {
            self.upsert_sets.insert(name.to_string());
        }
    }

    pub(crate) fn delete_set(&mut self, name: &str) {
        self.upsert_sets.remove(name);
        if !self.delete_sets.contains(name) {
            self.delete_sets.insert(name.to_string());
        }
    }

    pub(crate) fn upsert_policy(&mut self, key: &str) {
        self.delete_policies.remove(key);
        if !self.upsert_policies.contains(key) {
            self.upsert_policies.insert(key.to_string());
        }
    }

    pub(crate) fn delete_policy(&mut self, key: &str) {
        self.upsert_policies.remove(key);
        if !self.delete_policies.contains(key) {
            self.delete_policies.insert(key.to_string());
        }
    }

    pub(crate) fn has_contents(&self) -> bool {
        !self.upsert_sets.is_empty()
            || !self.delete_sets.is_empty()
            || !self.upsert_policies.is_empty()
            || !self.delete_policies.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.upsert_sets.clear();
        self.delete_sets.clear();
        self.upsert_policies.clear();
        self.delete_policies.clear();
    }
}
