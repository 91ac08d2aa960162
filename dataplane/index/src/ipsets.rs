//! The set registry: the canonical cache of every known set, its members and its references.
//!
//! Every mutation auto-creates the sets it names, since membership and policy updates may be
//! observed before the explicit create. Kind checks for an operation run before anything is
//! created or changed, so a rejected operation leaves the registry as it was.

use crate::{
    dirty::DirtyCache,
    error::{Error, Operation, Result},
};
use ahash::AHashMap as HashMap;
use netpol_dataplane_core::{
    ManagedSet, MemberMetadata, MemberRemoval, MemberUpdate, SetKind, SetMetadata,
};
use std::collections::{btree_map, hash_map::Entry};

#[derive(Debug, Default)]
pub(crate) struct SetIndex {
    sets: HashMap<String, ManagedSet>,
}

impl SetIndex {
    pub(crate) fn get(&self, name: &str) -> Option<&ManagedSet> {
        self.sets.get(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.sets.len()
    }

    /// Creates each absent set. Existing sets are left untouched.
    pub(crate) fn create(&mut self, metadatas: &[SetMetadata], dirty: &mut DirtyCache) {
        for metadata in metadatas {
            self.get_or_create(metadata, dirty);
        }
    }

    /// Deletes a set unless it is still referenced by a list or a policy.
    ///
    /// Returns true if the set was removed.
    pub(crate) fn delete(&mut self, metadata: &SetMetadata, dirty: &mut DirtyCache) -> bool {
        let name = metadata.prefixed_name();
        let set = match self.sets.get(&name) {
            Some(set) => set,
            None => {
                tracing::debug!(set = %name, "ipset not found");
                return false;
            }
        };

        if set.has_references() {
            tracing::debug!(
                set = %name,
                references = set.reference_count.get(),
                policies = set.policy_references.len(),
                "ipset is still referenced; not deleting",
            );
            return false;
        }

        if let Some(set) = self.sets.remove(&name) {
            // A deleted list no longer holds its members.
            for member in set.member_sets.keys() {
                if let Some(member_set) = self.sets.get_mut(member) {
                    member_set.remove_reference();
                    dirty.upsert_set(member);
                }
            }
        }
        tracing::debug!(set = %name, "deleted ipset");
        dirty.delete_set(&name);
        true
    }

    pub(crate) fn add_to_sets(
        &mut self,
        metadatas: &[SetMetadata],
        member: &MemberMetadata,
        dirty: &mut DirtyCache,
    ) -> Result<()> {
        self.check_kinds(Operation::AddToSets, metadatas, SetKind::HashSet)?;

        for metadata in metadatas {
            let name = metadata.prefixed_name();
            let set = self.get_or_create(metadata, dirty);
            match set.upsert_member(member) {
                MemberUpdate::Unchanged => continue,
                MemberUpdate::OwnerReplaced { previous } => {
                    tracing::info!(
                        ip = %member.ip,
                        set = %name,
                        old_key = %previous.key,
                        new_key = %member.key,
                        "member owner changed; replacing with the new owner",
                    );
                }
                MemberUpdate::Added | MemberUpdate::Updated => {}
            }
            dirty.upsert_set(&name);
        }

        Ok(())
    }

    pub(crate) fn remove_from_sets(
        &mut self,
        metadatas: &[SetMetadata],
        member: &MemberMetadata,
        dirty: &mut DirtyCache,
    ) -> Result<()> {
        self.check_kinds(Operation::RemoveFromSets, metadatas, SetKind::HashSet)?;

        for metadata in metadatas {
            let name = metadata.prefixed_name();
            let set = self.get_or_create(metadata, dirty);
            match set.remove_member(member) {
                MemberRemoval::Removed => dirty.upsert_set(&name),
                MemberRemoval::Absent => {
                    tracing::debug!(ip = %member.ip, set = %name, "member not found");
                }
                MemberRemoval::OwnedByOther { owner } => {
                    tracing::info!(
                        ip = %member.ip,
                        set = %name,
                        owner = %owner.key,
                        key = %member.key,
                        "member owner changed; ignoring stale removal",
                    );
                }
            }
        }

        Ok(())
    }

    pub(crate) fn add_to_lists(
        &mut self,
        lists: &[SetMetadata],
        members: &[SetMetadata],
        dirty: &mut DirtyCache,
    ) -> Result<()> {
        self.check_list_update(Operation::AddToLists, lists, members)?;
        self.create(lists, dirty);
        self.create(members, dirty);

        for list in lists {
            let list_name = list.prefixed_name();
            for member in members {
                let member_name = member.prefixed_name();
                let linked = match self.sets.get_mut(&list_name) {
                    Some(list) => match list.member_sets.entry(member_name.clone()) {
                        btree_map::Entry::Occupied(_) => false,
                        btree_map::Entry::Vacant(entry) => {
                            entry.insert(member.clone());
                            true
                        }
                    },
                    None => false,
                };
                if !linked {
                    continue;
                }

                if let Some(member_set) = self.sets.get_mut(&member_name) {
                    member_set.add_reference();
                }
                dirty.upsert_set(&member_name);
            }
            dirty.upsert_set(&list_name);
        }

        Ok(())
    }

    pub(crate) fn remove_from_list(
        &mut self,
        list: &SetMetadata,
        members: &[SetMetadata],
        dirty: &mut DirtyCache,
    ) -> Result<()> {
        let lists = std::slice::from_ref(list);
        self.check_list_update(Operation::RemoveFromList, lists, members)?;
        self.create(lists, dirty);
        self.create(members, dirty);

        let list_name = list.prefixed_name();
        for member in members {
            let member_name = member.prefixed_name();
            let unlinked = self
                .sets
                .get_mut(&list_name)
                .map(|list| list.member_sets.remove(&member_name).is_some())
                .unwrap_or(false);
            if !unlinked {
                continue;
            }

            if let Some(member_set) = self.sets.get_mut(&member_name) {
                member_set.remove_reference();
            }
            dirty.upsert_set(&member_name);
        }
        dirty.upsert_set(&list_name);

        Ok(())
    }

    /// Records that `policy_key` mentions each of `metadatas`, creating absent sets.
    pub(crate) fn add_policy_references(
        &mut self,
        policy_key: &str,
        metadatas: &[SetMetadata],
        dirty: &mut DirtyCache,
    ) {
        for metadata in metadatas {
            let name = metadata.prefixed_name();
            if self
                .get_or_create(metadata, dirty)
                .add_policy_reference(policy_key)
            {
                dirty.upsert_set(&name);
            }
        }
    }

    pub(crate) fn remove_policy_references(
        &mut self,
        policy_key: &str,
        metadatas: &[SetMetadata],
        dirty: &mut DirtyCache,
    ) {
        for metadata in metadatas {
            let name = metadata.prefixed_name();
            if let Some(set) = self.sets.get_mut(&name) {
                if set.remove_policy_reference(policy_key) {
                    dirty.upsert_set(&name);
                }
            }
        }
    }

    /// Marks every set for upsert.
    pub(crate) fn mark_all(&self, dirty: &mut DirtyCache) {
        for name in self.sets.keys() {
            dirty.upsert_set(name);
        }
    }

    fn get_or_create(&mut self, metadata: &SetMetadata, dirty: &mut DirtyCache) -> &mut ManagedSet {
        match self.sets.entry(metadata.prefixed_name()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                tracing::debug!(set = %entry.key(), kind = %metadata.kind(), "creating ipset");
                dirty.upsert_set(entry.key());
                entry.insert(ManagedSet::new(metadata.clone()))
            }
        }
    }

    /// The kind a set has, or will have once it is auto-created.
    fn kind_of(&self, metadata: &SetMetadata) -> SetKind {
        self.sets
            .get(&metadata.prefixed_name())
            .map(ManagedSet::kind)
            .unwrap_or_else(|| metadata.kind())
    }

    fn check_kinds(
        &self,
        op: Operation,
        metadatas: &[SetMetadata],
        expected: SetKind,
    ) -> Result<()> {
        for metadata in metadatas {
            if self.kind_of(metadata) != expected {
                return Err(Error::TypeMismatch {
                    op,
                    set: metadata.prefixed_name(),
                    expected,
                });
            }
        }
        Ok(())
    }

    /// Lists must be list sets and their members hash sets; lists of lists are not supported.
    fn check_list_update(
        &self,
        op: Operation,
        lists: &[SetMetadata],
        members: &[SetMetadata],
    ) -> Result<()> {
        self.check_kinds(op, lists, SetKind::ListSet)?;
        self.check_kinds(op, members, SetKind::HashSet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netpol_dataplane_core::SetType;
    use pretty_assertions::assert_eq;

    fn ns(name: &str) -> SetMetadata {
        SetMetadata::namespace(name)
    }

    fn pod(ip: &str, key: &str) -> MemberMetadata {
        MemberMetadata::new(ip, key)
    }

    #[test]
    fn create_is_idempotent() {
        let mut sets = SetIndex::default();
        let mut dirty = DirtyCache::default();

        sets.create(&[ns("a")], &mut dirty);
        sets.add_to_sets(&[ns("a")], &pod("10.0.0.5", "a/pod-1"), &mut dirty)
            .unwrap();
        dirty.clear();

        sets.create(&[ns("a")], &mut dirty);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets.get("ns-a").unwrap().members.len(), 1);
        assert!(!dirty.has_contents());
    }

    #[test]
    fn delete_absent_is_noop() {
        let mut sets = SetIndex::default();
        let mut dirty = DirtyCache::default();
        assert!(!sets.delete(&ns("missing"), &mut dirty));
        assert!(!dirty.has_contents());
    }

    #[test]
    fn add_to_sets_requires_hash_sets() {
        let mut sets = SetIndex::default();
        let mut dirty = DirtyCache::default();

        let err = sets
            .add_to_sets(
                &[ns("a"), SetMetadata::all_namespaces()],
                &pod("10.0.0.5", "a/pod-1"),
                &mut dirty,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TypeMismatch {
                op: Operation::AddToSets,
                expected: SetKind::HashSet,
                ..
            }
        ));

        // Nothing was created, including the valid target that preceded the list.
        assert_eq!(sets.len(), 0);
        assert!(!dirty.has_contents());
    }

    #[test]
    fn remove_from_sets_requires_hash_sets() {
        let mut sets = SetIndex::default();
        let mut dirty = DirtyCache::default();
        let err = sets
            .remove_from_sets(
                &[SetMetadata::all_namespaces()],
                &pod("10.0.0.5", "a/pod-1"),
                &mut dirty,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TypeMismatch {
                op: Operation::RemoveFromSets,
                ..
            }
        ));
        assert_eq!(sets.len(), 0);
    }

    #[test]
    fn add_identical_member_is_not_dirty() {
        let mut sets = SetIndex::default();
        let mut dirty = DirtyCache::default();
        let member = pod("10.0.0.5", "a/pod-1");

        sets.add_to_sets(&[ns("a")], &member, &mut dirty).unwrap();
        dirty.clear();
        sets.add_to_sets(&[ns("a")], &member, &mut dirty).unwrap();
        assert!(!dirty.has_contents());
    }

    #[test]
    fn owner_change_replaces_member() {
        let mut sets = SetIndex::default();
        let mut dirty = DirtyCache::default();

        sets.add_to_sets(&[ns("a")], &pod("10.0.0.5", "a/pod-1"), &mut dirty)
            .unwrap();
        dirty.clear();
        sets.add_to_sets(&[ns("a")], &pod("10.0.0.5", "a/pod-2"), &mut dirty)
            .unwrap();

        assert_eq!(
            sets.get("ns-a").unwrap().members["10.0.0.5"].key,
            "a/pod-2"
        );
        assert!(dirty.upsert_sets.contains("ns-a"));
    }

    #[test]
    fn remove_from_absent_set_creates_it() {
        let mut sets = SetIndex::default();
        let mut dirty = DirtyCache::default();
        sets.remove_from_sets(&[ns("a")], &pod("10.0.0.5", "a/pod-1"), &mut dirty)
            .unwrap();
        assert!(sets.get("ns-a").unwrap().members.is_empty());
        assert!(dirty.upsert_sets.contains("ns-a"));
    }

    #[test]
    fn nested_lists_are_rejected() {
        let mut sets = SetIndex::default();
        let mut dirty = DirtyCache::default();
        let nested = SetMetadata::new("app", SetType::NestedLabelOfPod);

        let err = sets
            .add_to_lists(&[SetMetadata::all_namespaces()], &[nested], &mut dirty)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TypeMismatch {
                op: Operation::AddToLists,
                expected: SetKind::HashSet,
                ..
            }
        ));

        let err = sets
            .add_to_lists(&[ns("a")], &[ns("b")], &mut dirty)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TypeMismatch {
                expected: SetKind::ListSet,
                ..
            }
        ));
        assert_eq!(sets.len(), 0);
    }

    #[test]
    fn list_links_are_counted_once() {
        let mut sets = SetIndex::default();
        let mut dirty = DirtyCache::default();
        let all = SetMetadata::all_namespaces();

        sets.add_to_lists(&[all.clone()], &[ns("a")], &mut dirty)
            .unwrap();
        sets.add_to_lists(&[all.clone()], &[ns("a")], &mut dirty)
            .unwrap();
        assert_eq!(sets.get("ns-a").unwrap().reference_count.get(), 1);
        assert!(sets
            .get("nslabel-all-namespaces")
            .unwrap()
            .member_sets
            .contains_key("ns-a"));

        dirty.clear();
        sets.remove_from_list(&all, &[ns("a")], &mut dirty).unwrap();
        assert!(dirty.upsert_sets.contains("ns-a"));
        assert!(dirty.upsert_sets.contains("nslabel-all-namespaces"));

        dirty.clear();
        sets.remove_from_list(&all, &[ns("a")], &mut dirty).unwrap();
        assert_eq!(sets.get("ns-a").unwrap().reference_count.get(), 0);
        assert!(!dirty.upsert_sets.contains("ns-a"));
    }

    #[test]
    fn deleting_a_list_releases_its_members() {
        let mut sets = SetIndex::default();
        let mut dirty = DirtyCache::default();
        let all = SetMetadata::all_namespaces();

        sets.add_to_lists(&[all.clone()], &[ns("a")], &mut dirty)
            .unwrap();
        dirty.clear();
        assert!(sets.delete(&all, &mut dirty));
        assert_eq!(sets.get("ns-a").unwrap().reference_count.get(), 0);
        assert!(dirty.upsert_sets.contains("ns-a"));
        assert!(dirty.delete_sets.contains("nslabel-all-namespaces"));
        assert!(sets.delete(&ns("a"), &mut dirty));
    }

    #[test]
    fn policy_references_gate_deletion() {
        let mut sets = SetIndex::default();
        let mut dirty = DirtyCache::default();

        sets.add_policy_references("a/deny", &[ns("a")], &mut dirty);
        assert!(!sets.delete(&ns("a"), &mut dirty));

        sets.remove_policy_references("a/deny", &[ns("a")], &mut dirty);
        assert!(sets.delete(&ns("a"), &mut dirty));
        assert!(dirty.delete_sets.contains("ns-a"));
        assert!(!dirty.upsert_sets.contains("ns-a"));
    }
}
