use crate::{
    dirty::DirtyCache,
    error::{Error, Result},
    ipsets::SetIndex,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use netpol_dataplane_core::{validate, NetworkPolicy, SetMetadata};

/// The canonical cache of network policies, by policy key.
#[derive(Debug, Default)]
pub(crate) struct PolicyIndex {
    policies: HashMap<String, NetworkPolicy>,
}

impl PolicyIndex {
    pub(crate) fn exists(&self, key: &str) -> bool {
        self.policies.contains_key(key)
    }

    pub(crate) fn get(&self, key: &str) -> Option<&NetworkPolicy> {
        self.policies.get(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.policies.len()
    }

    /// Normalizes and validates a policy before it may be stored.
    pub(crate) fn prepare(mut policy: NetworkPolicy) -> Result<NetworkPolicy> {
        policy.normalize();
        validate(&policy).map_err(|issues| Error::MalformedPolicy {
            key: policy.policy_key.clone(),
            issues,
        })?;
        Ok(policy)
    }

    /// Stores a prepared policy, replacing any prior version, and links it to the sets it uses.
    pub(crate) fn apply(
        &mut self,
        policy: NetworkPolicy,
        sets: &mut SetIndex,
        dirty: &mut DirtyCache,
    ) {
        let key = policy.policy_key.clone();
        let referenced = policy.referenced_sets();
        sets.add_policy_references(&key, &referenced, dirty);

        if let Some(prior) = self.policies.insert(key.clone(), policy) {
            let current = referenced
                .iter()
                .map(SetMetadata::prefixed_name)
                .collect::<HashSet<_>>();
            let released = prior
                .referenced_sets()
                .into_iter()
                .filter(|set| !current.contains(&set.prefixed_name()))
                .collect::<Vec<_>>();
            sets.remove_policy_references(&key, &released, dirty);
        }

        tracing::debug!(policy = %key, sets = referenced.len(), "applied policy");
        dirty.upsert_policy(&key);
    }

    /// Removes a policy and releases its set references. Returns the removed policy, if any.
    ///
    /// The policy is marked for deletion even if it was unknown so that the enforcement agent
    /// converges on its absence.
    pub(crate) fn remove(
        &mut self,
        key: &str,
        sets: &mut SetIndex,
        dirty: &mut DirtyCache,
    ) -> Option<NetworkPolicy> {
        let removed = self.policies.remove(key);
        match &removed {
            Some(policy) => {
                sets.remove_policy_references(key, &policy.referenced_sets(), dirty);
                tracing::debug!(policy = %key, "removed policy");
            }
            None => tracing::debug!(policy = %key, "policy not found"),
        }
        dirty.delete_policy(key);
        removed
    }

    /// Marks every policy for upsert.
    pub(crate) fn mark_all(&self, dirty: &mut DirtyCache) {
        for key in self.policies.keys() {
            dirty.upsert_policy(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netpol_dataplane_core::{
        AclPolicy, Direction, MatchType, PolicyIssue, Ports, Protocol, SetInfo, SetType, Verdict,
    };
    use pretty_assertions::assert_eq;

    fn label(name: &str) -> SetMetadata {
        SetMetadata::new(name, SetType::KeyValueLabelOfPod)
    }

    fn allow_from(key: &str, from: &str) -> NetworkPolicy {
        let mut acl = AclPolicy::new(format!("{key}-ingress"), Verdict::Allowed, Direction::Ingress);
        acl.src_list = vec![SetInfo::new(label(from), true, MatchType::Src)];
        let mut policy = NetworkPolicy::new(key, key);
        policy.pod_selectors = vec![SetInfo::new(label("app:db"), true, MatchType::Dst)];
        policy.acls.push(acl);
        policy
    }

    #[test]
    fn prepare_normalizes() {
        let mut policy = allow_from("ns/db", "app:web");
        policy.acls[0].protocol = Protocol::Tcp;
        policy.acls[0].dst_ports = Ports {
            port: 5432,
            end_port: 0,
        };
        let policy = PolicyIndex::prepare(policy).unwrap();
        assert_eq!(policy.acls[0].dst_ports.end_port, 5432);
    }

    #[test]
    fn prepare_rejects_malformed() {
        let mut policy = allow_from("ns/db", "app:web");
        policy.acls[0].dst_ports = Ports {
            port: 5432,
            end_port: 5432,
        };
        match PolicyIndex::prepare(policy) {
            Err(Error::MalformedPolicy { key, issues }) => {
                assert_eq!(key, "ns/db");
                assert_eq!(
                    issues,
                    vec![PolicyIssue::PortsWithoutProtocol {
                        acl: 0,
                        protocol: Protocol::Any
                    }]
                );
            }
            res => panic!("unexpected result: {res:?}"),
        }
    }

    #[test]
    fn apply_links_referenced_sets() {
        let mut policies = PolicyIndex::default();
        let mut sets = SetIndex::default();
        let mut dirty = DirtyCache::default();

        policies.apply(allow_from("ns/db", "app:web"), &mut sets, &mut dirty);

        assert!(policies.exists("ns/db"));
        for name in ["podlabel-app:web", "podlabel-app:db"] {
            let set = sets.get(name).expect("set must be created");
            assert!(set.policy_references.contains("ns/db"));
            assert!(dirty.upsert_sets.contains(name));
        }
        assert!(dirty.upsert_policies.contains("ns/db"));
    }

    #[test]
    fn update_releases_unused_sets() {
        let mut policies = PolicyIndex::default();
        let mut sets = SetIndex::default();
        let mut dirty = DirtyCache::default();

        policies.apply(allow_from("ns/db", "app:web"), &mut sets, &mut dirty);
        policies.apply(allow_from("ns/db", "app:api"), &mut sets, &mut dirty);

        assert!(sets
            .get("podlabel-app:web")
            .unwrap()
            .policy_references
            .is_empty());
        assert!(sets
            .get("podlabel-app:api")
            .unwrap()
            .policy_references
            .contains("ns/db"));
        assert!(sets
            .get("podlabel-app:db")
            .unwrap()
            .policy_references
            .contains("ns/db"));
    }

    #[test]
    fn remove_releases_sets() {
        let mut policies = PolicyIndex::default();
        let mut sets = SetIndex::default();
        let mut dirty = DirtyCache::default();

        policies.apply(allow_from("ns/db", "app:web"), &mut sets, &mut dirty);
        dirty.clear();

        assert!(policies.remove("ns/db", &mut sets, &mut dirty).is_some());
        assert!(!policies.exists("ns/db"));
        assert!(!sets.get("podlabel-app:web").unwrap().has_references());
        assert!(dirty.delete_policies.contains("ns/db"));
        assert!(dirty.upsert_sets.contains("podlabel-app:web"));
    }

    #[test]
    fn remove_unknown_still_marks_delete() {
        let mut policies = PolicyIndex::default();
        let mut sets = SetIndex::default();
        let mut dirty = DirtyCache::default();

        assert!(policies.remove("ns/unknown", &mut sets, &mut dirty).is_none());
        assert!(dirty.delete_policies.contains("ns/unknown"));
    }
}
