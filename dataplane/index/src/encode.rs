//! Serializes the dirty subset of the registry and policy store into goal states.
//!
//! Upserts carry complete records rather than deltas, so re-encoding a retained dirty cache after
//! a failed handoff always produces the current state.

use crate::{
    dirty::DirtyCache,
    error::{Error, Result},
    ipsets::SetIndex,
    policies::PolicyIndex,
};
use ahash::AHashSet as HashSet;
use netpol_dataplane_core::{GoalState, GoalStateEvents, GoalStateKind};
use serde::Serialize;

/// Encodes every non-empty dirty category. Fails without producing any goal state if any category
/// cannot be encoded.
pub(crate) fn goal_states(
    sets: &SetIndex,
    policies: &PolicyIndex,
    dirty: &DirtyCache,
) -> Result<GoalStateEvents> {
    let mut events = GoalStateEvents::default();

    if !dirty.upsert_sets.is_empty() {
        let records = sorted(&dirty.upsert_sets)
            .into_iter()
            .filter_map(|name| {
                let set = sets.get(name);
                if set.is_none() {
                    tracing::error!(set = %name, "dirty ipset not found");
                }
                set
            })
            .collect::<Vec<_>>();
        insert(&mut events, GoalStateKind::IpSetApply, &records)?;
    }

    if !dirty.delete_sets.is_empty() {
        insert(
            &mut events,
            GoalStateKind::IpSetRemove,
            &sorted(&dirty.delete_sets),
        )?;
    }

    if !dirty.upsert_policies.is_empty() {
        let records = sorted(&dirty.upsert_policies)
            .into_iter()
            .filter_map(|key| {
                let policy = policies.get(key);
                if policy.is_none() {
                    tracing::error!(policy = %key, "dirty policy not found");
                }
                policy
            })
            .collect::<Vec<_>>();
        insert(&mut events, GoalStateKind::PolicyApply, &records)?;
    }

    if !dirty.delete_policies.is_empty() {
        insert(
            &mut events,
            GoalStateKind::PolicyRemove,
            &sorted(&dirty.delete_policies),
        )?;
    }

    Ok(events)
}

fn insert<T: Serialize>(events: &mut GoalStateEvents, kind: GoalStateKind, records: &T) -> Result<()> {
    let goal_state = GoalState::encode(records).map_err(|source| {
        tracing::error!(%kind, error = %source, "failed to encode goal state");
        Error::Encoding { kind, source }
    })?;
    tracing::trace!(%kind, bytes = goal_state.data.len(), "encoded goal state");
    events.payload.insert(kind, goal_state);
    Ok(())
}

fn sorted(keys: &HashSet<String>) -> Vec<&str> {
    let mut keys = keys.iter().map(String::as_str).collect::<Vec<_>>();
    keys.sort_unstable();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use netpol_dataplane_core::{MemberMetadata, NetworkPolicy, SetMetadata};
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_cache_encodes_nothing() {
        let events = goal_states(
            &SetIndex::default(),
            &PolicyIndex::default(),
            &DirtyCache::default(),
        )
        .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn encodes_each_dirty_category() {
        let mut sets = SetIndex::default();
        let mut policies = PolicyIndex::default();
        let mut dirty = DirtyCache::default();

        sets.add_to_sets(
            &[SetMetadata::namespace("b"), SetMetadata::namespace("a")],
            &MemberMetadata::new("10.0.0.5", "a/pod-1"),
            &mut dirty,
        )
        .unwrap();
        sets.create(&[SetMetadata::namespace("gone")], &mut dirty);
        sets.delete(&SetMetadata::namespace("gone"), &mut dirty);
        policies.apply(NetworkPolicy::new("a/p", "p"), &mut sets, &mut dirty);
        policies.remove("a/q", &mut sets, &mut dirty);

        let events = goal_states(&sets, &policies, &dirty).unwrap();
        assert_eq!(
            events.iter().map(|(kind, _)| kind).collect::<Vec<_>>(),
            GoalStateKind::ALL.to_vec()
        );

        let applied = events
            .get(GoalStateKind::IpSetApply)
            .unwrap()
            .decode_sets()
            .unwrap();
        assert_eq!(
            applied
                .iter()
                .map(|set| set.prefixed_name())
                .collect::<Vec<_>>(),
            vec!["ns-a", "ns-b"]
        );
        assert_eq!(applied[0].members["10.0.0.5"].key, "a/pod-1");

        let removed = events.get(GoalStateKind::IpSetRemove).unwrap();
        assert_eq!(removed.decode_names().unwrap(), vec!["ns-gone"]);

        let policies = events.get(GoalStateKind::PolicyApply).unwrap();
        assert_eq!(policies.decode_policies().unwrap()[0].policy_key, "a/p");

        let removed = events.get(GoalStateKind::PolicyRemove).unwrap();
        assert_eq!(removed.decode_names().unwrap(), vec!["a/q"]);
    }
}
