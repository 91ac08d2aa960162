use crate::{
    config::Config,
    dirty::DirtyCache,
    encode,
    error::{Error, Result},
    ipsets::SetIndex,
    metrics::DataplaneMetrics,
    policies::PolicyIndex,
};
use netpol_dataplane_core::{GoalStateEvents, ManagedSet, MemberMetadata, NetworkPolicy, SetMetadata};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time,
};

/// A handle to the dataplane engine.
///
/// All operations are serialized by a single lock covering the set registry, the policy store and
/// the dirty cache. Callers only ever receive owned snapshots of the cached state.
#[derive(Clone, Debug)]
pub struct Dataplane {
    inner: Arc<Inner>,
}

/// The outcome of a flush.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Flush {
    /// There were no changes to publish.
    Clean,

    /// Goal states were handed to the dispatch channel and the dirty cache was cleared.
    Dispatched,

    /// The dispatch channel was full. The changes are retained and will be re-encoded by the next
    /// flush.
    Deferred,
}

#[derive(Debug)]
struct Inner {
    index: Mutex<Index>,
    metrics: DataplaneMetrics,
    config: Config,
}

/// The state guarded by the engine lock.
#[derive(Debug)]
struct Index {
    sets: SetIndex,
    policies: PolicyIndex,
    dirty: DirtyCache,
    tx: mpsc::Sender<GoalStateEvents>,
}

// === impl Dataplane ===

impl Dataplane {
    /// Builds an engine that publishes goal states on `tx`.
    ///
    /// Fails if the channel's receiver has been dropped or the channel has no free capacity, or if
    /// the reconcile interval is zero.
    pub fn new(
        config: Config,
        tx: mpsc::Sender<GoalStateEvents>,
        metrics: DataplaneMetrics,
    ) -> Result<Self> {
        if tx.is_closed() || tx.capacity() == 0 {
            return Err(Error::ChannelUnset);
        }
        if config.reconcile_interval.is_zero() {
            return Err(Error::InvalidReconcileInterval);
        }

        let index = Index {
            sets: SetIndex::default(),
            policies: PolicyIndex::default(),
            dirty: DirtyCache::default(),
            tx,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                index: Mutex::new(index),
                metrics,
                config,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn create_ipsets(&self, metadatas: &[SetMetadata]) {
        let mut index = self.inner.index.lock();
        let Index { sets, dirty, .. } = &mut *index;
        sets.create(metadatas, dirty);
    }

    /// Deletes a set. Unknown sets and sets still referenced by a list or a policy are left alone.
    pub fn delete_ipset(&self, metadata: &SetMetadata) {
        let mut index = self.inner.index.lock();
        let Index { sets, dirty, .. } = &mut *index;
        sets.delete(metadata, dirty);
    }

    pub fn add_to_sets(&self, metadatas: &[SetMetadata], member: &MemberMetadata) -> Result<()> {
        let mut index = self.inner.index.lock();
        let Index { sets, dirty, .. } = &mut *index;
        sets.add_to_sets(metadatas, member, dirty)
    }

    /// Removes a member from each set. A removal naming an owner other than the cached one is
    /// treated as stale and ignored.
    pub fn remove_from_sets(
        &self,
        metadatas: &[SetMetadata],
        member: &MemberMetadata,
    ) -> Result<()> {
        let mut index = self.inner.index.lock();
        let Index { sets, dirty, .. } = &mut *index;
        sets.remove_from_sets(metadatas, member, dirty)
    }

    pub fn add_to_lists(&self, lists: &[SetMetadata], members: &[SetMetadata]) -> Result<()> {
        let mut index = self.inner.index.lock();
        let Index { sets, dirty, .. } = &mut *index;
        sets.add_to_lists(lists, members, dirty)
    }

    pub fn remove_from_list(&self, list: &SetMetadata, members: &[SetMetadata]) -> Result<()> {
        let mut index = self.inner.index.lock();
        let Index { sets, dirty, .. } = &mut *index;
        sets.remove_from_list(list, members, dirty)
    }

    pub fn policy_exists(&self, key: &str) -> bool {
        self.inner.index.lock().policies.exists(key)
    }

    /// Adds a policy unless one with the same key already exists, then flushes.
    ///
    /// The flush runs even when the policy is rejected so that earlier changes are not held back
    /// by a malformed policy.
    pub fn add_policy(&self, policy: NetworkPolicy) -> Result<()> {
        let res = self
            .inner
            .index
            .lock()
            .add_policy(policy, &self.inner.metrics);
        self.flush_after(res)
    }

    /// Replaces a policy, whether or not it exists, then flushes.
    pub fn update_policy(&self, policy: NetworkPolicy) -> Result<()> {
        let res = self.inner.index.lock().update_policy(policy);
        self.flush_after(res)
    }

    pub fn remove_policy(&self, key: &str) -> Result<()> {
        {
            let mut index = self.inner.index.lock();
            let Index {
                sets,
                policies,
                dirty,
                ..
            } = &mut *index;
            policies.remove(key, sets, dirty);
        }
        self.flush_after(Ok(()))
    }

    /// Publishes all changes made since the last successful flush as a single message.
    pub fn flush(&self) -> Result<Flush> {
        let res = {
            let mut index = self.inner.index.lock();
            let res = index.flush();
            self.inner
                .metrics
                .set_sizes(index.sets.len(), index.policies.len());
            res
        };
        self.inner.metrics.flushed(match &res {
            Ok(Flush::Clean) => "clean",
            Ok(Flush::Dispatched) => "dispatched",
            Ok(Flush::Deferred) => "deferred",
            Err(_) => "failed",
        });
        res
    }

    /// Marks every cached set and policy dirty so that the next flush republishes the full goal
    /// state.
    pub fn resync(&self) {
        let mut index = self.inner.index.lock();
        let Index {
            sets,
            policies,
            dirty,
            ..
        } = &mut *index;
        sets.mark_all(dirty);
        policies.mark_all(dirty);
    }

    /// Re-flushes any retained state, optionally republishing everything first.
    pub fn reconcile(&self) {
        if self.inner.config.resync_on_reconcile {
            self.resync();
        }
        match self.flush() {
            Ok(flush) => tracing::debug!(?flush, "reconciled dataplane"),
            Err(error) => tracing::warn!(%error, "failed to reconcile dataplane"),
        }
    }

    pub fn ipset(&self, name: &str) -> Option<ManagedSet> {
        self.inner.index.lock().sets.get(name).cloned()
    }

    pub fn policy(&self, key: &str) -> Option<NetworkPolicy> {
        self.inner.index.lock().policies.get(key).cloned()
    }

    /// Returns true if there are changes that have not yet been dispatched.
    pub fn has_pending_changes(&self) -> bool {
        self.inner.index.lock().dirty.has_contents()
    }

    #[cfg(test)]
    pub(crate) fn with_dirty<T>(&self, f: impl FnOnce(&DirtyCache) -> T) -> T {
        f(&self.inner.index.lock().dirty)
    }

    /// Reports a policy mutation's result, folding in the result of the flush that follows it.
    fn flush_after(&self, res: Result<()>) -> Result<()> {
        let flushed = self.flush();
        match (res, flushed) {
            (Ok(()), Ok(_)) => Ok(()),
            (Ok(()), Err(error)) => Err(Error::Unsynced(Box::new(error))),
            (Err(error), Ok(_)) => Err(error),
            (Err(error), Err(flush_error)) => {
                tracing::warn!(error = %flush_error, "failed to flush dataplane");
                Err(error)
            }
        }
    }
}

// === impl Index ===

impl Index {
    fn add_policy(&mut self, policy: NetworkPolicy, metrics: &DataplaneMetrics) -> Result<()> {
        if self.policies.exists(&policy.policy_key) {
            tracing::debug!(policy = %policy.policy_key, "policy already exists");
            return Ok(());
        }

        // Policies without rules have nothing to program, so they are not timed.
        let start = if policy.acls.is_empty() {
            tracing::info!(policy = %policy.policy_key, "no ACLs in policy");
            None
        } else {
            Some(time::Instant::now())
        };

        let res = PolicyIndex::prepare(policy)
            .map(|policy| self.policies.apply(policy, &mut self.sets, &mut self.dirty));

        if let Some(start) = start {
            metrics.record_acl_rule_exec_time(start);
        }
        res
    }

    fn update_policy(&mut self, policy: NetworkPolicy) -> Result<()> {
        let policy = PolicyIndex::prepare(policy)?;
        self.policies
            .apply(policy, &mut self.sets, &mut self.dirty);
        Ok(())
    }

    fn flush(&mut self) -> Result<Flush> {
        if !self.dirty.has_contents() {
            tracing::debug!("no changes to apply");
            return Ok(Flush::Clean);
        }

        // Encoding failures leave the dirty cache intact so that the next flush retries.
        let events = encode::goal_states(&self.sets, &self.policies, &self.dirty)?;
        let kinds = events.payload.len();

        // `try_send` never waits, so the handoff is made under the lock; this keeps messages in
        // flush order and clears exactly the changes that were sent.
        match self.tx.try_send(events) {
            Ok(()) => {
                tracing::debug!(kinds, "dispatched goal states");
                self.dirty.clear();
                Ok(Flush::Dispatched)
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!("dispatch channel is full; retaining changes for the next flush");
                Ok(Flush::Deferred)
            }
            Err(TrySendError::Closed(_)) => {
                tracing::error!("dispatch channel closed");
                Err(Error::ChannelClosed)
            }
        }
    }
}
