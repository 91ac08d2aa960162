use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

/// Whether a set holds addresses directly or holds other sets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetKind {
    /// A leaf set whose members are IPs (or `ip,proto:port` pairs).
    HashSet,

    /// A set whose members are other sets.
    ListSet,
}

/// The kind of selector a set was translated from. Determines the set's kind and the prefix of
/// its cache key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SetType {
    Namespace,
    KeyLabelOfNamespace,
    KeyValueLabelOfNamespace,
    KeyLabelOfPod,
    KeyValueLabelOfPod,
    NamedPorts,
    NestedLabelOfPod,
    CidrBlocks,
    EmptyHashSet,
}

/// Identifies an IP set. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SetMetadata {
    pub name: String,
    pub set_type: SetType,
}

/// Identifies the workload that owns a member address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberMetadata {
    /// The member key: an IP, or `ip,proto:port` for named-port sets.
    pub ip: String,

    /// The owning workload, e.g. `namespace/pod`.
    pub key: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
}

/// Counts the list sets that include a set. Never negative.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefCount(u32);

/// The outcome of adding a member address to a hash set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberUpdate {
    Added,

    /// An identical record was already present.
    Unchanged,

    /// The same owner re-registered the address with new details.
    Updated,

    /// The address was owned by another workload. The newer owner wins; this is expected while
    /// addresses are recycled between pods.
    OwnerReplaced { previous: MemberMetadata },
}

/// The outcome of removing a member address from a hash set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberRemoval {
    Removed,

    /// The address was not in the set.
    Absent,

    /// The address now belongs to another workload, so the removal is stale and is ignored.
    OwnedByOther { owner: MemberMetadata },
}

/// The cached state of a single set, as published to the enforcement agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedSet {
    pub metadata: SetMetadata,

    /// Member addresses of a hash set, by member key.
    pub members: BTreeMap<String, MemberMetadata>,

    /// Member sets of a list set, by prefixed name.
    pub member_sets: BTreeMap<String, SetMetadata>,

    pub reference_count: RefCount,

    /// Keys of the policies whose rules mention this set.
    pub policy_references: BTreeSet<String>,
}

// === impl SetKind ===

impl fmt::Display for SetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HashSet => "hash".fmt(f),
            Self::ListSet => "list".fmt(f),
        }
    }
}

// === impl SetType ===

impl SetType {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Namespace => "ns-",
            Self::KeyLabelOfNamespace | Self::KeyValueLabelOfNamespace => "nslabel-",
            Self::KeyLabelOfPod | Self::KeyValueLabelOfPod => "podlabel-",
            Self::NamedPorts => "namedport:",
            Self::NestedLabelOfPod => "nestedlabel-",
            Self::CidrBlocks => "cidr-",
            Self::EmptyHashSet => "emptyhashset-",
        }
    }

    pub fn kind(&self) -> SetKind {
        match self {
            Self::KeyLabelOfNamespace | Self::KeyValueLabelOfNamespace | Self::NestedLabelOfPod => {
                SetKind::ListSet
            }
            _ => SetKind::HashSet,
        }
    }
}

// === impl SetMetadata ===

impl SetMetadata {
    /// The name of the list that holds every namespace set.
    pub const ALL_NAMESPACES: &'static str = "all-namespaces";

    pub fn new(name: impl Into<String>, set_type: SetType) -> Self {
        Self {
            name: name.into(),
            set_type,
        }
    }

    pub fn namespace(name: impl Into<String>) -> Self {
        Self::new(name, SetType::Namespace)
    }

    pub fn all_namespaces() -> Self {
        Self::new(Self::ALL_NAMESPACES, SetType::KeyLabelOfNamespace)
    }

    pub fn kind(&self) -> SetKind {
        self.set_type.kind()
    }

    /// The cache key for this set.
    pub fn prefixed_name(&self) -> String {
        format!("{}{}", self.set_type.prefix(), self.name)
    }
}

impl fmt::Display for SetMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.set_type.prefix(), self.name)
    }
}

// === impl MemberMetadata ===

impl MemberMetadata {
    pub fn new(ip: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            key: key.into(),
            node_name: String::new(),
        }
    }

    pub fn with_node(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    pub fn same_owner(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

// === impl RefCount ===

impl RefCount {
    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn increment(&mut self) {
        self.0 = self.0.saturating_add(1);
    }

    /// Decrementing a zero count is a no-op.
    pub fn decrement(&mut self) {
        self.0 = self.0.saturating_sub(1);
    }
}

// === impl ManagedSet ===

impl ManagedSet {
    pub fn new(metadata: SetMetadata) -> Self {
        Self {
            metadata,
            members: BTreeMap::new(),
            member_sets: BTreeMap::new(),
            reference_count: RefCount::default(),
            policy_references: BTreeSet::new(),
        }
    }

    pub fn kind(&self) -> SetKind {
        self.metadata.kind()
    }

    pub fn prefixed_name(&self) -> String {
        self.metadata.prefixed_name()
    }

    /// A set that is referenced by a list or a policy must not be deleted.
    pub fn has_references(&self) -> bool {
        !self.reference_count.is_zero() || !self.policy_references.is_empty()
    }

    pub fn add_reference(&mut self) {
        self.reference_count.increment();
    }

    pub fn remove_reference(&mut self) {
        self.reference_count.decrement();
    }

    /// Inserts or overwrites the record for `member.ip`.
    pub fn upsert_member(&mut self, member: &MemberMetadata) -> MemberUpdate {
        match self.members.insert(member.ip.clone(), member.clone()) {
            None => MemberUpdate::Added,
            Some(prior) if prior == *member => MemberUpdate::Unchanged,
            Some(prior) if prior.same_owner(member) => MemberUpdate::Updated,
            Some(previous) => MemberUpdate::OwnerReplaced { previous },
        }
    }

    /// Removes `member.ip` only if it is still owned by `member.key`.
    pub fn remove_member(&mut self, member: &MemberMetadata) -> MemberRemoval {
        match self.members.get(&member.ip) {
            None => MemberRemoval::Absent,
            Some(cached) if !cached.same_owner(member) => MemberRemoval::OwnedByOther {
                owner: cached.clone(),
            },
            Some(_) => {
                self.members.remove(&member.ip);
                MemberRemoval::Removed
            }
        }
    }

    /// Returns true if the policy was not already referencing this set.
    pub fn add_policy_reference(&mut self, policy_key: &str) -> bool {
        self.policy_references.insert(policy_key.to_string())
    }

    /// Returns true if the policy was referencing this set.
    pub fn remove_policy_reference(&mut self, policy_key: &str) -> bool {
        self.policy_references.remove(policy_key)
    }
}
