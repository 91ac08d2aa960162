use crate::ipset::SetMetadata;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// A translated network policy. Created, updated and removed as a unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    /// Uniquely identifies the policy, e.g. `namespace/name`.
    pub policy_key: String,

    /// Display name. Not unique.
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    /// Sets selecting the pods this policy applies to.
    #[serde(default)]
    pub pod_selectors: Vec<SetInfo>,

    /// Rules in precedence order.
    #[serde(default)]
    pub acls: Vec<AclPolicy>,
}

/// A single access-control rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclPolicy {
    pub policy_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,

    #[serde(default)]
    pub src_list: Vec<SetInfo>,

    #[serde(default)]
    pub dst_list: Vec<SetInfo>,

    pub target: Verdict,
    pub direction: Direction,

    #[serde(default)]
    pub dst_ports: Ports,

    #[serde(default)]
    pub protocol: Protocol,
}

/// A set matched by a rule.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SetInfo {
    pub ipset: SetMetadata,

    /// False when the rule matches traffic *not* in the set.
    pub included: bool,

    pub match_type: MatchType,
}

/// Which address (or addresses) of a packet are matched against a set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MatchType {
    Src,
    Dst,
    SrcSrc,
    SrcDst,
    DstDst,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Allowed,
    Dropped,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ingress,
    Egress,
    Both,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[serde(alias = "tcp")]
    Tcp,
    #[serde(alias = "udp")]
    Udp,
    #[serde(alias = "sctp")]
    Sctp,
    #[default]
    #[serde(alias = "any", alias = "")]
    Any,
}

/// A destination port range. Zero means unset.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ports {
    pub port: u16,
    pub end_port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown protocol: {0}")]
pub struct InvalidProtocol(String);

// === impl NetworkPolicy ===

impl NetworkPolicy {
    pub fn new(policy_key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            policy_key: policy_key.into(),
            name: name.into(),
            namespace: String::new(),
            pod_selectors: Vec::new(),
            acls: Vec::new(),
        }
    }

    /// Every set named by the pod selectors or by any rule, ordered by prefixed name.
    pub fn referenced_sets(&self) -> Vec<SetMetadata> {
        let mut sets = BTreeMap::new();
        let rule_sets = self
            .acls
            .iter()
            .flat_map(|acl| acl.src_list.iter().chain(acl.dst_list.iter()));
        for info in self.pod_selectors.iter().chain(rule_sets) {
            sets.entry(info.ipset.prefixed_name())
                .or_insert_with(|| info.ipset.clone());
        }
        sets.into_values().collect()
    }

    /// Canonicalizes each rule in place. Rule order is preserved.
    pub fn normalize(&mut self) {
        for acl in &mut self.acls {
            acl.normalize();
        }
    }
}

// === impl AclPolicy ===

impl AclPolicy {
    pub fn new(policy_id: impl Into<String>, target: Verdict, direction: Direction) -> Self {
        Self {
            policy_id: policy_id.into(),
            comment: String::new(),
            src_list: Vec::new(),
            dst_list: Vec::new(),
            target,
            direction,
            dst_ports: Ports::default(),
            protocol: Protocol::Any,
        }
    }

    pub fn has_ports(&self) -> bool {
        self.dst_ports.port != 0 || self.dst_ports.end_port != 0
    }

    fn normalize(&mut self) {
        self.policy_id = self.policy_id.trim().to_ascii_lowercase();
        self.comment = self.comment.trim().to_string();
        if self.dst_ports.end_port == 0 {
            self.dst_ports.end_port = self.dst_ports.port;
        }
        for list in [&mut self.src_list, &mut self.dst_list] {
            list.sort_by(|a, b| {
                (a.ipset.prefixed_name(), a.included, a.match_type).cmp(&(
                    b.ipset.prefixed_name(),
                    b.included,
                    b.match_type,
                ))
            });
            list.dedup();
        }
    }
}

// === impl SetInfo ===

impl SetInfo {
    pub fn new(ipset: SetMetadata, included: bool, match_type: MatchType) -> Self {
        Self {
            ipset,
            included,
            match_type,
        }
    }
}

// === impl MatchType ===

impl MatchType {
    pub(crate) fn allowed_in_src(&self) -> bool {
        matches!(self, Self::Src | Self::SrcSrc | Self::SrcDst)
    }

    pub(crate) fn allowed_in_dst(&self) -> bool {
        matches!(self, Self::Dst | Self::DstDst | Self::SrcDst)
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Src => "src".fmt(f),
            Self::Dst => "dst".fmt(f),
            Self::SrcSrc => "src,src".fmt(f),
            Self::SrcDst => "src,dst".fmt(f),
            Self::DstDst => "dst,dst".fmt(f),
        }
    }
}

// === impl Protocol ===

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Sctp => "SCTP",
            Self::Any => "ANY",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl FromStr for Protocol {
    type Err = InvalidProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            "SCTP" => Ok(Self::Sctp),
            "" | "ANY" | "ALL" => Ok(Self::Any),
            _ => Err(InvalidProtocol(s.to_string())),
        }
    }
}
