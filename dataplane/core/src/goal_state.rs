use crate::{ipset::ManagedSet, policy::NetworkPolicy};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// The category of change carried by a goal state. Sets sort before policies so that consumers
/// iterating a payload program sets before the policies that use them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GoalStateKind {
    #[serde(rename = "IPSETAPPLY")]
    IpSetApply,
    #[serde(rename = "IPSETREMOVE")]
    IpSetRemove,
    #[serde(rename = "POLICYAPPLY")]
    PolicyApply,
    #[serde(rename = "POLICYREMOVE")]
    PolicyRemove,
}

/// An opaque, encoded description of one category of change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalState {
    pub data: Bytes,
}

/// Everything produced by a single flush, delivered as one message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalStateEvents {
    pub payload: BTreeMap<GoalStateKind, GoalState>,
}

// === impl GoalStateKind ===

impl GoalStateKind {
    pub const ALL: [Self; 4] = [
        Self::IpSetApply,
        Self::IpSetRemove,
        Self::PolicyApply,
        Self::PolicyRemove,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IpSetApply => "IPSETAPPLY",
            Self::IpSetRemove => "IPSETREMOVE",
            Self::PolicyApply => "POLICYAPPLY",
            Self::PolicyRemove => "POLICYREMOVE",
        }
    }
}

impl fmt::Display for GoalStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl GoalState ===

impl GoalState {
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Self> {
        let data = serde_json::to_vec(value)?;
        Ok(Self {
            data: Bytes::from(data),
        })
    }

    fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.data)
    }

    /// Decodes an `IPSETAPPLY` payload.
    pub fn decode_sets(&self) -> serde_json::Result<Vec<ManagedSet>> {
        self.decode()
    }

    /// Decodes an `IPSETREMOVE` or `POLICYREMOVE` payload.
    pub fn decode_names(&self) -> serde_json::Result<Vec<String>> {
        self.decode()
    }

    /// Decodes a `POLICYAPPLY` payload.
    pub fn decode_policies(&self) -> serde_json::Result<Vec<NetworkPolicy>> {
        self.decode()
    }
}

// === impl GoalStateEvents ===

impl GoalStateEvents {
    pub fn get(&self, kind: GoalStateKind) -> Option<&GoalState> {
        self.payload.get(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Iterates over the goal states in the order a consumer should apply them.
    pub fn iter(&self) -> impl Iterator<Item = (GoalStateKind, &GoalState)> + '_ {
        self.payload.iter().map(|(kind, gs)| (*kind, gs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipset::SetMetadata;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    #[test]
    fn kinds_order_sets_before_policies() {
        let mut kinds = vec![
            GoalStateKind::PolicyRemove,
            GoalStateKind::IpSetRemove,
            GoalStateKind::PolicyApply,
            GoalStateKind::IpSetApply,
        ];
        kinds.sort();
        assert_eq!(kinds, GoalStateKind::ALL.to_vec());
    }

    #[test]
    fn events_are_keyed_by_label() {
        let events = GoalStateEvents {
            payload: btreemap! {
                GoalStateKind::IpSetRemove => GoalState::encode(&["ns-a"]).unwrap(),
            },
        };
        let json = serde_json::to_value(&events).unwrap();
        assert!(json["payload"].get("IPSETREMOVE").is_some());
    }

    #[test]
    fn decodes_set_payload() {
        let set = ManagedSet::new(SetMetadata::namespace("a"));
        let gs = GoalState::encode(&[set.clone()]).unwrap();
        assert_eq!(gs.decode_sets().unwrap(), vec![set]);
        assert!(gs.decode_names().is_err());
    }
}
