use netpol_dataplane_core::{GoalStateKind, PolicyIssue, SetKind};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The operation requires a set of the other kind.
    #[error("{op}: ipset {set} is not a {expected} set")]
    TypeMismatch {
        op: Operation,
        set: String,
        expected: SetKind,
    },

    #[error("malformed policy {key}: {}", display_issues(.issues))]
    MalformedPolicy {
        key: String,
        issues: Vec<PolicyIssue>,
    },

    #[error("failed to encode {kind} goal state")]
    Encoding {
        kind: GoalStateKind,
        #[source]
        source: serde_json::Error,
    },

    /// The dispatch channel has no consumer or no capacity when the engine is built.
    #[error("dispatch channel must be set")]
    ChannelUnset,

    #[error("dispatch channel closed")]
    ChannelClosed,

    #[error("reconcile interval must be non-zero")]
    InvalidReconcileInterval,

    /// The mutation was accepted but could not be synchronized to the dataplane.
    #[error("mutation accepted but not synchronized: {0}")]
    Unsynced(#[source] Box<Error>),
}

/// Names the membership operation that failed a set-kind check.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    AddToSets,
    RemoveFromSets,
    AddToLists,
    RemoveFromList,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddToSets => "AddToSets".fmt(f),
            Self::RemoveFromSets => "RemoveFromSets".fmt(f),
            Self::AddToLists => "AddToLists".fmt(f),
            Self::RemoveFromList => "RemoveFromList".fmt(f),
        }
    }
}

fn display_issues(issues: &[PolicyIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
