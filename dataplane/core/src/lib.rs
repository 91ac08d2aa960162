//! The data model shared by the dataplane engine and the enforcement agents that consume its goal
//! states.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod goal_state;
pub mod ipset;
pub mod policy;
mod validation;

pub use self::{
    goal_state::{GoalState, GoalStateEvents, GoalStateKind},
    ipset::{
        ManagedSet, MemberMetadata, MemberRemoval, MemberUpdate, RefCount, SetKind, SetMetadata,
        SetType,
    },
    policy::{AclPolicy, Direction, MatchType, NetworkPolicy, Ports, Protocol, SetInfo, Verdict},
    validation::{validate, PolicyIssue},
};
