//! Network Policy Dataplane Engine
//!
//! The engine translates network-policy intent into goal states for a remote enforcement agent.
//! The watch layer drives it with the following inputs:
//!
//! - IP *sets*. A hash set holds pod IPs (or IP/port pairs), each owned by a workload. A list set
//!   holds hash sets. A set is reference-counted by the lists that include it.
//! - Network *policies*. Each policy is an ordered list of ACL rules that match traffic against
//!   sets. A set mentioned by a policy records the policy's key.
//!
//! ```text
//! [ Pod IP ] -> [ HashSet ] <- [ ListSet ]
//!                    ^              ^
//!                    +--- [ Policy ]+
//! ```
//!
//! Every mutation marks the affected keys in a dirty cache. A flush encodes the dirty sets and
//! policies into at most four goal states (set upserts, set removals, policy upserts, policy
//! removals) and hands them to a bounded channel as a single message. Policy mutations always
//! flush. A [`Reconciler`] flushes on a fixed interval to publish anything that could not be
//! handed off earlier.
//!
//! A set is never removed while it is referenced by a list or a policy, and sets and policies
//! from the same flush are always delivered together.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod config;
mod dataplane;
mod dirty;
mod encode;
mod error;
mod ipsets;
mod metrics;
mod policies;
mod reconcile;


pub use self::{
    config::{Config, DEFAULT_RECONCILE_INTERVAL},
    dataplane::{Dataplane, Flush},
    error::{Error, Operation, Result},
    metrics::DataplaneMetrics,
    reconcile::Reconciler,
};
