use crate::policy::{AclPolicy, MatchType, NetworkPolicy, Protocol, SetInfo};
use thiserror::Error;

/// Describes a single reason a policy cannot be programmed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PolicyIssue {
    #[error("policy key is missing")]
    MissingPolicyKey,

    #[error("ACL {acl} is missing a policy id")]
    MissingAclId { acl: usize },

    /// Port matches are only meaningful for port-bearing protocols.
    #[error("ACL {acl} has destination ports so must use TCP, UDP or SCTP, not {protocol}")]
    PortsWithoutProtocol { acl: usize, protocol: Protocol },

    #[error("ACL {acl} has an invalid port range {port}-{end_port}")]
    InvalidPortRange { acl: usize, port: u16, end_port: u16 },

    #[error("ACL {acl} both includes and excludes {set} in its {list} list")]
    ContradictoryMatch {
        acl: usize,
        set: String,
        list: &'static str,
    },

    #[error("ACL {acl} cannot use match type {match_type} in its {list} list")]
    MisplacedMatchType {
        acl: usize,
        match_type: MatchType,
        list: &'static str,
    },
}

/// Checks a normalized policy, returning every issue found.
pub fn validate(policy: &NetworkPolicy) -> Result<(), Vec<PolicyIssue>> {
    let mut issues = Vec::new();

    if policy.policy_key.trim().is_empty() {
        issues.push(PolicyIssue::MissingPolicyKey);
    }

    for (idx, acl) in policy.acls.iter().enumerate() {
        validate_acl(idx, acl, &mut issues);
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

fn validate_acl(acl: usize, rule: &AclPolicy, issues: &mut Vec<PolicyIssue>) {
    if rule.policy_id.trim().is_empty() {
        issues.push(PolicyIssue::MissingAclId { acl });
    }

    if rule.has_ports() && rule.protocol == Protocol::Any {
        issues.push(PolicyIssue::PortsWithoutProtocol {
            acl,
            protocol: rule.protocol,
        });
    }

    let ports = rule.dst_ports;
    if (ports.port == 0 && ports.end_port != 0) || ports.end_port < ports.port {
        issues.push(PolicyIssue::InvalidPortRange {
            acl,
            port: ports.port,
            end_port: ports.end_port,
        });
    }

    validate_list(acl, "source", &rule.src_list, issues);
    validate_list(acl, "destination", &rule.dst_list, issues);
}

fn validate_list(
    acl: usize,
    list: &'static str,
    sets: &[SetInfo],
    issues: &mut Vec<PolicyIssue>,
) {
    for (i, info) in sets.iter().enumerate() {
        let allowed = if list == "source" {
            info.match_type.allowed_in_src()
        } else {
            info.match_type.allowed_in_dst()
        };
        if !allowed {
            issues.push(PolicyIssue::MisplacedMatchType {
                acl,
                match_type: info.match_type,
                list,
            });
        }

        let contradicted = sets[..i]
            .iter()
            .any(|prior| prior.ipset == info.ipset && prior.included != info.included);
        if contradicted {
            issues.push(PolicyIssue::ContradictoryMatch {
                acl,
                set: info.ipset.prefixed_name(),
                list,
            });
        }
    }
}
