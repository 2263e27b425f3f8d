//! Rebalance trigger policy
//!
//! The automatic trigger (subscriptions changed) and the manual
//! `kaspr.io/rebalance` annotation share one decision, so a pass requests at
//! most one rebalance no matter how many reasons asked for it.

use std::collections::BTreeMap;
use std::fmt;

use crate::crd::MemberState;

use super::members::leader_of;

/// What asked for the rebalance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RebalanceTrigger {
    Auto,
    Manual,
}

impl RebalanceTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebalanceTrigger::Auto => "auto",
            RebalanceTrigger::Manual => "manual",
        }
    }
}

/// Cluster facts the decision is made on
#[derive(Clone, Debug)]
pub struct RebalanceInputs<'a> {
    pub rebalance_required: bool,
    pub manual_requested: bool,
    pub auto_enabled: bool,
    pub progressing: bool,
    pub available_replicas: i32,
    pub desired_replicas: i32,
    pub members: &'a BTreeMap<String, MemberState>,
}

/// Why a requested rebalance cannot be sent this pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RebalanceBlocked {
    RolloutInProgress,
    ReplicasNotReady { available: i32, desired: i32 },
    NoMemberStatus,
    MembersBusy(Vec<String>),
    NoLeader,
}

impl fmt::Display for RebalanceBlocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebalanceBlocked::RolloutInProgress => write!(f, "rollout in progress"),
            RebalanceBlocked::ReplicasNotReady { available, desired } => write!(
                f,
                "cluster not ready (available={}, desired={})",
                available, desired
            ),
            RebalanceBlocked::NoMemberStatus => write!(f, "no member status available"),
            RebalanceBlocked::MembersBusy(members) => {
                write!(f, "members rebalancing or recovering: {}", members.join(", "))
            }
            RebalanceBlocked::NoLeader => write!(f, "no leader found in cluster"),
        }
    }
}

/// Decision for one pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RebalanceDecision {
    /// Nothing asked for a rebalance, or auto-rebalance is disabled
    None,
    /// Send one rebalance request to the leader
    Request {
        trigger: RebalanceTrigger,
        leader: String,
        /// Also consumes the subscription-change flag on success
        clears_required: bool,
    },
    /// A rebalance was asked for but the cluster is not in a state to take it
    Blocked {
        trigger: RebalanceTrigger,
        reason: RebalanceBlocked,
    },
}

/// Decide whether this pass sends a rebalance request.
///
/// Manual requests need every replica available and a known leader. The
/// automatic trigger additionally waits for the rollout to finish and for
/// every member to be settled.
pub fn decide_rebalance(inputs: &RebalanceInputs<'_>) -> RebalanceDecision {
    let auto = inputs.rebalance_required && inputs.auto_enabled;
    let trigger = if inputs.manual_requested {
        RebalanceTrigger::Manual
    } else if auto {
        RebalanceTrigger::Auto
    } else {
        return RebalanceDecision::None;
    };
    let blocked = |reason| RebalanceDecision::Blocked { trigger, reason };

    if trigger == RebalanceTrigger::Auto && inputs.progressing {
        return blocked(RebalanceBlocked::RolloutInProgress);
    }
    if inputs.available_replicas != inputs.desired_replicas {
        return blocked(RebalanceBlocked::ReplicasNotReady {
            available: inputs.available_replicas,
            desired: inputs.desired_replicas,
        });
    }
    if inputs.members.is_empty() {
        return blocked(RebalanceBlocked::NoMemberStatus);
    }
    if trigger == RebalanceTrigger::Auto {
        let busy: Vec<String> = inputs
            .members
            .iter()
            .filter(|(_, m)| m.rebalancing || m.recovering)
            .map(|(id, _)| id.clone())
            .collect();
        if !busy.is_empty() {
            return blocked(RebalanceBlocked::MembersBusy(busy));
        }
    }
    let Some(leader) = leader_of(inputs.members) else {
        return blocked(RebalanceBlocked::NoLeader);
    };

    RebalanceDecision::Request {
        trigger,
        leader: leader.to_string(),
        clears_required: inputs.rebalance_required,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn member(leader: bool, rebalancing: bool) -> MemberState {
        MemberState {
            leader,
            rebalancing,
            recovering: false,
            last_transition_time: Utc::now(),
        }
    }

    fn settled() -> BTreeMap<String, MemberState> {
        BTreeMap::from([
            ("app-0".to_string(), member(true, false)),
            ("app-1".to_string(), member(false, false)),
        ])
    }

    fn inputs(members: &BTreeMap<String, MemberState>) -> RebalanceInputs<'_> {
        RebalanceInputs {
            rebalance_required: true,
            manual_requested: false,
            auto_enabled: true,
            progressing: false,
            available_replicas: 2,
            desired_replicas: 2,
            members,
        }
    }

    #[test]
    fn test_auto_rebalance_sent_to_leader() {
        let members = settled();
        assert_eq!(
            decide_rebalance(&inputs(&members)),
            RebalanceDecision::Request {
                trigger: RebalanceTrigger::Auto,
                leader: "app-0".to_string(),
                clears_required: true,
            }
        );
    }

    #[test]
    fn test_auto_rebalance_disabled_or_not_required() {
        let members = settled();
        let mut disabled = inputs(&members);
        disabled.auto_enabled = false;
        assert_eq!(decide_rebalance(&disabled), RebalanceDecision::None);

        let mut not_required = inputs(&members);
        not_required.rebalance_required = false;
        assert_eq!(decide_rebalance(&not_required), RebalanceDecision::None);
    }

    #[test]
    fn test_auto_rebalance_waits_for_rollout_and_settled_members() {
        let members = settled();
        let mut rolling = inputs(&members);
        rolling.progressing = true;
        assert!(matches!(
            decide_rebalance(&rolling),
            RebalanceDecision::Blocked {
                reason: RebalanceBlocked::RolloutInProgress,
                ..
            }
        ));

        let mut busy = settled();
        busy.get_mut("app-1").unwrap().rebalancing = true;
        assert!(matches!(
            decide_rebalance(&inputs(&busy)),
            RebalanceDecision::Blocked {
                reason: RebalanceBlocked::MembersBusy(_),
                ..
            }
        ));
    }

    #[test]
    fn test_manual_and_auto_collapse_into_one_request() {
        let members = settled();
        let mut both = inputs(&members);
        both.manual_requested = true;
        assert_eq!(
            decide_rebalance(&both),
            RebalanceDecision::Request {
                trigger: RebalanceTrigger::Manual,
                leader: "app-0".to_string(),
                clears_required: true,
            }
        );
    }

    #[test]
    fn test_manual_requires_leader_and_full_replicas() {
        let no_leader = BTreeMap::from([("app-0".to_string(), member(false, false))]);
        let mut manual = inputs(&no_leader);
        manual.rebalance_required = false;
        manual.manual_requested = true;
        manual.available_replicas = 1;
        manual.desired_replicas = 1;
        assert!(matches!(
            decide_rebalance(&manual),
            RebalanceDecision::Blocked {
                trigger: RebalanceTrigger::Manual,
                reason: RebalanceBlocked::NoLeader,
            }
        ));

        let members = settled();
        let mut short = inputs(&members);
        short.manual_requested = true;
        short.available_replicas = 1;
        assert!(matches!(
            decide_rebalance(&short),
            RebalanceDecision::Blocked {
                reason: RebalanceBlocked::ReplicasNotReady { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_manual_ignores_auto_disable() {
        let members = settled();
        let mut manual = inputs(&members);
        manual.auto_enabled = false;
        manual.rebalance_required = false;
        manual.manual_requested = true;
        assert!(matches!(
            decide_rebalance(&manual),
            RebalanceDecision::Request {
                trigger: RebalanceTrigger::Manual,
                clears_required: false,
                ..
            }
        ));
    }
}
