//! Member health tracking
//!
//! Turns a point-in-time read of every member's web API into the diffed,
//! timestamped member table kept in the app status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::adapters::MemberRead;
use crate::crd::MemberState;

/// Flag change of one member between two reads
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberTransition {
    pub member: String,
    pub fields: Vec<&'static str>,
}

/// Member table after folding in a fresh read
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemberTable {
    pub members: BTreeMap<String, MemberState>,
    pub transitions: Vec<MemberTransition>,
    /// Rebalancing members over members that answered, as "X/Y"
    pub rebalancing_summary: String,
}

/// Fold a fresh read into the previous member table.
///
/// Only members that answered are kept. A member missing from `reads` or
/// unreachable is dropped, so a replacement pod coming back under the same
/// id starts over with a fresh `lastTransitionTime`.
pub fn track_members(
    previous: &BTreeMap<String, MemberState>,
    reads: &BTreeMap<String, MemberRead>,
    now: DateTime<Utc>,
) -> MemberTable {
    let mut table = MemberTable::default();
    let mut reported = 0usize;
    let mut rebalancing = 0usize;

    for (id, read) in reads {
        let prior = previous.get(id);
        let report = match read {
            MemberRead::Reported(report) => report,
            MemberRead::Unreachable => {
                if prior.is_some() {
                    debug!(member = %id, "Member unreachable, dropping cached state");
                }
                continue;
            }
        };

        reported += 1;
        if report.rebalancing {
            rebalancing += 1;
        }

        let state = match prior {
            None => {
                debug!(member = %id, "New member");
                MemberState {
                    leader: report.leader,
                    rebalancing: report.rebalancing,
                    recovering: report.recovering,
                    last_transition_time: now,
                }
            }
            Some(prior) => {
                let mut fields = Vec::new();
                if prior.leader != report.leader {
                    fields.push("leader");
                }
                if prior.rebalancing != report.rebalancing {
                    fields.push("rebalancing");
                }
                if prior.recovering != report.recovering {
                    fields.push("recovering");
                }

                if fields.is_empty() {
                    prior.clone()
                } else {
                    info!(
                        member = %id,
                        changed = ?fields,
                        leader = report.leader,
                        rebalancing = report.rebalancing,
                        recovering = report.recovering,
                        "Member state changed"
                    );
                    table.transitions.push(MemberTransition {
                        member: id.clone(),
                        fields,
                    });
                    MemberState {
                        leader: report.leader,
                        rebalancing: report.rebalancing,
                        recovering: report.recovering,
                        last_transition_time: now,
                    }
                }
            }
        };
        table.members.insert(id.clone(), state);
    }

    for id in previous.keys().filter(|id| !reads.contains_key(*id)) {
        debug!(member = %id, "Member gone");
    }

    table.rebalancing_summary = format!("{}/{}", rebalancing, reported);
    table
}

/// Id of the member currently leading the group
pub fn leader_of(members: &BTreeMap<String, MemberState>) -> Option<&str> {
    members
        .iter()
        .find(|(_, state)| state.leader)
        .map(|(id, _)| id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemberReport;
    use chrono::Duration;

    fn report(leader: bool, rebalancing: bool, recovering: bool) -> MemberRead {
        MemberRead::Reported(MemberReport {
            leader,
            rebalancing,
            recovering,
            ..Default::default()
        })
    }

    #[test]
    fn test_new_members_stamped_with_now() {
        let now = Utc::now();
        let reads = BTreeMap::from([
            ("app-0".to_string(), report(true, false, false)),
            ("app-1".to_string(), report(false, true, false)),
        ]);
        let table = track_members(&BTreeMap::new(), &reads, now);
        assert_eq!(table.members.len(), 2);
        assert_eq!(table.members["app-0"].last_transition_time, now);
        assert!(table.members["app-0"].leader);
        assert_eq!(table.rebalancing_summary, "1/2");
        assert!(table.transitions.is_empty());
    }

    #[test]
    fn test_unchanged_member_keeps_transition_time() {
        let t0 = Utc::now() - Duration::minutes(10);
        let reads = BTreeMap::from([("app-0".to_string(), report(false, true, false))]);
        let first = track_members(&BTreeMap::new(), &reads, t0);
        let second = track_members(&first.members, &reads, t0 + Duration::minutes(5));
        assert_eq!(second.members["app-0"], first.members["app-0"]);
        assert_eq!(second.members["app-0"].last_transition_time, t0);
    }

    #[test]
    fn test_flag_flip_bumps_transition_time() {
        let t0 = Utc::now() - Duration::minutes(10);
        let t1 = t0 + Duration::seconds(30);
        let before = BTreeMap::from([("app-0".to_string(), report(false, false, false))]);
        let after = BTreeMap::from([("app-0".to_string(), report(false, true, false))]);
        let first = track_members(&BTreeMap::new(), &before, t0);
        let second = track_members(&first.members, &after, t1);
        assert_eq!(second.members["app-0"].last_transition_time, t1);
        assert_eq!(
            second.transitions,
            vec![MemberTransition {
                member: "app-0".to_string(),
                fields: vec!["rebalancing"],
            }]
        );
    }

    #[test]
    fn test_vanished_and_unreachable_members_dropped() {
        let t0 = Utc::now();
        let reads = BTreeMap::from([
            ("app-0".to_string(), report(true, false, false)),
            ("app-1".to_string(), report(false, false, false)),
            ("app-2".to_string(), report(false, false, false)),
        ]);
        let first = track_members(&BTreeMap::new(), &reads, t0);

        let next = BTreeMap::from([
            ("app-0".to_string(), report(true, false, false)),
            ("app-1".to_string(), MemberRead::Unreachable),
        ]);
        let second = track_members(&first.members, &next, t0 + Duration::seconds(30));
        assert!(!second.members.contains_key("app-2"));
        assert!(!second.members.contains_key("app-1"));
        assert_eq!(second.rebalancing_summary, "0/1");
    }

    #[test]
    fn test_member_back_after_outage_gets_fresh_transition_time() {
        let t0 = Utc::now() - Duration::minutes(10);
        let stuck = BTreeMap::from([("app-1".to_string(), report(false, true, false))]);
        let first = track_members(&BTreeMap::new(), &stuck, t0);

        let gone = BTreeMap::from([("app-1".to_string(), MemberRead::Unreachable)]);
        let second = track_members(&first.members, &gone, t0 + Duration::minutes(5));
        assert!(second.members.is_empty());

        let back = t0 + Duration::minutes(6);
        let third = track_members(&second.members, &stuck, back);
        assert_eq!(third.members["app-1"].last_transition_time, back);
    }

    #[test]
    fn test_leader_of() {
        let reads = BTreeMap::from([
            ("app-0".to_string(), report(false, false, false)),
            ("app-1".to_string(), report(true, false, false)),
        ]);
        let table = track_members(&BTreeMap::new(), &reads, Utc::now());
        assert_eq!(leader_of(&table.members), Some("app-1"));
    }
}
