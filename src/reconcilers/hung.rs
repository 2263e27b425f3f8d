//! Hung member detection
//!
//! A member that keeps reporting `rebalancing` without ever entering
//! `recovering` past a threshold is considered hung. Each pass that finds it
//! so adds a strike; the third consecutive strike marks its pod for
//! termination. Strike tracking lives in the app status so a restarted
//! operator resumes where it left off.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::crd::{HungMemberEntry, MemberState};

/// Strikes after which a member is terminated
pub const MAX_STRIKES: u8 = 3;

/// Inputs of one detection pass
#[derive(Clone, Debug)]
pub struct HungPolicy {
    pub enabled: bool,
    pub threshold_seconds: i64,
    pub max_terminations: usize,
}

/// Outcome of one detection pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HungVerdict {
    /// Tracking to persist; terminated members are already removed
    pub tracking: BTreeMap<String, HungMemberEntry>,
    /// Members satisfying the hung predicate this pass, with their strikes
    pub hung: BTreeMap<String, u8>,
    /// Members to terminate once status is written
    pub to_terminate: Vec<String>,
}

impl HungVerdict {
    pub fn any_hung(&self) -> bool {
        !self.hung.is_empty()
    }

    /// Human readable summary for the Ready condition
    pub fn summary(&self) -> String {
        let members: Vec<String> = self
            .hung
            .iter()
            .map(|(id, strikes)| format!("{} ({}/{})", id, strikes, MAX_STRIKES))
            .collect();
        format!("Members stuck rebalancing: {}", members.join(", "))
    }
}

/// `rebalancing && !recovering && now - lastTransitionTime >= threshold`
///
/// Members without any assigned partitions are eligible too.
pub fn is_hung(state: &MemberState, now: DateTime<Utc>, threshold_seconds: i64) -> bool {
    state.rebalancing
        && !state.recovering
        && now - state.last_transition_time >= Duration::seconds(threshold_seconds)
}

/// Run one detection pass.
///
/// `progressing` suppresses detection entirely and clears tracking, since a
/// rollout causes expected rebalancing. `retry` holds members whose
/// termination failed last pass. Their table entry was dropped when the
/// termination was planned, so the threshold is not checked again: if they
/// still report rebalancing without recovering they go straight back to the
/// final strike.
pub fn detect_hung(
    previous: &BTreeMap<String, HungMemberEntry>,
    members: &BTreeMap<String, MemberState>,
    progressing: bool,
    retry: &BTreeSet<String>,
    policy: &HungPolicy,
    now: DateTime<Utc>,
) -> HungVerdict {
    let mut verdict = HungVerdict::default();
    if !policy.enabled || progressing {
        return verdict;
    }

    for (id, state) in members {
        let retrying = retry.contains(id) && state.rebalancing && !state.recovering;
        if !retrying && !is_hung(state, now, policy.threshold_seconds) {
            if previous.contains_key(id) {
                info!(member = %id, "Member no longer hung, resetting strikes");
            }
            continue;
        }

        let prior = previous.get(id);
        let strikes = if retrying {
            MAX_STRIKES
        } else {
            prior
                .map_or(0, |entry| entry.strikes)
                .saturating_add(1)
                .min(MAX_STRIKES)
        };
        let entry = HungMemberEntry {
            strikes,
            first_detected: prior.map_or(now, |entry| entry.first_detected),
            last_detected: now,
        };
        warn!(
            member = %id,
            strikes,
            stuck_since = %state.last_transition_time,
            "Member appears hung"
        );
        verdict.hung.insert(id.clone(), strikes);
        verdict.tracking.insert(id.clone(), entry);
    }

    let confirmed: Vec<String> = verdict
        .tracking
        .iter()
        .filter(|(_, entry)| entry.strikes >= MAX_STRIKES)
        .map(|(id, _)| id.clone())
        .collect();
    if confirmed.len() > policy.max_terminations {
        warn!(
            confirmed = confirmed.len(),
            cap = policy.max_terminations,
            "Termination cap reached, remaining members retried next pass"
        );
    }
    for id in confirmed.into_iter().take(policy.max_terminations) {
        verdict.tracking.remove(&id);
        verdict.to_terminate.push(id);
    }

    verdict
}
