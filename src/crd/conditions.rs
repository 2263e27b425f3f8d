//! Status conditions keyed by type
//!
//! Serialized as the usual Kubernetes condition list. In memory the list is
//! indexed by condition type so upserts replace in place and the order of
//! first insertion is kept.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reporting an in-flight rollout
pub const PROGRESSING: &str = "Progressing";

/// Condition type reporting overall health
pub const READY: &str = "Ready";

/// Condition type reporting whether linked resources could be compared
pub const SUBSCRIPTIONS_TRACKED: &str = "SubscriptionsTracked";

/// Condition type reporting whether member status could be read
pub const MEMBERS_OBSERVED: &str = "MembersObserved";

/// Condition type mirroring `rebalanceRequired`, with the last rebalance outcome as reason
pub const REBALANCE_REQUIRED: &str = "RebalanceRequired";

/// Condition status value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Status condition
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: ConditionStatus,

    /// Reason for the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the status flipped
    pub last_transition_time: DateTime<Utc>,

    /// Generation the condition was computed for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(type_: &str, status: impl Into<ConditionStatus>, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status: status.into(),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            last_transition_time: Utc::now(),
            observed_generation: None,
        }
    }

    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Ordered map of conditions keyed by type
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(from = "Vec<Condition>", into = "Vec<Condition>")]
pub struct Conditions {
    entries: Vec<Condition>,
    index: BTreeMap<String, usize>,
}

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the condition of the same type.
    ///
    /// `lastTransitionTime` is carried over from the existing entry unless the
    /// status flips, in which case `now` is used.
    pub fn upsert(&mut self, mut condition: Condition, now: DateTime<Utc>) {
        match self.index.get(&condition.type_) {
            Some(&pos) => {
                let existing = &self.entries[pos];
                condition.last_transition_time = if existing.status == condition.status {
                    existing.last_transition_time
                } else {
                    now
                };
                self.entries[pos] = condition;
            }
            None => {
                condition.last_transition_time = now;
                self.index
                    .insert(condition.type_.clone(), self.entries.len());
                self.entries.push(condition);
            }
        }
    }

    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.index.get(type_).map(|&pos| &self.entries[pos])
    }

    /// True when the condition exists and has status True
    pub fn is_true(&self, type_: &str) -> bool {
        self.get(type_).map(Condition::is_true).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Vec<Condition>> for Conditions {
    fn from(list: Vec<Condition>) -> Self {
        let mut conditions = Conditions::new();
        for condition in list {
            // Duplicate types in a stored list collapse onto the first position.
            match conditions.index.get(&condition.type_) {
                Some(&pos) => conditions.entries[pos] = condition,
                None => {
                    conditions
                        .index
                        .insert(condition.type_.clone(), conditions.entries.len());
                    conditions.entries.push(condition);
                }
            }
        }
        conditions
    }
}

impl From<Conditions> for Vec<Condition> {
    fn from(conditions: Conditions) -> Self {
        conditions.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_upsert_preserves_first_insertion_order() {
        let t0 = Utc::now();
        let mut conds = Conditions::new();
        conds.upsert(Condition::new(PROGRESSING, true, "NewSpec", "rolling out"), t0);
        conds.upsert(Condition::new(READY, false, "NotReady", "not ready"), t0);
        conds.upsert(
            Condition::new(PROGRESSING, false, "ReconcileComplete", "done"),
            t0 + Duration::seconds(5),
        );

        let types: Vec<_> = conds.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, vec![PROGRESSING, READY]);
        assert_eq!(conds.len(), 2);
        assert!(!conds.is_true(PROGRESSING));
    }

    #[test]
    fn test_transition_time_only_moves_on_status_flip() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(30);
        let t2 = t0 + Duration::seconds(60);
        let mut conds = Conditions::new();
        conds.upsert(Condition::new(READY, true, "Healthy", "ok"), t0);
        conds.upsert(Condition::new(READY, true, "Healthy", "still ok"), t1);
        assert_eq!(conds.get(READY).unwrap().last_transition_time, t0);
        assert_eq!(conds.get(READY).unwrap().message.as_deref(), Some("still ok"));

        conds.upsert(Condition::new(READY, false, "HungMembers", "stuck"), t2);
        assert_eq!(conds.get(READY).unwrap().last_transition_time, t2);
    }

    #[test]
    fn test_serializes_as_list() {
        let mut conds = Conditions::new();
        conds.upsert(Condition::new(READY, true, "Healthy", "ok"), Utc::now());
        let value = serde_json::to_value(&conds).unwrap();
        assert!(value.is_array());
        assert_eq!(value[0]["type"], "Ready");
        assert_eq!(value[0]["status"], "True");

        let back: Conditions = serde_json::from_value(value).unwrap();
        assert_eq!(back, conds);
    }
}
