//! KasprApp status conditions and status subresource writes

use chrono::{DateTime, Utc};
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::crd::{
    Condition, KasprApp, KasprAppStatus, PROGRESSING, READY, SUBSCRIPTIONS_TRACKED,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::resources::FIELD_MANAGER;

use super::hung::HungVerdict;
use super::subscriptions::SubscriptionChange;

/// Attempts of a status write when it keeps hitting conflicts
pub const STATUS_WRITE_ATTEMPTS: usize = 3;

/// Rollout state of the app's StatefulSet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rollout {
    /// A spec change was just applied or not yet observed
    NewSpec,
    /// Waiting for members to become available
    Reconciling { available: i32, desired: i32 },
    /// Every member runs the current spec
    Complete,
}

impl Rollout {
    pub fn progressing(&self) -> bool {
        !matches!(self, Rollout::Complete)
    }
}

/// Upsert Progressing and Ready for the outcome of a pass
pub fn derive_conditions(
    status: &mut KasprAppStatus,
    rollout: Rollout,
    hung: &HungVerdict,
    generation: Option<i64>,
    now: DateTime<Utc>,
) {
    let (progressing, ready) = match rollout {
        Rollout::NewSpec => (
            Condition::new(PROGRESSING, true, "NewSpec", "Applying new spec"),
            Condition::new(READY, false, "NotReady", "Waiting for the new spec to roll out"),
        ),
        Rollout::Reconciling { available, desired } => (
            Condition::new(
                PROGRESSING,
                true,
                "Reconciling",
                format!("{}/{} members available", available, desired),
            ),
            Condition::new(
                READY,
                false,
                "NotReady",
                format!("{}/{} members available", available, desired),
            ),
        ),
        Rollout::Complete => (
            Condition::new(PROGRESSING, false, "ReconcileComplete", "All members up to date"),
            Condition::new(READY, true, "Healthy", "All members available"),
        ),
    };

    let ready = if hung.any_hung() {
        Condition::new(READY, false, "HungMembers", hung.summary())
    } else {
        ready
    };

    status
        .conditions
        .upsert(progressing.with_generation(generation), now);
    status.conditions.upsert(ready.with_generation(generation), now);
}

/// Upsert the conditions of a pass that failed before reaching status work
pub fn error_conditions(
    status: &mut KasprAppStatus,
    error: &Error,
    generation: Option<i64>,
    now: DateTime<Utc>,
) {
    let message = format!("{}: {}", error.reason(), error);
    status.conditions.upsert(
        Condition::new(PROGRESSING, false, "Error", message.clone()).with_generation(generation),
        now,
    );
    status.conditions.upsert(
        Condition::new(READY, false, "Error", message).with_generation(generation),
        now,
    );
}

/// SubscriptionsTracked condition for one detection cycle
pub fn subscriptions_condition(change: &SubscriptionChange) -> Condition {
    match change {
        SubscriptionChange::Skipped { reason } => Condition::new(
            SUBSCRIPTIONS_TRACKED,
            false,
            "LinkedResourceFetchFailed",
            reason.clone(),
        ),
        SubscriptionChange::Initialized(_) => Condition::new(
            SUBSCRIPTIONS_TRACKED,
            true,
            "SnapshotInitialized",
            "Recorded the first linked resource snapshot",
        ),
        SubscriptionChange::Unchanged(_) => Condition::new(
            SUBSCRIPTIONS_TRACKED,
            true,
            "SubscriptionsUnchanged",
            "Effective subscriptions unchanged",
        ),
        SubscriptionChange::Changed { added, removed, .. } => Condition::new(
            SUBSCRIPTIONS_TRACKED,
            true,
            "SubscriptionsChanged",
            format!("added: [{}], removed: [{}]", added.join(", "), removed.join(", ")),
        ),
    }
}

/// JSON merge patch turning `stored` into `desired`.
///
/// Object keys missing from `desired` are nulled so members, tracking
/// entries and cleared fields are removed rather than merged.
pub fn status_patch(stored: &Value, desired: &Value) -> Value {
    match (stored, desired) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for key in old.keys().filter(|k| !new.contains_key(*k)) {
                patch.insert(key.clone(), Value::Null);
            }
            for (key, value) in new {
                let entry = match old.get(key) {
                    Some(previous) => status_patch(previous, value),
                    None => value.clone(),
                };
                patch.insert(key.clone(), entry);
            }
            Value::Object(patch)
        }
        (_, desired) => desired.clone(),
    }
}

/// Write the status subresource, retrying on optimistic concurrency conflicts
pub async fn write_status(
    api: &Api<KasprApp>,
    app: &KasprApp,
    desired: &KasprAppStatus,
) -> Result<()> {
    let name = app.name_any();
    let desired_value = serde_json::to_value(desired)?;
    let mut stored = serde_json::to_value(app.status.clone().unwrap_or_default())?;
    let mut resource_version = app.resource_version();

    for attempt in 1..=STATUS_WRITE_ATTEMPTS {
        let mut patch = json!({ "status": status_patch(&stored, &desired_value) });
        if let Some(rv) = &resource_version {
            patch["metadata"] = json!({ "resourceVersion": rv });
        }

        match api
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {
                debug!(name = %name, attempt, "Status updated");
                metrics::STATUS_UPDATES.with_label_values(&["success"]).inc();
                return Ok(());
            }
            Err(e) => {
                let e = Error::from(e);
                if !e.is_conflict() || attempt == STATUS_WRITE_ATTEMPTS {
                    metrics::STATUS_UPDATES.with_label_values(&["error"]).inc();
                    return Err(e);
                }
                warn!(name = %name, attempt, "Status write conflicted, re-reading");
                metrics::STATUS_UPDATES.with_label_values(&["conflict"]).inc();
                let latest = api.get_status(&name).await?;
                resource_version = latest.resource_version();
                stored = serde_json::to_value(latest.status.unwrap_or_default())?;
            }
        }
    }

    Err(Error::config("status write attempts exhausted"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::HungMemberEntry;
    use std::collections::BTreeMap;

    #[test]
    fn test_complete_rollout_is_healthy() {
        let mut status = KasprAppStatus::default();
        derive_conditions(&mut status, Rollout::Complete, &HungVerdict::default(), Some(2), Utc::now());
        assert!(!status.conditions.is_true(PROGRESSING));
        assert!(status.conditions.is_true(READY));
        let ready = status.conditions.get(READY).unwrap();
        assert_eq!(ready.reason.as_deref(), Some("Healthy"));
        assert_eq!(ready.observed_generation, Some(2));
    }

    #[test]
    fn test_hung_members_override_healthy() {
        let mut status = KasprAppStatus::default();
        let verdict = HungVerdict {
            hung: BTreeMap::from([("orders-app-1".to_string(), 2)]),
            ..Default::default()
        };
        derive_conditions(&mut status, Rollout::Complete, &verdict, None, Utc::now());
        let ready = status.conditions.get(READY).unwrap();
        assert!(!ready.is_true());
        assert_eq!(ready.reason.as_deref(), Some("HungMembers"));
        assert!(ready.message.as_deref().unwrap().contains("orders-app-1 (2/3)"));
    }

    #[test]
    fn test_error_conditions() {
        let mut status = KasprAppStatus::default();
        error_conditions(
            &mut status,
            &Error::validation("bootstrapServers must not be empty"),
            Some(1),
            Utc::now(),
        );
        let progressing = status.conditions.get(PROGRESSING).unwrap();
        assert_eq!(progressing.reason.as_deref(), Some("Error"));
        assert!(progressing
            .message
            .as_deref()
            .unwrap()
            .starts_with("ValidationFailed"));
        assert!(!status.conditions.is_true(READY));
    }

    #[test]
    fn test_status_patch_nulls_removed_entries() {
        let now = Utc::now();
        let mut stored = KasprAppStatus::default();
        stored.hung_members.insert(
            "orders-app-0".to_string(),
            HungMemberEntry {
                strikes: 2,
                first_detected: now,
                last_detected: now,
            },
        );
        stored.rebalance_required = Some(true);
        let mut desired = KasprAppStatus::default();
        desired.rebalance_required = Some(false);

        let patch = status_patch(
            &serde_json::to_value(&stored).unwrap(),
            &serde_json::to_value(&desired).unwrap(),
        );
        assert_eq!(patch["hungMembers"], Value::Null);
        assert_eq!(patch["rebalanceRequired"], Value::Bool(false));
    }

    #[test]
    fn test_status_patch_nested_member_removal() {
        let stored = json!({ "members": { "a-0": { "leader": true }, "a-1": { "leader": false } } });
        let desired = json!({ "members": { "a-0": { "leader": true } } });
        let patch = status_patch(&stored, &desired);
        assert_eq!(patch["members"]["a-1"], Value::Null);
        assert_eq!(patch["members"]["a-0"]["leader"], Value::Bool(true));
    }
}
