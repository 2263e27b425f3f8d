//! Subscription change detection over linked resources
//!
//! Agents and tables determine which topics an app consumes. A rebalance is
//! only needed when the effective set of topics, patterns or table
//! changelogs changes, not when the number of resources does.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::adapters::LinkedResources;
use crate::crd::{AgentSubscription, LinkedResourcesSnapshot, TableSubscription};
use crate::error::Result;

/// Build the subscription-relevant snapshot of fetched sibling resources
pub fn snapshot_from(linked: &LinkedResources) -> LinkedResourcesSnapshot {
    let mut snapshot = LinkedResourcesSnapshot::default();

    for agent in &linked.agents {
        let Some(name) = agent.metadata.name.clone() else {
            continue;
        };
        let topic = agent.spec.input.as_ref().and_then(|i| i.topic.as_ref());
        snapshot.agents.insert(
            name,
            AgentSubscription {
                topic_name: topic.and_then(|t| t.name.clone()),
                topic_pattern: topic.and_then(|t| t.pattern.clone()),
            },
        );
    }
    for table in &linked.tables {
        if let Some(name) = table.metadata.name.clone() {
            snapshot.tables.insert(
                name,
                TableSubscription {
                    name: table.spec.name.clone(),
                },
            );
        }
    }
    snapshot.webviews = linked
        .webviews
        .iter()
        .filter_map(|w| w.metadata.name.clone())
        .collect();
    snapshot.tasks = linked
        .tasks
        .iter()
        .filter_map(|t| t.metadata.name.clone())
        .collect();

    snapshot
}

/// Union of everything an app subscribes to
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EffectiveSubscriptions {
    pub topics: BTreeSet<String>,
    pub patterns: BTreeSet<String>,
    pub tables: BTreeSet<String>,
}

impl EffectiveSubscriptions {
    pub fn of(snapshot: &LinkedResourcesSnapshot) -> Self {
        let mut subs = Self::default();
        for agent in snapshot.agents.values() {
            if let Some(names) = &agent.topic_name {
                subs.topics.extend(
                    names
                        .split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string),
                );
            }
            if let Some(pattern) = &agent.topic_pattern {
                let pattern = pattern.trim();
                if !pattern.is_empty() {
                    subs.patterns.insert(pattern.to_string());
                }
            }
        }
        subs.tables = snapshot.tables.values().map(|t| t.name.clone()).collect();
        subs
    }

    /// Entries present in `self` but not in `other`, prefixed by their category
    fn minus(&self, other: &Self) -> Vec<String> {
        let topics = self.topics.difference(&other.topics).map(|t| format!("topic:{}", t));
        let patterns = self
            .patterns
            .difference(&other.patterns)
            .map(|p| format!("pattern:{}", p));
        let tables = self.tables.difference(&other.tables).map(|t| format!("table:{}", t));
        topics.chain(patterns).chain(tables).collect()
    }
}

/// Verdict of one detection cycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionChange {
    /// Sibling lookup failed; keep the stored snapshot and flag untouched
    Skipped { reason: String },
    /// No snapshot was stored yet; store one without requesting a rebalance
    Initialized(LinkedResourcesSnapshot),
    /// Effective subscriptions are the same; store the fresh snapshot
    Unchanged(LinkedResourcesSnapshot),
    /// Effective subscriptions differ; store the snapshot and require a rebalance
    Changed {
        snapshot: LinkedResourcesSnapshot,
        added: Vec<String>,
        removed: Vec<String>,
    },
}

/// Compare a freshly fetched snapshot against the stored one
pub fn detect_change(
    previous: Option<&LinkedResourcesSnapshot>,
    fetched: Result<LinkedResourcesSnapshot>,
) -> SubscriptionChange {
    let current = match fetched {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(error = %e, "Skipping subscription change detection");
            return SubscriptionChange::Skipped {
                reason: e.to_string(),
            };
        }
    };

    let Some(previous) = previous else {
        return SubscriptionChange::Initialized(current);
    };

    let before = EffectiveSubscriptions::of(previous);
    let after = EffectiveSubscriptions::of(&current);
    if before == after {
        return SubscriptionChange::Unchanged(current);
    }

    let added = after.minus(&before);
    let removed = before.minus(&after);
    info!(?added, ?removed, "Subscriptions changed");
    SubscriptionChange::Changed {
        snapshot: current,
        added,
        removed,
    }
}

impl SubscriptionChange {
    /// Apply the verdict to the stored snapshot and rebalance flag
    pub fn apply(
        self,
        snapshot: &mut Option<LinkedResourcesSnapshot>,
        rebalance_required: &mut Option<bool>,
    ) {
        match self {
            SubscriptionChange::Skipped { .. } => {}
            SubscriptionChange::Initialized(current) | SubscriptionChange::Unchanged(current) => {
                *snapshot = Some(current);
            }
            SubscriptionChange::Changed { snapshot: current, .. } => {
                *snapshot = Some(current);
                *rebalance_required = Some(true);
            }
        }
    }
}
