//! KasprApp reconciliation pass
//!
//! A pass is split in three:
//! - observe: list linked resources, sync child objects (fatal on failure)
//!   and read the cluster
//! - plan: a pure function folding the observation into the next status
//! - execute: side effects in a fixed order, status before terminations

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{
    ensure_sasl_secret, fetch_linked_resources, member_url, LinkedResources, MemberEndpoint,
    MemberRead,
};
use crate::controllers::{app_key, Context};
use crate::crd::{
    Condition, ConditionStatus, KasprApp, KasprAppStatus, LinkedResourcesSnapshot,
    MEMBERS_OBSERVED, REBALANCE_REQUIRED,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::resources::{
    delete_pod, render_linked, sync_resource, validate_spec, AppNames, AppResources,
    ComponentMounts, SyncOutcome, KASPR_CONTAINER_NAME,
};
use crate::settings::{EffectiveConfig, REBALANCE_ANNOTATION};

use super::hung::{detect_hung, HungPolicy, HungVerdict};
use super::members::{track_members, MemberTransition};
use super::rebalance::{decide_rebalance, RebalanceDecision, RebalanceInputs, RebalanceTrigger};
use super::status::{self, derive_conditions, error_conditions, Rollout};
use super::subscriptions::{detect_change, snapshot_from, SubscriptionChange};

const POD_DELETE_TIMEOUT: Duration = Duration::from_secs(30);

/// Rollout facts read from the app's StatefulSet
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatefulSetState {
    pub available_replicas: i32,
    /// Image tag of the kaspr container
    pub kaspr_version: Option<String>,
    pub rollout_complete: bool,
}

impl StatefulSetState {
    pub fn from_statefulset(sts: &StatefulSet) -> Self {
        let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let status = sts.status.as_ref();
        let available_replicas = status.and_then(|s| s.available_replicas).unwrap_or(0);
        let updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);
        let observed = status.and_then(|s| s.observed_generation);
        let revisions_settled = status.map_or(false, |s| {
            s.update_revision.is_none() || s.current_revision == s.update_revision
        });

        let kaspr_version = sts
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|pod| pod.containers.iter().find(|c| c.name == KASPR_CONTAINER_NAME))
            .and_then(|c| c.image.as_deref())
            .and_then(|image| image.rsplit_once(':'))
            .map(|(_, tag)| tag.to_string());

        Self {
            available_replicas,
            kaspr_version,
            rollout_complete: observed >= sts.metadata.generation
                && updated == replicas
                && revisions_settled,
        }
    }
}

/// Outcome of reading the member web APIs
#[derive(Clone, Debug)]
pub enum MemberReads {
    /// Status checks are disabled
    Skipped,
    /// No member could be read; the member table is cleared
    Failed(String),
    Read(BTreeMap<String, MemberRead>),
}

/// Everything a pass learned about the cluster
#[derive(Debug)]
pub struct Observation {
    pub generation: Option<i64>,
    pub desired_replicas: i32,
    /// The child sync created or changed an object
    pub spec_changed: bool,
    /// None when the StatefulSet could not be read
    pub statefulset: Option<StatefulSetState>,
    pub member_reads: MemberReads,
    pub linked: Result<LinkedResourcesSnapshot>,
    /// Members whose termination failed last pass
    pub termination_retry: BTreeSet<String>,
}

/// Next status plus the side effects still to be issued
#[derive(Clone, Debug)]
pub struct PassPlan {
    pub status: KasprAppStatus,
    pub rollout: Rollout,
    pub rebalance: RebalanceDecision,
    pub manual_requested: bool,
    pub subscriptions_changed: bool,
    pub transitions: Vec<MemberTransition>,
    pub hung: HungVerdict,
    pub terminations: Vec<String>,
}

/// Fold an observation into the next status.
///
/// Nothing here talks to the cluster; every decision of the pass is made
/// before the first write.
pub fn plan_pass(
    previous: &KasprAppStatus,
    observation: Observation,
    config: &EffectiveConfig,
    now: DateTime<Utc>,
) -> PassPlan {
    let mut status = previous.clone();
    let desired = observation.desired_replicas;

    let new_spec = observation.spec_changed || previous.observed_generation != observation.generation;
    let available = match &observation.statefulset {
        Some(sts) => {
            status.available_replicas = Some(sts.available_replicas);
            if let Some(version) = &sts.kaspr_version {
                status.kaspr_version = Some(version.clone());
            }
            sts.available_replicas
        }
        None => previous.available_replicas.unwrap_or(0),
    };
    status.desired_replicas = Some(desired);
    status.observed_generation = observation.generation;

    let rollout = if new_spec {
        Rollout::NewSpec
    } else if available == desired
        && observation
            .statefulset
            .as_ref()
            .map_or(false, |sts| sts.rollout_complete)
    {
        Rollout::Complete
    } else {
        Rollout::Reconciling { available, desired }
    };

    let generation = observation.generation;
    let change = detect_change(previous.linked_resources.as_ref(), observation.linked);
    let subscriptions_changed = matches!(change, SubscriptionChange::Changed { .. });
    status.conditions.upsert(
        status::subscriptions_condition(&change).with_generation(generation),
        now,
    );
    change.apply(&mut status.linked_resources, &mut status.rebalance_required);

    let (transitions, members_condition) = match &observation.member_reads {
        MemberReads::Read(reads) => {
            let table = track_members(&previous.members, reads, now);
            status.members = table.members;
            let condition = Condition::new(
                MEMBERS_OBSERVED,
                true,
                "MemberStatusRead",
                format!("{} members rebalancing", table.rebalancing_summary),
            );
            status.rebalancing_members = Some(table.rebalancing_summary);
            (table.transitions, condition)
        }
        MemberReads::Failed(reason) => {
            warn!(reason = %reason, "Member status unavailable, dropping cached member state");
            (
                Vec::new(),
                Condition::new(MEMBERS_OBSERVED, false, "MemberStatusUnavailable", reason.clone()),
            )
        }
        MemberReads::Skipped => (
            Vec::new(),
            Condition::new(
                MEMBERS_OBSERVED,
                ConditionStatus::Unknown,
                "StatusCheckDisabled",
                "Member status checks are disabled",
            ),
        ),
    };
    let members_fresh = matches!(observation.member_reads, MemberReads::Read(_));
    if !members_fresh {
        // Cached entries would carry stale flags and transition times
        status.members.clear();
        status.rebalancing_members = None;
    }
    status
        .conditions
        .upsert(members_condition.with_generation(generation), now);

    let hung = if members_fresh {
        detect_hung(
            &previous.hung_members,
            &status.members,
            rollout.progressing(),
            &observation.termination_retry,
            &HungPolicy {
                enabled: config.hung_detection_enabled,
                threshold_seconds: config.hung_threshold_seconds,
                max_terminations: config.max_terminations_per_pass,
            },
            now,
        )
    } else {
        HungVerdict::default()
    };
    status.hung_members = hung.tracking.clone();
    for member in &hung.to_terminate {
        // A replacement pod reuses the id and must start with a fresh entry
        status.members.remove(member);
    }

    derive_conditions(&mut status, rollout, &hung, generation, now);

    let rebalance = decide_rebalance(&RebalanceInputs {
        rebalance_required: status.rebalance_required.unwrap_or(false),
        manual_requested: config.manual_rebalance,
        auto_enabled: config.auto_rebalance,
        progressing: rollout.progressing(),
        available_replicas: available,
        desired_replicas: desired,
        members: &status.members,
    });

    PassPlan {
        terminations: hung.to_terminate.clone(),
        status,
        rollout,
        rebalance,
        manual_requested: config.manual_rebalance,
        subscriptions_changed,
        transitions,
        hung,
    }
}

/// Side effects of a pass, issued by [`execute_plan`]
#[async_trait]
pub trait ClusterEffects: Send + Sync {
    /// Ask the leader member to rebalance the group
    async fn request_rebalance(&self, leader: &str) -> Result<()>;

    /// Remove the manual rebalance annotation and report the outcome
    async fn finish_manual_rebalance(&self, outcome: std::result::Result<(), String>) -> Result<()>;

    async fn write_status(&self, status: &KasprAppStatus) -> Result<()>;

    /// Delete a member's pod
    async fn terminate_member(&self, member: &str) -> Result<()>;
}

/// What became of the rebalance decision
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RebalanceOutcome {
    NotRequested,
    Sent(RebalanceTrigger),
    Failed { trigger: RebalanceTrigger, message: String },
    Blocked { trigger: RebalanceTrigger, reason: String },
}

/// Result of executing a plan
#[derive(Clone, Debug)]
pub struct PassReport {
    pub status: KasprAppStatus,
    pub rebalance: RebalanceOutcome,
    pub terminated: Vec<String>,
    pub failed_terminations: BTreeSet<String>,
}

/// Issue the side effects of a plan.
///
/// Order: rebalance, manual annotation cleanup, status write, terminations.
/// A failed status write ends the pass before any pod is deleted; a failed
/// termination only affects that member.
pub async fn execute_plan(
    plan: PassPlan,
    effects: &dyn ClusterEffects,
    now: DateTime<Utc>,
) -> Result<PassReport> {
    let PassPlan {
        mut status,
        rebalance,
        manual_requested,
        terminations,
        ..
    } = plan;

    let outcome = match rebalance {
        RebalanceDecision::None => RebalanceOutcome::NotRequested,
        RebalanceDecision::Blocked { trigger, reason } => {
            info!(trigger = trigger.as_str(), reason = %reason, "Rebalance deferred");
            RebalanceOutcome::Blocked {
                trigger,
                reason: reason.to_string(),
            }
        }
        RebalanceDecision::Request {
            trigger,
            leader,
            clears_required,
        } => match effects.request_rebalance(&leader).await {
            Ok(()) => {
                info!(trigger = trigger.as_str(), leader = %leader, "Rebalance requested");
                if clears_required {
                    status.rebalance_required = Some(false);
                }
                status.last_rebalance_time = Some(now);
                RebalanceOutcome::Sent(trigger)
            }
            Err(e) => {
                warn!(trigger = trigger.as_str(), leader = %leader, error = %e, "Rebalance request failed");
                RebalanceOutcome::Failed {
                    trigger,
                    message: e.to_string(),
                }
            }
        },
    };

    if manual_requested {
        let result = match &outcome {
            RebalanceOutcome::Sent(_) => Ok(()),
            RebalanceOutcome::Failed { message, .. } => Err(message.clone()),
            RebalanceOutcome::Blocked { reason, .. } => Err(reason.clone()),
            RebalanceOutcome::NotRequested => Err("rebalance not requested".to_string()),
        };
        if let Err(e) = effects.finish_manual_rebalance(result).await {
            warn!(error = %e, "Failed to clear manual rebalance annotation");
        }
    }

    let generation = status.observed_generation;
    status.conditions.upsert(
        rebalance_condition(status.rebalance_required.unwrap_or(false), &outcome)
            .with_generation(generation),
        now,
    );

    effects.write_status(&status).await?;

    let mut terminated = Vec::new();
    let mut failed_terminations = BTreeSet::new();
    for member in terminations {
        match effects.terminate_member(&member).await {
            Ok(()) => {
                info!(member = %member, "Terminated hung member");
                terminated.push(member);
            }
            Err(e) => {
                error!(member = %member, error = %e, "Failed to terminate hung member");
                failed_terminations.insert(member);
            }
        }
    }

    Ok(PassReport {
        status,
        rebalance: outcome,
        terminated,
        failed_terminations,
    })
}

/// RebalanceRequired condition carrying the outcome of this pass's rebalance
fn rebalance_condition(required: bool, outcome: &RebalanceOutcome) -> Condition {
    match outcome {
        RebalanceOutcome::Sent(trigger) => Condition::new(
            REBALANCE_REQUIRED,
            required,
            "RebalanceRequested",
            format!("{} rebalance sent to the leader member", trigger.as_str()),
        ),
        RebalanceOutcome::Failed { trigger, message } => Condition::new(
            REBALANCE_REQUIRED,
            required,
            "RebalanceFailed",
            format!("{} rebalance failed: {}", trigger.as_str(), message),
        ),
        RebalanceOutcome::Blocked { trigger, reason } => Condition::new(
            REBALANCE_REQUIRED,
            required,
            "RebalanceBlocked",
            format!("{} rebalance deferred: {}", trigger.as_str(), reason),
        ),
        RebalanceOutcome::NotRequested if required => Condition::new(
            REBALANCE_REQUIRED,
            true,
            "RebalancePending",
            "Subscriptions changed and automatic rebalance is disabled",
        ),
        RebalanceOutcome::NotRequested => Condition::new(
            REBALANCE_REQUIRED,
            false,
            "NoRebalanceNeeded",
            "Subscriptions match the last rebalance",
        ),
    }
}

/// Cluster-backed effects for one app
struct LiveEffects<'a> {
    ctx: &'a Context,
    app: &'a KasprApp,
    api: Api<KasprApp>,
    names: AppNames,
    namespace: String,
    web_port: i32,
    grace_seconds: u32,
    recorder: Recorder,
}

#[async_trait]
impl ClusterEffects for LiveEffects<'_> {
    async fn request_rebalance(&self, leader: &str) -> Result<()> {
        let ordinal = self
            .names
            .member_ordinal(leader)
            .ok_or_else(|| Error::status_client(format!("unknown member '{}'", leader)))?;
        let url = member_url(
            &self.names.stateful_set,
            &self.names.headless_service,
            &self.namespace,
            ordinal,
            self.web_port,
        );
        let _timer = metrics::REBALANCE_DURATION
            .with_label_values(&[self.namespace.as_str(), self.names.app.as_str()])
            .start_timer();
        self.ctx.web_client.rebalance(&url).await
    }

    async fn finish_manual_rebalance(&self, outcome: std::result::Result<(), String>) -> Result<()> {
        let patch = json!({ "metadata": { "annotations": { REBALANCE_ANNOTATION: null } } });
        self.api
            .patch(&self.app.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        let event = match outcome {
            Ok(()) => Event {
                type_: EventType::Normal,
                reason: "RebalanceRequested".into(),
                note: Some("Rebalance requested from the leader member".into()),
                action: "Rebalance".into(),
                secondary: None,
            },
            Err(message) => Event {
                type_: EventType::Warning,
                reason: "RebalanceFailed".into(),
                note: Some(message),
                action: "Rebalance".into(),
                secondary: None,
            },
        };
        self.recorder.publish(event).await?;
        Ok(())
    }

    async fn write_status(&self, desired: &KasprAppStatus) -> Result<()> {
        status::write_status(&self.api, self.app, desired).await
    }

    async fn terminate_member(&self, member: &str) -> Result<()> {
        delete_pod(
            &self.ctx.client,
            &self.namespace,
            member,
            self.grace_seconds,
            POD_DELETE_TIMEOUT,
        )
        .await
    }
}

/// Validate the spec and bring every child object in line with it.
///
/// Component definitions are synced and mounted from `linked`. Without a
/// linked resource listing the StatefulSet is left as it is, since its
/// mounts cannot be known. Returns the child names and whether any object
/// was created or changed.
async fn sync_children(
    client: &Client,
    app: &KasprApp,
    linked: Option<&LinkedResources>,
) -> Result<(AppNames, bool)> {
    validate_spec(&app.spec)?;
    let mut resources = AppResources::new(app)?;
    let namespace = resources.namespace().to_string();
    if let Some(sasl) = &app.spec.authentication.sasl {
        ensure_sasl_secret(client, &namespace, sasl).await?;
    }

    let mut outcomes = vec![
        sync_resource(client, &namespace, resources.build_service()).await?,
        sync_resource(client, &namespace, resources.build_headless_service()).await?,
        sync_resource(client, &namespace, resources.build_service_account()).await?,
        sync_resource(client, &namespace, resources.build_config_map()).await?,
    ];

    if let Some(linked) = linked {
        let mut mounts = ComponentMounts::default();
        for rendered in render_linked(linked)? {
            mounts.push(&rendered);
            outcomes.push(sync_resource(client, &namespace, rendered.config_map).await?);
        }
        resources = resources.with_components(mounts);
        outcomes.push(sync_resource(client, &namespace, resources.build_statefulset()?).await?);
    } else {
        warn!("Linked resources unavailable, leaving StatefulSet unchanged");
    }

    Ok((
        resources.names().clone(),
        outcomes.iter().any(SyncOutcome::changed),
    ))
}

/// Read StatefulSet and member state; never fails
async fn observe(
    ctx: &Context,
    app: &KasprApp,
    names: &AppNames,
    namespace: &str,
    spec_changed: bool,
    linked: Result<LinkedResources>,
) -> Observation {
    let statefulsets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), namespace);
    let statefulset = match statefulsets.get_opt(&names.stateful_set).await {
        Ok(sts) => sts.as_ref().map(StatefulSetState::from_statefulset),
        Err(e) => {
            warn!(error = %e, "Failed to read StatefulSet");
            None
        }
    };

    let member_reads = if !ctx.settings.client_status_check_enabled {
        MemberReads::Skipped
    } else {
        match &statefulset {
            None => MemberReads::Failed("StatefulSet state unavailable".to_string()),
            Some(sts) if sts.available_replicas == 0 => MemberReads::Read(BTreeMap::new()),
            Some(_) => {
                let endpoints: Vec<MemberEndpoint> = (0..app.spec.replicas)
                    .map(|ordinal| MemberEndpoint {
                        id: names.member_id(ordinal),
                        url: member_url(
                            &names.stateful_set,
                            &names.headless_service,
                            namespace,
                            ordinal,
                            app.spec.web_port(),
                        ),
                    })
                    .collect();
                match ctx.web_client.fetch_members(&endpoints).await {
                    Ok(reads) => MemberReads::Read(reads),
                    Err(e) => MemberReads::Failed(e.to_string()),
                }
            }
        }
    };

    let linked = linked.map(|linked| snapshot_from(&linked));

    Observation {
        generation: app.metadata.generation,
        desired_replicas: app.spec.replicas,
        spec_changed,
        statefulset,
        member_reads,
        linked,
        termination_retry: ctx.termination_retries(&app_key(app)),
    }
}

fn record_plan_metrics(namespace: &str, name: &str, previous: &KasprAppStatus, plan: &PassPlan) {
    for transition in &plan.transitions {
        for field in transition.fields.iter().copied() {
            metrics::MEMBER_STATE_TRANSITIONS
                .with_label_values(&[namespace, name, field])
                .inc();
        }
    }

    if plan.hung.any_hung() {
        metrics::HUNG_MEMBERS_DETECTED
            .with_label_values(&[namespace, name])
            .inc_by(plan.hung.hung.len() as f64);
    }
    for (member, strikes) in &plan.hung.hung {
        metrics::HUNG_MEMBER_CONSECUTIVE_DETECTIONS
            .with_label_values(&[namespace, name, member.as_str()])
            .set(f64::from(*strikes));
    }
    let cleared = previous
        .hung_members
        .keys()
        .filter(|member| !plan.hung.hung.contains_key(*member))
        .chain(plan.terminations.iter());
    for member in cleared {
        let _ = metrics::HUNG_MEMBER_CONSECUTIVE_DETECTIONS
            .remove_label_values(&[namespace, name, member.as_str()]);
    }
}

fn record_report_metrics(namespace: &str, name: &str, report: &PassReport) {
    let rebalance = match &report.rebalance {
        RebalanceOutcome::Sent(trigger) => Some((trigger, "success")),
        RebalanceOutcome::Failed { trigger, .. } => Some((trigger, "error")),
        RebalanceOutcome::Blocked { trigger, .. } => Some((trigger, "blocked")),
        RebalanceOutcome::NotRequested => None,
    };
    if let Some((trigger, result)) = rebalance {
        metrics::REBALANCES_TOTAL
            .with_label_values(&[namespace, name, trigger.as_str(), result])
            .inc();
    }

    metrics::MEMBER_TERMINATIONS
        .with_label_values(&[namespace, name, "success"])
        .inc_by(report.terminated.len() as f64);
    metrics::MEMBER_TERMINATIONS
        .with_label_values(&[namespace, name, "error"])
        .inc_by(report.failed_terminations.len() as f64);
}

/// Run one full pass for an app.
///
/// Child sync failures are surfaced as Error conditions and returned. Once
/// the children are in sync, read failures only degrade the pass.
#[instrument(skip(app, ctx), fields(name = %app.name_any(), namespace = app.namespace()))]
pub async fn reconcile(app: &KasprApp, ctx: &Context) -> Result<()> {
    let config = EffectiveConfig::resolve(&ctx.settings, app.annotations());
    if config.paused {
        info!("Reconciliation paused by annotation");
        return Ok(());
    }

    let name = app.name_any();
    let namespace = app.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<KasprApp> = Api::namespaced(ctx.client.clone(), &namespace);
    let previous = app.status.clone().unwrap_or_default();

    let linked = fetch_linked_resources(&ctx.client, &namespace, &name).await;
    let (names, spec_changed) = match sync_children(&ctx.client, app, linked.as_ref().ok()).await {
        Ok(synced) => synced,
        Err(e) => {
            error!(error = %e, "Failed to sync child resources");
            let mut failed = previous.clone();
            error_conditions(&mut failed, &e, app.metadata.generation, Utc::now());
            if let Err(write_err) = status::write_status(&api, app, &failed).await {
                warn!(error = %write_err, "Failed to record sync error in status");
            }
            return Err(e);
        }
    };

    let observation = observe(ctx, app, &names, &namespace, spec_changed, linked).await;
    let now = Utc::now();
    let plan = plan_pass(&previous, observation, &config, now);
    debug!(
        rollout = ?plan.rollout,
        rebalance = ?plan.rebalance,
        subscriptions_changed = plan.subscriptions_changed,
        terminations = plan.terminations.len(),
        "Planned pass"
    );
    record_plan_metrics(&namespace, &name, &previous, &plan);

    let effects = LiveEffects {
        ctx,
        app,
        api,
        web_port: app.spec.web_port(),
        grace_seconds: config.termination_grace_seconds,
        recorder: Recorder::new(ctx.client.clone(), ctx.reporter.clone(), app.object_ref(&())),
        names,
        namespace: namespace.clone(),
    };
    let report = execute_plan(plan, &effects, now).await?;
    record_report_metrics(&namespace, &name, &report);

    ctx.set_termination_retries(&app_key(app), report.failed_terminations);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemberReport;
    use crate::crd::{HungMemberEntry, MemberState};
    use crate::settings::Settings;
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use prometheus::core::Collector;

    fn statefulset(generation: i64, status: StatefulSetStatus) -> StatefulSet {
        let mut sts = StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: Some(3),
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: KASPR_CONTAINER_NAME.to_string(),
                            image: Some("kasprio/kaspr:0.6.2".to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            status: Some(status),
            ..Default::default()
        };
        sts.metadata.generation = Some(generation);
        sts
    }

    #[test]
    fn test_statefulset_rollout_complete() {
        let state = StatefulSetState::from_statefulset(&statefulset(
            4,
            StatefulSetStatus {
                available_replicas: Some(3),
                updated_replicas: Some(3),
                observed_generation: Some(4),
                current_revision: Some("rev-2".to_string()),
                update_revision: Some("rev-2".to_string()),
                ..Default::default()
            },
        ));
        assert!(state.rollout_complete);
        assert_eq!(state.available_replicas, 3);
        assert_eq!(state.kaspr_version.as_deref(), Some("0.6.2"));
    }

    #[test]
    fn test_statefulset_rollout_in_flight() {
        let stale_generation = StatefulSetState::from_statefulset(&statefulset(
            5,
            StatefulSetStatus {
                available_replicas: Some(3),
                updated_replicas: Some(3),
                observed_generation: Some(4),
                ..Default::default()
            },
        ));
        assert!(!stale_generation.rollout_complete);

        let revisions_differ = StatefulSetState::from_statefulset(&statefulset(
            4,
            StatefulSetStatus {
                available_replicas: Some(3),
                updated_replicas: Some(3),
                observed_generation: Some(4),
                current_revision: Some("rev-1".to_string()),
                update_revision: Some("rev-2".to_string()),
                ..Default::default()
            },
        ));
        assert!(!revisions_differ.rollout_complete);
    }

    #[test]
    fn test_terminated_member_leaves_no_detection_gauge() {
        let now = Utc::now();
        let member = "gauge-app-0".to_string();
        let previous = KasprAppStatus {
            observed_generation: Some(1),
            members: BTreeMap::from([(
                member.clone(),
                MemberState {
                    leader: true,
                    rebalancing: true,
                    recovering: false,
                    last_transition_time: now - chrono::Duration::seconds(400),
                },
            )]),
            hung_members: BTreeMap::from([(
                member.clone(),
                HungMemberEntry {
                    strikes: 2,
                    first_detected: now,
                    last_detected: now,
                },
            )]),
            ..Default::default()
        };
        let observation = Observation {
            generation: Some(1),
            desired_replicas: 1,
            spec_changed: false,
            statefulset: Some(StatefulSetState {
                available_replicas: 1,
                kaspr_version: None,
                rollout_complete: true,
            }),
            member_reads: MemberReads::Read(BTreeMap::from([(
                member.clone(),
                MemberRead::Reported(MemberReport {
                    leader: true,
                    rebalancing: true,
                    ..Default::default()
                }),
            )])),
            linked: Ok(LinkedResourcesSnapshot::default()),
            termination_retry: BTreeSet::new(),
        };
        let config = EffectiveConfig::resolve(&Settings::default(), &BTreeMap::new());
        let plan = plan_pass(&previous, observation, &config, now);
        assert_eq!(plan.terminations, vec![member.clone()]);

        record_plan_metrics("gauge-ns", "gauge", &previous, &plan);
        let left = metrics::HUNG_MEMBER_CONSECUTIVE_DETECTIONS
            .collect()
            .iter()
            .flat_map(|family| family.get_metric().to_vec())
            .any(|metric| metric.get_label().iter().any(|l| l.get_value() == member));
        assert!(!left);
    }
}
