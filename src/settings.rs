//! Operator-wide settings and per-resource annotation overrides
//!
//! Global defaults come from environment variables (or the equivalent CLI
//! flags). Each reconciliation pass resolves them against the resource's
//! `kaspr.io/*` annotations exactly once into an [`EffectiveConfig`].

use std::collections::BTreeMap;
use std::time::Duration;

use clap::Parser;
use tracing::warn;

/// Annotation that pauses reconciliation of a resource
pub const PAUSE_RECONCILIATION_ANNOTATION: &str = "kaspr.io/pause-reconciliation";

/// One-shot manual rebalance trigger, removed by the operator after acting
pub const REBALANCE_ANNOTATION: &str = "kaspr.io/rebalance";

/// Per-resource override of the global auto-rebalance default
pub const AUTO_REBALANCE_ANNOTATION: &str = "kaspr.io/auto-rebalance";

/// Per-resource override of hung member detection
pub const HUNG_MEMBER_DETECTION_ANNOTATION: &str = "kaspr.io/hung-member-detection-enabled";

/// Per-resource override of the hung rebalancing threshold
pub const HUNG_THRESHOLD_ANNOTATION: &str = "kaspr.io/hung-rebalancing-threshold-seconds";

/// Kaspr Operator settings
#[derive(Parser, Debug, Clone)]
#[command(name = "kaspr-operator")]
#[command(about = "Kubernetes operator for Kaspr stream processing applications")]
#[command(version)]
pub struct Settings {
    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    pub watch_namespace: String,

    /// Metrics and health server port
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,

    /// How often the reconciliation queue is drained, in milliseconds
    #[arg(long, env = "RECONCILE_POLL_INTERVAL_MS", default_value_t = 1500)]
    pub reconcile_poll_interval_ms: u64,

    /// Interval of timer-driven reconciliation requests, in seconds
    #[arg(long, env = "PERIODIC_RECONCILE_SECONDS", default_value_t = 30)]
    pub periodic_reconcile_seconds: u64,

    /// Query each member's status endpoint during reconciliation
    #[arg(
        long,
        env = "CLIENT_STATUS_CHECK_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub client_status_check_enabled: bool,

    /// Timeout for each call to a member's web API, in seconds
    #[arg(long, env = "CLIENT_STATUS_CHECK_TIMEOUT_SECONDS", default_value_t = 5.0)]
    pub client_status_check_timeout_seconds: f64,

    /// Trigger a rebalance automatically when subscriptions change
    #[arg(
        long,
        env = "AUTO_REBALANCE_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub auto_rebalance_enabled: bool,

    /// Detect and terminate members stuck in rebalancing
    #[arg(
        long,
        env = "HUNG_MEMBER_DETECTION_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub hung_member_detection_enabled: bool,

    /// Seconds a member may stay rebalancing before it counts as hung
    #[arg(long, env = "HUNG_REBALANCING_THRESHOLD_SECONDS", default_value_t = 300)]
    pub hung_rebalancing_threshold_seconds: i64,

    /// Maximum hung member terminations issued in one pass
    #[arg(long, env = "HUNG_MEMBER_MAX_TERMINATIONS_PER_PASS", default_value_t = 5)]
    pub hung_member_max_terminations_per_pass: usize,

    /// Grace period for hung member pod deletion, in seconds
    #[arg(long, env = "HUNG_MEMBER_TERMINATION_GRACE_SECONDS", default_value_t = 10)]
    pub hung_member_termination_grace_seconds: u32,
}

impl Settings {
    /// Namespace restriction, if any
    pub fn namespace(&self) -> Option<&str> {
        let ns = self.watch_namespace.trim();
        (!ns.is_empty()).then_some(ns)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_poll_interval_ms.max(1))
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_reconcile_seconds.max(1))
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.client_status_check_timeout_seconds.max(0.1))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            watch_namespace: String::new(),
            metrics_port: 8080,
            reconcile_poll_interval_ms: 1500,
            periodic_reconcile_seconds: 30,
            client_status_check_enabled: true,
            client_status_check_timeout_seconds: 5.0,
            auto_rebalance_enabled: true,
            hung_member_detection_enabled: true,
            hung_rebalancing_threshold_seconds: 300,
            hung_member_max_terminations_per_pass: 5,
            hung_member_termination_grace_seconds: 10,
        }
    }
}

/// Settings in effect for one reconciliation pass of one resource
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub paused: bool,
    pub manual_rebalance: bool,
    pub auto_rebalance: bool,
    pub hung_detection_enabled: bool,
    pub hung_threshold_seconds: i64,
    pub max_terminations_per_pass: usize,
    pub termination_grace_seconds: u32,
}

impl EffectiveConfig {
    /// Resolve global defaults against a resource's annotations
    pub fn resolve(settings: &Settings, annotations: &BTreeMap<String, String>) -> Self {
        let flag = |key: &str, default: bool| match annotations.get(key) {
            None => default,
            Some(raw) => parse_bool(raw).unwrap_or_else(|| {
                warn!(annotation = key, value = %raw, "Ignoring invalid boolean annotation");
                default
            }),
        };

        let hung_threshold_seconds = match annotations.get(HUNG_THRESHOLD_ANNOTATION) {
            None => settings.hung_rebalancing_threshold_seconds,
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    warn!(
                        annotation = HUNG_THRESHOLD_ANNOTATION,
                        value = %raw,
                        "Ignoring invalid threshold annotation"
                    );
                    settings.hung_rebalancing_threshold_seconds
                }
            },
        };

        Self {
            paused: flag(PAUSE_RECONCILIATION_ANNOTATION, false),
            manual_rebalance: rebalance_requested(annotations),
            auto_rebalance: flag(AUTO_REBALANCE_ANNOTATION, settings.auto_rebalance_enabled),
            hung_detection_enabled: flag(
                HUNG_MEMBER_DETECTION_ANNOTATION,
                settings.hung_member_detection_enabled,
            ),
            hung_threshold_seconds,
            max_terminations_per_pass: settings.hung_member_max_terminations_per_pass,
            termination_grace_seconds: settings.hung_member_termination_grace_seconds,
        }
    }
}

/// The rebalance annotation acts on presence; only an explicit false opts out
fn rebalance_requested(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(REBALANCE_ANNOTATION)
        .map_or(false, |raw| parse_bool(raw) != Some(false))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}
