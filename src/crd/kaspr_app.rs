//! KasprApp Custom Resource Definition

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::{Condition, Conditions};

/// Kaspr runtime version used when the spec does not pin one
pub const DEFAULT_KASPR_VERSION: &str = "0.6.2";

/// Container image repository of the Kaspr runtime
pub const DEFAULT_KASPR_IMAGE: &str = "kasprio/kaspr";

/// Default port of the member web API
pub const DEFAULT_WEB_PORT: i32 = 6065;

/// KasprApp resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kaspr.io",
    version = "v1alpha1",
    kind = "KasprApp",
    plural = "kasprapps",
    singular = "kasprapp",
    shortname = "kapp",
    namespaced,
    status = "KasprAppStatus",
    printcolumn = r#"{"name": "Desired", "type": "integer", "jsonPath": ".status.desiredReplicas"}"#,
    printcolumn = r#"{"name": "Available", "type": "integer", "jsonPath": ".status.availableReplicas"}"#,
    printcolumn = r#"{"name": "Rebalancing", "type": "string", "jsonPath": ".status.rebalancingMembers"}"#,
    printcolumn = r#"{"name": "Ready", "type": "string", "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".status.kasprVersion"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KasprAppSpec {
    /// Kaspr runtime version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Container image override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Number of members
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Kafka bootstrap servers (comma separated)
    pub bootstrap_servers: String,

    /// Kafka client authentication
    #[serde(default)]
    pub authentication: AuthenticationSpec,

    /// Application configuration
    #[serde(default)]
    pub config: AppConfigSpec,

    /// Container resource requirements
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesSpec>,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageSpec,
}

fn default_replicas() -> i32 {
    1
}

/// Kafka client authentication specification
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationSpec {
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL)
    #[serde(default = "default_security_protocol")]
    pub security_protocol: String,

    /// SASL credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sasl: Option<SaslSpec>,
}

fn default_security_protocol() -> String {
    "PLAINTEXT".to_string()
}

/// SASL credentials specification
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SaslSpec {
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    pub mechanism: String,
    /// SASL username
    pub username: String,
    /// Password secret reference
    pub password_secret: PasswordSecretRef,
}

/// Password secret reference
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PasswordSecretRef {
    /// Secret name
    pub secret_name: String,
    /// Password key in secret
    #[serde(default = "default_password_key")]
    pub password_key: String,
}

fn default_password_key() -> String {
    "password".to_string()
}

/// Application configuration passed to members as `K_*` environment variables
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppConfigSpec {
    /// Web API port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_port: Option<i32>,

    /// Prefix for internal topics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_prefix: Option<String>,

    /// Partitions of internal topics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_partitions: Option<i32>,

    /// Replication factor of internal topics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_replication_factor: Option<i32>,

    /// Additional settings, keyed by setting name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Container resource requirements
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

/// Storage specification
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage type (ephemeral, persistent-claim)
    #[serde(rename = "type", default = "default_storage_type")]
    pub storage_type: String,

    /// Storage class for persistent claims
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Claim size (e.g. "10Gi")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Delete claims when the app is deleted or scaled down
    #[serde(default)]
    pub delete_claim: bool,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            storage_type: default_storage_type(),
            storage_class: None,
            size: None,
            delete_claim: false,
        }
    }
}

fn default_storage_type() -> String {
    "ephemeral".to_string()
}

impl KasprAppSpec {
    pub fn web_port(&self) -> i32 {
        self.config.web_port.unwrap_or(DEFAULT_WEB_PORT)
    }

    pub fn kaspr_version(&self) -> &str {
        self.version.as_deref().unwrap_or(DEFAULT_KASPR_VERSION)
    }

    pub fn image(&self) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| format!("{}:{}", DEFAULT_KASPR_IMAGE, self.kaspr_version()))
    }
}

/// KasprApp status
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KasprAppStatus {
    /// Observed generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Kaspr version of the running image
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kaspr_version: Option<String>,

    /// Members available according to the StatefulSet
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_replicas: Option<i32>,

    /// Members requested by the spec
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_replicas: Option<i32>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    #[schemars(with = "Vec<Condition>")]
    pub conditions: Conditions,

    /// Member states keyed by member id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub members: BTreeMap<String, MemberState>,

    /// Subscription-relevant snapshot of linked resources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked_resources: Option<LinkedResourcesSnapshot>,

    /// Subscriptions changed and the cluster needs a rebalance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebalance_required: Option<bool>,

    /// Rebalancing members over reporting members ("X/Y")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebalancing_members: Option<String>,

    /// Hung member strike tracking keyed by member id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hung_members: BTreeMap<String, HungMemberEntry>,

    /// Last successful rebalance request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rebalance_time: Option<DateTime<Utc>>,
}

/// Runtime state of one member as last reported
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemberState {
    /// Member is the group leader
    pub leader: bool,
    /// Member is mid-rebalance
    pub rebalancing: bool,
    /// Member is replaying state before rejoining
    pub recovering: bool,
    /// Last change of any of the flags above
    pub last_transition_time: DateTime<Utc>,
}

/// Strike tracking for a member suspected to be hung
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HungMemberEntry {
    /// Consecutive detections (0-3)
    pub strikes: u8,
    /// First detection in the current streak
    pub first_detected: DateTime<Utc>,
    /// Most recent detection
    pub last_detected: DateTime<Utc>,
}

/// Subscription-relevant fields of the resources linked to an app
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LinkedResourcesSnapshot {
    /// Agents keyed by resource name
    #[serde(default)]
    pub agents: BTreeMap<String, AgentSubscription>,
    /// Tables keyed by resource name
    #[serde(default)]
    pub tables: BTreeMap<String, TableSubscription>,
    /// Web view resource names
    #[serde(default)]
    pub webviews: BTreeSet<String>,
    /// Task resource names
    #[serde(default)]
    pub tasks: BTreeSet<String>,
}

/// Input topic of an agent
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentSubscription {
    /// Topic name, or comma-separated topic names
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_name: Option<String>,
    /// Topic pattern
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_pattern: Option<String>,
}

/// Changelog-determining name of a table
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TableSubscription {
    pub name: String,
}
