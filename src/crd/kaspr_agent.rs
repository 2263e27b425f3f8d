//! KasprAgent Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ComponentStatus;

/// KasprAgent resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kaspr.io",
    version = "v1alpha1",
    kind = "KasprAgent",
    plural = "kaspragents",
    singular = "kaspragent",
    shortname = "kagent",
    namespaced,
    status = "ComponentStatus",
    printcolumn = r#"{"name": "App", "type": "string", "jsonPath": ".metadata.labels.kaspr\\.io/app"}"#,
    printcolumn = r#"{"name": "App Status", "type": "string", "jsonPath": ".status.app.status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KasprAgentSpec {
    /// Agent name inside the app
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Input stream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<AgentInput>,

    /// Output streams
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::preserve_unknown_fields")]
    pub output: Option<serde_json::Value>,

    /// Processing pipeline
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::preserve_unknown_fields")]
    pub processors: Option<serde_json::Value>,
}

/// Agent input
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentInput {
    /// Kafka topic input
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<AgentInputTopic>,

    /// In-memory channel input
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<AgentInputChannel>,
}

/// Kafka topic input; exactly one of name or pattern is set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentInputTopic {
    /// Topic name, or comma-separated topic names
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Topic pattern
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_serializer: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_serializer: Option<String>,
}

/// In-memory channel input
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentInputChannel {
    pub name: String,
}
