//! KasprTable Custom Resource Definition

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ComponentStatus;

/// KasprTable resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kaspr.io",
    version = "v1alpha1",
    kind = "KasprTable",
    plural = "kasprtables",
    singular = "kasprtable",
    shortname = "ktable",
    namespaced,
    status = "ComponentStatus",
    printcolumn = r#"{"name": "App", "type": "string", "jsonPath": ".metadata.labels.kaspr\\.io/app"}"#,
    printcolumn = r#"{"name": "App Status", "type": "string", "jsonPath": ".status.app.status"}"#,
    printcolumn = r#"{"name": "Table", "type": "string", "jsonPath": ".spec.name"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KasprTableSpec {
    /// Table name; determines the changelog topic
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Global tables are replicated to every member
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_global: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_serializer: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_serializer: Option<String>,

    /// Changelog topic partitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partitions: Option<i32>,

    /// Extra changelog topic configuration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_topic_configs: BTreeMap<String, String>,

    /// Windowing options
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::preserve_unknown_fields")]
    pub window: Option<serde_json::Value>,
}
