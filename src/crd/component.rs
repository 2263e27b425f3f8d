//! Status shared by the app components: agents, tables, web views and tasks

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Whether the app a component is labelled for exists
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum AppLookup {
    AppFound,
    AppNotFound,
}

impl AppLookup {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppLookup::AppFound => "AppFound",
            AppLookup::AppNotFound => "AppNotFound",
        }
    }
}

/// The app a component belongs to
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentAppRef {
    pub name: String,
    pub status: AppLookup,
}

/// Component status
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    /// Owning app and whether it exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<ComponentAppRef>,

    /// ConfigMap holding the rendered definition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_map: Option<String>,

    /// Hash of the rendered definition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}
