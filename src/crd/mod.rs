//! Custom Resource Definitions for the Kaspr Operator

mod component;
mod conditions;
mod kaspr_agent;
mod kaspr_app;
mod kaspr_table;
mod kaspr_task;
mod kaspr_webview;

pub use component::*;
pub use conditions::*;
pub use kaspr_agent::*;
pub use kaspr_app::*;
pub use kaspr_table::*;
pub use kaspr_task::*;
pub use kaspr_webview::*;

use kube::CustomResourceExt;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};

/// Label binding sibling resources and child objects to their app
pub const APP_LABEL: &str = "kaspr.io/app";

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>, serde_yaml::Error> {
    Ok(vec![
        serde_yaml::to_string(&KasprApp::crd())?,
        serde_yaml::to_string(&KasprAgent::crd())?,
        serde_yaml::to_string(&KasprTable::crd())?,
        serde_yaml::to_string(&KasprWebView::crd())?,
        serde_yaml::to_string(&KasprTask::crd())?,
    ])
}

/// Free-form object schema for fields the operator passes through untouched
pub(crate) fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_crds_covers_all_kinds() {
        let crds = generate_crds().unwrap();
        assert_eq!(crds.len(), 5);
        assert!(crds[0].contains("kind: KasprApp"));
        assert!(crds[1].contains("kind: KasprAgent"));
        assert!(crds[4].contains("kind: KasprTask"));
    }

    #[test]
    fn test_pass_through_fields_preserve_unknown() {
        let crd = serde_yaml::to_string(&KasprAgent::crd()).unwrap();
        assert!(crd.contains("x-kubernetes-preserve-unknown-fields: true"));
    }

    #[test]
    fn test_app_status_uses_camel_case() {
        let crd = serde_json::to_value(KasprApp::crd()).unwrap();
        let status = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]
            ["status"]["properties"];
        assert!(status.get("rebalanceRequired").is_some());
        assert!(status.get("rebalancingMembers").is_some());
        assert!(status.get("linkedResources").is_some());
        assert!(status.get("hungMembers").is_some());
    }

    #[test]
    fn test_components_have_status_subresource() {
        let crd = serde_json::to_value(KasprTable::crd()).unwrap();
        let version = &crd["spec"]["versions"][0];
        assert!(version["subresources"].get("status").is_some());
        let status = &version["schema"]["openAPIV3Schema"]["properties"]["status"]["properties"];
        assert!(status.get("configMap").is_some());
        assert!(status.get("hash").is_some());
    }
}
