//! App components rendered for member pods
//!
//! Each agent, table, web view and task is rendered into its own ConfigMap
//! holding one YAML definitions document. The app's StatefulSet mounts every
//! document of its components into the definitions directory.

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, KeyToPath, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::adapters::LinkedResources;
use crate::crd::{
    ComponentStatus, KasprAgent, KasprTable, KasprTask, KasprWebView, APP_LABEL,
};
use crate::error::{Error, Result};

use super::sync::content_hash;

/// Directory member pods load component definitions from
pub const DEFINITIONS_DIR: &str = "/var/lib/data/definitions";

/// A sibling resource that contributes definitions to its app
pub trait AppComponent:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Suffix of the derived object names
    const SUFFIX: &'static str;

    /// Top-level key of the definitions document
    const SECTION: &'static str;

    /// Spec as written into the definitions document
    fn definition(&self) -> Result<Value>;

    fn component_status(&self) -> Option<&ComponentStatus>;
}

/// Serialize a spec, filling in `name` from the resource when unset
fn named_definition<S: Serialize>(spec: &S, name: &str) -> Result<Value> {
    let mut value = serde_json::to_value(spec)?;
    if let Value::Object(fields) = &mut value {
        fields
            .entry("name")
            .or_insert_with(|| Value::String(name.to_string()));
    }
    Ok(value)
}

impl AppComponent for KasprAgent {
    const SUFFIX: &'static str = "agent";
    const SECTION: &'static str = "agents";

    fn definition(&self) -> Result<Value> {
        named_definition(&self.spec, &self.name_any())
    }

    fn component_status(&self) -> Option<&ComponentStatus> {
        self.status.as_ref()
    }
}

impl AppComponent for KasprTable {
    const SUFFIX: &'static str = "table";
    const SECTION: &'static str = "tables";

    fn definition(&self) -> Result<Value> {
        named_definition(&self.spec, &self.name_any())
    }

    fn component_status(&self) -> Option<&ComponentStatus> {
        self.status.as_ref()
    }
}

impl AppComponent for KasprWebView {
    const SUFFIX: &'static str = "webview";
    const SECTION: &'static str = "webviews";

    fn definition(&self) -> Result<Value> {
        named_definition(&self.spec, &self.name_any())
    }

    fn component_status(&self) -> Option<&ComponentStatus> {
        self.status.as_ref()
    }
}

impl AppComponent for KasprTask {
    const SUFFIX: &'static str = "task";
    const SECTION: &'static str = "tasks";

    fn definition(&self) -> Result<Value> {
        named_definition(&self.spec, &self.name_any())
    }

    fn component_status(&self) -> Option<&ComponentStatus> {
        self.status.as_ref()
    }
}

/// Object names derived from one component
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentNames {
    pub component: String,
    pub config_map: String,
    pub volume: String,
    pub file_name: String,
}

impl ComponentNames {
    pub fn of<K: AppComponent>(name: &str) -> Self {
        let component = format!("{}-{}", name, K::SUFFIX);
        Self {
            config_map: component.clone(),
            volume: component.clone(),
            file_name: format!("{}.yaml", component),
            component,
        }
    }

    pub fn mount_path(&self) -> String {
        format!("{}/{}", DEFINITIONS_DIR, self.file_name)
    }
}

/// A component rendered into its ConfigMap
#[derive(Clone, Debug)]
pub struct RenderedComponent {
    /// App the component is labelled for
    pub app: String,
    pub names: ComponentNames,
    pub config_map: ConfigMap,
    /// Hash of the ConfigMap data
    pub hash: String,
}

/// Render a component into its definitions ConfigMap, owned by the component
pub fn render_component<K: AppComponent>(component: &K) -> Result<RenderedComponent> {
    let kind = K::kind(&());
    let name = component
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::validation(format!("{} has no name", kind)))?;
    let namespace = component
        .namespace()
        .ok_or_else(|| Error::validation(format!("{} '{}' has no namespace", kind, name)))?;
    let app = component
        .labels()
        .get(APP_LABEL)
        .cloned()
        .ok_or_else(|| {
            Error::validation(format!("{} '{}' is missing the {} label", kind, name, APP_LABEL))
        })?;

    let names = ComponentNames::of::<K>(&name);
    let mut document = Map::new();
    document.insert(
        K::SECTION.to_string(),
        Value::Array(vec![component.definition()?]),
    );
    let data = BTreeMap::from([(
        names.file_name.clone(),
        serde_yaml::to_string(&Value::Object(document))?,
    )]);
    let hash = content_hash(&data)?;

    let labels = BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "kaspr".to_string()),
        ("app.kubernetes.io/component".to_string(), K::SUFFIX.to_string()),
        ("app.kubernetes.io/instance".to_string(), names.component.clone()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "kaspr-operator".to_string(),
        ),
        (APP_LABEL.to_string(), app.clone()),
    ]);

    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(names.config_map.clone()),
            namespace: Some(namespace),
            labels: Some(labels),
            owner_references: component.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };

    Ok(RenderedComponent {
        app,
        names,
        config_map,
        hash,
    })
}

/// Render every linked component of an app
pub fn render_linked(linked: &LinkedResources) -> Result<Vec<RenderedComponent>> {
    let mut rendered = Vec::new();
    for agent in &linked.agents {
        rendered.push(render_component(agent)?);
    }
    for table in &linked.tables {
        rendered.push(render_component(table)?);
    }
    for webview in &linked.webviews {
        rendered.push(render_component(webview)?);
    }
    for task in &linked.tasks {
        rendered.push(render_component(task)?);
    }
    Ok(rendered)
}

/// Volumes and mounts exposing rendered components to member pods
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComponentMounts {
    // Keyed by volume name so list order never churns the pod template
    entries: BTreeMap<String, (ComponentNames, String)>,
}

impl ComponentMounts {
    pub fn push(&mut self, rendered: &RenderedComponent) {
        self.entries.insert(
            rendered.names.volume.clone(),
            (rendered.names.clone(), rendered.hash.clone()),
        );
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn volumes(&self) -> Vec<Volume> {
        self.entries
            .values()
            .map(|(names, _)| Volume {
                name: names.volume.clone(),
                config_map: Some(ConfigMapVolumeSource {
                    name: names.config_map.clone(),
                    items: Some(vec![KeyToPath {
                        key: names.file_name.clone(),
                        path: names.file_name.clone(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect()
    }

    pub fn volume_mounts(&self) -> Vec<VolumeMount> {
        self.entries
            .values()
            .map(|(names, _)| VolumeMount {
                name: names.volume.clone(),
                mount_path: names.mount_path(),
                sub_path: Some(names.file_name.clone()),
                read_only: Some(true),
                ..Default::default()
            })
            .collect()
    }

    /// Hash over every mounted definition.
    ///
    /// Sub-path mounts never see ConfigMap updates, so the pod template
    /// carries this hash to roll members when a definition changes.
    pub fn hash(&self) -> Result<String> {
        let hashes: BTreeMap<&String, &String> = self
            .entries
            .iter()
            .map(|(volume, (_, hash))| (volume, hash))
            .collect();
        content_hash(&hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{KasprAgentSpec, KasprTableSpec};

    fn agent(name: &str, app: Option<&str>) -> KasprAgent {
        let spec: KasprAgentSpec = serde_json::from_value(serde_json::json!({
            "input": { "topic": { "name": "orders" } },
            "processors": { "pipeline": ["enrich"] }
        }))
        .unwrap();
        let mut agent = KasprAgent::new(name, spec);
        agent.metadata.namespace = Some("streams".to_string());
        agent.metadata.uid = Some("agent-uid".to_string());
        agent.metadata.labels =
            app.map(|app| BTreeMap::from([(APP_LABEL.to_string(), app.to_string())]));
        agent
    }

    fn table(name: &str) -> KasprTable {
        let mut table = KasprTable::new(
            name,
            KasprTableSpec {
                name: "order-totals".to_string(),
                description: None,
                is_global: None,
                key_serializer: None,
                value_serializer: None,
                partitions: Some(6),
                extra_topic_configs: BTreeMap::new(),
                window: None,
            },
        );
        table.metadata.namespace = Some("streams".to_string());
        table.metadata.labels = Some(BTreeMap::from([(
            APP_LABEL.to_string(),
            "orders".to_string(),
        )]));
        table
    }

    #[test]
    fn test_names() {
        let names = ComponentNames::of::<KasprAgent>("enrich");
        assert_eq!(names.config_map, "enrich-agent");
        assert_eq!(names.file_name, "enrich-agent.yaml");
        assert_eq!(names.mount_path(), "/var/lib/data/definitions/enrich-agent.yaml");
        assert_eq!(ComponentNames::of::<KasprTask>("cleanup").volume, "cleanup-task");
    }

    #[test]
    fn test_agent_rendered_under_its_section_with_name() {
        let rendered = render_component(&agent("enrich", Some("orders"))).unwrap();
        assert_eq!(rendered.app, "orders");

        let data = rendered.config_map.data.as_ref().unwrap();
        let document: Value = serde_yaml::from_str(&data["enrich-agent.yaml"]).unwrap();
        assert_eq!(document["agents"][0]["name"], "enrich");
        assert_eq!(document["agents"][0]["input"]["topic"]["name"], "orders");

        let owners = rendered.config_map.metadata.owner_references.unwrap();
        assert_eq!(owners[0].kind, "KasprAgent");
        assert_eq!(
            rendered.config_map.metadata.labels.unwrap().get(APP_LABEL).map(String::as_str),
            Some("orders")
        );
    }

    #[test]
    fn test_spec_name_is_kept() {
        let rendered = render_component(&table("totals")).unwrap();
        let data = rendered.config_map.data.unwrap();
        let document: Value = serde_yaml::from_str(&data["totals-table.yaml"]).unwrap();
        assert_eq!(document["tables"][0]["name"], "order-totals");
    }

    #[test]
    fn test_missing_app_label_is_rejected() {
        assert!(matches!(
            render_component(&agent("enrich", None)),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_hash_follows_definition() {
        let a = render_component(&agent("enrich", Some("orders"))).unwrap();
        let b = render_component(&agent("enrich", Some("orders"))).unwrap();
        assert_eq!(a.hash, b.hash);

        let mut changed = agent("enrich", Some("orders"));
        changed.spec.description = Some("adds customer data".to_string());
        assert_ne!(render_component(&changed).unwrap().hash, a.hash);
    }

    #[test]
    fn test_mounts_are_read_only_sub_paths() {
        let mut mounts = ComponentMounts::default();
        mounts.push(&render_component(&table("totals")).unwrap());
        mounts.push(&render_component(&agent("enrich", Some("orders"))).unwrap());

        let volumes = mounts.volumes();
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].name, "enrich-agent");
        assert_eq!(
            volumes[0].config_map.as_ref().map(|c| c.name.as_str()),
            Some("enrich-agent")
        );

        let volume_mounts = mounts.volume_mounts();
        assert_eq!(volume_mounts[1].mount_path, "/var/lib/data/definitions/totals-table.yaml");
        assert_eq!(volume_mounts[1].sub_path.as_deref(), Some("totals-table.yaml"));
        assert_eq!(volume_mounts[1].read_only, Some(true));
    }

    #[test]
    fn test_mounts_hash_ignores_order() {
        let agent = render_component(&agent("enrich", Some("orders"))).unwrap();
        let table = render_component(&table("totals")).unwrap();

        let mut forward = ComponentMounts::default();
        forward.push(&agent);
        forward.push(&table);
        let mut backward = ComponentMounts::default();
        backward.push(&table);
        backward.push(&agent);
        assert_eq!(forward.hash().unwrap(), backward.hash().unwrap());
        assert_ne!(forward.hash().unwrap(), ComponentMounts::default().hash().unwrap());
    }
}
