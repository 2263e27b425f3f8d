//! Desired child objects of a KasprApp
//!
//! Every object carries the app labels and a controller owner reference, so
//! deleting the app garbage collects them.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    StatefulSet, StatefulSetPersistentVolumeClaimRetentionPolicy, StatefulSetSpec,
    StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EmptyDirVolumeSource, EnvFromSource,
    EnvVar, EnvVarSource, HTTPGetAction, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SecretKeySelector, Service,
    ServiceAccount, ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::crd::{KasprApp, KasprAppSpec, APP_LABEL};
use crate::error::{Error, Result};

use super::components::{ComponentMounts, DEFINITIONS_DIR};
use super::sync::content_hash;

/// Name of the runtime container in member pods
pub const KASPR_CONTAINER_NAME: &str = "kaspr";

/// Pod template annotation tracking the settings ConfigMap content
pub const CONFIG_HASH_ANNOTATION: &str = "kaspr.io/config-hash";

/// Pod template annotation tracking the mounted component definitions
pub const COMPONENTS_HASH_ANNOTATION: &str = "kaspr.io/components-hash";

const WEB_PORT_NAME: &str = "http";
const DATA_VOLUME_NAME: &str = "kaspr-data";
const DATA_DIR: &str = "/var/lib/data";
const STORAGE_EPHEMERAL: &str = "ephemeral";
const STORAGE_PERSISTENT: &str = "persistent-claim";

/// Child object names derived from the app name
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppNames {
    pub app: String,
    pub component: String,
    pub service: String,
    pub headless_service: String,
    pub service_account: String,
    pub config_map: String,
    pub stateful_set: String,
}

impl AppNames {
    pub fn new(app: &str) -> Self {
        let component = format!("{}-app", app);
        Self {
            app: app.to_string(),
            service: format!("{}-api", component),
            headless_service: format!("{}-headless", component),
            service_account: component.clone(),
            config_map: format!("{}-config", component),
            stateful_set: component.clone(),
            component,
        }
    }

    /// Pod name of the member with `ordinal`; also its member id
    pub fn member_id(&self, ordinal: i32) -> String {
        format!("{}-{}", self.stateful_set, ordinal)
    }

    /// Ordinal of a member id, if it belongs to this app
    pub fn member_ordinal(&self, member_id: &str) -> Option<i32> {
        member_id
            .strip_prefix(&self.stateful_set)
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|ordinal| ordinal.parse().ok())
    }
}

/// Builder for the child objects of one KasprApp
pub struct AppResources<'a> {
    app: &'a KasprApp,
    spec: &'a KasprAppSpec,
    names: AppNames,
    namespace: String,
    components: ComponentMounts,
}

impl<'a> AppResources<'a> {
    pub fn new(app: &'a KasprApp) -> Result<Self> {
        let name = app
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::validation("KasprApp has no name"))?;
        let namespace = app
            .namespace()
            .ok_or_else(|| Error::validation("KasprApp has no namespace"))?;

        Ok(Self {
            app,
            spec: &app.spec,
            names: AppNames::new(&name),
            namespace,
            components: ComponentMounts::default(),
        })
    }

    /// Mount the rendered definitions of the app's components
    pub fn with_components(mut self, components: ComponentMounts) -> Self {
        self.components = components;
        self
    }

    pub fn names(&self) -> &AppNames {
        &self.names
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Labels carried by every child object
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "kaspr-operator".to_string(),
        );
        labels.insert(
            "app.kubernetes.io/part-of".to_string(),
            self.names.app.clone(),
        );
        labels.insert(
            "app.kubernetes.io/version".to_string(),
            self.spec.kaspr_version().to_string(),
        );
        labels
    }

    /// Labels selecting the member pods
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app.kubernetes.io/name".to_string(), "kaspr".to_string()),
            (
                "app.kubernetes.io/instance".to_string(),
                self.names.component.clone(),
            ),
            (APP_LABEL.to_string(), self.names.app.clone()),
        ])
    }

    fn owner_reference(&self) -> Option<OwnerReference> {
        self.app.controller_owner_ref(&())
    }

    fn metadata(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels()),
            owner_references: self.owner_reference().map(|owner| vec![owner]),
            ..Default::default()
        }
    }

    fn web_port(&self) -> ServicePort {
        let port = self.spec.web_port();
        ServicePort {
            name: Some(WEB_PORT_NAME.to_string()),
            protocol: Some("TCP".to_string()),
            port,
            target_port: Some(IntOrString::Int(port)),
            ..Default::default()
        }
    }

    /// ClusterIP service in front of the member web API
    pub fn build_service(&self) -> Service {
        Service {
            metadata: self.metadata(&self.names.service),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(self.selector_labels()),
                ports: Some(vec![self.web_port()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Headless service giving each member a stable DNS name
    pub fn build_headless_service(&self) -> Service {
        Service {
            metadata: self.metadata(&self.names.headless_service),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(self.selector_labels()),
                ports: Some(vec![self.web_port()]),
                publish_not_ready_addresses: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn build_service_account(&self) -> ServiceAccount {
        ServiceAccount {
            metadata: self.metadata(&self.names.service_account),
            ..Default::default()
        }
    }

    /// Runtime settings exposed to members as `K_*` environment variables
    pub fn settings(&self) -> BTreeMap<String, String> {
        let config = &self.spec.config;
        let mut settings = BTreeMap::new();

        for (key, value) in &config.extra {
            settings.insert(env_for(key), value.clone());
        }
        if let Some(prefix) = &config.topic_prefix {
            settings.insert(env_for("topic_prefix"), prefix.clone());
        }
        if let Some(partitions) = config.topic_partitions {
            settings.insert(env_for("topic_partitions"), partitions.to_string());
        }
        if let Some(replication) = config.topic_replication_factor {
            settings.insert(
                env_for("topic_replication_factor"),
                replication.to_string(),
            );
        }

        let auth = &self.spec.authentication;
        settings.insert(
            env_for("kafka_security_protocol"),
            auth.security_protocol.clone(),
        );
        if let Some(sasl) = &auth.sasl {
            settings.insert(env_for("kafka_sasl_mechanism"), sasl.mechanism.clone());
            settings.insert(env_for("kafka_auth_username"), sasl.username.clone());
        }

        settings.insert(env_for("app_name"), self.names.component.clone());
        settings.insert(
            env_for("kafka_bootstrap_servers"),
            self.spec.bootstrap_servers.clone(),
        );
        settings.insert(env_for("web_port"), self.spec.web_port().to_string());
        settings.insert(env_for("data_dir"), DATA_DIR.to_string());
        settings.insert(env_for("table_dir"), format!("{}/tables", DATA_DIR));
        settings.insert(env_for("definitions_dir"), DEFINITIONS_DIR.to_string());
        settings
    }

    pub fn build_config_map(&self) -> ConfigMap {
        ConfigMap {
            metadata: self.metadata(&self.names.config_map),
            data: Some(self.settings()),
            ..Default::default()
        }
    }

    fn build_container(&self) -> Container {
        let port = self.spec.web_port();

        let mut env = vec![EnvVar {
            name: "POD_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(k8s_openapi::api::core::v1::ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }];
        if let Some(sasl) = &self.spec.authentication.sasl {
            env.push(EnvVar {
                name: env_for("kafka_auth_password"),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: sasl.password_secret.secret_name.clone(),
                        key: sasl.password_secret.password_key.clone(),
                        optional: Some(false),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        let mut volume_mounts = vec![VolumeMount {
            name: DATA_VOLUME_NAME.to_string(),
            mount_path: DATA_DIR.to_string(),
            ..Default::default()
        }];
        volume_mounts.extend(self.components.volume_mounts());

        let resources = self.spec.resources.as_ref().map(|r| ResourceRequirements {
            requests: quantities(&r.requests),
            limits: quantities(&r.limits),
            ..Default::default()
        });

        Container {
            name: KASPR_CONTAINER_NAME.to_string(),
            image: Some(self.spec.image()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            env: Some(env),
            env_from: Some(vec![EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    name: self.names.config_map.clone(),
                    optional: Some(false),
                }),
                ..Default::default()
            }]),
            ports: Some(vec![ContainerPort {
                name: Some(WEB_PORT_NAME.to_string()),
                container_port: port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            readiness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/status/".to_string()),
                    port: IntOrString::Int(port),
                    scheme: Some("HTTP".to_string()),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(10),
                period_seconds: Some(10),
                failure_threshold: Some(3),
                ..Default::default()
            }),
            resources,
            volume_mounts: Some(volume_mounts),
            ..Default::default()
        }
    }

    fn build_pvc_template(&self) -> PersistentVolumeClaim {
        let storage = &self.spec.storage;
        let requests = storage
            .size
            .as_ref()
            .map(|size| BTreeMap::from([("storage".to_string(), Quantity(size.clone()))]));

        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(DATA_VOLUME_NAME.to_string()),
                labels: Some(self.selector_labels()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: storage.storage_class.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// StatefulSet running the app members
    pub fn build_statefulset(&self) -> Result<StatefulSet> {
        let storage = &self.spec.storage;
        let persistent = storage.storage_type == STORAGE_PERSISTENT;

        let mut volumes = Vec::new();
        if !persistent {
            volumes.push(Volume {
                name: DATA_VOLUME_NAME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        }
        volumes.extend(self.components.volumes());

        let mut pod_annotations = BTreeMap::from([(
            CONFIG_HASH_ANNOTATION.to_string(),
            content_hash(&self.settings())?,
        )]);
        if !self.components.is_empty() {
            pod_annotations.insert(
                COMPONENTS_HASH_ANNOTATION.to_string(),
                self.components.hash()?,
            );
        }

        let retention = if storage.delete_claim { "Delete" } else { "Retain" };

        Ok(StatefulSet {
            metadata: self.metadata(&self.names.stateful_set),
            spec: Some(StatefulSetSpec {
                replicas: Some(self.spec.replicas),
                service_name: self.names.headless_service.clone(),
                selector: LabelSelector {
                    match_labels: Some(self.selector_labels()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels()),
                        annotations: Some(pod_annotations),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(self.names.service_account.clone()),
                        containers: vec![self.build_container()],
                        volumes: (!volumes.is_empty()).then_some(volumes),
                        ..Default::default()
                    }),
                },
                volume_claim_templates: persistent.then(|| vec![self.build_pvc_template()]),
                persistent_volume_claim_retention_policy: persistent.then(|| {
                    StatefulSetPersistentVolumeClaimRetentionPolicy {
                        when_deleted: Some(retention.to_string()),
                        when_scaled: Some(retention.to_string()),
                    }
                }),
                pod_management_policy: Some("Parallel".to_string()),
                update_strategy: Some(StatefulSetUpdateStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

/// Environment variable name of a runtime setting
pub fn env_for(setting: &str) -> String {
    format!("K_{}", setting.to_uppercase())
}

fn quantities(values: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if values.is_empty() {
        None
    } else {
        Some(
            values
                .iter()
                .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                .collect(),
        )
    }
}

/// Check the parts of an app spec the builder relies on
pub fn validate_spec(spec: &KasprAppSpec) -> Result<()> {
    if spec.bootstrap_servers.trim().is_empty() {
        return Err(Error::validation("bootstrapServers must not be empty"));
    }
    if spec.replicas < 0 {
        return Err(Error::validation(format!(
            "replicas must not be negative, got {}",
            spec.replicas
        )));
    }

    let port = spec.web_port();
    if !(1..=65535).contains(&port) {
        return Err(Error::validation(format!(
            "config.webPort must be between 1 and 65535, got {}",
            port
        )));
    }

    let storage = &spec.storage;
    match storage.storage_type.as_str() {
        STORAGE_EPHEMERAL => {}
        STORAGE_PERSISTENT => {
            if storage.size.as_deref().map_or(true, |s| s.trim().is_empty()) {
                return Err(Error::validation(
                    "storage.size is required for persistent-claim storage",
                ));
            }
        }
        other => {
            return Err(Error::validation(format!(
                "unknown storage type '{}', expected '{}' or '{}'",
                other, STORAGE_EPHEMERAL, STORAGE_PERSISTENT
            )));
        }
    }

    if let Some(sasl) = &spec.authentication.sasl {
        if sasl.username.trim().is_empty() {
            return Err(Error::validation("authentication.sasl.username is required"));
        }
        if sasl.password_secret.secret_name.trim().is_empty() {
            return Err(Error::validation(
                "authentication.sasl.passwordSecret.secretName is required",
            ));
        }
        if sasl.password_secret.password_key.trim().is_empty() {
            return Err(Error::validation(
                "authentication.sasl.passwordSecret.passwordKey is required",
            ));
        }
    }

    Ok(())
}
