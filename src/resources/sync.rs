//! Resource sync engine
//!
//! Drives a single child object towards its desired state. Writes are gated
//! on a content hash annotation so an unchanged object costs one read.

use std::fmt::Debug;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::metrics;

/// Annotation holding the hash of the desired content last applied
pub const CONTENT_HASH_ANNOTATION: &str = "kaspr.io/content-hash";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "kaspr-operator";

const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of syncing one object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
    Unchanged,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Created => "created",
            SyncOutcome::Updated => "updated",
            SyncOutcome::Unchanged => "unchanged",
        }
    }

    pub fn changed(&self) -> bool {
        !matches!(self, SyncOutcome::Unchanged)
    }
}

/// Hex encoded SHA-256 of the JSON form of `value`
pub fn content_hash<T: Serialize>(value: &T) -> Result<String> {
    // serde_json::Value keeps object keys sorted, so the digest is stable
    let canonical = serde_json::to_vec(&serde_json::to_value(value)?)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// Stamp the content hash annotation onto a desired object and return the hash
pub fn stamp_content_hash<K: Resource + Serialize>(desired: &mut K) -> Result<String> {
    desired.annotations_mut().remove(CONTENT_HASH_ANNOTATION);
    let hash = content_hash(desired)?;
    desired
        .annotations_mut()
        .insert(CONTENT_HASH_ANNOTATION.to_string(), hash.clone());
    Ok(hash)
}

/// True when the live object was not produced from content with `hash`
pub fn needs_update<K: Resource>(live: &K, hash: &str) -> bool {
    live.annotations()
        .get(CONTENT_HASH_ANNOTATION)
        .map_or(true, |live_hash| live_hash != hash)
}

/// Create the object if missing, or apply it when its content hash changed
pub async fn sync_resource<K>(client: &Client, namespace: &str, mut desired: K) -> Result<SyncOutcome>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned,
{
    let kind = K::kind(&()).to_string();
    let name = desired.name_any();
    let _timer = metrics::RESOURCE_SYNC_DURATION
        .with_label_values(&[&kind])
        .start_timer();

    let result = apply_if_changed(client, namespace, &mut desired, &kind, &name).await;
    let label = match &result {
        Ok(outcome) => outcome.as_str(),
        Err(_) => "error",
    };
    metrics::RESOURCE_SYNC_TOTAL
        .with_label_values(&[&kind, label])
        .inc();
    result
}

async fn apply_if_changed<K>(
    client: &Client,
    namespace: &str,
    desired: &mut K,
    kind: &str,
    name: &str,
) -> Result<SyncOutcome>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned,
{
    let hash = stamp_content_hash(desired)?;
    let api: Api<K> = Api::namespaced(client.clone(), namespace);

    let live = with_timeout(kind, name, api.get_opt(name)).await?;
    match live {
        None => {
            with_timeout(kind, name, api.create(&PostParams::default(), desired)).await?;
            info!(kind = %kind, name = %name, namespace = %namespace, "Created resource");
            Ok(SyncOutcome::Created)
        }
        Some(live) if !needs_update(&live, &hash) => {
            debug!(kind = %kind, name = %name, "Resource up to date");
            Ok(SyncOutcome::Unchanged)
        }
        Some(_) => {
            metrics::RESOURCE_DRIFT_DETECTED
                .with_label_values(&[kind])
                .inc();
            // Apply payloads must not carry a resourceVersion
            desired.meta_mut().resource_version = None;
            let params = PatchParams::apply(FIELD_MANAGER).force();
            with_timeout(kind, name, api.patch(name, &params, &Patch::Apply(&*desired))).await?;
            info!(kind = %kind, name = %name, namespace = %namespace, "Updated resource");
            Ok(SyncOutcome::Updated)
        }
    }
}

async fn with_timeout<T, F>(kind: &str, name: &str, call: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, kube::Error>>,
{
    tokio::time::timeout(API_TIMEOUT, call)
        .await
        .map_err(|_| Error::Timeout(format!("{} {}", kind, name)))?
        .map_err(|e| Error::resource_sync(kind, name, e.to_string()))
}

/// Delete a member pod with a bounded grace period.
///
/// A pod that is already gone counts as deleted.
pub async fn delete_pod(
    client: &Client,
    namespace: &str,
    name: &str,
    grace_period_seconds: u32,
    timeout: Duration,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let params = DeleteParams {
        grace_period_seconds: Some(grace_period_seconds),
        ..Default::default()
    };

    match tokio::time::timeout(timeout, pods.delete(name, &params)).await {
        Err(_) => Err(Error::Timeout(format!("delete pod {}", name))),
        Ok(Ok(_)) => Ok(()),
        Ok(Err(kube::Error::Api(resp))) if resp.code == 404 => Ok(()),
        Ok(Err(e)) => Err(Error::Kube(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn config_map(value: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("orders-app-config".to_string()),
                namespace: Some("streams".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("K_WEB_PORT".to_string(), value.to_string())])),
            ..Default::default()
        }
    }

    #[test]
    fn test_content_hash_is_stable_and_content_sensitive() {
        let a = content_hash(&config_map("6065")).unwrap();
        let b = content_hash(&config_map("6065")).unwrap();
        let c = content_hash(&config_map("7000")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_stamp_ignores_previous_hash() {
        let mut first = config_map("6065");
        let hash = stamp_content_hash(&mut first).unwrap();
        let mut again = first.clone();
        assert_eq!(stamp_content_hash(&mut again).unwrap(), hash);
        assert_eq!(
            first.annotations().get(CONTENT_HASH_ANNOTATION),
            Some(&hash)
        );
    }

    #[test]
    fn test_needs_update() {
        let mut live = config_map("6065");
        assert!(needs_update(&live, "abc"));
        let hash = stamp_content_hash(&mut live).unwrap();
        assert!(!needs_update(&live, &hash));
        assert!(needs_update(&live, "other"));
    }
}
