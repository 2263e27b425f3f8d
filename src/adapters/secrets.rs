//! Secret lookups for Kafka client credentials

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

use crate::crd::SaslSpec;
use crate::error::{Error, Result};

/// Fetch a secret from Kubernetes
pub async fn get_secret(client: &Client, name: &str, namespace: &str) -> Result<Secret> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    secrets.get(name).await.map_err(|e| match e {
        kube::Error::Api(api_err) if api_err.code == 404 => {
            Error::SecretNotFound(format!("{}/{}", namespace, name))
        }
        other => Error::Kube(other),
    })
}

/// Check that a secret carries a non-empty value for `key`
pub fn check_secret_key(secret: &Secret, key: &str) -> Result<()> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    let present = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|bytes| !bytes.0.is_empty())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|value| !value.is_empty())
        })
        .unwrap_or(false);

    if present {
        Ok(())
    } else {
        Err(Error::SecretNotFound(format!(
            "{} has no value for key '{}'",
            name, key
        )))
    }
}

/// Ensure the SASL password secret referenced by an app exists.
///
/// Members read the password from the secret at startup, so the StatefulSet
/// is not synced until it is present.
pub async fn ensure_sasl_secret(client: &Client, namespace: &str, sasl: &SaslSpec) -> Result<()> {
    let secret = get_secret(client, &sasl.password_secret.secret_name, namespace).await?;
    check_secret_key(&secret, &sasl.password_secret.password_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn secret_with(key: &str, value: &[u8]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("kafka-credentials".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(key.to_string(), ByteString(value.to_vec()))])),
            ..Default::default()
        }
    }

    #[test]
    fn test_check_secret_key_present() {
        assert!(check_secret_key(&secret_with("password", b"s3cret"), "password").is_ok());
    }

    #[test]
    fn test_check_secret_key_missing_or_empty() {
        let err = check_secret_key(&secret_with("password", b"s3cret"), "pass").unwrap_err();
        assert!(matches!(err, Error::SecretNotFound(_)));
        assert!(check_secret_key(&secret_with("password", b""), "password").is_err());
    }
}
