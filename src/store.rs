//! Secret store gateway backed by Kubernetes `Secret` objects.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, PostParams};

use crate::config::CredentialFields;
use crate::error::StoreError;
use crate::rotation::models::RotationCandidate;

/// key: secret-store-gateway
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Every readable secret carrying `label=value`. An empty result is not an error.
    async fn list_by_label(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<RotationCandidate>, StoreError>;

    /// Replaces the key pair recorded in the candidate's secret.
    async fn update(
        &self,
        candidate: &RotationCandidate,
        new_key_id: &str,
        new_secret_value: &str,
    ) -> Result<(), StoreError>;

    /// Key id the candidate's secret records right now.
    async fn current_key_id(&self, candidate: &RotationCandidate) -> Result<String, StoreError>;
}

#[derive(Clone)]
pub struct KubernetesSecretStore {
    client: kube::Client,
    namespace: String,
    fields: CredentialFields,
}

impl KubernetesSecretStore {
    pub fn new(client: kube::Client, namespace: impl Into<String>, fields: CredentialFields) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            fields,
        }
    }

    /// Resolves kubeconfig (local file first, then in-cluster) and the target namespace.
    pub async fn connect(
        namespace: Option<String>,
        fields: CredentialFields,
    ) -> Result<Self, kube::Error> {
        let client = kube::Client::try_default().await?;
        let namespace = namespace.unwrap_or_else(|| client.default_namespace().to_string());
        tracing::info!(%namespace, "connected to kubernetes secret store");
        Ok(Self::new(client, namespace, fields))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn fields(&self) -> &CredentialFields {
        &self.fields
    }

    pub(crate) fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SecretStore for KubernetesSecretStore {
    async fn list_by_label(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<RotationCandidate>, StoreError> {
        let params = ListParams::default().labels(&format!("{label}={value}"));
        let list = self.secrets(&self.namespace).list(&params).await?;

        let mut candidates = Vec::with_capacity(list.items.len());
        for secret in list.items {
            match candidate_from_secret(secret, &self.namespace, &self.fields) {
                Ok(candidate) => candidates.push(candidate),
                Err(err) => {
                    tracing::warn!(%err, namespace = %self.namespace, "skipping unusable secret");
                }
            }
        }
        tracing::info!(
            count = candidates.len(),
            %label,
            namespace = %self.namespace,
            "found secrets to rotate",
        );
        Ok(candidates)
    }

    async fn update(
        &self,
        candidate: &RotationCandidate,
        new_key_id: &str,
        new_secret_value: &str,
    ) -> Result<(), StoreError> {
        let secrets = self.secrets(&candidate.namespace);
        let mut secret = secrets.get(&candidate.name).await?;

        if let (Some(expected), Some(actual)) = (
            candidate.resource_version.as_deref(),
            secret.metadata.resource_version.as_deref(),
        ) {
            if expected != actual {
                return Err(StoreError::Conflict(format!(
                    "secret {} changed since it was read (resourceVersion {expected} -> {actual})",
                    candidate.qualified_name()
                )));
            }
        }

        write_key_pair(&mut secret, &self.fields, new_key_id, new_secret_value);
        secrets
            .replace(&candidate.name, &PostParams::default(), &secret)
            .await?;
        tracing::info!(
            secret = %candidate.name,
            namespace = %candidate.namespace,
            key_id = %new_key_id,
            "secret updated with new access key",
        );
        Ok(())
    }

    async fn current_key_id(&self, candidate: &RotationCandidate) -> Result<String, StoreError> {
        let secret = self
            .secrets(&candidate.namespace)
            .get(&candidate.name)
            .await?;
        read_field(&secret, &self.fields.key_id).ok_or_else(|| StoreError::MissingField {
            secret: candidate.name.clone(),
            field: self.fields.key_id.clone(),
        })
    }
}

pub(crate) fn read_field(
    secret: &Secret,
    field: &str,
) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(field))
        .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(field).cloned())
        })
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn candidate_from_secret(
    secret: Secret,
    default_namespace: &str,
    fields: &CredentialFields,
) -> Result<RotationCandidate, StoreError> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    let missing = |field: &str| StoreError::MissingField {
        secret: name.clone(),
        field: field.to_string(),
    };
    let key_id = read_field(&secret, &fields.key_id).ok_or_else(|| missing(&fields.key_id))?;
    let secret_value =
        read_field(&secret, &fields.secret_value).ok_or_else(|| missing(&fields.secret_value))?;

    Ok(RotationCandidate {
        namespace: secret
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| default_namespace.to_string()),
        labels: secret.metadata.labels.clone().unwrap_or_default(),
        resource_version: secret.metadata.resource_version.clone(),
        name,
        key_id,
        secret_value,
    })
}

fn write_key_pair(
    secret: &mut Secret,
    fields: &CredentialFields,
    key_id: &str,
    secret_value: &str,
) {
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    data.insert(
        fields.key_id.clone(),
        ByteString(key_id.as_bytes().to_vec()),
    );
    data.insert(
        fields.secret_value.clone(),
        ByteString(secret_value.as_bytes().to_vec()),
    );
    if let Some(string_data) = secret.string_data.as_mut() {
        string_data.remove(&fields.key_id);
        string_data.remove(&fields.secret_value);
    }
}
