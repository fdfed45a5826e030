//! Registry pull-secret refresh: a single idempotent overwrite per secret, no rollback.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_ecr::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_ecr::error::DisplayErrorContext;
use base64::engine::general_purpose::STANDARD as Base64Engine;
use base64::Engine;
use chrono::{DateTime, Utc};
use kube::api::{ListParams, Patch, PatchParams};
use serde::Serialize;

use crate::authority::SessionCredentials;
use crate::error::{AuthorityError, RegistryError, StoreError};
use crate::rotation::report::RunStatus;
use crate::store::{read_field, KubernetesSecretStore};

pub const ACCESS_KEY_SECRET_ANNOTATION: &str = "aws-ecr-updater/secret";
pub const REGION_ANNOTATION: &str = "aws-ecr-updater/region";
pub const EXPIRES_AT_ANNOTATION: &str = "aws-ecr-updater/expires-at";
pub const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";

/// A pull secret to refresh, with the annotations naming its source credentials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryTarget {
    pub name: String,
    pub namespace: String,
    pub access_key_secret: Option<String>,
    pub region: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct RegistryToken {
    pub endpoint: String,
    /// Base64 of `user:password`.
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RegistrySecretStore: Send + Sync {
    async fn list_registry_targets(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<RegistryTarget>, StoreError>;

    async fn read_credentials(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<SessionCredentials, StoreError>;

    async fn write_docker_config(
        &self,
        target: &RegistryTarget,
        docker_config: &[u8],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RegistryTokenSource: Send + Sync {
    async fn authorization_token(
        &self,
        credentials: &SessionCredentials,
        region: &str,
    ) -> Result<RegistryToken, AuthorityError>;
}

#[derive(Serialize)]
struct DockerConfigJson {
    auths: BTreeMap<String, DockerConfigEntry>,
}

#[derive(Serialize)]
struct DockerConfigEntry {
    username: String,
    password: String,
    email: String,
    auth: String,
}

/// Renders a `.dockerconfigjson` document from a registry token.
pub fn build_docker_config(token: &RegistryToken, email: &str) -> Result<Vec<u8>, RegistryError> {
    let decoded = Base64Engine
        .decode(token.token.trim())
        .map_err(|err| RegistryError::InvalidToken(format!("token is not base64: {err}")))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| RegistryError::InvalidToken("token is not utf-8".into()))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| RegistryError::InvalidToken("token lacks a user:password pair".into()))?;

    let entry = DockerConfigEntry {
        username: username.to_string(),
        password: password.to_string(),
        email: email.to_string(),
        auth: Base64Engine.encode(format!("{username}:{password}")),
    };
    let config = DockerConfigJson {
        auths: BTreeMap::from([(token.endpoint.clone(), entry)]),
    };
    serde_json::to_vec(&config).map_err(|err| RegistryError::InvalidToken(err.to_string()))
}

/// key: registry-refresher
pub struct RegistryRefresher {
    store: Arc<dyn RegistrySecretStore>,
    tokens: Arc<dyn RegistryTokenSource>,
    label: String,
    email: String,
    call_timeout: Duration,
}

#[derive(Debug, Default)]
pub struct RegistryReport {
    pub results: Vec<(RegistryTarget, Result<Option<DateTime<Utc>>, RegistryError>)>,
}

impl RegistryReport {
    pub fn status(&self) -> RunStatus {
        if self.results.iter().any(|(_, result)| result.is_err()) {
            RunStatus::HardFailure
        } else {
            RunStatus::AllSucceeded
        }
    }

    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .results
            .iter()
            .map(|(target, result)| match result {
                Ok(expires_at) => format!(
                    "{}/{}: refreshed (expires {})",
                    target.namespace,
                    target.name,
                    expires_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "unknown".to_string()),
                ),
                Err(err) => format!(
                    "{}/{}: failed [{}] {err}",
                    target.namespace,
                    target.name,
                    err.kind()
                ),
            })
            .collect();
        lines.push(format!(
            "{} registry secret(s); status {}",
            self.results.len(),
            self.status().as_str()
        ));
        lines
    }
}

impl RegistryRefresher {
    pub fn new(
        store: Arc<dyn RegistrySecretStore>,
        tokens: Arc<dyn RegistryTokenSource>,
        label: impl Into<String>,
        email: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            tokens,
            label: label.into(),
            email: email.into(),
            call_timeout,
        }
    }

    pub async fn run(&self) -> Result<RegistryReport, StoreError> {
        let targets = self
            .bounded(
                self.store.list_registry_targets(&self.label, "true"),
                StoreError::Unavailable,
            )
            .await?;

        let mut report = RegistryReport::default();
        for target in targets {
            tracing::info!(secret = %target.name, region = ?target.region, "found registry secret");
            let result = self.refresh(&target).await;
            match &result {
                Ok(_) => tracing::info!(
                    secret = %target.name,
                    "secret updated with new registry credentials",
                ),
                Err(err) => tracing::error!(
                    %err,
                    secret = %target.name,
                    "unable to refresh registry credentials",
                ),
            }
            report.results.push((target, result));
        }
        Ok(report)
    }

    async fn refresh(
        &self,
        target: &RegistryTarget,
    ) -> Result<Option<DateTime<Utc>>, RegistryError> {
        let missing = |field: &str| StoreError::MissingField {
            secret: target.name.clone(),
            field: field.to_string(),
        };
        let source = target
            .access_key_secret
            .as_deref()
            .ok_or_else(|| missing(ACCESS_KEY_SECRET_ANNOTATION))?;
        let region = target
            .region
            .as_deref()
            .ok_or_else(|| missing(REGION_ANNOTATION))?;

        let credentials = self
            .bounded(
                self.store.read_credentials(&target.namespace, source),
                StoreError::Unavailable,
            )
            .await?;
        let token = self
            .bounded(
                self.tokens.authorization_token(&credentials, region),
                AuthorityError::IssuanceFailed,
            )
            .await?;
        let docker_config = build_docker_config(&token, &self.email)?;
        self.bounded(
            self.store
                .write_docker_config(target, &docker_config, token.expires_at),
            StoreError::Unavailable,
        )
        .await?;
        Ok(token.expires_at)
    }

    async fn bounded<T, E, F>(&self, call: F, on_timeout: fn(String) -> E) -> Result<T, E>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(format!("timed out after {:?}", self.call_timeout))),
        }
    }
}

/// Fetches registry authorization tokens from ECR.
pub struct EcrTokenSource;

#[async_trait]
impl RegistryTokenSource for EcrTokenSource {
    async fn authorization_token(
        &self,
        credentials: &SessionCredentials,
        region: &str,
    ) -> Result<RegistryToken, AuthorityError> {
        let config = aws_sdk_ecr::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(Credentials::new(
                credentials.key_id.clone(),
                credentials.secret_value.clone(),
                None,
                None,
                "registry-secret",
            ))
            .build();
        let client = aws_sdk_ecr::Client::from_conf(config);

        let output = client
            .get_authorization_token()
            .send()
            .await
            .map_err(|err| AuthorityError::IssuanceFailed(DisplayErrorContext(&err).to_string()))?;
        tracing::info!(
            count = output.authorization_data().len(),
            %region,
            "found authorization data",
        );

        let data = output.authorization_data().first().ok_or_else(|| {
            AuthorityError::IssuanceFailed("no authorization data returned".into())
        })?;
        Ok(RegistryToken {
            endpoint: data.proxy_endpoint().unwrap_or_default().to_string(),
            token: data
                .authorization_token()
                .ok_or_else(|| AuthorityError::IssuanceFailed("authorization token missing".into()))?
                .to_string(),
            expires_at: data
                .expires_at()
                .and_then(|at| DateTime::from_timestamp(at.secs(), at.subsec_nanos())),
        })
    }
}

#[async_trait]
impl RegistrySecretStore for KubernetesSecretStore {
    async fn list_registry_targets(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<RegistryTarget>, StoreError> {
        let params = ListParams::default().labels(&format!("{label}={value}"));
        let list = self.secrets(self.namespace()).list(&params).await?;
        Ok(list
            .items
            .into_iter()
            .map(|secret| {
                let annotation = |key: &str| {
                    secret
                        .metadata
                        .annotations
                        .as_ref()
                        .and_then(|annotations| annotations.get(key))
                        .map(|value| value.trim().to_string())
                        .filter(|value| !value.is_empty())
                };
                RegistryTarget {
                    name: secret.metadata.name.clone().unwrap_or_default(),
                    namespace: secret
                        .metadata
                        .namespace
                        .clone()
                        .unwrap_or_else(|| self.namespace().to_string()),
                    access_key_secret: annotation(ACCESS_KEY_SECRET_ANNOTATION),
                    region: annotation(REGION_ANNOTATION),
                }
            })
            .collect())
    }

    async fn read_credentials(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<SessionCredentials, StoreError> {
        let secret = self.secrets(namespace).get(name).await?;
        let fields = self.fields();
        let missing = |field: &str| StoreError::MissingField {
            secret: name.to_string(),
            field: field.to_string(),
        };
        let key_id = read_field(&secret, &fields.key_id).ok_or_else(|| missing(&fields.key_id))?;
        let secret_value = read_field(&secret, &fields.secret_value)
            .ok_or_else(|| missing(&fields.secret_value))?;
        tracing::info!(secret = %name, %key_id, "creating session from secret");
        Ok(SessionCredentials::new(
            key_id,
            secret_value,
            Some(format!("{name}-orig")),
        ))
    }

    async fn write_docker_config(
        &self,
        target: &RegistryTarget,
        docker_config: &[u8],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut patch = serde_json::json!({
            "data": {
                DOCKER_CONFIG_KEY: Base64Engine.encode(docker_config),
            },
        });
        if let Some(expires_at) = expires_at {
            patch["metadata"] = serde_json::json!({
                "annotations": {
                    EXPIRES_AT_ANNOTATION: expires_at.to_rfc3339(),
                }
            });
        }
        self.secrets(&target.namespace)
            .patch(&target.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn docker_config_splits_token_into_user_and_password() {
        let token = RegistryToken {
            endpoint: "https://123456789012.dkr.ecr.eu-west-1.amazonaws.com".into(),
            token: Base64Engine.encode("AWS:s3cr3t"),
            expires_at: None,
        };
        let rendered = build_docker_config(&token, "ops@example.com").unwrap();
        let json: Value = serde_json::from_slice(&rendered).unwrap();
        let entry = &json["auths"]["https://123456789012.dkr.ecr.eu-west-1.amazonaws.com"];
        assert_eq!(entry["username"], "AWS");
        assert_eq!(entry["password"], "s3cr3t");
        assert_eq!(entry["email"], "ops@example.com");
        assert_eq!(entry["auth"], Base64Engine.encode("AWS:s3cr3t"));
    }

    #[test]
    fn malformed_token_is_rejected() {
        let token = RegistryToken {
            endpoint: "registry".into(),
            token: Base64Engine.encode("no-separator"),
            expires_at: None,
        };
        let err = build_docker_config(&token, "").expect_err("token without colon");
        assert_eq!(err.kind(), "invalid_token");
    }
}
