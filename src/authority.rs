//! Credential authority contract and its IAM implementation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_iam::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_iam::error::DisplayErrorContext;

use crate::error::AuthorityError;
use crate::rotation::models::KeyPair;

const CREDENTIALS_PROVIDER_NAME: &str = "rotation-secret";

/// Everything needed to authenticate as an identity.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub key_id: String,
    pub secret_value: String,
    pub profile: Option<String>,
}

impl SessionCredentials {
    pub fn new(
        key_id: impl Into<String>,
        secret_value: impl Into<String>,
        profile: Option<String>,
    ) -> Self {
        Self {
            key_id: key_id.into(),
            secret_value: secret_value.into(),
            profile,
        }
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("key_id", &self.key_id)
            .field("secret_value", &"<redacted>")
            .field("profile", &self.profile)
            .finish()
    }
}

/// key: credential-authority
/// Authority handle bound to the identity whose key built the session.
#[async_trait]
pub trait CredentialAuthority: Send + Sync {
    /// Issues a new key pair for the session's identity.
    async fn issue_key(&self) -> Result<KeyPair, AuthorityError>;

    /// Lists the key ids currently held by the session's identity.
    async fn list_keys(&self) -> Result<Vec<String>, AuthorityError>;

    /// Revokes `key_id`. A key that no longer exists counts as revoked.
    async fn revoke_key(&self, key_id: &str) -> Result<(), AuthorityError>;
}

/// key: session-factory
pub trait SessionFactory: Send + Sync {
    fn connect(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<Arc<dyn CredentialAuthority>, AuthorityError>;
}

/// Builds IAM clients from static key pairs.
#[derive(Clone, Debug)]
pub struct IamSessionFactory {
    region: String,
}

impl IamSessionFactory {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
        }
    }
}

impl SessionFactory for IamSessionFactory {
    fn connect(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<Arc<dyn CredentialAuthority>, AuthorityError> {
        if credentials.key_id.trim().is_empty() || credentials.secret_value.trim().is_empty() {
            return Err(AuthorityError::SessionFailed(
                "access key id and secret are required".into(),
            ));
        }

        tracing::debug!(
            key_id = %credentials.key_id,
            profile = ?credentials.profile,
            region = %self.region,
            "building IAM session",
        );

        let config = aws_sdk_iam::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .credentials_provider(Credentials::new(
                credentials.key_id.clone(),
                credentials.secret_value.clone(),
                None,
                None,
                CREDENTIALS_PROVIDER_NAME,
            ))
            .build();

        Ok(Arc::new(IamAuthority {
            client: aws_sdk_iam::Client::from_conf(config),
            profile: credentials.profile.clone(),
        }))
    }
}

pub struct IamAuthority {
    client: aws_sdk_iam::Client,
    profile: Option<String>,
}

#[async_trait]
impl CredentialAuthority for IamAuthority {
    async fn issue_key(&self) -> Result<KeyPair, AuthorityError> {
        let output = self
            .client
            .create_access_key()
            .send()
            .await
            .map_err(|err| AuthorityError::IssuanceFailed(DisplayErrorContext(&err).to_string()))?;

        let key = output.access_key().ok_or_else(|| {
            AuthorityError::IssuanceFailed("response did not include an access key".into())
        })?;

        tracing::info!(
            key_id = %key.access_key_id(),
            profile = ?self.profile,
            "created new access key",
        );
        Ok(KeyPair::pending(
            key.access_key_id(),
            key.secret_access_key(),
        ))
    }

    async fn list_keys(&self) -> Result<Vec<String>, AuthorityError> {
        let output = self
            .client
            .list_access_keys()
            .send()
            .await
            .map_err(|err| AuthorityError::ListingFailed(DisplayErrorContext(&err).to_string()))?;

        Ok(output
            .access_key_metadata()
            .iter()
            .filter_map(|metadata| metadata.access_key_id().map(ToString::to_string))
            .collect())
    }

    async fn revoke_key(&self, key_id: &str) -> Result<(), AuthorityError> {
        match self
            .client
            .delete_access_key()
            .access_key_id(key_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .map(|service| service.is_no_such_entity_exception())
                    .unwrap_or(false) =>
            {
                tracing::info!(%key_id, "access key already gone; treating as revoked");
                Ok(())
            }
            Err(err) => Err(AuthorityError::RevocationFailed(
                DisplayErrorContext(&err).to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iam_sessions_require_both_halves_of_the_key() {
        let factory = IamSessionFactory::new("eu-west-1");
        let err = factory
            .connect(&SessionCredentials::new("AKIA-OLD", " ", None))
            .err()
            .expect("blank secret should be rejected");
        assert!(matches!(err, AuthorityError::SessionFailed(_)));
    }

    #[tokio::test]
    async fn iam_session_builds_from_static_credentials() {
        let factory = IamSessionFactory::new("eu-west-1");
        assert!(factory
            .connect(&SessionCredentials::new(
                "AKIA-OLD",
                "secret",
                Some("billing-orig".into())
            ))
            .is_ok());
    }

    #[test]
    fn credentials_debug_redacts_secret() {
        let creds = SessionCredentials::new("AKIA-OLD", "hunter2", None);
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
