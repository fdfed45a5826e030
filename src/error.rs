use thiserror::Error;

/// Failures reported by the secret store gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    #[error("secret modified concurrently: {0}")]
    Conflict(String),
    #[error("secret `{secret}` is missing field `{field}`")]
    MissingField { secret: String, field: String },
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "store_unavailable",
            StoreError::Conflict(_) => "store_conflict",
            StoreError::MissingField { .. } => "store_missing_field",
        }
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(response) if response.code == 409 => {
                StoreError::Conflict(response.message.clone())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

/// Failures reported by the credential authority.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthorityError {
    #[error("key issuance failed: {0}")]
    IssuanceFailed(String),
    #[error("listing keys failed: {0}")]
    ListingFailed(String),
    #[error("new key failed verification: {0}")]
    VerificationFailed(String),
    #[error("key revocation failed: {0}")]
    RevocationFailed(String),
    #[error("session construction failed: {0}")]
    SessionFailed(String),
}

impl AuthorityError {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthorityError::IssuanceFailed(_) => "issuance_failed",
            AuthorityError::ListingFailed(_) => "listing_failed",
            AuthorityError::VerificationFailed(_) => "verification_failed",
            AuthorityError::RevocationFailed(_) => "revocation_failed",
            AuthorityError::SessionFailed(_) => "session_failed",
        }
    }

    /// Re-labels any authority failure observed while probing a fresh key.
    pub fn into_verification(self) -> Self {
        match self {
            AuthorityError::VerificationFailed(message) => {
                AuthorityError::VerificationFailed(message)
            }
            other => AuthorityError::VerificationFailed(other.to_string()),
        }
    }
}

/// Error attached to a non-`Done` rotation outcome.
#[derive(Debug, Clone, Error)]
pub enum RotationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Authority(#[from] AuthorityError),
    #[error("rollback failed, key `{orphaned_key_id}` is orphaned: {source} (rolling back after: {cause})")]
    RollbackFailed {
        orphaned_key_id: String,
        cause: Box<RotationError>,
        #[source]
        source: AuthorityError,
    },
    #[error("secret write for key `{key_id}` could not be confirmed: {cause} (re-read failed: {source})")]
    CommitUnconfirmed {
        key_id: String,
        cause: StoreError,
        #[source]
        source: StoreError,
    },
    #[error("rotation cancelled before the new key was verified")]
    Cancelled,
}

impl RotationError {
    pub fn kind(&self) -> &'static str {
        match self {
            RotationError::Store(err) => err.kind(),
            RotationError::Authority(err) => err.kind(),
            RotationError::RollbackFailed { .. } => "rollback_failed",
            RotationError::CommitUnconfirmed { .. } => "commit_unconfirmed",
            RotationError::Cancelled => "cancelled",
        }
    }

    pub fn orphaned_key_id(&self) -> Option<&str> {
        match self {
            RotationError::RollbackFailed {
                orphaned_key_id, ..
            } => Some(orphaned_key_id),
            _ => None,
        }
    }

    /// New key that may or may not be recorded in the secret.
    pub fn unconfirmed_key_id(&self) -> Option<&str> {
        match self {
            RotationError::CommitUnconfirmed { key_id, .. } => Some(key_id),
            _ => None,
        }
    }
}

pub type RotationResult<T> = Result<T, RotationError>;

/// Failure refreshing one registry pull secret.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Authority(#[from] AuthorityError),
    #[error("registry token unusable: {0}")]
    InvalidToken(String),
}

impl RegistryError {
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::Store(err) => err.kind(),
            RegistryError::Authority(err) => err.kind(),
            RegistryError::InvalidToken(_) => "invalid_token",
        }
    }
}
