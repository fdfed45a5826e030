use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::authority::SessionCredentials;
use crate::error::RotationError;

/// key: rotation-candidate
/// One labeled secret selected for rotation, as read from the secret store.
#[derive(Clone, PartialEq, Eq)]
pub struct RotationCandidate {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub key_id: String,
    pub secret_value: String,
    /// Concurrency token of the secret object at read time.
    pub resource_version: Option<String>,
}

impl RotationCandidate {
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Credentials of the key currently recorded in the secret.
    pub fn current_credentials(&self) -> SessionCredentials {
        SessionCredentials::new(
            self.key_id.clone(),
            self.secret_value.clone(),
            Some(format!("{}-orig", self.name)),
        )
    }
}

impl fmt::Debug for RotationCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationCandidate")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("labels", &self.labels)
            .field("key_id", &self.key_id)
            .field("secret_value", &"<redacted>")
            .field("resource_version", &self.resource_version)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    PendingVerification,
    Retired,
}

/// key: rotation-key-pair
/// Access key pair as issued by the credential authority.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub key_id: String,
    pub secret_value: String,
    pub status: KeyStatus,
}

impl KeyPair {
    pub fn pending(key_id: impl Into<String>, secret_value: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            secret_value: secret_value.into(),
            status: KeyStatus::PendingVerification,
        }
    }

    pub fn credentials(&self, profile: impl Into<String>) -> SessionCredentials {
        SessionCredentials::new(
            self.key_id.clone(),
            self.secret_value.clone(),
            Some(profile.into()),
        )
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_id", &self.key_id)
            .field("secret_value", &"<redacted>")
            .field("status", &self.status)
            .finish()
    }
}

/// key: rotation-state
/// States of the per-candidate key lifecycle machine.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RotationState {
    Start,
    PruningOrphanedKeys,
    IssuingNewKey,
    VerifyingNewKey,
    CommittingSecret,
    RetiringOldKey,
    RollingBack,
    Done,
    PartialSuccess,
    Failed,
    FailedRollback,
}

impl RotationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationState::Start => "start",
            RotationState::PruningOrphanedKeys => "pruning_orphaned_keys",
            RotationState::IssuingNewKey => "issuing_new_key",
            RotationState::VerifyingNewKey => "verifying_new_key",
            RotationState::CommittingSecret => "committing_secret",
            RotationState::RetiringOldKey => "retiring_old_key",
            RotationState::RollingBack => "rolling_back",
            RotationState::Done => "done",
            RotationState::PartialSuccess => "partial_success",
            RotationState::Failed => "failed",
            RotationState::FailedRollback => "failed_rollback",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RotationState::Done
                | RotationState::PartialSuccess
                | RotationState::Failed
                | RotationState::FailedRollback
        )
    }
}

impl fmt::Display for RotationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// key: rotation-outcome
/// Terminal result of one candidate's rotation.
#[derive(Clone, Debug)]
pub struct RotationOutcome {
    pub candidate: RotationCandidate,
    pub final_state: RotationState,
    pub error: Option<RotationError>,
    /// Key issued during this attempt, whether or not it survived.
    pub new_key_id: Option<String>,
    /// `Retired` once a rolled-back key has been revoked.
    pub new_key_status: Option<KeyStatus>,
    /// `Retired` only after the old key was revoked.
    pub old_key_status: KeyStatus,
    pub pruned_key_ids: Vec<String>,
    /// Every state entered, in order, ending with `final_state`.
    pub trail: Vec<RotationState>,
}

impl RotationOutcome {
    pub fn is_done(&self) -> bool {
        self.final_state == RotationState::Done
    }

    pub fn is_hard_failure(&self) -> bool {
        matches!(
            self.final_state,
            RotationState::Failed | RotationState::FailedRollback
        )
    }

    /// An orphaned new key or a still-live old key needs an operator.
    pub fn requires_manual_remediation(&self) -> bool {
        matches!(
            self.final_state,
            RotationState::FailedRollback | RotationState::PartialSuccess
        )
    }

    pub fn error_kind(&self) -> Option<&'static str> {
        self.error.as_ref().map(RotationError::kind)
    }
}
