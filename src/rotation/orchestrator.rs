use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::authority::{CredentialAuthority, SessionFactory};
use crate::config::RotationConfig;
use crate::error::{AuthorityError, RotationError, RotationResult, StoreError};
use crate::store::SecretStore;

use super::models::{KeyPair, KeyStatus, RotationCandidate, RotationOutcome, RotationState};
use super::settle::{settle, Pause};

/// key: rotation-context
/// Collaborators and settings shared by every rotation in one run.
#[derive(Clone)]
pub struct RotationContext {
    pub store: Arc<dyn SecretStore>,
    pub sessions: Arc<dyn SessionFactory>,
    pub pause: Arc<dyn Pause>,
    pub config: RotationConfig,
    pub cancel: CancellationToken,
}

/// key: key-lifecycle-orchestrator
/// Drives one candidate through issue, verify, commit and retire, rolling back
/// while the secret still records the old key.
pub struct KeyLifecycle<'a> {
    ctx: &'a RotationContext,
}

struct Progress {
    candidate: RotationCandidate,
    trail: Vec<RotationState>,
    new_key_id: Option<String>,
    new_key_status: Option<KeyStatus>,
    old_key_status: KeyStatus,
    pruned_key_ids: Vec<String>,
}

impl Progress {
    fn enter(&mut self, state: RotationState) {
        tracing::debug!(
            secret = %self.candidate.name,
            namespace = %self.candidate.namespace,
            state = %state,
            "rotation state entered",
        );
        self.trail.push(state);
    }

    fn finish(mut self, state: RotationState, error: Option<RotationError>) -> RotationOutcome {
        self.enter(state);
        RotationOutcome {
            candidate: self.candidate,
            final_state: state,
            error,
            new_key_id: self.new_key_id,
            new_key_status: self.new_key_status,
            old_key_status: self.old_key_status,
            pruned_key_ids: self.pruned_key_ids,
            trail: self.trail,
        }
    }
}

impl<'a> KeyLifecycle<'a> {
    pub fn new(ctx: &'a RotationContext) -> Self {
        Self { ctx }
    }

    pub async fn rotate(&self, candidate: RotationCandidate) -> RotationOutcome {
        let mut progress = Progress {
            candidate,
            trail: Vec::new(),
            new_key_id: None,
            new_key_status: None,
            old_key_status: KeyStatus::Active,
            pruned_key_ids: Vec::new(),
        };
        progress.enter(RotationState::Start);
        tracing::info!(
            secret = %progress.candidate.name,
            namespace = %progress.candidate.namespace,
            key_id = %progress.candidate.key_id,
            "starting access key rotation",
        );

        let connected = self
            .ctx
            .sessions
            .connect(&progress.candidate.current_credentials());
        let old_session = match connected {
            Ok(session) => session,
            Err(err) => return self.fail(progress, err.into()),
        };

        if self.ctx.config.prune_orphaned_keys {
            progress.enter(RotationState::PruningOrphanedKeys);
            let pruned = self.prune_orphans(&mut progress, old_session.as_ref()).await;
            if let Err(err) = pruned {
                return self.fail(progress, err);
            }
        }

        progress.enter(RotationState::IssuingNewKey);
        let mut new_key = match self
            .bounded(old_session.issue_key(), AuthorityError::IssuanceFailed)
            .await
        {
            Ok(key) => key,
            Err(err) => return self.fail(progress, err.into()),
        };
        progress.new_key_id = Some(new_key.key_id.clone());
        progress.new_key_status = Some(new_key.status);

        progress.enter(RotationState::VerifyingNewKey);
        let verified = self.verify(&progress.candidate, &new_key).await;
        let new_session = match verified {
            Ok(session) => session,
            Err(err) => {
                return self
                    .roll_back(progress, old_session.as_ref(), &new_key, err)
                    .await
            }
        };

        progress.enter(RotationState::CommittingSecret);
        let committed = self
            .bounded(
                self.ctx
                    .store
                    .update(&progress.candidate, &new_key.key_id, &new_key.secret_value),
                StoreError::Unavailable,
            )
            .await;
        if let Err(err) = committed {
            let confirmed = self.confirm_commit(&progress.candidate, &new_key, &err).await;
            match confirmed {
                Ok(true) => tracing::warn!(
                    %err,
                    secret = %progress.candidate.name,
                    namespace = %progress.candidate.namespace,
                    key_id = %new_key.key_id,
                    "secret write reported an error but the secret holds the new key",
                ),
                Ok(false) => {
                    return self
                        .roll_back(progress, old_session.as_ref(), &new_key, err.into())
                        .await
                }
                Err(source) => return self.unconfirmed(progress, &new_key, err, source),
            }
        }
        new_key.status = KeyStatus::Active;
        progress.new_key_status = Some(new_key.status);

        progress.enter(RotationState::RetiringOldKey);
        let old_key_id = progress.candidate.key_id.clone();
        let retired = self
            .bounded(
                new_session.revoke_key(&old_key_id),
                AuthorityError::RevocationFailed,
            )
            .await;
        match retired {
            Ok(()) => {
                progress.old_key_status = KeyStatus::Retired;
                tracing::info!(
                    secret = %progress.candidate.name,
                    namespace = %progress.candidate.namespace,
                    old_key_id = %old_key_id,
                    key_id = %new_key.key_id,
                    status = ?new_key.status,
                    "access key rotated and old key deleted",
                );
                progress.finish(RotationState::Done, None)
            }
            Err(err) => {
                tracing::warn!(
                    %err,
                    secret = %progress.candidate.name,
                    namespace = %progress.candidate.namespace,
                    old_key_id = %old_key_id,
                    "secret holds the new key but the old key is still active",
                );
                progress.finish(RotationState::PartialSuccess, Some(err.into()))
            }
        }
    }

    /// Revokes every key of the identity other than the one recorded in the secret.
    async fn prune_orphans(
        &self,
        progress: &mut Progress,
        session: &dyn CredentialAuthority,
    ) -> RotationResult<()> {
        let keys = self
            .bounded(session.list_keys(), AuthorityError::ListingFailed)
            .await?;
        for key_id in keys
            .into_iter()
            .filter(|key_id| *key_id != progress.candidate.key_id)
        {
            tracing::info!(
                secret = %progress.candidate.name,
                %key_id,
                "found orphaned key, deleting it",
            );
            let revoked = self
                .bounded(session.revoke_key(&key_id), AuthorityError::RevocationFailed)
                .await;
            match revoked {
                Ok(()) => progress.pruned_key_ids.push(key_id),
                Err(err) => tracing::warn!(
                    %err,
                    secret = %progress.candidate.name,
                    %key_id,
                    "failed to delete orphaned key",
                ),
            }
        }
        Ok(())
    }

    /// Waits for propagation, then proves the new key can list its identity's keys.
    async fn verify(
        &self,
        candidate: &RotationCandidate,
        new_key: &KeyPair,
    ) -> RotationResult<Arc<dyn CredentialAuthority>> {
        let session = self
            .ctx
            .sessions
            .connect(&new_key.credentials(format!("{}-new", candidate.name)))?;
        let policy = self.ctx.config.settle;
        let attempts = policy.attempts();
        let mut last_error = None;

        for attempt in 1..=attempts {
            settle(
                self.ctx.pause.as_ref(),
                policy.wait_before(attempt),
                &self.ctx.cancel,
            )
            .await?;

            let err = match self
                .bounded(session.list_keys(), AuthorityError::VerificationFailed)
                .await
            {
                Ok(keys) if keys.iter().any(|key_id| *key_id == new_key.key_id) => {
                    if attempt > 1 {
                        tracing::info!(
                            secret = %candidate.name,
                            key_id = %new_key.key_id,
                            attempt,
                            "new access key usable after retry",
                        );
                    }
                    return Ok(session);
                }
                Ok(_) => AuthorityError::VerificationFailed(format!(
                    "key {} is not visible to its own session",
                    new_key.key_id
                )),
                Err(err) => err.into_verification(),
            };
            tracing::warn!(
                %err,
                secret = %candidate.name,
                key_id = %new_key.key_id,
                attempt,
                attempts,
                "unable to use new access key",
            );
            last_error = Some(err);
        }

        Err(last_error
            .unwrap_or_else(|| {
                AuthorityError::VerificationFailed("no verification attempt was made".into())
            })
            .into())
    }

    /// Revokes the never-committed new key with the old session.
    async fn roll_back(
        &self,
        mut progress: Progress,
        old_session: &dyn CredentialAuthority,
        new_key: &KeyPair,
        cause: RotationError,
    ) -> RotationOutcome {
        progress.enter(RotationState::RollingBack);
        match self
            .bounded(
                old_session.revoke_key(&new_key.key_id),
                AuthorityError::RevocationFailed,
            )
            .await
        {
            Ok(()) => {
                progress.new_key_status = Some(KeyStatus::Retired);
                tracing::error!(
                    error = %cause,
                    secret = %progress.candidate.name,
                    namespace = %progress.candidate.namespace,
                    key_id = %new_key.key_id,
                    "rotation failed; new access key rolled back",
                );
                progress.finish(RotationState::Failed, Some(cause))
            }
            Err(source) => {
                tracing::error!(
                    error = %source,
                    cause = %cause,
                    secret = %progress.candidate.name,
                    namespace = %progress.candidate.namespace,
                    orphaned_key_id = %new_key.key_id,
                    "unable to delete new access key; manual cleanup required",
                );
                progress.finish(
                    RotationState::FailedRollback,
                    Some(RotationError::RollbackFailed {
                        orphaned_key_id: new_key.key_id.clone(),
                        cause: Box::new(cause),
                        source,
                    }),
                )
            }
        }
    }

    /// Re-reads the secret after a failed write. `Ok(true)` when it already records the new key.
    async fn confirm_commit(
        &self,
        candidate: &RotationCandidate,
        new_key: &KeyPair,
        err: &StoreError,
    ) -> Result<bool, StoreError> {
        if let StoreError::Conflict(_) = err {
            return Ok(false);
        }
        let recorded = self
            .bounded(
                self.ctx.store.current_key_id(candidate),
                StoreError::Unavailable,
            )
            .await?;
        Ok(recorded == new_key.key_id)
    }

    /// Neither key can be revoked safely while the secret's content is unknown.
    fn unconfirmed(
        &self,
        progress: Progress,
        new_key: &KeyPair,
        cause: StoreError,
        source: StoreError,
    ) -> RotationOutcome {
        tracing::error!(
            error = %source,
            cause = %cause,
            secret = %progress.candidate.name,
            namespace = %progress.candidate.namespace,
            key_id = %new_key.key_id,
            old_key_id = %progress.candidate.key_id,
            "unable to confirm secret write; both keys left active, manual cleanup required",
        );
        progress.finish(
            RotationState::FailedRollback,
            Some(RotationError::CommitUnconfirmed {
                key_id: new_key.key_id.clone(),
                cause,
                source,
            }),
        )
    }

    fn fail(&self, progress: Progress, err: RotationError) -> RotationOutcome {
        tracing::error!(
            error = %err,
            secret = %progress.candidate.name,
            namespace = %progress.candidate.namespace,
            "rotation failed before a new key was created",
        );
        progress.finish(RotationState::Failed, Some(err))
    }

    async fn bounded<T, E, F>(&self, call: F, on_timeout: fn(String) -> E) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let limit = self.ctx.config.call_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(format!("timed out after {limit:?}"))),
        }
    }
}
