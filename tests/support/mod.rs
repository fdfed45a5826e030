#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use iam_rotator::authority::{CredentialAuthority, SessionCredentials, SessionFactory};
use iam_rotator::config::RotationConfig;
use iam_rotator::error::{AuthorityError, StoreError};
use iam_rotator::rotation::models::{KeyPair, RotationCandidate};
use iam_rotator::rotation::{Pause, RotationContext, SettlePolicy};
use iam_rotator::store::SecretStore;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub const LABEL: &str = "aws-rotate-key";

/// IAM caps every user at two access keys.
pub const MAX_KEYS_PER_IDENTITY: usize = 2;

#[derive(Clone, Debug)]
pub struct StoredSecret {
    pub labels: BTreeMap<String, String>,
    pub key_id: String,
    pub secret_value: String,
    pub resource_version: u64,
}

#[derive(Default)]
pub struct WorldState {
    pub secrets: BTreeMap<String, StoredSecret>,
    /// identity -> (key id, secret value)
    pub identities: BTreeMap<String, Vec<(String, String)>>,
    pub journal: Vec<String>,
    pub next_key_ids: VecDeque<String>,
    pub issued: u32,

    pub listing_unavailable: bool,
    pub conflicting_secrets: HashSet<String>,
    pub fail_issuance: bool,
    /// New keys stay invisible to their own session for this many probes.
    pub hidden_probes: u32,
    pub unverifiable_keys: HashSet<String>,
    pub unrevocable_keys: HashSet<String>,
    /// Calls that never return, e.g. `"issue"`, `"list AKIA-NEW"`, `"revoke AKIA-OLD"`,
    /// `"update"`, `"read"`, `"list_by_label"`.
    pub hung_calls: HashSet<String>,
    /// Secrets whose update is applied but never acknowledged.
    pub stalled_after_write: HashSet<String>,
}

/// In-memory secret store and credential authority sharing one journal.
#[derive(Clone, Default)]
pub struct World {
    pub state: Arc<Mutex<WorldState>>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_secret(&self, name: &str, identity: &str, key_id: &str) {
        let mut state = self.state.lock().await;
        let secret_value = format!("{key_id}-secret");
        state.secrets.insert(
            name.to_string(),
            StoredSecret {
                labels: BTreeMap::from([(LABEL.to_string(), "true".to_string())]),
                key_id: key_id.to_string(),
                secret_value: secret_value.clone(),
                resource_version: 1,
            },
        );
        let keys = state.identities.entry(identity.to_string()).or_default();
        if !keys.iter().any(|(id, _)| id == key_id) {
            keys.push((key_id.to_string(), secret_value));
        }
    }

    pub async fn add_stray_key(&self, identity: &str, key_id: &str) {
        let mut state = self.state.lock().await;
        state
            .identities
            .entry(identity.to_string())
            .or_default()
            .push((key_id.to_string(), format!("{key_id}-secret")));
    }

    pub async fn queue_key_ids(&self, ids: &[&str]) {
        let mut state = self.state.lock().await;
        state
            .next_key_ids
            .extend(ids.iter().map(|id| id.to_string()));
    }

    pub async fn keys_of(&self, identity: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .identities
            .get(identity)
            .map(|keys| keys.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn secret(&self, name: &str) -> StoredSecret {
        self.state
            .lock()
            .await
            .secrets
            .get(name)
            .cloned()
            .expect("secret exists")
    }

    pub async fn journal(&self) -> Vec<String> {
        self.state.lock().await.journal.clone()
    }

    pub async fn hang(&self, call: &str) {
        self.state.lock().await.hung_calls.insert(call.to_string());
    }

    /// Never returns once `call` is marked hung; the lock is released first.
    async fn hang_if(&self, call: &str) {
        let hung = self.state.lock().await.hung_calls.contains(call);
        if hung {
            std::future::pending::<()>().await;
        }
    }

    pub async fn with<F: FnOnce(&mut WorldState)>(&self, change: F) {
        let mut state = self.state.lock().await;
        change(&mut *state);
    }
}

fn identity_of(state: &WorldState, key_id: &str, secret_value: &str) -> Option<String> {
    state.identities.iter().find_map(|(identity, keys)| {
        keys.iter()
            .any(|(id, secret)| id == key_id && secret == secret_value)
            .then(|| identity.clone())
    })
}

#[async_trait]
impl SecretStore for World {
    async fn list_by_label(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<RotationCandidate>, StoreError> {
        self.hang_if("list_by_label").await;
        let state = self.state.lock().await;
        if state.listing_unavailable {
            return Err(StoreError::Unavailable("api server unreachable".into()));
        }
        Ok(state
            .secrets
            .iter()
            .filter(|(_, secret)| secret.labels.get(label).map(String::as_str) == Some(value))
            .map(|(name, secret)| RotationCandidate {
                name: name.clone(),
                namespace: "prod".into(),
                labels: secret.labels.clone(),
                key_id: secret.key_id.clone(),
                secret_value: secret.secret_value.clone(),
                resource_version: Some(secret.resource_version.to_string()),
            })
            .collect())
    }

    async fn update(
        &self,
        candidate: &RotationCandidate,
        new_key_id: &str,
        new_secret_value: &str,
    ) -> Result<(), StoreError> {
        self.hang_if("update").await;
        let mut state = self.state.lock().await;
        if state.conflicting_secrets.contains(&candidate.name) {
            return Err(StoreError::Conflict(format!(
                "secret {} was modified",
                candidate.name
            )));
        }
        let secret = state
            .secrets
            .get_mut(&candidate.name)
            .ok_or_else(|| StoreError::Unavailable("secret vanished".into()))?;
        if candidate.resource_version.as_deref()
            != Some(secret.resource_version.to_string().as_str())
        {
            return Err(StoreError::Conflict("stale resource version".into()));
        }
        secret.key_id = new_key_id.to_string();
        secret.secret_value = new_secret_value.to_string();
        secret.resource_version += 1;
        state
            .journal
            .push(format!("update {} {new_key_id}", candidate.name));
        if state.stalled_after_write.contains(&candidate.name) {
            drop(state);
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn current_key_id(&self, candidate: &RotationCandidate) -> Result<String, StoreError> {
        self.hang_if("read").await;
        let state = self.state.lock().await;
        state
            .secrets
            .get(&candidate.name)
            .map(|secret| secret.key_id.clone())
            .ok_or_else(|| StoreError::Unavailable("secret vanished".into()))
    }
}

impl SessionFactory for World {
    fn connect(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<Arc<dyn CredentialAuthority>, AuthorityError> {
        Ok(Arc::new(FakeSession {
            world: self.clone(),
            key_id: credentials.key_id.clone(),
            secret_value: credentials.secret_value.clone(),
        }))
    }
}

/// Authority handle acting as whichever identity owns the session's key.
pub struct FakeSession {
    world: World,
    key_id: String,
    secret_value: String,
}

impl FakeSession {
    fn identity(&self, state: &WorldState) -> Option<String> {
        identity_of(state, &self.key_id, &self.secret_value)
    }
}

#[async_trait]
impl CredentialAuthority for FakeSession {
    async fn issue_key(&self) -> Result<KeyPair, AuthorityError> {
        self.world.hang_if("issue").await;
        let mut state = self.world.state.lock().await;
        let identity = self
            .identity(&state)
            .ok_or_else(|| AuthorityError::IssuanceFailed("invalid client token".into()))?;
        if state.fail_issuance {
            return Err(AuthorityError::IssuanceFailed("access denied".into()));
        }
        if state.identities[&identity].len() >= MAX_KEYS_PER_IDENTITY {
            return Err(AuthorityError::IssuanceFailed("LimitExceeded".into()));
        }
        state.issued += 1;
        let issued = state.issued;
        let key_id = state
            .next_key_ids
            .pop_front()
            .unwrap_or_else(|| format!("AKIA-GEN-{issued}"));
        let secret_value = format!("{key_id}-secret");
        state
            .identities
            .entry(identity)
            .or_default()
            .push((key_id.clone(), secret_value.clone()));
        state.journal.push(format!("issue {key_id}"));
        Ok(KeyPair::pending(key_id, secret_value))
    }

    async fn list_keys(&self) -> Result<Vec<String>, AuthorityError> {
        self.world.hang_if(&format!("list {}", self.key_id)).await;
        let mut state = self.world.state.lock().await;
        state.journal.push(format!("list {}", self.key_id));
        if state.unverifiable_keys.contains(&self.key_id) {
            return Err(AuthorityError::ListingFailed("invalid client token".into()));
        }
        let identity = self
            .identity(&state)
            .ok_or_else(|| AuthorityError::ListingFailed("invalid client token".into()))?;
        let mut keys: Vec<String> = state.identities[&identity]
            .iter()
            .map(|(id, _)| id.clone())
            .collect();
        if state.hidden_probes > 0 && self.key_id.starts_with("AKIA-NEW") {
            state.hidden_probes -= 1;
            keys.retain(|id| *id != self.key_id);
        }
        Ok(keys)
    }

    async fn revoke_key(&self, key_id: &str) -> Result<(), AuthorityError> {
        self.world.hang_if(&format!("revoke {key_id}")).await;
        let mut state = self.world.state.lock().await;
        let identity = self
            .identity(&state)
            .ok_or_else(|| AuthorityError::RevocationFailed("invalid client token".into()))?;
        if state.unrevocable_keys.contains(key_id) {
            return Err(AuthorityError::RevocationFailed("access denied".into()));
        }
        if let Some(keys) = state.identities.get_mut(&identity) {
            keys.retain(|(id, _)| id != key_id);
        }
        state.journal.push(format!("revoke {key_id}"));
        Ok(())
    }
}

/// Returns immediately, recording every requested wait.
#[derive(Clone, Default)]
pub struct RecordingPause {
    pub waits: Arc<Mutex<Vec<Duration>>>,
}

#[async_trait]
impl Pause for RecordingPause {
    async fn pause(&self, duration: Duration) {
        self.waits.lock().await.push(duration);
    }
}

/// Cancels the run the first time a wait is requested, then never returns.
pub struct CancellingPause {
    pub cancel: CancellationToken,
}

#[async_trait]
impl Pause for CancellingPause {
    async fn pause(&self, _duration: Duration) {
        self.cancel.cancel();
        std::future::pending::<()>().await;
    }
}

pub fn config() -> RotationConfig {
    RotationConfig {
        settle: SettlePolicy {
            delay: Duration::from_secs(10),
            attempts: 3,
            backoff: Duration::from_secs(5),
        },
        call_timeout: Duration::from_secs(5),
        ..RotationConfig::default()
    }
}

pub fn context(world: &World, pause: Arc<dyn Pause>) -> RotationContext {
    RotationContext {
        store: Arc::new(world.clone()),
        sessions: Arc::new(world.clone()),
        pause,
        config: config(),
        cancel: CancellationToken::new(),
    }
}
