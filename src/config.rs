use once_cell::sync::Lazy;
use std::time::Duration;

use crate::rotation::settle::SettlePolicy;

/// Namespace holding the labeled secrets. Falls back to the client's default namespace.
pub static NAMESPACE: Lazy<Option<String>> = Lazy::new(|| read_optional_env("NAMESPACE"));

/// Label key marking secrets whose access key should be rotated. Defaults to `aws-rotate-key`.
pub static ROTATE_KEY_LABEL: Lazy<String> = Lazy::new(|| {
    read_optional_env("ROTATE_KEY_LABEL").unwrap_or_else(|| "aws-rotate-key".to_string())
});

/// Label value that enables rotation. Defaults to `true`.
pub static ROTATE_KEY_LABEL_VALUE: Lazy<String> = Lazy::new(|| {
    read_optional_env("ROTATE_KEY_LABEL_VALUE").unwrap_or_else(|| "true".to_string())
});

/// Secret field carrying the access key id.
pub static ACCESS_KEY_ID_FIELD: Lazy<String> = Lazy::new(|| {
    read_optional_env("ACCESS_KEY_ID_FIELD").unwrap_or_else(|| "access_key_id".to_string())
});

/// Secret field carrying the secret access key.
pub static SECRET_ACCESS_KEY_FIELD: Lazy<String> = Lazy::new(|| {
    read_optional_env("SECRET_ACCESS_KEY_FIELD")
        .unwrap_or_else(|| "secret_access_key".to_string())
});

/// Region used for IAM sessions. Defaults to `eu-west-1`.
pub static AWS_REGION: Lazy<String> =
    Lazy::new(|| read_optional_env("AWS_REGION").unwrap_or_else(|| "eu-west-1".to_string()));

/// key: rotation-config -> wait between issuance and the first verification probe
pub static ROTATION_SETTLE_DELAY_SECS: Lazy<u64> = Lazy::new(|| {
    read_u64_env("ROTATION_SETTLE_DELAY_SECS")
        .unwrap_or(SettlePolicy::DEFAULT_DELAY.as_secs())
});

/// key: rotation-config -> verification probes before rolling back
pub static ROTATION_VERIFY_ATTEMPTS: Lazy<u32> = Lazy::new(|| {
    read_u64_env("ROTATION_VERIFY_ATTEMPTS")
        .and_then(|value| u32::try_from(value).ok())
        .filter(|value| *value > 0)
        .unwrap_or(SettlePolicy::DEFAULT_ATTEMPTS)
});

/// key: rotation-config -> linear backoff step between verification probes
pub static ROTATION_VERIFY_BACKOFF_SECS: Lazy<u64> = Lazy::new(|| {
    read_u64_env("ROTATION_VERIFY_BACKOFF_SECS")
        .unwrap_or(SettlePolicy::DEFAULT_BACKOFF.as_secs())
});

/// key: rotation-config -> timeout applied to every store and authority call
pub static ROTATION_CALL_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
    read_u64_env("ROTATION_CALL_TIMEOUT_SECS")
        .filter(|value| *value > 0)
        .unwrap_or(30)
});

/// key: rotation-config -> identities rotated in parallel
pub static ROTATION_MAX_CONCURRENCY: Lazy<usize> = Lazy::new(|| {
    read_u64_env("ROTATION_MAX_CONCURRENCY")
        .and_then(|value| usize::try_from(value).ok())
        .filter(|value| *value > 0)
        .unwrap_or(1)
});

/// When truthy (the default), stale keys other than the recorded one are revoked before issuance.
pub static ROTATION_PRUNE_ORPHANED_KEYS: Lazy<bool> = Lazy::new(|| {
    read_optional_env("ROTATION_PRUNE_ORPHANED_KEYS")
        .map(|value| parse_flag(&value))
        .unwrap_or(true)
});

/// Label key marking registry pull secrets to refresh. Defaults to `aws-ecr-updater`.
pub static ECR_UPDATER_LABEL: Lazy<String> = Lazy::new(|| {
    read_optional_env("ECR_UPDATER_LABEL").unwrap_or_else(|| "aws-ecr-updater".to_string())
});

/// Email written into generated docker config entries.
pub static ECR_DOCKER_EMAIL: Lazy<String> =
    Lazy::new(|| read_optional_env("ECR_DOCKER_EMAIL").unwrap_or_default());

/// Names of the two secret fields holding a key pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialFields {
    pub key_id: String,
    pub secret_value: String,
}

impl Default for CredentialFields {
    fn default() -> Self {
        Self {
            key_id: "access_key_id".to_string(),
            secret_value: "secret_access_key".to_string(),
        }
    }
}

impl CredentialFields {
    pub fn from_env() -> Self {
        Self {
            key_id: ACCESS_KEY_ID_FIELD.clone(),
            secret_value: SECRET_ACCESS_KEY_FIELD.clone(),
        }
    }
}

/// key: rotation-config
/// Settings for one rotation run, built once and handed to the runner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RotationConfig {
    pub label: String,
    pub label_value: String,
    pub settle: SettlePolicy,
    pub call_timeout: Duration,
    pub max_concurrency: usize,
    pub prune_orphaned_keys: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            label: "aws-rotate-key".to_string(),
            label_value: "true".to_string(),
            settle: SettlePolicy::default(),
            call_timeout: Duration::from_secs(30),
            max_concurrency: 1,
            prune_orphaned_keys: true,
        }
    }
}

impl RotationConfig {
    pub fn from_env() -> Self {
        Self {
            label: ROTATE_KEY_LABEL.clone(),
            label_value: ROTATE_KEY_LABEL_VALUE.clone(),
            settle: SettlePolicy {
                delay: Duration::from_secs(*ROTATION_SETTLE_DELAY_SECS),
                attempts: *ROTATION_VERIFY_ATTEMPTS,
                backoff: Duration::from_secs(*ROTATION_VERIFY_BACKOFF_SECS),
            },
            call_timeout: Duration::from_secs(*ROTATION_CALL_TIMEOUT_SECS),
            max_concurrency: *ROTATION_MAX_CONCURRENCY,
            prune_orphaned_keys: *ROTATION_PRUNE_ORPHANED_KEYS,
        }
    }
}

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64_env(key: &str) -> Option<u64> {
    read_optional_env(key).and_then(|value| value.parse::<u64>().ok())
}

fn parse_flag(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accept_common_truthy_spellings() {
        assert!(parse_flag("TRUE"));
        assert!(parse_flag(" yes "));
        assert!(parse_flag("1"));
        assert!(!parse_flag("off"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn defaults_select_rotation_label_and_fields() {
        let config = RotationConfig::default();
        assert_eq!(config.label, "aws-rotate-key");
        assert_eq!(config.label_value, "true");
        assert_eq!(config.settle.delay, Duration::from_secs(10));
        assert!(config.prune_orphaned_keys);

        let fields = CredentialFields::default();
        assert_eq!(fields.key_id, "access_key_id");
        assert_eq!(fields.secret_value, "secret_access_key");
    }
}
