use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::RotationError;

/// Suspension point used while a fresh key propagates.
#[async_trait]
pub trait Pause: Send + Sync {
    async fn pause(&self, duration: Duration);
}

pub struct TokioPause;

#[async_trait]
impl Pause for TokioPause {
    async fn pause(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// key: rotation-settle-policy
/// Wait before the first verification probe, then linear backoff between retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SettlePolicy {
    pub delay: Duration,
    pub attempts: u32,
    pub backoff: Duration,
}

impl SettlePolicy {
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(10);
    pub const DEFAULT_ATTEMPTS: u32 = 3;
    pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

    /// Wait that precedes probe number `attempt` (1-based).
    pub fn wait_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            self.delay
        } else {
            self.backoff.saturating_mul(attempt - 1)
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            delay: Self::DEFAULT_DELAY,
            attempts: Self::DEFAULT_ATTEMPTS,
            backoff: Self::DEFAULT_BACKOFF,
        }
    }
}

/// Waits `duration` unless the run is cancelled first.
pub async fn settle(
    pause: &dyn Pause,
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), RotationError> {
    if cancel.is_cancelled() {
        return Err(RotationError::Cancelled);
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(RotationError::Cancelled),
        _ = pause.pause(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_check_waits_for_settle_delay_then_backs_off() {
        let policy = SettlePolicy {
            delay: Duration::from_secs(10),
            attempts: 3,
            backoff: Duration::from_secs(2),
        };
        assert_eq!(policy.wait_before(1), Duration::from_secs(10));
        assert_eq!(policy.wait_before(2), Duration::from_secs(2));
        assert_eq!(policy.wait_before(3), Duration::from_secs(4));
    }

    #[test]
    fn huge_backoff_saturates_instead_of_overflowing() {
        let policy = SettlePolicy {
            delay: Duration::from_secs(10),
            attempts: 3,
            backoff: Duration::from_secs(u64::MAX),
        };
        assert_eq!(policy.wait_before(3), Duration::MAX);
    }

    #[test]
    fn at_least_one_check_is_made() {
        let policy = SettlePolicy {
            attempts: 0,
            ..SettlePolicy::default()
        };
        assert_eq!(policy.attempts(), 1);
    }

    #[tokio::test]
    async fn cancelled_run_interrupts_the_wait() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = settle(&TokioPause, Duration::from_secs(3600), &cancel)
            .await
            .expect_err("cancelled token should interrupt settle");
        assert!(matches!(err, RotationError::Cancelled));
    }

    #[tokio::test]
    async fn short_wait_completes() {
        let cancel = CancellationToken::new();
        settle(&TokioPause, Duration::from_millis(1), &cancel)
            .await
            .expect("settle should complete");
    }
}
