use futures_util::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::error::StoreError;

use super::models::{RotationCandidate, RotationOutcome};
use super::orchestrator::{KeyLifecycle, RotationContext};
use super::report::RunReport;

/// key: rotation-runner
/// Rotates every labeled secret, isolating failures per candidate.
pub struct RotationRunner {
    ctx: RotationContext,
}

enum Attempt {
    Finished(RotationOutcome),
    Skipped(RotationCandidate),
}

impl RotationRunner {
    pub fn new(ctx: RotationContext) -> Self {
        Self { ctx }
    }

    /// Lists candidates and rotates them. Only a failed listing is returned as an error.
    pub async fn run(&self) -> Result<RunReport, StoreError> {
        let config = &self.ctx.config;
        let limit = config.call_timeout;
        let candidates = match tokio::time::timeout(
            limit,
            self.ctx
                .store
                .list_by_label(&config.label, &config.label_value),
        )
        .await
        {
            Ok(listed) => listed?,
            Err(_) => {
                return Err(StoreError::Unavailable(format!(
                    "listing secrets timed out after {limit:?}"
                )))
            }
        };

        if candidates.is_empty() {
            info!(label = %config.label, "no secrets selected for rotation");
        }
        Ok(self.rotate_all(candidates).await)
    }

    pub async fn rotate_all(&self, candidates: Vec<RotationCandidate>) -> RunReport {
        let lifecycle = KeyLifecycle::new(&self.ctx);
        let concurrency = self.ctx.config.max_concurrency.max(1);

        let groups: Vec<Vec<(usize, Attempt)>> = stream::iter(group_by_identity(candidates))
            .map(|group| self.rotate_group(&lifecycle, group))
            .buffer_unordered(concurrency)
            .collect()
            .await;
        let mut attempts: Vec<(usize, Attempt)> = groups.into_iter().flatten().collect();
        attempts.sort_by_key(|(index, _)| *index);

        let mut report = RunReport::default();
        for (_, attempt) in attempts {
            match attempt {
                Attempt::Finished(outcome) => report.outcomes.push(outcome),
                Attempt::Skipped(candidate) => report.skipped.push(candidate),
            }
        }
        info!(
            status = report.status().as_str(),
            rotated = report.count_done(),
            failed = report.count_hard_failures(),
            skipped = report.skipped.len(),
            "rotation run finished",
        );
        report
    }

    /// Candidates of one identity run strictly one after another.
    async fn rotate_group(
        &self,
        lifecycle: &KeyLifecycle<'_>,
        group: Vec<(usize, RotationCandidate)>,
    ) -> Vec<(usize, Attempt)> {
        let mut attempts = Vec::with_capacity(group.len());
        for (index, candidate) in group {
            if self.ctx.cancel.is_cancelled() {
                warn!(
                    secret = %candidate.name,
                    namespace = %candidate.namespace,
                    "run cancelled; secret not rotated",
                );
                attempts.push((index, Attempt::Skipped(candidate)));
                continue;
            }
            let outcome = lifecycle.rotate(candidate).await;
            attempts.push((index, Attempt::Finished(outcome)));
        }
        attempts
    }
}

/// Groups candidates sharing a current key id, keeping first-seen order.
fn group_by_identity(
    candidates: Vec<RotationCandidate>,
) -> Vec<Vec<(usize, RotationCandidate)>> {
    let mut groups: Vec<Vec<(usize, RotationCandidate)>> = Vec::new();
    for (index, candidate) in candidates.into_iter().enumerate() {
        match groups
            .iter_mut()
            .find(|group| group[0].1.key_id == candidate.key_id)
        {
            Some(group) => {
                warn!(
                    secret = %candidate.name,
                    shared_with = %group[0].1.name,
                    key_id = %candidate.key_id,
                    "secret shares its access key with another secret; rotating sequentially",
                );
                group.push((index, candidate));
            }
            None => groups.push(vec![(index, candidate)]),
        }
    }
    groups
}
