use serde::Serialize;

use super::models::{RotationCandidate, RotationOutcome, RotationState};

/// Exit code when candidates could not even be listed.
pub const SETUP_FAILURE_EXIT_CODE: i32 = 3;

/// key: rotation-run-status
/// Worst outcome observed across a run.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    AllSucceeded,
    PartialSuccess,
    HardFailure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::AllSucceeded => "all_succeeded",
            RunStatus::PartialSuccess => "partial_success",
            RunStatus::HardFailure => "hard_failure",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::AllSucceeded => 0,
            RunStatus::HardFailure => 1,
            RunStatus::PartialSuccess => 2,
        }
    }
}

/// key: rotation-run-report
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<RotationOutcome>,
    /// Candidates never started because the run was cancelled.
    pub skipped: Vec<RotationCandidate>,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        if self.outcomes.iter().any(RotationOutcome::is_hard_failure) {
            RunStatus::HardFailure
        } else if !self.skipped.is_empty()
            || self
                .outcomes
                .iter()
                .any(|outcome| outcome.final_state == RotationState::PartialSuccess)
        {
            RunStatus::PartialSuccess
        } else {
            RunStatus::AllSucceeded
        }
    }

    pub fn count_done(&self) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.is_done()).count()
    }

    pub fn count_hard_failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.is_hard_failure())
            .count()
    }

    pub fn outcome(&self, name: &str) -> Option<&RotationOutcome> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.candidate.name == name)
    }

    /// One line per candidate, followed by a totals line.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.outcomes.iter().map(summary_line).collect();
        lines.extend(self.skipped.iter().map(|candidate| {
            format!("{}: skipped (run cancelled)", candidate.qualified_name())
        }));
        lines.push(format!(
            "{} secret(s): {} rotated, {} need attention, {} skipped; status {}",
            self.outcomes.len() + self.skipped.len(),
            self.count_done(),
            self.outcomes.len() - self.count_done(),
            self.skipped.len(),
            self.status().as_str(),
        ));
        lines
    }
}

fn summary_line(outcome: &RotationOutcome) -> String {
    let name = outcome.candidate.qualified_name();
    let state = outcome.final_state;
    match state {
        RotationState::Done => format!(
            "{name}: {state} (key {} replaced by {})",
            outcome.candidate.key_id,
            outcome.new_key_id.as_deref().unwrap_or("-"),
        ),
        RotationState::PartialSuccess => format!(
            "{name}: {state} [{}] manual remediation required: old key {} still active",
            outcome.error_kind().unwrap_or("unknown"),
            outcome.candidate.key_id,
        ),
        RotationState::FailedRollback => match outcome.error.as_ref() {
            Some(err) if err.unconfirmed_key_id().is_some() => format!(
                "{name}: {state} [{}] manual remediation required: secret may record key {} and old key {} is still active",
                err.kind(),
                err.unconfirmed_key_id().unwrap_or("-"),
                outcome.candidate.key_id,
            ),
            _ => format!(
                "{name}: {state} [{}] manual remediation required: orphaned key {}",
                outcome.error_kind().unwrap_or("unknown"),
                outcome
                    .error
                    .as_ref()
                    .and_then(|err| err.orphaned_key_id())
                    .unwrap_or("-"),
            ),
        },
        _ => format!(
            "{name}: {state} [{}] {}",
            outcome.error_kind().unwrap_or("unknown"),
            outcome
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
        ),
    }
}
