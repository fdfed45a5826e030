//! Access key rotation: per-secret lifecycle machine and the run that drives it.

pub mod models;
pub mod orchestrator;
pub mod report;
pub mod runner;
pub mod settle;

pub use models::{KeyPair, KeyStatus, RotationCandidate, RotationOutcome, RotationState};
pub use orchestrator::{KeyLifecycle, RotationContext};
pub use report::{RunReport, RunStatus, SETUP_FAILURE_EXIT_CODE};
pub use runner::RotationRunner;
pub use settle::{Pause, SettlePolicy, TokioPause};
