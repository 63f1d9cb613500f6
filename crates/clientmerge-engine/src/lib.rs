//! Duplicate client detection and merge pipeline.
//!
//! Data flows loader → grouper → scorer → selector → planner, then either
//! into a report (dry run) or through the executor and verifier.

use clientmerge_storage::StoreError;
use thiserror::Error;

pub mod config;
pub mod confirm;
pub mod executor;
pub mod grouping;
pub mod plan;
pub mod report;
pub mod scoring;
pub mod selection;
pub mod verify;

pub use config::MergeConfig;
pub use confirm::{
    is_affirmative, Advance, ApplyPermit, ConfirmationFlow, ConfirmationState, Confirmer,
    FlowError, LineConfirmer,
};
pub use executor::{GroupOutcome, MergeEngine, RunMode, RunStatus, RunSummary, SkippedGroup};
pub use grouping::{group_duplicates, normalize_name};
pub use plan::{build_change_plan, build_group_plan, plan_fingerprint, ReferenceIndex};
pub use report::{render_plan, render_summary, write_run_reports};
pub use scoring::score;
pub use selection::{rank, select_primary, Selection};
pub use verify::{verify, VerificationMismatch, VerificationReport};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("connection failed: {0}")]
    Connection(#[source] StoreError),
    #[error("loading clients failed: {0}")]
    Load(#[source] StoreError),
    #[error("store query failed: {0}")]
    Store(#[source] StoreError),
    #[error("verification queries failed: {0}")]
    Verification(#[source] StoreError),
    #[error(transparent)]
    Flow(#[from] FlowError),
    #[error("serializing change plan: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("console or report i/o failed: {0}")]
    Io(#[from] std::io::Error),
}
