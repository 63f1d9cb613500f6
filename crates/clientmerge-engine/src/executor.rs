use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clientmerge_core::{AppliedGroup, ChangePlan, ClientId, ReferencingTable};
use clientmerge_storage::ClientStore;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::MergeConfig;
use crate::confirm::{Advance, ApplyPermit, ConfirmationFlow, ConfirmationState, Confirmer};
use crate::plan::{build_change_plan, plan_fingerprint};
use crate::report::{render_plan, render_summary, write_run_reports};
use crate::verify::{verify, VerificationReport};
use crate::MergeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DryRun,
    Apply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    DryRun,
    NothingToMerge,
    Cancelled,
    Applied,
}

/// A group whose transaction failed and was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedGroup {
    pub key: String,
    pub primary: ClientId,
    pub duplicates: Vec<ClientId>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GroupOutcome {
    Merged(AppliedGroup),
    Skipped(SkippedGroup),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: RunMode,
    pub status: RunStatus,
    pub plan_fingerprint: String,
    pub plan: ChangePlan,
    pub merged: Vec<AppliedGroup>,
    pub skipped: Vec<SkippedGroup>,
    pub verification: Option<VerificationReport>,
    pub reports_dir: Option<PathBuf>,
}

impl RunSummary {
    pub fn rewrites_applied(&self, table: ReferencingTable) -> usize {
        self.merged
            .iter()
            .map(|g| g.rewritten.get(&table).copied().unwrap_or(0))
            .sum()
    }

    pub fn clients_deleted(&self) -> usize {
        self.merged.iter().map(|g| g.deleted.len()).sum()
    }

    /// False only when verification ran and found mismatches.
    pub fn verification_passed(&self) -> bool {
        self.verification
            .as_ref()
            .map(VerificationReport::passed)
            .unwrap_or(true)
    }
}

pub struct MergeEngine {
    store: ClientStore,
    reports_dir: Option<PathBuf>,
}

impl MergeEngine {
    pub fn new(store: ClientStore) -> Self {
        Self {
            store,
            reports_dir: None,
        }
    }

    pub async fn connect(config: &MergeConfig) -> Result<Self, MergeError> {
        let store = ClientStore::connect(&config.database_url, config.store_config())
            .await
            .map_err(MergeError::Connection)?;
        Ok(Self::new(store).with_reports_dir(config.reports_dir.clone()))
    }

    pub fn with_reports_dir(mut self, reports_dir: Option<PathBuf>) -> Self {
        self.reports_dir = reports_dir;
        self
    }

    pub fn store(&self) -> &ClientStore {
        &self.store
    }

    /// Load a fresh snapshot and compute the plan. No writes.
    pub async fn prepare(&self) -> Result<ChangePlan, MergeError> {
        let snapshot = self.store.load_snapshot().await.map_err(MergeError::Load)?;
        let plan = build_change_plan(&snapshot);
        info!(
            clients = snapshot.clients.len(),
            groups = plan.groups.len(),
            deletions = plan.total_deletions(),
            "built change plan"
        );
        Ok(plan)
    }

    /// Apply each group in its own transaction. A failing group is rolled
    /// back and reported; later groups still run.
    pub async fn apply(
        &self,
        plan: &ChangePlan,
        _permit: ApplyPermit,
        console: &mut dyn Write,
    ) -> Result<Vec<GroupOutcome>, MergeError> {
        let total = plan.groups.len();
        let mut outcomes = Vec::with_capacity(total);

        for (index, group) in plan.groups.iter().enumerate() {
            let position = index + 1;
            match self.store.apply_group(group).await {
                Ok(applied) => {
                    info!(
                        key = %group.key,
                        primary = applied.primary,
                        deleted = applied.deleted.len(),
                        "merged group"
                    );
                    writeln!(
                        console,
                        "[{position}/{total}] merged \"{}\": {} references moved to #{}, deleted {}",
                        group.key,
                        group.total_rewrites(),
                        applied.primary,
                        format_ids(&applied.deleted)
                    )?;
                    outcomes.push(GroupOutcome::Merged(applied));
                }
                Err(err) => {
                    warn!(key = %group.key, error = %err, "group rolled back");
                    writeln!(
                        console,
                        "[{position}/{total}] SKIPPED \"{}\": {err} (rolled back)",
                        group.key
                    )?;
                    outcomes.push(GroupOutcome::Skipped(SkippedGroup {
                        key: group.key.clone(),
                        primary: group.primary.id,
                        duplicates: group.deletions.clone(),
                        error: err.to_string(),
                    }));
                }
            }
        }

        Ok(outcomes)
    }

    /// Full run: plan, report, and in apply mode confirm twice, apply and
    /// verify. Operator prompts all complete before any transaction opens.
    pub async fn run(
        &self,
        mode: RunMode,
        confirmer: &mut dyn Confirmer,
        console: &mut dyn Write,
    ) -> Result<RunSummary, MergeError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let plan = self.prepare().await?;
        let fingerprint = plan_fingerprint(&plan)?;
        writeln!(console, "{}", render_plan(&plan, &fingerprint))?;

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            mode,
            status: RunStatus::DryRun,
            plan_fingerprint: fingerprint,
            plan,
            merged: Vec::new(),
            skipped: Vec::new(),
            verification: None,
            reports_dir: None,
        };

        if summary.plan.is_empty() {
            summary.status = RunStatus::NothingToMerge;
        } else if mode == RunMode::Apply {
            match self.confirm(&summary, confirmer)? {
                None => {
                    summary.status = RunStatus::Cancelled;
                    writeln!(console, "Aborted before applying; no changes were made.")?;
                }
                Some((mut flow, permit)) => {
                    let before = self.store.row_counts().await.map_err(MergeError::Store)?;
                    let outcomes = self.apply(&summary.plan, permit, console).await?;
                    for outcome in outcomes {
                        match outcome {
                            GroupOutcome::Merged(applied) => summary.merged.push(applied),
                            GroupOutcome::Skipped(skipped) => summary.skipped.push(skipped),
                        }
                    }
                    let report = verify(&self.store, before, &summary.merged, &summary.skipped)
                        .await
                        .map_err(MergeError::Verification)?;
                    summary.verification = Some(report);
                    summary.status = RunStatus::Applied;
                    flow.finish()?;
                }
            }
        }

        summary.finished_at = Utc::now();
        if let Some(dir) = &self.reports_dir {
            summary.reports_dir = Some(write_run_reports(dir, &summary).await?);
        }
        writeln!(console, "{}", render_summary(&summary))?;
        Ok(summary)
    }

    fn confirm(
        &self,
        summary: &RunSummary,
        confirmer: &mut dyn Confirmer,
    ) -> Result<Option<(ConfirmationFlow, ApplyPermit)>, MergeError> {
        let plan = &summary.plan;
        let mut flow = ConfirmationFlow::new();
        flow.review_complete()?;

        loop {
            let prompt = match flow.state() {
                ConfirmationState::AwaitingFirstConfirm => format!(
                    "Merge {} duplicate group(s) and delete {} client record(s)? Type 'yes' to continue: ",
                    plan.groups.len(),
                    plan.total_deletions()
                ),
                _ => format!(
                    "This cannot be undone. Type 'yes' again to apply plan {}: ",
                    &summary.plan_fingerprint[..summary.plan_fingerprint.len().min(12)]
                ),
            };
            let affirmative = confirmer.confirm(&prompt)?;
            match flow.answer(affirmative)? {
                Advance::NextPrompt => continue,
                Advance::Proceed(permit) => return Ok(Some((flow, permit))),
                Advance::Cancelled => {
                    info!("operator declined; nothing applied");
                    return Ok(None);
                }
            }
        }
    }
}

pub(crate) fn format_ids(ids: &[ClientId]) -> String {
    ids.iter()
        .map(|id| format!("#{id}"))
        .collect::<Vec<_>>()
        .join(", ")
}
