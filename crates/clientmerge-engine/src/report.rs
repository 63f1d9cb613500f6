//! Console and on-disk rendering of plans and run summaries.

use std::path::{Path, PathBuf};

use clientmerge_core::{ChangePlan, ReferencingTable, ScoredClient};
use tokio::fs;

use crate::executor::{format_ids, RunMode, RunStatus, RunSummary};
use crate::MergeError;

fn member_line(role: &str, member: &ScoredClient) -> String {
    format!(
        "  {role:<9} #{:<6} score {:<4} activities {:<4} projects {:<4} notes {}",
        member.id,
        member.score,
        member.counts.work_activities,
        member.counts.projects,
        member.counts.notes
    )
}

/// Deterministic rendering: the same plan always produces the same text.
pub fn render_plan(plan: &ChangePlan, fingerprint: &str) -> String {
    let mut lines = Vec::new();
    if plan.is_empty() {
        lines.push("No duplicate clients found.".to_string());
        return lines.join("\n");
    }

    lines.push(format!("Found {} duplicate client group(s)", plan.groups.len()));
    lines.push(format!("Plan fingerprint: {fingerprint}"));

    for group in &plan.groups {
        lines.push(String::new());
        lines.push(format!(
            "Group \"{}\" ({} clients)",
            group.key,
            group.duplicates.len() + 1
        ));
        lines.push(member_line("primary", &group.primary));
        for duplicate in &group.duplicates {
            lines.push(member_line("duplicate", duplicate));
        }
        lines.push(format!(
            "  rewrites: {}",
            ReferencingTable::ALL
                .iter()
                .map(|&t| format!("{t} {}", group.rewrites_for(t).len()))
                .collect::<Vec<_>>()
                .join(", ")
        ));
        lines.push(format!("  delete: {}", format_ids(&group.deletions)));
    }

    lines.push(String::new());
    lines.push("Planned changes".to_string());
    for table in ReferencingTable::ALL {
        lines.push(format!("  {table} rewrites: {}", plan.rewrites_for(table)));
    }
    lines.push(format!("  clients to delete: {}", plan.total_deletions()));
    lines.join("\n")
}

fn status_line(summary: &RunSummary) -> &'static str {
    match summary.status {
        RunStatus::DryRun => "dry run: no changes were written",
        RunStatus::NothingToMerge => "nothing to merge",
        RunStatus::Cancelled => "cancelled by operator: no changes were written",
        RunStatus::Applied if summary.skipped.is_empty() => "applied",
        RunStatus::Applied => "applied with skipped groups",
    }
}

pub fn render_summary(summary: &RunSummary) -> String {
    let mode = match summary.mode {
        RunMode::DryRun => "dry-run",
        RunMode::Apply => "apply",
    };
    let mut lines = vec![
        String::new(),
        format!("Run {} ({mode})", summary.run_id),
        format!("Status: {}", status_line(summary)),
    ];
    if summary.status != RunStatus::Applied {
        return lines.join("\n");
    }

    lines.push(format!("Merged: {} group(s)", summary.merged.len()));
    for group in &summary.merged {
        lines.push(format!(
            "  - \"{}\": kept #{}, deleted {}",
            group.key,
            group.primary,
            format_ids(&group.deleted)
        ));
    }
    lines.push(format!(
        "Skipped due to error: {} group(s)",
        summary.skipped.len()
    ));
    for group in &summary.skipped {
        lines.push(format!("  - \"{}\": {}", group.key, group.error));
    }

    lines.push("Rewrites applied:".to_string());
    for table in ReferencingTable::ALL {
        lines.push(format!("  {table}: {}", summary.rewrites_applied(table)));
    }
    lines.push(format!("Clients deleted: {}", summary.clients_deleted()));

    lines.push("Verification:".to_string());
    if let Some(report) = &summary.verification {
        lines.push(format!(
            "  clients: {} -> {}",
            report.before.clients, report.after.clients
        ));
        for table in ReferencingTable::ALL {
            lines.push(format!(
                "  {table}: {} -> {} (orphans: {})",
                report.before.referencing(table),
                report.after.referencing(table),
                report.orphans.get(&table).copied().unwrap_or(0)
            ));
        }
        if report.passed() {
            lines.push("  PASSED".to_string());
        } else {
            lines.push(format!(
                "  WARNINGS: {} mismatch(es)",
                report.mismatches.len()
            ));
            for mismatch in &report.mismatches {
                lines.push(format!("  - {mismatch}"));
            }
        }
    }
    lines.join("\n")
}

pub fn summary_markdown(summary: &RunSummary) -> String {
    format!(
        "# Client Merge Run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Plan fingerprint: `{}`\n- Groups planned: {}\n\n```text\n{}\n```\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.plan_fingerprint,
        summary.plan.groups.len(),
        render_summary(summary).trim_start()
    )
}

/// Write `merge_plan.json` and `merge_summary.md` under `<dir>/<run_id>/`.
pub async fn write_run_reports(dir: &Path, summary: &RunSummary) -> Result<PathBuf, MergeError> {
    let run_dir = dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir).await?;

    let plan_json = serde_json::to_vec_pretty(&serde_json::json!({
        "run_id": summary.run_id,
        "mode": summary.mode,
        "status": summary.status,
        "plan_fingerprint": summary.plan_fingerprint,
        "plan": summary.plan,
        "merged": summary.merged,
        "skipped": summary.skipped,
        "verification": summary.verification,
    }))?;
    fs::write(run_dir.join("merge_plan.json"), plan_json).await?;
    fs::write(run_dir.join("merge_summary.md"), summary_markdown(summary)).await?;

    Ok(run_dir)
}
