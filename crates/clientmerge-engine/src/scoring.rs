//! Information-completeness score. Only used to rank members of a duplicate
//! group; it carries no meaning outside that comparison.

use clientmerge_core::{Client, ClientWithCounts};

pub const ADDRESS_POINTS: u32 = 10;
pub const ZONE_POINTS: u32 = 5;
pub const SPECIAL_NOTES_POINTS: u32 = 15;
pub const PRIORITY_POINTS: u32 = 5;
pub const SCHEDULE_FLEXIBILITY_POINTS: u32 = 5;
pub const PREFERRED_DAYS_POINTS: u32 = 5;
pub const PREFERRED_TIME_POINTS: u32 = 5;
pub const RECURRING_POINTS: u32 = 10;
pub const INTERVAL_POINTS: u32 = 10;
pub const HOURS_PER_VISIT_POINTS: u32 = 10;
pub const RATE_POINTS: u32 = 10;
pub const LAST_MAINTENANCE_POINTS: u32 = 5;
pub const NEXT_MAINTENANCE_POINTS: u32 = 5;
pub const PER_WORK_ACTIVITY: u32 = 2;
pub const PER_PROJECT: u32 = 5;
pub const PER_NOTE: u32 = 3;

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn has_amount(value: Option<f64>) -> bool {
    value.is_some_and(|v| v.is_finite() && v != 0.0)
}

fn field_points(client: &Client) -> u32 {
    let m = &client.maintenance;
    [
        (has_text(&client.address), ADDRESS_POINTS),
        (has_text(&client.zone), ZONE_POINTS),
        (has_text(&client.special_notes), SPECIAL_NOTES_POINTS),
        (has_text(&client.priority_level), PRIORITY_POINTS),
        (has_text(&client.schedule_flexibility), SCHEDULE_FLEXIBILITY_POINTS),
        (has_text(&client.preferred_days), PREFERRED_DAYS_POINTS),
        (has_text(&client.preferred_time), PREFERRED_TIME_POINTS),
        (m.recurring, RECURRING_POINTS),
        (m.interval_weeks.is_some_and(|w| w != 0), INTERVAL_POINTS),
        (has_amount(m.hours_per_visit), HOURS_PER_VISIT_POINTS),
        (has_amount(m.rate), RATE_POINTS),
        (has_text(&m.last_date), LAST_MAINTENANCE_POINTS),
        (has_text(&m.next_target), NEXT_MAINTENANCE_POINTS),
    ]
    .into_iter()
    .filter(|(present, _)| *present)
    .map(|(_, points)| points)
    .sum()
}

/// Pure and additive: each present field and each referencing row adds a
/// fixed number of points.
pub fn score(entry: &ClientWithCounts) -> u32 {
    let counts = entry.counts;
    field_points(&entry.client)
        .saturating_add(counts.work_activities.saturating_mul(PER_WORK_ACTIVITY))
        .saturating_add(counts.projects.saturating_mul(PER_PROJECT))
        .saturating_add(counts.notes.saturating_mul(PER_NOTE))
}
