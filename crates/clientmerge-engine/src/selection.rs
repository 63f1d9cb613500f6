use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use clientmerge_core::{DuplicateGroup, ScoredClient};

use crate::scoring::score;

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub primary: ScoredClient,
    /// Remaining members, best-ranked first.
    pub duplicates: Vec<ScoredClient>,
}

fn older_first(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Total order over group members: higher score, then more work activities,
/// then older creation time (unknown counts as newest), then lower id.
pub fn rank(a: &ScoredClient, b: &ScoredClient) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| b.counts.work_activities.cmp(&a.counts.work_activities))
        .then_with(|| older_first(a.created_at, b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Pick the surviving client of a group. Returns `None` only for an empty
/// group.
pub fn select_primary(group: &DuplicateGroup) -> Option<Selection> {
    let mut ranked: Vec<ScoredClient> = group
        .members
        .iter()
        .map(|m| ScoredClient {
            id: m.client.id,
            name: m.client.name.clone(),
            score: score(m),
            counts: m.counts,
            created_at: m.client.created_at,
        })
        .collect();
    ranked.sort_by(rank);

    let mut ranked = ranked.into_iter();
    let primary = ranked.next()?;
    Some(Selection {
        primary,
        duplicates: ranked.collect(),
    })
}
