//! Core domain model for client duplicate detection and merging.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ClientId = i64;

/// Recurring maintenance attributes stored on a client row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MaintenanceSchedule {
    pub recurring: bool,
    pub interval_weeks: Option<i64>,
    pub hours_per_visit: Option<f64>,
    pub rate: Option<f64>,
    pub last_date: Option<String>,
    pub next_target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    pub address: Option<String>,
    pub zone: Option<String>,
    pub special_notes: Option<String>,
    pub priority_level: Option<String>,
    pub schedule_flexibility: Option<String>,
    pub preferred_days: Option<String>,
    pub preferred_time: Option<String>,
    pub maintenance: MaintenanceSchedule,
    pub created_at: Option<DateTime<Utc>>,
}

impl Client {
    /// A client with only identity and name set.
    pub fn new(id: ClientId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            address: None,
            zone: None,
            special_notes: None,
            priority_level: None,
            schedule_flexibility: None,
            preferred_days: None,
            preferred_time: None,
            maintenance: MaintenanceSchedule::default(),
            created_at: None,
        }
    }
}

/// Number of rows in each referencing table that point at one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReferenceCounts {
    pub work_activities: u32,
    pub projects: u32,
    pub notes: u32,
}

impl ReferenceCounts {
    pub fn get(&self, table: ReferencingTable) -> u32 {
        match table {
            ReferencingTable::WorkActivities => self.work_activities,
            ReferencingTable::Projects => self.projects,
            ReferencingTable::ClientNotes => self.notes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientWithCounts {
    pub client: Client,
    pub counts: ReferenceCounts,
}

/// Tables carrying a `client_id` foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencingTable {
    WorkActivities,
    Projects,
    ClientNotes,
}

impl ReferencingTable {
    /// Rewrite order used when applying a plan.
    pub const ALL: [ReferencingTable; 3] = [
        ReferencingTable::WorkActivities,
        ReferencingTable::Projects,
        ReferencingTable::ClientNotes,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            ReferencingTable::WorkActivities => "work_activities",
            ReferencingTable::Projects => "projects",
            ReferencingTable::ClientNotes => "client_notes",
        }
    }
}

impl fmt::Display for ReferencingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// One row of a referencing table, as seen at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRow {
    pub table: ReferencingTable,
    pub row_id: i64,
    pub client_id: ClientId,
}

/// Everything the planner needs, read in one pass from the store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub clients: Vec<ClientWithCounts>,
    pub references: Vec<ReferenceRow>,
}

/// Total row counts used for before/after verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RowCounts {
    pub clients: u64,
    pub work_activities: u64,
    pub projects: u64,
    pub client_notes: u64,
}

impl RowCounts {
    pub fn referencing(&self, table: ReferencingTable) -> u64 {
        match table {
            ReferencingTable::WorkActivities => self.work_activities,
            ReferencingTable::Projects => self.projects,
            ReferencingTable::ClientNotes => self.client_notes,
        }
    }

    pub fn set_referencing(&mut self, table: ReferencingTable, value: u64) {
        match table {
            ReferencingTable::WorkActivities => self.work_activities = value,
            ReferencingTable::Projects => self.projects = value,
            ReferencingTable::ClientNotes => self.client_notes = value,
        }
    }
}

/// Clients sharing one normalized name. Only built for two or more members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub key: String,
    pub members: Vec<ClientWithCounts>,
}

/// Ranking inputs for one group member, as shown in reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredClient {
    pub id: ClientId,
    pub name: String,
    pub score: u32,
    pub counts: ReferenceCounts,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRewrite {
    pub row_id: i64,
    pub from_client: ClientId,
    pub to_client: ClientId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRewrites {
    pub table: ReferencingTable,
    pub rewrites: Vec<ForeignKeyRewrite>,
}

/// Rewrites and deletions for a single duplicate group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupPlan {
    pub key: String,
    pub primary: ScoredClient,
    pub duplicates: Vec<ScoredClient>,
    /// One entry per referencing table, in [`ReferencingTable::ALL`] order.
    pub rewrites: Vec<TableRewrites>,
    pub deletions: Vec<ClientId>,
}

impl GroupPlan {
    pub fn rewrites_for(&self, table: ReferencingTable) -> &[ForeignKeyRewrite] {
        self.rewrites
            .iter()
            .find(|t| t.table == table)
            .map(|t| t.rewrites.as_slice())
            .unwrap_or_default()
    }

    pub fn total_rewrites(&self) -> usize {
        self.rewrites.iter().map(|t| t.rewrites.len()).sum()
    }
}

/// Computed, not-yet-applied set of rewrites and deletions for one run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChangePlan {
    pub groups: Vec<GroupPlan>,
}

impl ChangePlan {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn rewrites_for(&self, table: ReferencingTable) -> usize {
        self.groups.iter().map(|g| g.rewrites_for(table).len()).sum()
    }

    pub fn total_deletions(&self) -> usize {
        self.groups.iter().map(|g| g.deletions.len()).sum()
    }

    pub fn deleted_ids(&self) -> Vec<ClientId> {
        self.groups
            .iter()
            .flat_map(|g| g.deletions.iter().copied())
            .collect()
    }
}

/// A group whose transaction committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedGroup {
    pub key: String,
    pub primary: ClientId,
    pub rewritten: BTreeMap<ReferencingTable, usize>,
    pub deleted: Vec<ClientId>,
}
