use std::collections::BTreeMap;
use std::fmt;

use clientmerge_core::{AppliedGroup, ClientId, ReferencingTable, RowCounts};
use clientmerge_storage::{ClientStore, StoreError};
use serde::Serialize;
use tracing::warn;

use crate::executor::SkippedGroup;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerificationMismatch {
    ClientCount {
        expected_removed: u64,
        actual_removed: i64,
    },
    ReferenceTotal {
        table: ReferencingTable,
        before: u64,
        after: u64,
    },
    Orphans {
        table: ReferencingTable,
        count: u64,
    },
    MissingPrimary {
        key: String,
        client_id: ClientId,
    },
    SkippedGroupAltered {
        key: String,
        missing: Vec<ClientId>,
    },
}

impl fmt::Display for VerificationMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientCount {
                expected_removed,
                actual_removed,
            } => write!(
                f,
                "expected {expected_removed} clients removed, store shows {actual_removed}"
            ),
            Self::ReferenceTotal {
                table,
                before,
                after,
            } => write!(f, "{table} row count changed from {before} to {after}"),
            Self::Orphans { table, count } => {
                write!(f, "{count} {table} rows still reference deleted clients")
            }
            Self::MissingPrimary { key, client_id } => {
                write!(f, "primary client {client_id} of `{key}` no longer exists")
            }
            Self::SkippedGroupAltered { key, missing } => write!(
                f,
                "skipped group `{key}` lost clients {missing:?} despite rollback"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub before: RowCounts,
    pub after: RowCounts,
    pub deleted_ids: Vec<ClientId>,
    pub orphans: BTreeMap<ReferencingTable, u64>,
    pub mismatches: Vec<VerificationMismatch>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Re-query the store after execution. Every check runs; mismatches are
/// collected, logged and returned, never dropped.
pub async fn verify(
    store: &ClientStore,
    before: RowCounts,
    merged: &[AppliedGroup],
    skipped: &[SkippedGroup],
) -> Result<VerificationReport, StoreError> {
    let after = store.row_counts().await?;
    let mut mismatches = Vec::new();

    let deleted_ids: Vec<ClientId> = merged
        .iter()
        .flat_map(|g| g.deleted.iter().copied())
        .collect();
    let expected_removed = deleted_ids.len() as u64;
    let actual_removed = before.clients as i64 - after.clients as i64;
    if actual_removed != expected_removed as i64 {
        mismatches.push(VerificationMismatch::ClientCount {
            expected_removed,
            actual_removed,
        });
    }

    for table in ReferencingTable::ALL {
        let (b, a) = (before.referencing(table), after.referencing(table));
        if b != a {
            mismatches.push(VerificationMismatch::ReferenceTotal {
                table,
                before: b,
                after: a,
            });
        }
    }

    let orphans = store.count_references_to(&deleted_ids).await?;
    for (&table, &count) in &orphans {
        if count > 0 {
            mismatches.push(VerificationMismatch::Orphans { table, count });
        }
    }

    let primaries: Vec<ClientId> = merged.iter().map(|g| g.primary).collect();
    let live_primaries = store.existing_client_ids(&primaries).await?;
    for group in merged {
        if !live_primaries.contains(&group.primary) {
            mismatches.push(VerificationMismatch::MissingPrimary {
                key: group.key.clone(),
                client_id: group.primary,
            });
        }
    }

    for group in skipped {
        let live = store.existing_client_ids(&group.duplicates).await?;
        let missing: Vec<ClientId> = group
            .duplicates
            .iter()
            .copied()
            .filter(|id| !live.contains(id))
            .collect();
        if !missing.is_empty() {
            mismatches.push(VerificationMismatch::SkippedGroupAltered {
                key: group.key.clone(),
                missing,
            });
        }
    }

    for mismatch in &mismatches {
        warn!(%mismatch, "verification mismatch");
    }

    Ok(VerificationReport {
        before,
        after,
        deleted_ids,
        orphans,
        mismatches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clientmerge_core::Client;
    use clientmerge_storage::test_support::{add_client_notes, insert_client, memory_store};

    fn applied(key: &str, primary: ClientId, deleted: Vec<ClientId>) -> AppliedGroup {
        AppliedGroup {
            key: key.into(),
            primary,
            rewritten: BTreeMap::new(),
            deleted,
        }
    }

    #[tokio::test]
    async fn clean_store_passes() {
        let store = memory_store().await;
        let a = insert_client(store.pool(), &Client::new(0, "A")).await;
        let before = store.row_counts().await.unwrap();

        let report = verify(&store, before, &[], &[]).await.unwrap();
        assert!(report.passed());
        assert_eq!(report.before, report.after);
        assert!(store.existing_client_ids(&[a]).await.unwrap().contains(&a));
    }

    #[tokio::test]
    async fn claimed_deletion_that_did_not_happen_is_reported() {
        let store = memory_store().await;
        let pool = store.pool();
        let a = insert_client(pool, &Client::new(0, "A")).await;
        let b = insert_client(pool, &Client::new(0, "a")).await;
        add_client_notes(pool, b, 2).await;
        let before = store.row_counts().await.unwrap();

        let report = verify(&store, before, &[applied("a", a, vec![b])], &[])
            .await
            .unwrap();
        assert!(!report.passed());
        assert!(report.mismatches.contains(&VerificationMismatch::ClientCount {
            expected_removed: 1,
            actual_removed: 0
        }));
        assert!(report.mismatches.contains(&VerificationMismatch::Orphans {
            table: ReferencingTable::ClientNotes,
            count: 2
        }));
    }

    #[tokio::test]
    async fn missing_primary_and_altered_skipped_group_are_reported() {
        let store = memory_store().await;
        let pool = store.pool();
        let a = insert_client(pool, &Client::new(0, "A")).await;
        let b = insert_client(pool, &Client::new(0, "a")).await;
        let before = store.row_counts().await.unwrap();
        sqlx::query("DELETE FROM clients")
            .execute(pool)
            .await
            .unwrap();

        let skipped = SkippedGroup {
            key: "b".into(),
            primary: a,
            duplicates: vec![b],
            error: "simulated".into(),
        };
        let report = verify(&store, before, &[applied("a", a, vec![])], &[skipped])
            .await
            .unwrap();
        let kinds: Vec<_> = report
            .mismatches
            .iter()
            .map(|m| match m {
                VerificationMismatch::ClientCount { .. } => "count",
                VerificationMismatch::MissingPrimary { .. } => "primary",
                VerificationMismatch::SkippedGroupAltered { .. } => "skipped",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["count", "primary", "skipped"]);
    }
}
