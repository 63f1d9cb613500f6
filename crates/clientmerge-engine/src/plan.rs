use std::collections::HashMap;

use clientmerge_core::{
    ChangePlan, ClientId, ForeignKeyRewrite, GroupPlan, ReferenceRow, ReferencingTable,
    StoreSnapshot, TableRewrites,
};
use sha2::{Digest, Sha256};

use crate::grouping::group_duplicates;
use crate::selection::{select_primary, Selection};

/// Referencing rows of a snapshot, indexed by the client they point at.
#[derive(Debug, Default)]
pub struct ReferenceIndex<'a> {
    by_client: HashMap<ClientId, Vec<&'a ReferenceRow>>,
}

impl<'a> ReferenceIndex<'a> {
    pub fn new(references: &'a [ReferenceRow]) -> Self {
        let mut by_client: HashMap<ClientId, Vec<&'a ReferenceRow>> = HashMap::new();
        for row in references {
            by_client.entry(row.client_id).or_default().push(row);
        }
        Self { by_client }
    }

    pub fn rows_for(&self, client_id: ClientId) -> &[&'a ReferenceRow] {
        self.by_client
            .get(&client_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Rewrites every reference to a duplicate onto the primary and marks the
/// duplicates for deletion. Pure: reads only the already-loaded snapshot.
pub fn build_group_plan(key: &str, selection: &Selection, index: &ReferenceIndex<'_>) -> GroupPlan {
    let primary_id = selection.primary.id;
    let rewrites = ReferencingTable::ALL
        .iter()
        .map(|&table| {
            let mut rewrites: Vec<ForeignKeyRewrite> = selection
                .duplicates
                .iter()
                .flat_map(|dup| index.rows_for(dup.id))
                .filter(|row| row.table == table)
                .map(|row| ForeignKeyRewrite {
                    row_id: row.row_id,
                    from_client: row.client_id,
                    to_client: primary_id,
                })
                .collect();
            rewrites.sort_by_key(|r| r.row_id);
            TableRewrites { table, rewrites }
        })
        .collect();

    let mut deletions: Vec<ClientId> = selection
        .duplicates
        .iter()
        .map(|d| d.id)
        .filter(|&id| id != primary_id)
        .collect();
    deletions.sort_unstable();

    GroupPlan {
        key: key.to_string(),
        primary: selection.primary.clone(),
        duplicates: selection.duplicates.clone(),
        rewrites,
        deletions,
    }
}

/// The single plan-construction path shared by dry run and apply.
pub fn build_change_plan(snapshot: &StoreSnapshot) -> ChangePlan {
    let index = ReferenceIndex::new(&snapshot.references);
    let groups = group_duplicates(&snapshot.clients)
        .iter()
        .filter_map(|group| {
            select_primary(group).map(|selection| build_group_plan(&group.key, &selection, &index))
        })
        .collect();
    ChangePlan { groups }
}

/// Hex SHA-256 of the plan's JSON encoding.
pub fn plan_fingerprint(plan: &ChangePlan) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(plan)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
