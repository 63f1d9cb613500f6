//! SQLite access to the client store: snapshot loading, per-group plan
//! application and the queries the verifier relies on.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use clientmerge_core::{
    AppliedGroup, Client, ClientId, ClientWithCounts, GroupPlan, MaintenanceSchedule,
    ReferenceCounts, ReferenceRow, ReferencingTable, RowCounts, StoreSnapshot,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

const CLIENT_COLUMNS: &str = r#"
    SELECT id,
           name,
           address,
           zone,
           special_notes,
           priority_level,
           schedule_flexibility,
           preferred_days,
           preferred_time,
           CAST(is_recurring_maintenance AS INTEGER) AS is_recurring_maintenance,
           CAST(maintenance_interval_weeks AS INTEGER) AS maintenance_interval_weeks,
           CAST(maintenance_hours_per_visit AS REAL) AS maintenance_hours_per_visit,
           CAST(maintenance_rate AS REAL) AS maintenance_rate,
           last_maintenance_date,
           next_maintenance_target,
           CAST(created_at AS TEXT) AS created_at
      FROM clients
     ORDER BY id
"#;

/// Ids bound per `IN (...)` list, well under SQLite's parameter limit.
const MAX_BOUND_IDS: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot reach client store at {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("malformed {table} row {row_id}: {reason}")]
    Load {
        table: &'static str,
        row_id: i64,
        reason: String,
    },
    #[error("store query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// Failure while applying one group's plan. The group's transaction is
/// always rolled back when one of these is returned.
#[derive(Debug, Error)]
pub enum GroupTransactionError {
    #[error("transaction exceeded {0:?} and was rolled back")]
    Timeout(Duration),
    #[error("{table} row {row_id} no longer references client {expected}")]
    StaleReference {
        table: ReferencingTable,
        row_id: i64,
        expected: ClientId,
    },
    #[error("{count} {table} rows still reference duplicate clients after rewrite")]
    UnplannedReferences { table: ReferencingTable, count: u64 },
    #[error("client {0} is already gone")]
    MissingClient(ClientId),
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub transaction_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 1,
            acquire_timeout: Duration::from_secs(10),
            transaction_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientStore {
    pool: SqlitePool,
    transaction_timeout: Duration,
}

impl ClientStore {
    /// Open an existing database. A missing file is a connection error, never
    /// a fresh empty store.
    pub async fn connect(database_url: &str, config: StoreConfig) -> Result<Self, StoreError> {
        let connection_error = |source| StoreError::Connection {
            url: database_url.to_string(),
            source,
        };
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(connection_error)?
            .create_if_missing(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(connection_error)?;
        Ok(Self::from_pool(pool, config.transaction_timeout))
    }

    pub fn from_pool(pool: SqlitePool, transaction_timeout: Duration) -> Self {
        Self {
            pool,
            transaction_timeout,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn transaction_timeout(&self) -> Duration {
        self.transaction_timeout
    }

    /// Read every client with its reference counts, plus every referencing
    /// row, inside a single read transaction.
    pub async fn load_snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut counts: HashMap<ClientId, ReferenceCounts> = HashMap::new();
        for table in ReferencingTable::ALL {
            let sql = format!(
                "SELECT client_id, COUNT(*) AS n FROM {table} WHERE client_id IS NOT NULL GROUP BY client_id"
            );
            for row in sqlx::query(&sql).fetch_all(&mut *tx).await? {
                let client_id: ClientId = row.try_get("client_id")?;
                let n: i64 = row.try_get("n")?;
                let n = u32::try_from(n).map_err(|_| StoreError::Load {
                    table: table.table_name(),
                    row_id: client_id,
                    reason: format!("reference count {n} out of range"),
                })?;
                let entry = counts.entry(client_id).or_default();
                match table {
                    ReferencingTable::WorkActivities => entry.work_activities = n,
                    ReferencingTable::Projects => entry.projects = n,
                    ReferencingTable::ClientNotes => entry.notes = n,
                }
            }
        }

        let rows = sqlx::query(CLIENT_COLUMNS).fetch_all(&mut *tx).await?;
        let mut clients = Vec::with_capacity(rows.len());
        for row in &rows {
            let client = client_from_row(row)?;
            let counts = counts.get(&client.id).copied().unwrap_or_default();
            clients.push(ClientWithCounts { client, counts });
        }

        let mut references = Vec::new();
        for table in ReferencingTable::ALL {
            let sql =
                format!("SELECT id, client_id FROM {table} WHERE client_id IS NOT NULL ORDER BY id");
            for row in sqlx::query(&sql).fetch_all(&mut *tx).await? {
                references.push(ReferenceRow {
                    table,
                    row_id: row.try_get("id")?,
                    client_id: row.try_get("client_id")?,
                });
            }
        }

        tx.commit().await?;
        debug!(
            clients = clients.len(),
            references = references.len(),
            "loaded store snapshot"
        );
        Ok(StoreSnapshot {
            clients,
            references,
        })
    }

    pub async fn row_counts(&self) -> Result<RowCounts, StoreError> {
        let clients: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM clients")
            .fetch_one(&self.pool)
            .await?;
        let mut counts = RowCounts {
            clients: clients.max(0) as u64,
            ..RowCounts::default()
        };
        for table in ReferencingTable::ALL {
            let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await?;
            counts.set_referencing(table, n.max(0) as u64);
        }
        Ok(counts)
    }

    /// Rows in each referencing table whose `client_id` is one of `ids`.
    pub async fn count_references_to(
        &self,
        ids: &[ClientId],
    ) -> Result<BTreeMap<ReferencingTable, u64>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let mut out = BTreeMap::new();
        for table in ReferencingTable::ALL {
            out.insert(table, count_references_in(&mut conn, table, ids).await?);
        }
        Ok(out)
    }

    /// The subset of `ids` that still exist in `clients`.
    pub async fn existing_client_ids(
        &self,
        ids: &[ClientId],
    ) -> Result<BTreeSet<ClientId>, StoreError> {
        let mut found = BTreeSet::new();
        for chunk in ids.chunks(MAX_BOUND_IDS) {
            let mut builder = QueryBuilder::<Sqlite>::new("SELECT id FROM clients WHERE id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            let ids: Vec<ClientId> = builder.build_query_scalar().fetch_all(&self.pool).await?;
            found.extend(ids);
        }
        Ok(found)
    }

    /// Apply one group's rewrites and deletions atomically, bounded by the
    /// store's transaction timeout.
    pub async fn apply_group(
        &self,
        group: &GroupPlan,
    ) -> Result<AppliedGroup, GroupTransactionError> {
        let span = info_span!("apply_group", key = %group.key, primary = group.primary.id);
        let work = self.apply_group_tx(group).instrument(span);
        match tokio::time::timeout(self.transaction_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(GroupTransactionError::Timeout(self.transaction_timeout)),
        }
    }

    async fn apply_group_tx(
        &self,
        group: &GroupPlan,
    ) -> Result<AppliedGroup, GroupTransactionError> {
        // Any early return drops `tx`, which rolls the whole group back.
        let mut tx = self.pool.begin().await?;
        let mut rewritten = BTreeMap::new();

        for table in ReferencingTable::ALL {
            let rewrites = group.rewrites_for(table);
            let sql =
                format!("UPDATE {table} SET client_id = ?1 WHERE id = ?2 AND client_id = ?3");
            for rewrite in rewrites {
                let result = sqlx::query(&sql)
                    .bind(rewrite.to_client)
                    .bind(rewrite.row_id)
                    .bind(rewrite.from_client)
                    .execute(&mut *tx)
                    .await?;
                if result.rows_affected() != 1 {
                    return Err(GroupTransactionError::StaleReference {
                        table,
                        row_id: rewrite.row_id,
                        expected: rewrite.from_client,
                    });
                }
            }
            debug!(%table, rows = rewrites.len(), "rewrote references");
            rewritten.insert(table, rewrites.len());
        }

        for table in ReferencingTable::ALL {
            let remaining = count_references_in(&mut *tx, table, &group.deletions).await?;
            if remaining > 0 {
                return Err(GroupTransactionError::UnplannedReferences {
                    table,
                    count: remaining,
                });
            }
        }

        for id in &group.deletions {
            let result = sqlx::query("DELETE FROM clients WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() != 1 {
                return Err(GroupTransactionError::MissingClient(*id));
            }
        }

        tx.commit().await?;
        Ok(AppliedGroup {
            key: group.key.clone(),
            primary: group.primary.id,
            rewritten,
            deleted: group.deletions.clone(),
        })
    }
}

async fn count_references_in(
    conn: &mut SqliteConnection,
    table: ReferencingTable,
    ids: &[ClientId],
) -> Result<u64, sqlx::Error> {
    let mut total = 0;
    for chunk in ids.chunks(MAX_BOUND_IDS) {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT COUNT(*) FROM {table} WHERE client_id IN ("
        ));
        let mut separated = builder.separated(", ");
        for id in chunk {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        let count: i64 = builder.build_query_scalar().fetch_one(&mut *conn).await?;
        total += count.max(0) as u64;
    }
    Ok(total)
}

fn client_from_row(row: &SqliteRow) -> Result<Client, StoreError> {
    let id: ClientId = row.try_get("id")?;
    let malformed = |reason: String| StoreError::Load {
        table: "clients",
        row_id: id,
        reason,
    };
    let text = |column: &str| -> Result<Option<String>, StoreError> {
        row.try_get::<Option<String>, _>(column)
            .map_err(|err| malformed(format!("column {column}: {err}")))
    };

    let created_at = match text("created_at")? {
        Some(raw) if !raw.trim().is_empty() => Some(parse_timestamp(&raw).map_err(malformed)?),
        _ => None,
    };
    let recurring: Option<i64> = row
        .try_get("is_recurring_maintenance")
        .map_err(|err| malformed(format!("column is_recurring_maintenance: {err}")))?;

    Ok(Client {
        id,
        name: text("name")?.unwrap_or_default(),
        address: text("address")?,
        zone: text("zone")?,
        special_notes: text("special_notes")?,
        priority_level: text("priority_level")?,
        schedule_flexibility: text("schedule_flexibility")?,
        preferred_days: text("preferred_days")?,
        preferred_time: text("preferred_time")?,
        maintenance: MaintenanceSchedule {
            recurring: recurring.unwrap_or(0) != 0,
            interval_weeks: row
                .try_get("maintenance_interval_weeks")
                .map_err(|err| malformed(format!("column maintenance_interval_weeks: {err}")))?,
            hours_per_visit: row
                .try_get("maintenance_hours_per_visit")
                .map_err(|err| malformed(format!("column maintenance_hours_per_visit: {err}")))?,
            rate: row
                .try_get("maintenance_rate")
                .map_err(|err| malformed(format!("column maintenance_rate: {err}")))?,
            last_date: text("last_maintenance_date")?,
            next_target: text("next_maintenance_target")?,
        },
        created_at,
    })
}

/// Parse the timestamp shapes the CRUD application has written over time.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();

    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        let value: i64 = raw
            .parse()
            .map_err(|_| format!("epoch timestamp `{raw}` out of range"))?;
        let parsed = if value > 100_000_000_000 {
            Utc.timestamp_millis_opt(value)
        } else {
            Utc.timestamp_opt(value, 0)
        };
        return parsed
            .single()
            .ok_or_else(|| format!("epoch timestamp `{raw}` out of range"));
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(format!("unrecognized created_at `{raw}`"))
}
