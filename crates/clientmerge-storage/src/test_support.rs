//! Schema and fixture helpers for tests that need a live client store.

use std::path::Path;
use std::time::Duration;

use clientmerge_core::{Client, ClientId};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::Connection;

use crate::{ClientStore, StoreConfig};

/// The subset of the CRUD application's schema this engine touches.
pub const SCHEMA: &str = r#"
CREATE TABLE clients (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    address TEXT,
    zone TEXT,
    special_notes TEXT,
    priority_level TEXT,
    schedule_flexibility TEXT,
    preferred_days TEXT,
    preferred_time TEXT,
    is_recurring_maintenance INTEGER NOT NULL DEFAULT 0,
    maintenance_interval_weeks INTEGER,
    maintenance_hours_per_visit REAL,
    maintenance_rate REAL,
    last_maintenance_date TEXT,
    next_maintenance_target TEXT,
    created_at TEXT
);

CREATE TABLE work_activities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id INTEGER REFERENCES clients(id),
    work_type TEXT,
    date TEXT
);

CREATE TABLE projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id INTEGER REFERENCES clients(id),
    name TEXT
);

CREATE TABLE client_notes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id INTEGER REFERENCES clients(id),
    body TEXT
);
"#;

/// In-memory store on a single long-lived connection, so every query sees
/// the same database.
pub async fn memory_store() -> ClientStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    sqlx::raw_sql(SCHEMA)
        .execute(&pool)
        .await
        .expect("create schema");
    ClientStore::from_pool(pool, Duration::from_secs(5))
}

/// Create a database file at `path` with the schema, then open it through
/// [`ClientStore::connect`] like the binary does. Other connections can lock
/// the same file, which an in-memory store cannot offer.
pub async fn file_store(path: &Path, transaction_timeout: Duration) -> ClientStore {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let mut conn = SqliteConnection::connect_with(&options)
        .await
        .expect("create sqlite file");
    sqlx::raw_sql(SCHEMA)
        .execute(&mut conn)
        .await
        .expect("create schema");
    conn.close().await.expect("close schema connection");

    let config = StoreConfig {
        transaction_timeout,
        ..StoreConfig::default()
    };
    ClientStore::connect(&format!("sqlite://{}", path.display()), config)
        .await
        .expect("open file store")
}

/// Insert `client`, ignoring its `id`, and return the id the store assigned.
pub async fn insert_client(pool: &SqlitePool, client: &Client) -> ClientId {
    let result = sqlx::query(
        r#"
        INSERT INTO clients (
            name, address, zone, special_notes, priority_level, schedule_flexibility,
            preferred_days, preferred_time, is_recurring_maintenance,
            maintenance_interval_weeks, maintenance_hours_per_visit, maintenance_rate,
            last_maintenance_date, next_maintenance_target, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#,
    )
    .bind(&client.name)
    .bind(&client.address)
    .bind(&client.zone)
    .bind(&client.special_notes)
    .bind(&client.priority_level)
    .bind(&client.schedule_flexibility)
    .bind(&client.preferred_days)
    .bind(&client.preferred_time)
    .bind(client.maintenance.recurring as i64)
    .bind(client.maintenance.interval_weeks)
    .bind(client.maintenance.hours_per_visit)
    .bind(client.maintenance.rate)
    .bind(&client.maintenance.last_date)
    .bind(&client.maintenance.next_target)
    .bind(client.created_at.map(|ts| ts.to_rfc3339()))
    .execute(pool)
    .await
    .expect("insert client");
    result.last_insert_rowid()
}

pub async fn add_work_activities(pool: &SqlitePool, client_id: ClientId, n: usize) {
    for i in 0..n {
        sqlx::query(
            "INSERT INTO work_activities (client_id, work_type, date) \
             VALUES (?1, 'maintenance', ?2)",
        )
        .bind(client_id)
        .bind(format!("2024-06-{:02}", (i % 28) + 1))
        .execute(pool)
        .await
        .expect("insert work activity");
    }
}

pub async fn add_projects(pool: &SqlitePool, client_id: ClientId, n: usize) {
    for i in 0..n {
        sqlx::query("INSERT INTO projects (client_id, name) VALUES (?1, ?2)")
            .bind(client_id)
            .bind(format!("project {i}"))
            .execute(pool)
            .await
            .expect("insert project");
    }
}

pub async fn add_client_notes(pool: &SqlitePool, client_id: ClientId, n: usize) {
    for i in 0..n {
        sqlx::query("INSERT INTO client_notes (client_id, body) VALUES (?1, ?2)")
            .bind(client_id)
            .bind(format!("note {i}"))
            .execute(pool)
            .await
            .expect("insert client note");
    }
}

/// Make every UPDATE of a note belonging to `client_id` abort.
pub async fn fail_note_updates_for(pool: &SqlitePool, client_id: ClientId) {
    let sql = format!(
        "CREATE TRIGGER fail_notes_{client_id} BEFORE UPDATE ON client_notes \
         WHEN OLD.client_id = {client_id} \
         BEGIN SELECT RAISE(ABORT, 'simulated client_notes failure'); END;"
    );
    sqlx::raw_sql(&sql)
        .execute(pool)
        .await
        .expect("create failing trigger");
}
