use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use clientmerge_core::{Client, ClientId, ReferencingTable};
use clientmerge_engine::{Confirmer, MergeConfig, MergeEngine, MergeError, RunMode, RunStatus};
use clientmerge_storage::test_support::{
    add_client_notes, add_projects, add_work_activities, fail_note_updates_for, file_store,
    insert_client, memory_store,
};
use clientmerge_storage::ClientStore;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::Connection;

struct Scripted {
    answers: VecDeque<bool>,
    prompts: Vec<String>,
}

impl Scripted {
    fn new(answers: &[bool]) -> Self {
        Self {
            answers: answers.iter().copied().collect(),
            prompts: Vec::new(),
        }
    }
}

impl Confirmer for Scripted {
    fn confirm(&mut self, prompt: &str) -> io::Result<bool> {
        self.prompts.push(prompt.to_string());
        Ok(self.answers.pop_front().unwrap_or(false))
    }
}

fn created(year: i32) -> Option<chrono::DateTime<Utc>> {
    Utc.with_ymd_and_hms(year, 4, 1, 12, 0, 0).single()
}

struct Fixture {
    store: ClientStore,
    a: ClientId,
    b: ClientId,
}

/// A: 40 field points + 15 activities + 3 projects = 85.
/// B: 15 field points + 2 activities + 2 notes = 25.
async fn john_smith_fixture() -> Fixture {
    let store = memory_store().await;
    let pool = store.pool();

    let mut a = Client::new(0, "John Smith");
    a.address = Some("12 Elm St".into());
    a.zone = Some("north".into());
    a.special_notes = Some("side gate".into());
    a.maintenance.recurring = true;
    a.created_at = created(2020);
    let a = insert_client(pool, &a).await;
    add_work_activities(pool, a, 15).await;
    add_projects(pool, a, 3).await;

    let mut b = Client::new(0, " john smith ");
    b.address = Some("12 Elm Street".into());
    b.zone = Some("north".into());
    b.created_at = created(2021);
    let b = insert_client(pool, &b).await;
    add_work_activities(pool, b, 2).await;
    add_client_notes(pool, b, 2).await;

    let other = insert_client(pool, &Client::new(0, "Mary Jones")).await;
    add_work_activities(pool, other, 1).await;

    Fixture { store, a, b }
}

async fn references_to(store: &ClientStore, id: ClientId) -> u64 {
    store
        .count_references_to(&[id])
        .await
        .expect("count references")
        .values()
        .sum()
}

#[tokio::test]
async fn richer_older_client_absorbs_its_duplicate() {
    let Fixture { store, a, b } = john_smith_fixture().await;
    let before = store.row_counts().await.unwrap();
    let engine = MergeEngine::new(store.clone());

    let mut confirmer = Scripted::new(&[true, true]);
    let mut console = Vec::new();
    let summary = engine
        .run(RunMode::Apply, &mut confirmer, &mut console)
        .await
        .expect("run");

    let group = &summary.plan.groups[0];
    assert_eq!(group.key, "john smith");
    assert_eq!((group.primary.id, group.primary.score), (a, 85));
    assert_eq!(group.duplicates.len(), 1);
    assert_eq!((group.duplicates[0].id, group.duplicates[0].score), (b, 25));

    assert_eq!(summary.status, RunStatus::Applied);
    assert_eq!(summary.merged.len(), 1);
    assert!(summary.skipped.is_empty());
    assert_eq!(summary.rewrites_applied(ReferencingTable::WorkActivities), 2);
    assert_eq!(summary.rewrites_applied(ReferencingTable::ClientNotes), 2);
    assert_eq!(summary.clients_deleted(), 1);
    assert!(summary.verification_passed());
    assert_eq!(confirmer.prompts.len(), 2);

    let after = store.row_counts().await.unwrap();
    assert_eq!(after.clients, before.clients - 1);
    assert_eq!(after.work_activities, before.work_activities);
    assert_eq!(references_to(&store, b).await, 0);
    assert_eq!(references_to(&store, a).await, 15 + 3 + 2 + 2);
    assert!(store.existing_client_ids(&[b]).await.unwrap().is_empty());

    let text = String::from_utf8(console).unwrap();
    assert!(text.contains("[1/1] merged \"john smith\""));
    assert!(text.contains("PASSED"));
}

#[tokio::test]
async fn oldest_client_wins_a_score_and_activity_tie() {
    let store = memory_store().await;
    let pool = store.pool();
    let mut ids = Vec::new();
    for year in [2022, 2018, 2020] {
        let mut client = Client::new(0, "Acme Landscaping");
        client.created_at = created(year);
        let id = insert_client(pool, &client).await;
        add_work_activities(pool, id, 4).await;
        ids.push(id);
    }

    let plan = MergeEngine::new(store).prepare().await.unwrap();
    let group = &plan.groups[0];
    assert_eq!(group.primary.id, ids[1]);
    let mut deleted = vec![ids[0], ids[2]];
    deleted.sort_unstable();
    assert_eq!(group.deletions, deleted);
}

#[tokio::test]
async fn notes_failure_rolls_back_only_that_group() {
    let Fixture { store, a, b } = john_smith_fixture().await;
    let pool = store.pool();
    let c = insert_client(pool, &Client::new(0, "Acme")).await;
    let d = insert_client(pool, &Client::new(0, "ACME")).await;
    add_projects(pool, c, 1).await;
    fail_note_updates_for(pool, b).await;

    let engine = MergeEngine::new(store.clone());
    let summary = engine
        .run(RunMode::Apply, &mut Scripted::new(&[true, true]), &mut io::sink())
        .await
        .expect("run completes despite a failing group");

    assert_eq!(summary.status, RunStatus::Applied);
    assert_eq!(summary.merged.len(), 1);
    assert_eq!(summary.merged[0].key, "acme");
    assert_eq!(summary.merged[0].primary, c);
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].key, "john smith");
    assert!(summary.skipped[0].error.contains("simulated client_notes failure"));
    assert!(summary.verification_passed());

    // Work activities and projects were rewritten before the notes failed;
    // none of that may survive.
    let refs = store.count_references_to(&[b]).await.unwrap();
    assert_eq!(refs[&ReferencingTable::WorkActivities], 2);
    assert_eq!(refs[&ReferencingTable::ClientNotes], 2);
    assert_eq!(references_to(&store, a).await, 15 + 3);
    assert_eq!(store.existing_client_ids(&[a, b]).await.unwrap().len(), 2);

    assert_eq!(references_to(&store, d).await, 0);
    assert_eq!(references_to(&store, c).await, 1);
}

#[tokio::test]
async fn dry_run_writes_nothing_and_matches_the_applied_plan() {
    let Fixture { store, .. } = john_smith_fixture().await;
    let engine = MergeEngine::new(store.clone());
    let before = store.row_counts().await.unwrap();

    let mut confirmer = Scripted::new(&[]);
    let dry = engine
        .run(RunMode::DryRun, &mut confirmer, &mut io::sink())
        .await
        .unwrap();
    assert_eq!(dry.status, RunStatus::DryRun);
    assert!(confirmer.prompts.is_empty());
    assert!(dry.merged.is_empty());
    assert_eq!(store.row_counts().await.unwrap(), before);

    let applied = engine
        .run(RunMode::Apply, &mut Scripted::new(&[true, true]), &mut io::sink())
        .await
        .unwrap();
    assert_eq!(applied.plan, dry.plan);
    assert_eq!(applied.plan_fingerprint, dry.plan_fingerprint);
    assert_eq!(
        serde_json::to_vec(&applied.plan).unwrap(),
        serde_json::to_vec(&dry.plan).unwrap()
    );
}

#[tokio::test]
async fn declining_either_confirmation_changes_nothing() {
    for answers in [&[false][..], &[true, false][..]] {
        let Fixture { store, .. } = john_smith_fixture().await;
        let before = store.row_counts().await.unwrap();
        let engine = MergeEngine::new(store.clone());
        let mut confirmer = Scripted::new(answers);
        let mut console = Vec::new();

        let summary = engine
            .run(RunMode::Apply, &mut confirmer, &mut console)
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Cancelled);
        assert_eq!(confirmer.prompts.len(), answers.len());
        assert!(summary.verification.is_none());
        assert_eq!(store.row_counts().await.unwrap(), before);
        assert!(String::from_utf8(console)
            .unwrap()
            .contains("no changes were made"));
    }
}

#[tokio::test]
async fn repeated_planning_is_deterministic() {
    let Fixture { store, .. } = john_smith_fixture().await;
    let engine = MergeEngine::new(store);
    let first = engine.prepare().await.unwrap();
    for _ in 0..3 {
        assert_eq!(engine.prepare().await.unwrap(), first);
    }
}

#[tokio::test]
async fn nothing_to_merge_never_prompts() {
    let store = memory_store().await;
    insert_client(store.pool(), &Client::new(0, "Solo")).await;
    let mut confirmer = Scripted::new(&[true, true]);
    let summary = MergeEngine::new(store)
        .run(RunMode::Apply, &mut confirmer, &mut io::sink())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::NothingToMerge);
    assert!(confirmer.prompts.is_empty());
}

#[tokio::test]
async fn unreachable_store_is_fatal_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let config = MergeConfig {
        database_url: format!("sqlite://{}", dir.path().join("missing.db").display()),
        transaction_timeout_secs: 5,
        reports_dir: None,
    };
    let err = MergeEngine::connect(&config).await.err().expect("must fail");
    assert!(matches!(err, MergeError::Connection(_)));
}

#[tokio::test]
async fn run_reports_land_in_the_configured_directory() {
    let Fixture { store, .. } = john_smith_fixture().await;
    let dir = tempfile::tempdir().unwrap();
    let engine = MergeEngine::new(store).with_reports_dir(Some(dir.path().to_path_buf()));

    let summary = engine
        .run(RunMode::DryRun, &mut Scripted::new(&[]), &mut io::sink())
        .await
        .unwrap();

    let run_dir = summary.reports_dir.expect("reports written");
    assert!(run_dir.starts_with(dir.path()));
    assert!(run_dir.join("merge_plan.json").exists());
    assert!(run_dir.join("merge_summary.md").exists());
}

#[tokio::test]
async fn stalled_group_times_out_and_later_groups_still_merge() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clients.db");
    let store = file_store(&path, Duration::from_millis(1000)).await;
    let pool = store.pool();

    let acme_primary = insert_client(pool, &Client::new(0, "Acme")).await;
    add_projects(pool, acme_primary, 1).await;
    let acme_dup = insert_client(pool, &Client::new(0, "ACME")).await;
    add_work_activities(pool, acme_dup, 2).await;
    let zed_primary = insert_client(pool, &Client::new(0, "Zed")).await;
    add_projects(pool, zed_primary, 1).await;
    let zed_dup = insert_client(pool, &Client::new(0, "zed")).await;
    add_client_notes(pool, zed_dup, 1).await;

    // Another writer holds the database lock past the first group's deadline.
    let mut writer = SqliteConnection::connect_with(&SqliteConnectOptions::new().filename(&path))
        .await
        .unwrap();
    sqlx::raw_sql("BEGIN IMMEDIATE")
        .execute(&mut writer)
        .await
        .unwrap();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1300)).await;
        sqlx::Executor::execute(&mut writer, "ROLLBACK")
            .await
            .unwrap();
        writer.close().await.unwrap();
    });

    let summary = MergeEngine::new(store.clone())
        .run(RunMode::Apply, &mut Scripted::new(&[true, true]), &mut io::sink())
        .await
        .expect("run completes despite a stalled group");
    release.await.unwrap();

    assert_eq!(summary.status, RunStatus::Applied);
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].key, "acme");
    assert!(summary.skipped[0].error.contains("transaction exceeded"));
    assert_eq!(summary.merged.len(), 1);
    assert_eq!(summary.merged[0].key, "zed");
    assert!(summary.verification_passed());

    let refs = store.count_references_to(&[acme_dup]).await.unwrap();
    assert_eq!(refs[&ReferencingTable::WorkActivities], 2);
    assert_eq!(references_to(&store, acme_primary).await, 1);
    assert_eq!(
        store
            .existing_client_ids(&[acme_primary, acme_dup, zed_dup])
            .await
            .unwrap()
            .len(),
        2
    );
    assert_eq!(references_to(&store, zed_primary).await, 2);
}
