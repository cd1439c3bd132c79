//! End-to-end scheduler scenarios over a mock driver: dry-run happy path,
//! failure and retry, rollback, won't-migrate exclusion and the full
//! production pipeline.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use gitshift_core::Error;
use gitshift_core::ctx::Ctx;
use gitshift_core::driver::{DeleteOutcome, MigrationOutcome, PollOutcome};
use gitshift_core::model::batch::{BatchBmc, BatchForCreate};
use gitshift_core::model::migration_history::MigrationHistoryBmc;
use gitshift_core::model::migration_log::{LogFilter, LogLevel, MigrationLogBmc};
use gitshift_core::model::repository::{Repository, RepositoryBmc};
use gitshift_core::model::status::{BatchStatus, MigrationStatus, is_legal_transition};
use gitshift_core::types::{BatchId, RepositoryId};
use gitshift_common::config::DestRepoExistsAction;
use support::*;

async fn seed_batch(
    mm: &gitshift_core::model::ModelManager,
    name: &str,
    repos: &[&str],
) -> (BatchId, Vec<Repository>) {
    let ctx = Ctx::system();
    let source_id = seed_source(mm).await;
    let batch_id = BatchBmc::create(
        &ctx,
        mm,
        BatchForCreate {
            name: name.to_string(),
            description: None,
            batch_type: Some("pilot".to_string()),
            destination_org: Some("dest-org".to_string()),
            migration_api: Default::default(),
            exclude: Default::default(),
        },
    )
    .await
    .unwrap();

    let mut seeded = Vec::new();
    for full_name in repos {
        seeded.push(seed_repo(mm, source_id, full_name).await);
    }
    let ids: Vec<RepositoryId> = seeded.iter().map(|r| r.id).collect();
    BatchBmc::add_repositories(&ctx, mm, batch_id, &ids)
        .await
        .unwrap();
    (batch_id, seeded)
}

async fn drain(scheduler: &gitshift_core::scheduler::Scheduler, ctx: &Ctx) {
    // Ticks until a full pass claims nothing.
    for _ in 0..20 {
        if scheduler.tick_once(ctx).await.unwrap() == 0 {
            return;
        }
    }
    panic!("scheduler did not drain in 20 ticks");
}

#[tokio::test]
async fn test_s1_happy_path_dry_run() {
    let (mm, _guard) = create_test_mm().await;
    let ctx = Ctx::system();
    let (batch_id, repos) = seed_batch(&mm, "pilot", &["org-a/repo-1"]).await;
    let driver = MockDriver::new();
    driver.script_polls([
        PollOutcome::Running,
        PollOutcome::Running,
        PollOutcome::Succeeded(MigrationOutcome::default()),
    ]);
    let scheduler = test_scheduler(&mm, driver.clone());

    scheduler
        .start_batch_dry_run(&ctx, batch_id, false)
        .await
        .unwrap();
    let claimed = scheduler.tick_once(&ctx).await.unwrap();
    assert_eq!(claimed, 1);

    let repo = RepositoryBmc::get(&ctx, &mm, "org-a/repo-1").await.unwrap();
    assert_eq!(repo.status, MigrationStatus::DryRunComplete);
    assert!(repo.last_dry_run_at.is_some());

    let history = MigrationHistoryBmc::list_for_repository(&ctx, &mm, repos[0].id)
        .await
        .unwrap();
    let statuses: Vec<MigrationStatus> = history.iter().map(|h| h.status).collect();
    assert_eq!(
        statuses,
        vec![
            MigrationStatus::DryRunQueued,
            MigrationStatus::DryRunInProgress,
            MigrationStatus::DryRunComplete,
        ]
    );
    assert!(history.iter().all(|h| h.duration_seconds.unwrap_or(0) >= 0));

    let batch = BatchBmc::get(&ctx, &mm, batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Ready);
    assert!(batch.started_at.is_some());
    assert_eq!(driver.started(), vec![("org-a/repo-1".to_string(), true)]);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_s2_failure_then_retry() {
    let (mm, _guard) = create_test_mm().await;
    let ctx = Ctx::system();
    let (batch_id, repos) = seed_batch(&mm, "pilot", &["org-a/repo-1"]).await;
    let driver = MockDriver::new();
    driver.script_polls([PollOutcome::Failed("rate limit at source".to_string())]);
    let scheduler = test_scheduler(&mm, driver.clone());

    scheduler
        .start_batch_dry_run(&ctx, batch_id, false)
        .await
        .unwrap();
    drain(&scheduler, &ctx).await;

    let repo = RepositoryBmc::get(&ctx, &mm, "org-a/repo-1").await.unwrap();
    assert_eq!(repo.status, MigrationStatus::DryRunFailed);

    let errors = MigrationLogBmc::list(
        &ctx,
        &mm,
        &LogFilter {
            repository_id: Some(repos[0].id),
            level: Some(LogLevel::Error),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(!errors.is_empty(), "failure must emit an ERROR log");
    assert!(errors[0].message.contains("rate limit at source"));

    // Operator retry with a now-healthy destination.
    driver.script_polls([PollOutcome::Succeeded(MigrationOutcome::default())]);
    scheduler
        .retry_repository(&ctx, repos[0].id, true)
        .await
        .unwrap();
    drain(&scheduler, &ctx).await;

    let repo = RepositoryBmc::get(&ctx, &mm, "org-a/repo-1").await.unwrap();
    assert_eq!(repo.status, MigrationStatus::DryRunComplete);

    let history = MigrationHistoryBmc::list_for_repository(&ctx, &mm, repos[0].id)
        .await
        .unwrap();
    let statuses: Vec<MigrationStatus> = history.iter().map(|h| h.status).collect();
    assert!(statuses.contains(&MigrationStatus::DryRunFailed));
    assert_eq!(*statuses.last().unwrap(), MigrationStatus::DryRunComplete);

    // History timestamps never regress (append order).
    for pair in history.windows(2) {
        assert!(pair[0].started_at <= pair[1].started_at);
    }

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_s3_rollback_after_migration() {
    let (mm, _guard) = create_test_mm().await;
    let ctx = Ctx::system();
    let source_id = seed_source(&mm).await;
    let repo = seed_repo(&mm, source_id, "org-a/repo-1").await;
    force_migrated(&mm, "org-a/repo-1", "https://dest/org/repo").await;

    let driver = MockDriver::new();
    let scheduler = test_scheduler(&mm, driver.clone());

    scheduler
        .rollback_repository(&ctx, "org-a/repo-1", "wrong destination")
        .await
        .unwrap();

    let after = RepositoryBmc::get(&ctx, &mm, "org-a/repo-1").await.unwrap();
    assert_eq!(after.status, MigrationStatus::RolledBack);
    assert!(!after.is_source_locked);
    assert_eq!(driver.deleted(), vec!["org-a/repo-1".to_string()]);

    let history = MigrationHistoryBmc::list_for_repository(&ctx, &mm, repo.id)
        .await
        .unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.status, MigrationStatus::RolledBack);
    assert_eq!(last.message.as_deref(), Some("wrong destination"));
}

#[tokio::test]
async fn test_rollback_survives_missing_destination() {
    let (mm, _guard) = create_test_mm().await;
    let ctx = Ctx::system();
    let source_id = seed_source(&mm).await;
    seed_repo(&mm, source_id, "org-a/gone").await;
    force_migrated(&mm, "org-a/gone", "https://dest/org/gone").await;

    let driver = MockDriver::new();
    driver.state.lock().unwrap().delete_outcome = Some(Ok(DeleteOutcome::NotFound));
    let scheduler = test_scheduler(&mm, driver);

    scheduler
        .rollback_repository(&ctx, "org-a/gone", "cleanup")
        .await
        .unwrap();
    let after = RepositoryBmc::get(&ctx, &mm, "org-a/gone").await.unwrap();
    assert_eq!(after.status, MigrationStatus::RolledBack);
}

#[tokio::test]
async fn test_rollback_requires_complete() {
    let (mm, _guard) = create_test_mm().await;
    let ctx = Ctx::system();
    let source_id = seed_source(&mm).await;
    seed_repo(&mm, source_id, "org-a/fresh").await;

    let scheduler = test_scheduler(&mm, MockDriver::new());
    let result = scheduler
        .rollback_repository(&ctx, "org-a/fresh", "nope")
        .await;
    assert!(matches!(result, Err(Error::InvalidTransition { .. })));
}

#[tokio::test]
async fn test_s6_wont_migrate_exclusion() {
    let (mm, _guard) = create_test_mm().await;
    let ctx = Ctx::system();
    let names: Vec<String> = (0..10).map(|i| format!("org-a/repo-{i:02}")).collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let (batch_id, _repos) = seed_batch(&mm, "wave-2", &name_refs).await;

    let driver = MockDriver::new();
    let scheduler = test_scheduler(&mm, driver.clone());

    for name in &names[..3] {
        scheduler.mark_wont_migrate(&ctx, name, false).await.unwrap();
    }

    scheduler.start_batch(&ctx, batch_id, true).await.unwrap();
    drain(&scheduler, &ctx).await;

    let migrated: Vec<String> = driver.started().into_iter().map(|(name, _)| name).collect();
    assert_eq!(migrated.len(), 7, "only 7 repositories enter migration");
    for name in &names[..3] {
        assert!(!migrated.contains(name));
        let repo = RepositoryBmc::get(&ctx, &mm, name.as_str()).await.unwrap();
        assert_eq!(repo.status, MigrationStatus::WontMigrate);
    }
    for name in &names[3..] {
        let repo = RepositoryBmc::get(&ctx, &mm, name.as_str()).await.unwrap();
        assert_eq!(repo.status, MigrationStatus::Complete);
        assert!(repo.migrated_at.is_some());
        assert!(repo.destination_url.is_some());
    }

    let batch = BatchBmc::get(&ctx, &mm, batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert!(batch.completed_at.is_some());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_full_pipeline_with_dry_run_and_locking() {
    let (mm, _guard) = create_test_mm().await;
    let ctx = Ctx::system();
    let (batch_id, repos) = seed_batch(&mm, "wave-3", &["org-a/repo-1"]).await;

    let driver = MockDriver::new();
    driver.state.lock().unwrap().supports_locking = true;
    driver.script_polls([
        // dry run
        PollOutcome::Running,
        PollOutcome::Succeeded(MigrationOutcome::default()),
        // production
        PollOutcome::Queued,
        PollOutcome::Running,
        PollOutcome::Succeeded(MigrationOutcome {
            destination_url: Some("https://github.com/dest-org/repo-1".to_string()),
            warnings: vec!["large push".to_string()],
        }),
    ]);
    let scheduler = test_scheduler(&mm, driver.clone());

    scheduler.start_batch(&ctx, batch_id, false).await.unwrap();
    drain(&scheduler, &ctx).await;

    let repo = RepositoryBmc::get(&ctx, &mm, "org-a/repo-1").await.unwrap();
    assert_eq!(repo.status, MigrationStatus::Complete);
    assert_eq!(
        repo.destination_url.as_deref(),
        Some("https://github.com/dest-org/repo-1")
    );
    assert_eq!(
        repo.destination_full_name.as_deref(),
        Some("dest-org/repo-1"),
        "destination org comes from the batch"
    );
    assert!(repo.migrated_at.is_some());
    assert!(!repo.is_source_locked, "source unlocked on the way out");

    {
        let state = driver.state.lock().unwrap();
        assert_eq!(state.locked, vec!["org-a/repo-1".to_string()]);
        assert!(!state.unlocked.is_empty());
        assert_eq!(
            state.started,
            vec![
                ("org-a/repo-1".to_string(), true),
                ("org-a/repo-1".to_string(), false),
            ]
        );
    }

    // The whole history is a valid path in the state diagram, starting
    // from the batch promotion.
    let history = MigrationHistoryBmc::list_for_repository(&ctx, &mm, repos[0].id)
        .await
        .unwrap();
    let statuses: Vec<MigrationStatus> = history.iter().map(|h| h.status).collect();
    assert_eq!(*statuses.last().unwrap(), MigrationStatus::Complete);
    for pair in statuses.windows(2) {
        assert!(
            is_legal_transition(pair[0], pair[1]),
            "illegal edge {} -> {} in history",
            pair[0],
            pair[1]
        );
    }

    let batch = BatchBmc::get(&ctx, &mm, batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_destination_exists_fail_policy() {
    let (mm, _guard) = create_test_mm().await;
    let ctx = Ctx::system();
    let (batch_id, repos) = seed_batch(&mm, "wave-4", &["org-a/taken"]).await;

    let driver = MockDriver::new();
    driver.state.lock().unwrap().destination_exists = true;
    let scheduler = test_scheduler(&mm, driver.clone());

    scheduler.start_batch(&ctx, batch_id, true).await.unwrap();
    drain(&scheduler, &ctx).await;

    let repo = RepositoryBmc::get(&ctx, &mm, "org-a/taken").await.unwrap();
    assert_eq!(repo.status, MigrationStatus::MigrationFailed);
    assert!(driver.started().is_empty(), "no migration was attempted");

    let history = MigrationHistoryBmc::list_for_repository(&ctx, &mm, repos[0].id)
        .await
        .unwrap();
    let failed = history
        .iter()
        .find(|h| h.status == MigrationStatus::MigrationFailed)
        .unwrap();
    assert!(
        failed
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("already exists")
    );

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_destination_exists_skip_policy_parks_for_remediation() {
    let mut config = test_config();
    config.migration.dest_repo_exists_action = DestRepoExistsAction::Skip;
    let (mm, _guard) = create_test_mm_with(config).await;
    let ctx = Ctx::system();
    let (batch_id, _repos) = seed_batch(&mm, "wave-5", &["org-a/taken"]).await;

    let driver = MockDriver::new();
    driver.state.lock().unwrap().destination_exists = true;
    let scheduler = test_scheduler(&mm, driver);

    scheduler.start_batch(&ctx, batch_id, true).await.unwrap();
    drain(&scheduler, &ctx).await;

    let repo = RepositoryBmc::get(&ctx, &mm, "org-a/taken").await.unwrap();
    assert_eq!(repo.status, MigrationStatus::RemediationRequired);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_blocking_validations_require_remediation() {
    let (mm, _guard) = create_test_mm().await;
    let ctx = Ctx::system();
    let source_id = seed_source(&mm).await;

    let mut blocked = profile("org-a/blocked");
    blocked.limits.has_blocking_files = true;
    RepositoryBmc::save(&ctx, &mm, source_id, &blocked)
        .await
        .unwrap();

    let driver = MockDriver::new();
    let scheduler = test_scheduler(&mm, driver.clone());
    scheduler
        .start_migration(&ctx, "org-a/blocked", false)
        .await
        .unwrap();
    drain(&scheduler, &ctx).await;

    let repo = RepositoryBmc::get(&ctx, &mm, "org-a/blocked").await.unwrap();
    assert_eq!(repo.status, MigrationStatus::RemediationRequired);
    assert!(driver.started().is_empty());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_wont_migrate_round_trip_returns_pending() {
    let (mm, _guard) = create_test_mm().await;
    let ctx = Ctx::system();
    let source_id = seed_source(&mm).await;
    seed_repo(&mm, source_id, "org-a/on-hold").await;

    let scheduler = test_scheduler(&mm, MockDriver::new());
    scheduler
        .mark_wont_migrate(&ctx, "org-a/on-hold", false)
        .await
        .unwrap();
    assert_eq!(
        RepositoryBmc::get(&ctx, &mm, "org-a/on-hold").await.unwrap().status,
        MigrationStatus::WontMigrate
    );

    scheduler
        .mark_wont_migrate(&ctx, "org-a/on-hold", true)
        .await
        .unwrap();
    assert_eq!(
        RepositoryBmc::get(&ctx, &mm, "org-a/on-hold").await.unwrap().status,
        MigrationStatus::Pending
    );
}

#[tokio::test]
async fn test_bulk_update_reports_per_id_outcomes() {
    let (mm, _guard) = create_test_mm().await;
    let ctx = Ctx::system();
    let source_id = seed_source(&mm).await;
    let ok = seed_repo(&mm, source_id, "org-a/fine").await;

    let scheduler = test_scheduler(&mm, MockDriver::new());
    let report = scheduler
        .batch_update_repository_status(
            &ctx,
            &[ok.id, RepositoryId::new(4040)],
            gitshift_core::scheduler::BulkAction::MarkWontMigrate,
            None,
        )
        .await
        .unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("4040"));
}

#[tokio::test]
async fn test_start_batch_rejects_empty_or_running() {
    let (mm, _guard) = create_test_mm().await;
    let ctx = Ctx::system();
    let batch_id = BatchBmc::create(
        &ctx,
        &mm,
        BatchForCreate {
            name: "empty".to_string(),
            description: None,
            batch_type: None,
            destination_org: None,
            migration_api: Default::default(),
            exclude: Default::default(),
        },
    )
    .await
    .unwrap();

    let scheduler = test_scheduler(&mm, MockDriver::new());
    let result = scheduler.start_batch(&ctx, batch_id, false).await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_self_service_creates_and_starts_batch() {
    let (mm, _guard) = create_test_mm().await;
    let ctx = Ctx::system();
    let source_id = seed_source(&mm).await;

    let driver = MockDriver::new();
    let source = MockSource::github(vec![("org-x", vec!["a", "b"])]);
    let scheduler = test_scheduler_with_source(&mm, driver.clone(), source);

    // Neither repository exists yet; both are profiled synchronously.
    let batch_id = scheduler
        .self_service(
            &ctx,
            gitshift_core::scheduler::SelfServiceRequest {
                source_id,
                repositories: vec![
                    gitshift_core::scheduler::SelfServiceRepo {
                        full_name: "org-x/a".to_string(),
                        destination_full_name: Some("new-org/a".to_string()),
                    },
                    gitshift_core::scheduler::SelfServiceRepo {
                        full_name: "org-x/b".to_string(),
                        destination_full_name: None,
                    },
                ],
                batch_name: None,
                destination_org: Some("new-org".to_string()),
                skip_dry_run: true,
            },
        )
        .await
        .unwrap();

    let batch = BatchBmc::get(&ctx, &mm, batch_id).await.unwrap();
    assert!(batch.name.starts_with("self-service-"));
    assert_eq!(batch.repository_count, 2);
    assert!(batch.started_at.is_some());

    drain(&scheduler, &ctx).await;

    let a = RepositoryBmc::get(&ctx, &mm, "org-x/a").await.unwrap();
    assert_eq!(a.status, MigrationStatus::Complete);
    assert_eq!(a.destination_full_name.as_deref(), Some("new-org/a"));
    let b = RepositoryBmc::get(&ctx, &mm, "org-x/b").await.unwrap();
    assert_eq!(b.status, MigrationStatus::Complete);
    assert_eq!(
        b.destination_url.as_deref(),
        Some("https://github.com/new-org/b"),
        "destination derived from the request's destination org"
    );

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_self_service_is_atomic() {
    let (mm, _guard) = create_test_mm().await;
    let ctx = Ctx::system();
    let source_id = seed_source(&mm).await;

    // One repository already belongs to a batch.
    let taken = seed_repo(&mm, source_id, "org-x/taken").await;
    let other = BatchBmc::create(
        &ctx,
        &mm,
        BatchForCreate {
            name: "other".to_string(),
            description: None,
            batch_type: None,
            destination_org: None,
            migration_api: Default::default(),
            exclude: Default::default(),
        },
    )
    .await
    .unwrap();
    BatchBmc::add_repositories(&ctx, &mm, other, &[taken.id])
        .await
        .unwrap();

    let source = MockSource::github(vec![("org-x", vec!["fresh"])]);
    let scheduler = test_scheduler_with_source(&mm, MockDriver::new(), source);
    let before = BatchBmc::list(&ctx, &mm).await.unwrap().len();

    let result = scheduler
        .self_service(
            &ctx,
            gitshift_core::scheduler::SelfServiceRequest {
                source_id,
                repositories: vec![
                    gitshift_core::scheduler::SelfServiceRepo {
                        full_name: "org-x/fresh".to_string(),
                        destination_full_name: None,
                    },
                    gitshift_core::scheduler::SelfServiceRepo {
                        full_name: "org-x/taken".to_string(),
                        destination_full_name: None,
                    },
                ],
                batch_name: None,
                destination_org: None,
                skip_dry_run: false,
            },
        )
        .await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));

    // Nothing was created.
    let after = BatchBmc::list(&ctx, &mm).await.unwrap().len();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_unlock_repository_clears_stale_lock() {
    let (mm, _guard) = create_test_mm().await;
    let ctx = Ctx::system();
    let source_id = seed_source(&mm).await;
    let repo = seed_repo(&mm, source_id, "org-a/stuck").await;

    let db = mm.db_for_test();
    let stmt = db
        .prepare("UPDATE repositories SET is_source_locked = 1 WHERE id = ?")
        .await
        .unwrap();
    stmt.execute([repo.id.get()]).await.unwrap();

    let driver = MockDriver::new();
    let scheduler = test_scheduler(&mm, driver.clone());
    scheduler.unlock_repository(&ctx, "org-a/stuck").await.unwrap();

    let after = RepositoryBmc::get(&ctx, &mm, "org-a/stuck").await.unwrap();
    assert!(!after.is_source_locked);
    assert_eq!(
        driver.state.lock().unwrap().unlocked,
        vec!["org-a/stuck".to_string()]
    );
}

#[tokio::test]
async fn test_log_pagination_preserves_insertion_order() {
    let (mm, _guard) = create_test_mm().await;
    let ctx = Ctx::system();
    let source_id = seed_source(&mm).await;
    let repo = seed_repo(&mm, source_id, "org-a/chatty").await;

    for i in 0..10 {
        MigrationLogBmc::append(
            &ctx,
            &mm,
            gitshift_core::model::migration_log::LogForCreate {
                repository_id: repo.id,
                history_id: None,
                level: LogLevel::Info,
                phase: Some("dry_run".to_string()),
                operation: Some("step".to_string()),
                message: format!("step {i}"),
                details: None,
            },
        )
        .await
        .unwrap();
    }

    let page = MigrationLogBmc::list(
        &ctx,
        &mm,
        &LogFilter {
            repository_id: Some(repo.id),
            limit: Some(4),
            offset: Some(4),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(page.len(), 4);
    assert_eq!(page[0].message, "step 4");
    assert_eq!(page[3].message, "step 7");
    assert_eq!(page[0].initiated_by.as_deref(), Some("system"));

    // A bare offset returns the rest, not page one again.
    let tail = MigrationLogBmc::list(
        &ctx,
        &mm,
        &LogFilter {
            repository_id: Some(repo.id),
            offset: Some(8),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].message, "step 8");
    assert_eq!(tail[1].message, "step 9");
}
