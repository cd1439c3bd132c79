//! Operator commands: batch starts, retries, rollback, won't-migrate
//! marking, bulk updates, self-service requests and discovery control.
//! Thin composition over the BMCs and the state machine; the HTTP layer
//! binds these to routes.

use crate::ctx::Ctx;
use crate::discovery::{DiscoveryEngine, DiscoveryTarget};
use crate::driver::DeleteOutcome;
use crate::model::batch::{BatchBmc, BatchForCreate};
use crate::model::filter::RepositoryFilter;
use crate::model::migration_log::{LogForCreate, LogLevel, MigrationLogBmc};
use crate::model::repository::{RepoKey, RepositoryBmc, RepositoryForUpdate};
use crate::model::source::SourceBmc;
use crate::model::status::{MigrationStatus, Phase};
use crate::model::now_utc;
use crate::scheduler::{Scheduler, phase};
use crate::source::RepoRef;
use crate::types::{BatchId, DiscoveryId, RepositoryId, SourceId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Bulk status action over a set of repositories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkAction {
    MarkMigrated,
    MarkWontMigrate,
    UnmarkWontMigrate,
    Rollback,
}

/// Per-call report of a bulk update.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkUpdateReport {
    pub updated: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// One repository of a self-service request.
#[derive(Debug, Clone, Deserialize)]
pub struct SelfServiceRepo {
    pub full_name: String,
    pub destination_full_name: Option<String>,
}

/// Self-service migration: named repositories in, auto-named running
/// batch out. Atomic: the batch is created with all listed repositories
/// present, or nothing is created.
#[derive(Debug, Clone, Deserialize)]
pub struct SelfServiceRequest {
    pub source_id: SourceId,
    pub repositories: Vec<SelfServiceRepo>,
    pub batch_name: Option<String>,
    pub destination_org: Option<String>,
    #[serde(default)]
    pub skip_dry_run: bool,
}

impl Scheduler {
    /// Starts a discovery run against a configured source. The run
    /// executes in the background; progress is observable via
    /// `DiscoveryProgressBmc`.
    pub async fn start_discovery(
        &self,
        ctx: &Ctx,
        source_id: SourceId,
        target: DiscoveryTarget,
        workers: Option<usize>,
    ) -> Result<DiscoveryId> {
        let source = SourceBmc::get(ctx, self.mm(), source_id).await?;
        if !source.is_active {
            return Err(Error::InvalidInput(format!(
                "source '{}' is not active",
                source.name
            )));
        }
        let client = self.inner.sources.client_for(&source)?;

        self.ensure_started().await;

        let engine = DiscoveryEngine::new(
            self.mm().clone(),
            source_id,
            client,
            workers.unwrap_or(0),
        );
        let cancel = CancellationToken::new();
        let id = engine.start(ctx, target, cancel.clone()).await?;
        *self.inner.discovery.lock().await = Some((id, cancel));
        Ok(id)
    }

    /// Cancels the most recent discovery run, if still tracked.
    pub async fn cancel_discovery(&self) -> Option<DiscoveryId> {
        let guard = self.inner.discovery.lock().await;
        guard.as_ref().map(|(id, cancel)| {
            cancel.cancel();
            *id
        })
    }

    /// Starts batch execution toward `complete`. Without `skip_dry_run`,
    /// members rehearse first and the tick advances completed dry-runs
    /// into `pre_migration`.
    pub async fn start_batch(&self, ctx: &Ctx, batch_id: BatchId, skip_dry_run: bool) -> Result<()> {
        let mm = self.mm();
        let batch = BatchBmc::get(ctx, mm, batch_id).await?;
        if !batch.status.can_start() {
            return Err(Error::InvalidBatchState {
                id: batch_id.get(),
                status: batch.status,
            });
        }
        if batch.repository_count == 0 {
            return Err(Error::InvalidInput(format!(
                "batch '{}' has no repositories",
                batch.name
            )));
        }

        if skip_dry_run {
            let promoted = RepositoryBmc::promote_batch_members(
                ctx,
                mm,
                batch_id,
                &[
                    MigrationStatus::Pending,
                    MigrationStatus::DryRunComplete,
                    MigrationStatus::DryRunFailed,
                    MigrationStatus::MigrationFailed,
                ],
                MigrationStatus::PreMigration,
            )
            .await?;
            for id in &promoted {
                phase::record_promotion(ctx, mm, *id, MigrationStatus::PreMigration).await;
            }
        } else {
            let queued = RepositoryBmc::promote_batch_members(
                ctx,
                mm,
                batch_id,
                &[
                    MigrationStatus::Pending,
                    MigrationStatus::DryRunFailed,
                    MigrationStatus::RemediationRequired,
                ],
                MigrationStatus::DryRunQueued,
            )
            .await?;
            for id in &queued {
                phase::record_promotion(ctx, mm, *id, MigrationStatus::DryRunQueued).await;
            }
            // Members that already failed production re-enter directly.
            let retried = RepositoryBmc::promote_batch_members(
                ctx,
                mm,
                batch_id,
                &[MigrationStatus::MigrationFailed],
                MigrationStatus::PreMigration,
            )
            .await?;
            for id in &retried {
                phase::record_promotion(ctx, mm, *id, MigrationStatus::PreMigration).await;
            }
        }

        BatchBmc::mark_started(ctx, mm, batch_id, true).await?;
        BatchBmc::recompute_status(ctx, mm, batch_id).await?;
        self.ensure_started().await;
        info!(batch = %batch_id, skip_dry_run, "batch started");
        Ok(())
    }

    /// Queues a dry-run pass over the batch. Never advances past
    /// `dry_run_complete`.
    pub async fn start_batch_dry_run(
        &self,
        ctx: &Ctx,
        batch_id: BatchId,
        only_pending: bool,
    ) -> Result<()> {
        let mm = self.mm();
        let batch = BatchBmc::get(ctx, mm, batch_id).await?;
        if !batch.status.can_start() {
            return Err(Error::InvalidBatchState {
                id: batch_id.get(),
                status: batch.status,
            });
        }
        if batch.repository_count == 0 {
            return Err(Error::InvalidInput(format!(
                "batch '{}' has no repositories",
                batch.name
            )));
        }

        let from: &[MigrationStatus] = if only_pending {
            &[MigrationStatus::Pending]
        } else {
            &[
                MigrationStatus::Pending,
                MigrationStatus::DryRunFailed,
                MigrationStatus::RemediationRequired,
            ]
        };
        let promoted =
            RepositoryBmc::promote_batch_members(ctx, mm, batch_id, from, MigrationStatus::DryRunQueued)
                .await?;
        for id in &promoted {
            phase::record_promotion(ctx, mm, *id, MigrationStatus::DryRunQueued).await;
        }

        BatchBmc::mark_started(ctx, mm, batch_id, false).await?;
        BatchBmc::recompute_status(ctx, mm, batch_id).await?;
        self.ensure_started().await;
        info!(batch = %batch_id, only_pending, count = promoted.len(), "batch dry run started");
        Ok(())
    }

    /// Re-enters failed members of a batch from their predecessor states.
    /// Returns how many repositories were re-queued.
    pub async fn retry_batch_failures(
        &self,
        ctx: &Ctx,
        batch_id: BatchId,
        ids: Option<&[RepositoryId]>,
    ) -> Result<usize> {
        let mm = self.mm();
        let _ = BatchBmc::get(ctx, mm, batch_id).await?;

        let members = RepositoryBmc::list(
            ctx,
            mm,
            &RepositoryFilter {
                batch_id: Some(batch_id),
                ..Default::default()
            },
        )
        .await?;

        let mut retried = 0;
        for repo in members {
            if let Some(only) = ids {
                if !only.contains(&repo.id) {
                    continue;
                }
            }
            let to = match repo.status {
                MigrationStatus::DryRunFailed => MigrationStatus::DryRunQueued,
                MigrationStatus::MigrationFailed => MigrationStatus::PreMigration,
                _ => continue,
            };
            phase::transition(
                ctx,
                mm,
                &repo,
                to,
                to_phase_label(to),
                Some("retry requested".to_string()),
                None,
                now_utc(),
                RepositoryForUpdate::default(),
            )
            .await?;
            retried += 1;
        }

        BatchBmc::recompute_status(ctx, mm, batch_id).await?;
        self.ensure_started().await;
        Ok(retried)
    }

    /// Queues a single repository for a dry-run or production attempt.
    pub async fn start_migration(
        &self,
        ctx: &Ctx,
        key: impl Into<RepoKey>,
        dry_run: bool,
    ) -> Result<()> {
        let mm = self.mm();
        let repo = RepositoryBmc::get(ctx, mm, key).await?;
        let to = if dry_run {
            MigrationStatus::DryRunQueued
        } else {
            MigrationStatus::PreMigration
        };
        phase::transition(
            ctx,
            mm,
            &repo,
            to,
            to_phase_label(to),
            Some("migration requested".to_string()),
            None,
            now_utc(),
            RepositoryForUpdate::default(),
        )
        .await?;

        if let Some(batch_id) = repo.batch_id {
            BatchBmc::recompute_status(ctx, mm, batch_id).await?;
        }
        self.ensure_started().await;
        Ok(())
    }

    /// Operator retry of a failed repository.
    pub async fn retry_repository(
        &self,
        ctx: &Ctx,
        id: RepositoryId,
        dry_run: bool,
    ) -> Result<()> {
        self.start_migration(ctx, id, dry_run).await
    }

    /// Rolls a completed migration back: deletes the destination (a
    /// missing destination counts as already reverted), unlocks the
    /// source and records the operator's reason.
    pub async fn rollback_repository(
        &self,
        ctx: &Ctx,
        full_name: &str,
        reason: &str,
    ) -> Result<()> {
        let mm = self.mm();
        let repo = RepositoryBmc::get(ctx, mm, full_name).await?;
        if repo.status != MigrationStatus::Complete {
            return Err(Error::InvalidTransition {
                from: repo.status,
                to: MigrationStatus::RolledBack,
            });
        }

        match self.inner.driver.delete_destination(&repo).await {
            Ok(DeleteOutcome::Deleted) => {}
            Ok(DeleteOutcome::NotFound) => {
                info!(repo = %repo.full_name, "destination already gone, rollback proceeds");
            }
            Err(err) => return Err(err.into()),
        }
        if let Err(err) = self.inner.driver.unlock_source(&repo).await {
            tracing::warn!(repo = %repo.full_name, error = %err, "source unlock failed during rollback");
        }

        let history_id = phase::transition(
            ctx,
            mm,
            &repo,
            MigrationStatus::RolledBack,
            "rollback",
            Some(reason.to_string()),
            None,
            now_utc(),
            RepositoryForUpdate {
                is_source_locked: Some(false),
                ..Default::default()
            },
        )
        .await?;
        MigrationLogBmc::append(
            ctx,
            mm,
            LogForCreate {
                repository_id: repo.id,
                history_id: Some(history_id),
                level: LogLevel::Info,
                phase: Some("rollback".to_string()),
                operation: Some("rollback".to_string()),
                message: format!("{} rolled back: {reason}", repo.full_name),
                details: None,
            },
        )
        .await?;

        if let Some(batch_id) = repo.batch_id {
            BatchBmc::recompute_status(ctx, mm, batch_id).await?;
        }
        Ok(())
    }

    /// Marks a repository as administratively excluded from migration, or
    /// unmarks it back to `pending`.
    pub async fn mark_wont_migrate(
        &self,
        ctx: &Ctx,
        full_name: &str,
        unmark: bool,
    ) -> Result<()> {
        let mm = self.mm();
        let repo = RepositoryBmc::get(ctx, mm, full_name).await?;
        let (to, message) = if unmark {
            (MigrationStatus::Pending, "unmarked won't-migrate")
        } else {
            (MigrationStatus::WontMigrate, "marked won't-migrate")
        };

        let history_id = phase::transition(
            ctx,
            mm,
            &repo,
            to,
            "administrative",
            Some(message.to_string()),
            None,
            now_utc(),
            RepositoryForUpdate::default(),
        )
        .await?;
        MigrationLogBmc::append(
            ctx,
            mm,
            LogForCreate {
                repository_id: repo.id,
                history_id: Some(history_id),
                level: LogLevel::Info,
                phase: Some("administrative".to_string()),
                operation: Some("wont_migrate".to_string()),
                message: format!("{}: {message}", repo.full_name),
                details: None,
            },
        )
        .await?;

        if let Some(batch_id) = repo.batch_id {
            BatchBmc::recompute_status(ctx, mm, batch_id).await?;
        }
        Ok(())
    }

    /// Clears the source lock so a stuck repository can be re-attempted.
    pub async fn unlock_repository(&self, ctx: &Ctx, full_name: &str) -> Result<()> {
        let mm = self.mm();
        let repo = RepositoryBmc::get(ctx, mm, full_name).await?;
        if let Err(err) = self.inner.driver.unlock_source(&repo).await {
            tracing::warn!(repo = %repo.full_name, error = %err, "driver unlock failed");
        }
        RepositoryBmc::update(
            ctx,
            mm,
            &repo.full_name,
            RepositoryForUpdate {
                is_source_locked: Some(false),
                ..Default::default()
            },
        )
        .await?;
        MigrationLogBmc::append(
            ctx,
            mm,
            LogForCreate {
                repository_id: repo.id,
                history_id: None,
                level: LogLevel::Info,
                phase: Some("administrative".to_string()),
                operation: Some("unlock".to_string()),
                message: format!("{} source lock cleared", repo.full_name),
                details: None,
            },
        )
        .await?;
        Ok(())
    }

    /// Applies one administrative action to many repositories, reporting
    /// per-id outcomes instead of failing wholesale.
    pub async fn batch_update_repository_status(
        &self,
        ctx: &Ctx,
        ids: &[RepositoryId],
        action: BulkAction,
        reason: Option<&str>,
    ) -> Result<BulkUpdateReport> {
        let mm = self.mm();
        let mut report = BulkUpdateReport::default();

        for id in ids {
            let outcome = match action {
                BulkAction::MarkMigrated => {
                    RepositoryBmc::admin_mark_migrated(ctx, mm, *id).await
                }
                BulkAction::MarkWontMigrate => match RepositoryBmc::get(ctx, mm, *id).await {
                    Ok(repo) => self.mark_wont_migrate(ctx, &repo.full_name, false).await,
                    Err(err) => Err(err),
                },
                BulkAction::UnmarkWontMigrate => match RepositoryBmc::get(ctx, mm, *id).await {
                    Ok(repo) => self.mark_wont_migrate(ctx, &repo.full_name, true).await,
                    Err(err) => Err(err),
                },
                BulkAction::Rollback => match RepositoryBmc::get(ctx, mm, *id).await {
                    Ok(repo) => {
                        self.rollback_repository(
                            ctx,
                            &repo.full_name,
                            reason.unwrap_or("bulk rollback"),
                        )
                        .await
                    }
                    Err(err) => Err(err),
                },
            };
            match outcome {
                Ok(()) => report.updated += 1,
                Err(err) => {
                    report.failed += 1;
                    report.errors.push(format!("{id}: {err}"));
                }
            }
        }
        Ok(report)
    }

    /// Self-service migration: ensures every named repository exists in
    /// the store (profiling synchronously where missing), creates an
    /// auto-named batch holding exactly those repositories, and starts it.
    pub async fn self_service(&self, ctx: &Ctx, request: SelfServiceRequest) -> Result<BatchId> {
        let mm = self.mm();
        if request.repositories.is_empty() {
            return Err(Error::InvalidInput(
                "self-service request names no repositories".into(),
            ));
        }

        // Resolve everything before creating anything.
        let source = SourceBmc::get(ctx, mm, request.source_id).await?;
        let mut repo_ids = Vec::with_capacity(request.repositories.len());
        for entry in &request.repositories {
            let repo = match RepositoryBmc::get(ctx, mm, entry.full_name.as_str()).await {
                Ok(repo) => repo,
                Err(Error::RepositoryNotFound(_)) => {
                    let client = self.inner.sources.client_for(&source)?;
                    let profile = client
                        .profile_repository(&RepoRef::new(entry.full_name.clone()))
                        .await
                        .map_err(Error::Source)?;
                    let id = RepositoryBmc::save(ctx, mm, request.source_id, &profile).await?;
                    RepositoryBmc::get(ctx, mm, id).await?
                }
                Err(err) => return Err(err),
            };
            if repo.batch_id.is_some() {
                return Err(Error::InvalidInput(format!(
                    "{} already belongs to a batch",
                    repo.full_name
                )));
            }
            repo_ids.push((repo.id, entry.destination_full_name.clone()));
        }

        let batch_name = request
            .batch_name
            .unwrap_or_else(|| format!("self-service-{}", uuid::Uuid::new_v4().simple()));
        let batch_id = BatchBmc::create(
            ctx,
            mm,
            BatchForCreate {
                name: batch_name,
                description: Some("self-service migration".to_string()),
                batch_type: Some("self-service".to_string()),
                destination_org: request.destination_org.clone(),
                migration_api: Default::default(),
                exclude: Default::default(),
            },
        )
        .await?;

        let ids: Vec<RepositoryId> = repo_ids.iter().map(|(id, _)| *id).collect();
        let changes = BatchBmc::add_repositories(ctx, mm, batch_id, &ids).await?;
        if changes.iter().any(|c| !c.applied) {
            // Undo: the contract is all-or-nothing.
            BatchBmc::remove_repositories(ctx, mm, batch_id, &ids).await?;
            BatchBmc::delete(ctx, mm, batch_id).await?;
            return Err(Error::InvalidInput(
                "one or more repositories could not join the batch".into(),
            ));
        }

        for (id, destination) in &repo_ids {
            if let Some(destination_full_name) = destination {
                let repo = RepositoryBmc::get(ctx, mm, *id).await?;
                RepositoryBmc::update(
                    ctx,
                    mm,
                    &repo.full_name,
                    RepositoryForUpdate {
                        destination_full_name: Some(destination_full_name.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            }
        }

        self.start_batch(ctx, batch_id, request.skip_dry_run).await?;
        Ok(batch_id)
    }
}

fn to_phase_label(to: MigrationStatus) -> &'static str {
    if to == MigrationStatus::DryRunQueued {
        Phase::DryRun.as_str()
    } else {
        Phase::Migration.as_str()
    }
}
