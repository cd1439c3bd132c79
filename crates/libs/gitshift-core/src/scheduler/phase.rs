//! Phase task execution: exactly one driver interaction per claimed
//! repository, polled to a terminal outcome and recorded as a state
//! transition plus history and log rows. Errors never escape a phase
//! task; they become `*_failed` transitions or, for store outages, a
//! logged no-op so the next tick re-claims.

use crate::ctx::Ctx;
use crate::driver::{DriverTicket, LockOutcome, MigrationOutcome, MigrationRequest, PollOutcome};
use crate::model::batch::{Batch, BatchBmc, MigrationApi};
use crate::model::migration_history::{HistoryForCreate, MigrationHistoryBmc};
use crate::model::migration_log::{LogForCreate, LogLevel, MigrationLogBmc};
use crate::model::repository::{Repository, RepositoryBmc, RepositoryForUpdate, Visibility};
use crate::model::status::{MigrationStatus, Phase};
use crate::model::{ModelManager, now_utc};
use crate::scheduler::SchedulerInner;
use crate::types::{HistoryId, RepositoryId};
use crate::Result;
use chrono::NaiveDateTime;
use gitshift_common::config::{DestRepoExistsAction, InternalVisibilityMapping, PublicVisibilityMapping, VisibilityHandling};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, warn};

/// Terminal result of a poll loop.
enum PollResult {
    Succeeded(MigrationOutcome),
    Failed(String),
    TimedOut,
}

pub(crate) async fn run_phase(
    inner: &Arc<SchedulerInner>,
    ctx: &Ctx,
    repo: Repository,
    claim_phase: Phase,
) {
    let outcome = match claim_phase {
        Phase::DryRun => run_dry_run(inner, ctx, &repo).await,
        Phase::Migration => run_migration(inner, ctx, &repo).await,
    };
    if let Err(err) = outcome {
        // Store outage mid-phase: nothing was transitioned, the claim
        // stands and surfaces on a later tick.
        error!(repo = %repo.full_name, phase = %claim_phase, error = %err, "phase task aborted");
    }

    if let Some(batch_id) = repo.batch_id {
        if let Err(err) = BatchBmc::recompute_status(ctx, &inner.mm, batch_id).await {
            warn!(batch = %batch_id, error = %err, "failed to recompute batch status");
        }
    }
}

async fn run_dry_run(inner: &Arc<SchedulerInner>, ctx: &Ctx, repo: &Repository) -> Result<()> {
    let step_started = now_utc();
    let history_id = record_history(
        ctx,
        &inner.mm,
        repo.id,
        Phase::DryRun.as_str(),
        MigrationStatus::DryRunInProgress,
        Some("dry run claimed".to_string()),
        None,
        step_started,
    )
    .await?;
    log(
        ctx,
        &inner.mm,
        repo.id,
        Some(history_id),
        LogLevel::Info,
        Phase::DryRun.as_str(),
        "start_dry_run",
        format!("dry run started for {}", repo.full_name),
        None,
    )
    .await;

    let req = build_request(inner, ctx, repo, true).await?;
    let ticket = match inner.driver.start_dry_run(&req).await {
        Ok(ticket) => ticket,
        Err(err) => {
            return fail_phase(inner, ctx, repo, Phase::DryRun, err.to_string(), step_started, false)
                .await;
        }
    };

    let deadline = Duration::from_secs(inner.mm.app_config.migration.dry_run_deadline_seconds);
    match poll_until_terminal(inner, ctx, repo, &ticket, deadline, false).await {
        PollResult::Succeeded(outcome) => {
            let history_id = transition(
                ctx,
                &inner.mm,
                repo,
                MigrationStatus::DryRunComplete,
                Phase::DryRun.as_str(),
                Some("dry run completed".to_string()),
                None,
                step_started,
                RepositoryForUpdate::default(),
            )
            .await?;
            log(
                ctx,
                &inner.mm,
                repo.id,
                Some(history_id),
                LogLevel::Info,
                Phase::DryRun.as_str(),
                "dry_run_complete",
                format!("dry run completed for {}", repo.full_name),
                warnings_details(&outcome),
            )
            .await;
            Ok(())
        }
        PollResult::Failed(reason) => {
            fail_phase(inner, ctx, repo, Phase::DryRun, reason, step_started, false).await
        }
        PollResult::TimedOut => {
            fail_phase(
                inner,
                ctx,
                repo,
                Phase::DryRun,
                "phase deadline exceeded".to_string(),
                step_started,
                false,
            )
            .await
        }
    }
}

async fn run_migration(inner: &Arc<SchedulerInner>, ctx: &Ctx, repo: &Repository) -> Result<()> {
    let step_started = now_utc();
    let history_id = record_history(
        ctx,
        &inner.mm,
        repo.id,
        Phase::Migration.as_str(),
        MigrationStatus::ArchiveGenerating,
        Some("migration claimed".to_string()),
        None,
        step_started,
    )
    .await?;
    log(
        ctx,
        &inner.mm,
        repo.id,
        Some(history_id),
        LogLevel::Info,
        Phase::Migration.as_str(),
        "start_migration",
        format!("migration started for {}", repo.full_name),
        None,
    )
    .await;

    // Blocking validations park the repository for remediation instead of
    // burning a doomed migration attempt.
    if repo.limits.is_blocking() {
        let history_id = transition(
            ctx,
            &inner.mm,
            repo,
            MigrationStatus::RemediationRequired,
            Phase::Migration.as_str(),
            Some("blocking validations present".to_string()),
            None,
            step_started,
            RepositoryForUpdate::default(),
        )
        .await?;
        log(
            ctx,
            &inner.mm,
            repo.id,
            Some(history_id),
            LogLevel::Warn,
            Phase::Migration.as_str(),
            "validation",
            format!("{} requires remediation before migration", repo.full_name),
            serde_json::to_value(&repo.limits).ok(),
        )
        .await;
        return Ok(());
    }

    let req = build_request(inner, ctx, repo, false).await?;

    match inner.driver.destination_exists(&req).await {
        Ok(false) => {}
        Ok(true) => {
            let action = inner.mm.app_config.migration.dest_repo_exists_action;
            match action {
                DestRepoExistsAction::Fail => {
                    return fail_phase(
                        inner,
                        ctx,
                        repo,
                        Phase::Migration,
                        format!("destination {} already exists", req.destination_full_name),
                        step_started,
                        false,
                    )
                    .await;
                }
                DestRepoExistsAction::Skip => {
                    let history_id = transition(
                        ctx,
                        &inner.mm,
                        repo,
                        MigrationStatus::RemediationRequired,
                        Phase::Migration.as_str(),
                        Some(format!(
                            "destination {} already exists, skipped",
                            req.destination_full_name
                        )),
                        None,
                        step_started,
                        RepositoryForUpdate::default(),
                    )
                    .await?;
                    log(
                        ctx,
                        &inner.mm,
                        repo.id,
                        Some(history_id),
                        LogLevel::Warn,
                        Phase::Migration.as_str(),
                        "destination_exists",
                        format!("skipped {}: destination already exists", repo.full_name),
                        None,
                    )
                    .await;
                    return Ok(());
                }
                DestRepoExistsAction::Delete => {
                    if let Err(err) = inner.driver.delete_destination(&req.repository).await {
                        return fail_phase(
                            inner,
                            ctx,
                            repo,
                            Phase::Migration,
                            format!("failed to delete existing destination: {err}"),
                            step_started,
                            false,
                        )
                        .await;
                    }
                    log(
                        ctx,
                        &inner.mm,
                        repo.id,
                        None,
                        LogLevel::Info,
                        Phase::Migration.as_str(),
                        "destination_exists",
                        format!(
                            "existing destination {} deleted before migration",
                            req.destination_full_name
                        ),
                        None,
                    )
                    .await;
                }
            }
        }
        Err(err) => {
            return fail_phase(
                inner,
                ctx,
                repo,
                Phase::Migration,
                err.to_string(),
                step_started,
                false,
            )
            .await;
        }
    }

    let locked = matches!(
        inner.driver.lock_source(repo).await,
        Ok(LockOutcome::Locked)
    );
    if locked {
        RepositoryBmc::update(
            ctx,
            &inner.mm,
            &repo.full_name,
            RepositoryForUpdate {
                is_source_locked: Some(true),
                ..Default::default()
            },
        )
        .await?;
    }

    let ticket = match inner.driver.start_production(&req).await {
        Ok(ticket) => ticket,
        Err(err) => {
            return fail_phase(inner, ctx, repo, Phase::Migration, err.to_string(), step_started, locked)
                .await;
        }
    };

    let history_id = transition(
        ctx,
        &inner.mm,
        repo,
        MigrationStatus::QueuedForMigration,
        Phase::Migration.as_str(),
        Some(format!("queued at destination (ticket {})", ticket.as_str())),
        None,
        step_started,
        RepositoryForUpdate::default(),
    )
    .await?;
    log(
        ctx,
        &inner.mm,
        repo.id,
        Some(history_id),
        LogLevel::Info,
        Phase::Migration.as_str(),
        "queued",
        format!("{} queued for migration", repo.full_name),
        None,
    )
    .await;

    let deadline = Duration::from_secs(inner.mm.app_config.migration.production_deadline_seconds);
    match poll_until_terminal(inner, ctx, repo, &ticket, deadline, true).await {
        PollResult::Succeeded(outcome) => {
            complete_migration(inner, ctx, repo, &req, outcome, step_started).await
        }
        PollResult::Failed(reason) => {
            fail_phase(inner, ctx, repo, Phase::Migration, reason, step_started, true).await
        }
        PollResult::TimedOut => {
            fail_phase(
                inner,
                ctx,
                repo,
                Phase::Migration,
                "phase deadline exceeded".to_string(),
                step_started,
                true,
            )
            .await
        }
    }
}

/// Terminal success: migration_complete -> post_migration -> complete,
/// with the source unlocked on the way out.
async fn complete_migration(
    inner: &Arc<SchedulerInner>,
    ctx: &Ctx,
    repo: &Repository,
    req: &MigrationRequest,
    outcome: MigrationOutcome,
    step_started: NaiveDateTime,
) -> Result<()> {
    let destination_url = outcome
        .destination_url
        .clone()
        .unwrap_or_else(|| format!("https://github.com/{}", req.destination_full_name));

    let history_id = transition(
        ctx,
        &inner.mm,
        repo,
        MigrationStatus::MigrationComplete,
        Phase::Migration.as_str(),
        Some("content migrated".to_string()),
        None,
        step_started,
        RepositoryForUpdate {
            destination_full_name: Some(req.destination_full_name.clone()),
            destination_url: Some(destination_url.clone()),
            migrated_at: Some(now_utc()),
            ..Default::default()
        },
    )
    .await?;
    log(
        ctx,
        &inner.mm,
        repo.id,
        Some(history_id),
        LogLevel::Info,
        Phase::Migration.as_str(),
        "migration_complete",
        format!("{} migrated to {destination_url}", repo.full_name),
        warnings_details(&outcome),
    )
    .await;

    let post_started = now_utc();
    transition(
        ctx,
        &inner.mm,
        repo,
        MigrationStatus::PostMigration,
        Phase::Migration.as_str(),
        Some("post-migration verification".to_string()),
        None,
        post_started,
        RepositoryForUpdate::default(),
    )
    .await?;

    if let Err(err) = inner.driver.unlock_source(repo).await {
        warn!(repo = %repo.full_name, error = %err, "source unlock failed after migration");
    }

    let history_id = transition(
        ctx,
        &inner.mm,
        repo,
        MigrationStatus::Complete,
        Phase::Migration.as_str(),
        Some("migration complete".to_string()),
        None,
        post_started,
        RepositoryForUpdate {
            is_source_locked: Some(false),
            ..Default::default()
        },
    )
    .await?;
    log(
        ctx,
        &inner.mm,
        repo.id,
        Some(history_id),
        LogLevel::Info,
        Phase::Migration.as_str(),
        "complete",
        format!("{} complete", repo.full_name),
        None,
    )
    .await;
    Ok(())
}

/// Records a `*_failed` transition with history and an ERROR log,
/// unlocking the source (best effort) when a production attempt held it.
async fn fail_phase(
    inner: &Arc<SchedulerInner>,
    ctx: &Ctx,
    repo: &Repository,
    claim_phase: Phase,
    reason: String,
    step_started: NaiveDateTime,
    unlock: bool,
) -> Result<()> {
    let failed_status = match claim_phase {
        Phase::DryRun => MigrationStatus::DryRunFailed,
        Phase::Migration => MigrationStatus::MigrationFailed,
    };

    if unlock {
        if let Err(err) = inner.driver.unlock_source(repo).await {
            warn!(repo = %repo.full_name, error = %err, "source unlock failed after error");
        }
    }

    let history_id = transition(
        ctx,
        &inner.mm,
        repo,
        failed_status,
        claim_phase.as_str(),
        None,
        Some(reason.clone()),
        step_started,
        RepositoryForUpdate {
            is_source_locked: unlock.then_some(false),
            ..Default::default()
        },
    )
    .await?;
    log(
        ctx,
        &inner.mm,
        repo.id,
        Some(history_id),
        LogLevel::Error,
        claim_phase.as_str(),
        "phase_failed",
        format!("{} {claim_phase} failed: {reason}", repo.full_name),
        None,
    )
    .await;
    Ok(())
}

/// Polls a driver ticket to a terminal state with exponential backoff
/// (base 1 s doubling to a 30 s cap by default) under the phase's hard
/// deadline. With `mark_content`, the first observed progress transitions
/// the repository into `migrating_content`.
async fn poll_until_terminal(
    inner: &Arc<SchedulerInner>,
    ctx: &Ctx,
    repo: &Repository,
    ticket: &DriverTicket,
    deadline: Duration,
    mark_content: bool,
) -> PollResult {
    let config = &inner.mm.app_config.migration;
    let base = Duration::from_millis(config.poll_backoff_base_ms.max(1));
    let cap = Duration::from_millis(config.poll_backoff_cap_ms.max(config.poll_backoff_base_ms));
    let started = Instant::now();
    let mut attempt: u32 = 0;
    let mut content_started = false;

    loop {
        if started.elapsed() >= deadline {
            return PollResult::TimedOut;
        }

        match inner.driver.poll(ticket).await {
            Ok(PollOutcome::Queued) => {}
            Ok(PollOutcome::Running) => {
                if mark_content && !content_started {
                    content_started = true;
                    if let Err(err) = mark_content_transition(inner, ctx, repo).await {
                        warn!(repo = %repo.full_name, error = %err, "failed to record content-transfer start");
                    }
                }
            }
            Ok(PollOutcome::Succeeded(outcome)) => {
                if mark_content && !content_started {
                    if let Err(err) = mark_content_transition(inner, ctx, repo).await {
                        warn!(repo = %repo.full_name, error = %err, "failed to record content-transfer start");
                    }
                }
                return PollResult::Succeeded(outcome);
            }
            // Failure is legal from queued_for_migration as well, so no
            // content-transfer transition is fabricated here.
            Ok(PollOutcome::Failed(reason)) => return PollResult::Failed(reason),
            Err(err) if err.is_retryable() => {
                warn!(repo = %repo.full_name, error = %err, "poll hiccup, retrying");
            }
            Err(err) => return PollResult::Failed(err.to_string()),
        }

        attempt += 1;
        let exp = attempt.saturating_sub(1).min(31);
        let delay = base.saturating_mul(2u32.saturating_pow(exp)).min(cap);
        let remaining = deadline.saturating_sub(started.elapsed());
        tokio::time::sleep(delay.min(remaining)).await;
    }
}

async fn mark_content_transition(
    inner: &Arc<SchedulerInner>,
    ctx: &Ctx,
    repo: &Repository,
) -> Result<()> {
    let content_started = now_utc();
    transition(
        ctx,
        &inner.mm,
        repo,
        MigrationStatus::MigratingContent,
        Phase::Migration.as_str(),
        Some("content transfer running".to_string()),
        None,
        content_started,
        RepositoryForUpdate::default(),
    )
    .await?;
    Ok(())
}

/// Computes the driver request: destination name from the repository
/// override, then the batch's destination org, then the source org;
/// visibility mapped by configuration; exclusions merged with batch
/// defaults. The scheduler never branches on the driver behind it.
async fn build_request(
    inner: &Arc<SchedulerInner>,
    ctx: &Ctx,
    repo: &Repository,
    dry_run: bool,
) -> Result<MigrationRequest> {
    let batch: Option<Batch> = match repo.batch_id {
        Some(batch_id) => Some(BatchBmc::get(ctx, &inner.mm, batch_id).await?),
        None => None,
    };

    let destination_full_name = repo.destination_full_name.clone().unwrap_or_else(|| {
        let short_name = repo
            .full_name
            .rsplit('/')
            .next()
            .unwrap_or(repo.full_name.as_str());
        let destination_org = batch
            .as_ref()
            .and_then(|b| b.destination_org.clone())
            .or_else(|| repo.organization.clone())
            .unwrap_or_else(|| "migrated".to_string());
        format!("{destination_org}/{short_name}")
    });

    let target_visibility = map_visibility(
        repo.visibility,
        &inner.mm.app_config.migration.visibility_handling,
    );
    let exclude = repo.effective_excludes(batch.as_ref().map(|b| b.exclude).unwrap_or_default());
    let migration_api = batch.map(|b| b.migration_api).unwrap_or(MigrationApi::Gei);

    Ok(MigrationRequest {
        repository: repo.clone(),
        destination_full_name,
        target_visibility,
        exclude,
        migration_api,
        dry_run,
    })
}

fn map_visibility(visibility: Option<Visibility>, handling: &VisibilityHandling) -> Visibility {
    match visibility {
        Some(Visibility::Public) => match handling.public_repos {
            PublicVisibilityMapping::Public => Visibility::Public,
            PublicVisibilityMapping::Internal => Visibility::Internal,
            PublicVisibilityMapping::Private => Visibility::Private,
        },
        Some(Visibility::Internal) => match handling.internal_repos {
            InternalVisibilityMapping::Internal => Visibility::Internal,
            InternalVisibilityMapping::Private => Visibility::Private,
        },
        Some(Visibility::Private) | None => Visibility::Private,
    }
}

/// Applies the status patch and appends the matching history row.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn transition(
    ctx: &Ctx,
    mm: &ModelManager,
    repo: &Repository,
    to: MigrationStatus,
    phase_label: &str,
    message: Option<String>,
    error_message: Option<String>,
    step_started: NaiveDateTime,
    extra: RepositoryForUpdate,
) -> Result<HistoryId> {
    RepositoryBmc::update(
        ctx,
        mm,
        &repo.full_name,
        RepositoryForUpdate {
            status: Some(to),
            ..extra
        },
    )
    .await?;
    record_history(
        ctx,
        mm,
        repo.id,
        phase_label,
        to,
        message,
        error_message,
        step_started,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn record_history(
    ctx: &Ctx,
    mm: &ModelManager,
    repository_id: RepositoryId,
    phase_label: &str,
    status: MigrationStatus,
    message: Option<String>,
    error_message: Option<String>,
    step_started: NaiveDateTime,
) -> Result<HistoryId> {
    MigrationHistoryBmc::create(
        ctx,
        mm,
        HistoryForCreate {
            repository_id,
            phase: phase_label.to_string(),
            status,
            message,
            error_message,
            started_at: step_started,
        },
    )
    .await
}

/// History row for a bulk promotion. Best effort: promotion already
/// committed, a history miss is logged and not propagated.
pub(crate) async fn record_promotion(
    ctx: &Ctx,
    mm: &ModelManager,
    repository_id: RepositoryId,
    to: MigrationStatus,
) {
    let phase_label = if to == MigrationStatus::DryRunQueued {
        Phase::DryRun.as_str()
    } else {
        Phase::Migration.as_str()
    };
    if let Err(err) = record_history(
        ctx,
        mm,
        repository_id,
        phase_label,
        to,
        Some("promoted by batch start".to_string()),
        None,
        now_utc(),
    )
    .await
    {
        warn!(repository = %repository_id, error = %err, "failed to record promotion history");
    }
}

/// Structured log details for driver warnings, if any.
fn warnings_details(outcome: &MigrationOutcome) -> Option<serde_json::Value> {
    if outcome.warnings.is_empty() {
        None
    } else {
        serde_json::to_value(&outcome.warnings).ok()
    }
}

#[allow(clippy::too_many_arguments)]
async fn log(
    ctx: &Ctx,
    mm: &ModelManager,
    repository_id: RepositoryId,
    history_id: Option<HistoryId>,
    level: LogLevel,
    phase_label: &str,
    operation: &str,
    message: String,
    details: Option<serde_json::Value>,
) {
    let result = MigrationLogBmc::append(
        ctx,
        mm,
        LogForCreate {
            repository_id,
            history_id,
            level,
            phase: Some(phase_label.to_string()),
            operation: Some(operation.to_string()),
            message,
            details,
        },
    )
    .await;
    if let Err(err) = result {
        warn!(repository = %repository_id, error = %err, "failed to append migration log");
    }
}
