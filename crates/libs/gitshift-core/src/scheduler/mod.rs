//! Batch execution: the process-wide scheduler tick, the bounded phase
//! pool and the operator command surface.
//!
//! One long-lived tick per process claims repositories across active
//! batches (priority DESC, discovered_at ASC) and submits each claim to a
//! bounded worker pool. All state transitions funnel through the store's
//! guarded update path, so multi-process deployments stay safe.

pub mod ops;
mod phase;

pub use ops::{BulkAction, BulkUpdateReport, SelfServiceRepo, SelfServiceRequest};

use crate::ctx::Ctx;
use crate::driver::MigrationDriver;
use crate::model::ModelManager;
use crate::model::batch::BatchBmc;
use crate::model::repository::{Repository, RepositoryBmc};
use crate::model::status::{MigrationStatus, Phase};
use crate::source::SourceProvider;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct TickHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub(crate) struct SchedulerInner {
    pub(crate) mm: ModelManager,
    pub(crate) driver: Arc<dyn MigrationDriver>,
    pub(crate) sources: Arc<dyn SourceProvider>,
    tick: Mutex<Option<TickHandle>>,
    /// Most recent discovery run and its cancellation handle.
    pub(crate) discovery: Mutex<Option<(crate::types::DiscoveryId, CancellationToken)>>,
}

/// Process-wide scheduler. Cheap to clone; all clones share the single
/// tick task.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        mm: ModelManager,
        driver: Arc<dyn MigrationDriver>,
        sources: Arc<dyn SourceProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                mm,
                driver,
                sources,
                tick: Mutex::new(None),
                discovery: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn mm(&self) -> &ModelManager {
        &self.inner.mm
    }

    /// Starts the tick task if it is not already running. Idempotent;
    /// called implicitly by every operation that enqueues work.
    pub async fn ensure_started(&self) {
        let mut tick = self.inner.tick.lock().await;
        if let Some(handle) = tick.as_ref() {
            if !handle.handle.is_finished() {
                return;
            }
        }

        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let tick_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            Self::tick_loop(inner, tick_cancel).await;
        });
        *tick = Some(TickHandle { cancel, handle });
        info!("scheduler tick started");
    }

    /// Stops claiming and waits for in-flight phase tasks to record their
    /// outcomes.
    pub async fn shutdown(&self) {
        let handle = { self.inner.tick.lock().await.take() };
        if let Some(TickHandle { cancel, handle }) = handle {
            cancel.cancel();
            if let Err(err) = handle.await {
                warn!(error = %err, "scheduler tick join failed");
            }
            info!("scheduler tick stopped");
        }
    }

    async fn tick_loop(inner: Arc<SchedulerInner>, cancel: CancellationToken) {
        let config = &inner.mm.app_config.migration;
        let workers = config.effective_workers();
        let interval = Duration::from_secs(config.poll_interval_seconds.max(1));
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            while tasks.try_join_next().is_some() {}

            if let Err(err) = Self::run_tick(&inner, &semaphore, &mut tasks).await {
                error!(error = %err, "scheduler tick failed");
            }
        }

        // Cancellation stops enqueuing only; in-flight phase tasks are one
        // driver interaction each and complete normally.
        while tasks.join_next().await.is_some() {}
    }

    /// One tick: advance production-intent batches, then claim up to the
    /// pool's free capacity and submit phase tasks.
    async fn run_tick(
        inner: &Arc<SchedulerInner>,
        semaphore: &Arc<Semaphore>,
        tasks: &mut JoinSet<()>,
    ) -> Result<()> {
        let ctx = Ctx::system();
        Self::advance_production_batches(inner, &ctx).await?;

        let available = semaphore.available_permits();
        if available == 0 {
            return Ok(());
        }

        let claimed = Self::claim_for_tick(inner, &ctx, available).await?;
        for (repo, claim_phase) in claimed {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let inner = inner.clone();
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let _permit = permit;
                phase::run_phase(&inner, &ctx, repo, claim_phase).await;
            });
        }
        Ok(())
    }

    /// Claims production work ahead of dry-runs, both ordered by priority
    /// then discovery age.
    async fn claim_for_tick(
        inner: &Arc<SchedulerInner>,
        ctx: &Ctx,
        budget: usize,
    ) -> Result<Vec<(Repository, Phase)>> {
        let mut claimed = Vec::new();

        let migrations =
            RepositoryBmc::claim_pending(ctx, &inner.mm, Phase::Migration, budget, None).await?;
        claimed.extend(migrations.into_iter().map(|r| (r, Phase::Migration)));

        let remaining = budget - claimed.len();
        if remaining > 0 {
            let dry_runs =
                RepositoryBmc::claim_pending(ctx, &inner.mm, Phase::DryRun, remaining, None)
                    .await?;
            claimed.extend(dry_runs.into_iter().map(|r| (r, Phase::DryRun)));
        }
        Ok(claimed)
    }

    /// Members of production-started batches whose dry-run finished move
    /// on to `pre_migration`.
    async fn advance_production_batches(inner: &Arc<SchedulerInner>, ctx: &Ctx) -> Result<()> {
        for batch in BatchBmc::production_intent_batches(ctx, &inner.mm).await? {
            let promoted = RepositoryBmc::promote_batch_members(
                ctx,
                &inner.mm,
                batch.id,
                &[MigrationStatus::DryRunComplete],
                MigrationStatus::PreMigration,
            )
            .await?;
            if !promoted.is_empty() {
                info!(batch = %batch.id, count = promoted.len(), "advanced dry-run completions to pre-migration");
                for id in &promoted {
                    phase::record_promotion(ctx, &inner.mm, *id, MigrationStatus::PreMigration)
                        .await;
                }
                BatchBmc::recompute_status(ctx, &inner.mm, batch.id).await?;
            }
        }
        Ok(())
    }

    /// Runs a single synchronous tick: claims with the full pool budget
    /// and drives every claimed repository to its phase outcome before
    /// returning. The background loop is the production path; this exists
    /// for deterministic operation in tests and one-shot CLI runs.
    pub async fn tick_once(&self, ctx: &Ctx) -> Result<usize> {
        let inner = &self.inner;
        Self::advance_production_batches(inner, ctx).await?;

        let budget = inner.mm.app_config.migration.effective_workers();
        let claimed = Self::claim_for_tick(inner, ctx, budget).await?;
        let count = claimed.len();

        let mut tasks = Vec::with_capacity(count);
        for (repo, claim_phase) in claimed {
            let inner = inner.clone();
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                phase::run_phase(&inner, &ctx, repo, claim_phase).await;
            }));
        }
        for task in tasks {
            task.await.map_err(|e| Error::InvalidInput(e.to_string()))?;
        }
        Ok(count)
    }
}
