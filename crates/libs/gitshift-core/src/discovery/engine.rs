//! The discovery crawler.
//!
//! One driver task enumerates scopes and feeds repository refs onto a
//! bounded queue of capacity `2 x workers`; worker tasks profile each ref
//! and upsert it into the store. Per-ref failures are isolated and never
//! abort the run.

use crate::ctx::Ctx;
use crate::discovery::DiscoveryTarget;
use crate::discovery::backoff::BackoffPolicy;
use crate::discovery::progress::ProgressTracker;
use crate::model::ModelManager;
use crate::model::discovery_progress::{DiscoveryProgressBmc, DiscoveryStatus};
use crate::model::migration_log::{LogForCreate, LogLevel, MigrationLogBmc};
use crate::model::repository::RepositoryBmc;
use crate::model::source::SourceBmc;
use crate::source::{ListScope, RepoRef, RepositoryProfile, SourcePlatform, SourceResult};
use crate::types::{DiscoveryId, SourceId};
use crate::{Error, Result};
use futures::StreamExt;
use gitshift_common::config::MAX_DISCOVERY_WORKERS;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Queue capacity factor relative to the worker count.
const QUEUE_FACTOR: usize = 2;

#[derive(Clone)]
pub struct DiscoveryEngine {
    mm: ModelManager,
    source_id: SourceId,
    source: Arc<dyn SourcePlatform>,
    workers: usize,
}

impl DiscoveryEngine {
    /// `workers` is clamped to `[1, 16]`; zero selects the configured
    /// default.
    pub fn new(
        mm: ModelManager,
        source_id: SourceId,
        source: Arc<dyn SourcePlatform>,
        workers: usize,
    ) -> Self {
        let default_workers = mm.app_config.discovery.effective_workers();
        let workers = if workers == 0 {
            default_workers
        } else {
            workers.clamp(1, MAX_DISCOVERY_WORKERS)
        };
        Self {
            mm,
            source_id,
            source,
            workers,
        }
    }

    /// Creates the progress row and runs the crawl in the background.
    pub async fn start(
        &self,
        ctx: &Ctx,
        target: DiscoveryTarget,
        cancel: CancellationToken,
    ) -> Result<DiscoveryId> {
        let id =
            DiscoveryProgressBmc::create(ctx, &self.mm, target.type_str(), &target.label()).await?;

        let engine = self.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.run(&ctx, id, target, cancel).await {
                error!(discovery_id = %id, error = %err, "discovery run failed");
            }
        });
        Ok(id)
    }

    /// Runs a crawl to completion against an existing progress row.
    /// Public so callers needing synchronous discovery (self-service,
    /// tests) can drive it directly.
    pub async fn run(
        &self,
        ctx: &Ctx,
        id: DiscoveryId,
        target: DiscoveryTarget,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(discovery_id = %id, target = %target, workers = self.workers, "discovery started");
        let tracker = Arc::new(ProgressTracker::new(self.mm.clone(), id));
        tracker
            .mutate(|s| s.phase = Some("enumerating".to_string()))
            .await;

        let outcome = self.execute(ctx, &tracker, &target, &cancel).await;

        if cancel.is_cancelled() {
            tracker
                .mutate(|s| s.last_error = Some("discovery cancelled".to_string()))
                .await;
            tracker.finish(DiscoveryStatus::Failed).await;
            info!(discovery_id = %id, "discovery cancelled");
            return Ok(());
        }

        match outcome {
            Ok(()) => {
                if let Err(error) = SourceBmc::touch_sync(ctx, &self.mm, self.source_id).await {
                    warn!(%error, "failed to bump source sync state");
                }
                tracker
                    .mutate(|s| {
                        s.phase = Some("completed".to_string());
                        s.current_org = None;
                    })
                    .await;
                tracker.finish(DiscoveryStatus::Completed).await;
                info!(discovery_id = %id, "discovery completed");
                Ok(())
            }
            Err(err) => {
                tracker
                    .mutate(|s| {
                        s.error_count += 1;
                        s.last_error = Some(err.to_string());
                    })
                    .await;
                tracker.finish(DiscoveryStatus::Failed).await;
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        ctx: &Ctx,
        tracker: &Arc<ProgressTracker>,
        target: &DiscoveryTarget,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel::<RepoRef>(QUEUE_FACTOR * self.workers);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let engine = self.clone();
            let ctx = ctx.clone();
            let tracker = tracker.clone();
            let rx = rx.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                engine.worker_loop(&ctx, &tracker, rx, cancel).await;
            }));
        }

        let produced = self.produce(tracker, target, &tx, cancel).await;
        drop(tx);
        for handle in handles {
            let _ = handle.await;
        }
        produced
    }

    /// The driver task: enumerates scopes and feeds refs to the queue,
    /// stopping as soon as cancellation is observed.
    async fn produce(
        &self,
        tracker: &Arc<ProgressTracker>,
        target: &DiscoveryTarget,
        tx: &mpsc::Sender<RepoRef>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let DiscoveryTarget::SingleRepository { full_name } = target {
            tracker
                .mutate(|s| {
                    s.total_repos += 1;
                    s.phase = Some("profiling".to_string());
                })
                .await;
            let _ = tx.send(RepoRef::new(full_name.clone())).await;
            return Ok(());
        }

        let scopes = self.resolve_scopes(target).await.map_err(Error::Source)?;
        tracker
            .mutate(|s| s.total_orgs = scopes.len() as i64)
            .await;

        for scope in scopes {
            if cancel.is_cancelled() {
                break;
            }
            tracker
                .mutate(|s| {
                    s.current_org = Some(scope.label());
                    s.phase = Some("profiling".to_string());
                })
                .await;

            let mut stream = self.source.list_repositories(scope.clone());
            while let Some(item) = stream.next().await {
                match item {
                    Ok(repo_ref) => {
                        tracker.mutate(|s| s.total_repos += 1).await;
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            sent = tx.send(repo_ref) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        let scope_label = scope.label();
                        warn!(scope = %scope_label, error = %err, "listing failed mid-scope");
                        tracker
                            .mutate(|s| {
                                s.error_count += 1;
                                s.last_error = Some(err.to_string());
                                s.errors.push(format!("{scope_label}: {err}"));
                            })
                            .await;
                        break;
                    }
                }
            }
            tracker.mutate(|s| s.processed_orgs += 1).await;
        }
        Ok(())
    }

    /// Expands a target into listing scopes. An organization with projects
    /// is an ADO organization and expands per-project; otherwise the
    /// organization itself is the scope.
    async fn resolve_scopes(&self, target: &DiscoveryTarget) -> SourceResult<Vec<ListScope>> {
        let orgs = match target {
            DiscoveryTarget::Enterprise => self.source.list_organizations().await?,
            DiscoveryTarget::Organization { name } => vec![crate::source::OrgRef {
                name: name.clone(),
            }],
            DiscoveryTarget::Project { organization, name } => {
                return Ok(vec![ListScope::Project(crate::source::ProjectRef {
                    organization: organization.clone(),
                    name: name.clone(),
                })]);
            }
            DiscoveryTarget::SingleRepository { .. } => return Ok(Vec::new()),
        };

        let mut scopes = Vec::new();
        for org in orgs {
            let projects = self.source.list_projects(&org).await?;
            if projects.is_empty() {
                scopes.push(ListScope::Organization(org));
            } else {
                scopes.extend(projects.into_iter().map(ListScope::Project));
            }
        }
        Ok(scopes)
    }

    async fn worker_loop(
        &self,
        ctx: &Ctx,
        tracker: &Arc<ProgressTracker>,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RepoRef>>>,
        cancel: CancellationToken,
    ) {
        loop {
            // One in-flight ref per worker. Cancellation is only observed
            // between items, so in-flight profiles always complete.
            let item = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    item = rx.recv() => item,
                }
            };
            let Some(repo_ref) = item else { break };
            self.process_ref(ctx, tracker, repo_ref, &cancel).await;
        }
    }

    async fn process_ref(
        &self,
        ctx: &Ctx,
        tracker: &Arc<ProgressTracker>,
        repo_ref: RepoRef,
        cancel: &CancellationToken,
    ) {
        match self.profile_with_retry(&repo_ref, cancel).await {
            Ok(profile) => {
                match RepositoryBmc::save(ctx, &self.mm, self.source_id, &profile).await {
                    Ok(_) => {
                        debug!(repo = %repo_ref.full_name, "profiled");
                        tracker.mutate(|s| s.processed_repos += 1).await;
                    }
                    Err(err) => {
                        self.record_ref_error(ctx, tracker, &repo_ref, &err.to_string())
                            .await;
                    }
                }
            }
            Err(err) => {
                self.record_ref_error(ctx, tracker, &repo_ref, &err.to_string())
                    .await;
            }
        }
    }

    /// Retries `profile_repository` on retryable errors: up to 5 attempts,
    /// exponential backoff from 100 ms capped at 30 s with full jitter,
    /// never sleeping less than a rate-limit's `retry_after`.
    async fn profile_with_retry(
        &self,
        repo_ref: &RepoRef,
        cancel: &CancellationToken,
    ) -> SourceResult<RepositoryProfile> {
        let policy = BackoffPolicy::default();
        let mut attempt: u32 = 1;
        loop {
            match self.source.profile_repository(repo_ref).await {
                Ok(profile) => return Ok(profile),
                Err(err)
                    if err.is_retryable()
                        && attempt < policy.max_attempts
                        && !cancel.is_cancelled() =>
                {
                    let mut delay = policy.delay(attempt);
                    if let Some(min) = err.retry_after() {
                        delay = delay.max(min);
                    }
                    debug!(
                        repo = %repo_ref.full_name,
                        attempt,
                        ?delay,
                        error = %err,
                        "profiling retry"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(err),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// The ref may not be in the store yet; in that case the error goes
    /// onto the run's errors list instead of the repository log.
    async fn record_ref_error(
        &self,
        ctx: &Ctx,
        tracker: &Arc<ProgressTracker>,
        repo_ref: &RepoRef,
        message: &str,
    ) {
        warn!(repo = %repo_ref.full_name, error = message, "profiling failed");

        let logged = match RepositoryBmc::get(ctx, &self.mm, repo_ref.full_name.as_str()).await {
            Ok(repo) => MigrationLogBmc::append(
                ctx,
                &self.mm,
                LogForCreate {
                    repository_id: repo.id,
                    history_id: None,
                    level: LogLevel::Error,
                    phase: Some("discovery".to_string()),
                    operation: Some("profile_repository".to_string()),
                    message: message.to_string(),
                    details: None,
                },
            )
            .await
            .is_ok(),
            Err(_) => false,
        };

        let entry = format!("{}: {message}", repo_ref.full_name);
        tracker
            .mutate(|s| {
                s.error_count += 1;
                s.last_error = Some(entry.clone());
                if !logged {
                    s.errors.push(entry);
                }
            })
            .await;
    }
}
