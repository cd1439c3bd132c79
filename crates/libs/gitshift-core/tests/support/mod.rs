//! Shared fixtures: a fresh store per test, scripted driver and source
//! doubles, and profile builders.

#![allow(dead_code, clippy::unwrap_used)]

use async_trait::async_trait;
use futures::StreamExt;
use gitshift_common::AppConfig;
use gitshift_core::ctx::Ctx;
use gitshift_core::driver::{
    DeleteOutcome, DriverError, DriverResult, DriverTicket, LockOutcome, MigrationDriver,
    MigrationOutcome, MigrationRequest, PollOutcome,
};
use gitshift_core::model::ModelManager;
use gitshift_core::model::repository::{Repository, RepositoryBmc};
use gitshift_core::model::source::{Source, SourceBmc, SourceForCreate, SourceType};
use gitshift_core::scheduler::Scheduler;
use gitshift_core::source::{
    ListScope, OrgRef, ProjectRef, RepoRef, RepoStream, RepositoryProfile, SourceError,
    SourcePlatform, SourceProvider, SourceResult,
};
use gitshift_core::types::SourceId;
use libsql::Builder;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Test configuration: background tick effectively parked, millisecond
/// poll backoff, short deadlines.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.migration.poll_interval_seconds = 3600;
    config.migration.poll_backoff_base_ms = 2;
    config.migration.poll_backoff_cap_ms = 10;
    config.migration.dry_run_deadline_seconds = 30;
    config.migration.production_deadline_seconds = 30;
    config
}

/// Create a test ModelManager with a fresh database including migrations.
pub async fn create_test_mm() -> (ModelManager, TempDir) {
    create_test_mm_with(test_config()).await
}

pub async fn create_test_mm_with(config: AppConfig) -> (ModelManager, TempDir) {
    let temp_dir = TempDir::new().expect("create temp dir");
    let db_path = temp_dir.path().join("gitshift_test.db");
    let db = Builder::new_local(&db_path).build().await.unwrap();
    let conn = db.connect().unwrap();
    let _ = conn.execute("PRAGMA busy_timeout=5000;", ()).await;
    let _ = conn.execute("PRAGMA foreign_keys=ON;", ()).await;
    gitshift_core::store::apply_migrations(&conn)
        .await
        .expect("run migrations");

    let mm = ModelManager::new_for_test(conn, Arc::new(config));
    (mm, temp_dir)
}

/// Seed a github source and return its id.
pub async fn seed_source(mm: &ModelManager) -> SourceId {
    let ctx = Ctx::system();
    SourceBmc::create(
        &ctx,
        mm,
        SourceForCreate {
            name: "ghes-test".to_string(),
            source_type: SourceType::Github,
            base_url: "https://ghes.example.test".to_string(),
            token: Some("test-token".to_string()),
            app_credentials: None,
        },
    )
    .await
    .expect("create source")
}

/// Minimal profile for a repository name.
pub fn profile(full_name: &str) -> RepositoryProfile {
    RepositoryProfile {
        full_name: full_name.to_string(),
        source_url: Some(format!("https://ghes.example.test/{full_name}")),
        visibility: Some(gitshift_core::model::repository::Visibility::Private),
        default_branch: Some("main".to_string()),
        size_bytes: 10 * 1024 * 1024,
        branch_count: 3,
        commit_count: 120,
        ..Default::default()
    }
}

/// Seed one repository via the discovery save path.
pub async fn seed_repo(mm: &ModelManager, source_id: SourceId, full_name: &str) -> Repository {
    let ctx = Ctx::system();
    let id = RepositoryBmc::save(&ctx, mm, source_id, &profile(full_name))
        .await
        .expect("save repository");
    RepositoryBmc::get(&ctx, mm, id).await.expect("get repository")
}

/// Force a raw status (and related columns) for seeding states the state
/// machine would otherwise have to walk to.
pub async fn force_status(mm: &ModelManager, full_name: &str, status: &str) {
    let db = mm.db_for_test();
    let stmt = db
        .prepare("UPDATE repositories SET status = ? WHERE full_name = ?")
        .await
        .unwrap();
    stmt.execute((status, full_name)).await.unwrap();
}

pub async fn force_migrated(mm: &ModelManager, full_name: &str, destination_url: &str) {
    let db = mm.db_for_test();
    let stmt = db
        .prepare(
            "UPDATE repositories
             SET status = 'complete', destination_url = ?,
                 migrated_at = strftime('%Y-%m-%d %H:%M:%S', 'now')
             WHERE full_name = ?",
        )
        .await
        .unwrap();
    stmt.execute((destination_url, full_name)).await.unwrap();
}

// -- Scripted migration driver

#[derive(Default)]
pub struct MockDriverState {
    /// Outcomes returned by successive `poll` calls. When empty, polls
    /// succeed with a default outcome.
    pub polls: VecDeque<PollOutcome>,
    /// Error returned by the next `start_*` call.
    pub fail_next_start: Option<DriverError>,
    /// Whether `destination_exists` reports true.
    pub destination_exists: bool,
    /// Override for `delete_destination`.
    pub delete_outcome: Option<DriverResult<DeleteOutcome>>,
    /// Whether `lock_source` reports a real lock.
    pub supports_locking: bool,

    pub started: Vec<(String, bool)>,
    pub deleted: Vec<String>,
    pub locked: Vec<String>,
    pub unlocked: Vec<String>,
}

#[derive(Default)]
pub struct MockDriver {
    pub state: Mutex<MockDriverState>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_polls(&self, outcomes: impl IntoIterator<Item = PollOutcome>) {
        let mut state = self.state.lock().unwrap();
        state.polls = outcomes.into_iter().collect();
    }

    pub fn succeed_with(&self, destination_url: &str) {
        self.script_polls([PollOutcome::Succeeded(MigrationOutcome {
            destination_url: Some(destination_url.to_string()),
            warnings: Vec::new(),
        })]);
    }

    pub fn started(&self) -> Vec<(String, bool)> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }
}

#[async_trait]
impl MigrationDriver for MockDriver {
    async fn start_dry_run(&self, req: &MigrationRequest) -> DriverResult<DriverTicket> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_next_start.take() {
            return Err(err);
        }
        state
            .started
            .push((req.repository.full_name.clone(), true));
        Ok(DriverTicket::new(format!(
            "dry-{}",
            req.repository.full_name
        )))
    }

    async fn start_production(&self, req: &MigrationRequest) -> DriverResult<DriverTicket> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_next_start.take() {
            return Err(err);
        }
        state
            .started
            .push((req.repository.full_name.clone(), false));
        Ok(DriverTicket::new(format!(
            "prod-{}",
            req.repository.full_name
        )))
    }

    async fn poll(&self, _ticket: &DriverTicket) -> DriverResult<PollOutcome> {
        let mut state = self.state.lock().unwrap();
        Ok(state
            .polls
            .pop_front()
            .unwrap_or_else(|| PollOutcome::Succeeded(MigrationOutcome::default())))
    }

    async fn destination_exists(&self, _req: &MigrationRequest) -> DriverResult<bool> {
        Ok(self.state.lock().unwrap().destination_exists)
    }

    async fn lock_source(&self, repo: &Repository) -> DriverResult<LockOutcome> {
        let mut state = self.state.lock().unwrap();
        if state.supports_locking {
            state.locked.push(repo.full_name.clone());
            Ok(LockOutcome::Locked)
        } else {
            Ok(LockOutcome::Unsupported)
        }
    }

    async fn unlock_source(&self, repo: &Repository) -> DriverResult<()> {
        self.state.lock().unwrap().unlocked.push(repo.full_name.clone());
        Ok(())
    }

    async fn delete_destination(&self, repo: &Repository) -> DriverResult<DeleteOutcome> {
        let mut state = self.state.lock().unwrap();
        state.deleted.push(repo.full_name.clone());
        state.delete_outcome.take().unwrap_or(Ok(DeleteOutcome::Deleted))
    }
}

// -- Scripted source platform

#[derive(Default)]
pub struct MockSourceState {
    /// Full names that fail once with RateLimited before succeeding.
    pub rate_limit_once: HashSet<String>,
    /// Full names that always fail permanently.
    pub fail_permanent: HashSet<String>,
    pub profiled: Vec<String>,
}

pub struct MockSource {
    /// org name -> repository full names
    pub orgs: Vec<(String, Vec<String>)>,
    /// ADO projects per org; empty for GitHub-shaped sources.
    pub projects: HashMap<String, Vec<String>>,
    pub profile_delay: Duration,
    pub state: Mutex<MockSourceState>,
}

impl MockSource {
    pub fn github(orgs: Vec<(&str, Vec<&str>)>) -> Arc<Self> {
        Arc::new(Self {
            orgs: orgs
                .into_iter()
                .map(|(org, repos)| {
                    (
                        org.to_string(),
                        repos.into_iter().map(|r| format!("{org}/{r}")).collect(),
                    )
                })
                .collect(),
            projects: HashMap::new(),
            profile_delay: Duration::ZERO,
            state: Mutex::new(MockSourceState::default()),
        })
    }

    pub fn rate_limit_once(&self, full_name: &str) {
        self.state
            .lock()
            .unwrap()
            .rate_limit_once
            .insert(full_name.to_string());
    }

    pub fn fail_permanently(&self, full_name: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_permanent
            .insert(full_name.to_string());
    }

    pub fn profiled(&self) -> Vec<String> {
        self.state.lock().unwrap().profiled.clone()
    }

    fn repos_for(&self, scope: &ListScope) -> Vec<String> {
        match scope {
            ListScope::Organization(org) => self
                .orgs
                .iter()
                .find(|(name, _)| *name == org.name)
                .map(|(_, repos)| repos.clone())
                .unwrap_or_default(),
            ListScope::Project(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl SourcePlatform for MockSource {
    async fn list_organizations(&self) -> SourceResult<Vec<OrgRef>> {
        Ok(self
            .orgs
            .iter()
            .map(|(name, _)| OrgRef { name: name.clone() })
            .collect())
    }

    async fn list_projects(&self, org: &OrgRef) -> SourceResult<Vec<ProjectRef>> {
        Ok(self
            .projects
            .get(&org.name)
            .map(|projects| {
                projects
                    .iter()
                    .map(|name| ProjectRef {
                        organization: org.name.clone(),
                        name: name.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn list_repositories(&self, scope: ListScope) -> RepoStream<'_> {
        let refs: Vec<SourceResult<RepoRef>> = self
            .repos_for(&scope)
            .into_iter()
            .map(|full_name| Ok(RepoRef::new(full_name)))
            .collect();
        futures::stream::iter(refs).boxed()
    }

    async fn profile_repository(&self, repo: &RepoRef) -> SourceResult<RepositoryProfile> {
        if !self.profile_delay.is_zero() {
            tokio::time::sleep(self.profile_delay).await;
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.fail_permanent.contains(&repo.full_name) {
                return Err(SourceError::Permanent(format!(
                    "{} is gone at source",
                    repo.full_name
                )));
            }
            if state.rate_limit_once.remove(&repo.full_name) {
                return Err(SourceError::RateLimited {
                    retry_after: Duration::from_millis(5),
                });
            }
            state.profiled.push(repo.full_name.clone());
        }
        Ok(profile(&repo.full_name))
    }

    async fn validate_credentials(&self) -> SourceResult<()> {
        Ok(())
    }
}

/// Source provider returning one shared mock client.
pub struct FixedSources(pub Arc<dyn SourcePlatform>);

impl SourceProvider for FixedSources {
    fn client_for(&self, _source: &Source) -> SourceResult<Arc<dyn SourcePlatform>> {
        Ok(self.0.clone())
    }
}

/// Scheduler wired with the given driver (and optionally a source mock).
pub fn test_scheduler(mm: &ModelManager, driver: Arc<MockDriver>) -> Scheduler {
    Scheduler::new(
        mm.clone(),
        driver,
        Arc::new(FixedSources(MockSource::github(vec![]))),
    )
}

pub fn test_scheduler_with_source(
    mm: &ModelManager,
    driver: Arc<MockDriver>,
    source: Arc<MockSource>,
) -> Scheduler {
    Scheduler::new(mm.clone(), driver, Arc::new(FixedSources(source)))
}
