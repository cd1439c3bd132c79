use config::{Config, File};
use serde::Deserialize;
use std::env;

/// Hard ceiling on the phase-task worker pool.
pub const MAX_MIGRATION_WORKERS: usize = 32;
/// Hard ceiling on the discovery worker pool.
pub const MAX_DISCOVERY_WORKERS: usize = 16;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub migration: MigrationConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file. Opaque to the core.
    pub path: String,
}

/// Policy applied when the destination organization already contains the
/// target repository.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DestRepoExistsAction {
    Fail,
    Skip,
    Delete,
}

/// Destination visibility chosen for repositories that are `public` at the
/// source.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PublicVisibilityMapping {
    Public,
    Internal,
    Private,
}

/// Destination visibility chosen for repositories that are `internal` at the
/// source. GitHub does not allow widening internal to public.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InternalVisibilityMapping {
    Internal,
    Private,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VisibilityHandling {
    #[serde(default = "default_public_mapping")]
    pub public_repos: PublicVisibilityMapping,
    #[serde(default = "default_internal_mapping")]
    pub internal_repos: InternalVisibilityMapping,
}

fn default_public_mapping() -> PublicVisibilityMapping {
    PublicVisibilityMapping::Private
}

fn default_internal_mapping() -> InternalVisibilityMapping {
    InternalVisibilityMapping::Private
}

impl Default for VisibilityHandling {
    fn default() -> Self {
        Self {
            public_repos: default_public_mapping(),
            internal_repos: default_internal_mapping(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MigrationConfig {
    /// Size of the phase-task worker pool.
    #[serde(default = "default_migration_workers")]
    pub workers: usize,
    /// Scheduler tick cadence in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Base delay of the driver-ticket poll backoff.
    #[serde(default = "default_poll_backoff_base_ms")]
    pub poll_backoff_base_ms: u64,
    /// Cap of the driver-ticket poll backoff.
    #[serde(default = "default_poll_backoff_cap_ms")]
    pub poll_backoff_cap_ms: u64,
    /// Hard deadline for a dry-run phase task.
    #[serde(default = "default_dry_run_deadline")]
    pub dry_run_deadline_seconds: u64,
    /// Hard deadline for a production phase task.
    #[serde(default = "default_production_deadline")]
    pub production_deadline_seconds: u64,
    #[serde(default = "default_dest_repo_exists_action")]
    pub dest_repo_exists_action: DestRepoExistsAction,
    #[serde(default)]
    pub visibility_handling: VisibilityHandling,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Size of the discovery worker pool.
    #[serde(default = "default_discovery_workers")]
    pub workers: usize,
}

fn default_migration_workers() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    5
}

fn default_poll_backoff_base_ms() -> u64 {
    1000
}

fn default_poll_backoff_cap_ms() -> u64 {
    30_000
}

fn default_dry_run_deadline() -> u64 {
    6 * 3600
}

fn default_production_deadline() -> u64 {
    24 * 3600
}

fn default_dest_repo_exists_action() -> DestRepoExistsAction {
    DestRepoExistsAction::Fail
}

fn default_discovery_workers() -> usize {
    4
}

impl MigrationConfig {
    /// Worker count clamped to `[1, MAX_MIGRATION_WORKERS]`.
    pub fn effective_workers(&self) -> usize {
        self.workers.clamp(1, MAX_MIGRATION_WORKERS)
    }
}

impl DiscoveryConfig {
    /// Worker count clamped to `[1, MAX_DISCOVERY_WORKERS]`.
    pub fn effective_workers(&self) -> usize {
        self.workers.clamp(1, MAX_DISCOVERY_WORKERS)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                path: "data/gitshift.db".to_string(),
            },
            migration: MigrationConfig {
                workers: default_migration_workers(),
                poll_interval_seconds: default_poll_interval(),
                poll_backoff_base_ms: default_poll_backoff_base_ms(),
                poll_backoff_cap_ms: default_poll_backoff_cap_ms(),
                dry_run_deadline_seconds: default_dry_run_deadline(),
                production_deadline_seconds: default_production_deadline(),
                dest_repo_exists_action: default_dest_repo_exists_action(),
                visibility_handling: VisibilityHandling::default(),
            },
            discovery: DiscoveryConfig {
                workers: default_discovery_workers(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration with 12-factor env var support.
    ///
    /// Priority order (highest to lowest):
    /// 1. `GITSHIFT_DB_PATH` env var
    /// 2. Config files (`config/default.toml`, `config/{run_mode}.toml`)
    /// 3. Hardcoded defaults
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let mut builder = Config::builder()
            .set_default("database.path", "data/gitshift.db")?
            .set_default("migration.workers", 4)?
            .set_default("migration.poll_interval_seconds", 5)?
            .set_default("migration.poll_backoff_base_ms", 1000)?
            .set_default("migration.poll_backoff_cap_ms", 30_000)?
            .set_default("migration.dry_run_deadline_seconds", 6 * 3600)?
            .set_default("migration.production_deadline_seconds", 24 * 3600)?
            .set_default("migration.dest_repo_exists_action", "fail")?
            .set_default("migration.visibility_handling.public_repos", "private")?
            .set_default("migration.visibility_handling.internal_repos", "private")?
            .set_default("discovery.workers", 4)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false));

        if let Ok(path) = env::var("GITSHIFT_DB_PATH") {
            builder = builder.set_override("database.path", path)?;
        }

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
#[allow(unsafe_code, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.migration.workers, 4);
        assert_eq!(config.migration.poll_interval_seconds, 5);
        assert_eq!(
            config.migration.dest_repo_exists_action,
            DestRepoExistsAction::Fail
        );
        assert_eq!(config.discovery.workers, 4);
    }

    #[test]
    fn test_worker_ceilings() {
        let mut config = AppConfig::default();
        config.migration.workers = 500;
        config.discovery.workers = 500;
        assert_eq!(config.migration.effective_workers(), MAX_MIGRATION_WORKERS);
        assert_eq!(config.discovery.effective_workers(), MAX_DISCOVERY_WORKERS);

        config.migration.workers = 0;
        assert_eq!(config.migration.effective_workers(), 1);
    }

    #[test]
    #[serial]
    fn test_db_path_env_override() {
        // SAFETY: Test code only, serialized test execution
        unsafe { std::env::set_var("GITSHIFT_DB_PATH", "/tmp/override.db") };
        let config = AppConfig::load().unwrap();
        assert_eq!(config.database.path, "/tmp/override.db");
        unsafe { std::env::remove_var("GITSHIFT_DB_PATH") };
    }

    #[test]
    #[serial]
    fn test_load_without_files_uses_defaults() {
        // SAFETY: Test code only, serialized test execution
        unsafe { std::env::remove_var("GITSHIFT_DB_PATH") };
        let config = AppConfig::load().unwrap();
        assert_eq!(config.database.path, "data/gitshift.db");
        assert_eq!(config.migration.production_deadline_seconds, 24 * 3600);
    }
}
