//! Placeholder collaborators for deployments where no destination driver
//! or source clients are wired in. Every externally-facing call reports
//! the missing configuration; store-facing commands work normally.

use async_trait::async_trait;
use gitshift_core::driver::{
    DeleteOutcome, DriverError, DriverResult, DriverTicket, LockOutcome, MigrationDriver,
    MigrationRequest, PollOutcome,
};
use gitshift_core::model::repository::Repository;
use gitshift_core::model::source::Source;
use gitshift_core::source::{SourceError, SourcePlatform, SourceProvider, SourceResult};
use std::sync::Arc;

pub struct UnconfiguredDriver;

fn not_configured() -> DriverError {
    DriverError::Permanent("no migration driver configured".to_string())
}

#[async_trait]
impl MigrationDriver for UnconfiguredDriver {
    async fn start_dry_run(&self, _req: &MigrationRequest) -> DriverResult<DriverTicket> {
        Err(not_configured())
    }

    async fn start_production(&self, _req: &MigrationRequest) -> DriverResult<DriverTicket> {
        Err(not_configured())
    }

    async fn poll(&self, _ticket: &DriverTicket) -> DriverResult<PollOutcome> {
        Err(not_configured())
    }

    async fn destination_exists(&self, _req: &MigrationRequest) -> DriverResult<bool> {
        Err(not_configured())
    }

    async fn lock_source(&self, _repo: &Repository) -> DriverResult<LockOutcome> {
        Ok(LockOutcome::Unsupported)
    }

    async fn unlock_source(&self, _repo: &Repository) -> DriverResult<()> {
        Ok(())
    }

    async fn delete_destination(&self, _repo: &Repository) -> DriverResult<DeleteOutcome> {
        Err(not_configured())
    }
}

pub struct UnconfiguredSources;

impl SourceProvider for UnconfiguredSources {
    fn client_for(&self, source: &Source) -> SourceResult<Arc<dyn SourcePlatform>> {
        Err(SourceError::Permanent(format!(
            "no client configured for source '{}'",
            source.name
        )))
    }
}
