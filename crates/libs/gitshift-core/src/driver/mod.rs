//! Destination migration driver capability. The scheduler computes a
//! [`MigrationRequest`] (destination name, mapped visibility, merged
//! exclusions) and drives the opaque [`DriverTicket`] to a terminal
//! outcome; it never branches on the concrete driver behind the trait.

use crate::model::batch::MigrationApi;
use crate::model::repository::{ExcludeFlags, Repository, Visibility};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("unauthorized")]
    Unauthorized,

    #[error("transient error: {0}")]
    Transient(String),

    #[error("permanent error: {0}")]
    Permanent(String),
}

impl DriverError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Opaque handle identifying an in-flight destination operation. Drivers
/// are expected to return the same ticket when `start_*` is retried for
/// the same repository-in-phase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DriverTicket(String);

impl DriverTicket {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Result payload of a succeeded migration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationOutcome {
    pub destination_url: Option<String>,
    pub warnings: Vec<String>,
}

/// Poll state of a ticket.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Queued,
    Running,
    Succeeded(MigrationOutcome),
    Failed(String),
}

impl PollOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_))
    }
}

/// Outcome of a source-lock request. `Unsupported` is a permitted no-op
/// for drivers without GEI-style locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Locked,
    Unsupported,
}

/// Outcome of a destination deletion. `NotFound` is success for rollback
/// purposes: the destination is already gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Everything a driver needs to start one migration attempt, computed by
/// the scheduler from repository, batch and configuration.
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub repository: Repository,
    pub destination_full_name: String,
    pub target_visibility: Visibility,
    pub exclude: ExcludeFlags,
    pub migration_api: MigrationApi,
    pub dry_run: bool,
}

/// Capability set over the destination's migration service.
#[async_trait]
pub trait MigrationDriver: Send + Sync {
    /// Starts a non-destructive rehearsal. Idempotent per repo-in-phase.
    async fn start_dry_run(&self, req: &MigrationRequest) -> DriverResult<DriverTicket>;

    /// Starts a production migration. Idempotent per repo-in-phase.
    async fn start_production(&self, req: &MigrationRequest) -> DriverResult<DriverTicket>;

    /// Current state of an in-flight operation.
    async fn poll(&self, ticket: &DriverTicket) -> DriverResult<PollOutcome>;

    /// Whether the destination already has the target repository.
    async fn destination_exists(&self, req: &MigrationRequest) -> DriverResult<bool>;

    /// Locks the source repository for the duration of a production
    /// migration. No-op (`Unsupported`) permitted.
    async fn lock_source(&self, repo: &Repository) -> DriverResult<LockOutcome>;

    async fn unlock_source(&self, repo: &Repository) -> DriverResult<()>;

    /// Deletes the destination repository (rollback).
    async fn delete_destination(&self, repo: &Repository) -> DriverResult<DeleteOutcome>;
}
