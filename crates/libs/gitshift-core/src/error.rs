//! Error types for gitshift-core operations.
//!
//! Errors fall into three groups:
//!
//! - **External errors**: wrapped errors from dependencies (libsql,
//!   serde_json, io) and from the source/driver collaborators
//! - **Store errors**: not-found, uniqueness and integrity violations
//! - **State-machine errors**: illegal transitions, locked repositories,
//!   batches in the wrong state

use crate::driver::DriverError;
use crate::model::status::{BatchStatus, MigrationStatus};
use crate::source::SourceError;
use strum_macros::AsRefStr;
use thiserror::Error;

/// The error type for gitshift-core operations.
#[derive(Debug, Error, AsRefStr)]
pub enum Error {
    // -- External errors from dependencies
    /// Database error from libsql. The store guarantees that no state
    /// transition was recorded when this surfaces.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] libsql::Error),

    #[error("Serde JSON Error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    /// Error surfaced by the source platform client.
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Error surfaced by the destination migration driver.
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    // -- Store errors
    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Batch not found: {0}")]
    BatchNotFound(i64),

    #[error("Source not found: {0}")]
    SourceNotFound(i64),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Referential integrity violation, e.g. saving a repository whose
    /// `source_id` does not exist.
    #[error("Integrity error: {0}")]
    IntegrityError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A concurrent writer changed the row between read and write.
    #[error("Concurrent update on {0}")]
    ConcurrentUpdate(String),

    // -- State-machine errors
    /// The state machine rejects the requested transition. Never retried
    /// automatically.
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: MigrationStatus,
        to: MigrationStatus,
    },

    /// The repository is locked for an in-flight destination operation.
    #[error("Repository is source-locked: {0}")]
    SourceLocked(String),

    /// The batch is not in a state that allows the requested operation.
    #[error("Batch {id} is in state {status}, operation not allowed")]
    InvalidBatchState { id: i64, status: BatchStatus },
}

/// A specialized [`Result`] type for gitshift-core operations.
pub type Result<T> = core::result::Result<T, Error>;
