//! # gitshift-core: migration orchestration domain logic
//!
//! `gitshift-core` contains the durable store, the discovery engine and the
//! migration scheduler that move repositories from GitHub Enterprise Server
//! or Azure DevOps into a destination GitHub organization.
//!
//! ## Architecture
//!
//! - **BMC layer**: stateless controllers for all database operations
//!   ([`model`]), one per entity, over a single SQLite store ([`store`]).
//! - **Capability traits**: the source platform ([`source::SourcePlatform`])
//!   and the destination migration service ([`driver::MigrationDriver`]) are
//!   polymorphic collaborators; the core never talks to a concrete API.
//! - **Discovery**: a bounded worker pool that enumerates a target, profiles
//!   every repository and upserts it idempotently ([`discovery`]).
//! - **Scheduler**: the per-repository state machine and the batch execution
//!   loop with claim/lease discipline ([`scheduler`]).
//!
//! ## Example
//!
//! ```no_run
//! use gitshift_core::model::{ModelManager, batch::BatchBmc};
//! use gitshift_core::ctx::Ctx;
//!
//! async fn example() -> gitshift_core::Result<()> {
//!     let config = std::sync::Arc::new(gitshift_common::AppConfig::default());
//!     let mm = ModelManager::new(config).await?;
//!     let ctx = Ctx::system();
//!
//!     let batches = BatchBmc::list(&ctx, &mm).await?;
//!     println!("{} batches", batches.len());
//!     Ok(())
//! }
//! ```

/// Initiator context threaded through all store operations.
pub mod ctx;

/// Discovery engine: enumeration, profiling, complexity scoring.
pub mod discovery;

/// Destination migration driver capability.
pub mod driver;

/// Error types and Result alias.
pub mod error;

/// Backend Model Controllers (BMC) and data models for all entities.
pub mod model;

/// Batch execution loop, phase tasks and operator commands.
pub mod scheduler;

/// Source platform capability.
pub mod source;

/// Low-level database access and schema migrations.
pub mod store;

/// Strong newtypes for domain identifiers.
pub mod types;

// Re-export core types
pub use ctx::Ctx;
pub use error::{Error, Result};
pub use model::ModelManager;
