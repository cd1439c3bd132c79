//! # Model Layer - BMC Pattern Implementation
//!
//! Each entity has:
//! - **Data struct**: serializable model (e.g. `Repository`, `Batch`)
//! - **ForCreate / ForUpdate structs**: inputs for write operations
//! - **Bmc struct**: stateless controller with async CRUD methods
//!
//! | BMC | Description |
//! |-----|-------------|
//! | `source::SourceBmc` | Configured origin systems |
//! | `repository::RepositoryBmc` | Repositories, claims, transitions |
//! | `batch::BatchBmc` | Batch grouping and derived status |
//! | `migration_history::MigrationHistoryBmc` | Append-only audit rows |
//! | `migration_log::MigrationLogBmc` | Fine-grained append-only logs |
//! | `discovery_progress::DiscoveryProgressBmc` | Discovery run progress |
//!
//! The [`ModelManager`] owns the database connection; every other component
//! borrows rows via the BMCs and mutates only through them.

pub mod batch;
pub mod discovery_progress;
pub mod filter;
pub mod migration_history;
pub mod migration_log;
pub mod repository;
pub mod source;
pub mod status;

use crate::Result;
use crate::store::{self, Db};
use chrono::NaiveDateTime;
use gitshift_common::AppConfig;
use std::sync::Arc;

/// Timestamp format used across the schema. UTC, second resolution.
pub(crate) const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub(crate) fn now_utc() -> NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

pub(crate) fn fmt_ts(ts: NaiveDateTime) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub(crate) fn parse_ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, TS_FORMAT).unwrap_or_default()
}

pub(crate) fn parse_ts_opt(s: Option<String>) -> Option<NaiveDateTime> {
    s.and_then(|s| NaiveDateTime::parse_from_str(&s, TS_FORMAT).ok())
}

/// NULL-safe text parameter.
pub(crate) fn opt_text(v: Option<String>) -> libsql::Value {
    v.map_or(libsql::Value::Null, libsql::Value::Text)
}

/// NULL-safe integer parameter.
pub(crate) fn opt_int(v: Option<i64>) -> libsql::Value {
    v.map_or(libsql::Value::Null, libsql::Value::Integer)
}

#[derive(Clone)]
pub struct ModelManager {
    pub(crate) db: Db,
    /// Application configuration.
    pub app_config: Arc<AppConfig>,
}

impl ModelManager {
    /// Constructor. Opens the database named by the configuration and
    /// applies pending schema migrations.
    pub async fn new(app_config: Arc<AppConfig>) -> Result<Self> {
        let db = store::new_db_pool(&app_config.database.path).await?;
        Ok(ModelManager { db, app_config })
    }

    /// Constructor for testing with a prepared connection.
    /// Public so integration tests can use it.
    pub fn new_for_test(db: Db, app_config: Arc<AppConfig>) -> Self {
        ModelManager { db, app_config }
    }

    /// Returns the db connection reference.
    /// (Only for the model layer)
    pub(in crate::model) fn db(&self) -> &Db {
        &self.db
    }

    /// Returns the db connection for integration tests.
    pub fn db_for_test(&self) -> &Db {
        &self.db
    }

    /// Health check - verify database connectivity.
    pub async fn health_check(&self) -> Result<bool> {
        let stmt = self.db.prepare("SELECT 1").await?;
        let mut rows = stmt.query(()).await?;
        Ok(rows.next().await?.is_some())
    }
}
