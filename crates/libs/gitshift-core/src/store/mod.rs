//! Low-level database access for gitshift-core.
//!
//! The store is SQLite via libsql, configured for concurrent workers:
//! WAL mode so readers do not block the single writer, a generous busy
//! timeout for lock contention, and foreign keys enforced. Schema
//! migrations are linear and forward-only; the applied set is recorded in
//! `schema_migrations`.

use crate::Result;
use libsql::{Builder, Connection};
use std::path::Path;
use tracing::info;

/// Type alias for database connections.
pub type Db = Connection;

/// Schema migrations in application order. Forward-only; never reordered.
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_initial_schema",
    include_str!("../../../../../migrations/001_initial_schema.sql"),
)];

/// Opens (or creates) the database at `path` and brings the schema up to
/// date.
pub async fn new_db_pool(path: impl AsRef<Path>) -> Result<Db> {
    let db_path = path.as_ref();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Builder::new_local(db_path).build().await?;
    let conn = db.connect()?;

    // WAL: concurrent reads during writes. busy_timeout: wait out writer
    // contention instead of failing. synchronous=NORMAL is safe with WAL.
    let _ = conn.execute("PRAGMA journal_mode=WAL;", ()).await;
    let _ = conn.execute("PRAGMA busy_timeout=30000;", ()).await;
    let _ = conn.execute("PRAGMA synchronous=NORMAL;", ()).await;
    let _ = conn.execute("PRAGMA foreign_keys=ON;", ()).await;

    apply_migrations(&conn).await?;

    Ok(conn)
}

/// Applies any migration not yet recorded in `schema_migrations`.
pub async fn apply_migrations(conn: &Db) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S', 'now'))
        );",
    )
    .await?;

    for (version, sql) in MIGRATIONS {
        let stmt = conn
            .prepare("SELECT 1 FROM schema_migrations WHERE version = ?")
            .await?;
        let mut rows = stmt.query([*version]).await?;
        if rows.next().await?.is_some() {
            continue;
        }

        conn.execute_batch(sql).await?;
        conn.execute(
            "INSERT INTO schema_migrations (version) VALUES (?)",
            [*version],
        )
        .await?;
        info!(version, "applied schema migration");
    }

    Ok(())
}
