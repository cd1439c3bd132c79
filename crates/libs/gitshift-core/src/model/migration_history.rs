//! Append-only audit rows, one per state transition of a repository.
//! Never deleted except by cascade when the repository is deleted.

use crate::Result;
use crate::ctx::Ctx;
use crate::model::status::MigrationStatus;
use crate::model::{ModelManager, fmt_ts, now_utc, opt_text, parse_ts, parse_ts_opt};
use crate::types::{HistoryId, RepositoryId};
use chrono::NaiveDateTime;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct MigrationHistory {
    pub id: HistoryId,
    pub repository_id: RepositoryId,
    pub phase: String,
    pub status: MigrationStatus,
    pub message: Option<String>,
    pub error_message: Option<String>,
    pub started_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct HistoryForCreate {
    pub repository_id: RepositoryId,
    pub phase: String,
    pub status: MigrationStatus,
    pub message: Option<String>,
    pub error_message: Option<String>,
    /// When the step began. The row's `completed_at` is stamped at insert
    /// time and `duration_seconds` derived from the two.
    pub started_at: NaiveDateTime,
}

pub struct MigrationHistoryBmc;

impl MigrationHistoryBmc {
    pub async fn create(
        _ctx: &Ctx,
        mm: &ModelManager,
        history_c: HistoryForCreate,
    ) -> Result<HistoryId> {
        let db = mm.db();
        let completed = now_utc();
        let duration = (completed - history_c.started_at).num_seconds().max(0);

        let stmt = db
            .prepare(
                "INSERT INTO migration_history (
                    repository_id, phase, status, message, error_message,
                    started_at, completed_at, duration_seconds
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
            )
            .await?;
        let params: Vec<libsql::Value> = vec![
            history_c.repository_id.get().into(),
            history_c.phase.clone().into(),
            history_c.status.as_str().into(),
            opt_text(history_c.message),
            opt_text(history_c.error_message),
            fmt_ts(history_c.started_at).into(),
            fmt_ts(completed).into(),
            duration.into(),
        ];
        let mut rows = stmt.query(params).await?;

        if let Some(row) = rows.next().await? {
            Ok(HistoryId::new(row.get::<i64>(0)?))
        } else {
            Err(crate::Error::InvalidInput(
                "failed to record migration history".into(),
            ))
        }
    }

    /// History for one repository in transition order (append order).
    pub async fn list_for_repository(
        _ctx: &Ctx,
        mm: &ModelManager,
        repository_id: RepositoryId,
    ) -> Result<Vec<MigrationHistory>> {
        let db = mm.db();
        let stmt = db
            .prepare(
                "SELECT id, repository_id, phase, status, message, error_message,
                        started_at, completed_at, duration_seconds
                 FROM migration_history WHERE repository_id = ? ORDER BY id ASC",
            )
            .await?;
        let mut rows = stmt.query([repository_id.get()]).await?;

        let mut history = Vec::new();
        while let Some(row) = rows.next().await? {
            history.push(Self::from_row(row)?);
        }
        Ok(history)
    }

    fn from_row(row: libsql::Row) -> Result<MigrationHistory> {
        let status_str: String = row.get(3)?;
        let started_at_str: String = row.get(6)?;

        Ok(MigrationHistory {
            id: HistoryId::new(row.get(0)?),
            repository_id: RepositoryId::new(row.get(1)?),
            phase: row.get(2)?,
            status: MigrationStatus::parse(&status_str).unwrap_or(MigrationStatus::Pending),
            message: row.get(4)?,
            error_message: row.get(5)?,
            started_at: parse_ts(&started_at_str),
            completed_at: parse_ts_opt(row.get(7)?),
            duration_seconds: row.get(8)?,
        })
    }
}
