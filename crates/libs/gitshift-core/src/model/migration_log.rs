//! Fine-grained append-only migration logs. A sink, not an event bus:
//! bounded retention is the operator's concern and reads are paginated.

use crate::Result;
use crate::ctx::Ctx;
use crate::model::{ModelManager, fmt_ts, now_utc, opt_int, opt_text, parse_ts};
use crate::types::{HistoryId, RepositoryId};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARN" => Some(Self::Warn),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationLog {
    pub id: i64,
    pub repository_id: RepositoryId,
    pub history_id: Option<HistoryId>,
    pub level: LogLevel,
    pub phase: Option<String>,
    pub operation: Option<String>,
    pub message: String,
    pub details: Option<Value>,
    pub initiated_by: Option<String>,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct LogForCreate {
    pub repository_id: RepositoryId,
    pub history_id: Option<HistoryId>,
    pub level: LogLevel,
    pub phase: Option<String>,
    pub operation: Option<String>,
    pub message: String,
    pub details: Option<Value>,
}

/// Filter for paginated log reads.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub repository_id: Option<RepositoryId>,
    pub level: Option<LogLevel>,
    pub phase: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub struct MigrationLogBmc;

impl MigrationLogBmc {
    pub async fn append(ctx: &Ctx, mm: &ModelManager, log_c: LogForCreate) -> Result<i64> {
        let db = mm.db();

        let stmt = db
            .prepare(
                "INSERT INTO migration_logs (
                    repository_id, history_id, level, phase, operation, message,
                    details, initiated_by, timestamp
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
            )
            .await?;
        let params: Vec<libsql::Value> = vec![
            log_c.repository_id.get().into(),
            opt_int(log_c.history_id.map(HistoryId::get)),
            log_c.level.as_str().into(),
            opt_text(log_c.phase),
            opt_text(log_c.operation),
            log_c.message.clone().into(),
            opt_text(log_c.details.map(|d| d.to_string())),
            ctx.initiator().to_string().into(),
            fmt_ts(now_utc()).into(),
        ];
        let mut rows = stmt.query(params).await?;

        if let Some(row) = rows.next().await? {
            Ok(row.get(0)?)
        } else {
            Err(crate::Error::InvalidInput("failed to append log".into()))
        }
    }

    /// Logs in insertion order: `(timestamp, id)` ascending.
    pub async fn list(_ctx: &Ctx, mm: &ModelManager, filter: &LogFilter) -> Result<Vec<MigrationLog>> {
        let db = mm.db();

        let mut clauses: Vec<&str> = Vec::new();
        let mut params: Vec<libsql::Value> = Vec::new();
        if let Some(repository_id) = filter.repository_id {
            clauses.push("repository_id = ?");
            params.push(repository_id.get().into());
        }
        if let Some(level) = filter.level {
            clauses.push("level = ?");
            params.push(level.as_str().into());
        }
        if let Some(phase) = &filter.phase {
            clauses.push("phase = ?");
            params.push(phase.clone().into());
        }

        let mut sql = String::from(
            "SELECT id, repository_id, history_id, level, phase, operation, message,
                    details, initiated_by, timestamp
             FROM migration_logs",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC");
        match (filter.limit, filter.offset) {
            (Some(limit), Some(offset)) => {
                sql.push_str(" LIMIT ? OFFSET ?");
                params.push(limit.into());
                params.push(offset.into());
            }
            (Some(limit), None) => {
                sql.push_str(" LIMIT ?");
                params.push(limit.into());
            }
            // Negative limit is SQLite's "unbounded", so a bare offset
            // still takes effect.
            (None, Some(offset)) => {
                sql.push_str(" LIMIT -1 OFFSET ?");
                params.push(offset.into());
            }
            (None, None) => {}
        }

        let stmt = db.prepare(&sql).await?;
        let mut rows = stmt.query(params).await?;

        let mut logs = Vec::new();
        while let Some(row) = rows.next().await? {
            logs.push(Self::from_row(row)?);
        }
        Ok(logs)
    }

    fn from_row(row: libsql::Row) -> Result<MigrationLog> {
        let level_str: String = row.get(3)?;
        let details: Option<String> = row.get(7)?;
        let timestamp_str: String = row.get(9)?;

        Ok(MigrationLog {
            id: row.get(0)?,
            repository_id: RepositoryId::new(row.get(1)?),
            history_id: row.get::<Option<i64>>(2)?.map(HistoryId::new),
            level: LogLevel::parse(&level_str).unwrap_or(LogLevel::Info),
            phase: row.get(4)?,
            operation: row.get(5)?,
            message: row.get(6)?,
            details: details.and_then(|d| serde_json::from_str(&d).ok()),
            initiated_by: row.get(8)?,
            timestamp: parse_ts(&timestamp_str),
        })
    }
}
