//! Discovery run progress. One row per run, written by a single writer
//! (the engine's progress task); reads are eventually consistent.

use crate::Result;
use crate::ctx::Ctx;
use crate::model::{ModelManager, fmt_ts, now_utc, opt_text, parse_ts, parse_ts_opt};
use crate::types::DiscoveryId;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStatus {
    InProgress,
    Completed,
    Failed,
}

impl DiscoveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for DiscoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryProgress {
    pub id: DiscoveryId,
    pub discovery_type: String,
    pub target: String,
    pub status: DiscoveryStatus,
    pub started_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
    pub total_orgs: i64,
    pub processed_orgs: i64,
    pub current_org: Option<String>,
    pub total_repos: i64,
    pub processed_repos: i64,
    pub phase: Option<String>,
    pub error_count: i64,
    pub last_error: Option<String>,
    /// Errors recorded against refs that never made it into the store.
    pub errors: Vec<String>,
}

/// Mutable counters flushed by the engine's single progress writer.
#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    pub total_orgs: i64,
    pub processed_orgs: i64,
    pub current_org: Option<String>,
    pub total_repos: i64,
    pub processed_repos: i64,
    pub phase: Option<String>,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub errors: Vec<String>,
}

pub struct DiscoveryProgressBmc;

impl DiscoveryProgressBmc {
    pub async fn create(
        _ctx: &Ctx,
        mm: &ModelManager,
        discovery_type: &str,
        target: &str,
    ) -> Result<DiscoveryId> {
        let db = mm.db();
        let stmt = db
            .prepare(
                "INSERT INTO discovery_progress (discovery_type, target, started_at, errors)
                 VALUES (?, ?, ?, '[]') RETURNING id",
            )
            .await?;
        let mut rows = stmt
            .query((discovery_type, target, fmt_ts(now_utc())))
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(DiscoveryId::new(row.get::<i64>(0)?))
        } else {
            Err(crate::Error::InvalidInput(
                "failed to create discovery progress".into(),
            ))
        }
    }

    pub async fn update(
        _ctx: &Ctx,
        mm: &ModelManager,
        id: DiscoveryId,
        snapshot: &ProgressSnapshot,
    ) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare(
                "UPDATE discovery_progress
                 SET total_orgs = ?, processed_orgs = ?, current_org = ?, total_repos = ?,
                     processed_repos = ?, phase = ?, error_count = ?, last_error = ?,
                     errors = ?
                 WHERE id = ?",
            )
            .await?;
        let params: Vec<libsql::Value> = vec![
            snapshot.total_orgs.into(),
            snapshot.processed_orgs.into(),
            opt_text(snapshot.current_org.clone()),
            snapshot.total_repos.into(),
            snapshot.processed_repos.into(),
            opt_text(snapshot.phase.clone()),
            snapshot.error_count.into(),
            opt_text(snapshot.last_error.clone()),
            serde_json::to_string(&snapshot.errors)?.into(),
            id.get().into(),
        ];
        stmt.execute(params).await?;
        Ok(())
    }

    /// Marks the run terminal.
    pub async fn complete(
        ctx: &Ctx,
        mm: &ModelManager,
        id: DiscoveryId,
        status: DiscoveryStatus,
        snapshot: &ProgressSnapshot,
    ) -> Result<()> {
        Self::update(ctx, mm, id, snapshot).await?;

        let db = mm.db();
        let stmt = db
            .prepare("UPDATE discovery_progress SET status = ?, completed_at = ? WHERE id = ?")
            .await?;
        stmt.execute((status.as_str(), fmt_ts(now_utc()), id.get()))
            .await?;
        Ok(())
    }

    pub async fn get(_ctx: &Ctx, mm: &ModelManager, id: DiscoveryId) -> Result<DiscoveryProgress> {
        let db = mm.db();
        let sql = format!("{SELECT_SQL} WHERE id = ?");
        let stmt = db.prepare(&sql).await?;
        let mut rows = stmt.query([id.get()]).await?;
        if let Some(row) = rows.next().await? {
            Self::from_row(row)
        } else {
            Err(crate::Error::InvalidInput(format!(
                "discovery run {id} not found"
            )))
        }
    }

    /// The most recent run, if any.
    pub async fn latest(_ctx: &Ctx, mm: &ModelManager) -> Result<Option<DiscoveryProgress>> {
        let db = mm.db();
        let sql = format!("{SELECT_SQL} ORDER BY id DESC LIMIT 1");
        let stmt = db.prepare(&sql).await?;
        let mut rows = stmt.query(()).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::from_row(row)?)),
            None => Ok(None),
        }
    }

    fn from_row(row: libsql::Row) -> Result<DiscoveryProgress> {
        let status_str: String = row.get(3)?;
        let started_at_str: String = row.get(4)?;
        let errors_json: Option<String> = row.get(13)?;

        Ok(DiscoveryProgress {
            id: DiscoveryId::new(row.get(0)?),
            discovery_type: row.get(1)?,
            target: row.get(2)?,
            status: DiscoveryStatus::parse(&status_str).unwrap_or(DiscoveryStatus::InProgress),
            started_at: parse_ts(&started_at_str),
            completed_at: parse_ts_opt(row.get(5)?),
            total_orgs: row.get(6)?,
            processed_orgs: row.get(7)?,
            current_org: row.get(8)?,
            total_repos: row.get(9)?,
            processed_repos: row.get(10)?,
            phase: row.get(11)?,
            error_count: row.get(12)?,
            last_error: row.get(14)?,
            errors: errors_json
                .and_then(|j| serde_json::from_str(&j).ok())
                .unwrap_or_default(),
        })
    }
}

const SELECT_SQL: &str = "SELECT id, discovery_type, target, status, started_at, completed_at, \
     total_orgs, processed_orgs, current_org, total_repos, processed_repos, phase, \
     error_count, errors, last_error FROM discovery_progress";
