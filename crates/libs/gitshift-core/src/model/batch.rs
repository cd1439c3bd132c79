//! Batch grouping: named collections of repositories that share execution
//! intent. Batch status is derived from member statuses and recomputed
//! after every transition that touches a member.

use crate::Result;
use crate::ctx::Ctx;
use crate::model::repository::ExcludeFlags;
use crate::model::status::{BatchStatus, MigrationStatus, reduce_batch_status};
use crate::model::{ModelManager, fmt_ts, now_utc, opt_text, parse_ts, parse_ts_opt};
use crate::types::{BatchId, RepositoryId};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Destination migration API used for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MigrationApi {
    #[default]
    #[serde(rename = "GEI")]
    Gei,
    #[serde(rename = "ELM")]
    Elm,
}

impl MigrationApi {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gei => "GEI",
            Self::Elm => "ELM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GEI" => Some(Self::Gei),
            "ELM" => Some(Self::Elm),
            _ => None,
        }
    }
}

impl fmt::Display for MigrationApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub name: String,
    pub description: Option<String>,
    pub batch_type: Option<String>,
    pub status: BatchStatus,
    pub destination_org: Option<String>,
    pub migration_api: MigrationApi,
    pub exclude: ExcludeFlags,
    pub created_at: NaiveDateTime,
    pub scheduled_at: Option<NaiveDateTime>,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub last_dry_run_at: Option<NaiveDateTime>,
    pub last_migration_attempt_at: Option<NaiveDateTime>,
    pub repository_count: i64,
}

impl Batch {
    /// Whether `StartBatch` marked this batch for production execution, in
    /// which case the scheduler advances completed dry-runs into
    /// `pre_migration` automatically.
    pub fn production_intent(&self) -> bool {
        self.last_migration_attempt_at.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchForCreate {
    pub name: String,
    pub description: Option<String>,
    pub batch_type: Option<String>,
    pub destination_org: Option<String>,
    #[serde(default)]
    pub migration_api: MigrationApi,
    #[serde(default)]
    pub exclude: ExcludeFlags,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchForUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub batch_type: Option<String>,
    pub destination_org: Option<String>,
    pub migration_api: Option<MigrationApi>,
    pub exclude: Option<ExcludeFlags>,
    pub scheduled_at: Option<NaiveDateTime>,
}

/// Per-id outcome of a membership change.
#[derive(Debug, Clone, Serialize)]
pub struct MemberChange {
    pub id: RepositoryId,
    pub applied: bool,
    pub reason: Option<String>,
}

const BATCH_COLUMNS: &str = "\
    id, name, description, batch_type, status, destination_org, migration_api, \
    exclude_releases, exclude_attachments, exclude_metadata, exclude_git_data, \
    exclude_owner_projects, created_at, scheduled_at, started_at, completed_at, \
    last_dry_run_at, last_migration_attempt_at, repository_count";

pub struct BatchBmc;

impl BatchBmc {
    pub async fn create(_ctx: &Ctx, mm: &ModelManager, batch_c: BatchForCreate) -> Result<BatchId> {
        let db = mm.db();

        let stmt = db.prepare("SELECT 1 FROM batches WHERE name = ?").await?;
        let mut rows = stmt.query([batch_c.name.as_str()]).await?;
        if rows.next().await?.is_some() {
            return Err(crate::Error::AlreadyExists(format!(
                "batch '{}'",
                batch_c.name
            )));
        }

        let stmt = db
            .prepare(
                "INSERT INTO batches (
                    name, description, batch_type, destination_org, migration_api,
                    exclude_releases, exclude_attachments, exclude_metadata,
                    exclude_git_data, exclude_owner_projects
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
            )
            .await?;
        let params: Vec<libsql::Value> = vec![
            batch_c.name.clone().into(),
            opt_text(batch_c.description),
            opt_text(batch_c.batch_type),
            opt_text(batch_c.destination_org),
            batch_c.migration_api.as_str().into(),
            i64::from(batch_c.exclude.releases).into(),
            i64::from(batch_c.exclude.attachments).into(),
            i64::from(batch_c.exclude.metadata).into(),
            i64::from(batch_c.exclude.git_data).into(),
            i64::from(batch_c.exclude.owner_projects).into(),
        ];
        let mut rows = stmt.query(params).await?;

        if let Some(row) = rows.next().await? {
            Ok(BatchId::new(row.get::<i64>(0)?))
        } else {
            Err(crate::Error::InvalidInput("failed to create batch".into()))
        }
    }

    pub async fn get(_ctx: &Ctx, mm: &ModelManager, id: BatchId) -> Result<Batch> {
        let db = mm.db();
        let sql = format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = ?");
        let stmt = db.prepare(&sql).await?;
        let mut rows = stmt.query([id.get()]).await?;

        if let Some(row) = rows.next().await? {
            Self::from_row(row)
        } else {
            Err(crate::Error::BatchNotFound(id.get()))
        }
    }

    pub async fn list(_ctx: &Ctx, mm: &ModelManager) -> Result<Vec<Batch>> {
        let db = mm.db();
        let sql = format!("SELECT {BATCH_COLUMNS} FROM batches ORDER BY created_at DESC, id DESC");
        let stmt = db.prepare(&sql).await?;
        let mut rows = stmt.query(()).await?;

        let mut batches = Vec::new();
        while let Some(row) = rows.next().await? {
            batches.push(Self::from_row(row)?);
        }
        Ok(batches)
    }

    pub async fn update(
        _ctx: &Ctx,
        mm: &ModelManager,
        id: BatchId,
        batch_u: BatchForUpdate,
    ) -> Result<()> {
        let db = mm.db();

        let mut sets: Vec<String> = Vec::new();
        let mut params: Vec<libsql::Value> = Vec::new();
        if let Some(name) = batch_u.name {
            sets.push("name = ?".into());
            params.push(name.into());
        }
        if let Some(description) = batch_u.description {
            sets.push("description = ?".into());
            params.push(description.into());
        }
        if let Some(batch_type) = batch_u.batch_type {
            sets.push("batch_type = ?".into());
            params.push(batch_type.into());
        }
        if let Some(destination_org) = batch_u.destination_org {
            sets.push("destination_org = ?".into());
            params.push(destination_org.into());
        }
        if let Some(api) = batch_u.migration_api {
            sets.push("migration_api = ?".into());
            params.push(api.as_str().into());
        }
        if let Some(ex) = batch_u.exclude {
            sets.push("exclude_releases = ?".into());
            params.push(i64::from(ex.releases).into());
            sets.push("exclude_attachments = ?".into());
            params.push(i64::from(ex.attachments).into());
            sets.push("exclude_metadata = ?".into());
            params.push(i64::from(ex.metadata).into());
            sets.push("exclude_git_data = ?".into());
            params.push(i64::from(ex.git_data).into());
            sets.push("exclude_owner_projects = ?".into());
            params.push(i64::from(ex.owner_projects).into());
        }
        if let Some(scheduled_at) = batch_u.scheduled_at {
            sets.push("scheduled_at = ?".into());
            params.push(fmt_ts(scheduled_at).into());
        }
        if sets.is_empty() {
            return Ok(());
        }
        params.push(id.get().into());

        let sql = format!("UPDATE batches SET {} WHERE id = ?", sets.join(", "));
        let stmt = db.prepare(&sql).await?;
        let changed = stmt.execute(params).await?;
        if changed == 0 {
            return Err(crate::Error::BatchNotFound(id.get()));
        }
        Ok(())
    }

    /// Deletes a batch. Rejected while members remain or a run is in
    /// progress.
    pub async fn delete(ctx: &Ctx, mm: &ModelManager, id: BatchId) -> Result<()> {
        let batch = Self::get(ctx, mm, id).await?;
        if batch.status == BatchStatus::InProgress {
            return Err(crate::Error::InvalidBatchState {
                id: id.get(),
                status: batch.status,
            });
        }

        let db = mm.db();
        let stmt = db
            .prepare("SELECT COUNT(*) FROM repositories WHERE batch_id = ?")
            .await?;
        let mut rows = stmt.query([id.get()]).await?;
        if let Some(row) = rows.next().await? {
            let members: i64 = row.get(0)?;
            if members > 0 {
                return Err(crate::Error::InvalidInput(format!(
                    "batch {id} still has {members} repositories"
                )));
            }
        }

        let stmt = db.prepare("DELETE FROM batches WHERE id = ?").await?;
        stmt.execute([id.get()]).await?;
        Ok(())
    }

    /// Adds repositories to the batch. Only repositories with no current
    /// batch move; everything else is reported as skipped.
    pub async fn add_repositories(
        ctx: &Ctx,
        mm: &ModelManager,
        id: BatchId,
        repo_ids: &[RepositoryId],
    ) -> Result<Vec<MemberChange>> {
        // Existence check up front so unknown batches fail loudly.
        let _ = Self::get(ctx, mm, id).await?;
        let db = mm.db();

        let mut changes = Vec::with_capacity(repo_ids.len());
        for repo_id in repo_ids {
            let stmt = db
                .prepare(
                    "UPDATE repositories SET batch_id = ?, updated_at = ?
                     WHERE id = ? AND batch_id IS NULL",
                )
                .await?;
            let changed = stmt
                .execute((id.get(), fmt_ts(now_utc()), repo_id.get()))
                .await?;
            changes.push(MemberChange {
                id: *repo_id,
                applied: changed == 1,
                reason: (changed == 0)
                    .then(|| "not found or already in a batch".to_string()),
            });
        }

        Self::refresh_repository_count(mm, id).await?;
        Ok(changes)
    }

    /// Removes repositories whose current batch is this one.
    pub async fn remove_repositories(
        _ctx: &Ctx,
        mm: &ModelManager,
        id: BatchId,
        repo_ids: &[RepositoryId],
    ) -> Result<Vec<MemberChange>> {
        let db = mm.db();

        let mut changes = Vec::with_capacity(repo_ids.len());
        for repo_id in repo_ids {
            let stmt = db
                .prepare(
                    "UPDATE repositories SET batch_id = NULL, updated_at = ?
                     WHERE id = ? AND batch_id = ?",
                )
                .await?;
            let changed = stmt
                .execute((fmt_ts(now_utc()), repo_id.get(), id.get()))
                .await?;
            changes.push(MemberChange {
                id: *repo_id,
                applied: changed == 1,
                reason: (changed == 0).then(|| "not a member of this batch".to_string()),
            });
        }

        Self::refresh_repository_count(mm, id).await?;
        Ok(changes)
    }

    pub async fn member_statuses(
        _ctx: &Ctx,
        mm: &ModelManager,
        id: BatchId,
    ) -> Result<Vec<MigrationStatus>> {
        let db = mm.db();
        let stmt = db
            .prepare("SELECT status FROM repositories WHERE batch_id = ?")
            .await?;
        let mut rows = stmt.query([id.get()]).await?;

        let mut statuses = Vec::new();
        while let Some(row) = rows.next().await? {
            let s: String = row.get(0)?;
            if let Some(status) = MigrationStatus::parse(&s) {
                statuses.push(status);
            }
        }
        Ok(statuses)
    }

    /// Recomputes the derived batch status from member statuses. Sets
    /// `completed_at` when the batch settles and clears it when it starts
    /// moving again.
    pub async fn recompute_status(ctx: &Ctx, mm: &ModelManager, id: BatchId) -> Result<BatchStatus> {
        let batch = Self::get(ctx, mm, id).await?;
        let members = Self::member_statuses(ctx, mm, id).await?;
        let status = reduce_batch_status(&members, batch.started_at.is_some());

        let db = mm.db();
        let completed = matches!(
            status,
            BatchStatus::Completed | BatchStatus::CompletedWithErrors
        );
        let stmt = db
            .prepare(
                "UPDATE batches SET status = ?,
                     completed_at = CASE
                         WHEN ? THEN COALESCE(completed_at, ?)
                         ELSE NULL
                     END
                 WHERE id = ?",
            )
            .await?;
        stmt.execute((
            status.as_str(),
            i64::from(completed),
            fmt_ts(now_utc()),
            id.get(),
        ))
        .await?;
        Ok(status)
    }

    /// Stamps the run timestamps when a batch starts executing.
    pub async fn mark_started(
        _ctx: &Ctx,
        mm: &ModelManager,
        id: BatchId,
        production: bool,
    ) -> Result<()> {
        let db = mm.db();
        let now = fmt_ts(now_utc());
        let column = if production {
            "last_migration_attempt_at"
        } else {
            "last_dry_run_at"
        };
        let sql = format!(
            "UPDATE batches SET started_at = COALESCE(started_at, ?), {column} = ? WHERE id = ?"
        );
        let stmt = db.prepare(&sql).await?;
        stmt.execute((now.clone(), now, id.get())).await?;
        Ok(())
    }

    /// Batches started for production whose members may need advancing.
    pub async fn production_intent_batches(_ctx: &Ctx, mm: &ModelManager) -> Result<Vec<Batch>> {
        let db = mm.db();
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM batches
             WHERE last_migration_attempt_at IS NOT NULL
               AND status IN ('ready', 'in_progress')"
        );
        let stmt = db.prepare(&sql).await?;
        let mut rows = stmt.query(()).await?;

        let mut batches = Vec::new();
        while let Some(row) = rows.next().await? {
            batches.push(Self::from_row(row)?);
        }
        Ok(batches)
    }

    async fn refresh_repository_count(mm: &ModelManager, id: BatchId) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare(
                "UPDATE batches
                 SET repository_count = (SELECT COUNT(*) FROM repositories WHERE batch_id = ?)
                 WHERE id = ?",
            )
            .await?;
        stmt.execute((id.get(), id.get())).await?;
        Ok(())
    }

    fn from_row(row: libsql::Row) -> Result<Batch> {
        let status_str: String = row.get(4)?;
        let api_str: String = row.get(6)?;
        let created_at_str: String = row.get(12)?;

        Ok(Batch {
            id: BatchId::new(row.get(0)?),
            name: row.get(1)?,
            description: row.get(2)?,
            batch_type: row.get(3)?,
            status: BatchStatus::parse(&status_str).unwrap_or(BatchStatus::Pending),
            destination_org: row.get(5)?,
            migration_api: MigrationApi::parse(&api_str).unwrap_or_default(),
            exclude: ExcludeFlags {
                releases: row.get::<i64>(7)? != 0,
                attachments: row.get::<i64>(8)? != 0,
                metadata: row.get::<i64>(9)? != 0,
                git_data: row.get::<i64>(10)? != 0,
                owner_projects: row.get::<i64>(11)? != 0,
            },
            created_at: parse_ts(&created_at_str),
            scheduled_at: parse_ts_opt(row.get(13)?),
            started_at: parse_ts_opt(row.get(14)?),
            completed_at: parse_ts_opt(row.get(15)?),
            last_dry_run_at: parse_ts_opt(row.get(16)?),
            last_migration_attempt_at: parse_ts_opt(row.get(17)?),
            repository_count: row.get(18)?,
        })
    }
}
