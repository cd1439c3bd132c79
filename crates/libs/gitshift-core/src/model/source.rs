//! Configured origin systems (GitHub Enterprise Server, Azure DevOps).

use crate::Result;
use crate::ctx::Ctx;
use crate::model::{ModelManager, fmt_ts, now_utc, opt_text, parse_ts, parse_ts_opt};
use crate::types::SourceId;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of source platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Github,
    AzureDevops,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::AzureDevops => "azuredevops",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "github" => Some(Self::Github),
            "azuredevops" => Some(Self::AzureDevops),
            _ => None,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub source_type: SourceType,
    pub base_url: String,
    /// Opaque credential material. Never logged.
    #[serde(skip_serializing)]
    pub token: Option<String>,
    #[serde(skip_serializing)]
    pub app_credentials: Option<String>,
    pub is_active: bool,
    pub repository_count: i64,
    pub last_sync_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceForCreate {
    pub name: String,
    pub source_type: SourceType,
    pub base_url: String,
    pub token: Option<String>,
    pub app_credentials: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceForUpdate {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub app_credentials: Option<String>,
    pub is_active: Option<bool>,
}

pub struct SourceBmc;

impl SourceBmc {
    pub async fn create(_ctx: &Ctx, mm: &ModelManager, source_c: SourceForCreate) -> Result<SourceId> {
        let db = mm.db();

        let stmt = db
            .prepare("SELECT 1 FROM sources WHERE name = ?")
            .await?;
        let mut rows = stmt.query([source_c.name.as_str()]).await?;
        if rows.next().await?.is_some() {
            return Err(crate::Error::AlreadyExists(format!(
                "source '{}'",
                source_c.name
            )));
        }

        let stmt = db
            .prepare(
                "INSERT INTO sources (name, source_type, base_url, token, app_credentials)
                 VALUES (?, ?, ?, ?, ?) RETURNING id",
            )
            .await?;
        let params: Vec<libsql::Value> = vec![
            source_c.name.clone().into(),
            source_c.source_type.as_str().into(),
            source_c.base_url.clone().into(),
            opt_text(source_c.token.clone()),
            opt_text(source_c.app_credentials.clone()),
        ];
        let mut rows = stmt.query(params).await?;

        if let Some(row) = rows.next().await? {
            Ok(SourceId::new(row.get::<i64>(0)?))
        } else {
            Err(crate::Error::InvalidInput("failed to create source".into()))
        }
    }

    pub async fn get(_ctx: &Ctx, mm: &ModelManager, id: SourceId) -> Result<Source> {
        let db = mm.db();
        let stmt = db
            .prepare(
                "SELECT id, name, source_type, base_url, token, app_credentials,
                        is_active, repository_count, last_sync_at, created_at
                 FROM sources WHERE id = ?",
            )
            .await?;
        let mut rows = stmt.query([id.get()]).await?;

        if let Some(row) = rows.next().await? {
            Self::from_row(row)
        } else {
            Err(crate::Error::SourceNotFound(id.get()))
        }
    }

    pub async fn list(_ctx: &Ctx, mm: &ModelManager) -> Result<Vec<Source>> {
        let db = mm.db();
        let stmt = db
            .prepare(
                "SELECT id, name, source_type, base_url, token, app_credentials,
                        is_active, repository_count, last_sync_at, created_at
                 FROM sources ORDER BY name",
            )
            .await?;
        let mut rows = stmt.query(()).await?;

        let mut sources = Vec::new();
        while let Some(row) = rows.next().await? {
            sources.push(Self::from_row(row)?);
        }
        Ok(sources)
    }

    pub async fn update(
        _ctx: &Ctx,
        mm: &ModelManager,
        id: SourceId,
        source_u: SourceForUpdate,
    ) -> Result<()> {
        let db = mm.db();

        let mut sets: Vec<String> = Vec::new();
        let mut params: Vec<libsql::Value> = Vec::new();
        if let Some(name) = source_u.name {
            sets.push("name = ?".into());
            params.push(name.into());
        }
        if let Some(base_url) = source_u.base_url {
            sets.push("base_url = ?".into());
            params.push(base_url.into());
        }
        if let Some(token) = source_u.token {
            sets.push("token = ?".into());
            params.push(token.into());
        }
        if let Some(creds) = source_u.app_credentials {
            sets.push("app_credentials = ?".into());
            params.push(creds.into());
        }
        if let Some(is_active) = source_u.is_active {
            sets.push("is_active = ?".into());
            params.push(i64::from(is_active).into());
        }
        if sets.is_empty() {
            return Ok(());
        }
        params.push(id.get().into());

        let sql = format!("UPDATE sources SET {} WHERE id = ?", sets.join(", "));
        let stmt = db.prepare(&sql).await?;
        let changed = stmt.execute(params).await?;
        if changed == 0 {
            return Err(crate::Error::SourceNotFound(id.get()));
        }
        Ok(())
    }

    /// Deletes a source. Rejected while any repository references it.
    pub async fn delete(_ctx: &Ctx, mm: &ModelManager, id: SourceId) -> Result<()> {
        let db = mm.db();

        let stmt = db
            .prepare("SELECT COUNT(*) FROM repositories WHERE source_id = ?")
            .await?;
        let mut rows = stmt.query([id.get()]).await?;
        if let Some(row) = rows.next().await? {
            let count: i64 = row.get(0)?;
            if count > 0 {
                return Err(crate::Error::IntegrityError(format!(
                    "source {id} still referenced by {count} repositories"
                )));
            }
        }

        let stmt = db.prepare("DELETE FROM sources WHERE id = ?").await?;
        let changed = stmt.execute([id.get()]).await?;
        if changed == 0 {
            return Err(crate::Error::SourceNotFound(id.get()));
        }
        Ok(())
    }

    /// Bumps `last_sync_at` and the denormalised repository count after a
    /// discovery run.
    pub async fn touch_sync(_ctx: &Ctx, mm: &ModelManager, id: SourceId) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare(
                "UPDATE sources
                 SET last_sync_at = ?,
                     repository_count = (SELECT COUNT(*) FROM repositories WHERE source_id = ?)
                 WHERE id = ?",
            )
            .await?;
        stmt.execute((fmt_ts(now_utc()), id.get(), id.get())).await?;
        Ok(())
    }

    fn from_row(row: libsql::Row) -> Result<Source> {
        let source_type_str: String = row.get(2)?;
        let created_at_str: String = row.get(9)?;

        Ok(Source {
            id: SourceId::new(row.get(0)?),
            name: row.get(1)?,
            source_type: SourceType::parse(&source_type_str).unwrap_or(SourceType::Github),
            base_url: row.get(3)?,
            token: row.get(4)?,
            app_credentials: row.get(5)?,
            is_active: row.get::<i64>(6)? != 0,
            repository_count: row.get(7)?,
            last_sync_at: parse_ts_opt(row.get(8)?),
            created_at: parse_ts(&created_at_str),
        })
    }
}
