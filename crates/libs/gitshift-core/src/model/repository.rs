//! Repository entity: profile, migration-limit validations, scheduling
//! state, and the claim discipline that grants workers exclusive right to
//! advance a repository through one phase.

use crate::Result;
use crate::ctx::Ctx;
use crate::model::filter::RepositoryFilter;
use crate::model::status::{MigrationStatus, Phase, is_legal_transition};
use crate::model::{ModelManager, fmt_ts, now_utc, opt_int, opt_text, parse_ts, parse_ts_opt};
use crate::types::{BatchId, RepositoryId, SourceId};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Repository visibility at the source platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
    Internal,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Self::Public),
            "private" => Some(Self::Private),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size bucket derived from `size_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeCategory {
    Small,
    Medium,
    Large,
    VeryLarge,
}

impl SizeCategory {
    const MEDIUM_BYTES: i64 = 100 * 1024 * 1024;
    const LARGE_BYTES: i64 = 1024 * 1024 * 1024;
    const VERY_LARGE_BYTES: i64 = 5 * 1024 * 1024 * 1024;

    pub fn from_size_bytes(size: i64) -> Self {
        if size >= Self::VERY_LARGE_BYTES {
            Self::VeryLarge
        } else if size >= Self::LARGE_BYTES {
            Self::Large
        } else if size >= Self::MEDIUM_BYTES {
            Self::Medium
        } else {
            Self::Small
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::VeryLarge => "very_large",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "small" => Some(Self::Small),
            "medium" => Some(Self::Medium),
            "large" => Some(Self::Large),
            "very_large" => Some(Self::VeryLarge),
            _ => None,
        }
    }
}

/// Complexity bucket derived from the deterministic complexity score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
    VeryComplex,
}

impl Complexity {
    pub fn from_score(score: i64) -> Self {
        if score >= 30 {
            Self::VeryComplex
        } else if score >= 15 {
            Self::Complex
        } else if score >= 5 {
            Self::Medium
        } else {
            Self::Simple
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
            Self::VeryComplex => "very_complex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "simple" => Some(Self::Simple),
            "medium" => Some(Self::Medium),
            "complex" => Some(Self::Complex),
            "very_complex" => Some(Self::VeryComplex),
            _ => None,
        }
    }
}

/// Feature inventory populated by discovery. GHAS flags are `Option`
/// because the per-source discovery contract may fill them lazily.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureInventory {
    pub has_lfs: bool,
    pub has_submodules: bool,
    pub has_large_files: bool,
    pub has_actions: bool,
    pub has_pages: bool,
    pub has_wiki: bool,
    pub has_discussions: bool,
    pub has_projects: bool,
    pub has_packages: bool,
    pub has_code_scanning: Option<bool>,
    pub has_secret_scanning: Option<bool>,
    pub has_dependabot: Option<bool>,
    pub has_codeowners: bool,
    pub has_self_hosted_runners: bool,
    pub has_release_assets: bool,
    pub branch_protection_count: i64,
    pub ruleset_count: i64,
    pub webhook_count: i64,
    pub environment_count: i64,
    pub secret_count: i64,
    pub variable_count: i64,
}

/// Azure-DevOps-specific inventory. All counters lazy for GitHub sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdoInventory {
    pub is_tfvc: bool,
    pub pipeline_count: Option<i64>,
    pub board_count: Option<i64>,
    pub test_plan_count: Option<i64>,
    pub artifact_count: Option<i64>,
    pub wiki_count: Option<i64>,
}

/// Migration-limit validations: conditions that block a migration until
/// remediated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationLimits {
    pub has_oversized_commits: bool,
    pub oversized_commit_details: Option<Value>,
    pub has_long_refs: bool,
    pub long_ref_details: Option<Value>,
    pub has_blocking_files: bool,
    pub blocking_file_details: Option<Value>,
    pub is_oversized: bool,
    pub metadata_size_estimate: Option<i64>,
}

impl MigrationLimits {
    /// True when any validation blocks the migration.
    pub fn is_blocking(&self) -> bool {
        self.has_oversized_commits
            || self.has_long_refs
            || self.has_blocking_files
            || self.is_oversized
    }
}

/// Per-repository exclusion knobs passed to the migration driver.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExcludeFlags {
    pub releases: bool,
    pub attachments: bool,
    pub metadata: bool,
    pub git_data: bool,
    pub owner_projects: bool,
}

impl ExcludeFlags {
    /// Field-wise OR, used to merge batch defaults over repository flags.
    pub fn merged_with(self, other: ExcludeFlags) -> ExcludeFlags {
        ExcludeFlags {
            releases: self.releases || other.releases,
            attachments: self.attachments || other.attachments,
            metadata: self.metadata || other.metadata,
            git_data: self.git_data || other.git_data,
            owner_projects: self.owner_projects || other.owner_projects,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepositoryId,
    pub full_name: String,
    pub source_id: SourceId,
    pub organization: Option<String>,
    pub source_url: Option<String>,
    pub destination_full_name: Option<String>,
    pub destination_url: Option<String>,
    pub ado_organization: Option<String>,
    pub ado_project: Option<String>,

    pub visibility: Option<Visibility>,
    pub is_archived: bool,
    pub is_fork: bool,
    pub default_branch: Option<String>,
    pub primary_language: Option<String>,
    pub teams: Vec<String>,
    pub size_bytes: i64,
    pub size_category: Option<SizeCategory>,
    pub branch_count: i64,
    pub commit_count: i64,
    pub pull_request_count: i64,
    pub issue_count: i64,
    pub contributor_count: i64,
    pub release_count: i64,
    pub tag_count: i64,
    pub commits_last_12_weeks: Option<i64>,

    pub features: FeatureInventory,
    pub ado: AdoInventory,
    pub limits: MigrationLimits,

    pub complexity_score: i64,
    pub complexity: Option<Complexity>,
    pub complexity_breakdown: Option<Value>,

    pub status: MigrationStatus,
    pub batch_id: Option<BatchId>,
    pub priority: i64,
    pub is_source_locked: bool,
    pub exclude: ExcludeFlags,

    pub discovered_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub migrated_at: Option<NaiveDateTime>,
    pub last_discovery_at: Option<NaiveDateTime>,
    pub last_dry_run_at: Option<NaiveDateTime>,
    pub last_migration_attempt_at: Option<NaiveDateTime>,
}

impl Repository {
    /// Exclusion flags merged with a batch's defaults.
    pub fn effective_excludes(&self, batch_defaults: ExcludeFlags) -> ExcludeFlags {
        self.exclude.merged_with(batch_defaults)
    }
}

/// Key for repository lookups: unique `full_name` or integer id.
#[derive(Debug, Clone)]
pub enum RepoKey {
    FullName(String),
    Id(RepositoryId),
}

impl From<&str> for RepoKey {
    fn from(s: &str) -> Self {
        Self::FullName(s.to_string())
    }
}

impl From<RepositoryId> for RepoKey {
    fn from(id: RepositoryId) -> Self {
        Self::Id(id)
    }
}

/// Patch for scheduler-owned fields. Only fields present are applied;
/// status changes are validated against the state machine.
#[derive(Debug, Clone, Default)]
pub struct RepositoryForUpdate {
    pub status: Option<MigrationStatus>,
    pub destination_full_name: Option<String>,
    pub destination_url: Option<String>,
    pub priority: Option<i64>,
    pub is_source_locked: Option<bool>,
    pub migrated_at: Option<NaiveDateTime>,
    pub last_dry_run_at: Option<NaiveDateTime>,
    pub last_migration_attempt_at: Option<NaiveDateTime>,
    pub exclude: Option<ExcludeFlags>,
}

/// Column list shared by every SELECT/RETURNING so `from_row` has a single
/// index map.
pub(crate) const REPO_COLUMNS: &str = "\
    id, full_name, source_id, organization, source_url, destination_full_name, \
    destination_url, ado_organization, ado_project, visibility, is_archived, is_fork, \
    default_branch, primary_language, teams, size_bytes, size_category, branch_count, \
    commit_count, pull_request_count, issue_count, contributor_count, release_count, \
    tag_count, commits_last_12_weeks, has_lfs, has_submodules, has_large_files, \
    has_actions, has_pages, has_wiki, has_discussions, has_projects, has_packages, \
    has_code_scanning, has_secret_scanning, has_dependabot, has_codeowners, \
    has_self_hosted_runners, has_release_assets, branch_protection_count, ruleset_count, \
    webhook_count, environment_count, secret_count, variable_count, is_tfvc, \
    pipeline_count, board_count, test_plan_count, artifact_count, ado_wiki_count, \
    has_oversized_commits, oversized_commit_details, has_long_refs, long_ref_details, \
    has_blocking_files, blocking_file_details, is_oversized, metadata_size_estimate, \
    complexity_score, complexity, complexity_breakdown, status, batch_id, priority, \
    is_source_locked, exclude_releases, exclude_attachments, exclude_metadata, \
    exclude_git_data, exclude_owner_projects, discovered_at, updated_at, migrated_at, \
    last_discovery_at, last_dry_run_at, last_migration_attempt_at";

pub struct RepositoryBmc;

impl RepositoryBmc {
    /// Upserts a discovered profile by `full_name`.
    ///
    /// Discovery owns the profile fields and overwrites them on every run;
    /// scheduler-owned fields (status, batch, destination, priority, lock,
    /// exclusions, migration timestamps) are never touched. `discovered_at`
    /// is set on first insert only; `updated_at` and `last_discovery_at`
    /// are bumped on every save.
    pub async fn save(
        _ctx: &Ctx,
        mm: &ModelManager,
        source_id: SourceId,
        profile: &crate::source::RepositoryProfile,
    ) -> Result<RepositoryId> {
        let db = mm.db();

        let stmt = db.prepare("SELECT 1 FROM sources WHERE id = ?").await?;
        let mut rows = stmt.query([source_id.get()]).await?;
        if rows.next().await?.is_none() {
            return Err(crate::Error::IntegrityError(format!(
                "source {source_id} does not exist"
            )));
        }

        let organization = profile
            .full_name
            .split('/')
            .next()
            .map(|s| s.to_string());
        let size_category = SizeCategory::from_size_bytes(profile.size_bytes);
        let scored = crate::discovery::complexity::evaluate(profile);
        let now = fmt_ts(now_utc());

        let sql = format!(
            "INSERT INTO repositories (
                full_name, source_id, organization, source_url, ado_organization,
                ado_project, visibility, is_archived, is_fork, default_branch,
                primary_language, teams, size_bytes, size_category, branch_count,
                commit_count, pull_request_count, issue_count, contributor_count,
                release_count, tag_count, commits_last_12_weeks, has_lfs, has_submodules,
                has_large_files, has_actions, has_pages, has_wiki, has_discussions,
                has_projects, has_packages, has_code_scanning, has_secret_scanning,
                has_dependabot, has_codeowners, has_self_hosted_runners,
                has_release_assets, branch_protection_count, ruleset_count,
                webhook_count, environment_count, secret_count, variable_count, is_tfvc,
                pipeline_count, board_count, test_plan_count, artifact_count,
                ado_wiki_count, has_oversized_commits, oversized_commit_details,
                has_long_refs, long_ref_details, has_blocking_files,
                blocking_file_details, is_oversized, metadata_size_estimate,
                complexity_score, complexity, complexity_breakdown, discovered_at,
                updated_at, last_discovery_at
            ) VALUES ({})
            ON CONFLICT(full_name) DO UPDATE SET
                source_id = excluded.source_id,
                organization = excluded.organization,
                source_url = excluded.source_url,
                ado_organization = excluded.ado_organization,
                ado_project = excluded.ado_project,
                visibility = excluded.visibility,
                is_archived = excluded.is_archived,
                is_fork = excluded.is_fork,
                default_branch = excluded.default_branch,
                primary_language = excluded.primary_language,
                teams = excluded.teams,
                size_bytes = excluded.size_bytes,
                size_category = excluded.size_category,
                branch_count = excluded.branch_count,
                commit_count = excluded.commit_count,
                pull_request_count = excluded.pull_request_count,
                issue_count = excluded.issue_count,
                contributor_count = excluded.contributor_count,
                release_count = excluded.release_count,
                tag_count = excluded.tag_count,
                commits_last_12_weeks = excluded.commits_last_12_weeks,
                has_lfs = excluded.has_lfs,
                has_submodules = excluded.has_submodules,
                has_large_files = excluded.has_large_files,
                has_actions = excluded.has_actions,
                has_pages = excluded.has_pages,
                has_wiki = excluded.has_wiki,
                has_discussions = excluded.has_discussions,
                has_projects = excluded.has_projects,
                has_packages = excluded.has_packages,
                has_code_scanning = excluded.has_code_scanning,
                has_secret_scanning = excluded.has_secret_scanning,
                has_dependabot = excluded.has_dependabot,
                has_codeowners = excluded.has_codeowners,
                has_self_hosted_runners = excluded.has_self_hosted_runners,
                has_release_assets = excluded.has_release_assets,
                branch_protection_count = excluded.branch_protection_count,
                ruleset_count = excluded.ruleset_count,
                webhook_count = excluded.webhook_count,
                environment_count = excluded.environment_count,
                secret_count = excluded.secret_count,
                variable_count = excluded.variable_count,
                is_tfvc = excluded.is_tfvc,
                pipeline_count = excluded.pipeline_count,
                board_count = excluded.board_count,
                test_plan_count = excluded.test_plan_count,
                artifact_count = excluded.artifact_count,
                ado_wiki_count = excluded.ado_wiki_count,
                has_oversized_commits = excluded.has_oversized_commits,
                oversized_commit_details = excluded.oversized_commit_details,
                has_long_refs = excluded.has_long_refs,
                long_ref_details = excluded.long_ref_details,
                has_blocking_files = excluded.has_blocking_files,
                blocking_file_details = excluded.blocking_file_details,
                is_oversized = excluded.is_oversized,
                metadata_size_estimate = excluded.metadata_size_estimate,
                complexity_score = excluded.complexity_score,
                complexity = excluded.complexity,
                complexity_breakdown = excluded.complexity_breakdown,
                updated_at = excluded.updated_at,
                last_discovery_at = excluded.last_discovery_at
            RETURNING id",
            std::iter::repeat_n("?", 63).collect::<Vec<_>>().join(", ")
        );

        let params: Vec<libsql::Value> = vec![
            profile.full_name.clone().into(),
            source_id.get().into(),
            opt_text(organization),
            opt_text(profile.source_url.clone()),
            opt_text(profile.ado_organization.clone()),
            opt_text(profile.ado_project.clone()),
            opt_text(profile.visibility.map(|v| v.as_str().to_string())),
            i64::from(profile.is_archived).into(),
            i64::from(profile.is_fork).into(),
            opt_text(profile.default_branch.clone()),
            opt_text(profile.primary_language.clone()),
            serde_json::to_string(&profile.teams)?.into(),
            profile.size_bytes.into(),
            size_category.as_str().into(),
            profile.branch_count.into(),
            profile.commit_count.into(),
            profile.pull_request_count.into(),
            profile.issue_count.into(),
            profile.contributor_count.into(),
            profile.release_count.into(),
            profile.tag_count.into(),
            opt_int(profile.commits_last_12_weeks),
            i64::from(profile.features.has_lfs).into(),
            i64::from(profile.features.has_submodules).into(),
            i64::from(profile.features.has_large_files).into(),
            i64::from(profile.features.has_actions).into(),
            i64::from(profile.features.has_pages).into(),
            i64::from(profile.features.has_wiki).into(),
            i64::from(profile.features.has_discussions).into(),
            i64::from(profile.features.has_projects).into(),
            i64::from(profile.features.has_packages).into(),
            opt_int(profile.features.has_code_scanning.map(i64::from)),
            opt_int(profile.features.has_secret_scanning.map(i64::from)),
            opt_int(profile.features.has_dependabot.map(i64::from)),
            i64::from(profile.features.has_codeowners).into(),
            i64::from(profile.features.has_self_hosted_runners).into(),
            i64::from(profile.features.has_release_assets).into(),
            profile.features.branch_protection_count.into(),
            profile.features.ruleset_count.into(),
            profile.features.webhook_count.into(),
            profile.features.environment_count.into(),
            profile.features.secret_count.into(),
            profile.features.variable_count.into(),
            i64::from(profile.ado.is_tfvc).into(),
            opt_int(profile.ado.pipeline_count),
            opt_int(profile.ado.board_count),
            opt_int(profile.ado.test_plan_count),
            opt_int(profile.ado.artifact_count),
            opt_int(profile.ado.wiki_count),
            i64::from(profile.limits.has_oversized_commits).into(),
            opt_text(json_opt(&profile.limits.oversized_commit_details)),
            i64::from(profile.limits.has_long_refs).into(),
            opt_text(json_opt(&profile.limits.long_ref_details)),
            i64::from(profile.limits.has_blocking_files).into(),
            opt_text(json_opt(&profile.limits.blocking_file_details)),
            i64::from(profile.limits.is_oversized).into(),
            opt_int(profile.limits.metadata_size_estimate),
            scored.score.into(),
            scored.bucket.as_str().into(),
            serde_json::to_value(&scored.breakdown)
                .map(|v| v.to_string())?
                .into(),
            now.clone().into(),
            now.clone().into(),
            now.into(),
        ];

        let stmt = db.prepare(&sql).await?;
        let mut rows = stmt.query(params).await?;
        if let Some(row) = rows.next().await? {
            Ok(RepositoryId::new(row.get::<i64>(0)?))
        } else {
            Err(crate::Error::InvalidInput(
                "failed to save repository".into(),
            ))
        }
    }

    pub async fn get(_ctx: &Ctx, mm: &ModelManager, key: impl Into<RepoKey>) -> Result<Repository> {
        let db = mm.db();
        let key = key.into();

        let (sql, param): (String, libsql::Value) = match &key {
            RepoKey::FullName(name) => (
                format!("SELECT {REPO_COLUMNS} FROM repositories WHERE full_name = ?"),
                name.clone().into(),
            ),
            RepoKey::Id(id) => (
                format!("SELECT {REPO_COLUMNS} FROM repositories WHERE id = ?"),
                id.get().into(),
            ),
        };

        let stmt = db.prepare(&sql).await?;
        let mut rows = stmt.query(vec![param]).await?;
        if let Some(row) = rows.next().await? {
            Self::from_row(row)
        } else {
            let key_str = match key {
                RepoKey::FullName(name) => name,
                RepoKey::Id(id) => id.to_string(),
            };
            Err(crate::Error::RepositoryNotFound(key_str))
        }
    }

    /// Lists repositories matching the filter, with stable ordering.
    pub async fn list(
        _ctx: &Ctx,
        mm: &ModelManager,
        filter: &RepositoryFilter,
    ) -> Result<Vec<Repository>> {
        let db = mm.db();
        let (clause, params) = filter.to_sql();
        let sql = format!("SELECT {REPO_COLUMNS} FROM repositories {clause}");

        let stmt = db.prepare(&sql).await?;
        let mut rows = stmt.query(params).await?;
        let mut repos = Vec::new();
        while let Some(row) = rows.next().await? {
            repos.push(Self::from_row(row)?);
        }
        Ok(repos)
    }

    /// Applies a patch. Status changes are validated against the state
    /// machine inside the same guarded write: the UPDATE carries the
    /// observed status in its WHERE clause, so a concurrent transition
    /// surfaces as `ConcurrentUpdate` instead of silently double-driving.
    pub async fn update(
        _ctx: &Ctx,
        mm: &ModelManager,
        full_name: &str,
        patch: RepositoryForUpdate,
    ) -> Result<()> {
        let db = mm.db();

        let stmt = db
            .prepare("SELECT status, is_source_locked FROM repositories WHERE full_name = ?")
            .await?;
        let mut rows = stmt.query([full_name]).await?;
        let Some(row) = rows.next().await? else {
            return Err(crate::Error::RepositoryNotFound(full_name.to_string()));
        };
        let current_str: String = row.get(0)?;
        let current = MigrationStatus::parse(&current_str)
            .ok_or_else(|| crate::Error::InvalidInput(format!("bad status '{current_str}'")))?;
        let locked = row.get::<i64>(1)? != 0;

        if let Some(to) = patch.status {
            if !is_legal_transition(current, to) {
                return Err(crate::Error::InvalidTransition { from: current, to });
            }
            // A locked repository may only move toward terminal states.
            let unlocking = patch.is_source_locked == Some(false);
            if locked && to.is_new_attempt_entry() && !unlocking {
                return Err(crate::Error::SourceLocked(full_name.to_string()));
            }
        }

        let mut sets: Vec<String> = vec!["updated_at = ?".into()];
        let mut params: Vec<libsql::Value> = vec![fmt_ts(now_utc()).into()];

        if let Some(status) = patch.status {
            sets.push("status = ?".into());
            params.push(status.as_str().into());
        }
        if let Some(v) = patch.destination_full_name {
            sets.push("destination_full_name = ?".into());
            params.push(v.into());
        }
        if let Some(v) = patch.destination_url {
            sets.push("destination_url = ?".into());
            params.push(v.into());
        }
        if let Some(v) = patch.priority {
            sets.push("priority = ?".into());
            params.push(v.into());
        }
        if let Some(v) = patch.is_source_locked {
            sets.push("is_source_locked = ?".into());
            params.push(i64::from(v).into());
        }
        if let Some(v) = patch.migrated_at {
            sets.push("migrated_at = ?".into());
            params.push(fmt_ts(v).into());
        }
        if let Some(v) = patch.last_dry_run_at {
            sets.push("last_dry_run_at = ?".into());
            params.push(fmt_ts(v).into());
        }
        if let Some(v) = patch.last_migration_attempt_at {
            sets.push("last_migration_attempt_at = ?".into());
            params.push(fmt_ts(v).into());
        }
        if let Some(ex) = patch.exclude {
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

        params.push(full_name.into());
        params.push(current.as_str().into());

        let sql = format!(
            "UPDATE repositories SET {} WHERE full_name = ? AND status = ?",
            sets.join(", ")
        );
        let stmt = db.prepare(&sql).await?;
        let changed = stmt.execute(params).await?;
        if changed == 0 {
            return Err(crate::Error::ConcurrentUpdate(full_name.to_string()));
        }
        Ok(())
    }

    /// Atomic select-and-mark: claims up to `limit` repositories whose
    /// status is the phase's predecessor and which are not source-locked,
    /// flipping them into the phase's in-progress status and stamping the
    /// attempt timestamp. SQLite serializes writers, so no two callers
    /// ever observe the same repository as claimed.
    pub async fn claim_pending(
        _ctx: &Ctx,
        mm: &ModelManager,
        phase: Phase,
        limit: usize,
        batch_id: Option<BatchId>,
    ) -> Result<Vec<Repository>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let db = mm.db();

        let attempt_column = match phase {
            Phase::DryRun => "last_dry_run_at",
            Phase::Migration => "last_migration_attempt_at",
        };
        let batch_clause = if batch_id.is_some() {
            "AND batch_id = ?"
        } else {
            ""
        };

        let sql = format!(
            "UPDATE repositories
             SET status = ?, {attempt_column} = ?, updated_at = ?
             WHERE id IN (
                 SELECT id FROM repositories
                 WHERE status = ? AND is_source_locked = 0 {batch_clause}
                 ORDER BY priority DESC, discovered_at ASC
                 LIMIT ?
             )
             RETURNING {REPO_COLUMNS}"
        );

        let now = fmt_ts(now_utc());
        let mut params: Vec<libsql::Value> = vec![
            phase.in_progress().as_str().into(),
            now.clone().into(),
            now.into(),
            phase.predecessor().as_str().into(),
        ];
        if let Some(batch) = batch_id {
            params.push(batch.get().into());
        }
        params.push(i64::try_from(limit).unwrap_or(i64::MAX).into());

        let stmt = db.prepare(&sql).await?;
        let mut rows = stmt.query(params).await?;
        let mut claimed = Vec::new();
        while let Some(row) = rows.next().await? {
            claimed.push(Self::from_row(row)?);
        }
        Ok(claimed)
    }

    /// Bulk-promotes every repository of a batch currently in one of
    /// `from` into `to`. Returns the ids promoted. Source-locked rows are
    /// skipped.
    pub async fn promote_batch_members(
        _ctx: &Ctx,
        mm: &ModelManager,
        batch_id: BatchId,
        from: &[MigrationStatus],
        to: MigrationStatus,
    ) -> Result<Vec<RepositoryId>> {
        debug_assert!(from.iter().all(|f| is_legal_transition(*f, to)));
        if from.is_empty() {
            return Ok(Vec::new());
        }
        let db = mm.db();

        let placeholders = std::iter::repeat_n("?", from.len())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE repositories SET status = ?, updated_at = ?
             WHERE batch_id = ? AND is_source_locked = 0 AND status IN ({placeholders})
             RETURNING id"
        );

        let mut params: Vec<libsql::Value> = vec![
            to.as_str().into(),
            fmt_ts(now_utc()).into(),
            batch_id.get().into(),
        ];
        for status in from {
            params.push(status.as_str().into());
        }

        let stmt = db.prepare(&sql).await?;
        let mut rows = stmt.query(params).await?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(RepositoryId::new(row.get::<i64>(0)?));
        }
        Ok(ids)
    }

    /// Administrative override for repositories migrated outside the
    /// orchestrator: forces `complete` and stamps `migrated_at`,
    /// bypassing the transition table. Refused when no destination URL can
    /// be determined, which keeps the completeness invariant intact.
    pub async fn admin_mark_migrated(
        _ctx: &Ctx,
        mm: &ModelManager,
        id: RepositoryId,
    ) -> Result<()> {
        let db = mm.db();

        let stmt = db
            .prepare(
                "SELECT full_name, destination_url, destination_full_name
                 FROM repositories WHERE id = ?",
            )
            .await?;
        let mut rows = stmt.query([id.get()]).await?;
        let Some(row) = rows.next().await? else {
            return Err(crate::Error::RepositoryNotFound(id.to_string()));
        };
        let full_name: String = row.get(0)?;
        let destination_url: Option<String> = row.get(1)?;
        let destination_full_name: Option<String> = row.get(2)?;

        let url = match (destination_url, destination_full_name) {
            (Some(url), _) => url,
            (None, Some(name)) => format!("https://github.com/{name}"),
            (None, None) => {
                return Err(crate::Error::InvalidInput(format!(
                    "{full_name}: cannot mark migrated without a destination"
                )));
            }
        };

        let now = fmt_ts(now_utc());
        let stmt = db
            .prepare(
                "UPDATE repositories
                 SET status = 'complete', destination_url = ?, migrated_at = ?, updated_at = ?
                 WHERE id = ?",
            )
            .await?;
        stmt.execute((url, now.clone(), now, id.get())).await?;
        Ok(())
    }

    /// Deletes a repository; history and log rows cascade and the former
    /// batch's member count is refreshed.
    pub async fn delete(_ctx: &Ctx, mm: &ModelManager, id: RepositoryId) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare("DELETE FROM repositories WHERE id = ? RETURNING batch_id")
            .await?;
        let mut rows = stmt.query([id.get()]).await?;
        let Some(row) = rows.next().await? else {
            return Err(crate::Error::RepositoryNotFound(id.to_string()));
        };

        if let Some(batch_id) = row.get::<Option<i64>>(0)? {
            let stmt = db
                .prepare(
                    "UPDATE batches
                     SET repository_count = (SELECT COUNT(*) FROM repositories WHERE batch_id = ?)
                     WHERE id = ?",
                )
                .await?;
            stmt.execute((batch_id, batch_id)).await?;
        }
        Ok(())
    }

    pub(crate) fn from_row(row: libsql::Row) -> Result<Repository> {
        let visibility: Option<String> = row.get(9)?;
        let teams_json: Option<String> = row.get(14)?;
        let size_category: Option<String> = row.get(16)?;
        let status_str: String = row.get(63)?;
        let complexity: Option<String> = row.get(61)?;

        Ok(Repository {
            id: RepositoryId::new(row.get(0)?),
            full_name: row.get(1)?,
            source_id: SourceId::new(row.get(2)?),
            organization: row.get(3)?,
            source_url: row.get(4)?,
            destination_full_name: row.get(5)?,
            destination_url: row.get(6)?,
            ado_organization: row.get(7)?,
            ado_project: row.get(8)?,
            visibility: visibility.as_deref().and_then(Visibility::parse),
            is_archived: row.get::<i64>(10)? != 0,
            is_fork: row.get::<i64>(11)? != 0,
            default_branch: row.get(12)?,
            primary_language: row.get(13)?,
            teams: teams_json
                .and_then(|j| serde_json::from_str(&j).ok())
                .unwrap_or_default(),
            size_bytes: row.get(15)?,
            size_category: size_category.as_deref().and_then(SizeCategory::parse),
            branch_count: row.get(17)?,
            commit_count: row.get(18)?,
            pull_request_count: row.get(19)?,
            issue_count: row.get(20)?,
            contributor_count: row.get(21)?,
            release_count: row.get(22)?,
            tag_count: row.get(23)?,
            commits_last_12_weeks: row.get(24)?,
            features: FeatureInventory {
                has_lfs: row.get::<i64>(25)? != 0,
                has_submodules: row.get::<i64>(26)? != 0,
                has_large_files: row.get::<i64>(27)? != 0,
                has_actions: row.get::<i64>(28)? != 0,
                has_pages: row.get::<i64>(29)? != 0,
                has_wiki: row.get::<i64>(30)? != 0,
                has_discussions: row.get::<i64>(31)? != 0,
                has_projects: row.get::<i64>(32)? != 0,
                has_packages: row.get::<i64>(33)? != 0,
                has_code_scanning: row.get::<Option<i64>>(34)?.map(|v| v != 0),
                has_secret_scanning: row.get::<Option<i64>>(35)?.map(|v| v != 0),
                has_dependabot: row.get::<Option<i64>>(36)?.map(|v| v != 0),
                has_codeowners: row.get::<i64>(37)? != 0,
                has_self_hosted_runners: row.get::<i64>(38)? != 0,
                has_release_assets: row.get::<i64>(39)? != 0,
                branch_protection_count: row.get(40)?,
                ruleset_count: row.get(41)?,
                webhook_count: row.get(42)?,
                environment_count: row.get(43)?,
                secret_count: row.get(44)?,
                variable_count: row.get(45)?,
            },
            ado: AdoInventory {
                is_tfvc: row.get::<i64>(46)? != 0,
                pipeline_count: row.get(47)?,
                board_count: row.get(48)?,
                test_plan_count: row.get(49)?,
                artifact_count: row.get(50)?,
                wiki_count: row.get(51)?,
            },
            limits: MigrationLimits {
                has_oversized_commits: row.get::<i64>(52)? != 0,
                oversized_commit_details: json_col(row.get(53)?),
                has_long_refs: row.get::<i64>(54)? != 0,
                long_ref_details: json_col(row.get(55)?),
                has_blocking_files: row.get::<i64>(56)? != 0,
                blocking_file_details: json_col(row.get(57)?),
                is_oversized: row.get::<i64>(58)? != 0,
                metadata_size_estimate: row.get(59)?,
            },
            complexity_score: row.get(60)?,
            complexity: complexity.as_deref().and_then(Complexity::parse),
            complexity_breakdown: json_col(row.get(62)?),
            status: MigrationStatus::parse(&status_str).unwrap_or(MigrationStatus::Pending),
            batch_id: row.get::<Option<i64>>(64)?.map(BatchId::new),
            priority: row.get(65)?,
            is_source_locked: row.get::<i64>(66)? != 0,
            exclude: ExcludeFlags {
                releases: row.get::<i64>(67)? != 0,
                attachments: row.get::<i64>(68)? != 0,
                metadata: row.get::<i64>(69)? != 0,
                git_data: row.get::<i64>(70)? != 0,
                owner_projects: row.get::<i64>(71)? != 0,
            },
            discovered_at: parse_ts(&row.get::<String>(72)?),
            updated_at: parse_ts(&row.get::<String>(73)?),
            migrated_at: parse_ts_opt(row.get(74)?),
            last_discovery_at: parse_ts_opt(row.get(75)?),
            last_dry_run_at: parse_ts_opt(row.get(76)?),
            last_migration_attempt_at: parse_ts_opt(row.get(77)?),
        })
    }
}

fn json_opt(value: &Option<Value>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

fn json_col(text: Option<String>) -> Option<Value> {
    text.and_then(|t| serde_json::from_str(&t).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_category_thresholds() {
        assert_eq!(SizeCategory::from_size_bytes(0), SizeCategory::Small);
        assert_eq!(
            SizeCategory::from_size_bytes(100 * 1024 * 1024),
            SizeCategory::Medium
        );
        assert_eq!(
            SizeCategory::from_size_bytes(1024 * 1024 * 1024),
            SizeCategory::Large
        );
        assert_eq!(
            SizeCategory::from_size_bytes(5 * 1024 * 1024 * 1024),
            SizeCategory::VeryLarge
        );
    }

    #[test]
    fn test_complexity_buckets() {
        assert_eq!(Complexity::from_score(0), Complexity::Simple);
        assert_eq!(Complexity::from_score(4), Complexity::Simple);
        assert_eq!(Complexity::from_score(5), Complexity::Medium);
        assert_eq!(Complexity::from_score(14), Complexity::Medium);
        assert_eq!(Complexity::from_score(15), Complexity::Complex);
        assert_eq!(Complexity::from_score(29), Complexity::Complex);
        assert_eq!(Complexity::from_score(30), Complexity::VeryComplex);
    }

    #[test]
    fn test_exclude_flags_merge() {
        let repo = ExcludeFlags {
            releases: true,
            ..Default::default()
        };
        let batch = ExcludeFlags {
            metadata: true,
            ..Default::default()
        };
        let merged = repo.merged_with(batch);
        assert!(merged.releases);
        assert!(merged.metadata);
        assert!(!merged.git_data);
    }

    #[test]
    fn test_blocking_limits() {
        let mut limits = MigrationLimits::default();
        assert!(!limits.is_blocking());
        limits.has_long_refs = true;
        assert!(limits.is_blocking());
    }
}
