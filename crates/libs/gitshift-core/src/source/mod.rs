//! Source platform capability: the abstract interface the core consumes to
//! enumerate and profile repositories. Concrete API clients (GitHub
//! Enterprise Server, Azure DevOps) implement [`SourcePlatform`] outside
//! the core.

use crate::model::repository::{AdoInventory, FeatureInventory, MigrationLimits, Visibility};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Error kinds surfaced by source clients. Retry policy lives with the
/// caller: `RateLimited` and `Transient` are retryable, the rest are not.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("permanent error: {0}")]
    Permanent(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }

    /// Minimum wait demanded by the source, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Reference to an organization at the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgRef {
    pub name: String,
}

/// Reference to an Azure DevOps project within an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub organization: String,
    pub name: String,
}

/// Reference to a repository, sufficient to request its profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    /// Platform-qualified path, e.g. `org/repo` or `org/project/repo`.
    pub full_name: String,
}

impl RepoRef {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
        }
    }
}

/// Enumeration scope for [`SourcePlatform::list_repositories`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListScope {
    Organization(OrgRef),
    Project(ProjectRef),
}

impl ListScope {
    pub fn label(&self) -> String {
        match self {
            Self::Organization(org) => org.name.clone(),
            Self::Project(project) => format!("{}/{}", project.organization, project.name),
        }
    }
}

/// Full profile of one repository, produced by
/// [`SourcePlatform::profile_repository`]. Fields the per-source discovery
/// contract fills lazily are `Option`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryProfile {
    pub full_name: String,
    pub source_url: Option<String>,
    pub ado_organization: Option<String>,
    pub ado_project: Option<String>,

    pub visibility: Option<Visibility>,
    pub is_archived: bool,
    pub is_fork: bool,
    pub default_branch: Option<String>,
    pub primary_language: Option<String>,
    pub teams: Vec<String>,

    pub size_bytes: i64,
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
}

impl RepositoryProfile {
    /// Minimal profile carrying only identity, useful as a starting point.
    pub fn named(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            ..Default::default()
        }
    }
}

/// Lazily yielded repository listing. Finite, not restartable; pagination
/// happens inside the client.
pub type RepoStream<'a> = BoxStream<'a, SourceResult<RepoRef>>;

/// Capability set over a source platform. Implementations own their own
/// rate-limit budget and internal pagination.
#[async_trait]
pub trait SourcePlatform: Send + Sync {
    /// Organizations visible to the configured credentials. For Azure
    /// DevOps these are ADO organizations.
    async fn list_organizations(&self) -> SourceResult<Vec<OrgRef>>;

    /// Projects within an ADO organization. GitHub sources return an empty
    /// list.
    async fn list_projects(&self, org: &OrgRef) -> SourceResult<Vec<ProjectRef>>;

    /// Repositories within an organization or project.
    fn list_repositories(&self, scope: ListScope) -> RepoStream<'_>;

    /// Full profile for one repository, populating the feature inventory,
    /// counters and migration-limit validations.
    async fn profile_repository(&self, repo: &RepoRef) -> SourceResult<RepositoryProfile>;

    async fn validate_credentials(&self) -> SourceResult<()>;
}

/// Resolves a configured [`Source`](crate::model::source::Source) record
/// to a live client. Implemented by the embedding application, which owns
/// credential handling and client construction.
pub trait SourceProvider: Send + Sync {
    fn client_for(
        &self,
        source: &crate::model::source::Source,
    ) -> SourceResult<std::sync::Arc<dyn SourcePlatform>>;
}
