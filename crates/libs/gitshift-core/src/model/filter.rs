//! Repository filter grammar and its SQL rendering.
//!
//! Every field is optional; vector-valued fields mean ANY-of. The builder
//! is a pure function from filter to `WHERE`/`ORDER BY`/`LIMIT` clause plus
//! positional parameters, so it unit-tests without a database.

use crate::model::repository::{Complexity, SizeCategory, Visibility};
use crate::model::status::MigrationStatus;
use crate::types::{BatchId, SourceId};
use serde::Deserialize;

/// Stable orderings for repository listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Name,
    Size,
    Org,
    Updated,
}

impl SortBy {
    fn order_clause(self) -> &'static str {
        match self {
            Self::Name => "full_name ASC",
            Self::Size => "size_bytes DESC, full_name ASC",
            Self::Org => "organization ASC, full_name ASC",
            Self::Updated => "updated_at DESC, full_name ASC",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RepositoryFilter {
    pub status: Vec<MigrationStatus>,
    pub batch_id: Option<BatchId>,
    pub source: Option<SourceId>,
    pub organization: Vec<String>,
    pub ado_organization: Vec<String>,
    pub project: Vec<String>,
    pub team: Option<String>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,

    pub has_lfs: Option<bool>,
    pub has_submodules: Option<bool>,
    pub has_large_files: Option<bool>,
    pub has_actions: Option<bool>,
    pub has_wiki: Option<bool>,
    pub has_pages: Option<bool>,
    pub has_discussions: Option<bool>,
    pub has_projects: Option<bool>,
    pub has_packages: Option<bool>,
    pub has_branch_protections: Option<bool>,
    pub has_rulesets: Option<bool>,
    pub has_code_scanning: Option<bool>,
    pub has_dependabot: Option<bool>,
    pub has_secret_scanning: Option<bool>,
    pub has_codeowners: Option<bool>,
    pub has_self_hosted_runners: Option<bool>,
    pub has_release_assets: Option<bool>,
    pub has_webhooks: Option<bool>,
    pub has_environments: Option<bool>,
    pub has_secrets: Option<bool>,
    pub has_variables: Option<bool>,

    pub is_archived: Option<bool>,
    pub is_fork: Option<bool>,
    pub is_tfvc: Option<bool>,
    pub has_ado_pipelines: Option<bool>,
    pub has_ado_boards: Option<bool>,
    pub has_ado_test_plans: Option<bool>,
    pub has_ado_artifacts: Option<bool>,
    pub has_ado_wikis: Option<bool>,
    pub visibility: Vec<Visibility>,
    pub complexity: Vec<Complexity>,
    pub size_category: Vec<SizeCategory>,

    /// Substring match over `full_name`.
    pub search: Option<String>,
    pub sort_by: Option<SortBy>,
    /// Only repositories with no current batch.
    pub available_for_batch: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl RepositoryFilter {
    /// Renders `WHERE … ORDER BY … [LIMIT … [OFFSET …]]` with positional
    /// parameters.
    pub fn to_sql(&self) -> (String, Vec<libsql::Value>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<libsql::Value> = Vec::new();

        any_of(
            &mut clauses,
            &mut params,
            "status",
            self.status.iter().map(|s| s.as_str().to_string()),
        );
        if let Some(batch_id) = self.batch_id {
            clauses.push("batch_id = ?".into());
            params.push(batch_id.get().into());
        }
        if let Some(source) = self.source {
            clauses.push("source_id = ?".into());
            params.push(source.get().into());
        }
        any_of(
            &mut clauses,
            &mut params,
            "organization",
            self.organization.iter().cloned(),
        );
        any_of(
            &mut clauses,
            &mut params,
            "ado_organization",
            self.ado_organization.iter().cloned(),
        );
        any_of(
            &mut clauses,
            &mut params,
            "ado_project",
            self.project.iter().cloned(),
        );
        if let Some(team) = &self.team {
            clauses.push("teams LIKE ?".into());
            params.push(format!("%\"{team}\"%").into());
        }
        if let Some(min) = self.min_size {
            clauses.push("size_bytes >= ?".into());
            params.push(min.into());
        }
        if let Some(max) = self.max_size {
            clauses.push("size_bytes <= ?".into());
            params.push(max.into());
        }

        flag(&mut clauses, "has_lfs", self.has_lfs);
        flag(&mut clauses, "has_submodules", self.has_submodules);
        flag(&mut clauses, "has_large_files", self.has_large_files);
        flag(&mut clauses, "has_actions", self.has_actions);
        flag(&mut clauses, "has_wiki", self.has_wiki);
        flag(&mut clauses, "has_pages", self.has_pages);
        flag(&mut clauses, "has_discussions", self.has_discussions);
        flag(&mut clauses, "has_projects", self.has_projects);
        flag(&mut clauses, "has_packages", self.has_packages);
        flag(&mut clauses, "has_code_scanning", self.has_code_scanning);
        flag(&mut clauses, "has_dependabot", self.has_dependabot);
        flag(&mut clauses, "has_secret_scanning", self.has_secret_scanning);
        flag(&mut clauses, "has_codeowners", self.has_codeowners);
        flag(
            &mut clauses,
            "has_self_hosted_runners",
            self.has_self_hosted_runners,
        );
        flag(&mut clauses, "has_release_assets", self.has_release_assets);

        counted(
            &mut clauses,
            "branch_protection_count",
            self.has_branch_protections,
        );
        counted(&mut clauses, "ruleset_count", self.has_rulesets);
        counted(&mut clauses, "webhook_count", self.has_webhooks);
        counted(&mut clauses, "environment_count", self.has_environments);
        counted(&mut clauses, "secret_count", self.has_secrets);
        counted(&mut clauses, "variable_count", self.has_variables);

        flag(&mut clauses, "is_archived", self.is_archived);
        flag(&mut clauses, "is_fork", self.is_fork);
        flag(&mut clauses, "is_tfvc", self.is_tfvc);

        counted(&mut clauses, "pipeline_count", self.has_ado_pipelines);
        counted(&mut clauses, "board_count", self.has_ado_boards);
        counted(&mut clauses, "test_plan_count", self.has_ado_test_plans);
        counted(&mut clauses, "artifact_count", self.has_ado_artifacts);
        counted(&mut clauses, "ado_wiki_count", self.has_ado_wikis);

        any_of(
            &mut clauses,
            &mut params,
            "visibility",
            self.visibility.iter().map(|v| v.as_str().to_string()),
        );
        any_of(
            &mut clauses,
            &mut params,
            "complexity",
            self.complexity.iter().map(|c| c.as_str().to_string()),
        );
        any_of(
            &mut clauses,
            &mut params,
            "size_category",
            self.size_category.iter().map(|c| c.as_str().to_string()),
        );

        if let Some(search) = &self.search {
            clauses.push("full_name LIKE ?".into());
            params.push(format!("%{search}%").into());
        }
        if self.available_for_batch {
            clauses.push("batch_id IS NULL".into());
        }

        let mut sql = String::new();
        if !clauses.is_empty() {
            sql.push_str("WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(self.sort_by.unwrap_or_default().order_clause());

        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => {
                sql.push_str(" LIMIT ? OFFSET ?");
                params.push(limit.into());
                params.push(offset.into());
            }
            (Some(limit), None) => {
                sql.push_str(" LIMIT ?");
                params.push(limit.into());
            }
            // SQLite treats a negative limit as unbounded, which keeps a
            // bare offset honest.
            (None, Some(offset)) => {
                sql.push_str(" LIMIT -1 OFFSET ?");
                params.push(offset.into());
            }
            (None, None) => {}
        }

        (sql, params)
    }
}

fn any_of(
    clauses: &mut Vec<String>,
    params: &mut Vec<libsql::Value>,
    column: &str,
    values: impl Iterator<Item = String>,
) {
    let values: Vec<String> = values.collect();
    if values.is_empty() {
        return;
    }
    let placeholders = std::iter::repeat_n("?", values.len())
        .collect::<Vec<_>>()
        .join(", ");
    clauses.push(format!("{column} IN ({placeholders})"));
    for value in values {
        params.push(value.into());
    }
}

fn flag(clauses: &mut Vec<String>, column: &str, value: Option<bool>) {
    if let Some(v) = value {
        clauses.push(format!("{column} = {}", i64::from(v)));
    }
}

// COALESCE so lazily-profiled NULL counters read as zero.
fn counted(clauses: &mut Vec<String>, column: &str, value: Option<bool>) {
    match value {
        Some(true) => clauses.push(format!("COALESCE({column}, 0) > 0")),
        Some(false) => clauses.push(format!("COALESCE({column}, 0) = 0")),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_orders_by_name() {
        let (sql, params) = RepositoryFilter::default().to_sql();
        assert_eq!(sql, " ORDER BY full_name ASC");
        assert!(params.is_empty());
    }

    #[test]
    fn test_any_of_status() {
        let filter = RepositoryFilter {
            status: vec![MigrationStatus::Pending, MigrationStatus::DryRunFailed],
            ..Default::default()
        };
        let (sql, params) = filter.to_sql();
        assert!(sql.contains("status IN (?, ?)"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_counted_flags() {
        let filter = RepositoryFilter {
            has_branch_protections: Some(true),
            has_webhooks: Some(false),
            ..Default::default()
        };
        let (sql, _) = filter.to_sql();
        assert!(sql.contains("COALESCE(branch_protection_count, 0) > 0"));
        assert!(sql.contains("COALESCE(webhook_count, 0) = 0"));
    }

    #[test]
    fn test_ado_counted_flags() {
        let filter = RepositoryFilter {
            is_tfvc: Some(true),
            has_ado_pipelines: Some(true),
            has_ado_boards: Some(true),
            has_ado_test_plans: Some(false),
            has_ado_artifacts: Some(false),
            has_ado_wikis: Some(false),
            ..Default::default()
        };
        let (sql, _) = filter.to_sql();
        assert!(sql.contains("is_tfvc = 1"));
        assert!(sql.contains("COALESCE(pipeline_count, 0) > 0"));
        assert!(sql.contains("COALESCE(board_count, 0) > 0"));
        assert!(sql.contains("COALESCE(test_plan_count, 0) = 0"));
        assert!(sql.contains("COALESCE(artifact_count, 0) = 0"));
        assert!(sql.contains("COALESCE(ado_wiki_count, 0) = 0"));
    }

    #[test]
    fn test_search_and_pagination() {
        let filter = RepositoryFilter {
            search: Some("api".into()),
            limit: Some(10),
            offset: Some(20),
            sort_by: Some(SortBy::Size),
            ..Default::default()
        };
        let (sql, params) = filter.to_sql();
        assert!(sql.contains("full_name LIKE ?"));
        assert!(sql.contains("ORDER BY size_bytes DESC, full_name ASC"));
        assert!(sql.ends_with("LIMIT ? OFFSET ?"));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_offset_without_limit_still_applies() {
        let filter = RepositoryFilter {
            offset: Some(20),
            ..Default::default()
        };
        let (sql, params) = filter.to_sql();
        assert!(sql.ends_with("LIMIT -1 OFFSET ?"));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_available_for_batch() {
        let filter = RepositoryFilter {
            available_for_batch: true,
            batch_id: None,
            ..Default::default()
        };
        let (sql, _) = filter.to_sql();
        assert!(sql.contains("batch_id IS NULL"));
    }

    #[test]
    fn test_team_matches_json_array() {
        let filter = RepositoryFilter {
            team: Some("platform".into()),
            ..Default::default()
        };
        let (sql, params) = filter.to_sql();
        assert!(sql.contains("teams LIKE ?"));
        assert_eq!(params.len(), 1);
    }
}
