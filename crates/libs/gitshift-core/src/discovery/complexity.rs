//! Deterministic complexity scoring.
//!
//! The weighting table is a constant so the same profile always produces
//! the same score and breakdown. Buckets:
//! `simple < 5 <= medium < 15 <= complex < 30 <= very_complex`.

use crate::model::repository::Complexity;
use crate::source::RepositoryProfile;
use serde::Serialize;

const GIB: i64 = 1024 * 1024 * 1024;

/// Size tiers, largest first. A profile contributes the first matching
/// tier only.
const SIZE_TIERS: [(i64, i64, &str); 3] = [
    (10 * GIB, 6, "size >= 10 GiB"),
    (5 * GIB, 4, "size >= 5 GiB"),
    (GIB, 2, "size >= 1 GiB"),
];

const W_LFS: i64 = 3;
const W_SUBMODULES: i64 = 2;
const W_LARGE_FILES: i64 = 3;
const W_ACTIONS: i64 = 2;
const W_PAGES: i64 = 1;
const W_WIKI: i64 = 1;
const W_DISCUSSIONS: i64 = 1;
const W_PROJECTS: i64 = 1;
const W_PACKAGES: i64 = 2;
const W_CODE_SCANNING: i64 = 2;
const W_SECRET_SCANNING: i64 = 2;
const W_DEPENDABOT: i64 = 1;
const W_CODEOWNERS: i64 = 1;
const W_SELF_HOSTED_RUNNERS: i64 = 3;
const W_RELEASE_ASSETS: i64 = 2;
const W_BRANCH_PROTECTIONS: i64 = 1;
const W_RULESETS: i64 = 1;
const W_WEBHOOKS: i64 = 1;
const W_ENVIRONMENTS: i64 = 2;
const W_SECRETS: i64 = 2;
const W_VARIABLES: i64 = 1;
const W_TFVC: i64 = 8;
const W_PIPELINES: i64 = 3;
const W_BOARDS: i64 = 2;
const W_TEST_PLANS: i64 = 2;
const W_ARTIFACTS: i64 = 2;
const W_ADO_WIKIS: i64 = 1;
const W_OVERSIZED_COMMITS: i64 = 4;
const W_LONG_REFS: i64 = 2;
const W_BLOCKING_FILES: i64 = 4;
const W_OVERSIZED_REPO: i64 = 6;

/// One weighted contribution to the score.
#[derive(Debug, Clone, Serialize)]
pub struct Contribution {
    pub factor: &'static str,
    pub points: i64,
}

/// Score, bucket and per-factor breakdown for one profile.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredComplexity {
    pub score: i64,
    pub bucket: Complexity,
    pub breakdown: Vec<Contribution>,
}

/// Computes the complexity score for a profile. Pure and stable across
/// runs.
pub fn evaluate(profile: &RepositoryProfile) -> ScoredComplexity {
    let mut breakdown: Vec<Contribution> = Vec::new();
    let mut add = |factor: &'static str, points: i64| {
        if points > 0 {
            breakdown.push(Contribution { factor, points });
        }
    };

    for (threshold, points, label) in SIZE_TIERS {
        if profile.size_bytes >= threshold {
            add(label, points);
            break;
        }
    }

    let f = &profile.features;
    add("lfs", if f.has_lfs { W_LFS } else { 0 });
    add("submodules", if f.has_submodules { W_SUBMODULES } else { 0 });
    add("large_files", if f.has_large_files { W_LARGE_FILES } else { 0 });
    add("actions", if f.has_actions { W_ACTIONS } else { 0 });
    add("pages", if f.has_pages { W_PAGES } else { 0 });
    add("wiki", if f.has_wiki { W_WIKI } else { 0 });
    add("discussions", if f.has_discussions { W_DISCUSSIONS } else { 0 });
    add("projects", if f.has_projects { W_PROJECTS } else { 0 });
    add("packages", if f.has_packages { W_PACKAGES } else { 0 });
    add(
        "code_scanning",
        if f.has_code_scanning == Some(true) { W_CODE_SCANNING } else { 0 },
    );
    add(
        "secret_scanning",
        if f.has_secret_scanning == Some(true) { W_SECRET_SCANNING } else { 0 },
    );
    add(
        "dependabot",
        if f.has_dependabot == Some(true) { W_DEPENDABOT } else { 0 },
    );
    add("codeowners", if f.has_codeowners { W_CODEOWNERS } else { 0 });
    add(
        "self_hosted_runners",
        if f.has_self_hosted_runners { W_SELF_HOSTED_RUNNERS } else { 0 },
    );
    add(
        "release_assets",
        if f.has_release_assets { W_RELEASE_ASSETS } else { 0 },
    );
    add(
        "branch_protections",
        if f.branch_protection_count > 0 { W_BRANCH_PROTECTIONS } else { 0 },
    );
    add("rulesets", if f.ruleset_count > 0 { W_RULESETS } else { 0 });
    add("webhooks", if f.webhook_count > 0 { W_WEBHOOKS } else { 0 });
    add(
        "environments",
        if f.environment_count > 0 { W_ENVIRONMENTS } else { 0 },
    );
    add("secrets", if f.secret_count > 0 { W_SECRETS } else { 0 });
    add("variables", if f.variable_count > 0 { W_VARIABLES } else { 0 });

    let ado = &profile.ado;
    add("tfvc", if ado.is_tfvc { W_TFVC } else { 0 });
    add(
        "pipelines",
        if ado.pipeline_count.unwrap_or(0) > 0 { W_PIPELINES } else { 0 },
    );
    add("boards", if ado.board_count.unwrap_or(0) > 0 { W_BOARDS } else { 0 });
    add(
        "test_plans",
        if ado.test_plan_count.unwrap_or(0) > 0 { W_TEST_PLANS } else { 0 },
    );
    add(
        "artifacts",
        if ado.artifact_count.unwrap_or(0) > 0 { W_ARTIFACTS } else { 0 },
    );
    add(
        "ado_wikis",
        if ado.wiki_count.unwrap_or(0) > 0 { W_ADO_WIKIS } else { 0 },
    );

    let limits = &profile.limits;
    add(
        "oversized_commits",
        if limits.has_oversized_commits { W_OVERSIZED_COMMITS } else { 0 },
    );
    add("long_refs", if limits.has_long_refs { W_LONG_REFS } else { 0 });
    add(
        "blocking_files",
        if limits.has_blocking_files { W_BLOCKING_FILES } else { 0 },
    );
    add(
        "oversized_repo",
        if limits.is_oversized { W_OVERSIZED_REPO } else { 0 },
    );

    let score: i64 = breakdown.iter().map(|c| c.points).sum();
    ScoredComplexity {
        score,
        bucket: Complexity::from_score(score),
        breakdown,
    }
}
