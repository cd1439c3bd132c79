//! Discovery engine: a bounded-concurrency crawler that enumerates a
//! target, profiles each repository via the source capability and upserts
//! results idempotently. Progress is externally observable through the
//! `discovery_progress` table.

pub mod backoff;
pub mod complexity;
mod engine;
mod progress;

pub use engine::DiscoveryEngine;

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a discovery run crawls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryTarget {
    /// Every organization visible to the source credentials.
    Enterprise,
    Organization {
        name: String,
    },
    Project {
        organization: String,
        name: String,
    },
    SingleRepository {
        full_name: String,
    },
}

impl DiscoveryTarget {
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::Enterprise => "enterprise",
            Self::Organization { .. } => "organization",
            Self::Project { .. } => "project",
            Self::SingleRepository { .. } => "single_repository",
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Enterprise => "*".to_string(),
            Self::Organization { name } => name.clone(),
            Self::Project { organization, name } => format!("{organization}/{name}"),
            Self::SingleRepository { full_name } => full_name.clone(),
        }
    }
}

impl fmt::Display for DiscoveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_str(), self.label())
    }
}
