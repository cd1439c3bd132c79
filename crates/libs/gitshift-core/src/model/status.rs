//! Migration state machine: per-repository statuses, legal transitions and
//! the batch-status reduction.
//!
//! All transition checks live here; the store's update path is the single
//! enforcement point and no call site re-implements the rules.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-repository lifecycle status. Values are stable identifiers, compared
/// exactly; the wire/database form is the snake_case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    RemediationRequired,
    DryRunQueued,
    DryRunInProgress,
    DryRunComplete,
    DryRunFailed,
    PreMigration,
    ArchiveGenerating,
    QueuedForMigration,
    MigratingContent,
    MigrationComplete,
    MigrationFailed,
    PostMigration,
    Complete,
    RolledBack,
    WontMigrate,
}

impl MigrationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::RemediationRequired => "remediation_required",
            Self::DryRunQueued => "dry_run_queued",
            Self::DryRunInProgress => "dry_run_in_progress",
            Self::DryRunComplete => "dry_run_complete",
            Self::DryRunFailed => "dry_run_failed",
            Self::PreMigration => "pre_migration",
            Self::ArchiveGenerating => "archive_generating",
            Self::QueuedForMigration => "queued_for_migration",
            Self::MigratingContent => "migrating_content",
            Self::MigrationComplete => "migration_complete",
            Self::MigrationFailed => "migration_failed",
            Self::PostMigration => "post_migration",
            Self::Complete => "complete",
            Self::RolledBack => "rolled_back",
            Self::WontMigrate => "wont_migrate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "remediation_required" => Some(Self::RemediationRequired),
            "dry_run_queued" => Some(Self::DryRunQueued),
            "dry_run_in_progress" => Some(Self::DryRunInProgress),
            "dry_run_complete" => Some(Self::DryRunComplete),
            "dry_run_failed" => Some(Self::DryRunFailed),
            "pre_migration" => Some(Self::PreMigration),
            "archive_generating" => Some(Self::ArchiveGenerating),
            "queued_for_migration" => Some(Self::QueuedForMigration),
            "migrating_content" => Some(Self::MigratingContent),
            "migration_complete" => Some(Self::MigrationComplete),
            "migration_failed" => Some(Self::MigrationFailed),
            "post_migration" => Some(Self::PostMigration),
            "complete" => Some(Self::Complete),
            "rolled_back" => Some(Self::RolledBack),
            "wont_migrate" => Some(Self::WontMigrate),
            _ => None,
        }
    }

    /// Terminal statuses: the repository is done and only administrative
    /// actions (rollback, unmark) can move it again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::RolledBack | Self::WontMigrate)
    }

    /// Failed statuses. Resumable through retry.
    pub fn is_failed(self) -> bool {
        matches!(self, Self::DryRunFailed | Self::MigrationFailed)
    }

    /// Statuses that count as "running" for the batch reduction.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::DryRunInProgress
                | Self::PreMigration
                | Self::ArchiveGenerating
                | Self::QueuedForMigration
                | Self::MigratingContent
                | Self::PostMigration
        )
    }

    /// Whether entering this status begins a new dry-run or migration
    /// attempt. Source-locked repositories reject these entries.
    pub fn is_new_attempt_entry(self) -> bool {
        matches!(self, Self::DryRunQueued | Self::PreMigration)
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pure transition predicate implementing the state diagram. Any pair not
/// listed here is rejected by the store with `InvalidTransition`.
pub fn is_legal_transition(from: MigrationStatus, to: MigrationStatus) -> bool {
    use MigrationStatus as S;

    if from == to {
        return false;
    }

    match to {
        S::DryRunQueued => matches!(
            from,
            S::Pending | S::DryRunFailed | S::RemediationRequired
        ),
        S::DryRunInProgress => from == S::DryRunQueued,
        S::DryRunComplete | S::DryRunFailed => from == S::DryRunInProgress,
        // Pending is allowed in only when a batch starts with skip_dry_run.
        S::PreMigration => matches!(
            from,
            S::Pending | S::DryRunComplete | S::DryRunFailed | S::MigrationFailed
        ),
        S::ArchiveGenerating => from == S::PreMigration,
        S::QueuedForMigration => from == S::ArchiveGenerating,
        S::MigratingContent => from == S::QueuedForMigration,
        S::MigrationComplete => from == S::MigratingContent,
        // A production attempt can fail before content transfer begins.
        S::MigrationFailed => matches!(
            from,
            S::ArchiveGenerating | S::QueuedForMigration | S::MigratingContent
        ),
        S::PostMigration => from == S::MigrationComplete,
        S::Complete => from == S::PostMigration,
        S::RolledBack => from == S::Complete,
        S::WontMigrate => matches!(from, S::Pending | S::RemediationRequired),
        S::Pending => from == S::WontMigrate,
        S::RemediationRequired => !from.is_terminal(),
    }
}

/// One labelled edge of the state machine that a claim drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    DryRun,
    Migration,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::Migration => "migration",
        }
    }

    /// The status a repository must hold for a claim in this phase.
    pub fn predecessor(self) -> MigrationStatus {
        match self {
            Self::DryRun => MigrationStatus::DryRunQueued,
            Self::Migration => MigrationStatus::PreMigration,
        }
    }

    /// The status a claim flips the repository into.
    pub fn in_progress(self) -> MigrationStatus {
        match self {
            Self::DryRun => MigrationStatus::DryRunInProgress,
            Self::Migration => MigrationStatus::ArchiveGenerating,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Batch lifecycle status, derived from member statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    CompletedWithErrors,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "ready" => Some(Self::Ready),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "completed_with_errors" => Some(Self::CompletedWithErrors),
            _ => None,
        }
    }

    /// Statuses from which a batch run may be (re)started.
    pub fn can_start(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Ready | Self::CompletedWithErrors
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reduction of member statuses to the batch status. `started` is whether
/// the batch carries a `started_at` timestamp.
pub fn reduce_batch_status(members: &[MigrationStatus], started: bool) -> BatchStatus {
    if members.is_empty() {
        return if started {
            BatchStatus::Ready
        } else {
            BatchStatus::Pending
        };
    }

    if members.iter().any(|s| s.is_active()) {
        return BatchStatus::InProgress;
    }

    if members
        .iter()
        .all(|s| matches!(s, MigrationStatus::Complete | MigrationStatus::WontMigrate))
    {
        return BatchStatus::Completed;
    }

    if members.iter().all(|s| s.is_terminal() || s.is_failed())
        && members.iter().any(|s| s.is_failed())
    {
        return BatchStatus::CompletedWithErrors;
    }

    if started {
        BatchStatus::Ready
    } else {
        BatchStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MigrationStatus as S;

    const ALL: [S; 16] = [
        S::Pending,
        S::RemediationRequired,
        S::DryRunQueued,
        S::DryRunInProgress,
        S::DryRunComplete,
        S::DryRunFailed,
        S::PreMigration,
        S::ArchiveGenerating,
        S::QueuedForMigration,
        S::MigratingContent,
        S::MigrationComplete,
        S::MigrationFailed,
        S::PostMigration,
        S::Complete,
        S::RolledBack,
        S::WontMigrate,
    ];

    #[test]
    fn test_parse_round_trip() {
        for status in ALL {
            assert_eq!(S::parse(status.as_str()), Some(status));
        }
        assert_eq!(S::parse("bogus"), None);
    }

    #[test]
    fn test_happy_path_is_legal() {
        let path = [
            S::Pending,
            S::DryRunQueued,
            S::DryRunInProgress,
            S::DryRunComplete,
            S::PreMigration,
            S::ArchiveGenerating,
            S::QueuedForMigration,
            S::MigratingContent,
            S::MigrationComplete,
            S::PostMigration,
            S::Complete,
            S::RolledBack,
        ];
        for pair in path.windows(2) {
            assert!(
                is_legal_transition(pair[0], pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_retry_edges() {
        assert!(is_legal_transition(S::DryRunFailed, S::DryRunQueued));
        assert!(is_legal_transition(S::DryRunFailed, S::PreMigration));
        assert!(is_legal_transition(S::MigrationFailed, S::PreMigration));
        assert!(!is_legal_transition(S::MigrationFailed, S::DryRunQueued));
    }

    #[test]
    fn test_wont_migrate_round_trip() {
        assert!(is_legal_transition(S::Pending, S::WontMigrate));
        assert!(is_legal_transition(S::RemediationRequired, S::WontMigrate));
        assert!(is_legal_transition(S::WontMigrate, S::Pending));
        assert!(!is_legal_transition(S::DryRunComplete, S::WontMigrate));
        assert!(!is_legal_transition(S::Complete, S::WontMigrate));
    }

    #[test]
    fn test_remediation_from_non_terminal_only() {
        assert!(is_legal_transition(S::Pending, S::RemediationRequired));
        assert!(is_legal_transition(S::ArchiveGenerating, S::RemediationRequired));
        assert!(is_legal_transition(S::DryRunFailed, S::RemediationRequired));
        assert!(!is_legal_transition(S::Complete, S::RemediationRequired));
        assert!(!is_legal_transition(S::RolledBack, S::RemediationRequired));
        assert!(!is_legal_transition(S::WontMigrate, S::RemediationRequired));
    }

    #[test]
    fn test_rollback_only_from_complete() {
        for status in ALL {
            let legal = is_legal_transition(status, S::RolledBack);
            assert_eq!(legal, status == S::Complete, "{status}");
        }
    }

    #[test]
    fn test_self_transition_rejected() {
        for status in ALL {
            assert!(!is_legal_transition(status, status));
        }
    }

    #[test]
    fn test_early_migration_failure() {
        assert!(is_legal_transition(S::ArchiveGenerating, S::MigrationFailed));
        assert!(is_legal_transition(S::QueuedForMigration, S::MigrationFailed));
        assert!(!is_legal_transition(S::PreMigration, S::MigrationFailed));
    }

    #[test]
    fn test_phase_edges() {
        assert_eq!(Phase::DryRun.predecessor(), S::DryRunQueued);
        assert_eq!(Phase::DryRun.in_progress(), S::DryRunInProgress);
        assert_eq!(Phase::Migration.predecessor(), S::PreMigration);
        assert_eq!(Phase::Migration.in_progress(), S::ArchiveGenerating);
    }

    #[test]
    fn test_reduction_in_progress_wins() {
        let members = [S::Complete, S::MigratingContent, S::Pending];
        assert_eq!(reduce_batch_status(&members, true), BatchStatus::InProgress);
    }

    #[test]
    fn test_reduction_completed() {
        let members = [S::Complete, S::WontMigrate, S::Complete];
        assert_eq!(reduce_batch_status(&members, true), BatchStatus::Completed);
    }

    #[test]
    fn test_reduction_completed_with_errors() {
        let members = [S::Complete, S::MigrationFailed];
        assert_eq!(
            reduce_batch_status(&members, true),
            BatchStatus::CompletedWithErrors
        );
    }

    #[test]
    fn test_reduction_ready_vs_pending() {
        let members = [S::DryRunQueued, S::DryRunComplete];
        assert_eq!(reduce_batch_status(&members, true), BatchStatus::Ready);
        assert_eq!(reduce_batch_status(&members, false), BatchStatus::Pending);
    }
}
