//! Operator CLI for the gitshift migration orchestrator.
//!
//! Binds the core's command/query surface for store-facing operations:
//! sources, repositories, batches, history and logs. Driver-backed
//! commands require a configured destination driver; this binary ships
//! with a placeholder that reports the missing configuration instead.

mod null_driver;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gitshift_common::AppConfig;
use gitshift_core::ctx::Ctx;
use gitshift_core::model::ModelManager;
use gitshift_core::model::batch::{BatchBmc, BatchForCreate};
use gitshift_core::model::filter::RepositoryFilter;
use gitshift_core::model::migration_history::MigrationHistoryBmc;
use gitshift_core::model::migration_log::{LogFilter, LogLevel, MigrationLogBmc};
use gitshift_core::model::repository::RepositoryBmc;
use gitshift_core::model::discovery_progress::DiscoveryProgressBmc;
use gitshift_core::model::source::{SourceBmc, SourceForCreate, SourceType};
use gitshift_core::model::status::MigrationStatus;
use gitshift_core::scheduler::Scheduler;
use gitshift_core::types::{BatchId, RepositoryId, SourceId};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "gitshift", version, about = "Repository migration orchestrator")]
struct Cli {
    /// Emit JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage configured sources
    Source {
        #[command(subcommand)]
        command: SourceCmd,
    },
    /// Inspect and manage repositories
    Repo {
        #[command(subcommand)]
        command: RepoCmd,
    },
    /// Manage batches
    Batch {
        #[command(subcommand)]
        command: BatchCmd,
    },
    /// Migration history for one repository
    History { full_name: String },
    /// Migration logs for one repository
    Logs {
        full_name: String,
        #[arg(long)]
        level: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Latest discovery progress
    Progress,
}

#[derive(Subcommand)]
enum SourceCmd {
    List,
    Add {
        name: String,
        /// github or azuredevops
        #[arg(long, value_name = "TYPE")]
        source_type: String,
        #[arg(long)]
        base_url: String,
        #[arg(long)]
        token: Option<String>,
    },
    Delete { id: i64 },
}

#[derive(Subcommand)]
enum RepoCmd {
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        batch: Option<i64>,
        #[arg(long)]
        organization: Option<String>,
        #[arg(long)]
        search: Option<String>,
        /// Only repositories without a batch
        #[arg(long)]
        available: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    Show { full_name: String },
    /// Mark (or unmark) a repository as won't-migrate
    WontMigrate {
        full_name: String,
        #[arg(long)]
        unmark: bool,
    },
    /// Force-complete repositories migrated outside the orchestrator
    MarkMigrated { ids: Vec<i64> },
    /// Clear a stale source lock
    Unlock { full_name: String },
    /// Roll back a completed migration
    Rollback {
        full_name: String,
        #[arg(long)]
        reason: String,
    },
}

#[derive(Subcommand)]
enum BatchCmd {
    List,
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        batch_type: Option<String>,
        #[arg(long)]
        destination_org: Option<String>,
    },
    Delete { id: i64 },
    Add { id: i64, repo_ids: Vec<i64> },
    Remove { id: i64, repo_ids: Vec<i64> },
    Start {
        id: i64,
        #[arg(long)]
        skip_dry_run: bool,
    },
    DryRun {
        id: i64,
        #[arg(long)]
        only_pending: bool,
    },
    Retry { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    gitshift_common::tracing::setup_tracing(cli.json);

    let config = Arc::new(AppConfig::load()?);
    let mm = ModelManager::new(config).await?;
    let scheduler = Scheduler::new(
        mm.clone(),
        Arc::new(null_driver::UnconfiguredDriver),
        Arc::new(null_driver::UnconfiguredSources),
    );
    let ctx = Ctx::operator(whoami());

    run(&cli, &ctx, &mm, &scheduler).await?;
    scheduler.shutdown().await;
    Ok(())
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "operator".to_string())
}

async fn run(cli: &Cli, ctx: &Ctx, mm: &ModelManager, scheduler: &Scheduler) -> Result<()> {
    match &cli.command {
        Command::Source { command } => match command {
            SourceCmd::List => {
                let sources = SourceBmc::list(ctx, mm).await?;
                emit(cli.json, &sources, |s| {
                    for source in s {
                        println!(
                            "{}\t{}\t{}\t{} repos",
                            source.id, source.name, source.source_type, source.repository_count
                        );
                    }
                });
            }
            SourceCmd::Add {
                name,
                source_type,
                base_url,
                token,
            } => {
                let source_type = SourceType::parse(source_type)
                    .ok_or_else(|| anyhow::anyhow!("unknown source type '{source_type}'"))?;
                let id = SourceBmc::create(
                    ctx,
                    mm,
                    SourceForCreate {
                        name: name.clone(),
                        source_type,
                        base_url: base_url.clone(),
                        token: token.clone(),
                        app_credentials: None,
                    },
                )
                .await?;
                println!("created source {id}");
            }
            SourceCmd::Delete { id } => {
                SourceBmc::delete(ctx, mm, SourceId::new(*id)).await?;
                println!("deleted source {id}");
            }
        },
        Command::Repo { command } => match command {
            RepoCmd::List {
                status,
                batch,
                organization,
                search,
                available,
                limit,
                offset,
            } => {
                let status = match status {
                    Some(s) => vec![
                        MigrationStatus::parse(s)
                            .ok_or_else(|| anyhow::anyhow!("unknown status '{s}'"))?,
                    ],
                    None => Vec::new(),
                };
                let filter = RepositoryFilter {
                    status,
                    batch_id: batch.map(BatchId::new),
                    organization: organization.clone().into_iter().collect(),
                    search: search.clone(),
                    available_for_batch: *available,
                    limit: Some(*limit),
                    offset: Some(*offset),
                    ..Default::default()
                };
                let repos = RepositoryBmc::list(ctx, mm, &filter).await?;
                emit(cli.json, &repos, |repos| {
                    for repo in repos {
                        println!(
                            "{}\t{}\t{}\t{}",
                            repo.id,
                            repo.full_name,
                            repo.status,
                            repo.batch_id.map_or("-".to_string(), |b| b.to_string())
                        );
                    }
                });
            }
            RepoCmd::Show { full_name } => {
                let repo = RepositoryBmc::get(ctx, mm, full_name.as_str()).await?;
                println!("{}", serde_json::to_string_pretty(&repo)?);
            }
            RepoCmd::WontMigrate { full_name, unmark } => {
                scheduler.mark_wont_migrate(ctx, full_name, *unmark).await?;
                println!("{full_name}: {}", if *unmark { "unmarked" } else { "marked" });
            }
            RepoCmd::MarkMigrated { ids } => {
                let ids: Vec<RepositoryId> = ids.iter().map(|id| RepositoryId::new(*id)).collect();
                let report = scheduler
                    .batch_update_repository_status(
                        ctx,
                        &ids,
                        gitshift_core::scheduler::BulkAction::MarkMigrated,
                        None,
                    )
                    .await?;
                println!("updated {}, failed {}", report.updated, report.failed);
                for error in report.errors {
                    eprintln!("  {error}");
                }
            }
            RepoCmd::Unlock { full_name } => {
                scheduler.unlock_repository(ctx, full_name).await?;
                println!("{full_name}: unlocked");
            }
            RepoCmd::Rollback { full_name, reason } => {
                scheduler.rollback_repository(ctx, full_name, reason).await?;
                println!("{full_name}: rolled back");
            }
        },
        Command::Batch { command } => match command {
            BatchCmd::List => {
                let batches = BatchBmc::list(ctx, mm).await?;
                emit(cli.json, &batches, |batches| {
                    for batch in batches {
                        println!(
                            "{}\t{}\t{}\t{} repos",
                            batch.id, batch.name, batch.status, batch.repository_count
                        );
                    }
                });
            }
            BatchCmd::Create {
                name,
                description,
                batch_type,
                destination_org,
            } => {
                let id = BatchBmc::create(
                    ctx,
                    mm,
                    BatchForCreate {
                        name: name.clone(),
                        description: description.clone(),
                        batch_type: batch_type.clone(),
                        destination_org: destination_org.clone(),
                        migration_api: Default::default(),
                        exclude: Default::default(),
                    },
                )
                .await?;
                println!("created batch {id}");
            }
            BatchCmd::Delete { id } => {
                BatchBmc::delete(ctx, mm, BatchId::new(*id)).await?;
                println!("deleted batch {id}");
            }
            BatchCmd::Add { id, repo_ids } => {
                let ids: Vec<RepositoryId> =
                    repo_ids.iter().map(|r| RepositoryId::new(*r)).collect();
                let changes = BatchBmc::add_repositories(ctx, mm, BatchId::new(*id), &ids).await?;
                for change in changes {
                    match change.reason {
                        None => println!("{}: added", change.id),
                        Some(reason) => println!("{}: skipped ({reason})", change.id),
                    }
                }
            }
            BatchCmd::Remove { id, repo_ids } => {
                let ids: Vec<RepositoryId> =
                    repo_ids.iter().map(|r| RepositoryId::new(*r)).collect();
                let changes =
                    BatchBmc::remove_repositories(ctx, mm, BatchId::new(*id), &ids).await?;
                for change in changes {
                    match change.reason {
                        None => println!("{}: removed", change.id),
                        Some(reason) => println!("{}: skipped ({reason})", change.id),
                    }
                }
            }
            BatchCmd::Start { id, skip_dry_run } => {
                scheduler
                    .start_batch(ctx, BatchId::new(*id), *skip_dry_run)
                    .await?;
                println!("batch {id} started");
            }
            BatchCmd::DryRun { id, only_pending } => {
                scheduler
                    .start_batch_dry_run(ctx, BatchId::new(*id), *only_pending)
                    .await?;
                println!("batch {id} dry run started");
            }
            BatchCmd::Retry { id } => {
                let retried = scheduler
                    .retry_batch_failures(ctx, BatchId::new(*id), None)
                    .await?;
                println!("re-queued {retried} repositories");
            }
        },
        Command::History { full_name } => {
            let repo = RepositoryBmc::get(ctx, mm, full_name.as_str()).await?;
            let history = MigrationHistoryBmc::list_for_repository(ctx, mm, repo.id).await?;
            emit(cli.json, &history, |rows| {
                for row in rows {
                    println!(
                        "{}\t{}\t{}\t{}s\t{}",
                        row.started_at,
                        row.phase,
                        row.status,
                        row.duration_seconds.unwrap_or(0),
                        row.message.as_deref().unwrap_or("")
                    );
                }
            });
        }
        Command::Logs {
            full_name,
            level,
            limit,
            offset,
        } => {
            let repo = RepositoryBmc::get(ctx, mm, full_name.as_str()).await?;
            let level = match level {
                Some(l) => Some(
                    LogLevel::parse(&l.to_uppercase())
                        .ok_or_else(|| anyhow::anyhow!("unknown log level '{l}'"))?,
                ),
                None => None,
            };
            let logs = MigrationLogBmc::list(
                ctx,
                mm,
                &LogFilter {
                    repository_id: Some(repo.id),
                    level,
                    phase: None,
                    limit: Some(*limit),
                    offset: Some(*offset),
                },
            )
            .await?;
            emit(cli.json, &logs, |rows| {
                for row in rows {
                    println!(
                        "{}\t{}\t{}\t{}",
                        row.timestamp,
                        row.level,
                        row.operation.as_deref().unwrap_or("-"),
                        row.message
                    );
                }
            });
        }
        Command::Progress => match DiscoveryProgressBmc::latest(ctx, mm).await? {
            Some(progress) => println!("{}", serde_json::to_string_pretty(&progress)?),
            None => println!("no discovery runs recorded"),
        },
    }
    Ok(())
}

fn emit<T: serde::Serialize>(json: bool, value: &T, text: impl FnOnce(&T)) {
    if json {
        match serde_json::to_string_pretty(value) {
            Ok(rendered) => println!("{rendered}"),
            Err(err) => eprintln!("failed to render: {err}"),
        }
    } else {
        text(value);
    }
}
