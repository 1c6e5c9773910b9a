use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use donation_ledger::cancel::CancellationToken;
use donation_ledger::config;
use donation_ledger::db::deletion::{self, RemoteDeleteOutcome};
use donation_ledger::db::query::{self, AuditQuery, HistoryFilter};
use donation_ledger::db::{self, outbound, schema};
use donation_ledger::model::{OutboundStatus, TransactionType};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(author, version, about = "Admin tool for the donation ledger database")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "ledger.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending schema migrations
    Migrate,
    /// Check the schema without changing it
    VerifySchema,
    /// List workflows, newest first
    History {
        #[arg(long)]
        constituent: Option<i64>,
        #[arg(long)]
        machine: Option<String>,
        #[arg(long)]
        user: Option<String>,
        /// Substring of constituent name, search hint or id
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long)]
        include_deleted: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Print the stored context of one workflow
    Show { workflow_id: Uuid },
    /// Gifts accepted by the remote API and not deleted
    Gifts {
        #[arg(long)]
        constituent: Option<i64>,
    },
    /// Dates with no bookable day-part left
    BookedDates {
        #[arg(long)]
        campaign: i64,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Active day-parts for one campaign day
    DayParts {
        #[arg(long)]
        campaign: i64,
        #[arg(long)]
        date: NaiveDate,
    },
    /// Active reservations within a date range
    Reservations {
        #[arg(long)]
        campaign: i64,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Search deletion snapshots
    Audit {
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Print the deletion snapshot of one workflow
    Snapshot { workflow_id: Uuid },
    /// Soft-delete a workflow's gift and release its sponsorship
    Delete {
        workflow_id: Uuid,
        #[arg(long)]
        reason: String,
    },
    /// Record the result of deleting the gift in the remote API
    RecordRemoteDelete {
        workflow_id: Uuid,
        /// Error reported by the remote API; omit when the delete succeeded
        #[arg(long)]
        error: Option<String>,
    },
    /// Inspect the outbound transaction queue
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<OutboundStatus>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    Show { workflow_id: Uuid },
}

fn parse_status(s: &str) -> Result<OutboundStatus, String> {
    OutboundStatus::parse(s)
        .ok_or_else(|| format!("unknown status {s:?} (pending, processing, succeeded, failed)"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("loading {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url(), &cfg.database).await?;
    let cancel = CancellationToken::new();

    match args.command {
        Command::VerifySchema => {
            schema::verify(&pool).await?;
            println!("schema ok (version {})", schema::latest_version());
            return Ok(());
        }
        Command::Migrate => {
            let applied = schema::ensure(&pool).await?;
            info!(?applied, "migrations applied");
            println!(
                "applied {} migration(s); database at version {}",
                applied.len(),
                schema::current_version(&pool).await?.unwrap_or(0)
            );
            return Ok(());
        }
        _ => {
            schema::ensure(&pool).await?;
        }
    }

    match args.command {
        Command::Migrate | Command::VerifySchema => {}
        Command::History {
            constituent,
            machine,
            user,
            search,
            since,
            include_deleted,
            limit,
        } => {
            let filter = HistoryFilter {
                constituent_id: constituent,
                machine_name: machine,
                user_name: user,
                search,
                since,
                include_deleted,
                limit,
            };
            print_json(&query::workflow_history(&pool, &filter).await?)?;
        }
        Command::Show { workflow_id } => {
            print_json(&query::load_workflow(&pool, workflow_id).await?)?;
        }
        Command::Gifts { constituent } => {
            print_json(&query::successful_gifts(&pool, constituent).await?)?;
        }
        Command::BookedDates { campaign, from, to } => {
            print_json(&query::fully_booked_dates(&pool, campaign, from, to).await?)?;
        }
        Command::DayParts { campaign, date } => {
            print_json(&query::reserved_day_parts(&pool, campaign, date).await?)?;
        }
        Command::Reservations { campaign, from, to } => {
            print_json(&query::reservations_between(&pool, campaign, from, to).await?)?;
        }
        Command::Audit {
            text,
            from,
            to,
            limit,
        } => {
            let audit = AuditQuery {
                text,
                deleted_from: from,
                deleted_to: to,
                limit,
            };
            print_json(&query::search_deletion_snapshots(&pool, &audit).await?)?;
        }
        Command::Snapshot { workflow_id } => {
            let snapshot = query::get_deletion_snapshot(&pool, workflow_id)
                .await?
                .ok_or_else(|| anyhow!("no deletion snapshot for workflow {workflow_id}"))?;
            print_json(&snapshot)?;
        }
        Command::Delete {
            workflow_id,
            reason,
        } => {
            let outcome =
                deletion::mark_deleted(&pool, workflow_id, &cfg.actor(), &reason, &cancel).await?;
            print_json(&outcome)?;
        }
        Command::RecordRemoteDelete { workflow_id, error } => {
            let outcome = match error {
                Some(error) => RemoteDeleteOutcome::failed(error),
                None => RemoteDeleteOutcome::succeeded(),
            };
            deletion::record_remote_delete_outcome(&pool, workflow_id, &outcome, &cancel).await?;
            println!("recorded remote delete outcome for {workflow_id}");
        }
        Command::Queue { command } => match command {
            QueueCommand::List { status, limit } => {
                print_json(&outbound::list_transactions(&pool, status, limit).await?)?;
            }
            QueueCommand::Show { workflow_id } => {
                let item =
                    outbound::get_transaction(&pool, workflow_id, TransactionType::PledgeCreate)
                        .await?
                        .ok_or_else(|| anyhow!("no queued pledge for workflow {workflow_id}"))?;
                print_json(&item)?;
            }
        },
    }
    Ok(())
}
