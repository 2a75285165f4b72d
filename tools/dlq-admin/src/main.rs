//! DLQ Admin: inspect, replay and archive Dead Letter Queue entries through
//! the admin API.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use dlq_admin::{render, AdminClient, ListParams};

#[derive(Parser, Debug)]
#[command(name = "dlq-admin")]
#[command(about = "Inspect and replay Dead Letter Queue entries")]
struct Cli {
    /// Admin API base URL
    #[arg(short, long, env = "DLQ_ADMIN_URL", default_value = "http://127.0.0.1:8081")]
    endpoint: String,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Print raw JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List entries, oldest first
    List {
        #[arg(long, default_value = "1")]
        page: usize,
        #[arg(long, default_value = "50")]
        page_size: usize,
        /// Substring of the original subject
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        error_type: Option<String>,
        #[arg(long)]
        consumer_service: Option<String>,
    },
    /// Show one entry
    Show { sequence: u64 },
    /// Depth and breakdowns
    Stats,
    /// Republish one entry to its original subject
    Replay {
        sequence: u64,
        /// Keep the entry (marked as replayed) instead of deleting it
        #[arg(long)]
        keep: bool,
    },
    /// Replay several entries
    ReplayBulk {
        #[arg(required = true, num_args = 1..)]
        sequences: Vec<u64>,
        #[arg(long)]
        keep: bool,
    },
    /// Move entries older than N days to the archive
    Archive {
        #[arg(long, default_value = "7")]
        older_than_days: u32,
        #[arg(long)]
        keep: bool,
    },
    /// Delete one entry
    Delete {
        sequence: u64,
        /// Required; deletion cannot be undone
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = AdminClient::new(&cli.endpoint, Duration::from_secs(cli.timeout))
        .context("failed to build HTTP client")?;

    match cli.command {
        Command::List {
            page,
            page_size,
            subject,
            error_type,
            consumer_service,
        } => {
            let params = ListParams {
                page: Some(page),
                page_size: Some(page_size),
                subject,
                error_type,
                consumer_service,
            };
            let result = client.list(&params).await?;
            if cli.json {
                print_json(&result)?;
            } else {
                println!("{}", render::page(&result));
            }
        }
        Command::Show { sequence } => print_json(&client.show(sequence).await?)?,
        Command::Stats => {
            let stats = client.stats().await?;
            if cli.json {
                print_json(&stats)?;
            } else {
                println!("{}", render::stats(&stats));
            }
        }
        Command::Replay { sequence, keep } => {
            print_json(&client.replay(sequence, !keep).await?)?;
        }
        Command::ReplayBulk { sequences, keep } => {
            let report = client.replay_bulk(&sequences, !keep).await?;
            print_json(&report)?;
            if report.failed > 0 {
                bail!("{} of {} replays failed", report.failed, sequences.len());
            }
        }
        Command::Archive {
            older_than_days,
            keep,
        } => print_json(&client.archive(older_than_days, !keep).await?)?,
        Command::Delete { sequence, yes } => {
            if !yes {
                bail!("refusing to delete entry {sequence} without --yes");
            }
            print_json(&client.delete(sequence).await?)?;
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
