//! `memsync-inspect`: operator tooling for an on-disk write queue.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use memsync_queue::{EntryId, QueueEntry, QueueStats, QueueStore, SqliteQueueStore};

#[derive(Parser)]
#[command(name = "memsync-inspect")]
#[command(about = "Inspect and repair a memsync offline write queue")]
struct Cli {
    /// Queue database (defaults to the platform data directory).
    #[arg(long, env = "MEMSYNC_DB_PATH", global = true)]
    db: Option<PathBuf>,

    /// Print JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Per-state counts and age of the oldest pending entry.
    Stats,
    /// List dead-lettered entries.
    DeadLetters,
    /// Move a dead-lettered entry back to pending.
    Requeue { id: EntryId },
    /// Delete a dead-lettered entry.
    Purge { id: EntryId },
    /// Reset entries stuck in flight to pending.
    Recover,
}

#[tokio::main]
async fn main() -> Result<()> {
    memsync_observability::init();
    let cli = Cli::parse();

    let path = match cli.db {
        Some(path) => path,
        None => SqliteQueueStore::default_path()?,
    };
    let store = SqliteQueueStore::open(&path)
        .await
        .with_context(|| format!("failed to open queue database '{}'", path.display()))?;

    let result = run(&store, cli.command, cli.json).await;
    store.close().await;
    result
}

async fn run(store: &SqliteQueueStore, command: Command, json: bool) -> Result<()> {
    match command {
        Command::Stats => {
            let counts = store.count().await.context("failed to count entries")?;
            print_stats(&QueueStats::from_counts(counts, Utc::now()), json)
        }
        Command::DeadLetters => {
            let entries = store
                .list_dead_lettered()
                .await
                .context("failed to list dead letters")?;
            print_entries(&entries, json)
        }
        Command::Requeue { id } => {
            let entry = store
                .requeue_dead_letter(id, Utc::now())
                .await
                .with_context(|| format!("failed to requeue {id}"))?;
            println!("requeued {} (attempts so far: {})", entry.id, entry.attempt_count);
            Ok(())
        }
        Command::Purge { id } => {
            store
                .purge_dead_letter(id)
                .await
                .with_context(|| format!("failed to purge {id}"))?;
            println!("purged {id}");
            Ok(())
        }
        Command::Recover => {
            let recovered = store
                .recover_in_flight(Utc::now())
                .await
                .context("failed to recover in-flight entries")?;
            println!("recovered {recovered} in-flight entries");
            Ok(())
        }
    }
}

fn print_stats(stats: &QueueStats, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }
    println!("pending:       {}", stats.pending_count);
    println!("in flight:     {}", stats.in_flight_count);
    println!("dead-lettered: {}", stats.dead_lettered_count);
    match stats.oldest_pending_age {
        Some(age) => println!("oldest:        {}s", age.as_secs()),
        None => println!("oldest:        -"),
    }
    Ok(())
}

fn print_entries(entries: &[QueueEntry], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("no dead-lettered entries");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  attempts={}  created={}  bytes={}  error={}",
            entry.id,
            entry.attempt_count,
            entry.created_at.to_rfc3339(),
            entry.payload.len(),
            entry.last_error.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
