use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pmq_engine::{QueryOrchestrator, QueryOutcome};
use pmq_storage::ReplicaGuard;
use pmq_sync::{ReplicaSync, SyncConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "pmq-cli")]
#[command(about = "Ask natural-language questions about prediction markets")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Copy the writer store into the read snapshot once.
    Sync,
    /// Keep the read snapshot fresh until Ctrl-C.
    Watch,
    /// Answer a single query.
    Ask {
        #[arg(required = true)]
        query: Vec<String>,
        /// Print the structured outcome as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Interactive session with background syncing.
    Chat,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pmq_cli=info,pmq_engine=info,pmq_sync=info,pmq_storage=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Sync => {
            let summary = pmq_sync::run_sync_once_from_env().await?;
            println!(
                "sync {}: sha256={} finished_at={}",
                if summary.synced { "complete" } else { "skipped" },
                summary.snapshot_sha256.as_deref().unwrap_or("-"),
                summary.finished_at.to_rfc3339()
            );
        }
        Commands::Watch => {
            let config = SyncConfig::from_env();
            let guard = ReplicaGuard::with_poll_interval(config.poll_interval);
            let sync = Arc::new(ReplicaSync::new(config, guard));
            sync.run_until(async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %err, "ctrl-c handler failed; stopping");
                }
            })
            .await?;
        }
        Commands::Ask { query, json } => {
            let config = SyncConfig::from_env();
            let guard = ReplicaGuard::with_poll_interval(config.poll_interval);
            let orchestrator = QueryOrchestrator::from_env(guard).await?;
            let outcome = orchestrator.process_query(&query.join(" ")).await;
            print_outcome(&outcome, json)?;
        }
        Commands::Chat => chat().await?,
    }

    Ok(())
}

fn print_outcome(outcome: &QueryOutcome, json: bool) -> Result<()> {
    if json {
        let body = serde_json::to_string_pretty(outcome).context("serializing outcome")?;
        println!("{body}");
    } else {
        println!("{}", outcome.display_text);
        if !outcome.context_queries.is_empty() {
            println!("\nSearch context: {}", outcome.context_queries.join(" | "));
        }
    }
    Ok(())
}

/// Query loop over stdin. One guard is shared by the query side and the
/// background sync job so a pass never swaps the snapshot under a scan.
async fn chat() -> Result<()> {
    let config = SyncConfig::from_env();
    let guard = ReplicaGuard::with_poll_interval(config.poll_interval);
    let sync = Arc::new(ReplicaSync::new(config, guard.clone()));
    let orchestrator = QueryOrchestrator::from_env(guard).await?;

    sync.run_once().await;
    let mut sched = sync.build_scheduler().await?;
    sched.start().await.context("starting sync scheduler")?;

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout.write_all(b"\n> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await.context("reading stdin")? else {
            break;
        };
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if matches!(query, "exit" | "quit") {
            break;
        }
        let outcome = orchestrator.process_query(query).await;
        print_outcome(&outcome, false)?;
    }

    sched.shutdown().await.context("stopping sync scheduler")?;
    Ok(())
}
