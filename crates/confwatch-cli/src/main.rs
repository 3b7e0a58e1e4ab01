use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use confwatch_notify::{chunk_message, deliver, publish_document, PublishOutcome};
use confwatch_sync::{
    init_store, latest_document, pending_changes, upcoming, SyncConfig, SyncPipeline,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "confwatch")]
#[command(about = "Keeps a catalog of recurring conferences current and reports what changed")]
struct Cli {
    /// Directory holding versions, rendered documents, snapshots and the post log.
    #[arg(long, global = true, env = "CONFWATCH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Run date (YYYY-MM-DD); defaults to the local date.
    #[arg(long, global = true)]
    today: Option<NaiveDate>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Probe every source, reconcile changes and notify.
    Sync,
    /// Seed an empty store with a catalog file.
    Init {
        #[arg(long)]
        catalog: PathBuf,
    },
    /// Print the latest rendered document.
    Render,
    /// Print the change message between the two latest documents without sending it.
    Diff,
    /// Post the latest document, one category per message.
    Publish,
    /// List conferences and deadlines in the next month.
    Upcoming {
        /// Send the digest to the notification sink instead of printing it.
        #[arg(long)]
        send: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("confwatch=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config = config.with_data_dir(dir);
    }
    if let Some(today) = cli.today {
        config = config.with_today(today);
    }

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = SyncPipeline::new(config)?.run_once().await?;
            println!(
                "sync complete: run_id={} entities={} urls_changed={} oracle_calls={} version={} chunks_sent={}",
                summary.run_id,
                summary.entities,
                summary.urls_changed,
                summary.oracle_calls,
                summary.version_key.as_deref().unwrap_or("unchanged"),
                summary.chunks_sent
            );
        }
        Commands::Init { catalog } => {
            let key = init_store(&config, &catalog).await?;
            println!("initialized {} with version {key}", config.data_dir.display());
        }
        Commands::Render => match latest_document(&config).await? {
            Some(text) => println!("{text}"),
            None => eprintln!("no rendered document yet"),
        },
        Commands::Diff => match pending_changes(&config.record_store(), config.today).await? {
            Some(report) => println!("{}", report.message),
            None => eprintln!("no changes detected"),
        },
        Commands::Publish => {
            let sink = config.notification_sink()?;
            match publish_document(&config.record_store(), sink.as_ref(), config.message_limit)
                .await?
            {
                PublishOutcome::NoDocument => eprintln!("no rendered document yet"),
                PublishOutcome::AlreadyPosted(key) => eprintln!("document {key} already posted"),
                PublishOutcome::Posted { key, chunks } => {
                    println!("posted document {key} in {chunks} message(s)")
                }
            }
        }
        Commands::Upcoming { send } => match upcoming(&config).await? {
            Some(digest) if send => {
                let sink = config.notification_sink()?;
                let report =
                    deliver(sink.as_ref(), &chunk_message(&digest, config.message_limit)).await;
                info!(sent = report.sent, failed = report.failed, "upcoming digest delivered");
            }
            Some(digest) => println!("{digest}"),
            None => eprintln!("nothing upcoming in the next month"),
        },
    }

    Ok(())
}
