use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fira::models::{FiraConfig, TaskStatus};
use fira::rpc::FrontDoor;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fira", about = "Financial Information Research Agent")]
struct Cli {
    /// Path to configuration file. Built-in defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer JSON-RPC requests, one per stdin line, one response per stdout line
    Serve,

    /// Research one company and print the finished task as JSON
    Research {
        ticker: String,

        /// Company name passed to the news and sentiment baskets
        #[arg(long, default_value = "")]
        company: String,

        /// Seconds between status polls
        #[arg(long, default_value_t = 0.25)]
        poll: f64,

        /// Pretty-print the output JSON
        #[arg(long)]
        pretty: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => fira::load_config(path)?,
        None => FiraConfig::default(),
    };
    let engine = fira::build_engine(&config)?;

    match cli.command {
        Command::Serve => serve(FrontDoor::new(engine)).await,
        Command::Research {
            ticker,
            company,
            poll,
            pretty,
        } => {
            let poll = Duration::try_from_secs_f64(poll).context("Invalid --poll value")?;
            let id = engine.submit(&ticker, &company).await;

            let task = tokio::select! {
                task = engine.wait(&id, poll) => task?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received interrupt, cancelling research");
                    engine.cancel(&id).await?;
                    engine.wait(&id, poll).await?
                }
            };

            let output = if pretty {
                serde_json::to_string_pretty(&task)?
            } else {
                serde_json::to_string(&task)?
            };
            println!("{output}");

            if task.status == TaskStatus::Failed {
                anyhow::bail!(
                    "Research failed: {}",
                    task.error.as_deref().unwrap_or("unknown error")
                );
            }
            Ok(())
        }
    }
}

async fn serve(door: FrontDoor) -> Result<()> {
    tracing::info!("Serving JSON-RPC on stdio");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let Some(response) = door.handle_line(&line).await else {
            continue;
        };
        let mut text = serde_json::to_string(&response)?;
        text.push('\n');
        stdout
            .write_all(text.as_bytes())
            .await
            .context("Failed to write response")?;
        stdout.flush().await?;
    }

    tracing::info!("stdin closed, shutting down");
    Ok(())
}
