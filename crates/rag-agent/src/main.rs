//! `rag-agent` command line.
//!
//! ```bash
//! # Ask one question, printing the SSE stream
//! rag-agent --config rag.toml ask --user alice "What did we decide about retries?"
//!
//! # Component health as JSON
//! rag-agent --config rag.toml status
//! ```

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coordination::Tier;
use rag_agent::{build_app, RagConfig, TurnRequest};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML config file; `RAG_*` environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one turn and print its events as server-sent events
    Ask {
        #[arg(long, default_value = "cli")]
        user: String,

        /// lite, flash or pro (defaults to the configured tier)
        #[arg(long)]
        tier: Option<Tier>,

        question: String,
    },
    /// Print component health as JSON
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = RagConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    info!(
        providers = config.gateway.providers.len(),
        persistent_memory = config.memory.database_url.is_some(),
        verify = config.orchestrator.verify_answers,
        "Configuration loaded"
    );

    let app = build_app(&config).await?;

    match cli.command {
        Command::Ask {
            user,
            tier,
            question,
        } => {
            let mut request = TurnRequest::new(user, question);
            if let Some(tier) = tier {
                request = request.with_tier(tier);
            }
            let (mut events, handle) = app.orchestrator.spawn_turn(request);
            while let Some(event) = events.recv().await {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(event.to_sse()?.as_bytes())?;
                stdout.flush()?;
            }
            let record = handle.await.context("Turn task failed")?;
            info!(outcome = %record.outcome, elapsed_ms = record.elapsed_ms, "Turn complete");
        }
        Command::Status => {
            let report = app.probe.report().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    app.shutdown().await;
    Ok(())
}
