//! Command-line interface for docflow.
//!
//! Provides commands for handling trigger events, running the pipeline for
//! one document, serving HTTP, and inspecting the run journal.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::config::{Config, CONFIG_ENV};
use crate::core::EventStore;
use crate::domain::{EventType, ProcessId};
use crate::handler::DocumentHandler;
use crate::server::Server;

/// docflow - document pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "docflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (YAML, snake_case keys; environment variables win)
    #[arg(long, global = true, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Handle one trigger event and print the response envelope
    Invoke {
        /// Event file (reads from stdin if not provided)
        #[arg(short, long)]
        event: Option<PathBuf>,
    },

    /// Run the pipeline for one object
    Run {
        #[arg(short, long)]
        bucket: String,

        #[arg(short, long)]
        key: String,

        /// Use this process id instead of deriving one (test runs)
        #[arg(long)]
        process_id: Option<String>,
    },

    /// Start the HTTP host
    Serve {
        /// Address to bind to
        #[arg(short, long, default_value = "127.0.0.1:9000")]
        address: SocketAddr,
    },

    /// Show the journal of one run
    Status {
        /// Process ID
        process_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = Config::load(self.config.as_deref()).context("Invalid configuration")?;

        match self.command {
            Commands::Invoke { event } => invoke(&config, event.as_deref()).await,
            Commands::Run {
                bucket,
                key,
                process_id,
            } => run_document(&config, &bucket, &key, process_id).await,
            Commands::Serve { address } => serve(&config, address).await,
            Commands::Status { process_id } => show_status(&config, &process_id).await,
            Commands::Runs { limit } => list_runs(&config, limit).await,
            Commands::Config => show_config(&config),
        }
    }
}

async fn invoke(config: &Config, event: Option<&Path>) -> Result<()> {
    let text = match event {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event file: {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read event from stdin")?;
            buffer
        }
    };

    let raw: Value = serde_json::from_str(&text).context("Event is not valid JSON")?;

    let handler = DocumentHandler::from_config(config)?;
    let response = handler.handle(&raw).await;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn run_document(
    config: &Config,
    bucket: &str,
    key: &str,
    process_id: Option<String>,
) -> Result<()> {
    let handler = DocumentHandler::from_config(config)?;

    let result = handler
        .run(bucket, key, process_id.map(ProcessId::external))
        .await
        .context("Could not start the run")?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn serve(config: &Config, address: SocketAddr) -> Result<()> {
    let handler = DocumentHandler::from_config(config)?;
    Server::new(handler).run(address).await
}

async fn show_status(config: &Config, process_id: &str) -> Result<()> {
    let process_id = ProcessId::external(process_id);
    let store = EventStore::existing(&config.journal_dir, &process_id)
        .with_context(|| format!("No journal found for {}", process_id))?;

    let events = store.replay().await?;

    println!("Process ID: {}", process_id);
    println!("Journal: {}", store.events_path().display());
    match events.iter().rev().find(|e| e.is_terminal()) {
        Some(terminal) => println!("Outcome: {:?}", terminal.event_type),
        None => println!("Outcome: in progress (or interrupted)"),
    }
    println!("\nEvents:");
    for event in &events {
        println!(
            "  {} {:<18} {:<22} {}",
            event.timestamp.format("%H:%M:%S%.3f"),
            format!("{:?}", event.event_type),
            event.tool.as_deref().unwrap_or("-"),
            event.payload_summary
        );
        if let Some(error) = &event.error {
            println!("      error: {}", error);
        }
    }

    Ok(())
}

async fn list_runs(config: &Config, limit: usize) -> Result<()> {
    let ids = EventStore::list_runs(&config.journal_dir).await?;

    let mut runs = Vec::new();
    for id in ids {
        let Some(store) = EventStore::existing(&config.journal_dir, &id) else {
            continue;
        };
        let events = store.replay().await?;
        let Some(first) = events.first() else {
            continue;
        };
        let outcome = match events.iter().rev().find(|e| e.is_terminal()) {
            Some(e) if e.event_type == EventType::RunCompleted => "completed",
            Some(e) if e.event_type == EventType::RunAborted => "aborted",
            Some(_) => "failed",
            None => "running",
        };
        runs.push((first.timestamp, id, outcome, first.payload_summary.clone()));
    }

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    // Most recent first
    runs.sort_by(|a, b| b.0.cmp(&a.0));

    println!("{:<38} {:<20} {:<10} {}", "PROCESS ID", "STARTED", "OUTCOME", "DOCUMENT");
    println!("{}", "-".repeat(96));

    for (started, id, outcome, summary) in runs.into_iter().take(limit) {
        println!(
            "{:<38} {:<20} {:<10} {}",
            id,
            started.format("%Y-%m-%d %H:%M:%S"),
            outcome,
            summary
        );
    }

    Ok(())
}

fn show_config(config: &Config) -> Result<()> {
    println!("{}", serde_yaml::to_string(config).context("Failed to render configuration")?);
    Ok(())
}
