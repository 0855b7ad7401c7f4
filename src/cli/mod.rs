//! Command-line interface for estate-etl.
//!
//! Provides commands for triggering runs, checking status, inspecting the
//! transition log, resuming failed runs, scheduling, and housekeeping.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{self, StorageSettings};
use crate::core::{Orchestrator, RunHandle};
use crate::domain::{Event, EventType, NodeState, Run, RunState};
use crate::etl::{configured_loader, configured_orchestrator, RecoveryAction};

/// estate-etl - Event-sourced ETL orchestrator for real-estate sales
#[derive(Parser, Debug)]
#[command(name = "estate-etl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Trigger a run and wait for it to finish
    Run {
        /// Source CSV (defaults to the configured source)
        #[arg(short, long, env = "ESTATE_ETL_SOURCE")]
        source: Option<PathBuf>,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,

        /// Print the run as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Print the transition log of a run
    Log {
        /// Run ID (UUID)
        run_id: String,
    },

    /// Re-execute a failed or interrupted run under the same ID
    Resume {
        /// Run ID to resume
        run_id: String,
    },

    /// Trigger runs on a fixed interval until interrupted
    Schedule {
        /// Seconds between triggers
        #[arg(long, default_value = "86400")]
        every_secs: u64,

        /// Source CSV (defaults to the configured source)
        #[arg(short, long, env = "ESTATE_ETL_SOURCE")]
        source: Option<PathBuf>,

        /// Stop after this many runs
        #[arg(long)]
        count: Option<u32>,
    },

    /// Repair an interrupted commit at the warehouse location
    Recover,

    /// Remove old runs and their staging directories
    Gc {
        /// Number of most recent runs to keep
        #[arg(short, long, default_value = "20")]
        keep: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run { source } => run_once(source).await,
            Commands::Status { run_id, json } => show_status(&run_id, json).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Log { run_id } => show_log(&run_id).await,
            Commands::Resume { run_id } => resume_run(&run_id).await,
            Commands::Schedule {
                every_secs,
                source,
                count,
            } => schedule(every_secs, source, count).await,
            Commands::Recover => recover().await,
            Commands::Gc { keep } => gc(keep).await,
            Commands::Config => show_config().await,
        }
    }
}

fn orchestrator() -> Result<Arc<Orchestrator>> {
    let cfg = config::config()?;
    Ok(Arc::new(configured_orchestrator(cfg)?))
}

fn resolve_source(source: Option<PathBuf>) -> Result<String> {
    let source = match source {
        Some(path) => path,
        None => config::config()?
            .source
            .clone()
            .context("No source given. Use --source <file> or set source.path in the config")?,
    };
    Ok(source.display().to_string())
}

fn parse_run_id(run_id: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id).with_context(|| format!("Invalid run ID: {}", run_id))
}

/// Trigger a run and wait for it
async fn run_once(source: Option<PathBuf>) -> Result<()> {
    let source = resolve_source(source)?;
    let orchestrator = orchestrator()?;

    let handle = orchestrator.trigger_run(source).await?;
    eprintln!("[Run {} started]", handle.run_id());

    let run = wait_with_cancel(&orchestrator, handle).await?;
    report(&run, "completed")
}

/// Wait for a run; the first Ctrl-C requests cancellation
async fn wait_with_cancel(orchestrator: &Orchestrator, handle: RunHandle) -> Result<Run> {
    let run_id = handle.run_id();
    let wait = handle.wait();
    tokio::pin!(wait);

    tokio::select! {
        result = &mut wait => result,
        _ = tokio::signal::ctrl_c() => {
            warn!(%run_id, "Interrupted, cancelling at the next node boundary");
            orchestrator.cancel(run_id);
            wait.await
        }
    }
}

fn report(run: &Run, verb: &str) -> Result<()> {
    let rejected = run.rejected_records.unwrap_or(0);
    match &run.state {
        RunState::Success => {
            eprintln!(
                "[Run {} {} successfully, {} records rejected]",
                run.id, verb, rejected
            );
        }
        RunState::Failed { error } => {
            eprintln!("[Run {} failed: {}]", run.id, error);
            std::process::exit(1);
        }
        RunState::Running => {
            eprintln!("[Run {} still running]", run.id);
        }
    }
    Ok(())
}

/// Show the status of a run
async fn show_status(run_id_str: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let orchestrator = orchestrator()?;
    let run = orchestrator.get_run_status(run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    println!("Run ID: {}", run.id);
    println!("Source: {}", run.source);
    println!("State: {}", state_label(&run.state));
    if let RunState::Failed { error } = &run.state {
        println!("Error: {}", error);
    }
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    if let Some(rejected) = run.rejected_records {
        println!("Rejected records: {}", rejected);
    }
    println!("\nNodes:");
    for node in &orchestrator.graph().nodes {
        let state = run.node_state(&node.name).unwrap_or(NodeState::Pending);
        let attempts = run.attempts.get(&node.name).copied().unwrap_or(0);
        println!("  {:<10} {:<9} attempts={}", node.name, state, attempts);
    }

    let artifacts = orchestrator.store().list_artifacts(run_id).await?;
    if !artifacts.is_empty() {
        println!("\nArtifacts:");
        for name in artifacts {
            println!("  {}", name);
        }
    }

    Ok(())
}

fn state_label(state: &RunState) -> &'static str {
    match state {
        RunState::Running => "running",
        RunState::Success => "success",
        RunState::Failed { .. } => "failed",
    }
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let orchestrator = orchestrator()?;
    let runs = orchestrator.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<10} {:<10} {:<25}", "RUN ID", "STATE", "REJECTED", "STARTED");
    println!("{}", "-".repeat(85));

    for run in runs {
        let rejected = run
            .rejected_records
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<10} {:<10} {:<25}",
            run.id,
            state_label(&run.state),
            rejected,
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

fn describe(event: &Event) -> String {
    match event.event_type {
        EventType::NodeTransition => {
            let node = event.node.as_deref().unwrap_or("?");
            let from = event.from.map(|s| s.to_string()).unwrap_or_default();
            let to = event.to.map(|s| s.to_string()).unwrap_or_default();
            format!("{:<10} {} -> {}", node, from, to)
        }
        EventType::RunStarted => "run started".to_string(),
        EventType::RunCompleted => "run completed".to_string(),
        EventType::RunFailed => "run failed".to_string(),
    }
}

/// Print the transition log of a run
async fn show_log(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let orchestrator = orchestrator()?;

    for event in orchestrator.transition_log(run_id).await? {
        let mut line = format!(
            "{}  {:<32} {}",
            event.timestamp.format("%H:%M:%S%.3f"),
            describe(&event),
            event.payload_summary
        );
        if let Some(error) = &event.error {
            line.push_str(&format!(" [error: {}]", error));
        }
        println!("{}", line);
    }

    Ok(())
}

/// Resume a failed or interrupted run
async fn resume_run(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let orchestrator = orchestrator()?;

    let handle = orchestrator.resume_run(run_id).await?;
    let run = wait_with_cancel(&orchestrator, handle).await?;
    report(&run, "resumed and completed")
}

/// Trigger runs on an interval
async fn schedule(every_secs: u64, source: Option<PathBuf>, count: Option<u32>) -> Result<()> {
    if every_secs == 0 {
        anyhow::bail!("--every-secs must be greater than zero");
    }

    let source = resolve_source(source)?;
    let orchestrator = orchestrator()?;
    let mut interval = tokio::time::interval(Duration::from_secs(every_secs));
    let mut triggered = 0u32;

    info!(every_secs, %source, "Scheduler started");
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Scheduler stopped");
                return Ok(());
            }
        }

        let handle = orchestrator.trigger_run(source.clone()).await?;
        let run = wait_with_cancel(&orchestrator, handle).await?;
        match &run.state {
            RunState::Failed { error } => warn!(run_id = %run.id, %error, "Scheduled run failed"),
            _ => info!(run_id = %run.id, "Scheduled run finished"),
        }

        triggered += 1;
        if count.is_some_and(|c| triggered >= c) {
            return Ok(());
        }
    }
}

/// Repair an interrupted commit
async fn recover() -> Result<()> {
    let loader = configured_loader(config::config()?)?;
    match loader.recover().await? {
        RecoveryAction::Clean => println!("Nothing to recover at {}", loader.target().location),
        RecoveryAction::RestoredBackup => {
            println!("Restored previous data at {}", loader.target().location)
        }
        RecoveryAction::DiscardedBackup => println!("Removed stale backup"),
    }
    Ok(())
}

/// Remove old runs beyond the most recent `keep`
async fn gc(keep: usize) -> Result<()> {
    let cfg = config::config()?;
    let orchestrator = orchestrator()?;
    let loader = configured_loader(cfg)?;

    let runs = orchestrator.list_runs(usize::MAX).await?;
    let mut removed = 0;
    for run in runs.into_iter().skip(keep) {
        if run.is_running() {
            continue;
        }
        loader.discard_staging(run.id).await?;
        orchestrator.store().remove(run.id).await?;
        removed += 1;
    }

    println!("Removed {} run(s)", removed);
    Ok(())
}

/// Show the resolved configuration (for debugging)
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("estate-etl configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:   {}", cfg.home.display());
    println!("  Runs:   {}", cfg.runs_dir().display());
    println!("  Locks:  {}", cfg.locks_dir().display());
    println!(
        "  Source: {}",
        cfg.source
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(not set)".to_string())
    );
    println!();
    println!("Storage:");
    match &cfg.storage {
        StorageSettings::Local { root } => println!("  Local filesystem at {}", root.display()),
        StorageSettings::WebHdfs {
            namenode_url, user, ..
        } => println!("  WebHDFS {} as {}", namenode_url, user),
    }
    println!();
    println!("Warehouse:");
    println!("  Location:     {}", cfg.warehouse.location);
    println!("  File:         {}", cfg.warehouse.file_name);
    println!("  Staging root: {}", cfg.warehouse.staging_root);
    println!();
    println!("Limits:");
    println!(
        "  Max rejection ratio: {}",
        cfg.limits
            .max_rejection_ratio
            .map(|r| r.to_string())
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!("  Node timeout:        {}s", cfg.limits.node_timeout_seconds);
    println!("  Run timeout:         {}s", cfg.limits.run_timeout_seconds);
    println!();
    println!("Nodes:");
    for node in &cfg.task_graph().nodes {
        let policy = &node.retry_policy;
        println!(
            "  {:<10} retries={} delay={}ms x{} (max {}ms)",
            node.name,
            policy.max_retries,
            policy.initial_delay_ms,
            policy.backoff_multiplier,
            policy.max_delay_ms
        );
    }

    Ok(())
}
