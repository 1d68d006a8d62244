//! CLI entry point for daq-plan
//!
//! Runs or validates experiment plans described in TOML plan files.
//!
//! # Usage
//!
//! Run a plan:
//! ```bash
//! daq-plan run plans/tensile_demo.toml
//! ```
//!
//! Check a plan file without running it:
//! ```bash
//! daq-plan validate plans/tensile_demo.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_plan::config::AppConfig;
use daq_plan::experiment::{ExperimentEvent, LocalDataDirectory, PlanEvent, PlanServices, TracingTerminal};
use daq_plan::logging;
use daq_plan::plan_file::PlanDefinition;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "daq-plan")]
#[command(about = "Run experiment plans of segments and triggers", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/daq_plan.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a plan until its last segment completes
    Run {
        /// Path to the plan file
        plan: PathBuf,

        /// Give up after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Parse and check a plan file
    Validate {
        /// Path to the plan file
        plan: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .context("Failed to load configuration")?;
    config.validate()?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Run { plan, timeout_secs } => run_plan(&config, plan, timeout_secs.map(Duration::from_secs)).await,
        Commands::Validate { plan } => validate_plan(&config, plan),
    }
}

fn validate_plan(config: &AppConfig, path: PathBuf) -> Result<()> {
    let definition = PlanDefinition::from_file(&path)?;
    let loaded = definition
        .build(PlanServices::default(), config.engine.default_poll_period())
        .with_context(|| format!("Plan {} is not valid", path.display()))?;

    println!("{}", loaded.plan);
    println!("Plan '{}' is valid", definition.name);
    Ok(())
}

async fn run_plan(config: &AppConfig, path: PathBuf, timeout: Option<Duration>) -> Result<()> {
    let definition = PlanDefinition::from_file(&path)?;
    let services = PlanServices {
        data_directory: Arc::new(LocalDataDirectory::new(&config.storage.data_dir)),
        terminal: Arc::new(TracingTerminal),
    };
    let loaded = definition.build(services, config.engine.default_poll_period())?;
    let plan = Arc::clone(&loaded.plan);

    let mut events = plan.subscribe();
    loaded.start()?;

    let follow = async {
        loop {
            match events.recv().await {
                Ok(PlanEvent::Started { plan: name, run_uid }) => info!(plan = %name, %run_uid, "Run started"),
                Ok(PlanEvent::Record(event)) => report(&event),
                Ok(PlanEvent::Finished { .. }) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(missed)) => warn!(missed, "Event stream lagged"),
            }
        }
    };

    match timeout {
        Some(limit) => {
            if tokio::time::timeout(limit, follow).await.is_err() {
                loaded.stop_drivers();
                anyhow::bail!("Plan '{}' did not finish within {:?}", plan.name(), limit);
            }
        }
        None => follow.await,
    }
    loaded.stop_drivers();

    let record = plan.experiment_record()?;
    println!("{}", record.summary());

    if config.storage.save_record {
        let dir = plan
            .experiment_data_dir()
            .unwrap_or_else(|| config.storage.data_dir.clone());
        let file = dir.join(format!("record-{}.json", record.run_uid));
        record.save(&file)?;
        info!(path = %file.display(), "Experiment record saved");
    }
    Ok(())
}

fn report(event: &ExperimentEvent) {
    match event {
        ExperimentEvent::SegmentActivated {
            segment,
            sample_environment,
            ..
        } => info!(%segment, sev = ?sample_environment, "Segment activated"),
        ExperimentEvent::SegmentComplete {
            segment,
            terminating_signal,
            ..
        } => info!(%segment, terminating_signal, "Segment complete"),
        ExperimentEvent::TriggerOccurred {
            trigger,
            segment,
            triggering_signal,
            ..
        } => info!(%trigger, segment = ?segment, triggering_signal, "Trigger occurred"),
    }
}
