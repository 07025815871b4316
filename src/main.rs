//! CLI Entry Point for sweep_daq
//!
//! Provides command-line interface for:
//! - Running a sweep definition against its simulated resources
//! - Pre-flight checking a definition without running it
//!
//! # Usage
//!
//! Run a sweep, exporting to `./data`:
//! ```bash
//! sweep_daq run sweeps/iv_curve.toml --export-dir ./data
//! ```
//!
//! Check a definition:
//! ```bash
//! sweep_daq check sweeps/iv_curve.toml
//! ```
//!
//! Ctrl-C during a run pauses it and asks whether to abort or resume. A
//! second Ctrl-C at the prompt aborts. Rows captured so far are flushed.

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sweep_daq::capture::export::{prepare_export_path, CsvExport};
use sweep_daq::capture::notify::SamplingBus;
use sweep_daq::capture::CapturePipeline;
use sweep_daq::config::SweepConfig;
use sweep_daq::definition::SweepDefinition;
use sweep_daq::sweep::status::format_hms;
use sweep_daq::sweep::{
    bind_resources, AbortReason, SweepControl, SweepController, SweepOutcome, SweepStatus,
};
use sweep_daq::tracing_setup;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "sweep_daq")]
#[command(about = "Nested instrument sweeps with buffered capture", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sweep definition
    Run {
        /// Path to the sweep definition (.toml)
        definition: PathBuf,

        /// Optional configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Repeat the sweep until interrupted
        #[arg(long)]
        continuous: bool,

        /// Directory receiving the CSV export
        #[arg(long)]
        export_dir: Option<PathBuf>,

        /// Do not write a CSV export
        #[arg(long)]
        no_export: bool,

        /// Print status as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Validate a sweep definition without running it
    Check {
        /// Path to the sweep definition (.toml)
        definition: PathBuf,

        /// Optional configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            definition,
            config,
            continuous,
            export_dir,
            no_export,
            json,
        } => {
            let mut config = load_config(config.as_deref())?;
            config.controller.continuous |= continuous;
            if export_dir.is_some() {
                config.capture.export_dir = export_dir;
            }
            if no_export {
                config.capture.export_enabled = false;
            }
            tracing_setup::init_from_config(&config).map_err(anyhow::Error::msg)?;
            run_sweep(&definition, config, json).await
        }
        Commands::Check { definition, config } => {
            let config = load_config(config.as_deref())?;
            tracing_setup::init_from_config(&config).map_err(anyhow::Error::msg)?;
            check_definition(&definition, &config)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<SweepConfig> {
    let config = match path {
        Some(path) => SweepConfig::load_from(path),
        None => SweepConfig::load(),
    };
    config.context("Failed to load configuration")
}

fn load_definition(path: &Path) -> Result<SweepDefinition> {
    SweepDefinition::load(path)
        .with_context(|| format!("Failed to load sweep definition '{}'", path.display()))
}

async fn run_sweep(path: &Path, config: SweepConfig, json: bool) -> Result<()> {
    let definition = load_definition(path)?;
    let space = definition.space()?;
    let bindings = bind_resources(&space, &definition.registry())?;

    let bus = SamplingBus::default();
    let mut pipeline =
        CapturePipeline::new(config.capture.max_buf_size, bindings.input_names(), bus.clone());
    if config.capture.export_enabled {
        let export_path = prepare_export_path(config.capture.export_dir.as_deref(), &Local::now())?;
        let export = CsvExport::create(&export_path, &space.header())?;
        println!("Exporting to {}", export_path.display());
        pipeline = pipeline.with_export(Box::new(export));
    }

    let poll_interval = config.controller.poll_interval;
    let handle = SweepController::new(space, bindings, Arc::new(pipeline), config.controller).spawn();
    let control = handle.control().clone();

    tokio::spawn(handle_interrupts(control.clone()));

    let mut samples = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match samples.recv().await {
                Ok(event) => debug!(?event, "Sampling event"),
                Err(RecvError::Lagged(missed)) => warn!(missed, "Sampling log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut last_shown = None;
    control
        .poll(poll_interval, |status| {
            if json {
                match serde_json::to_string(&status.report()) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!("Failed to serialize status: {e}"),
                }
                return;
            }
            let key = (status.phase, status.item, status.lap, status.paused);
            if last_shown != Some(key) {
                last_shown = Some(key);
                println!("{}", status_line(status));
            }
        })
        .await;

    let outcome = handle.join().await?;
    if json {
        println!("{}", serde_json::to_string(&outcome)?);
    }
    match outcome {
        SweepOutcome::Completed { rows } => {
            info!(rows, "Done");
            println!("Sweep completed: {rows} rows captured");
            Ok(())
        }
        SweepOutcome::Aborted {
            rows,
            reason: AbortReason::UserRequested,
        } => {
            println!("Sweep aborted by user: {rows} rows captured");
            Ok(())
        }
        SweepOutcome::Aborted { rows, reason } => {
            bail!("Sweep aborted after {rows} rows: {reason}")
        }
    }
}

/// Operator answer at the interrupt prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptChoice {
    Abort,
    Resume,
}

impl InterruptChoice {
    fn parse(answer: &str) -> Option<Self> {
        match answer.trim().to_ascii_lowercase().as_str() {
            "a" | "abort" => Some(Self::Abort),
            "r" | "resume" => Some(Self::Resume),
            _ => None,
        }
    }
}

/// Pause on Ctrl-C, then abort or resume as the operator decides.
async fn handle_interrupts(control: SweepControl) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        if let Err(e) = control.pause() {
            debug!("Pause ignored: {e}");
            return;
        }
        warn!("Interrupt received, sweep paused");

        let choice = loop {
            println!("Sweep paused. [a]bort or [r]esume? (Ctrl-C again aborts)");
            let answer = tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => InterruptChoice::parse(&line),
                    // Nobody left to answer
                    Ok(None) | Err(_) => Some(InterruptChoice::Abort),
                },
                _ = tokio::signal::ctrl_c() => Some(InterruptChoice::Abort),
            };
            if let Some(choice) = answer {
                break choice;
            }
        };

        match choice {
            InterruptChoice::Resume => match control.resume() {
                Ok(()) => info!("Sweep resumed"),
                Err(e) => debug!("Resume ignored: {e}"),
            },
            InterruptChoice::Abort => {
                warn!("Aborting sweep");
                if let Err(e) = control.abort() {
                    debug!("Abort ignored: {e}");
                }
                return;
            }
        }
    }
}

fn status_line(status: &SweepStatus) -> String {
    let progress = if status.continuous {
        format!("item {}/{} lap {}", status.item.max(0), status.num_items, status.lap)
    } else {
        let percent = status.fraction_done().map_or(0.0, |f| f * 100.0);
        format!(
            "item {}/{} ({percent:.0}%)",
            status.item.max(0),
            status.num_items
        )
    };
    let remaining = status
        .remaining()
        .map_or_else(|| "-".to_string(), format_hms);
    let paused = if status.paused { " [paused]" } else { "" };

    format!(
        "{}{paused} | {progress} | elapsed {} | remaining {remaining}",
        status.message(),
        format_hms(status.elapsed()),
    )
}

fn check_definition(path: &Path, config: &SweepConfig) -> Result<()> {
    let definition = load_definition(path)?;
    let space = definition.space()?;
    bind_resources(&space, &definition.registry())?;

    if config.capture.export_enabled {
        if let Some(dir) = config.capture.export_dir.as_deref() {
            prepare_export_path(Some(dir), &Local::now())?;
        }
    }

    println!("Definition OK: {} items", space.num_items());
    for (pos, group) in space.groups().iter().enumerate() {
        let names: Vec<&str> = group.iter().map(|v| v.variable.name.as_str()).collect();
        println!(
            "  group {pos} (order {}): {} x {} values",
            group[0].variable.order,
            names.join(", "),
            group[0].values.len()
        );
    }
    println!("Columns: {}", space.header().join(", "));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_answers() {
        assert_eq!(InterruptChoice::parse("r\n"), Some(InterruptChoice::Resume));
        assert_eq!(InterruptChoice::parse(" Resume "), Some(InterruptChoice::Resume));
        assert_eq!(InterruptChoice::parse("a"), Some(InterruptChoice::Abort));
        assert_eq!(InterruptChoice::parse("ABORT"), Some(InterruptChoice::Abort));
        // Anything else asks again
        assert_eq!(InterruptChoice::parse(""), None);
        assert_eq!(InterruptChoice::parse("x"), None);
    }
}
