//! CLI Entry Point for daq-recorder
//!
//! Records every configured source into its own rotating file series.
//!
//! # Usage
//!
//! Record sessions (prompts for a label, `q` + Enter or Ctrl-C ends a session,
//! an empty label or Ctrl-C at the prompt exits):
//! ```bash
//! daq-recorder --config config/recorder.toml record
//! daq-recorder record --label warmup
//! ```
//!
//! Check a configuration file:
//! ```bash
//! daq-recorder --config config/recorder.toml check-config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_recorder::acquisition::{AcquisitionCoordinator, ChannelSpec, RunSummary};
use daq_recorder::config::{RecorderConfig, SourceKind, DEFAULT_CONFIG_PATH};
use daq_recorder::data::storage::timestamp_now;
use daq_recorder::hardware::{BlockSource, SimulatedSource};
use daq_recorder::logging::{self, OutputFormat, TracingConfig};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "daq-recorder")]
#[command(about = "Multi-source acquisition recorder with rotating CSV output", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record sessions until an empty label is entered
    Record {
        /// Label of the first session (prompted for when omitted)
        #[arg(long)]
        label: Option<String>,
    },

    /// Validate the configuration and print the resolved sources
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = RecorderConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.validate()?;

    logging::init(TracingConfig::from_recorder_config(&config)?.with_format(cli.log_format))?;

    match cli.command {
        Commands::Record { label } => record(config, label).await,
        Commands::CheckConfig => {
            check_config(&config);
            Ok(())
        }
    }
}

fn check_config(config: &RecorderConfig) {
    println!("Configuration OK: {}", config.application.name);
    println!("  Output root: {}", config.acquisition.output_root.display());
    println!(
        "  Queue: {} blocks, {:?} on overflow",
        config.queue.capacity, config.queue.overflow
    );
    for source in &config.sources {
        println!(
            "  - {} ({:?}): {} ch x {} samples every {} ms, rotate every {} blocks",
            source.name,
            source.kind,
            source.channels,
            source.samples_per_block,
            source.block_period_ms,
            config.save_unit_for(source)
        );
    }
}

/// Forward stdin lines to the async side from a plain thread.
///
/// A read in flight cannot be cancelled, so it lives outside the runtime and
/// never holds up shutdown. The channel closes on EOF.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn prompt_label(lines: &mut mpsc::UnboundedReceiver<String>) -> Result<Option<String>> {
    print!("Label for the next session (empty to quit): ");
    std::io::stdout().flush()?;
    tokio::select! {
        line = lines.recv() => Ok(line
            .map(|line| line.trim().to_string())
            .filter(|label| !label.is_empty())),
        _ = tokio::signal::ctrl_c() => {
            println!();
            info!("Ctrl-C received at the label prompt");
            Ok(None)
        }
    }
}

async fn record(config: RecorderConfig, mut first_label: Option<String>) -> Result<()> {
    let mut lines = spawn_stdin_reader();

    loop {
        let label = match first_label.take() {
            Some(label) => label,
            None => match prompt_label(&mut lines).await? {
                Some(label) => label,
                None => break,
            },
        };

        if label.contains(std::path::is_separator) {
            warn!(label = %label, "Label must not contain path separators");
            continue;
        }

        let summary = run_session(&config, &label, &mut lines).await?;
        print_summary(&label, &summary);
    }

    info!("Recorder exiting");
    Ok(())
}

async fn run_session(
    config: &RecorderConfig,
    label: &str,
    lines: &mut mpsc::UnboundedReceiver<String>,
) -> Result<RunSummary> {
    let session_dir = format!("{}_{}", timestamp_now(), label);
    let delimiter = config.output.delimiter_byte()?;
    let queue = config.queue.to_queue_config();

    let mut coordinator =
        AcquisitionCoordinator::new().with_idle_backoff(config.acquisition.idle_backoff());
    let mut sources: Vec<Arc<dyn BlockSource>> = Vec::with_capacity(config.sources.len());

    for definition in &config.sources {
        let directory = config
            .acquisition
            .output_root
            .join(&definition.name)
            .join(&session_dir);
        tokio::fs::create_dir_all(&directory)
            .await
            .with_context(|| format!("Failed to create {}", directory.display()))?;

        let source: Arc<dyn BlockSource> = Arc::new(match definition.kind {
            SourceKind::Analog => SimulatedSource::analog(
                &definition.name,
                definition.channels,
                definition.samples_per_block,
                definition.block_period(),
            ),
            SourceKind::Audio => SimulatedSource::audio(
                &definition.name,
                definition.samples_per_block,
                definition.block_period(),
            ),
        });

        coordinator.register(
            ChannelSpec::new(
                Arc::clone(&source),
                directory,
                label,
                definition.channels,
                config.save_unit_for(definition),
            )
            .with_queue(queue)
            .with_delimiter(delimiter)
            .with_extension(config.output.extension.clone()),
        )?;
        sources.push(source);
    }

    for (index, source) in sources.iter().enumerate() {
        if let Err(e) = source.start() {
            for started in &sources[..index] {
                if let Err(stop_err) = started.stop() {
                    warn!(
                        source = %started.name(),
                        error = %stop_err,
                        "Failed to stop source while rolling back start"
                    );
                }
            }
            return Err(e.into());
        }
    }

    let stop = coordinator.stop_handle();
    let mut worker = tokio::task::spawn_blocking(move || {
        let result = coordinator.run();
        (result, coordinator.last_summary().cloned())
    });
    println!("Recording session '{label}'. Type q + Enter or press Ctrl-C to stop.");

    let mut stopping = false;
    let joined = loop {
        tokio::select! {
            joined = &mut worker => break joined,
            _ = tokio::signal::ctrl_c(), if !stopping => {
                info!("Ctrl-C received; stopping session");
                stop.request_stop();
                stopping = true;
            }
            line = lines.recv(), if !stopping => match line {
                Some(line) if line.trim().eq_ignore_ascii_case("q") => {
                    info!("Stop requested from keyboard");
                    stop.request_stop();
                    stopping = true;
                }
                Some(_) => {}
                None => {
                    info!("Input closed; stopping session");
                    stop.request_stop();
                    stopping = true;
                }
            },
        }
    };

    for source in &sources {
        if let Err(e) = source.stop() {
            warn!(source = %source.name(), error = %e, "Failed to stop source");
        }
    }

    let (result, last_summary) = joined.context("Acquisition thread panicked")?;
    match result {
        Ok(summary) => Ok(summary),
        Err(e) => {
            if let Some(summary) = &last_summary {
                print_summary(label, summary);
            }
            Err(e.into())
        }
    }
}

fn print_summary(label: &str, summary: &RunSummary) {
    println!();
    println!(
        "Session '{label}' finished: {} blocks in {:.1} s ({} polling cycles)",
        summary.total_blocks_written(),
        summary.elapsed.as_secs_f64(),
        summary.cycles
    );
    for channel in &summary.channels {
        println!(
            "  {}: {} written, {} missed, {} dropped (io), {} dropped (queue), {} files",
            channel.source,
            channel.writer.blocks_written,
            channel.blocks_missed,
            channel.writer.blocks_dropped_io,
            channel.writer.blocks_dropped_overflow,
            channel.files.len()
        );
        if let Some(failure) = &channel.failure {
            println!("    failed: {failure}");
        }
    }
    println!();
}
