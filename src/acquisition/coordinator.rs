//! Acquisition coordinator: one polling thread driving every channel.
//!
//! The coordinator owns N (poller, writer) pairs and moves through
//! `Idle -> Running -> Draining -> Idle`:
//!
//! - `start()` spawns every writer's drain thread.
//! - `poll_cycle()` polls each channel once, in registration order, applies the
//!   channel's rotation cadence and enqueues new blocks. No file I/O happens here.
//! - `shutdown()` stops every writer (each drains to completion), reports a
//!   [`RunSummary`] and releases the channels so new ones can be registered.
//!
//! `run()` chains the three until a [`StopHandle`] is triggered from any thread.
//!
//! # Example
//!
//! ```no_run
//! use daq_recorder::acquisition::AcquisitionCoordinator;
//! use daq_recorder::hardware::{BlockSource, SimulatedSource};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! let source = Arc::new(SimulatedSource::analog("NiDAQ", 4, 1000, Duration::from_secs(1)));
//! let mut coordinator = AcquisitionCoordinator::new();
//! coordinator.register_channel(source.clone(), "output/NiDAQ", "run1", 4, 60)?;
//!
//! let stop = coordinator.stop_handle();
//! std::thread::spawn(move || {
//!     std::thread::sleep(Duration::from_secs(10));
//!     stop.request_stop();
//! });
//!
//! source.start()?;
//! let summary = coordinator.run()?;
//! source.stop()?;
//! println!("{} blocks written", summary.total_blocks_written());
//! # Ok(())
//! # }
//! ```

use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::acquisition::poller::SourcePoller;
use crate::data::storage::{Clock, FileOpener};
use crate::data::writer::{AsyncWriter, QueueConfig, WriterConfig, WriterStats};
use crate::error::{AppResult, DaqError};
use crate::hardware::BlockSource;

/// Lifecycle state of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// No drain threads; channels may be registered.
    Idle,
    /// Polling loop active.
    Running,
    /// Polling stopped, writers draining.
    Draining,
}

struct ControlShared {
    stop: AtomicBool,
    state: Mutex<CoordinatorState>,
}

/// Thread-safe handle used to ask a running coordinator to stop.
///
/// Requesting a stop only sets a flag; the polling loop notices it at the next
/// cycle and then drains every writer.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<ControlShared>,
}

impl StopHandle {
    /// Ask the polling loop to stop after its current cycle.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested and not yet consumed by a shutdown.
    pub fn is_stop_requested(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    /// Current coordinator state.
    pub fn state(&self) -> CoordinatorState {
        *self.shared.state.lock()
    }
}

/// Everything needed to register one channel.
pub struct ChannelSpec {
    source: Arc<dyn BlockSource>,
    channel_count: usize,
    rotation_threshold: u64,
    writer: WriterConfig,
}

impl ChannelSpec {
    /// Channel writing `source` into `directory` with `label`, rotating every
    /// `rotation_threshold` observed blocks.
    pub fn new(
        source: Arc<dyn BlockSource>,
        directory: impl Into<PathBuf>,
        label: impl Into<String>,
        channel_count: usize,
        rotation_threshold: u64,
    ) -> Self {
        Self {
            source,
            channel_count,
            rotation_threshold,
            writer: WriterConfig::new(directory, label),
        }
    }

    /// Set queue bound and overflow policy.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.writer = self.writer.with_queue(queue);
        self
    }

    /// Set the field delimiter.
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.writer = self.writer.with_delimiter(delimiter);
        self
    }

    /// Set the file extension.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.writer = self.writer.with_extension(extension);
        self
    }

    /// Use a custom file opener.
    pub fn with_opener(mut self, opener: Arc<dyn FileOpener>) -> Self {
        self.writer = self.writer.with_opener(opener);
        self
    }

    /// Use a custom clock for file names.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.writer = self.writer.with_clock(clock);
        self
    }
}

struct Channel {
    poller: SourcePoller,
    writer: AsyncWriter,
    rotation_threshold: u64,
    since_rotation: u64,
    rotations_requested: u64,
    failure: Option<String>,
}

impl Channel {
    fn label(&self) -> &str {
        self.writer.label()
    }

    fn fail(&mut self, err: &DaqError) {
        error!(
            channel = %self.label(),
            error = %err,
            "Channel failed; polling stopped for this source"
        );
        self.failure = Some(err.to_string());
    }
}

/// Per-channel outcome of a run.
#[derive(Debug, Clone)]
pub struct ChannelSummary {
    /// Channel label
    pub label: String,
    /// Source name
    pub source: String,
    /// Blocks observed by the poller
    pub blocks_observed: u64,
    /// Blocks the source completed that polling never saw
    pub blocks_missed: u64,
    /// Rotations requested by the cadence
    pub rotations_requested: u64,
    /// Writer statistics after draining
    pub writer: WriterStats,
    /// Files written, in order
    pub files: Vec<PathBuf>,
    /// Blocks still queued after stop (always zero)
    pub pending_after_stop: usize,
    /// Integration or writer error that terminated the channel
    pub failure: Option<String>,
}

/// Outcome of one `Running -> Idle` cycle.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// One entry per channel, in registration order
    pub channels: Vec<ChannelSummary>,
    /// Polling cycles executed
    pub cycles: u64,
    /// Time from start to end of drain
    pub elapsed: Duration,
}

impl RunSummary {
    /// Summary for `label`, if present.
    pub fn channel(&self, label: &str) -> Option<&ChannelSummary> {
        self.channels.iter().find(|c| c.label == label)
    }

    /// Blocks written across all channels.
    pub fn total_blocks_written(&self) -> u64 {
        self.channels.iter().map(|c| c.writer.blocks_written).sum()
    }
}

/// Polls every registered source from a single thread and feeds its writer.
pub struct AcquisitionCoordinator {
    channels: Vec<Channel>,
    control: Arc<ControlShared>,
    idle_backoff: Duration,
    cycles: u64,
    started_at: Option<Instant>,
    last_summary: Option<RunSummary>,
}

impl Default for AcquisitionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionCoordinator {
    /// Create an idle coordinator with no channels.
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            control: Arc::new(ControlShared {
                stop: AtomicBool::new(false),
                state: Mutex::new(CoordinatorState::Idle),
            }),
            idle_backoff: Duration::ZERO,
            cycles: 0,
            started_at: None,
            last_summary: None,
        }
    }

    /// Sleep this long after a cycle that found no new block.
    ///
    /// Zero (the default) keeps pure polling and only yields the thread.
    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    /// Handle for requesting a stop from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.control),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CoordinatorState {
        *self.control.state.lock()
    }

    fn set_state(&self, state: CoordinatorState) {
        *self.control.state.lock() = state;
    }

    /// Summary of the most recent shutdown, kept even when it returned an error.
    pub fn last_summary(&self) -> Option<&RunSummary> {
        self.last_summary.as_ref()
    }

    /// Labels of registered channels, in polling order.
    pub fn channel_labels(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.label().to_string()).collect()
    }

    /// Register a channel with default writer settings.
    pub fn register_channel(
        &mut self,
        source: Arc<dyn BlockSource>,
        directory: impl Into<PathBuf>,
        label: impl Into<String>,
        channel_count: usize,
        rotation_threshold: u64,
    ) -> AppResult<()> {
        self.register(ChannelSpec::new(
            source,
            directory,
            label,
            channel_count,
            rotation_threshold,
        ))
    }

    /// Register a channel. All configuration errors surface here, before `run`.
    pub fn register(&mut self, spec: ChannelSpec) -> AppResult<()> {
        if self.state() != CoordinatorState::Idle {
            return Err(DaqError::InvalidState(
                "Channels can only be registered while idle".into(),
            ));
        }

        let label = spec.writer.label.clone();
        if spec.rotation_threshold == 0 {
            return Err(DaqError::Configuration(format!(
                "Rotation threshold for '{label}' must be at least 1"
            )));
        }
        if spec.channel_count == 0 {
            return Err(DaqError::Configuration(format!(
                "Channel count for '{label}' must be at least 1"
            )));
        }
        let source_channels = spec.source.channel_count();
        if source_channels != spec.channel_count {
            return Err(DaqError::Configuration(format!(
                "Channel '{label}' registered with {} channels but source '{}' reports {source_channels}",
                spec.channel_count,
                spec.source.name()
            )));
        }

        let mut destinations: HashSet<(PathBuf, String)> = self
            .channels
            .iter()
            .map(|c| (c.writer.directory().to_path_buf(), c.label().to_string()))
            .collect();
        if !destinations.insert((spec.writer.directory.clone(), label.clone())) {
            return Err(DaqError::Configuration(format!(
                "Channel '{label}' in '{}' is already registered",
                spec.writer.directory.display()
            )));
        }

        let directory = spec.writer.directory.clone();
        let writer = AsyncWriter::new(spec.writer)?;
        let poller = SourcePoller::new(spec.source, label.clone(), spec.channel_count);

        info!(
            channel = %label,
            source = %poller.source().name(),
            directory = %directory.display(),
            channels = spec.channel_count,
            rotation_threshold = spec.rotation_threshold,
            "Registered channel"
        );

        self.channels.push(Channel {
            poller,
            writer,
            rotation_threshold: spec.rotation_threshold,
            since_rotation: 0,
            rotations_requested: 0,
            failure: None,
        });
        Ok(())
    }

    /// `Idle -> Running`: start every writer's drain thread.
    pub fn start(&mut self) -> AppResult<()> {
        if self.state() != CoordinatorState::Idle {
            return Err(DaqError::InvalidState("Coordinator is already running".into()));
        }
        if self.channels.is_empty() {
            return Err(DaqError::InvalidState("No channels registered".into()));
        }

        for index in 0..self.channels.len() {
            if let Err(e) = self.channels[index].writer.start() {
                for started in &mut self.channels[..index] {
                    if let Err(stop_err) = started.writer.stop() {
                        warn!(
                            channel = %started.label(),
                            error = %stop_err,
                            "Failed to stop writer while rolling back start"
                        );
                    }
                }
                return Err(e);
            }
        }

        self.cycles = 0;
        self.started_at = Some(Instant::now());
        self.set_state(CoordinatorState::Running);
        info!(channels = self.channels.len(), "Acquisition started");
        Ok(())
    }

    /// Poll every active channel once. Returns the number of blocks enqueued.
    pub fn poll_cycle(&mut self) -> AppResult<usize> {
        if self.state() != CoordinatorState::Running {
            return Err(DaqError::InvalidState("Coordinator is not running".into()));
        }

        let mut enqueued = 0;
        for channel in &mut self.channels {
            if channel.failure.is_some() {
                continue;
            }

            let block = match channel.poller.poll() {
                Ok(Some(block)) => block,
                Ok(None) => continue,
                Err(e) => {
                    channel.fail(&e);
                    continue;
                }
            };

            channel.since_rotation += 1;
            if channel.since_rotation >= channel.rotation_threshold {
                if let Err(e) = channel.writer.rotate() {
                    channel.fail(&e);
                    continue;
                }
                channel.since_rotation = 0;
                channel.rotations_requested += 1;
            }

            let state = channel.poller.state();
            debug!(
                channel = %state.label,
                program_count = state.blocks_observed,
                package_count = block.sequence,
                "New block"
            );

            match channel.writer.enqueue(block) {
                Ok(()) => enqueued += 1,
                Err(DaqError::QueueFull { .. }) => {}
                Err(e) => channel.fail(&e),
            }
        }

        self.cycles += 1;
        Ok(enqueued)
    }

    /// Run until a stop is requested, then drain and return the summary.
    pub fn run(&mut self) -> AppResult<RunSummary> {
        self.start()?;
        let stop = self.stop_handle();

        while !stop.is_stop_requested() {
            let enqueued = self.poll_cycle()?;

            if self.channels.iter().all(|c| c.failure.is_some()) {
                warn!("Every channel has failed; stopping acquisition");
                break;
            }

            if enqueued == 0 {
                if self.idle_backoff.is_zero() {
                    thread::yield_now();
                } else {
                    thread::sleep(self.idle_backoff);
                }
            }
        }

        self.shutdown()
    }

    /// `Running -> Draining -> Idle`: stop every writer and wait for each drain.
    ///
    /// Channels are released afterwards; register new ones before the next run.
    /// When a writer fails to stop this returns `ShutdownFailed`, and the
    /// summary of every channel stays available from [`Self::last_summary`].
    pub fn shutdown(&mut self) -> AppResult<RunSummary> {
        if self.state() != CoordinatorState::Running {
            return Err(DaqError::InvalidState("Coordinator is not running".into()));
        }
        self.set_state(CoordinatorState::Draining);
        info!("Stopping acquisition; draining writers");

        let mut errors = Vec::new();
        let mut channels = Vec::with_capacity(self.channels.len());

        for mut channel in self.channels.drain(..) {
            if let Err(e) = channel.writer.stop() {
                error!(channel = %channel.label(), error = %e, "Writer failed to stop");
                if channel.failure.is_none() {
                    channel.failure = Some(e.to_string());
                }
                errors.push(e);
            }

            let state = channel.poller.state();
            channels.push(ChannelSummary {
                label: state.label.clone(),
                source: channel.poller.source().name().to_string(),
                blocks_observed: state.blocks_observed,
                blocks_missed: state.blocks_missed,
                rotations_requested: channel.rotations_requested,
                writer: channel.writer.stats(),
                files: channel.writer.files(),
                pending_after_stop: channel.writer.pending(),
                failure: channel.failure.clone(),
            });
        }

        let summary = RunSummary {
            channels,
            cycles: self.cycles,
            elapsed: self
                .started_at
                .take()
                .map(|t| t.elapsed())
                .unwrap_or_default(),
        };

        self.control.stop.store(false, Ordering::SeqCst);
        self.set_state(CoordinatorState::Idle);

        info!(
            cycles = summary.cycles,
            blocks = summary.total_blocks_written(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Acquisition stopped"
        );

        self.last_summary = Some(summary.clone());
        if errors.is_empty() {
            Ok(summary)
        } else {
            warn!(
                failed = errors.len(),
                channels = summary.channels.len(),
                "Shutdown finished with writer errors"
            );
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

impl Drop for AcquisitionCoordinator {
    fn drop(&mut self) {
        if self.state() == CoordinatorState::Running {
            if let Err(e) = self.shutdown() {
                error!("Error stopping coordinator on drop: {}", e.summary());
            }
        }
    }
}
