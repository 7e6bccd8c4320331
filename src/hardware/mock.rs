//! Mock Hardware Implementations
//!
//! Provides simulated block sources for running the recorder without physical
//! hardware.
//!
//! # Available Mocks
//!
//! - `ManualSource` - Counter and latest block are driven by the caller (tests)
//! - `SimulatedSource` - Background producer thread emitting analog (f64, N channels)
//!   or audio (i16, mono) blocks at a fixed period

use parking_lot::Mutex;
use rand::Rng;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{AppResult, DaqError};
use crate::hardware::{BlockSource, Samples};

// =============================================================================
// ManualSource - Caller-driven source
// =============================================================================

/// Source whose counter and latest block are set by the caller.
///
/// # Example
///
/// ```
/// use daq_recorder::hardware::{BlockSource, ManualSource};
///
/// let source = ManualSource::new("probe", 2);
/// assert_eq!(source.produced_count(), 0);
/// source.publish(vec![0.5, 1.5]);
/// assert_eq!(source.produced_count(), 1);
/// ```
pub struct ManualSource {
    name: String,
    channel_count: usize,
    count: AtomicU64,
    latest: Mutex<Samples>,
    running: AtomicBool,
}

impl ManualSource {
    /// Create a stopped source with an empty latest block.
    pub fn new(name: impl Into<String>, channel_count: usize) -> Self {
        Self {
            name: name.into(),
            channel_count,
            count: AtomicU64::new(0),
            latest: Mutex::new(Samples::F64(Vec::new())),
            running: AtomicBool::new(false),
        }
    }

    /// Complete a new block: replaces the latest block, then bumps the counter.
    ///
    /// Returns the new counter value.
    pub fn publish(&self, samples: impl Into<Samples>) -> u64 {
        *self.latest.lock() = samples.into();
        self.count.fetch_add(1, Ordering::Release) + 1
    }

    /// Replace the latest block without touching the counter.
    pub fn set_latest(&self, samples: impl Into<Samples>) {
        *self.latest.lock() = samples.into();
    }

    /// Force the counter to an arbitrary value (including backwards).
    pub fn set_count(&self, count: u64) {
        self.count.store(count, Ordering::Release);
    }

    /// Whether `start` has been called without a matching `stop`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl BlockSource for ManualSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn produced_count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    fn latest_block(&self) -> Samples {
        self.latest.lock().clone()
    }

    fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn start(&self) -> AppResult<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> AppResult<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// SimulatedSource - Free-running producer thread
// =============================================================================

/// Kind of signal a `SimulatedSource` produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedKind {
    /// Multi-channel analog input, f64 volts: one sine per channel plus noise.
    Analog,
    /// Mono S16 audio: a 440 Hz tone plus noise.
    Audio,
}

struct SimShared {
    running: AtomicBool,
    count: AtomicU64,
    latest: Mutex<Samples>,
}

/// Simulated device that completes one block every `block_period`.
///
/// Like a real driver it only keeps the latest completed block.
pub struct SimulatedSource {
    name: String,
    kind: SimulatedKind,
    channel_count: usize,
    samples_per_block: usize,
    block_period: Duration,
    shared: Arc<SimShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedSource {
    /// Create a simulated multi-channel analog input device.
    ///
    /// # Arguments
    /// * `channel_count` - Channels per scan
    /// * `samples_per_block` - Scans per block (one row each)
    /// * `block_period` - Time between completed blocks
    pub fn analog(
        name: impl Into<String>,
        channel_count: usize,
        samples_per_block: usize,
        block_period: Duration,
    ) -> Self {
        Self::with_kind(
            name,
            SimulatedKind::Analog,
            channel_count,
            samples_per_block,
            block_period,
        )
    }

    /// Create a simulated mono audio capture stream.
    pub fn audio(
        name: impl Into<String>,
        samples_per_block: usize,
        block_period: Duration,
    ) -> Self {
        Self::with_kind(name, SimulatedKind::Audio, 1, samples_per_block, block_period)
    }

    fn with_kind(
        name: impl Into<String>,
        kind: SimulatedKind,
        channel_count: usize,
        samples_per_block: usize,
        block_period: Duration,
    ) -> Self {
        let initial = match kind {
            SimulatedKind::Analog => Samples::F64(Vec::new()),
            SimulatedKind::Audio => Samples::I16(Vec::new()),
        };
        Self {
            name: name.into(),
            kind,
            channel_count,
            samples_per_block,
            block_period,
            shared: Arc::new(SimShared {
                running: AtomicBool::new(false),
                count: AtomicU64::new(0),
                latest: Mutex::new(initial),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Signal kind of this source.
    pub fn kind(&self) -> SimulatedKind {
        self.kind
    }

    /// Whether the producer thread is running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

/// Generate block number `block` of a simulated signal.
fn generate_block(
    kind: SimulatedKind,
    channel_count: usize,
    samples_per_block: usize,
    block_period: Duration,
    block: u64,
    rng: &mut impl Rng,
) -> Samples {
    let period = block_period.as_secs_f64().max(f64::EPSILON);
    let sample_rate = samples_per_block as f64 / period;
    let first = block as f64 * samples_per_block as f64;

    match kind {
        SimulatedKind::Analog => {
            let mut data = Vec::with_capacity(samples_per_block * channel_count);
            for i in 0..samples_per_block {
                let t = (first + i as f64) / sample_rate;
                for ch in 0..channel_count {
                    let freq = (ch + 1) as f64;
                    let noise: f64 = rng.gen_range(-0.01..0.01);
                    data.push((TAU * freq * t).sin() + noise);
                }
            }
            Samples::F64(data)
        }
        SimulatedKind::Audio => {
            let data = (0..samples_per_block)
                .map(|i| {
                    let t = (first + i as f64) / sample_rate;
                    let noise: f64 = rng.gen_range(-200.0..200.0);
                    (8000.0 * (TAU * 440.0 * t).sin() + noise) as i16
                })
                .collect();
            Samples::I16(data)
        }
    }
}

impl BlockSource for SimulatedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn produced_count(&self) -> u64 {
        self.shared.count.load(Ordering::Acquire)
    }

    fn latest_block(&self) -> Samples {
        self.shared.latest.lock().clone()
    }

    fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn start(&self) -> AppResult<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(DaqError::Source(format!(
                "Source '{}' is already running",
                self.name
            )));
        }

        let shared = Arc::clone(&self.shared);
        let kind = self.kind;
        let channel_count = self.channel_count;
        let samples_per_block = self.samples_per_block;
        let block_period = self.block_period;
        let start_block = shared.count.load(Ordering::Acquire);

        let handle = thread::Builder::new()
            .name(format!("sim-{}", self.name))
            .spawn(move || {
                let mut rng = rand::thread_rng();
                let mut block = start_block;
                let mut deadline = Instant::now() + block_period;

                while shared.running.load(Ordering::SeqCst) {
                    let now = Instant::now();
                    if now < deadline {
                        // Short naps keep stop() responsive for long periods.
                        thread::sleep((deadline - now).min(Duration::from_millis(10)));
                        continue;
                    }

                    let samples = generate_block(
                        kind,
                        channel_count,
                        samples_per_block,
                        block_period,
                        block,
                        &mut rng,
                    );
                    *shared.latest.lock() = samples;
                    shared.count.fetch_add(1, Ordering::Release);
                    block += 1;
                    deadline += block_period;
                }

                debug!("Simulated producer exiting");
            })
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                DaqError::Source(format!("Failed to spawn producer for '{}': {e}", self.name))
            })?;

        *self.worker.lock() = Some(handle);
        info!(
            source = %self.name,
            channels = self.channel_count,
            samples_per_block = self.samples_per_block,
            period_ms = self.block_period.as_millis() as u64,
            "Simulated source started"
        );
        Ok(())
    }

    fn stop(&self) -> AppResult<()> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(handle) = self.worker.lock().take() {
            handle.join().map_err(|_| {
                DaqError::Source(format!("Producer thread for '{}' panicked", self.name))
            })?;
        }

        info!(
            source = %self.name,
            blocks = self.produced_count(),
            "Simulated source stopped"
        );
        Ok(())
    }
}

impl Drop for SimulatedSource {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}
