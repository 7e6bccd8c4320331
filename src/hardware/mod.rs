//! Hardware source boundary.
//!
//! The recorder never talks to a driver directly. Every device (the multi-channel
//! instrumentation card, each ALSA capture stream) is seen through the
//! [`BlockSource`] trait: a monotonic "blocks produced so far" counter plus access
//! to the most recently completed block.
//!
//! Sources only expose their *latest* block. If the polling loop falls behind and a
//! source completes two blocks between polls, the older one is not recoverable.
//! This is a property of the polling contract and is kept as is.

pub mod mock;

pub use mock::{ManualSource, SimulatedSource};

use crate::error::AppResult;
use std::fmt::Write as _;

/// Raw samples in the source's native representation.
#[derive(Debug, Clone, PartialEq)]
pub enum Samples {
    /// Floating point samples (instrumentation devices, volts).
    F64(Vec<f64>),
    /// Signed 16-bit samples (S16_LE audio capture).
    I16(Vec<i16>),
}

impl Samples {
    /// Total number of samples across all channels.
    pub fn len(&self) -> usize {
        match self {
            Samples::F64(v) => v.len(),
            Samples::I16(v) => v.len(),
        }
    }

    /// Returns true when the block carries no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Formats the samples of one row into `fields`, reusing its allocations.
    ///
    /// `row` is the row index and `width` the channel count. Floats use the
    /// shortest representation that round-trips; integers are written as is.
    pub(crate) fn format_row(&self, row: usize, width: usize, fields: &mut Vec<String>) {
        let start = row * width;
        fields.resize_with(width, String::new);
        for (offset, field) in fields.iter_mut().enumerate() {
            field.clear();
            // Writing into a String cannot fail.
            let _ = match self {
                Samples::F64(v) => write!(field, "{}", v[start + offset]),
                Samples::I16(v) => write!(field, "{}", v[start + offset]),
            };
        }
    }
}

impl From<Vec<f64>> for Samples {
    fn from(value: Vec<f64>) -> Self {
        Samples::F64(value)
    }
}

impl From<Vec<i16>> for Samples {
    fn from(value: Vec<i16>) -> Self {
        Samples::I16(value)
    }
}

/// One block of samples captured from a source at one polling tick.
///
/// Samples are interleaved by scan: `[s0_ch0, s0_ch1, ..., s1_ch0, s1_ch1, ...]`.
/// The block is immutable once captured; ownership moves to the writer on enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    /// Interleaved sample data
    pub samples: Samples,
    /// Number of channels per row
    pub channel_count: usize,
    /// Source counter value observed when this block was captured
    pub sequence: u64,
}

impl SampleBlock {
    /// Create a block. Shape is not checked here; see `is_well_formed`.
    pub fn new(samples: impl Into<Samples>, channel_count: usize, sequence: u64) -> Self {
        Self {
            samples: samples.into(),
            channel_count,
            sequence,
        }
    }

    /// Number of rows this block serializes to.
    pub fn n_rows(&self) -> usize {
        if self.channel_count > 0 {
            self.samples.len() / self.channel_count
        } else {
            0
        }
    }

    /// Whether the sample count is a non-empty multiple of the channel count.
    pub fn is_well_formed(&self) -> bool {
        self.channel_count > 0
            && !self.samples.is_empty()
            && self.samples.len() % self.channel_count == 0
    }
}

/// A hardware data source as seen by the polling loop.
///
/// Implementations update their counter and latest block from their own
/// acquisition thread; every method here must return immediately.
pub trait BlockSource: Send + Sync {
    /// Human readable name used in logs and output directories.
    fn name(&self) -> &str;

    /// Monotonic, non-decreasing number of blocks produced since the source started.
    fn produced_count(&self) -> u64;

    /// The most recently completed block, interleaved by scan.
    fn latest_block(&self) -> Samples;

    /// Channel count, fixed for the lifetime of the source.
    fn channel_count(&self) -> usize;

    /// Begin acquisition. Independent of the recorder's own lifecycle.
    fn start(&self) -> AppResult<()>;

    /// Stop acquisition.
    fn stop(&self) -> AppResult<()>;
}
