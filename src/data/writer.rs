//! Asynchronous per-channel writer.
//!
//! An [`AsyncWriter`] decouples "a block arrived" from "the block is on disk". The
//! polling thread pushes blocks into a bounded FIFO under a mutex and signals a
//! condition variable; one dedicated drain thread per channel pops them in order
//! and appends them to the channel's [`RotatingFileSink`].
//!
//! ```text
//!  polling thread                      drain thread
//!  ──────────────                      ────────────
//!  enqueue(block) ─┐                ┌─▶ pop oldest ─▶ encode ─▶ append to file
//!  rotate()  ──────┼─▶ [ FIFO queue ]┤
//!  stop()    ──────┘   (Mutex+Condvar)└─▶ on Rotate marker: close file, new identity
//! ```
//!
//! # Ordering
//!
//! Blocks and rotation markers share one queue, so a rotation applies exactly to
//! the blocks enqueued after it. Everything enqueued before `rotate()` lands in the
//! old file.
//!
//! # Failure policy
//!
//! A block that cannot be written (open or append failure) is dropped, counted and
//! logged; the pipeline keeps going. `stop()` always drains the queue completely
//! before returning.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, info_span, trace, warn};

use crate::data::storage::{
    system_clock, Clock, FileNamer, FileOpener, FsOpener, RotatingFileSink, DEFAULT_EXTENSION,
};
use crate::error::{AppResult, DaqError};
use crate::hardware::SampleBlock;

/// Default queue depth in blocks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// What `enqueue` does when the queue already holds `capacity` blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued block and accept the new one.
    #[default]
    DropOldest,
    /// Reject the new block with `DaqError::QueueFull`.
    DropNewest,
    /// Wait until the drain thread frees a slot (backpressure on the caller).
    Block,
}

/// Bound and overflow behaviour of a write queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of queued blocks (rotation markers are not counted, but
    /// back-to-back markers merge, so at most `2 * capacity + 1` entries queue)
    pub capacity: usize,
    /// Policy applied when the queue is full
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Reject delimiters that would break the row format.
pub fn validate_delimiter(delimiter: u8) -> AppResult<()> {
    if !delimiter.is_ascii() || matches!(delimiter, b'\n' | b'\r' | b'"') {
        return Err(DaqError::Configuration(format!(
            "Invalid field delimiter {:?}",
            delimiter as char
        )));
    }
    Ok(())
}

/// Everything an `AsyncWriter` needs to produce files for one channel.
#[derive(Clone)]
pub struct WriterConfig {
    /// Channel output directory (must already exist)
    pub directory: PathBuf,
    /// Session label used in file names
    pub label: String,
    /// Field delimiter
    pub delimiter: u8,
    /// File extension without the dot
    pub extension: String,
    /// Queue bound and overflow policy
    pub queue: QueueConfig,
    /// File opener (real files by default)
    pub opener: Arc<dyn FileOpener>,
    /// Wall clock for file names
    pub clock: Clock,
}

impl WriterConfig {
    /// Defaults: `,` delimiter, `csv` extension, default queue, real files, system clock.
    pub fn new(directory: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            label: label.into(),
            delimiter: b',',
            extension: DEFAULT_EXTENSION.to_string(),
            queue: QueueConfig::default(),
            opener: Arc::new(FsOpener),
            clock: system_clock(),
        }
    }

    /// Set the queue bound and overflow policy.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Set the field delimiter.
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Set the file extension.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Use a custom file opener.
    pub fn with_opener(mut self, opener: Arc<dyn FileOpener>) -> Self {
        self.opener = opener;
        self
    }

    /// Use a custom clock for file names.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Check the settings that cannot be fixed once a run starts.
    pub fn validate(&self) -> AppResult<()> {
        if self.label.trim().is_empty() {
            return Err(DaqError::Configuration("Label must not be empty".into()));
        }
        if self.extension.is_empty() {
            return Err(DaqError::Configuration(
                "File extension must not be empty".into(),
            ));
        }
        if self.queue.capacity == 0 {
            return Err(DaqError::Configuration(format!(
                "Queue capacity for '{}' must be at least 1",
                self.label
            )));
        }
        validate_delimiter(self.delimiter)
    }

    fn namer(&self) -> FileNamer {
        FileNamer::new(self.directory.clone(), self.label.clone())
            .with_extension(self.extension.clone())
            .with_clock(Arc::clone(&self.clock))
    }
}

/// Writer statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Blocks accepted into the queue
    pub blocks_enqueued: u64,
    /// Blocks fully written to a file
    pub blocks_written: u64,
    /// Rows written to files
    pub rows_written: u64,
    /// Bytes written to files
    pub bytes_written: u64,
    /// Blocks dropped because the file could not be opened or appended
    pub blocks_dropped_io: u64,
    /// Blocks dropped or rejected because the queue was full
    pub blocks_dropped_overflow: u64,
    /// Rotations applied by the drain thread
    pub rotations: u64,
    /// Distinct files opened
    pub files_opened: u64,
}

#[derive(Default)]
struct WriterCounters {
    blocks_enqueued: AtomicU64,
    blocks_written: AtomicU64,
    rows_written: AtomicU64,
    bytes_written: AtomicU64,
    blocks_dropped_io: AtomicU64,
    blocks_dropped_overflow: AtomicU64,
    rotations: AtomicU64,
    files_opened: AtomicU64,
}

impl WriterCounters {
    fn snapshot(&self) -> WriterStats {
        WriterStats {
            blocks_enqueued: self.blocks_enqueued.load(Ordering::SeqCst),
            blocks_written: self.blocks_written.load(Ordering::SeqCst),
            rows_written: self.rows_written.load(Ordering::SeqCst),
            bytes_written: self.bytes_written.load(Ordering::SeqCst),
            blocks_dropped_io: self.blocks_dropped_io.load(Ordering::SeqCst),
            blocks_dropped_overflow: self.blocks_dropped_overflow.load(Ordering::SeqCst),
            rotations: self.rotations.load(Ordering::SeqCst),
            files_opened: self.files_opened.load(Ordering::SeqCst),
        }
    }
}

enum Entry {
    Block(SampleBlock),
    Rotate,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<Entry>,
    /// Number of `Entry::Block` in `entries`
    blocks: usize,
    /// An entry has been popped and is being processed
    in_flight: bool,
    accepting: bool,
    stopping: bool,
    overflowing: bool,
}

struct Shared {
    label: String,
    queue: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    counters: WriterCounters,
    files: Mutex<Vec<PathBuf>>,
}

/// Bounded producer/consumer writer for one channel.
pub struct AsyncWriter {
    config: WriterConfig,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncWriter {
    /// Create a stopped writer. Fails on invalid configuration.
    pub fn new(config: WriterConfig) -> AppResult<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            label: config.label.clone(),
            queue: Mutex::new(QueueState::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            counters: WriterCounters::default(),
            files: Mutex::new(Vec::new()),
        });
        Ok(Self {
            config,
            shared,
            worker: None,
        })
    }

    /// Channel label.
    pub fn label(&self) -> &str {
        &self.config.label
    }

    /// Output directory.
    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Spawn the drain thread. Calling it while running is a usage error.
    pub fn start(&mut self) -> AppResult<()> {
        if self.worker.is_some() {
            return Err(DaqError::WriterState(format!(
                "Writer '{}' is already started",
                self.config.label
            )));
        }

        {
            let mut queue = self.shared.queue.lock();
            queue.accepting = true;
            queue.stopping = false;
        }

        let shared = Arc::clone(&self.shared);
        let namer = self.config.namer();
        let opener = Arc::clone(&self.config.opener);
        let delimiter = self.config.delimiter;
        // Child of the caller's span, so drain-thread events keep its context.
        let span = info_span!("drain", channel = %self.config.label);

        let handle = thread::Builder::new()
            .name(format!("drain-{}", self.config.label))
            .spawn(move || {
                let _entered = span.entered();
                let sink = RotatingFileSink::new(namer, opener, delimiter);
                drain_loop(&shared, sink);
            })
            .map_err(|e| {
                self.shared.queue.lock().accepting = false;
                DaqError::WriterState(format!(
                    "Failed to spawn drain thread for '{}': {e}",
                    self.config.label
                ))
            })?;

        self.worker = Some(handle);
        debug!(channel = %self.config.label, "Writer started");
        Ok(())
    }

    /// Queue a block for writing. Never performs I/O.
    ///
    /// Blocks that are empty or whose length is not a multiple of their channel
    /// count are rejected with `DaqError::MalformedBlock`. With
    /// `OverflowPolicy::Block` this waits for a free slot when the queue is
    /// full; the other policies always return immediately.
    pub fn enqueue(&self, block: SampleBlock) -> AppResult<()> {
        let shared = &self.shared;
        let capacity = self.config.queue.capacity;
        if !block.is_well_formed() {
            return Err(DaqError::MalformedBlock {
                channel: shared.label.clone(),
                len: block.samples.len(),
                channel_count: block.channel_count,
            });
        }
        {
            let mut queue = shared.queue.lock();
            if !queue.accepting {
                return Err(DaqError::WriterState(format!(
                    "Writer '{}' is not running",
                    shared.label
                )));
            }

            if queue.blocks >= capacity {
                match self.config.queue.overflow {
                    OverflowPolicy::DropOldest => {
                        let oldest = queue
                            .entries
                            .iter()
                            .position(|entry| matches!(entry, Entry::Block(_)));
                        if let Some(index) = oldest {
                            if let Some(Entry::Block(evicted)) = queue.entries.remove(index) {
                                queue.blocks -= 1;
                                merge_rotations_at(&mut queue.entries, index);
                                trace!(
                                    channel = %shared.label,
                                    sequence = evicted.sequence,
                                    "Evicted oldest block (queue full)"
                                );
                            }
                        }
                        shared
                            .counters
                            .blocks_dropped_overflow
                            .fetch_add(1, Ordering::SeqCst);
                        note_overflow(&mut queue, &shared.label, capacity);
                    }
                    OverflowPolicy::DropNewest => {
                        shared
                            .counters
                            .blocks_dropped_overflow
                            .fetch_add(1, Ordering::SeqCst);
                        note_overflow(&mut queue, &shared.label, capacity);
                        return Err(DaqError::QueueFull {
                            channel: shared.label.clone(),
                        });
                    }
                    OverflowPolicy::Block => {
                        note_overflow(&mut queue, &shared.label, capacity);
                        while queue.blocks >= capacity && queue.accepting {
                            shared.not_full.wait(&mut queue);
                        }
                        if !queue.accepting {
                            return Err(DaqError::WriterState(format!(
                                "Writer '{}' stopped while waiting for queue space",
                                shared.label
                            )));
                        }
                    }
                }
            } else {
                queue.overflowing = false;
            }

            queue.entries.push_back(Entry::Block(block));
            queue.blocks += 1;
        }

        shared
            .counters
            .blocks_enqueued
            .fetch_add(1, Ordering::SeqCst);
        shared.not_empty.notify_one();
        Ok(())
    }

    /// Request that blocks enqueued from now on go to a freshly named file.
    ///
    /// Blocks already queued or being written still land in the current file.
    pub fn rotate(&self) -> AppResult<()> {
        {
            let mut queue = self.shared.queue.lock();
            if !queue.accepting {
                return Err(DaqError::WriterState(format!(
                    "Writer '{}' is not running",
                    self.shared.label
                )));
            }
            // A second marker with no block after the first names a file
            // that would never be opened
            if !matches!(queue.entries.back(), Some(Entry::Rotate)) {
                queue.entries.push_back(Entry::Rotate);
            }
        }
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Stop accepting blocks, drain everything queued, and join the drain thread.
    ///
    /// There is no timeout: this returns only once the queue is empty. Calling it
    /// on a writer that is not running is a no-op.
    pub fn stop(&mut self) -> AppResult<()> {
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };

        {
            let mut queue = self.shared.queue.lock();
            queue.accepting = false;
            queue.stopping = true;
        }
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();

        let joined = handle.join();
        self.shared.queue.lock().stopping = false;
        joined.map_err(|_| {
            DaqError::WriterState(format!(
                "Drain thread for '{}' panicked",
                self.config.label
            ))
        })?;

        let stats = self.stats();
        info!(
            channel = %self.config.label,
            written = stats.blocks_written,
            rows = stats.rows_written,
            dropped_io = stats.blocks_dropped_io,
            dropped_overflow = stats.blocks_dropped_overflow,
            rotations = stats.rotations,
            files = stats.files_opened,
            "Writer drained and stopped"
        );
        Ok(())
    }

    /// Whether the drain thread is running.
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Blocks queued or currently being written.
    pub fn pending(&self) -> usize {
        let queue = self.shared.queue.lock();
        queue.blocks + usize::from(queue.in_flight)
    }

    /// True when nothing is queued or in flight.
    pub fn is_queue_empty(&self) -> bool {
        let queue = self.shared.queue.lock();
        queue.entries.is_empty() && !queue.in_flight
    }

    /// Current statistics.
    pub fn stats(&self) -> WriterStats {
        self.shared.counters.snapshot()
    }

    /// Every file opened so far, in the order they were opened.
    pub fn files(&self) -> Vec<PathBuf> {
        self.shared.files.lock().clone()
    }
}

impl Drop for AsyncWriter {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.stop() {
                error!("Error stopping writer on drop: {}", e);
            }
        }
    }
}

/// Collapse the two markers left adjacent at `index` after an eviction.
fn merge_rotations_at(entries: &mut VecDeque<Entry>, index: usize) {
    let around = index
        .checked_sub(1)
        .and_then(|before| entries.get(before))
        .zip(entries.get(index));
    if matches!(around, Some((Entry::Rotate, Entry::Rotate))) {
        entries.remove(index);
    }
}

fn note_overflow(queue: &mut QueueState, label: &str, capacity: usize) {
    if !queue.overflowing {
        queue.overflowing = true;
        warn!(channel = %label, capacity, "Write queue full");
    }
}

/// Single consumer: pop in FIFO order until stopped and empty.
fn drain_loop(shared: &Shared, mut sink: RotatingFileSink) {
    loop {
        let entry = {
            let mut queue = shared.queue.lock();
            queue.in_flight = false;
            while queue.entries.is_empty() && !queue.stopping {
                shared.not_empty.wait(&mut queue);
            }
            match queue.entries.pop_front() {
                Some(entry) => {
                    if matches!(entry, Entry::Block(_)) {
                        queue.blocks -= 1;
                        shared.not_full.notify_one();
                    }
                    queue.in_flight = true;
                    entry
                }
                None => break,
            }
        };

        match entry {
            Entry::Block(block) => write_block(shared, &mut sink, &block),
            Entry::Rotate => {
                let previous = sink.identity().path();
                match sink.rotate() {
                    Ok(identity) => debug!(
                        channel = %shared.label,
                        from = %previous.display(),
                        to = %identity,
                        "Rotated output file"
                    ),
                    Err(e) => error!(
                        channel = %shared.label,
                        path = %previous.display(),
                        error = %e,
                        "Failed to close file on rotation"
                    ),
                }
                shared.counters.rotations.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    if let Err(e) = sink.close() {
        error!(channel = %shared.label, error = %e, "Failed to close output file");
    }
    shared.queue.lock().in_flight = false;
    debug!(channel = %shared.label, "Drain thread exiting");
}

fn write_block(shared: &Shared, sink: &mut RotatingFileSink, block: &SampleBlock) {
    let opened_before = sink.opened_files().len();

    match sink.append(block) {
        Ok(appended) => {
            let counters = &shared.counters;
            counters.blocks_written.fetch_add(1, Ordering::SeqCst);
            counters
                .rows_written
                .fetch_add(appended.rows as u64, Ordering::SeqCst);
            counters
                .bytes_written
                .fetch_add(appended.bytes as u64, Ordering::SeqCst);
        }
        Err(e) => {
            shared
                .counters
                .blocks_dropped_io
                .fetch_add(1, Ordering::SeqCst);
            error!(
                channel = %shared.label,
                sequence = block.sequence,
                path = %sink.identity(),
                error = %e,
                "Dropped block: write failed"
            );
        }
    }

    let opened = sink.opened_files();
    if opened.len() > opened_before {
        let mut files = shared.files.lock();
        for path in &opened[opened_before..] {
            files.push(path.clone());
            shared.counters.files_opened.fetch_add(1, Ordering::SeqCst);
        }
    }
}
