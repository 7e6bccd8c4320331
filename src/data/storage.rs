//! Rotating CSV file sink.
//!
//! A [`RotatingFileSink`] owns the output file of one channel. It names files from
//! the channel directory, the session label and the wall-clock time, and only moves
//! to a new file when asked to rotate.
//!
//! ```text
//! <directory>/<YYYYmmddHHMMSS>_<label>.csv
//! <directory>/<YYYYmmddHHMMSS>-1_<label>.csv   (second rotation in the same second)
//! ```
//!
//! Files are opened lazily in append mode on the first block after a rotation and
//! stay open until the next rotation or `close`. Directory creation is the caller's
//! job; a missing directory shows up as an open error for that block.

use chrono::{DateTime, Local};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use crate::hardware::SampleBlock;

/// Timestamp format used in file names (local time, second resolution).
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Default output file extension.
pub const DEFAULT_EXTENSION: &str = "csv";

/// Wall-clock source for file names.
pub type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

/// Clock backed by `chrono::Local::now`.
pub fn system_clock() -> Clock {
    Arc::new(Local::now)
}

/// Current local time formatted like file name timestamps.
pub fn timestamp_now() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// (directory, label, timestamp) triple that resolves to one output path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    /// Channel output directory
    pub directory: PathBuf,
    /// Session label
    pub label: String,
    /// Formatted timestamp (`TIMESTAMP_FORMAT`)
    pub timestamp: String,
    /// Disambiguator for identities created within the same second (0 = none)
    pub sequence: u32,
    /// File extension without the dot
    pub extension: String,
}

impl FileIdentity {
    /// Concrete path of this identity.
    pub fn path(&self) -> PathBuf {
        let stem = if self.sequence == 0 {
            format!("{}_{}", self.timestamp, self.label)
        } else {
            format!("{}-{}_{}", self.timestamp, self.sequence, self.label)
        };
        self.directory.join(format!("{stem}.{}", self.extension))
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

/// Filename policy: derives a fresh, never reused identity per call.
pub struct FileNamer {
    directory: PathBuf,
    label: String,
    extension: String,
    clock: Clock,
    last_timestamp: Option<String>,
    sequence: u32,
}

impl FileNamer {
    /// Create a namer for one channel directory and label.
    pub fn new(directory: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            label: label.into(),
            extension: DEFAULT_EXTENSION.to_string(),
            clock: system_clock(),
            last_timestamp: None,
            sequence: 0,
        }
    }

    /// Use a different file extension.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Use a custom clock (tests freeze time with this).
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Next identity for this channel.
    ///
    /// Identities minted within the same second get an increasing sequence
    /// number, and an identity whose path already exists on disk is skipped, so
    /// a rotation can never append into an earlier file.
    pub fn next_identity(&mut self) -> FileIdentity {
        let timestamp = (self.clock)().format(TIMESTAMP_FORMAT).to_string();

        if self.last_timestamp.as_deref() == Some(timestamp.as_str()) {
            self.sequence += 1;
        } else {
            self.sequence = 0;
            self.last_timestamp = Some(timestamp.clone());
        }

        loop {
            let identity = FileIdentity {
                directory: self.directory.clone(),
                label: self.label.clone(),
                timestamp: timestamp.clone(),
                sequence: self.sequence,
                extension: self.extension.clone(),
            };
            if !identity.path().exists() {
                return identity;
            }
            self.sequence += 1;
        }
    }
}

/// Opens output files. Swappable so tests can inject failures.
pub trait FileOpener: Send + Sync {
    /// Open `path` for appending, creating it if needed.
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    /// Cut `path` back to `len` bytes.
    fn truncate(&self, path: &Path, len: u64) -> io::Result<()> {
        OpenOptions::new().write(true).open(path)?.set_len(len)
    }
}

/// Opens real files with `create + append`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsOpener;

impl FileOpener for FsOpener {
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

/// Serialize `block` as delimited rows into `out`.
///
/// One row per `channel_count` samples, slices taken in order from the start of
/// the block, no header, `\n` terminated. Returns the number of rows written.
pub fn encode_block(block: &SampleBlock, delimiter: u8, out: &mut Vec<u8>) -> io::Result<usize> {
    let rows = block.n_rows();
    let mut fields = Vec::with_capacity(block.channel_count);
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(out);

    for row in 0..rows {
        block.samples.format_row(row, block.channel_count, &mut fields);
        writer.write_record(&fields)?;
    }
    writer.flush()?;
    Ok(rows)
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    /// Rows written
    pub rows: usize,
    /// Bytes written
    pub bytes: usize,
}

/// Owns the current output file of one channel.
///
/// Touched only by the channel's drain thread.
pub struct RotatingFileSink {
    namer: FileNamer,
    opener: Arc<dyn FileOpener>,
    delimiter: u8,
    identity: FileIdentity,
    handle: Option<Box<dyn Write + Send>>,
    // Length of the current file up to its last complete block
    committed: u64,
    scratch: Vec<u8>,
    opened: Vec<PathBuf>,
}

impl RotatingFileSink {
    /// Create a sink and mint its first identity. No file is opened yet.
    pub fn new(mut namer: FileNamer, opener: Arc<dyn FileOpener>, delimiter: u8) -> Self {
        let identity = namer.next_identity();
        Self {
            namer,
            opener,
            delimiter,
            identity,
            handle: None,
            committed: 0,
            scratch: Vec::new(),
            opened: Vec::new(),
        }
    }

    /// Identity that the next block will be written to.
    pub fn identity(&self) -> &FileIdentity {
        &self.identity
    }

    /// Paths of every file this sink has opened, in order.
    pub fn opened_files(&self) -> &[PathBuf] {
        &self.opened
    }

    /// Close the current file and switch to a freshly minted identity.
    pub fn rotate(&mut self) -> io::Result<&FileIdentity> {
        let closed = self.close();
        self.identity = self.namer.next_identity();
        closed.map(|_| &self.identity)
    }

    /// Append one block to the current file, opening it on first use.
    ///
    /// The block is encoded in memory first, so rows never interleave with a
    /// partially encoded block. If the write fails, whatever part of the block
    /// reached the file is cut off again, the handle is dropped and the next
    /// block retries the open.
    pub fn append(&mut self, block: &SampleBlock) -> io::Result<Appended> {
        self.scratch.clear();
        let rows = encode_block(block, self.delimiter, &mut self.scratch)?;

        if self.handle.is_none() {
            let path = self.identity.path();
            let handle = self.opener.open_append(&path)?;
            self.committed = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if self.opened.last() != Some(&path) {
                self.opened.push(path);
            }
            self.handle = Some(handle);
        }

        let result = match self.handle.as_mut() {
            Some(handle) => handle
                .write_all(&self.scratch)
                .and_then(|_| handle.flush()),
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                self.committed += self.scratch.len() as u64;
                Ok(Appended {
                    rows,
                    bytes: self.scratch.len(),
                })
            }
            Err(e) => {
                self.discard_partial();
                Err(e)
            }
        }
    }

    /// Drop the handle and truncate the file to its last complete block.
    ///
    /// When the file cannot be truncated the sink moves on to a fresh identity,
    /// so the next block never lands behind a broken row.
    fn discard_partial(&mut self) {
        // Dropping a buffered handle can still flush part of the block
        self.handle = None;
        let path = self.identity.path();
        if let Err(e) = self.opener.truncate(&path, self.committed) {
            self.identity = self.namer.next_identity();
            warn!(
                path = %path.display(),
                next = %self.identity,
                error = %e,
                "Could not remove partial block; continuing in a new file"
            );
        }
    }

    /// Flush and close the current file, if any.
    pub fn close(&mut self) -> io::Result<()> {
        match self.handle.take() {
            Some(mut handle) => handle.flush(),
            None => Ok(()),
        }
    }
}
