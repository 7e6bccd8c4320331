//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use chrono::{Local, TimeZone};
use daq_recorder::data::{Clock, FileOpener, FsOpener};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// Clock stuck at 2024-05-17 09:30:00 local time.
pub fn frozen_clock() -> Clock {
    Arc::new(|| {
        Local
            .with_ymd_and_hms(2024, 5, 17, 9, 30, 0)
            .single()
            .unwrap()
    })
}

/// Contents of `path`, one entry per line.
pub fn read_rows(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Rows of every file in order.
pub fn read_all_rows(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().flat_map(|p| read_rows(p)).collect()
}

/// Fails the N-th open (1-based); every other open hits the real filesystem.
pub struct FlakyOpener {
    fail_on: usize,
    calls: AtomicUsize,
}

impl FlakyOpener {
    pub fn failing_on(call: usize) -> Self {
        Self {
            fail_on: call,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FileOpener for FlakyOpener {
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "simulated open failure",
            ));
        }
        FsOpener.open_append(path)
    }
}

/// Every open fails.
pub struct BrokenOpener;

impl FileOpener for BrokenOpener {
    fn open_append(&self, _path: &Path) -> io::Result<Box<dyn Write + Send>> {
        Err(io::Error::new(io::ErrorKind::Other, "disk unavailable"))
    }
}

/// The first file handed out parks its first `write` until released.
pub struct GatedOpener {
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

/// Test side of a [`GatedOpener`].
pub struct Gate {
    pub entered: Receiver<()>,
    pub release: Sender<()>,
}

impl GatedOpener {
    pub fn new() -> (Self, Gate) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        (
            Self {
                gate: Mutex::new(Some((entered_tx, release_rx))),
            },
            Gate {
                entered: entered_rx,
                release: release_tx,
            },
        )
    }
}

impl FileOpener for GatedOpener {
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let inner = FsOpener.open_append(path)?;
        Ok(Box::new(GatedWrite {
            inner,
            gate: self.gate.lock().take(),
        }))
    }
}

struct GatedWrite {
    inner: Box<dyn Write + Send>,
    gate: Option<(Sender<()>, Receiver<()>)>,
}

impl Write for GatedWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some((entered, release)) = self.gate.take() {
            let _ = entered.send(());
            let _ = release.recv();
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// The first file handed out takes `budget` bytes and then fails every write.
pub struct ShortWriteOpener {
    budget: Mutex<Option<usize>>,
}

impl ShortWriteOpener {
    pub fn accepting(budget: usize) -> Self {
        Self {
            budget: Mutex::new(Some(budget)),
        }
    }
}

impl FileOpener for ShortWriteOpener {
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let inner = FsOpener.open_append(path)?;
        match self.budget.lock().take() {
            Some(budget) => Ok(Box::new(ShortWrite { inner, budget })),
            None => Ok(inner),
        }
    }
}

struct ShortWrite {
    inner: Box<dyn Write + Send>,
    budget: usize,
}

impl Write for ShortWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.budget == 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "no space left"));
        }
        let n = buf.len().min(self.budget);
        self.budget -= n;
        self.inner.write_all(&buf[..n])?;
        self.inner.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
