//! # DAQ Recorder Core Library
//!
//! Records several free-running sources (multi-channel analog input devices,
//! audio capture streams) to rotating delimited text files, one file series per
//! source, without the acquisition loop ever waiting on disk.
//!
//! ## Pipeline
//!
//! ```text
//! BlockSource ─▶ SourcePoller ─▶ AsyncWriter queue ─▶ drain thread ─▶ RotatingFileSink ─▶ file
//!                     ▲                 ▲
//!                     └── AcquisitionCoordinator (single polling thread, rotation cadence)
//! ```
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: counter-compare polling (`SourcePoller`) and the
//!   `AcquisitionCoordinator` that drives every channel from one thread.
//! - **`config`**: figment-based configuration (`RecorderConfig`) for the binary.
//! - **`data`**: the per-channel `AsyncWriter` and the `RotatingFileSink` with its
//!   file naming policy.
//! - **`error`**: the crate-wide `DaqError` and `AppResult`.
//! - **`hardware`**: the `BlockSource` trait, sample types, and mock sources.
//! - **`logging`**: tracing subscriber setup.

pub mod acquisition;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
