//! Polling side of the pipeline.
//!
//! - [`poller`]: counter-compare polling of a single source
//! - [`coordinator`]: the single polling thread driving every channel

pub mod coordinator;
pub mod poller;

pub use coordinator::{
    AcquisitionCoordinator, ChannelSpec, ChannelSummary, CoordinatorState, RunSummary, StopHandle,
};
pub use poller::{SourcePoller, SourceState};
