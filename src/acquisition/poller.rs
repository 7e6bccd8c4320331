//! Counter-compare polling of one source.

use std::sync::Arc;
use tracing::trace;

use crate::error::{AppResult, DaqError};
use crate::hardware::{BlockSource, SampleBlock};

/// Bookkeeping for one source, owned by the polling loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceState {
    /// Channel label
    pub label: String,
    /// Samples per row
    pub channel_count: usize,
    /// Last producer counter value observed (monotonic)
    pub last_seen_count: u64,
    /// Blocks extracted so far
    pub blocks_observed: u64,
    /// Blocks the source completed that were never observed (polling fell behind)
    pub blocks_missed: u64,
}

impl SourceState {
    /// Fresh state: nothing seen yet.
    pub fn new(label: impl Into<String>, channel_count: usize) -> Self {
        Self {
            label: label.into(),
            channel_count,
            last_seen_count: 0,
            blocks_observed: 0,
            blocks_missed: 0,
        }
    }
}

/// Detects new blocks on one source by comparing its producer counter.
///
/// At most one block is extracted per poll: the source's latest. When the
/// counter jumped by more than one, the intermediate blocks are gone and are
/// only accounted for in `blocks_missed`.
pub struct SourcePoller {
    source: Arc<dyn BlockSource>,
    state: SourceState,
}

impl SourcePoller {
    /// Create a poller for `source`.
    pub fn new(
        source: Arc<dyn BlockSource>,
        label: impl Into<String>,
        channel_count: usize,
    ) -> Self {
        Self {
            source,
            state: SourceState::new(label, channel_count),
        }
    }

    /// Current bookkeeping.
    pub fn state(&self) -> &SourceState {
        &self.state
    }

    /// The polled source.
    pub fn source(&self) -> &Arc<dyn BlockSource> {
        &self.source
    }

    /// Poll once. Never blocks.
    ///
    /// Returns `Ok(None)` when the counter has not moved, the latest block when
    /// it has, and an integration error when the counter went backwards or the
    /// block does not fit the channel count.
    pub fn poll(&mut self) -> AppResult<Option<SampleBlock>> {
        let current = self.source.produced_count();
        let previous = self.state.last_seen_count;

        if current < previous {
            return Err(DaqError::CounterRegressed {
                channel: self.state.label.clone(),
                previous,
                current,
            });
        }
        if current == previous {
            return Ok(None);
        }

        let missed = current - previous - 1;
        if missed > 0 {
            self.state.blocks_missed += missed;
            trace!(
                channel = %self.state.label,
                missed,
                "Source advanced more than one block between polls"
            );
        }
        self.state.last_seen_count = current;

        let block = SampleBlock::new(self.source.latest_block(), self.state.channel_count, current);
        if !block.is_well_formed() {
            return Err(DaqError::MalformedBlock {
                channel: self.state.label.clone(),
                len: block.samples.len(),
                channel_count: self.state.channel_count,
            });
        }

        self.state.blocks_observed += 1;
        Ok(Some(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{ManualSource, Samples};

    fn poller(channels: usize) -> (Arc<ManualSource>, SourcePoller) {
        let source = Arc::new(ManualSource::new("dev", channels));
        let poller = SourcePoller::new(source.clone(), "dev", channels);
        (source, poller)
    }

    #[test]
    fn test_no_change_returns_none() {
        let (_source, mut poller) = poller(1);
        assert!(poller.poll().unwrap().is_none());
        assert!(poller.poll().unwrap().is_none());
    }

    #[test]
    fn test_one_block_per_increase() {
        let (source, mut poller) = poller(2);
        source.publish(vec![1.0, 2.0]);

        let block = poller.poll().unwrap().unwrap();
        assert_eq!(block.samples, Samples::F64(vec![1.0, 2.0]));
        assert_eq!(block.sequence, 1);
        assert!(poller.poll().unwrap().is_none());
        assert_eq!(poller.state().blocks_observed, 1);
    }

    #[test]
    fn test_skipped_blocks_are_counted_not_recovered() {
        let (source, mut poller) = poller(1);
        source.publish(vec![1.0]);
        source.publish(vec![2.0]);
        source.publish(vec![3.0]);

        let block = poller.poll().unwrap().unwrap();
        assert_eq!(block.samples, Samples::F64(vec![3.0]));
        assert!(poller.poll().unwrap().is_none());
        assert_eq!(poller.state().last_seen_count, 3);
        assert_eq!(poller.state().blocks_missed, 2);
    }

    #[test]
    fn test_counter_regression_is_error() {
        let (source, mut poller) = poller(1);
        source.publish(vec![1.0]);
        source.publish(vec![2.0]);
        poller.poll().unwrap();

        source.set_count(1);
        let err = poller.poll().unwrap_err();
        assert!(matches!(
            err,
            DaqError::CounterRegressed {
                previous: 2,
                current: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_malformed_block_is_error() {
        let (source, mut poller) = poller(2);
        source.publish(vec![1.0, 2.0, 3.0]);
        let err = poller.poll().unwrap_err();
        assert!(err.is_integration_error());
    }
}
