//! End-to-end tests for the polling pipeline: coordinator, writers and files.
//!
//! Sources are driven by hand (`ManualSource`) and cycles are stepped with
//! `poll_cycle()`, so every scenario is deterministic. One test runs the full
//! `run()` loop against a free-running simulated source.

mod common;

use common::{frozen_clock, read_all_rows, read_rows, BrokenOpener, FlakyOpener};
use daq_recorder::acquisition::{AcquisitionCoordinator, ChannelSpec, CoordinatorState};
use daq_recorder::error::DaqError;
use daq_recorder::hardware::{BlockSource, ManualSource, SimulatedSource};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use tracing_test::traced_test;

fn manual_spec(dir: &Path, source: &Arc<ManualSource>, label: &str, threshold: u64) -> ChannelSpec {
    let channels = source.channel_count();
    ChannelSpec::new(source.clone(), dir, label, channels, threshold).with_clock(frozen_clock())
}

#[test]
fn counter_sequence_with_threshold_two_rotates_before_second_block() {
    let temp_dir = TempDir::new().unwrap();
    let source = Arc::new(ManualSource::new("dev", 1));
    let mut coordinator = AcquisitionCoordinator::new();
    coordinator
        .register(manual_spec(temp_dir.path(), &source, "run", 2))
        .unwrap();
    coordinator.start().unwrap();

    let script = [(0, None), (0, None), (1, Some(10.0)), (1, None), (2, Some(20.0))];
    let mut enqueued = 0;
    for (count, latest) in script {
        if let Some(value) = latest {
            source.set_latest(vec![value]);
        }
        source.set_count(count);
        enqueued += coordinator.poll_cycle().unwrap();
    }
    let summary = coordinator.shutdown().unwrap();

    assert_eq!(enqueued, 2);
    let channel = summary.channel("run").unwrap();
    assert_eq!(channel.writer.blocks_enqueued, 2);
    assert_eq!(channel.rotations_requested, 1);
    assert_eq!(channel.writer.rotations, 1);
    assert_eq!(channel.files.len(), 2);
    assert_ne!(channel.files[0], channel.files[1]);
    assert_eq!(read_rows(&channel.files[0]), vec!["10"]);
    assert_eq!(read_rows(&channel.files[1]), vec!["20"]);
}

#[test]
fn rotation_never_drops_or_reorders_rows() {
    let temp_dir = TempDir::new().unwrap();
    let source = Arc::new(ManualSource::new("dev", 2));
    let mut coordinator = AcquisitionCoordinator::new();
    coordinator
        .register(manual_spec(temp_dir.path(), &source, "run", 3))
        .unwrap();
    coordinator.start().unwrap();

    for i in 0..10 {
        // Three rows of two channels per block
        let base = f64::from(i) * 10.0;
        source.publish(vec![base, base + 0.5, base + 1.0, base + 1.5, base + 2.0, base + 2.5]);
        assert_eq!(coordinator.poll_cycle().unwrap(), 1);
        assert_eq!(coordinator.poll_cycle().unwrap(), 0);
    }
    let summary = coordinator.shutdown().unwrap();
    let channel = summary.channel("run").unwrap();

    // Rotations before blocks 3, 6 and 9 (1-based)
    assert_eq!(channel.files.len(), 4);
    assert_eq!(channel.writer.rows_written, 30);

    let rows = read_all_rows(&channel.files);
    let expected: Vec<String> = (0..10)
        .flat_map(|i| {
            let base = f64::from(i) * 10.0;
            (0..3).map(move |r| {
                let first = base + f64::from(r);
                format!("{},{}", first, first + 0.5)
            })
        })
        .collect();
    assert_eq!(rows, expected);
    assert_eq!(read_rows(&channel.files[0]).len(), 6);
    assert_eq!(read_rows(&channel.files[1]).len(), 9);
}

#[test]
fn rows_match_observed_counter_increases() {
    let temp_dir = TempDir::new().unwrap();
    let source = Arc::new(ManualSource::new("dev", 1));
    let mut coordinator = AcquisitionCoordinator::new();
    coordinator
        .register(manual_spec(temp_dir.path(), &source, "run", 100))
        .unwrap();
    coordinator.start().unwrap();

    source.publish(vec![1.0]);
    coordinator.poll_cycle().unwrap();
    // Producer outruns polling: only the latest of these survives
    source.publish(vec![2.0]);
    source.publish(vec![3.0]);
    source.publish(vec![4.0]);
    coordinator.poll_cycle().unwrap();
    coordinator.poll_cycle().unwrap();

    let summary = coordinator.shutdown().unwrap();
    let channel = summary.channel("run").unwrap();
    assert_eq!(channel.blocks_observed, 2);
    assert_eq!(channel.blocks_missed, 2);
    assert_eq!(read_all_rows(&channel.files), vec!["1", "4"]);
}

#[test]
fn shutdown_drains_every_queue() {
    let temp_dir = TempDir::new().unwrap();
    let a = Arc::new(ManualSource::new("a", 4));
    let b = Arc::new(ManualSource::new("b", 1));
    let mut coordinator = AcquisitionCoordinator::new();
    coordinator
        .register(manual_spec(&temp_dir.path().join("a"), &a, "run", 7))
        .unwrap();
    coordinator
        .register(manual_spec(&temp_dir.path().join("b"), &b, "run", 7))
        .unwrap();
    std::fs::create_dir_all(temp_dir.path().join("a")).unwrap();
    std::fs::create_dir_all(temp_dir.path().join("b")).unwrap();
    coordinator.start().unwrap();

    for i in 0..200 {
        a.publish(vec![f64::from(i); 400]);
        b.publish(vec![f64::from(i)]);
        coordinator.poll_cycle().unwrap();
    }
    let summary = coordinator.shutdown().unwrap();

    assert_eq!(coordinator.state(), CoordinatorState::Idle);
    for channel in &summary.channels {
        assert_eq!(channel.pending_after_stop, 0);
        assert_eq!(channel.blocks_observed, 200);
        assert_eq!(channel.writer.blocks_written, 200);
        assert!(channel.failure.is_none());
    }
    assert_eq!(summary.channel("run").unwrap().source, "a");
    assert_eq!(summary.total_blocks_written(), 400);
    assert_eq!(summary.channels[0].writer.rows_written, 200 * 100);
}

#[test]
fn open_failure_drops_only_that_block() {
    let temp_dir = TempDir::new().unwrap();
    let source = Arc::new(ManualSource::new("dev", 1));
    let opener = Arc::new(FlakyOpener::failing_on(3));
    let mut coordinator = AcquisitionCoordinator::new();
    coordinator
        .register(manual_spec(temp_dir.path(), &source, "run", 1).with_opener(opener.clone()))
        .unwrap();
    coordinator.start().unwrap();

    for i in 1..=5 {
        source.publish(vec![f64::from(i)]);
        coordinator.poll_cycle().unwrap();
    }
    let summary = coordinator.shutdown().unwrap();
    let channel = summary.channel("run").unwrap();

    assert_eq!(opener.calls(), 5);
    assert_eq!(channel.writer.blocks_dropped_io, 1);
    assert_eq!(channel.writer.blocks_written, 4);
    assert!(channel.failure.is_none());
    // Every block has its own file; block 3 never got one
    assert_eq!(channel.files.len(), 4);
    assert_eq!(read_rows(&channel.files[2]), vec!["4"]);
    assert_eq!(read_all_rows(&channel.files), vec!["1", "2", "4", "5"]);
}

#[test]
#[traced_test]
fn write_failures_are_reported_not_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let source = Arc::new(ManualSource::new("dev", 1));
    let mut coordinator = AcquisitionCoordinator::new();
    coordinator
        .register(
            manual_spec(temp_dir.path(), &source, "run", 10).with_opener(Arc::new(BrokenOpener)),
        )
        .unwrap();
    coordinator.start().unwrap();

    for i in 0..3 {
        source.publish(vec![f64::from(i)]);
        assert_eq!(coordinator.poll_cycle().unwrap(), 1);
    }
    let summary = coordinator.shutdown().unwrap();
    let channel = summary.channel("run").unwrap();

    assert_eq!(channel.writer.blocks_dropped_io, 3);
    assert_eq!(channel.writer.blocks_written, 0);
    assert!(channel.files.is_empty());
    assert!(channel.failure.is_none());
    assert!(logs_contain("Dropped block: write failed"));
    assert!(logs_contain("disk unavailable"));
}

#[test]
#[traced_test]
fn integration_error_stops_only_that_channel() {
    let temp_dir = TempDir::new().unwrap();
    let good = Arc::new(ManualSource::new("good", 1));
    let bad = Arc::new(ManualSource::new("bad", 1));
    let mut coordinator = AcquisitionCoordinator::new();
    coordinator
        .register(manual_spec(temp_dir.path(), &bad, "bad", 10))
        .unwrap();
    coordinator
        .register(manual_spec(temp_dir.path(), &good, "good", 10))
        .unwrap();
    coordinator.start().unwrap();

    bad.publish(vec![1.0]);
    bad.publish(vec![2.0]);
    good.publish(vec![1.0]);
    assert_eq!(coordinator.poll_cycle().unwrap(), 2);

    bad.set_count(1);
    good.publish(vec![2.0]);
    assert_eq!(coordinator.poll_cycle().unwrap(), 1);

    // A failed channel is not polled again, even if its counter recovers
    bad.publish(vec![3.0]);
    bad.publish(vec![4.0]);
    good.publish(vec![3.0]);
    assert_eq!(coordinator.poll_cycle().unwrap(), 1);

    let summary = coordinator.shutdown().unwrap();
    let bad_summary = summary.channel("bad").unwrap();
    let good_summary = summary.channel("good").unwrap();

    assert!(bad_summary
        .failure
        .as_deref()
        .is_some_and(|f| f.contains("backwards")));
    assert_eq!(read_all_rows(&bad_summary.files), vec!["2"]);
    assert!(good_summary.failure.is_none());
    assert_eq!(read_all_rows(&good_summary.files), vec!["1", "2", "3"]);
    assert!(logs_contain("Channel failed"));
}

#[test]
fn run_ends_when_every_channel_has_failed() {
    let temp_dir = TempDir::new().unwrap();
    let source = Arc::new(ManualSource::new("dev", 2));
    // Counter moved but the block does not fit two channels
    source.publish(vec![1.0, 2.0, 3.0]);

    let mut coordinator = AcquisitionCoordinator::new();
    coordinator
        .register(manual_spec(temp_dir.path(), &source, "run", 1))
        .unwrap();
    let summary = coordinator.run().unwrap();

    let channel = summary.channel("run").unwrap();
    assert!(channel.failure.is_some());
    assert_eq!(channel.writer.blocks_enqueued, 0);
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
}

#[test]
fn configuration_errors_surface_at_registration() {
    let temp_dir = TempDir::new().unwrap();
    let source = Arc::new(ManualSource::new("dev", 2));
    let mut coordinator = AcquisitionCoordinator::new();

    let zero_threshold = coordinator.register(manual_spec(temp_dir.path(), &source, "run", 0));
    assert!(matches!(zero_threshold, Err(DaqError::Configuration(_))));

    let wrong_channels = coordinator.register_channel(source.clone(), temp_dir.path(), "run", 3, 5);
    assert!(matches!(wrong_channels, Err(DaqError::Configuration(_))));

    let bad_delimiter =
        coordinator.register(manual_spec(temp_dir.path(), &source, "run", 5).with_delimiter(b'\n'));
    assert!(matches!(bad_delimiter, Err(DaqError::Configuration(_))));

    assert!(coordinator.channel_labels().is_empty());
    assert!(matches!(coordinator.run(), Err(DaqError::InvalidState(_))));
}

#[test]
fn restart_with_new_sources_and_label() {
    let temp_dir = TempDir::new().unwrap();
    let mut coordinator = AcquisitionCoordinator::new();

    let first = Arc::new(ManualSource::new("dev", 1));
    coordinator
        .register(manual_spec(temp_dir.path(), &first, "morning", 5))
        .unwrap();
    coordinator.start().unwrap();
    first.publish(vec![1.0]);
    coordinator.poll_cycle().unwrap();
    let morning = coordinator.shutdown().unwrap();

    let second = Arc::new(ManualSource::new("dev", 1));
    coordinator
        .register(manual_spec(temp_dir.path(), &second, "evening", 5))
        .unwrap();
    coordinator.start().unwrap();
    second.publish(vec![2.0]);
    coordinator.poll_cycle().unwrap();
    let evening = coordinator.shutdown().unwrap();

    let morning_files = &morning.channel("morning").unwrap().files;
    let evening_files = &evening.channel("evening").unwrap().files;
    assert_eq!(morning_files.len(), 1);
    assert_eq!(evening_files.len(), 1);
    assert!(evening_files[0]
        .file_name()
        .unwrap()
        .to_string_lossy()
        .ends_with("_evening.csv"));
    assert_eq!(read_rows(&morning_files[0]), vec!["1"]);
    assert_eq!(read_rows(&evening_files[0]), vec!["2"]);
}

#[test]
fn run_until_stop_with_simulated_sources() {
    let temp_dir = TempDir::new().unwrap();
    let analog = Arc::new(SimulatedSource::analog(
        "NiDAQ",
        3,
        20,
        Duration::from_millis(5),
    ));
    let audio = Arc::new(SimulatedSource::audio("mic", 64, Duration::from_millis(5)));

    let mut coordinator =
        AcquisitionCoordinator::new().with_idle_backoff(Duration::from_micros(100));
    for (source, dir) in [
        (analog.clone() as Arc<dyn BlockSource>, "NiDAQ"),
        (audio.clone() as Arc<dyn BlockSource>, "mic"),
    ] {
        let directory = temp_dir.path().join(dir);
        std::fs::create_dir_all(&directory).unwrap();
        let channels = source.channel_count();
        coordinator
            .register(ChannelSpec::new(source, directory, "sim", channels, 4))
            .unwrap();
    }

    analog.start().unwrap();
    audio.start().unwrap();
    let stop = coordinator.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        stop.request_stop();
    });

    let summary = coordinator.run().unwrap();
    stopper.join().unwrap();
    analog.stop().unwrap();
    audio.stop().unwrap();

    for channel in &summary.channels {
        assert!(channel.failure.is_none());
        assert!(channel.blocks_observed > 0);
        assert_eq!(channel.pending_after_stop, 0);
        assert_eq!(
            channel.writer.blocks_written + channel.writer.blocks_dropped_overflow,
            channel.blocks_observed
        );
    }

    let analog_rows = read_all_rows(&summary.channel("sim").unwrap().files);
    assert!(analog_rows.iter().all(|row| row.split(',').count() == 3));

    let audio_summary = &summary.channels[1];
    for row in read_all_rows(&audio_summary.files) {
        row.parse::<i16>().unwrap();
    }
}
