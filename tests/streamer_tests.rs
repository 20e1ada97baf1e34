//! Streaming loop behaviour against a scripted acquisition device

mod helpers;

use dwf_audio_bridge::config::BridgeConfig;
use dwf_audio_bridge::daq::{prepare_acquisition, DaqError, DaqState};
use dwf_audio_bridge::streamer::Streamer;
use dwf_audio_bridge::BridgeError;
use helpers::{Call, MemorySink, ScriptedDevice, Step};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[test_log::test]
fn test_waits_for_acquisition_to_start() {
    let cancel = CancellationToken::new();
    let mut device = ScriptedDevice::new(
        vec![
            Step::waiting(DaqState::Config),
            Step::waiting(DaqState::Prefill),
            Step::waiting(DaqState::Armed),
            Step::data(DaqState::Triggered, &[1, 2, 3], &[-1, -2, -3]),
        ],
        cancel.clone(),
    );
    let sink = MemorySink::default();

    let stats = Streamer::default().run(&mut device, &sink, &cancel).unwrap();

    // Record status is only queried once the device left the pre-acquisition states,
    // plus the final poll that ends the script
    assert_eq!(device.count(&Call::StatusRecord), 2);
    assert_eq!(sink.samples(), vec![1, -1, 2, -2, 3, -3]);
    assert_eq!(stats.total_samples, 3);
    assert_eq!(stats.batches, 1);
    assert!(!stats.lost_flag);
    assert!(!stats.corrupted_flag);
}

#[test_log::test]
fn test_reads_both_channels_per_batch() {
    let cancel = CancellationToken::new();
    let mut device = ScriptedDevice::new(
        vec![
            Step::data(DaqState::Triggered, &[10, 20], &[30, 40]),
            Step::data(DaqState::Triggered, &[50], &[60]),
        ],
        cancel.clone(),
    );
    let sink = MemorySink::default();

    let stats = Streamer::default().run(&mut device, &sink, &cancel).unwrap();

    assert_eq!(device.count(&Call::Read(0, 2)), 1);
    assert_eq!(device.count(&Call::Read(1, 2)), 1);
    assert_eq!(device.count(&Call::Read(0, 1)), 1);
    assert_eq!(device.count(&Call::Read(1, 1)), 1);
    assert_eq!(sink.writes(), 2);
    assert_eq!(sink.samples(), vec![10, 30, 20, 40, 50, 60]);
    assert_eq!(stats.total_samples, 3);
}

#[test_log::test]
fn test_pre_acquisition_state_after_data_is_not_skipped() {
    let cancel = CancellationToken::new();
    let mut device = ScriptedDevice::new(
        vec![
            Step::data(DaqState::Triggered, &[1], &[2]),
            Step::data(DaqState::Armed, &[3], &[4]),
        ],
        cancel.clone(),
    );
    let sink = MemorySink::default();

    Streamer::default().run(&mut device, &sink, &cancel).unwrap();

    assert_eq!(sink.samples(), vec![1, 2, 3, 4]);
}

#[test_log::test]
fn test_empty_polls_write_nothing() {
    let cancel = CancellationToken::new();
    let mut device = ScriptedDevice::new(
        vec![
            Step::waiting(DaqState::Triggered),
            Step::waiting(DaqState::Triggered),
        ],
        cancel.clone(),
    );
    let sink = MemorySink::default();

    let stats = Streamer::new(Duration::from_millis(1))
        .run(&mut device, &sink, &cancel)
        .unwrap();

    assert_eq!(sink.writes(), 0);
    assert_eq!(stats.batches, 0);
    assert!(!device.calls.iter().any(|c| matches!(c, Call::Read(..))));
}

#[test_log::test]
fn test_lost_and_corrupted_samples_are_flagged_only() {
    let cancel = CancellationToken::new();
    let mut device = ScriptedDevice::new(
        vec![
            Step::waiting(DaqState::Triggered).with_loss(5, 0),
            Step::data(DaqState::Triggered, &[7, 8], &[9, 10]).with_loss(1, 2),
            Step::data(DaqState::Triggered, &[11], &[12]),
        ],
        cancel.clone(),
    );
    let sink = MemorySink::default();

    let stats = Streamer::default().run(&mut device, &sink, &cancel).unwrap();

    assert!(stats.lost_flag);
    assert!(stats.corrupted_flag);
    assert_eq!(stats.lost_samples, 6);
    assert_eq!(stats.corrupted_samples, 2);
    // Lost samples count towards the total alongside delivered ones
    assert_eq!(stats.total_samples, 6 + 3);
    // Streaming carries on unchanged after a loss
    assert_eq!(sink.samples(), vec![7, 9, 8, 10, 11, 12]);
}

#[test_log::test]
fn test_lost_samples_end_the_startup_wait() {
    let cancel = CancellationToken::new();
    let mut device = ScriptedDevice::new(
        vec![
            Step::waiting(DaqState::Triggered).with_loss(4, 0),
            Step::data(DaqState::Prefill, &[1], &[2]),
        ],
        cancel.clone(),
    );
    let sink = MemorySink::default();

    Streamer::default().run(&mut device, &sink, &cancel).unwrap();

    assert_eq!(sink.samples(), vec![1, 2]);
}

#[test_log::test]
fn test_cancelled_before_start_never_polls() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut device = ScriptedDevice::new(
        vec![Step::data(DaqState::Triggered, &[1], &[2])],
        cancel.clone(),
    );
    let sink = MemorySink::default();

    let stats = Streamer::default().run(&mut device, &sink, &cancel).unwrap();

    assert!(device.calls.is_empty());
    assert_eq!(stats.total_samples, 0);
}

#[test_log::test]
fn test_sink_failure_stops_streaming() {
    let cancel = CancellationToken::new();
    let mut device = ScriptedDevice::new(
        vec![
            Step::data(DaqState::Triggered, &[1], &[2]),
            Step::data(DaqState::Triggered, &[3], &[4]),
        ],
        cancel.clone(),
    );
    let sink = MemorySink::failing();

    let result = Streamer::default().run(&mut device, &sink, &cancel);

    assert!(matches!(result, Err(BridgeError::Audio(_))));
    assert_eq!(device.count(&Call::Status), 1);
}

#[test_log::test]
fn test_sink_stopped_during_shutdown_ends_cleanly() {
    let cancel = CancellationToken::new();
    let mut device = ScriptedDevice::new(
        vec![
            Step::data(DaqState::Triggered, &[1], &[2]),
            Step::data(DaqState::Triggered, &[3], &[4]),
        ],
        cancel.clone(),
    );
    let sink = MemorySink::shut_down_by(cancel.clone());

    let stats = Streamer::default().run(&mut device, &sink, &cancel).unwrap();

    assert_eq!(device.count(&Call::Status), 1);
    assert_eq!(sink.writes(), 0);
    assert_eq!(stats.batches, 0);
}

#[test_log::test]
fn test_read_failure_stops_streaming() {
    let cancel = CancellationToken::new();
    let mut device = ScriptedDevice::new(
        vec![Step::data(DaqState::Triggered, &[1], &[2])],
        cancel.clone(),
    );
    device.fail_reads = true;
    let sink = MemorySink::default();

    let result = Streamer::default().run(&mut device, &sink, &cancel);

    assert!(matches!(
        result,
        Err(BridgeError::Daq(DaqError::Call { function: "FDwfAnalogInStatusData16", .. }))
    ));
    assert_eq!(sink.writes(), 0);
}

#[test_log::test]
fn test_prepare_configures_before_starting() {
    let cancel = CancellationToken::new();
    let mut device = ScriptedDevice::new(Vec::new(), cancel);
    let setup = BridgeConfig::default().acquisition_setup();

    prepare_acquisition(&mut device, &setup, Duration::from_millis(5)).unwrap();

    assert_eq!(device.calls, vec![Call::Configure(setup), Call::Start]);
}

#[test_log::test]
fn test_prepare_rejects_empty_channel_list() {
    let cancel = CancellationToken::new();
    let mut device = ScriptedDevice::new(Vec::new(), cancel);
    let mut setup = BridgeConfig::default().acquisition_setup();
    setup.channels.clear();

    let result = prepare_acquisition(&mut device, &setup, Duration::ZERO);

    assert!(matches!(result, Err(DaqError::InvalidArgument(_))));
    assert!(device.calls.is_empty());
}
