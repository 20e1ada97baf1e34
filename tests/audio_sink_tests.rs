//! Audio sink integration tests

#![cfg(feature = "test-audio")]

use dwf_audio_bridge::audio_sink::{
    list_output_devices, AudioSink, CpalSink, OutputConfig, OutputDeviceInfo,
};
use std::f32::consts::PI;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SAMPLE_RATE: u32 = 48_000;

/// Interleaved stereo sine, with the right channel an octave above the left
fn generate_stereo_sine(frequency: f32, duration_ms: u32) -> Vec<i16> {
    let frames = (SAMPLE_RATE as f32 * (duration_ms as f32 / 1000.0)) as usize;
    let mut samples = Vec::with_capacity(frames * 2);

    for i in 0..frames {
        let t = i as f32 / SAMPLE_RATE as f32;
        let left = (2.0 * PI * frequency * t).sin();
        let right = (2.0 * PI * frequency * 2.0 * t).sin();
        samples.push((left * i16::MAX as f32 * 0.5) as i16);
        samples.push((right * i16::MAX as f32 * 0.5) as i16);
    }

    samples
}

fn default_output() -> Option<OutputDeviceInfo> {
    let devices = match list_output_devices() {
        Ok(devices) => devices,
        Err(e) => {
            println!("❌ Failed to list output devices: {}", e);
            return None;
        }
    };
    devices
        .iter()
        .find(|d| d.is_default)
        .or_else(|| devices.first())
        .cloned()
}

fn open_sink() -> Option<CpalSink> {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();

    let device = default_output()?;
    let config = OutputConfig {
        sample_rate: SAMPLE_RATE,
        channels: 2,
        buffer_ms: 250,
    };
    match CpalSink::open(&device, config, CancellationToken::new()) {
        Ok(sink) => {
            println!("✅ Audio sink created on {}", device.name);
            Some(sink)
        }
        Err(e) => {
            println!("❌ Failed to create audio sink: {}", e);
            None
        }
    }
}

#[test]
fn test_stereo_tone_playback() {
    println!("Playing 440 Hz left / 880 Hz right for 2 seconds...");
    let Some(sink) = open_sink() else { return };

    let samples = generate_stereo_sine(440.0, 2000);
    // Two seconds do not fit the 250ms buffer, so this only returns once most has played
    sink.write(&samples).expect("write should block, not fail");

    thread::sleep(Duration::from_millis(300));
    println!("Underruns: {}", sink.stats().underruns);
    sink.stop().unwrap();
}

#[test]
fn test_write_after_stop_fails() {
    let Some(sink) = open_sink() else { return };
    sink.stop().unwrap();
    assert!(sink.write(&[0, 0]).is_err());
}

#[test]
fn test_rapid_writes() {
    println!("You should hear 5 short beeps in quick succession");
    let Some(sink) = open_sink() else { return };

    let beep = generate_stereo_sine(880.0, 100);
    let silence = vec![0i16; beep.len()];
    for i in 0..5 {
        println!("Playing beep {} of 5...", i + 1);
        sink.write(&beep).unwrap();
        sink.write(&silence).unwrap();
    }

    thread::sleep(Duration::from_millis(500));
    let stats = sink.stats();
    assert!(stats.buffered_samples <= stats.capacity_samples);
}
