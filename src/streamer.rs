use crate::audio_sink::AudioSink;
use crate::daq::AnalogInput;
use crate::error::Result;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const LEFT_CHANNEL: i32 = 0;
pub const RIGHT_CHANNEL: i32 = 1;

/// Pair two channel buffers into stereo frames, truncating to the shorter one
pub fn interleave(left: &[i16], right: &[i16]) -> Vec<i16> {
    left.iter()
        .zip(right)
        .flat_map(|(&l, &r)| [l, r])
        .collect()
}

/// Counters collected over one streaming session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Samples per channel seen so far, including lost ones
    pub total_samples: u64,
    /// Non-empty batches forwarded to the sink
    pub batches: u64,
    pub lost_samples: u64,
    pub corrupted_samples: u64,
    pub lost_flag: bool,
    pub corrupted_flag: bool,
    pub elapsed: Duration,
}

impl StreamStats {
    pub fn log_summary(&self) {
        log::info!(
            "📊 Streamed {} samples/channel in {} batches over {:.1}s",
            self.total_samples,
            self.batches,
            self.elapsed.as_secs_f64()
        );
        if self.lost_flag {
            log::warn!(
                "Samples were lost ({} total)! Reduce the acquisition frequency",
                self.lost_samples
            );
        }
        if self.corrupted_flag {
            log::warn!(
                "Samples could be corrupted ({} total)! Reduce the acquisition frequency",
                self.corrupted_samples
            );
        }
    }
}

/// Polls the acquisition device and forwards stereo batches to a sink
#[derive(Debug, Clone)]
pub struct Streamer {
    poll_interval: Duration,
}

impl Default for Streamer {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl Streamer {
    /// `poll_interval` is slept after polls that delivered nothing; zero spins
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Stream until `cancel` fires or the device or sink fails
    pub fn run<D, S>(&self, device: &mut D, sink: &S, cancel: &CancellationToken) -> Result<StreamStats>
    where
        D: AnalogInput + ?Sized,
        S: AudioSink + ?Sized,
    {
        let started = Instant::now();
        let mut stats = StreamStats::default();
        let mut left = Vec::new();
        let mut right = Vec::new();

        log::info!("🎧 Streaming started");

        while !cancel.is_cancelled() {
            let state = device.status()?;
            if stats.total_samples == 0 && state.is_pre_acquisition() {
                // Acquisition not yet started
                self.idle();
                continue;
            }

            let record = device.status_record()?;
            stats.total_samples += record.lost as u64;
            stats.lost_samples += record.lost as u64;
            stats.corrupted_samples += record.corrupted as u64;

            if record.lost > 0 && !stats.lost_flag {
                stats.lost_flag = true;
                log::warn!("⚠️  {} samples lost by the device", record.lost);
            }
            if record.corrupted > 0 && !stats.corrupted_flag {
                stats.corrupted_flag = true;
                log::warn!("⚠️  {} samples possibly corrupted", record.corrupted);
            }

            if record.available == 0 {
                self.idle();
                continue;
            }

            left.resize(record.available, 0);
            right.resize(record.available, 0);
            device.read_channel(LEFT_CHANNEL, &mut left)?;
            device.read_channel(RIGHT_CHANNEL, &mut right)?;

            if let Err(e) = sink.write(&interleave(&left, &right)) {
                if cancel.is_cancelled() {
                    log::debug!("Dropping final batch on shutdown: {}", e);
                    break;
                }
                return Err(e.into());
            }

            stats.total_samples += record.available as u64;
            stats.batches += 1;
            log::trace!(
                "Forwarded {} frames (state {}, total {})",
                record.available,
                state,
                stats.total_samples
            );
        }

        stats.elapsed = started.elapsed();
        log::info!("🛑 Streaming stopped");
        Ok(stats)
    }

    fn idle(&self) {
        if !self.poll_interval.is_zero() {
            thread::sleep(self.poll_interval);
        }
    }
}
