use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, sync_channel, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How long a blocked writer sleeps before re-checking for shutdown
const WRITE_WAIT: Duration = Duration::from_millis(100);

#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("Failed to write audio data: {0}")]
    WriteError(String),

    #[error("Failed to stop audio playback: {0}")]
    StopError(String),

    #[error("Sink is stopped")]
    Stopped,

    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    #[error("Unsupported output configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to record audio: {0}")]
    RecordError(String),

    #[error("Audio device error: {0}")]
    DeviceError(String),

    #[error("IO error: {0}")]
    Io(String),
}

macro_rules! device_error_from {
    ($($err:ty),*) => {
        $(impl From<$err> for AudioError {
            fn from(err: $err) -> Self {
                AudioError::DeviceError(err.to_string())
            }
        })*
    };
}

device_error_from!(
    cpal::DevicesError,
    cpal::DeviceNameError,
    cpal::SupportedStreamConfigsError,
    cpal::BuildStreamError,
    cpal::PlayStreamError
);

impl From<std::io::Error> for AudioError {
    fn from(err: std::io::Error) -> Self {
        AudioError::Io(err.to_string())
    }
}

/// Destination for interleaved 16-bit frames
pub trait AudioSink: Send + Sync {
    /// Queue interleaved samples, blocking until the sink has room for them
    fn write(&self, interleaved: &[i16]) -> Result<(), AudioError>;

    /// Stop playback; later writes fail
    fn stop(&self) -> Result<(), AudioError>;
}

impl<T: AudioSink + ?Sized> AudioSink for Arc<T> {
    fn write(&self, interleaved: &[i16]) -> Result<(), AudioError> {
        (**self).write(interleaved)
    }

    fn stop(&self) -> Result<(), AudioError> {
        (**self).stop()
    }
}

/// Output device as presented to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDeviceInfo {
    /// 1-based position in the listing
    pub index: usize,
    pub name: String,
    pub is_default: bool,
    pub max_channels: u16,
}

/// List output devices that expose at least one output channel
pub fn list_output_devices() -> Result<Vec<OutputDeviceInfo>, AudioError> {
    let host = cpal::default_host();
    log::debug!("AudioSink: Using audio host: {:?}", host.id());

    let default_name = host
        .default_output_device()
        .and_then(|d| d.name().ok());

    let mut result = Vec::new();
    for device in host.output_devices()? {
        let name = match device.name() {
            Ok(name) => name,
            Err(e) => {
                log::debug!("AudioSink: Skipping unnamed output device: {}", e);
                continue;
            }
        };
        let max_channels = match device.supported_output_configs() {
            Ok(configs) => configs.map(|c| c.channels()).max().unwrap_or(0),
            Err(e) => {
                log::debug!("AudioSink: No output configs for {}: {}", name, e);
                0
            }
        };
        if max_channels == 0 {
            continue;
        }

        result.push(OutputDeviceInfo {
            index: result.len() + 1,
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            max_channels,
        });
    }

    Ok(result)
}

/// Resolve a user selection: a 1-based number from the listing or an exact device name
pub fn select_output_device<'a>(
    devices: &'a [OutputDeviceInfo],
    input: &str,
) -> Result<&'a OutputDeviceInfo, AudioError> {
    let input = input.trim();
    if let Ok(number) = input.parse::<usize>() {
        return number
            .checked_sub(1)
            .and_then(|i| devices.get(i))
            .ok_or_else(|| {
                AudioError::InvalidSelection(format!(
                    "{} is not between 1 and {}",
                    number,
                    devices.len()
                ))
            });
    }

    devices
        .iter()
        .find(|d| d.name == input)
        .ok_or_else(|| AudioError::InvalidSelection(format!("no output device named '{}'", input)))
}

/// Print the numbered device list and read the user's choice
pub fn prompt_output_device<'a, R: BufRead, W: Write>(
    devices: &'a [OutputDeviceInfo],
    mut reader: R,
    mut writer: W,
) -> Result<&'a OutputDeviceInfo, AudioError> {
    if devices.is_empty() {
        return Err(AudioError::DeviceError("No output devices found".to_string()));
    }

    writeln!(writer, "Available Output Devices:")?;
    for device in devices {
        let default_marker = if device.is_default { " (default)" } else { "" };
        writeln!(writer, "{}. {}{}", device.index, device.name, default_marker)?;
    }
    write!(writer, "Enter the number of the desired output device: ")?;
    writer.flush()?;

    let mut line = String::new();
    reader.read_line(&mut line)?;
    select_output_device(devices, &line)
}

/// Stream parameters requested from the output device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Playback buffer length in milliseconds
    pub buffer_ms: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: 192_000,
            channels: 2,
            buffer_ms: 500,
        }
    }
}

impl OutputConfig {
    /// Buffer capacity in samples, rounded down to whole frames
    pub fn capacity_samples(&self) -> usize {
        let channels = self.channels.max(1) as usize;
        let frames = (self.sample_rate as u64 * self.buffer_ms as u64 / 1000).max(1) as usize;
        frames * channels
    }
}

/// One supported output configuration range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigCandidate {
    pub channels: u16,
    pub min_rate: u32,
    pub max_rate: u32,
    pub format: SampleFormat,
}

/// Pick the sample format to open the stream with, preferring native i16
pub fn choose_sample_format(
    candidates: &[ConfigCandidate],
    wanted: &OutputConfig,
) -> Option<SampleFormat> {
    candidates
        .iter()
        .filter(|c| c.channels == wanted.channels)
        .filter(|c| c.min_rate <= wanted.sample_rate && c.max_rate >= wanted.sample_rate)
        .filter_map(|c| {
            let score = match c.format {
                SampleFormat::I16 => 50,
                SampleFormat::F32 => 25,
                SampleFormat::I32 => 20,
                SampleFormat::U16 => 10,
                _ => return None,
            };
            Some((score, c.format))
        })
        .max_by_key(|(score, _)| *score)
        .map(|(_, format)| format)
}

/// Samples shared between writers and the output callback
struct PlaybackBuffer {
    queue: Mutex<VecDeque<i16>>,
    space: Condvar,
    capacity: usize,
    channels: usize,
    stopped: AtomicBool,
    /// Releases blocked writers on shutdown even when the output has stalled
    cancel: CancellationToken,
    primed: AtomicBool,
    underruns: AtomicU64,
}

impl PlaybackBuffer {
    fn new(capacity: usize, channels: usize, cancel: CancellationToken) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            space: Condvar::new(),
            capacity,
            channels,
            stopped: AtomicBool::new(false),
            cancel,
            primed: AtomicBool::new(false),
            underruns: AtomicU64::new(0),
        }
    }

    fn push_blocking(&self, mut samples: &[i16]) -> Result<(), AudioError> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| AudioError::WriteError("playback buffer poisoned".to_string()))?;

        while !samples.is_empty() {
            if self.stopped.load(Ordering::Acquire) || self.cancel.is_cancelled() {
                return Err(AudioError::Stopped);
            }
            let free = self.capacity.saturating_sub(queue.len());
            if free == 0 {
                queue = self
                    .space
                    .wait_timeout(queue, WRITE_WAIT)
                    .map_err(|_| AudioError::WriteError("playback buffer poisoned".to_string()))?
                    .0;
                continue;
            }
            let n = free.min(samples.len());
            queue.extend(&samples[..n]);
            samples = &samples[n..];
            self.primed.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Fill an output buffer with whole frames, padding with silence
    fn fill<T>(&self, data: &mut [T])
    where
        T: Sample + FromSample<i16>,
    {
        let channels = self.channels.max(1);
        let mut underrun = false;

        match self.queue.lock() {
            Ok(mut queue) => {
                let frames_ready = queue.len() / channels;
                for (i, frame) in data.chunks_mut(channels).enumerate() {
                    if i < frames_ready {
                        for slot in frame.iter_mut() {
                            *slot = T::from_sample(queue.pop_front().unwrap_or(0));
                        }
                    } else {
                        frame.fill(T::EQUILIBRIUM);
                        underrun = true;
                    }
                }
            }
            Err(_) => data.fill(T::EQUILIBRIUM),
        }

        self.space.notify_all();
        if underrun && self.primed.load(Ordering::Acquire) {
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }
}

/// Playback counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkStats {
    pub buffered_samples: usize,
    pub capacity_samples: usize,
    pub underruns: u64,
}

enum AudioCommand {
    Stop,
}

/// Blocking stereo output through CPAL
pub struct CpalSink {
    buffer: Arc<PlaybackBuffer>,
    command_sender: Sender<AudioCommand>,
    audio_thread: Option<thread::JoinHandle<()>>,
}

impl CpalSink {
    /// Open `device` (by listed name) with the requested rate and channel count
    ///
    /// Writes blocked on a full buffer give up with [`AudioError::Stopped`] once `cancel` fires.
    pub fn open(
        device: &OutputDeviceInfo,
        config: OutputConfig,
        cancel: CancellationToken,
    ) -> Result<Self, AudioError> {
        log::debug!("AudioSink: Opening {} with {:?}", device.name, config);
        let host = cpal::default_host();

        let cpal_device = host
            .output_devices()?
            .find(|d| d.name().map(|n| n == device.name).unwrap_or(false))
            .ok_or_else(|| {
                AudioError::DeviceError(format!("Output device not found: {}", device.name))
            })?;

        let candidates: Vec<ConfigCandidate> = cpal_device
            .supported_output_configs()?
            .map(|c| ConfigCandidate {
                channels: c.channels(),
                min_rate: c.min_sample_rate().0,
                max_rate: c.max_sample_rate().0,
                format: c.sample_format(),
            })
            .collect();

        let sample_format = choose_sample_format(&candidates, &config).ok_or_else(|| {
            let available: Vec<String> = candidates
                .iter()
                .map(|c| {
                    format!(
                        "{:?} x{} @ {}-{} Hz",
                        c.format, c.channels, c.min_rate, c.max_rate
                    )
                })
                .collect();
            AudioError::UnsupportedConfig(format!(
                "{} channels @ {} Hz not supported by {}. Available: [{}]",
                config.channels,
                config.sample_rate,
                device.name,
                available.join(", ")
            ))
        })?;

        let stream_config = cpal::StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        log::info!(
            "🔊 Output configured: {} channels @ {}Hz (format: {:?})",
            stream_config.channels,
            config.sample_rate,
            sample_format
        );

        let buffer = Arc::new(PlaybackBuffer::new(
            config.capacity_samples(),
            config.channels as usize,
            cancel,
        ));
        let (command_sender, command_receiver) = channel();
        let (ready_sender, ready_receiver) = sync_channel::<Result<(), AudioError>>(1);
        let thread_buffer = Arc::clone(&buffer);

        // The stream lives on its own thread since it is not Send on every host
        let audio_thread = thread::spawn(move || {
            log::debug!("AudioSink: Audio thread started");
            let stream = match sample_format {
                SampleFormat::I16 => {
                    build_stream::<i16>(&cpal_device, &stream_config, thread_buffer)
                }
                SampleFormat::F32 => {
                    build_stream::<f32>(&cpal_device, &stream_config, thread_buffer)
                }
                SampleFormat::I32 => {
                    build_stream::<i32>(&cpal_device, &stream_config, thread_buffer)
                }
                SampleFormat::U16 => {
                    build_stream::<u16>(&cpal_device, &stream_config, thread_buffer)
                }
                other => Err(AudioError::UnsupportedConfig(format!(
                    "sample format {:?}",
                    other
                ))),
            };

            let stream = match stream.and_then(|s| s.play().map(|_| s).map_err(AudioError::from)) {
                Ok(stream) => stream,
                Err(e) => {
                    log::error!("AudioSink: Failed to start audio stream: {}", e);
                    let _ = ready_sender.send(Err(e));
                    return;
                }
            };
            let _ = ready_sender.send(Ok(()));
            log::debug!("AudioSink: Audio stream started successfully");

            while let Ok(command) = command_receiver.recv() {
                match command {
                    AudioCommand::Stop => {
                        log::debug!("AudioSink: Received stop command");
                        break;
                    }
                }
            }

            drop(stream);
            log::debug!("AudioSink: Audio thread exiting");
        });

        let started = ready_receiver.recv().unwrap_or_else(|_| {
            Err(AudioError::DeviceError(
                "audio thread exited before starting".to_string(),
            ))
        });
        if let Err(e) = started {
            let _ = audio_thread.join();
            return Err(e);
        }

        log::debug!("AudioSink: Successfully created CpalSink");
        Ok(Self {
            buffer,
            command_sender,
            audio_thread: Some(audio_thread),
        })
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            buffered_samples: self.buffer.len(),
            capacity_samples: self.buffer.capacity,
            underruns: self.buffer.underruns.load(Ordering::Relaxed),
        }
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    buffer: Arc<PlaybackBuffer>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<i16> + Send + 'static,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| buffer.fill(data),
            |err| log::error!("AudioSink: Stream error: {}", err),
            None,
        )
        .map_err(AudioError::from)
}

impl AudioSink for CpalSink {
    fn write(&self, interleaved: &[i16]) -> Result<(), AudioError> {
        if self.buffer.stopped.load(Ordering::Acquire) {
            log::warn!("AudioSink: Cannot write - sink is stopped");
            return Err(AudioError::Stopped);
        }
        log::trace!(
            "AudioSink: Writing {} samples ({} buffered)",
            interleaved.len(),
            self.buffer.len()
        );
        self.buffer.push_blocking(interleaved)
    }

    fn stop(&self) -> Result<(), AudioError> {
        if self.buffer.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::debug!("AudioSink: Stopping sink");
        self.buffer.space.notify_all();
        self.command_sender
            .send(AudioCommand::Stop)
            .map_err(|e| AudioError::StopError(e.to_string()))
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::debug!("AudioSink: Stop during drop: {}", e);
        }
        if let Some(thread) = self.audio_thread.take() {
            if let Err(e) = thread.join() {
                log::error!("Failed to join audio thread: {:?}", e);
            }
        }
    }
}
