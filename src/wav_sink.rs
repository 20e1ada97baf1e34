use crate::audio_sink::{AudioError, AudioSink};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Largest data chunk a RIFF header can describe, leaving room for the 44-byte header
const MAX_DATA_BYTES: u64 = u32::MAX as u64 - 44;

struct Recording {
    writer: Option<WavWriter<BufWriter<File>>>,
    data_bytes: u64,
    /// Size limit reached; the file is finalized and further audio is discarded
    full: bool,
}

/// Records the interleaved stream to a 16-bit PCM WAV file
pub struct WavRecorder {
    path: PathBuf,
    channels: usize,
    max_data_bytes: u64,
    recording: Mutex<Recording>,
}

impl WavRecorder {
    pub fn create(path: &Path, sample_rate: u32, channels: u16) -> Result<Self, AudioError> {
        Self::create_with_limit(path, sample_rate, channels, MAX_DATA_BYTES)
    }

    fn create_with_limit(
        path: &Path,
        sample_rate: u32,
        channels: u16,
        max_data_bytes: u64,
    ) -> Result<Self, AudioError> {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(path, spec).map_err(|e| {
            AudioError::RecordError(format!("Failed to create {}: {}", path.display(), e))
        })?;
        log::info!("💾 Recording to {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            channels: channels.max(1) as usize,
            max_data_bytes,
            recording: Mutex::new(Recording {
                writer: Some(writer),
                data_bytes: 0,
                full: false,
            }),
        })
    }
}

impl AudioSink for WavRecorder {
    fn write(&self, interleaved: &[i16]) -> Result<(), AudioError> {
        let mut recording = self
            .recording
            .lock()
            .map_err(|_| AudioError::RecordError("recorder poisoned".to_string()))?;
        if recording.full {
            return Ok(());
        }

        // Whole frames that still fit below the RIFF size limit
        let room = (self.max_data_bytes.saturating_sub(recording.data_bytes) / 2) as usize;
        let fits = interleaved.len().min(room - room % self.channels);
        let chunk = &interleaved[..fits];

        let writer = recording.writer.as_mut().ok_or(AudioError::Stopped)?;
        if !chunk.is_empty() {
            let mut samples = writer.get_i16_writer(chunk.len() as u32);
            for &sample in chunk {
                samples.write_sample(sample);
            }
            samples
                .flush()
                .map_err(|e| AudioError::RecordError(e.to_string()))?;
            recording.data_bytes += chunk.len() as u64 * 2;
        }

        if fits < interleaved.len() {
            recording.full = true;
            if let Some(writer) = recording.writer.take() {
                writer
                    .finalize()
                    .map_err(|e| AudioError::RecordError(e.to_string()))?;
            }
            log::warn!(
                "💾 {} reached the WAV size limit after {} bytes; recording stopped, playback continues",
                self.path.display(),
                recording.data_bytes
            );
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), AudioError> {
        let mut recording = self
            .recording
            .lock()
            .map_err(|_| AudioError::RecordError("recorder poisoned".to_string()))?;
        if let Some(writer) = recording.writer.take() {
            writer
                .finalize()
                .map_err(|e| AudioError::RecordError(e.to_string()))?;
            log::info!("💾 Finished recording {}", self.path.display());
        }
        Ok(())
    }
}

impl Drop for WavRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("Failed to finalize {}: {}", self.path.display(), e);
        }
    }
}

/// Forwards every write to each inner sink in order
pub struct TeeSink {
    sinks: Vec<Box<dyn AudioSink>>,
}

impl TeeSink {
    pub fn new(sinks: Vec<Box<dyn AudioSink>>) -> Self {
        Self { sinks }
    }
}

impl AudioSink for TeeSink {
    fn write(&self, interleaved: &[i16]) -> Result<(), AudioError> {
        for sink in &self.sinks {
            sink.write(interleaved)?;
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), AudioError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.stop() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
