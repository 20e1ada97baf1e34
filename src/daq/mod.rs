//! Acquisition device abstraction
//!
//! The streaming loop talks to hardware through [`AnalogInput`]. The real implementation is
//! [`dwf::DwfDevice`], a binding to the WaveForms `dwf` runtime loaded at startup. Tests drive
//! the loop with scripted devices instead.

pub mod dwf;

pub use dwf::{DaqDeviceInfo, DwfDevice, DwfLibrary};

use std::thread;
use std::time::Duration;
use strum::Display;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Failed to load driver library {path}: {reason}")]
    LibraryLoad { path: String, reason: String },

    #[error("Driver library is missing symbol {symbol}: {reason}")]
    MissingSymbol { symbol: String, reason: String },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("{function} failed: {message}")]
    Call {
        function: &'static str,
        message: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Instrument state reported by a status poll (`DwfState`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DaqState {
    Ready,
    Armed,
    Done,
    /// Also reported as "running" while a record acquisition streams
    Triggered,
    Config,
    Prefill,
    Wait,
    Unknown(u8),
}

impl DaqState {
    /// True while the instrument has not begun delivering samples
    pub fn is_pre_acquisition(self) -> bool {
        matches!(self, DaqState::Config | DaqState::Prefill | DaqState::Armed)
    }
}

impl From<u8> for DaqState {
    fn from(raw: u8) -> Self {
        match raw {
            0 => DaqState::Ready,
            1 => DaqState::Armed,
            2 => DaqState::Done,
            3 => DaqState::Triggered,
            4 => DaqState::Config,
            5 => DaqState::Prefill,
            7 => DaqState::Wait,
            other => DaqState::Unknown(other),
        }
    }
}

/// Analog-in acquisition mode (`ACQMODE`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
#[repr(i32)]
pub enum AcquisitionMode {
    Single = 0,
    ScanShift = 1,
    ScanScreen = 2,
    Record = 3,
    Overs = 4,
    Single1 = 5,
}

/// Counters from a record-mode status poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordStatus {
    pub available: usize,
    pub lost: usize,
    pub corrupted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSetup {
    pub index: i32,
    pub range_volts: f64,
    pub offset_volts: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSetup {
    pub channels: Vec<ChannelSetup>,
    pub frequency_hz: f64,
    /// Negative for an infinite record
    pub record_length_secs: f64,
}

/// Analog-in operations used to configure and poll an acquisition
pub trait AnalogInput {
    /// Apply channel and record settings without starting the acquisition
    fn configure(&mut self, setup: &AcquisitionSetup) -> Result<(), DaqError>;

    /// Start the configured acquisition
    fn start(&mut self) -> Result<(), DaqError>;

    /// Poll the instrument, fetching new data into the driver buffer
    fn status(&mut self) -> Result<DaqState, DaqError>;

    /// Sample counters for the data fetched by the last `status` call
    fn status_record(&mut self) -> Result<RecordStatus, DaqError>;

    /// Copy `buffer.len()` raw samples of `channel` from the last poll
    fn read_channel(&mut self, channel: i32, buffer: &mut [i16]) -> Result<(), DaqError>;
}

/// Configure, wait for the input offset to settle, then start the acquisition
pub fn prepare_acquisition<D: AnalogInput + ?Sized>(
    device: &mut D,
    setup: &AcquisitionSetup,
    settle: Duration,
) -> Result<(), DaqError> {
    if setup.channels.is_empty() {
        return Err(DaqError::InvalidArgument(
            "at least one channel must be enabled".to_string(),
        ));
    }

    device.configure(setup)?;
    log::info!(
        "⚙️  Configured {} channel(s) @ {} Hz in record mode",
        setup.channels.len(),
        setup.frequency_hz
    );

    if !settle.is_zero() {
        log::info!("⏳ Waiting {:.1}s for the offset to stabilize", settle.as_secs_f64());
        thread::sleep(settle);
    }

    log::info!("▶️  Starting oscilloscope");
    device.start()
}
