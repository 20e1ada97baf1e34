use crate::audio_sink::AudioError;
use crate::config::ConfigError;
use crate::daq::DaqError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("DAQ error: {0}")]
    Daq(#[from] DaqError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
