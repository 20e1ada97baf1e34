pub mod audio_sink;
pub mod config;
pub mod daq;
pub mod error;
pub mod streamer;
pub mod wav_sink;

pub use error::{BridgeError, Result};
