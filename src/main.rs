use anyhow::Context;
use clap::Parser;
use dwf_audio_bridge::{
    audio_sink::{
        list_output_devices, prompt_output_device, select_output_device, AudioError, AudioSink,
        CpalSink, OutputConfig, OutputDeviceInfo,
    },
    config::{secs_to_duration, BridgeConfig, ConfigError},
    daq::{prepare_acquisition, DwfDevice, DwfLibrary},
    streamer::Streamer,
    wav_sink::{TeeSink, WavRecorder},
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "dwf-audio-bridge")]
#[command(about = "Stream two oscilloscope channels from a WaveForms device to a stereo audio output")]
#[command(long_about = "
Opens a WaveForms acquisition device, records channels 1 and 2 continuously and plays them
as the left and right channels of the selected audio output. Settings can also come from
DWF_* environment variables or a .env file; flags take precedence.

EXAMPLES:
  # List audio outputs and attached acquisition devices
  dwf-audio-bridge --list-devices

  # Stream to the second listed output at 48 kHz
  dwf-audio-bridge --output-device 2 --frequency 48000

  # Keep a WAV copy of the stream
  dwf-audio-bridge --output-device \"USB Audio\" --record capture.wav
")]
struct Args {
    /// List audio output and acquisition devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Output device number from the listing or its exact name (prompts when omitted)
    #[arg(long)]
    output_device: Option<String>,

    /// Acquisition device index, -1 for the first available
    #[arg(long, allow_negative_numbers = true)]
    device_index: Option<i32>,

    /// Acquisition and playback rate in Hz
    #[arg(long)]
    frequency: Option<f64>,

    /// Expected signal amplitude in volts; the channel range is five times this
    #[arg(long)]
    amplitude: Option<f64>,

    /// Channel offset in volts
    #[arg(long, allow_negative_numbers = true)]
    offset: Option<f64>,

    /// Seconds to wait for the input offset to stabilize before starting
    #[arg(long)]
    settle_secs: Option<f64>,

    /// Path to the dwf runtime library
    #[arg(long)]
    library: Option<PathBuf>,

    /// Also write the stream to this WAV file
    #[arg(long)]
    record: Option<PathBuf>,

    /// Sleep between polls that returned no samples
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Playback buffer length in milliseconds
    #[arg(long)]
    buffer_ms: Option<u32>,

    /// Read settings from this env file instead of ./.env
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut BridgeConfig) -> Result<(), ConfigError> {
        if let Some(v) = self.device_index {
            config.device_index = v;
        }
        if let Some(v) = self.frequency {
            config.frequency_hz = v;
        }
        if let Some(v) = self.amplitude {
            config.amplitude_volts = v;
        }
        if let Some(v) = self.offset {
            config.offset_volts = v;
        }
        if let Some(v) = self.settle_secs {
            config.settle = secs_to_duration("--settle-secs", v)?;
        }
        if let Some(v) = self.poll_interval_ms {
            config.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = self.buffer_ms {
            config.buffer_ms = v;
        }
        if self.library.is_some() {
            config.library_path = self.library.clone();
        }
        if self.output_device.is_some() {
            config.output_device = self.output_device.clone();
        }
        if self.record.is_some() {
            config.record_path = self.record.clone();
        }
        config.validate()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.env_file {
        Some(path) => BridgeConfig::load_from_file(path)?,
        None => BridgeConfig::load()?,
    };
    args.apply(&mut config)?;
    log::debug!("Configuration: {:?}", config);

    if args.list_devices {
        list_devices(&config)?;
        return Ok(());
    }

    let library = Arc::new(
        DwfLibrary::load(config.library_path.as_deref())
            .context("WaveForms runtime is not installed or could not be loaded")?,
    );
    match library.version() {
        Ok(version) => log::info!("🚀 Using dwf runtime {} ({})", version, library.path().display()),
        Err(e) => log::debug!("Could not read dwf version: {}", e),
    }

    println!("{}", opening_message(config.device_index));
    let mut device = match DwfDevice::open(Arc::clone(&library), config.device_index) {
        Ok(device) => device,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("failed to open device");
            std::process::exit(1);
        }
    };

    let setup = config.acquisition_setup();
    tokio::task::block_in_place(|| prepare_acquisition(&mut device, &setup, config.settle))?;

    let selected = match tokio::task::block_in_place(|| choose_output(&config)) {
        Ok(selected) => selected,
        Err(e) => {
            eprintln!("{}", selection_failure_message(&e));
            device.reset_and_close();
            std::process::exit(1);
        }
    };
    println!("Selected Output Device: {}", selected.name);

    let output = OutputConfig {
        sample_rate: config.sample_rate(),
        channels: 2,
        buffer_ms: config.buffer_ms,
    };
    let cancel = CancellationToken::new();
    let playback = Arc::new(CpalSink::open(&selected, output, cancel.clone())?);
    let sink: Arc<dyn AudioSink> = match &config.record_path {
        Some(path) => {
            let recorder = WavRecorder::create(path, output.sample_rate, output.channels)?;
            let sinks: Vec<Box<dyn AudioSink>> =
                vec![Box::new(Arc::clone(&playback)), Box::new(recorder)];
            Arc::new(TeeSink::new(sinks))
        }
        None => Arc::clone(&playback) as Arc<dyn AudioSink>,
    };

    let streamer = Streamer::new(config.poll_interval);
    let task_cancel = cancel.clone();
    let task_sink = Arc::clone(&sink);
    let mut handle = tokio::task::spawn_blocking(move || {
        let result = streamer.run(&mut device, &*task_sink, &task_cancel);
        device.reset_and_close();
        result
    });

    println!("🎧 Streaming to {}", selected.name);
    println!("   Press Ctrl+C to exit");

    let finished = tokio::select! {
        joined = &mut handle => Some(joined),
        _ = tokio::signal::ctrl_c() => None,
    };
    let joined = match finished {
        Some(joined) => joined,
        None => {
            log::info!("Received Ctrl+C, shutting down...");
            cancel.cancel();
            // Unblock a writer waiting on an output that stopped draining
            if let Err(e) = sink.stop() {
                log::warn!("Failed to stop audio output: {}", e);
            }
            handle.await
        }
    };

    let outcome = joined.context("streaming task panicked");
    if let Err(e) = sink.stop() {
        log::warn!("Failed to stop audio output: {}", e);
    }
    let stats = outcome??;
    stats.log_summary();
    log::info!("🔊 Playback underruns: {}", playback.stats().underruns);

    println!("done");
    Ok(())
}

fn opening_message(device_index: i32) -> String {
    if device_index < 0 {
        "Opening first device".to_string()
    } else {
        format!("Opening device {}", device_index)
    }
}

fn selection_failure_message(error: &anyhow::Error) -> String {
    match error.downcast_ref::<AudioError>() {
        Some(AudioError::InvalidSelection(reason)) => {
            format!("Invalid selection. Exiting. ({})", reason)
        }
        _ => format!("Could not choose an output device: {:#}", error),
    }
}

fn choose_output(config: &BridgeConfig) -> anyhow::Result<OutputDeviceInfo> {
    let devices = list_output_devices()?;
    let selected = match &config.output_device {
        Some(selection) => select_output_device(&devices, selection)?,
        None => prompt_output_device(&devices, io::stdin().lock(), io::stdout())?,
    };
    Ok(selected.clone())
}

fn list_devices(config: &BridgeConfig) -> anyhow::Result<()> {
    println!("🔊 Available Output Devices:");
    println!("============================");
    let outputs = list_output_devices()?;
    if outputs.is_empty() {
        println!("  No output devices found");
    }
    for device in &outputs {
        let default_marker = if device.is_default { " (default)" } else { "" };
        println!(
            "  {}. {}{} - up to {} channels",
            device.index, device.name, default_marker, device.max_channels
        );
    }

    println!("\n🔬 Acquisition Devices:");
    println!("=======================");
    match DwfLibrary::load(config.library_path.as_deref()) {
        Ok(library) => {
            let devices = library.enumerate()?;
            if devices.is_empty() {
                println!("  No acquisition devices found");
            }
            for device in devices {
                let in_use = if device.in_use { " (in use)" } else { "" };
                println!(
                    "  {}. {} [SN {}]{}",
                    device.index, device.name, device.serial, in_use
                );
            }
        }
        Err(e) => println!("  Error loading dwf runtime: {}", e),
    }

    Ok(())
}
