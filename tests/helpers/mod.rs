//! Scripted acquisition device and in-memory sink shared by the integration tests

use dwf_audio_bridge::audio_sink::{AudioError, AudioSink};
use dwf_audio_bridge::daq::{AcquisitionSetup, AnalogInput, DaqError, DaqState, RecordStatus};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// One poll worth of device behaviour
#[derive(Debug, Clone)]
pub struct Step {
    pub state: DaqState,
    pub record: RecordStatus,
    pub left: Vec<i16>,
    pub right: Vec<i16>,
}

impl Step {
    pub fn waiting(state: DaqState) -> Self {
        Self {
            state,
            record: RecordStatus::default(),
            left: Vec::new(),
            right: Vec::new(),
        }
    }

    pub fn data(state: DaqState, left: &[i16], right: &[i16]) -> Self {
        assert_eq!(left.len(), right.len());
        Self {
            state,
            record: RecordStatus {
                available: left.len(),
                lost: 0,
                corrupted: 0,
            },
            left: left.to_vec(),
            right: right.to_vec(),
        }
    }

    pub fn with_loss(mut self, lost: usize, corrupted: usize) -> Self {
        self.record.lost = lost;
        self.record.corrupted = corrupted;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Configure(AcquisitionSetup),
    Start,
    Status,
    StatusRecord,
    Read(i32, usize),
}

/// Replays a fixed script of polls, cancelling the stream once it runs out
pub struct ScriptedDevice {
    steps: VecDeque<Step>,
    current: Option<Step>,
    pub calls: Vec<Call>,
    cancel: CancellationToken,
    pub fail_reads: bool,
}

impl ScriptedDevice {
    pub fn new(steps: Vec<Step>, cancel: CancellationToken) -> Self {
        Self {
            steps: steps.into(),
            current: None,
            calls: Vec::new(),
            cancel,
            fail_reads: false,
        }
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }
}

impl AnalogInput for ScriptedDevice {
    fn configure(&mut self, setup: &AcquisitionSetup) -> Result<(), DaqError> {
        self.calls.push(Call::Configure(setup.clone()));
        Ok(())
    }

    fn start(&mut self) -> Result<(), DaqError> {
        self.calls.push(Call::Start);
        Ok(())
    }

    fn status(&mut self) -> Result<DaqState, DaqError> {
        self.calls.push(Call::Status);
        match self.steps.pop_front() {
            Some(step) => {
                let state = step.state;
                self.current = Some(step);
                Ok(state)
            }
            None => {
                self.cancel.cancel();
                self.current = Some(Step::waiting(DaqState::Done));
                Ok(DaqState::Done)
            }
        }
    }

    fn status_record(&mut self) -> Result<RecordStatus, DaqError> {
        self.calls.push(Call::StatusRecord);
        Ok(self
            .current
            .as_ref()
            .map(|s| s.record)
            .unwrap_or_default())
    }

    fn read_channel(&mut self, channel: i32, buffer: &mut [i16]) -> Result<(), DaqError> {
        self.calls.push(Call::Read(channel, buffer.len()));
        if self.fail_reads {
            return Err(DaqError::Call {
                function: "FDwfAnalogInStatusData16",
                message: "device disconnected".to_string(),
            });
        }
        let step = self.current.as_ref().expect("read before status");
        let source = if channel == 0 { &step.left } else { &step.right };
        buffer.copy_from_slice(&source[..buffer.len()]);
        Ok(())
    }
}

/// Collects everything written to it
#[derive(Default)]
pub struct MemorySink {
    pub samples: Mutex<Vec<i16>>,
    pub writes: Mutex<usize>,
    pub fail: bool,
    /// Fires this token and reports the sink stopped, as a shutdown racing a write would
    pub shutdown: Option<CancellationToken>,
}

impl MemorySink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn shut_down_by(cancel: CancellationToken) -> Self {
        Self {
            shutdown: Some(cancel),
            ..Default::default()
        }
    }

    pub fn samples(&self) -> Vec<i16> {
        self.samples.lock().unwrap().clone()
    }

    pub fn writes(&self) -> usize {
        *self.writes.lock().unwrap()
    }
}

impl AudioSink for MemorySink {
    fn write(&self, interleaved: &[i16]) -> Result<(), AudioError> {
        if self.fail {
            return Err(AudioError::WriteError("output unplugged".to_string()));
        }
        if let Some(cancel) = &self.shutdown {
            cancel.cancel();
            return Err(AudioError::Stopped);
        }
        self.samples.lock().unwrap().extend_from_slice(interleaved);
        *self.writes.lock().unwrap() += 1;
        Ok(())
    }

    fn stop(&self) -> Result<(), AudioError> {
        Ok(())
    }
}
