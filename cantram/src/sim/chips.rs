//! Fake SPI chips.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::chip::{
    BurstAnalogChip, BurstSample, ChannelOutputChip, ChipError, ChipSelect, DiagFlags,
    DiagRecord, DiagnosticInputChip, SpiChip,
};

const ANALOG_CHANNELS: usize = 8;

#[derive(Default)]
struct InputState {
    record: DiagRecord,
    reads: usize,
    silent: bool,
}

/// Isolated eight-channel input chip.
pub struct FakeInputChip {
    select: ChipSelect,
    state: Arc<Mutex<InputState>>,
}

impl FakeInputChip {
    pub fn new(select: ChipSelect) -> Self {
        Self {
            select,
            state: Arc::new(Mutex::new(InputState::default())),
        }
    }

    pub fn probe(&self) -> InputChipProbe {
        InputChipProbe {
            state: self.state.clone(),
        }
    }
}

impl SpiChip for FakeInputChip {
    fn select(&self) -> ChipSelect {
        self.select
    }

    fn model(&self) -> &'static str {
        "fake-di8"
    }
}

#[async_trait]
impl DiagnosticInputChip for FakeInputChip {
    async fn read_diagnostics(&mut self) -> Result<DiagRecord, ChipError> {
        let mut state = self.state.lock();
        if state.silent {
            return Err(ChipError::NotResponding {
                model: self.model(),
                select: self.select,
            });
        }
        state.reads += 1;
        Ok(state.record)
    }
}

/// Handle on a [`FakeInputChip`]'s inputs and diagnostics.
#[derive(Clone)]
pub struct InputChipProbe {
    state: Arc<Mutex<InputState>>,
}

impl InputChipProbe {
    pub fn set_inputs(&self, inputs: u8) {
        self.state.lock().record.inputs = inputs;
    }

    pub fn set_wire_breaks(&self, wire_breaks: u8) {
        self.state.lock().record.wire_breaks = wire_breaks;
    }

    pub fn set_flags(&self, flags: DiagFlags) {
        self.state.lock().record.flags = flags;
    }

    /// Stop answering on the bus.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Diagnostic reads served so far.
    pub fn reads(&self) -> usize {
        self.state.lock().reads
    }
}

struct AnalogState {
    codes: [u16; ANALOG_CHANNELS],
}

/// Eight-channel burst ADC.
pub struct FakeAnalogChip {
    select: ChipSelect,
    resolution_bits: u8,
    state: Arc<Mutex<AnalogState>>,
}

impl FakeAnalogChip {
    pub fn new(select: ChipSelect, resolution_bits: u8) -> Self {
        Self {
            select,
            resolution_bits,
            state: Arc::new(Mutex::new(AnalogState {
                codes: [0; ANALOG_CHANNELS],
            })),
        }
    }

    pub fn probe(&self) -> AnalogChipProbe {
        AnalogChipProbe {
            state: self.state.clone(),
        }
    }
}

impl SpiChip for FakeAnalogChip {
    fn select(&self) -> ChipSelect {
        self.select
    }

    fn model(&self) -> &'static str {
        "fake-adc8"
    }
}

#[async_trait]
impl BurstAnalogChip for FakeAnalogChip {
    async fn read_burst(&mut self) -> Result<BurstSample, ChipError> {
        let full_scale = ((1u32 << self.resolution_bits.min(16)) - 1) as u16;
        let state = self.state.lock();
        Ok(BurstSample {
            channels: state.codes.iter().map(|c| (*c).min(full_scale)).collect(),
            resolution_bits: self.resolution_bits,
        })
    }
}

/// Handle on a [`FakeAnalogChip`]'s input codes.
#[derive(Clone)]
pub struct AnalogChipProbe {
    state: Arc<Mutex<AnalogState>>,
}

impl AnalogChipProbe {
    /// Raw code the channel will read. Out-of-range channels are ignored.
    pub fn set_channel(&self, channel: usize, code: u16) {
        if let Some(slot) = self.state.lock().codes.get_mut(channel) {
            *slot = code;
        }
    }
}

#[derive(Default)]
struct OutputState {
    mask: u16,
    writes: usize,
    attempts: usize,
    fail_next: bool,
    failing: bool,
}

/// Isolated output chip.
pub struct FakeOutputChip {
    select: ChipSelect,
    channels: u8,
    state: Arc<Mutex<OutputState>>,
}

impl FakeOutputChip {
    pub fn new(select: ChipSelect, channels: u8) -> Self {
        Self {
            select,
            channels,
            state: Arc::new(Mutex::new(OutputState::default())),
        }
    }

    pub fn probe(&self) -> OutputChipProbe {
        OutputChipProbe {
            state: self.state.clone(),
        }
    }
}

impl SpiChip for FakeOutputChip {
    fn select(&self) -> ChipSelect {
        self.select
    }

    fn model(&self) -> &'static str {
        "fake-do"
    }
}

#[async_trait]
impl ChannelOutputChip for FakeOutputChip {
    fn channel_count(&self) -> u8 {
        self.channels
    }

    async fn write_channels(&mut self, mask: u16) -> Result<(), ChipError> {
        let mut state = self.state.lock();
        state.attempts += 1;
        if std::mem::take(&mut state.fail_next) || state.failing {
            return Err(ChipError::Corrupted {
                model: self.model(),
                reason: "readback mismatch".to_string(),
            });
        }
        state.mask = mask;
        state.writes += 1;
        Ok(())
    }
}

/// Handle on a [`FakeOutputChip`]'s driven mask.
#[derive(Clone)]
pub struct OutputChipProbe {
    state: Arc<Mutex<OutputState>>,
}

impl OutputChipProbe {
    pub fn mask(&self) -> u16 {
        self.state.lock().mask
    }

    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        self.state.lock().writes
    }

    /// Writes tried so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    pub fn fail_next_write(&self) {
        self.state.lock().fail_next = true;
    }

    /// Fail every write until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }
}
