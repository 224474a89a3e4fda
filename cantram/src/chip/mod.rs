//! Contracts for chips on an SPI-like bus.
//!
//! Register maps and electrical timing belong to the chip drivers. This
//! module only fixes what the interface layer needs from them: a burst of
//! analog samples, a diagnostic snapshot of an isolated input chip, and a
//! channel mask for an isolated output chip.
//!
//! Several interfaces usually share one chip (eight digital inputs on one
//! isolated-input chip, one bit each). [`SharedChip`] serializes them
//! through a FIFO-fair async mutex and lets a snapshot taken by one
//! interface serve the others for a short reuse window.

use async_trait::async_trait;
use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::tracing::prelude::*;

/// Chip errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChipError {
    #[error("{model}: no response on {select}")]
    NotResponding {
        model: &'static str,
        select: ChipSelect,
    },

    #[error("{model}: corrupted transfer ({reason})")]
    Corrupted {
        model: &'static str,
        reason: String,
    },

    #[error("{model}: channel {channel} out of range")]
    InvalidChannel { model: &'static str, channel: u8 },
}

/// How a chip is selected on the shared bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipSelect {
    /// Dedicated GPIO line
    Pin(u8),
    /// Bit on an output expander, driven through its provider
    Expander(u8),
}

impl fmt::Display for ChipSelect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChipSelect::Pin(pin) => write!(f, "CS pin {}", pin),
            ChipSelect::Expander(bit) => write!(f, "CS expander bit {}", bit),
        }
    }
}

/// Common part of every SPI chip.
pub trait SpiChip: Send {
    fn select(&self) -> ChipSelect;

    /// Part number, for logs.
    fn model(&self) -> &'static str;
}

/// One burst read of all analog channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurstSample {
    pub channels: Vec<u16>,
    pub resolution_bits: u8,
}

impl BurstSample {
    pub fn channel(&self, index: u8) -> Option<u16> {
        self.channels.get(index as usize).copied()
    }

    /// Largest raw code at this resolution.
    pub fn full_scale(&self) -> u16 {
        ((1u32 << self.resolution_bits.min(16)) - 1) as u16
    }
}

/// Multi-channel ADC read in one burst.
#[async_trait]
pub trait BurstAnalogChip: SpiChip {
    async fn read_burst(&mut self) -> Result<BurstSample, ChipError>;
}

bitflags! {
    /// Chip-wide diagnostic flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DiagFlags: u8 {
        const GLOBAL_ERROR = 1 << 0;
        const INTERNAL_ERROR = 1 << 1;
        const UNDERVOLTAGE = 1 << 2;
        const OVERTEMPERATURE = 1 << 3;

        /// Flags that invalidate every channel of the chip
        const CHIP_FAULT = Self::GLOBAL_ERROR.bits()
            | Self::UNDERVOLTAGE.bits()
            | Self::OVERTEMPERATURE.bits();
    }
}

/// Snapshot of an isolated input chip: levels and fault state together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiagRecord {
    pub inputs: u8,
    pub wire_breaks: u8,
    pub flags: DiagFlags,
}

impl DiagRecord {
    /// Channels covered by one record.
    pub const CHANNELS: u8 = 8;

    /// Level of `channel`, `None` past the last channel.
    pub fn input(&self, channel: u8) -> Option<bool> {
        (channel < Self::CHANNELS).then(|| self.inputs & (1 << channel) != 0)
    }

    /// A wire break on the channel, or a chip-wide fault.
    pub fn is_faulted(&self, channel: u8) -> bool {
        self.flags.intersects(DiagFlags::CHIP_FAULT)
            || (channel < Self::CHANNELS && self.wire_breaks & (1 << channel) != 0)
    }
}

/// Isolated digital input chip with diagnostics.
#[async_trait]
pub trait DiagnosticInputChip: SpiChip {
    async fn read_diagnostics(&mut self) -> Result<DiagRecord, ChipError>;
}

/// Isolated digital output chip driven by a channel mask.
#[async_trait]
pub trait ChannelOutputChip: SpiChip {
    fn channel_count(&self) -> u8;

    async fn write_channels(&mut self, mask: u16) -> Result<(), ChipError>;
}

struct ChipState<C: ?Sized> {
    burst: Option<(Instant, BurstSample)>,
    diagnostics: Option<(Instant, DiagRecord)>,
    outputs: u16,
    chip: Box<C>,
}

pub struct SharedChip<C: ?Sized> {
    state: Arc<Mutex<ChipState<C>>>,
    reuse_window: Duration,
    select: ChipSelect,
    model: &'static str,
}

impl<C: ?Sized> Clone for SharedChip<C> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            reuse_window: self.reuse_window,
            select: self.select,
            model: self.model,
        }
    }
}

fn fresh<T: Clone>(slot: &Option<(Instant, T)>, window: Duration) -> Option<T> {
    slot.as_ref()
        .filter(|(at, _)| at.elapsed() < window)
        .map(|(_, value)| value.clone())
}

impl<C: SpiChip + ?Sized> SharedChip<C> {
    pub fn new(chip: Box<C>, reuse_window: Duration) -> Self {
        let select = chip.select();
        let model = chip.model();
        Self {
            state: Arc::new(Mutex::new(ChipState {
                burst: None,
                diagnostics: None,
                outputs: 0,
                chip,
            })),
            reuse_window,
            select,
            model,
        }
    }

    pub fn select(&self) -> ChipSelect {
        self.select
    }

    pub fn model(&self) -> &'static str {
        self.model
    }

    /// Forget cached snapshots; the next read goes to the chip.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.burst = None;
        state.diagnostics = None;
    }
}

impl<C: BurstAnalogChip + ?Sized> SharedChip<C> {
    /// Latest burst, reused if younger than the reuse window.
    pub async fn burst(&self) -> Result<BurstSample, ChipError> {
        let mut state = self.state.lock().await;
        if let Some(sample) = fresh(&state.burst, self.reuse_window) {
            return Ok(sample);
        }
        let sample = state.chip.read_burst().await?;
        trace!(chip = self.model, channels = sample.channels.len(), "Burst read");
        state.burst = Some((Instant::now(), sample.clone()));
        Ok(sample)
    }
}

impl<C: DiagnosticInputChip + ?Sized> SharedChip<C> {
    /// Latest diagnostic snapshot, reused if younger than the reuse window.
    pub async fn diagnostics(&self) -> Result<DiagRecord, ChipError> {
        let mut state = self.state.lock().await;
        if let Some(record) = fresh(&state.diagnostics, self.reuse_window) {
            return Ok(record);
        }
        let record = state.chip.read_diagnostics().await?;
        if !record.flags.is_empty() || record.wire_breaks != 0 {
            debug!(
                chip = self.model,
                flags = ?record.flags,
                wire_breaks = record.wire_breaks,
                "Diagnostic faults reported"
            );
        }
        state.diagnostics = Some((Instant::now(), record));
        Ok(record)
    }
}

impl<C: ChannelOutputChip + ?Sized> SharedChip<C> {
    /// Drive one output channel. The shadow mask changes only if the chip
    /// accepted the new mask.
    pub async fn set_channel(&self, channel: u8, on: bool) -> Result<(), ChipError> {
        let mut state = self.state.lock().await;
        if channel >= state.chip.channel_count() || channel >= 16 {
            return Err(ChipError::InvalidChannel {
                model: self.model,
                channel,
            });
        }
        let mask = if on {
            state.outputs | (1 << channel)
        } else {
            state.outputs & !(1 << channel)
        };
        state.chip.write_channels(mask).await?;
        state.outputs = mask;
        Ok(())
    }

    /// Last mask accepted by the chip.
    pub async fn outputs(&self) -> u16 {
        self.state.lock().await.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{FakeAnalogChip, FakeInputChip, FakeOutputChip};

    #[test]
    fn chip_fault_covers_every_channel() {
        let record = DiagRecord {
            inputs: 0b0000_0001,
            wire_breaks: 0b0000_0100,
            flags: DiagFlags::empty(),
        };
        assert_eq!(record.input(0), Some(true));
        assert_eq!(record.input(8), None);
        assert!(!record.is_faulted(0));
        assert!(record.is_faulted(2));

        let overheated = DiagRecord {
            flags: DiagFlags::OVERTEMPERATURE,
            ..record
        };
        assert!(overheated.is_faulted(0));

        let interrupt_only = DiagRecord {
            flags: DiagFlags::INTERNAL_ERROR,
            ..record
        };
        assert!(!interrupt_only.is_faulted(0));
    }

    #[test]
    fn full_scale_follows_resolution() {
        let sample = BurstSample {
            channels: vec![0; 4],
            resolution_bits: 12,
        };
        assert_eq!(sample.full_scale(), 4095);
        assert_eq!(sample.channel(4), None);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_is_reused_inside_window() {
        let fake = FakeInputChip::new(ChipSelect::Pin(5));
        let probe = fake.probe();
        let chip: SharedChip<dyn DiagnosticInputChip> =
            SharedChip::new(Box::new(fake), Duration::from_millis(2));

        chip.diagnostics().await.unwrap();
        chip.diagnostics().await.unwrap();
        assert_eq!(probe.reads(), 1);

        tokio::time::advance(Duration::from_millis(3)).await;
        chip.diagnostics().await.unwrap();
        assert_eq!(probe.reads(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_shared() {
        let fake = FakeAnalogChip::new(ChipSelect::Expander(3), 12);
        fake.probe().set_channel(1, 2048);
        let chip: SharedChip<dyn BurstAnalogChip> =
            SharedChip::new(Box::new(fake), Duration::from_millis(2));

        let a = chip.clone();
        let first = a.burst().await.unwrap();
        let second = chip.burst().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.channel(1), Some(2048));
    }

    #[tokio::test]
    async fn rejected_mask_keeps_shadow() {
        let fake = FakeOutputChip::new(ChipSelect::Pin(7), 8);
        let probe = fake.probe();
        let chip: SharedChip<dyn ChannelOutputChip> =
            SharedChip::new(Box::new(fake), Duration::from_millis(2));

        chip.set_channel(3, true).await.unwrap();
        assert_eq!(chip.outputs().await, 0b1000);
        assert_eq!(probe.mask(), 0b1000);

        probe.fail_next_write();
        assert!(chip.set_channel(0, true).await.is_err());
        assert_eq!(chip.outputs().await, 0b1000);

        assert!(matches!(
            chip.set_channel(8, true).await,
            Err(ChipError::InvalidChannel { channel: 8, .. })
        ));
    }
}
