//! Digital inputs and outputs.

use async_trait::async_trait;

use super::{Backing, ChannelKind, Interface, InterfaceError, Value};
use crate::chip::{ChannelOutputChip, ChipError, DiagRecord, DiagnosticInputChip, SharedChip};
use crate::provider::OutputDefinition;
use crate::tracing::prelude::*;

/// Where a digital input level comes from.
pub enum InputSource {
    /// One bit of an isolated input chip, with diagnostics
    Chip(SharedChip<dyn DiagnosticInputChip>, u8),
    /// A provider line configured as input
    Line(OutputDefinition),
}

impl InputSource {
    fn backing(&self) -> Backing {
        match self {
            InputSource::Chip(chip, _) => Backing::Chip(chip.select()),
            InputSource::Line(def) => Backing::Resource(def.provider.resource_kind()),
        }
    }
}

/// Where a digital output level goes.
pub enum OutputSink {
    /// One channel of an isolated output chip
    Chip(SharedChip<dyn ChannelOutputChip>, u8),
    /// A provider line
    Line(OutputDefinition),
}

impl OutputSink {
    pub(crate) fn backing(&self) -> Backing {
        match self {
            OutputSink::Chip(chip, _) => Backing::Chip(chip.select()),
            OutputSink::Line(def) => Backing::Resource(def.provider.resource_kind()),
        }
    }

    pub(crate) async fn set(&self, state: bool) -> Result<(), InterfaceError> {
        match self {
            OutputSink::Chip(chip, channel) => chip.set_channel(*channel, state).await?,
            OutputSink::Line(def) => def.set(state).await?,
        }
        Ok(())
    }
}

/// Digital input channel.
pub struct DigitalInput {
    name: String,
    source: InputSource,
    cached: Option<bool>,
}

impl DigitalInput {
    pub fn new(name: impl Into<String>, source: InputSource) -> Self {
        Self {
            name: name.into(),
            source,
            cached: None,
        }
    }
}

#[async_trait]
impl Interface for DigitalInput {
    fn kind(&self) -> ChannelKind {
        ChannelKind::DigitalInput
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn backing(&self) -> Backing {
        self.source.backing()
    }

    async fn read(&mut self) -> Result<Value, InterfaceError> {
        let level = match &self.source {
            InputSource::Chip(chip, channel) => {
                let invalid = ChipError::InvalidChannel {
                    model: chip.model(),
                    channel: *channel,
                };
                if *channel >= DiagRecord::CHANNELS {
                    return Err(invalid.into());
                }
                let record = match chip.diagnostics().await {
                    Ok(record) => record,
                    Err(e) => {
                        self.cached = None;
                        return Err(e.into());
                    }
                };
                if record.is_faulted(*channel) {
                    // The diagnostic is authoritative; never report the stale level.
                    self.cached = None;
                    warn!(channel = %self.name, flags = ?record.flags, "Digital input faulted");
                    return Err(InterfaceError::Faulted(self.name.clone()));
                }
                record.input(*channel).ok_or(invalid)?
            }
            InputSource::Line(def) => match def.get().await {
                Ok(level) => level,
                Err(e) => {
                    self.cached = None;
                    return Err(e.into());
                }
            },
        };
        self.cached = Some(level);
        Ok(Value::Bool(level))
    }

    fn last_value(&self) -> Option<Value> {
        self.cached.map(Value::Bool)
    }
}

/// Digital output channel.
pub struct DigitalOutput {
    name: String,
    sink: OutputSink,
    written: Option<bool>,
}

impl DigitalOutput {
    pub fn new(name: impl Into<String>, sink: OutputSink) -> Self {
        Self {
            name: name.into(),
            sink,
            written: None,
        }
    }
}

#[async_trait]
impl Interface for DigitalOutput {
    fn kind(&self) -> ChannelKind {
        ChannelKind::DigitalOutput
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn backing(&self) -> Backing {
        self.sink.backing()
    }

    async fn read(&mut self) -> Result<Value, InterfaceError> {
        self.written.map(Value::Bool).ok_or(InterfaceError::NoValue)
    }

    async fn write(&mut self, value: Value) -> Result<(), InterfaceError> {
        let Value::Bool(state) = value else {
            return Err(InterfaceError::invalid_value(self.kind(), &value));
        };
        self.sink.set(state).await?;
        self.written = Some(state);
        debug!(channel = %self.name, state, "Digital output written");
        Ok(())
    }

    fn last_value(&self) -> Option<Value> {
        self.written.map(Value::Bool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::{ChipSelect, DiagFlags};
    use crate::sim::{FakeInputChip, FakeOutputChip};
    use std::time::Duration;

    fn input_chip() -> (SharedChip<dyn DiagnosticInputChip>, crate::sim::InputChipProbe) {
        let fake = FakeInputChip::new(ChipSelect::Pin(4));
        let probe = fake.probe();
        (SharedChip::new(Box::new(fake), Duration::ZERO), probe)
    }

    #[tokio::test]
    async fn reads_the_chip_bit() {
        let (chip, probe) = input_chip();
        probe.set_inputs(0b0000_0100);
        let mut input = DigitalInput::new("DI2", InputSource::Chip(chip, 2));

        assert_eq!(input.last_value(), None);
        assert_eq!(input.read().await.unwrap(), Value::Bool(true));
        assert_eq!(input.last_value(), Some(Value::Bool(true)));
        assert_eq!(input.backing(), Backing::Chip(ChipSelect::Pin(4)));
    }

    #[tokio::test]
    async fn channel_past_the_chip_is_an_error() {
        let (chip, probe) = input_chip();
        probe.set_inputs(0xff);
        let mut input = DigitalInput::new("DI9", InputSource::Chip(chip, 9));
        assert!(matches!(
            input.read().await,
            Err(InterfaceError::Chip(ChipError::InvalidChannel { channel: 9, .. }))
        ));
        assert_eq!(input.last_value(), None);
        assert_eq!(probe.reads(), 0);
    }

    #[tokio::test]
    async fn faulted_channel_never_returns_stale_level() {
        let (chip, probe) = input_chip();
        probe.set_inputs(0b0000_0100);
        let mut input = DigitalInput::new("DI2", InputSource::Chip(chip, 2));
        input.read().await.unwrap();

        probe.set_wire_breaks(0b0000_0100);
        assert!(matches!(input.read().await, Err(InterfaceError::Faulted(_))));
        assert_eq!(input.last_value(), None);

        probe.set_wire_breaks(0);
        probe.set_flags(DiagFlags::UNDERVOLTAGE);
        assert!(matches!(input.read().await, Err(InterfaceError::Faulted(_))));

        probe.set_flags(DiagFlags::empty());
        assert_eq!(input.read().await.unwrap(), Value::Bool(true));
    }

    #[tokio::test]
    async fn output_reports_no_value_before_first_write() {
        let fake = FakeOutputChip::new(ChipSelect::Pin(9), 8);
        let probe = fake.probe();
        let chip: SharedChip<dyn ChannelOutputChip> =
            SharedChip::new(Box::new(fake), Duration::ZERO);
        let mut output = DigitalOutput::new("DO1", OutputSink::Chip(chip, 1));

        assert!(matches!(output.read().await, Err(InterfaceError::NoValue)));
        output.write(Value::Bool(true)).await.unwrap();
        assert_eq!(output.read().await.unwrap(), Value::Bool(true));
        assert_eq!(probe.mask(), 0b10);

        assert!(matches!(
            output.write(Value::Bytes(vec![1])).await,
            Err(InterfaceError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn failed_write_keeps_previous_value() {
        let fake = FakeOutputChip::new(ChipSelect::Pin(9), 8);
        let probe = fake.probe();
        let chip: SharedChip<dyn ChannelOutputChip> =
            SharedChip::new(Box::new(fake), Duration::ZERO);
        let mut output = DigitalOutput::new("DO0", OutputSink::Chip(chip, 0));

        output.write(Value::Bool(true)).await.unwrap();
        probe.fail_next_write();
        assert!(output.write(Value::Bool(false)).await.is_err());
        assert_eq!(output.last_value(), Some(Value::Bool(true)));
    }
}
