//! Analog inputs (burst ADC chip) and analog outputs (PWM provider).

use async_trait::async_trait;

use super::{AnalogValue, Backing, ChannelKind, Interface, InterfaceError, Unit, Value};
use crate::chip::{BurstAnalogChip, ChipError, SharedChip};
use crate::provider::{OutputDefinition, ProviderError};
use crate::tracing::prelude::*;

/// Linear mapping between raw codes and a physical value, with the range
/// in which the value is valid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalogScale {
    /// Physical value at code zero
    pub offset: f32,
    /// Physical value added at full scale
    pub span: f32,
    pub min: f32,
    pub max: f32,
    pub unit: Unit,
}

impl AnalogScale {
    /// `0..=full_scale_value` over the whole code range, all of it valid.
    pub fn linear(full_scale_value: f32, unit: Unit) -> Self {
        Self {
            offset: 0.0,
            span: full_scale_value,
            min: 0.0,
            max: full_scale_value,
            unit,
        }
    }

    /// Restrict the valid range.
    pub fn with_range(mut self, min: f32, max: f32) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Clamp into the valid range. Non-finite values land on `min`.
    pub fn clamp(&self, value: f32) -> AnalogValue {
        let clamped_value = if value.is_nan() {
            self.min
        } else {
            value.clamp(self.min, self.max)
        };
        AnalogValue {
            value: clamped_value,
            unit: self.unit,
            clamped: clamped_value != value,
        }
    }

    fn from_code(&self, code: u16, full_scale: u16) -> AnalogValue {
        let ratio = if full_scale == 0 {
            0.0
        } else {
            code.min(full_scale) as f32 / full_scale as f32
        };
        let mut reading = self.clamp(self.offset + ratio * self.span);
        // A saturated converter cannot tell how far out of range the input is.
        reading.clamped |= code >= full_scale;
        reading
    }

    /// Inverse of [`from_code`](Self::from_code); `value` is already
    /// clamped into the valid range.
    fn to_code(&self, value: f32, full_scale: u16) -> u16 {
        if self.span == 0.0 {
            return 0;
        }
        let ratio = ((value - self.offset) / self.span).clamp(0.0, 1.0);
        (ratio * full_scale as f32).round() as u16
    }
}

/// Analog input on one channel of a burst ADC chip.
pub struct AnalogInput {
    name: String,
    chip: SharedChip<dyn BurstAnalogChip>,
    channel: u8,
    scale: AnalogScale,
    cached: Option<AnalogValue>,
}

impl AnalogInput {
    pub fn new(
        name: impl Into<String>,
        chip: SharedChip<dyn BurstAnalogChip>,
        channel: u8,
        scale: AnalogScale,
    ) -> Self {
        Self {
            name: name.into(),
            chip,
            channel,
            scale,
            cached: None,
        }
    }

    pub fn scale(&self) -> &AnalogScale {
        &self.scale
    }
}

#[async_trait]
impl Interface for AnalogInput {
    fn kind(&self) -> ChannelKind {
        ChannelKind::AnalogInput
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn backing(&self) -> Backing {
        Backing::Chip(self.chip.select())
    }

    async fn read(&mut self) -> Result<Value, InterfaceError> {
        let sample = match self.chip.burst().await {
            Ok(sample) => sample,
            Err(e) => {
                self.cached = None;
                return Err(e.into());
            }
        };
        let code = sample.channel(self.channel).ok_or(ChipError::InvalidChannel {
            model: self.chip.model(),
            channel: self.channel,
        })?;
        let reading = self.scale.from_code(code, sample.full_scale());
        if reading.clamped {
            debug!(channel = %self.name, code, value = reading.value, "Analog input out of range");
        }
        self.cached = Some(reading);
        Ok(Value::Analog(reading))
    }

    fn last_value(&self) -> Option<Value> {
        self.cached.map(Value::Analog)
    }
}

/// Analog output as PWM duty on a provider line.
pub struct AnalogOutput {
    name: String,
    line: OutputDefinition,
    scale: AnalogScale,
    written: Option<AnalogValue>,
}

impl AnalogOutput {
    /// Fails unless the line is PWM capable.
    pub fn new(
        name: impl Into<String>,
        line: OutputDefinition,
        scale: AnalogScale,
    ) -> Result<Self, ProviderError> {
        line.pwm()?;
        Ok(Self {
            name: name.into(),
            line,
            scale,
            written: None,
        })
    }
}

#[async_trait]
impl Interface for AnalogOutput {
    fn kind(&self) -> ChannelKind {
        ChannelKind::AnalogOutput
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn backing(&self) -> Backing {
        Backing::Resource(self.line.provider.resource_kind())
    }

    async fn read(&mut self) -> Result<Value, InterfaceError> {
        self.written.map(Value::Analog).ok_or(InterfaceError::NoValue)
    }

    async fn write(&mut self, value: Value) -> Result<(), InterfaceError> {
        let Value::Analog(requested) = value else {
            return Err(InterfaceError::invalid_value(self.kind(), &value));
        };
        let target = self.scale.clamp(requested.value);
        if target.clamped {
            warn!(channel = %self.name, requested = requested.value, applied = target.value, "Analog output clamped");
        }
        let pwm = self.line.pwm()?;
        let full_scale = ((1u32 << pwm.resolution_bits()) - 1) as u16;
        let duty = self.scale.to_code(target.value, full_scale);
        pwm.set_pwm(self.line.line, duty).await?;
        self.written = Some(target);
        debug!(channel = %self.name, value = target.value, duty, "Analog output written");
        Ok(())
    }

    fn last_value(&self) -> Option<Value> {
        self.written.map(Value::Analog)
    }
}
