//! Logical I/O channels.
//!
//! An [`Interface`] is one channel of a module: a digital or analog input or
//! output, a relay, or a byte pass-through to a bus. It translates reads
//! and writes into calls on exactly one backing: a leased peripheral
//! (directly or through a provider) or a shared SPI chip.
//!
//! Value policy, identical for every kind: read-capable channels return a
//! fresh backing read; write-only channels return the last value
//! successfully written, or [`InterfaceError::NoValue`] before the first
//! write.

use async_trait::async_trait;
use std::fmt;
use strum::{Display, FromRepr};
use thiserror::Error;
use tokio::time::Instant;

use crate::chip::{ChipError, ChipSelect};
use crate::hw_trait::HwError;
use crate::provider::ProviderError;
use crate::resource::{ResourceError, ResourceKind};

pub mod analog;
pub mod bus;
pub mod digital;
pub mod relay;

pub use analog::{AnalogInput, AnalogOutput, AnalogScale};
pub use bus::{CanInterface, I2cInterface, UartInterface};
pub use digital::{DigitalInput, DigitalOutput, InputSource, OutputSink};
pub use relay::Relay;

/// Channel kind, as reported by `DESCRIBE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
pub enum ChannelKind {
    #[strum(to_string = "digital input")]
    DigitalInput = 0,
    #[strum(to_string = "digital output")]
    DigitalOutput = 1,
    #[strum(to_string = "analog input")]
    AnalogInput = 2,
    #[strum(to_string = "analog output")]
    AnalogOutput = 3,
    #[strum(to_string = "relay")]
    Relay = 4,
    #[strum(to_string = "CAN")]
    Can = 5,
    #[strum(to_string = "I2C")]
    I2c = 6,
    #[strum(to_string = "UART")]
    Uart = 7,
}

impl ChannelKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Kinds whose value is sampled from the outside world.
    pub fn is_input(self) -> bool {
        matches!(self, ChannelKind::DigitalInput | ChannelKind::AnalogInput)
    }

    /// Kinds that carry opaque bytes.
    pub fn is_bus(self) -> bool {
        matches!(self, ChannelKind::Can | ChannelKind::I2c | ChannelKind::Uart)
    }
}

/// Physical unit of an analog channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Unit {
    #[strum(to_string = "V")]
    Volt,
    #[strum(to_string = "mA")]
    MilliAmpere,
    #[strum(to_string = "%")]
    Percent,
    #[strum(to_string = "")]
    Raw,
}

/// An analog value with its unit; `clamped` is set when the measured or
/// requested value was outside the valid range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalogValue {
    pub value: f32,
    pub unit: Unit,
    pub clamped: bool,
}

impl AnalogValue {
    pub fn new(value: f32, unit: Unit) -> Self {
        Self {
            value,
            unit,
            clamped: false,
        }
    }
}

/// A channel value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Analog(AnalogValue),
    Bytes(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Analog(a) if a.clamped => write!(f, "{:.3}{} (clamped)", a.value, a.unit),
            Value::Analog(a) => write!(f, "{:.3}{}", a.value, a.unit),
            Value::Bytes(bytes) => write!(f, "[{}]", hex::encode(bytes)),
        }
    }
}

/// What a channel is backed by. Exactly one per interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    Resource(ResourceKind),
    Chip(ChipSelect),
}

/// Interface errors.
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("{kind} channel does not support {operation}")]
    Unsupported {
        kind: ChannelKind,
        operation: &'static str,
    },

    #[error("Channel '{0}' is faulted")]
    Faulted(String),

    #[error("No value written yet")]
    NoValue,

    #[error("{kind} channel cannot take {value}")]
    InvalidValue { kind: ChannelKind, value: String },

    #[error("Malformed transfer: {0}")]
    InvalidTransfer(&'static str),

    #[error(transparent)]
    Chip(#[from] ChipError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Hardware(#[from] HwError),
}

impl InterfaceError {
    pub fn unsupported(kind: ChannelKind, operation: &'static str) -> Self {
        InterfaceError::Unsupported { kind, operation }
    }

    pub fn invalid_value(kind: ChannelKind, value: &Value) -> Self {
        InterfaceError::InvalidValue {
            kind,
            value: value.to_string(),
        }
    }
}

/// One logical I/O channel of a module.
#[async_trait]
pub trait Interface: Send {
    fn kind(&self) -> ChannelKind;

    fn name(&self) -> &str;

    fn backing(&self) -> Backing;

    async fn read(&mut self) -> Result<Value, InterfaceError>;

    async fn write(&mut self, _value: Value) -> Result<(), InterfaceError> {
        Err(InterfaceError::unsupported(self.kind(), "write"))
    }

    /// Byte pass-through for bus kinds. At most `max_in` bytes come back.
    async fn transfer(&mut self, _out: &[u8], _max_in: usize) -> Result<Vec<u8>, InterfaceError> {
        Err(InterfaceError::unsupported(self.kind(), "transfer"))
    }

    /// Value of the last successful access, without touching hardware.
    fn last_value(&self) -> Option<Value>;

    /// Deferred work that is due at or before `now`.
    async fn service(&mut self, _now: Instant) -> Result<(), InterfaceError> {
        Ok(())
    }

    /// When [`service`](Self::service) next has something to do.
    fn next_deadline(&self) -> Option<Instant> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, Some(ChannelKind::DigitalInput); "digital input")]
    #[test_case(4, Some(ChannelKind::Relay); "relay")]
    #[test_case(7, Some(ChannelKind::Uart); "uart")]
    #[test_case(8, None; "out of range")]
    fn kind_codes(code: u8, expected: Option<ChannelKind>) {
        assert_eq!(ChannelKind::from_repr(code), expected);
        if let Some(kind) = expected {
            assert_eq!(kind.code(), code);
        }
    }

    #[test]
    fn values_render_for_logs() {
        let mut reading = AnalogValue::new(10.0, Unit::Volt);
        assert_eq!(Value::Analog(reading).to_string(), "10.000V");
        reading.clamped = true;
        assert_eq!(Value::Analog(reading).to_string(), "10.000V (clamped)");
        assert_eq!(Value::Bytes(vec![0xbe, 0xef]).to_string(), "[beef]");
    }
}
