//! Hardware abstraction layer traits.
//!
//! This module defines the peripheral traits (CAN, I2C, PWM, UART) that
//! platform drivers implement. Everything above this layer reaches the
//! hardware only through these traits, so the same module logic runs on a
//! microcontroller port, on a Linux host, or against the simulated
//! peripherals in [`crate::sim`].
//!
//! All operations are async and must complete within a bounded time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors reported by peripheral drivers.
#[derive(Error, Debug)]
pub enum HwError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device did not acknowledge (I2C NAK, CAN no-ACK)
    #[error("No acknowledge from device 0x{0:02x}")]
    Nack(u16),

    /// Bus-level failure (bus-off, arbitration, framing)
    #[error("Bus error: {0}")]
    Bus(String),

    /// Peripheral used before it was configured
    #[error("Peripheral not configured")]
    NotConfigured,

    /// The other end of a simulated or tunneled link is gone
    #[error("Peripheral disconnected")]
    Disconnected,
}

pub type HwResult<T> = std::result::Result<T, HwError>;

/// Classic CAN bitrates supported by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bitrate {
    Br125k,
    Br250k,
    #[default]
    Br500k,
    Br1m,
}

impl Bitrate {
    pub fn bits_per_second(self) -> u32 {
        match self {
            Bitrate::Br125k => 125_000,
            Bitrate::Br250k => 250_000,
            Bitrate::Br500k => 500_000,
            Bitrate::Br1m => 1_000_000,
        }
    }
}

/// Maximum payload of a classic CAN frame.
pub const CAN_MAX_DLC: usize = 8;

/// A raw classic CAN frame as delivered by the controller.
#[derive(Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    extended: bool,
    remote: bool,
    data: [u8; CAN_MAX_DLC],
    len: u8,
    error: bool,
}

impl CanFrame {
    /// Build a standard-id data frame. Returns `None` if the id does not
    /// fit in 11 bits or the payload exceeds 8 bytes.
    pub fn new(id: u16, payload: &[u8]) -> Option<Self> {
        if id > 0x7ff || payload.len() > CAN_MAX_DLC {
            return None;
        }
        let mut data = [0u8; CAN_MAX_DLC];
        data[..payload.len()].copy_from_slice(payload);
        Some(Self {
            id: id as u32,
            extended: false,
            remote: false,
            data,
            len: payload.len() as u8,
            error: false,
        })
    }

    /// Standard-id data frame from parts already known to be in range;
    /// excess id bits and payload bytes are dropped.
    pub(crate) fn standard(id: u16, payload: &[u8]) -> Self {
        let len = payload.len().min(CAN_MAX_DLC);
        let mut data = [0u8; CAN_MAX_DLC];
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            id: (id & 0x7ff) as u32,
            extended: false,
            remote: false,
            data,
            len: len as u8,
            error: false,
        }
    }

    /// Build an extended-id (29-bit) data frame.
    pub fn new_extended(id: u32, payload: &[u8]) -> Option<Self> {
        if id > 0x1fff_ffff || payload.len() > CAN_MAX_DLC {
            return None;
        }
        let mut data = [0u8; CAN_MAX_DLC];
        data[..payload.len()].copy_from_slice(payload);
        Some(Self {
            id,
            extended: true,
            remote: false,
            data,
            len: payload.len() as u8,
            error: false,
        })
    }

    /// Build a remote-transmission-request frame.
    pub fn new_remote(id: u16, dlc: u8) -> Option<Self> {
        if id > 0x7ff || dlc as usize > CAN_MAX_DLC {
            return None;
        }
        Some(Self {
            id: id as u32,
            extended: false,
            remote: true,
            data: [0u8; CAN_MAX_DLC],
            len: dlc,
            error: false,
        })
    }

    /// Mark the frame as flagged by the transport (error frame, overrun).
    pub fn with_error(mut self) -> Self {
        self.error = true;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Whether the transport flagged this frame as bad.
    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CanFrame[{:03x}{}{}{}] {}",
            self.id,
            if self.extended { " ext" } else { "" },
            if self.remote { " rtr" } else { "" },
            if self.error { " err" } else { "" },
            hex::encode(self.data())
        )
    }
}

/// CAN controller.
#[async_trait]
pub trait CanBus: Send {
    /// Apply the bitrate and start the controller.
    async fn configure(&mut self, bitrate: Bitrate) -> HwResult<()>;

    /// Queue one frame for transmission.
    async fn transmit(&mut self, frame: &CanFrame) -> HwResult<()>;

    /// Wait for the next received frame.
    ///
    /// Must be cancel-safe: the service loop races it against other
    /// events and drops the future when another branch wins.
    async fn receive(&mut self) -> HwResult<CanFrame>;
}

/// I2C controller.
#[async_trait]
pub trait I2c: Send {
    async fn write(&mut self, address: u8, bytes: &[u8]) -> HwResult<()>;

    async fn read(&mut self, address: u8, buffer: &mut [u8]) -> HwResult<()>;

    async fn write_read(&mut self, address: u8, bytes: &[u8], buffer: &mut [u8])
        -> HwResult<()>;
}

/// PWM generator with independent channels.
#[async_trait]
pub trait Pwm: Send {
    async fn configure_channel(
        &mut self,
        channel: u8,
        frequency_hz: u32,
        resolution_bits: u8,
    ) -> HwResult<()>;

    /// Set the duty cycle in units of the channel resolution.
    async fn set_duty(&mut self, channel: u8, duty: u16) -> HwResult<()>;
}

/// UART parity setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// UART line settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UartSettings {
    pub baudrate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl Default for UartSettings {
    // 9600 8N1
    fn default() -> Self {
        Self {
            baudrate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

/// UART.
#[async_trait]
pub trait Uart: Send {
    async fn configure(&mut self, settings: UartSettings) -> HwResult<()>;

    async fn send(&mut self, bytes: &[u8]) -> HwResult<()>;

    /// Copy whatever has been received so far into `buffer` without
    /// waiting. Returns the number of bytes copied, zero if none.
    async fn receive(&mut self, buffer: &mut [u8]) -> HwResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_frame_limits() {
        assert!(CanFrame::new(0x7ff, &[0; 8]).is_some());
        assert!(CanFrame::new(0x800, &[]).is_none());
        assert!(CanFrame::new(0x100, &[0; 9]).is_none());
    }

    #[test]
    fn data_is_trimmed_to_length() {
        let frame = CanFrame::new(0x123, &[1, 2, 3]).unwrap();
        assert_eq!(frame.data(), &[1, 2, 3]);
        assert!(!frame.is_extended());
        assert!(!frame.is_error());
    }

    #[test]
    fn debug_shows_flags_and_hex() {
        let frame = CanFrame::new(0x0a5, &[0xde, 0xad]).unwrap().with_error();
        assert_eq!(format!("{:?}", frame), "CanFrame[0a5 err] dead");
    }

    #[test]
    fn bitrate_values() {
        assert_eq!(Bitrate::default().bits_per_second(), 500_000);
        assert_eq!(Bitrate::Br125k.bits_per_second(), 125_000);
    }
}
