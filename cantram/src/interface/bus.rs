//! Byte pass-through channels: CAN, I2C and UART.
//!
//! Transfer layouts (what travels in the data bytes of a `TRANSFER`):
//!
//! - CAN: out `[id_hi, id_lo, payload..]`, 11-bit id; nothing comes back.
//!   A read returns the next received frame in the same layout.
//! - I2C: out `[device, read_len, bytes..]`; returns `read_len` bytes.
//! - UART: out is sent as is; returns whatever has arrived since.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{Backing, ChannelKind, Interface, InterfaceError, Value};
use crate::hw_trait::{Bitrate, CanFrame, UartSettings};
use crate::provider::UartProvider;
use crate::resource::{Lease, ResourceKind, ResourceTable};
use crate::tracing::prelude::*;

const RX_BUFFER: usize = 64;

/// A second CAN controller exposed as a channel.
pub struct CanInterface {
    name: String,
    resources: Arc<ResourceTable>,
    lease: Lease,
    receive_window: Duration,
    last: Option<Vec<u8>>,
}

impl CanInterface {
    pub fn new(
        name: impl Into<String>,
        resources: Arc<ResourceTable>,
        lease: Lease,
        receive_window: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            resources,
            lease,
            receive_window,
            last: None,
        }
    }

    pub async fn configure(&self, bitrate: Bitrate) -> Result<(), InterfaceError> {
        let mut guard = self.resources.lock(&self.lease).await?;
        guard.as_can()?.configure(bitrate).await?;
        info!(channel = %self.name, bitrate = bitrate.bits_per_second(), "CAN channel configured");
        Ok(())
    }
}

#[async_trait]
impl Interface for CanInterface {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Can
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn backing(&self) -> Backing {
        Backing::Resource(ResourceKind::Can)
    }

    /// Next frame received within the receive window.
    async fn read(&mut self) -> Result<Value, InterfaceError> {
        let mut guard = self.resources.lock(&self.lease).await?;
        let can = guard.as_can()?;
        let frame = match tokio::time::timeout(self.receive_window, can.receive()).await {
            Ok(frame) => frame?,
            Err(_) => return Err(InterfaceError::NoValue),
        };
        let id = frame.id() as u16;
        let mut bytes = id.to_be_bytes().to_vec();
        bytes.extend_from_slice(frame.data());
        self.last = Some(bytes.clone());
        Ok(Value::Bytes(bytes))
    }

    async fn write(&mut self, value: Value) -> Result<(), InterfaceError> {
        let Value::Bytes(bytes) = value else {
            return Err(InterfaceError::invalid_value(self.kind(), &value));
        };
        self.transfer(&bytes, 0).await.map(|_| ())
    }

    async fn transfer(&mut self, out: &[u8], _max_in: usize) -> Result<Vec<u8>, InterfaceError> {
        let [hi, lo, payload @ ..] = out else {
            return Err(InterfaceError::InvalidTransfer("CAN transfer needs an identifier"));
        };
        let id = u16::from_be_bytes([*hi, *lo]);
        let frame = CanFrame::new(id, payload)
            .ok_or(InterfaceError::InvalidTransfer("CAN identifier exceeds 11 bits"))?;
        let mut guard = self.resources.lock(&self.lease).await?;
        guard.as_can()?.transmit(&frame).await?;
        trace!(channel = %self.name, ?frame, "CAN frame forwarded");
        Ok(Vec::new())
    }

    fn last_value(&self) -> Option<Value> {
        self.last.clone().map(Value::Bytes)
    }
}

/// I2C bus exposed as a channel.
pub struct I2cInterface {
    name: String,
    resources: Arc<ResourceTable>,
    lease: Lease,
    last: Option<Vec<u8>>,
}

impl I2cInterface {
    pub fn new(name: impl Into<String>, resources: Arc<ResourceTable>, lease: Lease) -> Self {
        Self {
            name: name.into(),
            resources,
            lease,
            last: None,
        }
    }
}

#[async_trait]
impl Interface for I2cInterface {
    fn kind(&self) -> ChannelKind {
        ChannelKind::I2c
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn backing(&self) -> Backing {
        Backing::Resource(ResourceKind::I2c)
    }

    async fn read(&mut self) -> Result<Value, InterfaceError> {
        self.last.clone().map(Value::Bytes).ok_or(InterfaceError::NoValue)
    }

    async fn transfer(&mut self, out: &[u8], max_in: usize) -> Result<Vec<u8>, InterfaceError> {
        let [device, read_len, bytes @ ..] = out else {
            return Err(InterfaceError::InvalidTransfer("I2C transfer needs device and length"));
        };
        let read_len = *read_len as usize;
        if read_len > max_in {
            return Err(InterfaceError::InvalidTransfer("I2C read longer than the response"));
        }
        let mut buffer = vec![0u8; read_len];
        let mut guard = self.resources.lock(&self.lease).await?;
        let i2c = guard.as_i2c()?;
        match (bytes.is_empty(), read_len) {
            (true, 0) => {
                return Err(InterfaceError::InvalidTransfer("empty I2C transfer"));
            }
            (false, 0) => i2c.write(*device, bytes).await?,
            (true, _) => i2c.read(*device, &mut buffer).await?,
            (false, _) => i2c.write_read(*device, bytes, &mut buffer).await?,
        }
        trace!(channel = %self.name, device, out = %hex::encode(bytes), read = %hex::encode(&buffer), "I2C transfer");
        self.last = Some(buffer.clone());
        Ok(buffer)
    }

    fn last_value(&self) -> Option<Value> {
        self.last.clone().map(Value::Bytes)
    }
}

/// UART exposed as a channel, through a provider.
pub struct UartInterface {
    name: String,
    uart: Arc<dyn UartProvider>,
    last: Option<Vec<u8>>,
}

impl UartInterface {
    pub fn new(name: impl Into<String>, uart: Arc<dyn UartProvider>) -> Self {
        Self {
            name: name.into(),
            uart,
            last: None,
        }
    }

    pub async fn configure(&self, settings: UartSettings) -> Result<(), InterfaceError> {
        self.uart.configure(settings).await?;
        Ok(())
    }

    async fn drain(&mut self, max_in: usize) -> Result<Vec<u8>, InterfaceError> {
        let mut buffer = [0u8; RX_BUFFER];
        let limit = max_in.min(RX_BUFFER);
        let n = self.uart.receive(&mut buffer[..limit]).await?;
        Ok(buffer[..n].to_vec())
    }
}

#[async_trait]
impl Interface for UartInterface {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Uart
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn backing(&self) -> Backing {
        Backing::Resource(ResourceKind::Uart)
    }

    /// Bytes received since the last read; may be empty.
    async fn read(&mut self) -> Result<Value, InterfaceError> {
        let bytes = self.drain(RX_BUFFER).await?;
        self.last = Some(bytes.clone());
        Ok(Value::Bytes(bytes))
    }

    async fn write(&mut self, value: Value) -> Result<(), InterfaceError> {
        let Value::Bytes(bytes) = value else {
            return Err(InterfaceError::invalid_value(self.kind(), &value));
        };
        self.uart.send(&bytes).await?;
        Ok(())
    }

    async fn transfer(&mut self, out: &[u8], max_in: usize) -> Result<Vec<u8>, InterfaceError> {
        if !out.is_empty() {
            self.uart.send(out).await?;
        }
        let bytes = self.drain(max_in).await?;
        self.last = Some(bytes.clone());
        Ok(bytes)
    }

    fn last_value(&self) -> Option<Value> {
        self.last.clone().map(Value::Bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ResourceUart;
    use crate::resource::{Owner, Peripheral};
    use crate::sim::{LoopbackUart, MemoryI2c, VirtualCanBus};

    #[tokio::test]
    async fn i2c_write_then_read_register() {
        let resources = Arc::new(ResourceTable::new());
        let i2c = MemoryI2c::new();
        let probe = i2c.probe();
        resources.attach("i2c1", Peripheral::I2c(Box::new(i2c)));
        let lease = resources
            .acquire_kind(ResourceKind::I2c, Owner::new("bus"))
            .unwrap();
        let mut channel = I2cInterface::new("I2C", resources, lease);

        // write two bytes starting at register 0x10 of device 0x50
        channel.transfer(&[0x50, 0, 0x10, 0xaa, 0xbb], 5).await.unwrap();
        assert_eq!(probe.register(0x50, 0x11), 0xbb);

        let read = channel.transfer(&[0x50, 2, 0x10], 5).await.unwrap();
        assert_eq!(read, vec![0xaa, 0xbb]);
        assert_eq!(channel.read().await.unwrap(), Value::Bytes(vec![0xaa, 0xbb]));

        assert!(matches!(
            channel.transfer(&[0x50, 6, 0x10], 5).await,
            Err(InterfaceError::InvalidTransfer(_))
        ));
        assert!(matches!(
            channel.transfer(&[0x50], 5).await,
            Err(InterfaceError::InvalidTransfer(_))
        ));
    }

    #[tokio::test]
    async fn uart_transfer_returns_echo() {
        let resources = Arc::new(ResourceTable::new());
        resources.attach("uart1", Peripheral::Uart(Box::new(LoopbackUart::new())));
        let lease = resources
            .acquire_kind(ResourceKind::Uart, Owner::new("bus"))
            .unwrap();
        let uart = Arc::new(ResourceUart::new(resources, lease));
        let mut channel = UartInterface::new("UART", uart);
        channel.configure(UartSettings::default()).await.unwrap();

        let echo = channel.transfer(b"hello", 5).await.unwrap();
        assert_eq!(echo, b"hello");
        assert_eq!(channel.read().await.unwrap(), Value::Bytes(Vec::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn can_forwards_and_receives() {
        let bus = VirtualCanBus::new();
        let mut tap = bus.tap();
        let resources = Arc::new(ResourceTable::new());
        resources.attach("can1", Peripheral::Can(Box::new(bus.endpoint())));
        let lease = resources
            .acquire_kind(ResourceKind::Can, Owner::new("bus"))
            .unwrap();
        let mut channel =
            CanInterface::new("CAN", resources, lease, Duration::from_millis(5));
        channel.configure(Bitrate::Br250k).await.unwrap();

        channel.transfer(&[0x01, 0x23, 0xde, 0xad], 0).await.unwrap();
        let frame = tap.recv().await.unwrap();
        assert_eq!(frame.id(), 0x123);
        assert_eq!(frame.data(), &[0xde, 0xad]);

        assert!(matches!(channel.read().await, Err(InterfaceError::NoValue)));
        bus.inject(CanFrame::new(0x321, &[7]).unwrap());
        assert_eq!(
            channel.read().await.unwrap(),
            Value::Bytes(vec![0x03, 0x21, 7])
        );
        assert!(matches!(
            channel.transfer(&[0x08, 0x00], 0).await,
            Err(InterfaceError::InvalidTransfer(_))
        ));
    }
}
