//! Simulated peripherals and chips.
//!
//! Used by the demo daemon and by tests. Every fake hands out a probe that
//! shares its state, so a test can keep looking at (or disturbing) a device
//! after the device itself was moved into a resource table or a chip queue.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::hw_trait::{Bitrate, CanBus, CanFrame, HwError, HwResult, I2c, Pwm, Uart, UartSettings};
use crate::tracing::prelude::*;

mod chips;

pub use chips::{
    AnalogChipProbe, FakeAnalogChip, FakeInputChip, FakeOutputChip, InputChipProbe,
    OutputChipProbe,
};

/// Frames buffered per listener before the slowest one starts losing them.
const BUS_CAPACITY: usize = 256;

/// Sender id used by [`VirtualCanBus::inject`].
const INJECTED: u64 = 0;

/// A CAN bus in memory. Every endpoint sees every frame but its own.
#[derive(Clone)]
pub struct VirtualCanBus {
    tx: broadcast::Sender<(u64, CanFrame)>,
    next_endpoint: Arc<AtomicU64>,
}

impl Default for VirtualCanBus {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualCanBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            next_endpoint: Arc::new(AtomicU64::new(INJECTED + 1)),
        }
    }

    /// A controller attached to the bus.
    pub fn endpoint(&self) -> CanEndpoint {
        CanEndpoint {
            id: self.next_endpoint.fetch_add(1, Ordering::Relaxed),
            tx: self.tx.clone(),
            rx: self.tx.subscribe(),
            bitrate: None,
        }
    }

    /// A passive listener that sees all traffic.
    pub fn tap(&self) -> BusTap {
        BusTap {
            rx: self.tx.subscribe(),
        }
    }

    /// Put a frame on the bus as if some other node sent it.
    pub fn inject(&self, frame: CanFrame) {
        let _ = self.tx.send((INJECTED, frame));
    }
}

/// One controller on a [`VirtualCanBus`].
pub struct CanEndpoint {
    id: u64,
    tx: broadcast::Sender<(u64, CanFrame)>,
    rx: broadcast::Receiver<(u64, CanFrame)>,
    bitrate: Option<Bitrate>,
}

#[async_trait]
impl CanBus for CanEndpoint {
    async fn configure(&mut self, bitrate: Bitrate) -> HwResult<()> {
        self.bitrate = Some(bitrate);
        trace!(endpoint = self.id, bitrate = bitrate.bits_per_second(), "Virtual CAN configured");
        Ok(())
    }

    async fn transmit(&mut self, frame: &CanFrame) -> HwResult<()> {
        // No listeners is not an error on a real bus either
        let _ = self.tx.send((self.id, frame.clone()));
        Ok(())
    }

    async fn receive(&mut self) -> HwResult<CanFrame> {
        loop {
            match self.rx.recv().await {
                Ok((sender, _)) if sender == self.id => continue,
                Ok((_, frame)) => return Ok(frame),
                Err(broadcast::error::RecvError::Lagged(lost)) => {
                    warn!(endpoint = self.id, lost, "Virtual CAN receiver overrun");
                    return Err(HwError::Bus(format!("receive overrun, {} frames lost", lost)));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(HwError::Disconnected),
            }
        }
    }
}

/// Passive listener on a [`VirtualCanBus`].
pub struct BusTap {
    rx: broadcast::Receiver<(u64, CanFrame)>,
}

impl BusTap {
    /// Next frame on the bus; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<CanFrame> {
        loop {
            match self.rx.recv().await {
                Ok((_, frame)) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Frame already on the bus, without waiting.
    pub fn try_recv(&mut self) -> Option<CanFrame> {
        loop {
            match self.rx.try_recv() {
                Ok((_, frame)) => return Some(frame),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[derive(Default)]
struct I2cState {
    // device -> register file
    devices: HashMap<u8, [u8; 256]>,
    // device -> register pointer
    pointers: HashMap<u8, u8>,
    absent: Vec<u8>,
    // (device, register) -> bits that always read as zero
    stuck_low: HashMap<(u8, u8), u8>,
}

impl I2cState {
    fn check(&self, device: u8) -> HwResult<()> {
        if self.absent.contains(&device) {
            return Err(HwError::Nack(device as u16));
        }
        Ok(())
    }

    fn write(&mut self, device: u8, bytes: &[u8]) {
        let Some((register, data)) = bytes.split_first() else {
            return;
        };
        let file = self.devices.entry(device).or_insert([0; 256]);
        let mut pointer = *register;
        for byte in data {
            file[pointer as usize] = *byte;
            pointer = pointer.wrapping_add(1);
        }
        self.pointers.insert(device, *register);
    }

    fn read(&mut self, device: u8, buffer: &mut [u8]) {
        let file = self.devices.entry(device).or_insert([0; 256]);
        let mut pointer = self.pointers.get(&device).copied().unwrap_or(0);
        for byte in buffer.iter_mut() {
            let stuck = self.stuck_low.get(&(device, pointer)).copied().unwrap_or(0);
            *byte = file[pointer as usize] & !stuck;
            pointer = pointer.wrapping_add(1);
        }
    }
}

/// I2C controller with register-file devices behind every address.
///
/// The first byte of a write sets the register pointer; the rest is
/// stored from there on. Reads continue from the pointer.
pub struct MemoryI2c {
    state: Arc<Mutex<I2cState>>,
}

impl Default for MemoryI2c {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryI2c {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(I2cState::default())),
        }
    }

    pub fn probe(&self) -> I2cProbe {
        I2cProbe {
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl I2c for MemoryI2c {
    async fn write(&mut self, address: u8, bytes: &[u8]) -> HwResult<()> {
        let mut state = self.state.lock();
        state.check(address)?;
        state.write(address, bytes);
        Ok(())
    }

    async fn read(&mut self, address: u8, buffer: &mut [u8]) -> HwResult<()> {
        let mut state = self.state.lock();
        state.check(address)?;
        state.read(address, buffer);
        Ok(())
    }

    async fn write_read(
        &mut self,
        address: u8,
        bytes: &[u8],
        buffer: &mut [u8],
    ) -> HwResult<()> {
        let mut state = self.state.lock();
        state.check(address)?;
        state.write(address, bytes);
        state.read(address, buffer);
        Ok(())
    }
}

/// View into a [`MemoryI2c`].
#[derive(Clone)]
pub struct I2cProbe {
    state: Arc<Mutex<I2cState>>,
}

impl I2cProbe {
    pub fn register(&self, device: u8, register: u8) -> u8 {
        self.state
            .lock()
            .devices
            .get(&device)
            .map_or(0, |file| file[register as usize])
    }

    pub fn set_register(&self, device: u8, register: u8, value: u8) {
        self.state
            .lock()
            .devices
            .entry(device)
            .or_insert([0; 256])[register as usize] = value;
    }

    /// Make `mask` bits of a register read back as zero.
    pub fn stick_low(&self, device: u8, register: u8, mask: u8) {
        self.state.lock().stuck_low.insert((device, register), mask);
    }

    /// Stop acknowledging `device`.
    pub fn unplug(&self, device: u8) {
        self.state.lock().absent.push(device);
    }
}

#[derive(Default)]
struct PwmState {
    resolution: BTreeMap<u8, u8>,
    duty: BTreeMap<u8, u16>,
}

/// PWM generator that records what it was told.
pub struct RecordingPwm {
    state: Arc<Mutex<PwmState>>,
}

impl Default for RecordingPwm {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingPwm {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PwmState::default())),
        }
    }

    pub fn probe(&self) -> PwmProbe {
        PwmProbe {
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl Pwm for RecordingPwm {
    async fn configure_channel(
        &mut self,
        channel: u8,
        frequency_hz: u32,
        resolution_bits: u8,
    ) -> HwResult<()> {
        if frequency_hz == 0 || resolution_bits == 0 || resolution_bits > 16 {
            return Err(HwError::Bus(format!(
                "unsupported PWM setup {} Hz / {} bits",
                frequency_hz, resolution_bits
            )));
        }
        self.state.lock().resolution.insert(channel, resolution_bits);
        Ok(())
    }

    async fn set_duty(&mut self, channel: u8, duty: u16) -> HwResult<()> {
        let mut state = self.state.lock();
        let bits = *state.resolution.get(&channel).ok_or(HwError::NotConfigured)?;
        if u32::from(duty) >= 1u32 << bits {
            return Err(HwError::Bus(format!(
                "duty {} exceeds {}-bit resolution",
                duty, bits
            )));
        }
        state.duty.insert(channel, duty);
        Ok(())
    }
}

/// View into a [`RecordingPwm`].
#[derive(Clone)]
pub struct PwmProbe {
    state: Arc<Mutex<PwmState>>,
}

impl PwmProbe {
    pub fn duty(&self, channel: u8) -> Option<u16> {
        self.state.lock().duty.get(&channel).copied()
    }

    pub fn resolution(&self, channel: u8) -> Option<u8> {
        self.state.lock().resolution.get(&channel).copied()
    }
}

/// UART whose transmit line is wired to its own receive line.
pub struct LoopbackUart {
    settings: Option<UartSettings>,
    received: VecDeque<u8>,
}

impl Default for LoopbackUart {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackUart {
    pub fn new() -> Self {
        Self {
            settings: None,
            received: VecDeque::new(),
        }
    }
}

#[async_trait]
impl Uart for LoopbackUart {
    async fn configure(&mut self, settings: UartSettings) -> HwResult<()> {
        self.settings = Some(settings);
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> HwResult<()> {
        if self.settings.is_none() {
            return Err(HwError::NotConfigured);
        }
        self.received.extend(bytes);
        Ok(())
    }

    async fn receive(&mut self, buffer: &mut [u8]) -> HwResult<usize> {
        let n = buffer.len().min(self.received.len());
        for (slot, byte) in buffer.iter_mut().zip(self.received.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn endpoints_do_not_hear_themselves() {
        let bus = VirtualCanBus::new();
        let mut a = bus.endpoint();
        let mut b = bus.endpoint();
        let frame = CanFrame::new(0x10, &[1]).unwrap();

        a.transmit(&frame).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), frame);
        let own = tokio::time::timeout(Duration::from_millis(5), a.receive()).await;
        assert!(own.is_err());
    }

    #[tokio::test]
    async fn i2c_register_pointer() {
        let mut i2c = MemoryI2c::new();
        let probe = i2c.probe();
        i2c.write(0x20, &[0x04, 1, 2, 3]).await.unwrap();
        assert_eq!(probe.register(0x20, 0x06), 3);

        let mut buffer = [0u8; 2];
        i2c.write_read(0x20, &[0x05], &mut buffer).await.unwrap();
        assert_eq!(buffer, [2, 3]);

        probe.unplug(0x20);
        assert!(matches!(
            i2c.read(0x20, &mut buffer).await,
            Err(HwError::Nack(0x20))
        ));
    }

    #[tokio::test]
    async fn pwm_needs_configured_channel() {
        let mut pwm = RecordingPwm::new();
        assert!(matches!(
            pwm.set_duty(0, 1).await,
            Err(HwError::NotConfigured)
        ));
        pwm.configure_channel(0, 1000, 8).await.unwrap();
        assert!(pwm.set_duty(0, 256).await.is_err());
        pwm.set_duty(0, 255).await.unwrap();
        assert_eq!(pwm.probe().duty(0), Some(255));
    }

    #[tokio::test]
    async fn uart_loops_back() {
        let mut uart = LoopbackUart::new();
        assert!(uart.send(b"x").await.is_err());
        uart.configure(UartSettings::default()).await.unwrap();
        uart.send(b"abc").await.unwrap();
        let mut buffer = [0u8; 2];
        assert_eq!(uart.receive(&mut buffer).await.unwrap(), 2);
        assert_eq!(&buffer, b"ab");
        assert_eq!(uart.receive(&mut buffer).await.unwrap(), 1);
    }
}
