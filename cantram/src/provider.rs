//! Output providers and the output definition table.
//!
//! A provider is a module that exposes output lines it owns to interfaces
//! that do not own them exclusively: native pins behind the PWM core, bits
//! of an I2C output expander, a UART. Interfaces hold an
//! `Arc<dyn OutputProvider>` and a line; the provider keeps the lease on
//! the underlying peripheral.
//!
//! The [`OutputTable`] lists every line the platform provides, with its
//! capabilities and initial value, so modules can pick lines by index.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::hw_trait::{HwError, UartSettings};
use crate::resource::{Lease, ResourceError, ResourceKind, ResourceTable};
use crate::tracing::prelude::*;

/// Capacity of the output definition table.
pub const MAX_OUTPUTS: usize = 100;

/// Duty resolution of [`PwmCoreProvider`].
pub const PWM_RESOLUTION_BITS: u8 = 12;

const PWM_MAX_DUTY: u16 = (1 << PWM_RESOLUTION_BITS) - 1;
const PWM_MAX_CHANNELS: u8 = 16;

/// Provider errors.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Hardware(#[from] HwError),

    #[error("{0} is not handled by this provider")]
    ForeignLine(OutputLine),

    #[error("{0} is input-only")]
    InputOnly(OutputLine),

    #[error("{0} is not PWM capable")]
    NotPwmCapable(OutputLine),

    #[error("No free PWM channel for {0}")]
    NoPwmChannel(OutputLine),

    #[error("{line} reads back {actual} after writing {expected}")]
    Verify {
        line: OutputLine,
        expected: bool,
        actual: bool,
    },

    #[error("Output index {0} exceeds the table capacity")]
    IndexOutOfRange(usize),

    #[error("Output index {0} already defined")]
    Occupied(usize),

    #[error("No output defined at index {0}")]
    Undefined(usize),

    #[error("Output table full")]
    TableFull,
}

/// A physical output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OutputLine {
    /// Microcontroller pin
    Native(u8),
    /// Bit of an output expander
    Shift(u8),
}

impl OutputLine {
    pub fn is_shift(self) -> bool {
        matches!(self, OutputLine::Shift(_))
    }
}

impl fmt::Display for OutputLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputLine::Native(pin) => write!(f, "GPIO{}", pin),
            OutputLine::Shift(bit) => write!(f, "expander bit {}", bit),
        }
    }
}

/// Line direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// A module exposing output lines to interfaces.
#[async_trait]
pub trait OutputProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Peripheral class the lines are driven through.
    fn resource_kind(&self) -> ResourceKind;

    async fn configure_output(&self, line: OutputLine, direction: Direction)
        -> Result<(), ProviderError>;

    async fn set_output(&self, line: OutputLine, state: bool) -> Result<(), ProviderError>;

    /// Driven level of an output line, or the sensed level of an input.
    async fn get_output(&self, line: OutputLine) -> Result<bool, ProviderError>;

    /// Connect (or disconnect) every line to the outside world. Values set
    /// while disabled are applied on enable.
    async fn enable_outputs(&self, enabled: bool) -> Result<(), ProviderError>;

    /// PWM access, for providers that have it.
    fn as_pwm(&self) -> Option<&dyn PwmOutputProvider> {
        None
    }
}

/// Provider with PWM-capable lines.
#[async_trait]
pub trait PwmOutputProvider: OutputProvider {
    fn resolution_bits(&self) -> u8;

    async fn register_pwm_channel(&self, line: OutputLine) -> Result<(), ProviderError>;

    /// Set the duty in units of [`resolution_bits`](Self::resolution_bits);
    /// larger values saturate.
    async fn set_pwm(&self, line: OutputLine, duty: u16) -> Result<(), ProviderError>;
}

/// A module exposing a UART to interfaces.
#[async_trait]
pub trait UartProvider: Send + Sync {
    async fn configure(&self, settings: UartSettings) -> Result<(), ProviderError>;

    async fn send(&self, bytes: &[u8]) -> Result<(), ProviderError>;

    /// Non-blocking; returns the number of bytes copied.
    async fn receive(&self, buffer: &mut [u8]) -> Result<usize, ProviderError>;
}

// I2C output expander registers (sequential addressing, port A then B)
mod expander {
    pub const IODIR: u8 = 0x00;
    pub const GPIO: u8 = 0x12;
    pub const OLAT: u8 = 0x14;
}

/// Default I2C address of the output expander.
pub const EXPANDER_I2C_ADDR: u8 = 0x20;

struct ExpanderState {
    latch: u16,
    outputs: u16,
    enabled: bool,
}

/// Sixteen expander bits on an I2C lease.
pub struct ShiftRegisterProvider {
    resources: Arc<ResourceTable>,
    lease: Lease,
    address: u8,
    state: Mutex<ExpanderState>,
}

impl ShiftRegisterProvider {
    pub fn new(resources: Arc<ResourceTable>, lease: Lease, address: u8) -> Self {
        Self {
            resources,
            lease,
            address,
            state: Mutex::new(ExpanderState {
                latch: 0,
                outputs: 0,
                enabled: false,
            }),
        }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    fn bit(line: OutputLine) -> Result<u16, ProviderError> {
        match line {
            OutputLine::Shift(bit) if bit < 16 => Ok(1 << bit),
            other => Err(ProviderError::ForeignLine(other)),
        }
    }

    async fn write_pair(&self, register: u8, value: u16) -> Result<(), ProviderError> {
        let [lo, hi] = value.to_le_bytes();
        let mut guard = self.resources.lock(&self.lease).await?;
        guard.as_i2c()?.write(self.address, &[register, lo, hi]).await?;
        Ok(())
    }

    async fn read_pair(&self, register: u8) -> Result<u16, ProviderError> {
        let mut buffer = [0u8; 2];
        let mut guard = self.resources.lock(&self.lease).await?;
        guard
            .as_i2c()?
            .write_read(self.address, &[register], &mut buffer)
            .await?;
        Ok(u16::from_le_bytes(buffer))
    }
}

#[async_trait]
impl OutputProvider for ShiftRegisterProvider {
    fn name(&self) -> &str {
        "shift-register"
    }

    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::I2c
    }

    async fn configure_output(
        &self,
        line: OutputLine,
        direction: Direction,
    ) -> Result<(), ProviderError> {
        let bit = Self::bit(line)?;
        let mut state = self.state.lock().await;
        match direction {
            Direction::Output => state.outputs |= bit,
            Direction::Input => state.outputs &= !bit,
        }
        if state.enabled {
            self.write_pair(expander::IODIR, !state.outputs).await?;
        }
        debug!(line = %line, ?direction, "Expander line configured");
        Ok(())
    }

    async fn set_output(&self, line: OutputLine, value: bool) -> Result<(), ProviderError> {
        let bit = Self::bit(line)?;
        let mut state = self.state.lock().await;
        let latch = if value {
            state.latch | bit
        } else {
            state.latch & !bit
        };
        self.write_pair(expander::OLAT, latch).await?;

        let readback = self.read_pair(expander::OLAT).await?;
        if (readback & bit != 0) != value {
            error!(line = %line, value, "Expander output did not take the new level");
            // The chip must hold the cached latch
            if let Err(e) = self.write_pair(expander::OLAT, state.latch).await {
                warn!(error = %e, "Failed to restore expander latch");
            }
            return Err(ProviderError::Verify {
                line,
                expected: value,
                actual: !value,
            });
        }
        state.latch = latch;
        Ok(())
    }

    async fn get_output(&self, line: OutputLine) -> Result<bool, ProviderError> {
        let bit = Self::bit(line)?;
        let state = self.state.lock().await;
        if state.outputs & bit != 0 {
            return Ok(state.latch & bit != 0);
        }
        let levels = self.read_pair(expander::GPIO).await?;
        Ok(levels & bit != 0)
    }

    async fn enable_outputs(&self, enabled: bool) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        if state.enabled == enabled {
            return Ok(());
        }
        // IODIR bit set means input
        let direction = if enabled { !state.outputs } else { 0xffff };
        self.write_pair(expander::IODIR, direction).await?;
        state.enabled = enabled;
        info!(provider = self.name(), enabled, "Outputs enabled set");
        Ok(())
    }
}

struct PwmState {
    // pin -> PWM channel
    channels: BTreeMap<u8, u8>,
    duty: BTreeMap<u8, u16>,
    enabled: bool,
}

/// Native pins driven by the PWM core, 12-bit duty.
///
/// Plain digital writes on a registered pin map to duty 0 or full scale.
pub struct PwmCoreProvider {
    resources: Arc<ResourceTable>,
    lease: Lease,
    frequency_hz: u32,
    state: Mutex<PwmState>,
}

impl PwmCoreProvider {
    pub fn new(resources: Arc<ResourceTable>, lease: Lease, frequency_hz: u32) -> Self {
        Self {
            resources,
            lease,
            frequency_hz,
            state: Mutex::new(PwmState {
                channels: BTreeMap::new(),
                duty: BTreeMap::new(),
                enabled: false,
            }),
        }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    fn pin(line: OutputLine) -> Result<u8, ProviderError> {
        match line {
            OutputLine::Native(pin) => Ok(pin),
            other => Err(ProviderError::ForeignLine(other)),
        }
    }

    async fn apply(&self, channel: u8, duty: u16) -> Result<(), ProviderError> {
        let mut guard = self.resources.lock(&self.lease).await?;
        guard.as_pwm()?.set_duty(channel, duty).await?;
        Ok(())
    }

    async fn register(&self, state: &mut PwmState, pin: u8) -> Result<u8, ProviderError> {
        if let Some(channel) = state.channels.get(&pin) {
            return Ok(*channel);
        }
        let channel = state.channels.len() as u8;
        if channel >= PWM_MAX_CHANNELS {
            return Err(ProviderError::NoPwmChannel(OutputLine::Native(pin)));
        }
        {
            let mut guard = self.resources.lock(&self.lease).await?;
            guard
                .as_pwm()?
                .configure_channel(channel, self.frequency_hz, PWM_RESOLUTION_BITS)
                .await?;
        }
        state.channels.insert(pin, channel);
        debug!(pin, channel, frequency_hz = self.frequency_hz, "PWM channel registered");
        Ok(channel)
    }

    async fn drive(&self, pin: u8, duty: u16) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let channel = self.register(&mut state, pin).await?;
        let duty = duty.min(PWM_MAX_DUTY);
        if state.enabled {
            self.apply(channel, duty).await?;
        }
        state.duty.insert(pin, duty);
        Ok(())
    }
}

#[async_trait]
impl OutputProvider for PwmCoreProvider {
    fn name(&self) -> &str {
        "pwm-core"
    }

    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Pwm
    }

    async fn configure_output(
        &self,
        line: OutputLine,
        direction: Direction,
    ) -> Result<(), ProviderError> {
        let pin = Self::pin(line)?;
        if direction == Direction::Input {
            return Err(ProviderError::NotPwmCapable(line));
        }
        let mut state = self.state.lock().await;
        self.register(&mut state, pin).await?;
        Ok(())
    }

    async fn set_output(&self, line: OutputLine, value: bool) -> Result<(), ProviderError> {
        let pin = Self::pin(line)?;
        self.drive(pin, if value { PWM_MAX_DUTY } else { 0 }).await
    }

    async fn get_output(&self, line: OutputLine) -> Result<bool, ProviderError> {
        let pin = Self::pin(line)?;
        let state = self.state.lock().await;
        Ok(state.duty.get(&pin).is_some_and(|duty| *duty > 0))
    }

    async fn enable_outputs(&self, enabled: bool) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        if state.enabled == enabled {
            return Ok(());
        }
        for (pin, channel) in &state.channels {
            let duty = if enabled {
                state.duty.get(pin).copied().unwrap_or(0)
            } else {
                0
            };
            self.apply(*channel, duty).await?;
        }
        state.enabled = enabled;
        info!(provider = self.name(), enabled, "Outputs enabled set");
        Ok(())
    }

    fn as_pwm(&self) -> Option<&dyn PwmOutputProvider> {
        Some(self)
    }
}

#[async_trait]
impl PwmOutputProvider for PwmCoreProvider {
    fn resolution_bits(&self) -> u8 {
        PWM_RESOLUTION_BITS
    }

    async fn register_pwm_channel(&self, line: OutputLine) -> Result<(), ProviderError> {
        let pin = Self::pin(line)?;
        let mut state = self.state.lock().await;
        self.register(&mut state, pin).await?;
        Ok(())
    }

    async fn set_pwm(&self, line: OutputLine, duty: u16) -> Result<(), ProviderError> {
        let pin = Self::pin(line)?;
        self.drive(pin, duty).await
    }
}

/// UART provider over a UART lease.
pub struct ResourceUart {
    resources: Arc<ResourceTable>,
    lease: Lease,
}

impl ResourceUart {
    pub fn new(resources: Arc<ResourceTable>, lease: Lease) -> Self {
        Self { resources, lease }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }
}

#[async_trait]
impl UartProvider for ResourceUart {
    async fn configure(&self, settings: UartSettings) -> Result<(), ProviderError> {
        let mut guard = self.resources.lock(&self.lease).await?;
        guard.as_uart()?.configure(settings).await?;
        debug!(baudrate = settings.baudrate, "UART configured");
        Ok(())
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), ProviderError> {
        let mut guard = self.resources.lock(&self.lease).await?;
        guard.as_uart()?.send(bytes).await?;
        Ok(())
    }

    async fn receive(&self, buffer: &mut [u8]) -> Result<usize, ProviderError> {
        let mut guard = self.resources.lock(&self.lease).await?;
        Ok(guard.as_uart()?.receive(buffer).await?)
    }
}

/// One line the platform provides.
#[derive(Clone)]
pub struct OutputDefinition {
    pub line: OutputLine,
    pub adc: bool,
    pub pwm: bool,
    pub input_only: bool,
    pub initial: bool,
    pub provider: Arc<dyn OutputProvider>,
}

impl OutputDefinition {
    pub fn output(line: OutputLine, provider: Arc<dyn OutputProvider>) -> Self {
        Self {
            line,
            adc: false,
            pwm: false,
            input_only: false,
            initial: false,
            provider,
        }
    }

    pub fn with_pwm(mut self) -> Self {
        self.pwm = true;
        self
    }

    pub fn with_adc(mut self) -> Self {
        self.adc = true;
        self
    }

    pub fn input_only(mut self) -> Self {
        self.input_only = true;
        self
    }

    pub fn with_initial(mut self, initial: bool) -> Self {
        self.initial = initial;
        self
    }

    pub async fn set(&self, state: bool) -> Result<(), ProviderError> {
        if self.input_only {
            return Err(ProviderError::InputOnly(self.line));
        }
        self.provider.set_output(self.line, state).await
    }

    pub async fn get(&self) -> Result<bool, ProviderError> {
        self.provider.get_output(self.line).await
    }

    /// The PWM provider behind a PWM-capable line.
    pub fn pwm(&self) -> Result<&dyn PwmOutputProvider, ProviderError> {
        if !self.pwm {
            return Err(ProviderError::NotPwmCapable(self.line));
        }
        self.provider
            .as_pwm()
            .ok_or(ProviderError::NotPwmCapable(self.line))
    }
}

impl fmt::Debug for OutputDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputDefinition")
            .field("line", &self.line)
            .field("adc", &self.adc)
            .field("pwm", &self.pwm)
            .field("input_only", &self.input_only)
            .field("initial", &self.initial)
            .field("provider", &self.provider.name())
            .finish()
    }
}

/// Result of [`OutputTable::initialize`]; failures do not stop the pass.
#[derive(Debug, Default)]
pub struct InitReport {
    pub applied: usize,
    pub failures: Vec<(usize, ProviderError)>,
}

impl InitReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Table of the output lines the platform provides.
pub struct OutputTable {
    slots: Vec<Option<OutputDefinition>>,
    used: usize,
}

impl Default for OutputTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputTable {
    pub fn new() -> Self {
        Self {
            slots: vec![None; MAX_OUTPUTS],
            used: 0,
        }
    }

    /// Put a definition at a fixed index. An occupied index is refused
    /// unless `overwrite` is set.
    pub fn insert(
        &mut self,
        index: usize,
        definition: OutputDefinition,
        overwrite: bool,
    ) -> Result<(), ProviderError> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(ProviderError::IndexOutOfRange(index))?;
        if let Some(existing) = slot {
            if !overwrite {
                return Err(ProviderError::Occupied(index));
            }
            warn!(index, old = ?existing, "Overwriting output definition");
        }
        debug!(index, definition = ?definition, "Output definition added");
        *slot = Some(definition);
        Ok(())
    }

    /// Put a definition in the first free slot and return its index.
    pub fn push(&mut self, definition: OutputDefinition) -> Result<usize, ProviderError> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ProviderError::TableFull)?;
        self.insert(index, definition, false)?;
        Ok(index)
    }

    /// Look a definition up without claiming it.
    pub fn get(&self, index: usize) -> Result<&OutputDefinition, ProviderError> {
        self.slots
            .get(index)
            .ok_or(ProviderError::IndexOutOfRange(index))?
            .as_ref()
            .ok_or(ProviderError::Undefined(index))
    }

    /// Look a definition up and count it as used by a module.
    pub fn take_for_use(&mut self, index: usize) -> Result<OutputDefinition, ProviderError> {
        let definition = self.get(index)?.clone();
        self.used += 1;
        Ok(definition)
    }

    pub fn provided(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Apply initial values (native lines first, then expander lines) and
    /// enable every provider once.
    pub async fn initialize(&self) -> InitReport {
        let mut report = InitReport::default();
        let defined: Vec<(usize, &OutputDefinition)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|d| (i, d)))
            .collect();

        let native = defined.iter().filter(|(_, d)| !d.line.is_shift());
        let shift = defined.iter().filter(|(_, d)| d.line.is_shift());
        for (index, definition) in native.chain(shift) {
            if definition.input_only {
                continue;
            }
            match definition.set(definition.initial).await {
                Ok(()) => {
                    report.applied += 1;
                    debug!(index, line = %definition.line, value = definition.initial, "Initial output value set");
                }
                Err(e) => {
                    error!(index, line = %definition.line, error = %e, "Failed to set initial output value");
                    report.failures.push((*index, e));
                }
            }
        }

        let mut enabled: Vec<usize> = Vec::new();
        for (index, definition) in &defined {
            let key = Arc::as_ptr(&definition.provider) as *const () as usize;
            if enabled.contains(&key) {
                continue;
            }
            enabled.push(key);
            if let Err(e) = definition.provider.enable_outputs(true).await {
                error!(provider = definition.provider.name(), error = %e, "Failed to enable outputs");
                report.failures.push((*index, e));
            }
        }
        info!(
            applied = report.applied,
            failures = report.failures.len(),
            "Output table initialized"
        );
        report
    }
}
