//! Simulated tram bus: a controller and two boards on a virtual CAN bus.
//!
//! Usage: `cantram-sim [config.json]`

use anyhow::Context;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::broadcast;
use tokio::time;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use cantram::chip::{BurstAnalogChip, ChannelOutputChip, ChipSelect, DiagnosticInputChip, SharedChip};
use cantram::config::Config;
use cantram::interface::{
    AnalogInput, AnalogOutput, AnalogScale, AnalogValue, ChannelKind, DigitalInput, DigitalOutput,
    InputSource, OutputSink, Relay, Unit, Value,
};
use cantram::module::{ChannelModule, ModuleIdentity};
use cantram::provider::{
    Direction, OutputDefinition, OutputLine, OutputProvider, OutputTable, PwmCoreProvider,
    ShiftRegisterProvider, EXPANDER_I2C_ADDR,
};
use cantram::resource::{Owner, Peripheral, ResourceKind, ResourceTable};
use cantram::sim::{
    AnalogChipProbe, FakeAnalogChip, FakeInputChip, FakeOutputChip, InputChipProbe, MemoryI2c,
    RecordingPwm, VirtualCanBus,
};
use cantram::tracing::{self, prelude::*};
use cantram::tram::{Address, BusEvent, TramCore, TramHandle};

const DIGITAL_ADDRESS: u8 = 0x10;
const ANALOG_ADDRESS: u8 = 0x20;
const RELAY_CHANNEL: u8 = 8;
const ANALOG_OUT_CHANNEL: u8 = 4;
const PWM_FREQUENCY_HZ: u32 = 1000;

fn identity(hw_type: &str, uid: u32, type_code: u8) -> ModuleIdentity {
    ModuleIdentity {
        hw_type: hw_type.to_string(),
        hw_version: "1.0".to_string(),
        fw_version: env!("CARGO_PKG_VERSION").to_string(),
        uid,
        type_code,
    }
}

/// Resource table with a CAN endpoint on `bus`, and a core leasing it.
fn node(config: &Config, bus: &VirtualCanBus) -> anyhow::Result<(Arc<ResourceTable>, TramCore)> {
    let resources = Arc::new(ResourceTable::new());
    let can = resources.attach("can0", Peripheral::Can(Box::new(bus.endpoint())));
    let lease = resources.acquire(can, Owner::new("tram"))?;
    let core = TramCore::new(config.bus.clone(), resources.clone(), lease)?;
    Ok((resources, core))
}

/// Four isolated inputs, two outputs and a relay.
fn digital_board(
    config: &Config,
    bus: &VirtualCanBus,
    address: Address,
) -> anyhow::Result<(TramCore, InputChipProbe)> {
    let (_, mut core) = node(config, bus)?;

    let input = FakeInputChip::new(ChipSelect::Pin(4));
    let probe = input.probe();
    let inputs: SharedChip<dyn DiagnosticInputChip> =
        SharedChip::new(Box::new(input), config.chips.snapshot_window());
    let outputs: SharedChip<dyn ChannelOutputChip> = SharedChip::new(
        Box::new(FakeOutputChip::new(ChipSelect::Pin(5), 4)),
        config.chips.snapshot_window(),
    );

    let mut module = ChannelModule::new(identity("DigitalModule", 0x0d16_0001, 2), address);
    for ch in 0..4u8 {
        let source = InputSource::Chip(inputs.clone(), ch);
        module.attach(ch, Box::new(DigitalInput::new(format!("DI{}", ch), source)))?;
    }
    for ch in 0..2u8 {
        let sink = OutputSink::Chip(outputs.clone(), ch);
        module.attach(4 + ch, Box::new(DigitalOutput::new(format!("DO{}", ch), sink)))?;
    }
    let relay = Relay::new("K1", OutputSink::Chip(outputs, 2), config.relay.min_dwell());
    module.attach(RELAY_CHANNEL, Box::new(relay))?;

    core.register(Box::new(module))?;
    Ok((core, probe))
}

/// Four analog inputs, a PWM analog output and a status LED on the
/// expander.
async fn analog_board(
    config: &Config,
    bus: &VirtualCanBus,
    address: Address,
) -> anyhow::Result<(TramCore, AnalogChipProbe)> {
    let (resources, mut core) = node(config, bus)?;
    resources.attach("i2c0", Peripheral::I2c(Box::new(MemoryI2c::new())));
    resources.attach("pwm0", Peripheral::Pwm(Box::new(RecordingPwm::new())));
    let i2c = resources.acquire_kind(ResourceKind::I2c, Owner::new("expander"))?;
    let pwm = resources.acquire_kind(ResourceKind::Pwm, Owner::new("pwm-core"))?;

    let expander: Arc<dyn OutputProvider> = Arc::new(ShiftRegisterProvider::new(
        resources.clone(),
        i2c,
        EXPANDER_I2C_ADDR,
    ));
    let pwm_core: Arc<dyn OutputProvider> =
        Arc::new(PwmCoreProvider::new(resources.clone(), pwm, PWM_FREQUENCY_HZ));
    expander
        .configure_output(OutputLine::Shift(0), Direction::Output)
        .await?;

    let mut lines = OutputTable::new();
    let ao = lines.push(OutputDefinition::output(OutputLine::Native(3), pwm_core).with_pwm())?;
    let led = lines.push(OutputDefinition::output(OutputLine::Shift(0), expander).with_initial(true))?;
    let report = lines.initialize().await;
    if !report.is_ok() {
        warn!(failures = report.failures.len(), "Some output lines did not initialize");
    }

    let adc = FakeAnalogChip::new(ChipSelect::Pin(6), 12);
    let probe = adc.probe();
    let adc: SharedChip<dyn BurstAnalogChip> =
        SharedChip::new(Box::new(adc), config.chips.snapshot_window());

    let mut module = ChannelModule::new(identity("AnalogModule", 0x0a16_0001, 3), address);
    for ch in 0..4u8 {
        let scale = AnalogScale::linear(10.0, Unit::Volt);
        module.attach(ch, Box::new(AnalogInput::new(format!("AI{}", ch), adc.clone(), ch, scale)))?;
    }
    let output = AnalogOutput::new(
        "AO0",
        lines.take_for_use(ao)?,
        AnalogScale::linear(10.0, Unit::Volt),
    )?;
    module.attach(ANALOG_OUT_CHANNEL, Box::new(output))?;
    let status = DigitalOutput::new("LED", OutputSink::Line(lines.take_for_use(led)?));
    module.attach(ANALOG_OUT_CHANNEL + 1, Box::new(status))?;

    core.register(Box::new(module))?;
    Ok((core, probe))
}

async fn serve(name: &'static str, mut core: TramCore, running: CancellationToken) {
    match core.initialize().await {
        Ok(failures) => {
            for (address, e) in failures {
                warn!(node = name, address = %address, error = %e, "Module not ready");
            }
        }
        Err(e) => {
            error!(node = name, error = %e, "Bus bring-up failed");
            return;
        }
    }
    if let Err(e) = core.run(running).await {
        error!(node = name, error = %e, "Bus service failed");
    }
}

async fn log_events(mut events: broadcast::Receiver<BusEvent>, running: CancellationToken) {
    loop {
        tokio::select! {
            _ = running.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(event = %json, "Bus event"),
                    Err(e) => warn!(error = %e, "Unserializable bus event"),
                },
                Err(broadcast::error::RecvError::Lagged(lost)) => warn!(lost, "Bus events dropped"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

struct Exercise {
    handle: TramHandle,
    digital: Address,
    analog: Address,
    inputs: InputChipProbe,
    adc: AnalogChipProbe,
}

impl Exercise {
    async fn discover(&self) -> cantram::Result<()> {
        let directory = self.handle.enumerate().await?;
        for entry in directory.iter() {
            let channels: Vec<String> = self
                .handle
                .describe(entry.address)
                .await?
                .iter()
                .map(|(ch, kind)| format!("{}:{}", ch, kind))
                .collect();
            info!(
                address = %entry.address,
                uid = entry.uid,
                channels = %channels.join(", "),
                "Module described"
            );
        }
        Ok(())
    }

    async fn step(&self, step: u32) -> cantram::Result<()> {
        self.inputs.set_inputs((step % 16) as u8);
        self.adc.set_channel(0, ((step * 256) % 4096) as u16);

        let changed = self.handle.poll(self.digital).await?;
        for ch in 0..4u8 {
            if changed & (1 << ch) == 0 {
                continue;
            }
            let value = self
                .handle
                .read(self.digital, ch, ChannelKind::DigitalInput)
                .await?;
            info!(channel = ch, value = %value, "Input changed");
        }

        self.handle
            .write(self.digital, RELAY_CHANNEL, &Value::Bool(step % 2 == 0))
            .await?;

        let measured = self
            .handle
            .read(self.analog, 0, ChannelKind::AnalogInput)
            .await?;
        let setpoint = (step % 11) as f32;
        self.handle
            .write(
                self.analog,
                ANALOG_OUT_CHANNEL,
                &Value::Analog(AnalogValue::new(setpoint, Unit::Volt)),
            )
            .await?;
        debug!(step, measured = %measured, setpoint, "Exercise step");
        Ok(())
    }

    async fn run(self, running: CancellationToken) {
        // Let the boards finish bring-up before probing
        tokio::select! {
            _ = running.cancelled() => return,
            _ = time::sleep(Duration::from_millis(50)) => {}
        }
        if let Err(e) = self.discover().await {
            error!(error = %e, "Discovery failed");
            return;
        }

        let mut tick = time::interval(Duration::from_secs(1));
        let mut step = 0u32;
        loop {
            tokio::select! {
                _ = running.cancelled() => break,
                _ = tick.tick() => {}
            }
            if let Err(e) = self.step(step).await {
                warn!(step, error = %e, "Exercise step failed");
            }
            step = step.wrapping_add(1);
        }
        info!(stats = ?self.handle.stats(), "Bus statistics");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let config = match env::args().nth(1) {
        Some(path) => Config::load_from(&path).with_context(|| format!("loading {}", path))?,
        None => Config::from_env()?,
    };
    let digital = Address::new(DIGITAL_ADDRESS).context("digital board address")?;
    let analog = Address::new(ANALOG_ADDRESS).context("analog board address")?;

    let bus = VirtualCanBus::new();
    let (digital_core, inputs) = digital_board(&config, &bus, digital)?;
    let (analog_core, adc) = analog_board(&config, &bus, analog).await?;
    let (_, controller) = node(&config, &bus)?;
    let handle = controller.handle();

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();
    tracker.spawn(serve("digital", digital_core, running.clone()));
    tracker.spawn(serve("analog", analog_core, running.clone()));
    tracker.spawn(serve("controller", controller, running.clone()));
    tracker.spawn(log_events(handle.subscribe(), running.clone()));
    let exercise = Exercise {
        handle,
        digital,
        analog,
        inputs,
        adc,
    };
    tracker.spawn(exercise.run(running.clone()));
    tracker.close();
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    trace!("Shutting down.");
    running.cancel();

    tracker.wait().await;
    info!("Exiting.");
    Ok(())
}
