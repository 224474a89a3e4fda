use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::time::Instant;

use super::{describe_data, ModuleIdentity, Response, TramModule};
use crate::error::{Error, Result};
use crate::interface::{ChannelKind, Interface, Value};
use crate::tracing::prelude::*;
use crate::tram::frame::MAX_DATA;
use crate::tram::value::{decode_write, encode_read};
use crate::tram::{Address, Operation, Status};

/// Channels a module can carry; `POLL` reports changes as a 32-bit mask.
pub const MAX_CHANNELS: u8 = 32;

struct Channel {
    interface: Box<dyn Interface>,
    last_seen: Option<Value>,
}

/// A module built from interfaces keyed by channel id.
pub struct ChannelModule {
    identity: ModuleIdentity,
    address: Address,
    channels: BTreeMap<u8, Channel>,
    changed: u32,
}

impl ChannelModule {
    pub fn new(identity: ModuleIdentity, address: Address) -> Self {
        Self {
            identity,
            address,
            channels: BTreeMap::new(),
            changed: 0,
        }
    }

    /// Attach an interface as channel `channel`.
    pub fn attach(&mut self, channel: u8, interface: Box<dyn Interface>) -> Result<()> {
        if channel >= MAX_CHANNELS {
            return Err(Error::Config(format!(
                "channel {} exceeds the {} channels of a module",
                channel, MAX_CHANNELS
            )));
        }
        if let Some(existing) = self.channels.get(&channel) {
            return Err(Error::Config(format!(
                "channel {} of {} already taken by '{}'",
                channel,
                self.identity.hw_type,
                existing.interface.name()
            )));
        }
        debug!(
            module = %self.identity.hw_type,
            channel,
            kind = %interface.kind(),
            name = interface.name(),
            "Interface attached"
        );
        self.channels.insert(
            channel,
            Channel {
                interface,
                last_seen: None,
            },
        );
        Ok(())
    }

    /// Direct access for module logic running next to the core.
    pub fn interface_mut(&mut self, channel: u8) -> Option<&mut (dyn Interface + 'static)> {
        self.channels
            .get_mut(&channel)
            .map(|c| c.interface.as_mut())
    }

    fn mark_changed(&mut self, channel: u8) {
        self.changed |= 1 << channel;
    }

    async fn read(&mut self, channel: u8) -> Response {
        let Some(entry) = self.channels.get_mut(&channel) else {
            return Response::error(Status::InvalidChannel);
        };
        match entry.interface.read().await {
            Ok(value) => {
                let data = encode_read(&value);
                if data.len() > MAX_DATA {
                    return Response::error(Status::InvalidPayload);
                }
                Response::ok(data)
            }
            Err(e) => {
                debug!(channel, error = %e, "Channel read failed");
                Response::error((&e).into())
            }
        }
    }

    async fn write(&mut self, channel: u8, data: &[u8]) -> Response {
        let Some(entry) = self.channels.get_mut(&channel) else {
            return Response::error(Status::InvalidChannel);
        };
        let kind = entry.interface.kind();
        if kind.is_input() {
            return Response::error(Status::Unsupported);
        }
        let Some(value) = decode_write(kind, data) else {
            return Response::error(Status::InvalidPayload);
        };
        match entry.interface.write(value).await {
            Ok(()) => {
                self.mark_changed(channel);
                Response::ok(Vec::new())
            }
            Err(e) => {
                warn!(channel, error = %e, "Channel write failed");
                Response::error((&e).into())
            }
        }
    }

    async fn transfer(&mut self, channel: u8, data: &[u8]) -> Response {
        let Some(entry) = self.channels.get_mut(&channel) else {
            return Response::error(Status::InvalidChannel);
        };
        match entry.interface.transfer(data, MAX_DATA).await {
            Ok(bytes) if bytes.len() <= MAX_DATA => Response::ok(bytes),
            Ok(_) => Response::error(Status::InvalidPayload),
            Err(e) => {
                debug!(channel, error = %e, "Channel transfer failed");
                Response::error((&e).into())
            }
        }
    }

    fn poll(&mut self) -> Response {
        let mask = std::mem::take(&mut self.changed);
        Response::ok(mask.to_le_bytes().to_vec())
    }
}

#[async_trait]
impl TramModule for ChannelModule {
    fn identity(&self) -> &ModuleIdentity {
        &self.identity
    }

    fn address(&self) -> Address {
        self.address
    }

    fn set_address(&mut self, address: Address) {
        self.address = address;
    }

    fn describe_capabilities(&self) -> Vec<(u8, ChannelKind)> {
        self.channels
            .iter()
            .map(|(channel, c)| (*channel, c.interface.kind()))
            .collect()
    }

    async fn on_request(&mut self, operation: Operation, field: u8, data: &[u8]) -> Response {
        match operation {
            Operation::Probe => Response::ok(self.identity.probe_data()),
            Operation::Describe => match describe_data(&self.describe_capabilities(), field) {
                Some(data) => Response::ok(data),
                None => Response::error(Status::InvalidChannel),
            },
            Operation::Read => self.read(field).await,
            Operation::Write => self.write(field, data).await,
            Operation::Poll => self.poll(),
            Operation::Transfer => self.transfer(field, data).await,
            Operation::Assign | Operation::Reserved => Response::error(Status::UnknownOperation),
        }
    }

    /// Take a first sample of every input so `POLL` starts from a baseline.
    /// All channels are tried; the first failure is reported.
    async fn initialize(&mut self) -> Result<()> {
        let mut first_error = None;
        for (channel, entry) in self.channels.iter_mut() {
            if !entry.interface.kind().is_input() {
                continue;
            }
            match entry.interface.read().await {
                Ok(value) => entry.last_seen = Some(value),
                Err(e) => {
                    warn!(module = %self.identity.hw_type, channel, error = %e, "Input not ready");
                    first_error.get_or_insert(Error::Interface(e));
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn cycle(&mut self, now: Instant) {
        let mut changed = 0u32;
        for (channel, entry) in self.channels.iter_mut() {
            if let Err(e) = entry.interface.service(now).await {
                warn!(channel, error = %e, "Deferred channel work failed");
            }
            if !entry.interface.kind().is_input() {
                continue;
            }
            let current = entry.interface.read().await.ok();
            if current != entry.last_seen {
                changed |= 1 << channel;
                entry.last_seen = current;
            }
        }
        self.changed |= changed;
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.channels
            .values()
            .filter_map(|c| c.interface.next_deadline())
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::{ChannelOutputChip, ChipSelect, DiagnosticInputChip, SharedChip};
    use crate::interface::{DigitalInput, DigitalOutput, InputSource, OutputSink, Relay};
    use crate::sim::{FakeInputChip, FakeOutputChip, InputChipProbe};
    use std::time::Duration;

    fn identity() -> ModuleIdentity {
        ModuleIdentity {
            hw_type: "DigitalModule".into(),
            hw_version: "1.0".into(),
            fw_version: "0.1.0".into(),
            uid: 0xcafe,
            type_code: 2,
        }
    }

    fn digital_module() -> (ChannelModule, InputChipProbe) {
        let input = FakeInputChip::new(ChipSelect::Pin(4));
        let probe = input.probe();
        let inputs: SharedChip<dyn DiagnosticInputChip> =
            SharedChip::new(Box::new(input), Duration::ZERO);
        let outputs: SharedChip<dyn ChannelOutputChip> = SharedChip::new(
            Box::new(FakeOutputChip::new(ChipSelect::Pin(5), 8)),
            Duration::ZERO,
        );

        let mut module = ChannelModule::new(identity(), Address::new(0x10).unwrap());
        for ch in 0..4u8 {
            let name = format!("DI{}", ch);
            module
                .attach(ch, Box::new(DigitalInput::new(name, InputSource::Chip(inputs.clone(), ch))))
                .unwrap();
        }
        module
            .attach(8, Box::new(DigitalOutput::new("DO0", OutputSink::Chip(outputs.clone(), 0))))
            .unwrap();
        module
            .attach(
                9,
                Box::new(Relay::new(
                    "K1",
                    OutputSink::Chip(outputs, 1),
                    Duration::from_millis(100),
                )),
            )
            .unwrap();
        (module, probe)
    }

    #[tokio::test]
    async fn read_channel_two() {
        let (mut module, probe) = digital_module();
        probe.set_inputs(0b0100);
        let response = module.on_request(Operation::Read, 2, &[]).await;
        assert_eq!(response, Response::ok(vec![1]));
    }

    #[tokio::test]
    async fn every_request_gets_a_status() {
        let (mut module, probe) = digital_module();
        assert_eq!(
            module.on_request(Operation::Read, 20, &[]).await.status,
            Status::InvalidChannel
        );
        assert_eq!(
            module.on_request(Operation::Write, 0, &[1]).await.status,
            Status::Unsupported
        );
        assert_eq!(
            module.on_request(Operation::Write, 8, &[7]).await.status,
            Status::InvalidPayload
        );
        assert_eq!(
            module.on_request(Operation::Read, 8, &[]).await.status,
            Status::NoValue
        );
        assert_eq!(
            module.on_request(Operation::Reserved, 0, &[]).await.status,
            Status::UnknownOperation
        );
        assert_eq!(
            module.on_request(Operation::Transfer, 8, &[]).await.status,
            Status::Unsupported
        );
        probe.set_wire_breaks(0b0001);
        assert_eq!(
            module.on_request(Operation::Read, 0, &[]).await.status,
            Status::FaultedChannel
        );
    }

    #[tokio::test]
    async fn describe_and_probe() {
        let (mut module, _) = digital_module();
        let probe = module.on_request(Operation::Probe, 0, &[]).await;
        assert_eq!(probe.data, identity().probe_data());

        let last = module.on_request(Operation::Describe, 5, &[]).await;
        assert_eq!(last, Response::ok(vec![6, 9, ChannelKind::Relay.code()]));
        assert_eq!(
            module.on_request(Operation::Describe, 6, &[]).await.status,
            Status::InvalidChannel
        );
    }

    #[tokio::test]
    async fn poll_reports_changes_once() {
        let (mut module, probe) = digital_module();
        module.initialize().await.unwrap();

        probe.set_inputs(0b0010);
        module.cycle(Instant::now()).await;
        module.on_request(Operation::Write, 8, &[1]).await;

        let mask = module.on_request(Operation::Poll, 0, &[]).await;
        assert_eq!(mask.data, ((1u32 << 1) | (1 << 8)).to_le_bytes().to_vec());
        let again = module.on_request(Operation::Poll, 0, &[]).await;
        assert_eq!(again.data, 0u32.to_le_bytes().to_vec());
    }

    #[test]
    fn channel_ids_are_unique_and_bounded() {
        let (mut module, _) = digital_module();
        let chip: SharedChip<dyn DiagnosticInputChip> = SharedChip::new(
            Box::new(FakeInputChip::new(ChipSelect::Pin(1))),
            Duration::ZERO,
        );
        let dup = DigitalInput::new("dup", InputSource::Chip(chip.clone(), 0));
        assert!(module.attach(2, Box::new(dup)).is_err());
        let far = DigitalInput::new("far", InputSource::Chip(chip, 0));
        assert!(module.attach(MAX_CHANNELS, Box::new(far)).is_err());
    }

    #[tokio::test]
    async fn initialize_reports_faulted_input() {
        let (mut module, probe) = digital_module();
        probe.set_wire_breaks(0b1000);
        assert!(matches!(module.initialize().await, Err(Error::Interface(_))));
    }
}
