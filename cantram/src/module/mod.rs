//! Tram modules: the protocol participants behind a bus address.
//!
//! A module is a pure responder. The core hands it one decoded request at
//! a time and sends back exactly one response built from the returned
//! [`Response`]; decode failures become an error status, never silence.

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;

use crate::interface::ChannelKind;
use crate::tram::{Address, Operation, Status};

mod channel_module;

pub use channel_module::{ChannelModule, MAX_CHANNELS};

/// Identification a module reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleIdentity {
    pub hw_type: String,
    pub hw_version: String,
    pub fw_version: String,
    /// Factory-unique id, used to tell boards sharing an address apart
    pub uid: u32,
    /// Board family code reported by `PROBE`
    pub type_code: u8,
}

impl ModuleIdentity {
    /// `PROBE` response data: uid little endian, then the type code.
    pub fn probe_data(&self) -> Vec<u8> {
        let mut data = self.uid.to_le_bytes().to_vec();
        data.push(self.type_code);
        data
    }

    /// Parse `PROBE` response data.
    pub fn parse_probe(data: &[u8]) -> Option<(u32, u8)> {
        let [a, b, c, d, type_code] = data else {
            return None;
        };
        Some((u32::from_le_bytes([*a, *b, *c, *d]), *type_code))
    }
}

/// What a module answers to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub data: Vec<u8>,
}

impl Response {
    pub fn ok(data: Vec<u8>) -> Self {
        Self {
            status: Status::Ok,
            data,
        }
    }

    pub fn error(status: Status) -> Self {
        Self {
            status,
            data: Vec::new(),
        }
    }
}

/// A protocol participant.
#[async_trait]
pub trait TramModule: Send {
    fn identity(&self) -> &ModuleIdentity;

    fn address(&self) -> Address;

    /// Only the core calls this, after checking the address is free.
    fn set_address(&mut self, address: Address);

    /// `(channel, kind)` pairs in channel order.
    fn describe_capabilities(&self) -> Vec<(u8, ChannelKind)>;

    /// Answer one request. Must not take longer than the module deadline.
    async fn on_request(&mut self, operation: Operation, field: u8, data: &[u8]) -> Response;

    /// One-time bring-up, run before the bus is served.
    async fn initialize(&mut self) -> crate::Result<()> {
        Ok(())
    }

    /// Periodic work (deferred writes, change tracking).
    async fn cycle(&mut self, _now: Instant) {}

    /// Earliest instant at which [`cycle`](Self::cycle) has deferred work.
    fn next_deadline(&self) -> Option<Instant> {
        None
    }
}

/// `DESCRIBE` response data for capability `index`: `[count, channel, kind]`.
pub fn describe_data(capabilities: &[(u8, ChannelKind)], index: u8) -> Option<Vec<u8>> {
    let (channel, kind) = capabilities.get(index as usize)?;
    Some(vec![capabilities.len() as u8, *channel, kind.code()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_data_layout() {
        let identity = ModuleIdentity {
            hw_type: "DigitalModule".into(),
            hw_version: "1.0".into(),
            fw_version: "0.3.0".into(),
            uid: 0x1234_5678,
            type_code: 2,
        };
        let data = identity.probe_data();
        assert_eq!(data, vec![0x78, 0x56, 0x34, 0x12, 2]);
        assert_eq!(ModuleIdentity::parse_probe(&data), Some((0x1234_5678, 2)));
        assert_eq!(ModuleIdentity::parse_probe(&data[..4]), None);
    }

    #[test]
    fn describe_walks_capabilities() {
        let caps = [(0, ChannelKind::DigitalInput), (2, ChannelKind::Relay)];
        assert_eq!(describe_data(&caps, 1), Some(vec![2, 2, 4]));
        assert_eq!(describe_data(&caps, 2), None);
    }
}
