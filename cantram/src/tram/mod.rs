//! The tram protocol: addressed request/response over a shared CAN bus.
//!
//! One [`TramCore`] runs per CAN controller. It owns the CAN lease, the
//! directory of modules present on the bus, the local modules it answers
//! for, and the table of requests waiting for a response. Everything else
//! talks to it through a cloneable [`TramHandle`].
//!
//! Frame layout and codes are in [`frame`]; value encodings in [`value`].

use serde::Serialize;
use std::fmt;
use strum::{Display, FromRepr};

use crate::interface::InterfaceError;
use crate::provider::ProviderError;
use crate::resource::ResourceError;

pub mod directory;
pub mod frame;
pub mod handle;
pub mod pending;
pub mod service;
pub mod stats;
pub mod value;


pub use service::{CoreState, TramCore};
pub use directory::{Directory, ModuleEntry};
pub use frame::{FrameError, TramFrame};
pub use handle::{Reply, Ticket, TramHandle};
pub use stats::{BusEvent, BusStats, StatsSnapshot};

/// Bus address of a module. `0x7F` is broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Address(u8);

impl Address {
    pub const BROADCAST: Address = Address(0x7f);

    /// A module address (`0x00..=0x7E`).
    pub fn new(raw: u8) -> Option<Self> {
        (raw < Self::BROADCAST.0).then_some(Address(raw))
    }

    /// Any 7-bit value, broadcast included.
    pub(crate) fn from_wire(raw: u8) -> Self {
        Address(raw & 0x7f)
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// Operation code, 3 bits of the identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
pub enum Operation {
    Probe = 0,
    Describe = 1,
    Read = 2,
    Write = 3,
    Poll = 4,
    Transfer = 5,
    Assign = 6,
    Reserved = 7,
}

/// Frame direction, top bit of the identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Request,
    Response,
}

/// Status code carried in the field byte of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, Serialize)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    UnknownOperation = 1,
    InvalidChannel = 2,
    Unsupported = 3,
    FaultedChannel = 4,
    InvalidPayload = 5,
    ResourceBusy = 6,
    Hardware = 7,
    Timeout = 8,
    NoValue = 9,
    AddressInUse = 10,
}

impl Status {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<&ResourceError> for Status {
    fn from(error: &ResourceError) -> Self {
        match error {
            ResourceError::Busy { .. } => Status::ResourceBusy,
            _ => Status::Hardware,
        }
    }
}

impl From<&InterfaceError> for Status {
    fn from(error: &InterfaceError) -> Self {
        match error {
            InterfaceError::Unsupported { .. } => Status::Unsupported,
            InterfaceError::Faulted(_) => Status::FaultedChannel,
            InterfaceError::NoValue => Status::NoValue,
            InterfaceError::InvalidValue { .. } | InterfaceError::InvalidTransfer(_) => {
                Status::InvalidPayload
            }
            InterfaceError::Resource(e) => e.into(),
            InterfaceError::Provider(ProviderError::Resource(e)) => e.into(),
            InterfaceError::Provider(_) | InterfaceError::Chip(_) | InterfaceError::Hardware(_) => {
                Status::Hardware
            }
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::resource::{Owner, ResourceKind};
    use test_case::test_case;

    #[test]
    fn address_range() {
        assert_eq!(Address::new(0x7e).map(Address::raw), Some(0x7e));
        assert_eq!(Address::new(0x7f), None);
        assert!(Address::from_wire(0xff).is_broadcast());
        assert_eq!(Address::new(0x05).unwrap().to_string(), "0x05");
    }

    #[test_case(InterfaceError::NoValue, Status::NoValue; "no value")]
    #[test_case(InterfaceError::Faulted("DI0".into()), Status::FaultedChannel; "faulted")]
    #[test_case(InterfaceError::InvalidTransfer("x"), Status::InvalidPayload; "bad transfer")]
    #[test_case(
        InterfaceError::Resource(ResourceError::Busy {
            kind: ResourceKind::I2c,
            label: "i2c0".into(),
            holder: Owner::new("a"),
        }),
        Status::ResourceBusy;
        "busy"
    )]
    fn interface_errors_map_to_status(error: InterfaceError, expected: Status) {
        assert_eq!(Status::from(&error), expected);
    }

    #[test]
    fn codes_round_trip_through_repr() {
        assert_eq!(Status::from_repr(10), Some(Status::AddressInUse));
        assert_eq!(Status::from_repr(11), None);
        assert_eq!(Operation::from_repr(6), Some(Operation::Assign));
    }
}
