//! Tram frame encoding.
//!
//! Standard 11-bit identifier:
//!
//! ```text
//!  10   9..7     6..0
//! dir   op       address
//! ```
//!
//! `dir` is 0 for requests, 1 for responses; address `0x7F` is broadcast.
//!
//! Payload, 3 to 8 bytes:
//!
//! ```text
//! [tag, field, data (0..=5), crc8]
//! ```
//!
//! `field` is the channel (or argument) of a request and the status code
//! of a response. `crc8` is CRC-8 (poly 0x07, init 0) over the two
//! identifier bytes, big endian, followed by tag, field and data.

use bitvec::prelude::*;
use crc_all::Crc;
use thiserror::Error;

use super::{Address, Direction, Operation, Status};
use crate::hw_trait::CanFrame;

/// Largest data section of one frame.
pub const MAX_DATA: usize = 5;

const MIN_PAYLOAD: usize = 3;

/// Reasons a received CAN frame is not a tram frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("extended identifier")]
    Extended,

    #[error("remote frame")]
    Remote,

    #[error("flagged by the transport")]
    Flagged,

    #[error("payload of {0} bytes is too short")]
    TooShort(usize),

    #[error("checksum 0x{actual:02x}, expected 0x{expected:02x}")]
    Checksum { expected: u8, actual: u8 },

    #[error("unknown status code {0}")]
    UnknownStatus(u8),
}

/// A decoded tram frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TramFrame {
    pub direction: Direction,
    pub operation: Operation,
    pub address: Address,
    pub tag: u8,
    pub field: u8,
    data: [u8; MAX_DATA],
    len: u8,
}

impl TramFrame {
    /// Returns `None` if `data` does not fit in one frame.
    pub fn request(
        operation: Operation,
        address: Address,
        tag: u8,
        field: u8,
        data: &[u8],
    ) -> Option<Self> {
        Self::build(Direction::Request, operation, address, tag, field, data)
    }

    pub fn response(
        operation: Operation,
        address: Address,
        tag: u8,
        status: Status,
        data: &[u8],
    ) -> Option<Self> {
        Self::build(
            Direction::Response,
            operation,
            address,
            tag,
            status.code(),
            data,
        )
    }

    fn build(
        direction: Direction,
        operation: Operation,
        address: Address,
        tag: u8,
        field: u8,
        data: &[u8],
    ) -> Option<Self> {
        if data.len() > MAX_DATA {
            return None;
        }
        let mut buf = [0u8; MAX_DATA];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            direction,
            operation,
            address,
            tag,
            field,
            data: buf,
            len: data.len() as u8,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Status of a response frame.
    pub fn status(&self) -> Option<Status> {
        Status::from_repr(self.field)
    }

    fn identifier(&self) -> u16 {
        IdentifierBuilder::new()
            .with_direction(self.direction)
            .with_operation(self.operation)
            .with_address(self.address)
            .build()
    }

    pub fn encode(&self) -> CanFrame {
        let id = self.identifier();
        let mut payload = Vec::with_capacity(MIN_PAYLOAD + MAX_DATA);
        payload.push(self.tag);
        payload.push(self.field);
        payload.extend_from_slice(self.data());
        payload.push(crc8(id, &payload));
        CanFrame::standard(id, &payload)
    }

    pub fn decode(frame: &CanFrame) -> Result<Self, FrameError> {
        if frame.is_error() {
            return Err(FrameError::Flagged);
        }
        if frame.is_extended() {
            return Err(FrameError::Extended);
        }
        if frame.is_remote() {
            return Err(FrameError::Remote);
        }
        let payload = frame.data();
        if payload.len() < MIN_PAYLOAD {
            return Err(FrameError::TooShort(payload.len()));
        }

        let id = frame.id() as u16;
        let (body, crc) = payload.split_at(payload.len() - 1);
        let expected = crc8(id, body);
        if crc[0] != expected {
            return Err(FrameError::Checksum {
                expected,
                actual: crc[0],
            });
        }

        let bits = id.view_bits::<Lsb0>();
        let address = Address::from_wire(bits[0..7].load::<u8>());
        let operation = Operation::from_repr(bits[7..10].load::<u8>()).unwrap_or(Operation::Reserved);
        let direction = if bits[10] {
            Direction::Response
        } else {
            Direction::Request
        };

        let field = body[1];
        if direction == Direction::Response && Status::from_repr(field).is_none() {
            return Err(FrameError::UnknownStatus(field));
        }

        // Payload is at most 8 bytes, so data is at most MAX_DATA
        Self::build(direction, operation, address, body[0], field, &body[2..])
            .ok_or(FrameError::TooShort(payload.len()))
    }
}

struct IdentifierBuilder {
    id: u16,
}

impl IdentifierBuilder {
    fn new() -> Self {
        Self { id: 0 }
    }

    fn with_direction(mut self, direction: Direction) -> Self {
        let view = self.id.view_bits_mut::<Lsb0>();
        view.set(10, direction == Direction::Response);
        self
    }

    fn with_operation(mut self, operation: Operation) -> Self {
        let view = self.id.view_bits_mut::<Lsb0>();
        view[7..10].store(operation as u8);
        self
    }

    fn with_address(mut self, address: Address) -> Self {
        let view = self.id.view_bits_mut::<Lsb0>();
        view[0..7].store(address.raw());
        self
    }

    fn build(self) -> u16 {
        self.id
    }
}

fn crc8(id: u16, bytes: &[u8]) -> u8 {
    const POLYNOMIAL: u8 = 0x07;
    const WIDTH: usize = 8;
    const INITIAL: u8 = 0x00;
    const XOR: u8 = 0;
    const REFLECT: bool = false;
    let mut crc8 = Crc::<u8>::new(POLYNOMIAL, WIDTH, INITIAL, XOR, REFLECT);

    crc8.update(&id.to_be_bytes());
    crc8.update(bytes);
    crc8.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn addr(raw: u8) -> Address {
        Address::new(raw).unwrap()
    }

    #[test_case(Direction::Request, Operation::Read, 0x10, 0x110; "read request to 0x10")]
    #[test_case(Direction::Response, Operation::Read, 0x10, 0x510; "read response from 0x10")]
    #[test_case(Direction::Request, Operation::Probe, 0x7f, 0x07f; "broadcast probe")]
    #[test_case(Direction::Request, Operation::Assign, 0x7f, 0x37f; "broadcast assign")]
    fn identifier_layout(direction: Direction, operation: Operation, address: u8, expected: u16) {
        let id = IdentifierBuilder::new()
            .with_direction(direction)
            .with_operation(operation)
            .with_address(Address::from_wire(address))
            .build();
        assert_eq!(id, expected, "{:03x}", id);
    }

    #[test]
    fn crc_matches_reference() {
        // CRC-8/SMBUS check value
        let mut crc = Crc::<u8>::new(0x07, 8, 0, 0, false);
        crc.update(b"123456789");
        assert_eq!(crc.finish(), 0xf4);
    }

    #[test]
    fn read_request_encoding() {
        let frame = TramFrame::request(Operation::Read, addr(0x10), 0x2a, 2, &[]).unwrap();
        let can = frame.encode();
        assert_eq!(can.id(), 0x110);
        assert_eq!(&can.data()[..2], &[0x2a, 0x02]);
        assert_eq!(can.data()[2], crc8(0x110, &[0x2a, 0x02]));
        assert_eq!(TramFrame::decode(&can).unwrap(), frame);
    }

    #[test]
    fn response_carries_status() {
        let frame =
            TramFrame::response(Operation::Read, addr(0x10), 7, Status::Ok, &[1]).unwrap();
        let decoded = TramFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.direction, Direction::Response);
        assert_eq!(decoded.status(), Some(Status::Ok));
        assert_eq!(decoded.data(), &[1]);
    }

    #[test]
    fn oversized_data_is_refused() {
        assert!(TramFrame::request(Operation::Write, addr(1), 0, 0, &[0; 6]).is_none());
        assert!(TramFrame::request(Operation::Write, addr(1), 0, 0, &[0; 5]).is_some());
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let can = TramFrame::request(Operation::Read, addr(0x10), 1, 2, &[])
            .unwrap()
            .encode();
        let mut payload = can.data().to_vec();
        payload[1] ^= 0x01;
        let tampered = CanFrame::new(can.id() as u16, &payload).unwrap();
        assert!(matches!(
            TramFrame::decode(&tampered),
            Err(FrameError::Checksum { .. })
        ));
    }

    #[test]
    fn checksum_covers_identifier() {
        let can = TramFrame::request(Operation::Read, addr(0x10), 1, 2, &[])
            .unwrap()
            .encode();
        let moved = CanFrame::new(0x111, can.data()).unwrap();
        assert!(TramFrame::decode(&moved).is_err());
    }

    #[test_case(CanFrame::new(0x110, &[1, 2]).unwrap(), FrameError::TooShort(2); "short")]
    #[test_case(CanFrame::new_extended(0x110, &[1, 2, 3]).unwrap(), FrameError::Extended; "extended")]
    #[test_case(CanFrame::new_remote(0x110, 3).unwrap(), FrameError::Remote; "remote")]
    #[test_case(CanFrame::new(0x110, &[1, 2, 3]).unwrap().with_error(), FrameError::Flagged; "flagged")]
    fn malformed_frames(frame: CanFrame, expected: FrameError) {
        assert_eq!(TramFrame::decode(&frame), Err(expected));
    }

    #[test]
    fn unknown_status_is_malformed() {
        let id = 0x510u16;
        let body = [1u8, 42];
        let payload = [body[0], body[1], crc8(id, &body)];
        let can = CanFrame::new(id, &payload).unwrap();
        assert_eq!(TramFrame::decode(&can), Err(FrameError::UnknownStatus(42)));
    }
}
