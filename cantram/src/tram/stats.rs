//! Bus counters and events.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use super::Address;

/// Something observers of the bus may want to react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    /// A module answered enumeration at an address not known before
    ModuleJoined {
        address: Address,
        uid: u32,
        type_code: u8,
    },
    /// A known module no longer answers enumeration
    ModuleLeft { address: Address, uid: u32 },
    /// One of several boards claiming the same address
    DuplicateAddress { address: Address, uid: u32 },
    /// A module moved to a new address; `from` is unknown for a module
    /// that was not in the directory
    AddressAssigned {
        uid: u32,
        from: Option<Address>,
        to: Address,
    },
    EnumerationComplete { modules: usize },
}

/// Counters updated by the service loop.
#[derive(Debug, Default)]
pub struct BusStats {
    malformed_frames: AtomicU64,
    unknown_address_frames: AtomicU64,
    late_responses: AtomicU64,
    timeouts: AtomicU64,
    duplicate_address_events: AtomicU64,
    requests_served: AtomicU64,
    requests_completed: AtomicU64,
}

/// Point-in-time copy of [`BusStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub malformed_frames: u64,
    pub unknown_address_frames: u64,
    pub late_responses: u64,
    pub timeouts: u64,
    pub duplicate_address_events: u64,
    /// Requests answered by local modules
    pub requests_served: u64,
    /// Requests of our own that got a response
    pub requests_completed: u64,
}

impl BusStats {
    pub fn malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_address(&self) {
        self.unknown_address_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn late_response(&self) {
        self.late_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_addresses(&self, claimants: u64) {
        self.duplicate_address_events
            .fetch_add(claimants, Ordering::Relaxed);
    }

    pub fn request_served(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            unknown_address_frames: self.unknown_address_frames.load(Ordering::Relaxed),
            late_responses: self.late_responses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            duplicate_address_events: self.duplicate_address_events.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
        }
    }
}
