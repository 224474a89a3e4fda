//! Modules known to be present on the bus.

use serde::Serialize;
use std::collections::BTreeMap;

use super::Address;

/// One module found by enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModuleEntry {
    pub address: Address,
    pub uid: u32,
    pub type_code: u8,
    /// Served by this core rather than a remote node
    pub local: bool,
}

/// Address-keyed module directory. Addresses claimed by more than one
/// board are never entered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Directory {
    entries: BTreeMap<Address, ModuleEntry>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: Address) -> Option<&ModuleEntry> {
        self.entries.get(&address)
    }

    pub fn contains(&self, address: Address) -> bool {
        self.entries.contains_key(&address)
    }

    pub fn by_uid(&self, uid: u32) -> Option<&ModuleEntry> {
        self.entries.values().find(|e| e.uid == uid)
    }

    /// Insert or replace; returns the previous entry at that address.
    pub fn insert(&mut self, entry: ModuleEntry) -> Option<ModuleEntry> {
        self.entries.insert(entry.address, entry)
    }

    pub fn remove(&mut self, address: Address) -> Option<ModuleEntry> {
        self.entries.remove(&address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleEntry> {
        self.entries.values()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.entries.keys().copied().collect()
    }
}
