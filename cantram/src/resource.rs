//! Hardware resource arena with fail-fast leases.
//!
//! Platform drivers are attached to a [`ResourceTable`] once at bring-up and
//! live there for the rest of the process. Consumers never hold the driver
//! itself; they hold a [`Lease`], an opaque handle naming the slot plus a
//! generation token. Acquisition is exclusive and never waits: asking for a
//! peripheral somebody else holds is a wiring mistake, so it is reported
//! immediately as [`ResourceError::Busy`].

use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strum::Display;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::hw_trait::{CanBus, I2c, Pwm, Uart};
use crate::tracing::prelude::*;

new_key_type! {
    /// Slot of one physical peripheral in the table.
    pub struct ResourceId;
}

/// Peripheral class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ResourceKind {
    #[strum(to_string = "CAN")]
    Can,
    #[strum(to_string = "I2C")]
    I2c,
    #[strum(to_string = "PWM")]
    Pwm,
    #[strum(to_string = "UART")]
    Uart,
}

/// Who holds a lease. Used for arbitration and log messages only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner(String);

impl Owner {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("{kind} resource '{label}' already held by {holder}")]
    Busy {
        kind: ResourceKind,
        label: String,
        holder: Owner,
    },

    #[error("No {0} resource attached")]
    NotAttached(ResourceKind),

    #[error("Lease on {0} resource is no longer valid")]
    StaleLease(ResourceKind),

    #[error("No resource attached as {0:?}")]
    UnknownResource(ResourceId),

    #[error("Resource is {actual}, expected {expected}")]
    KindMismatch {
        expected: ResourceKind,
        actual: ResourceKind,
    },
}

/// A platform driver stored in the table.
pub enum Peripheral {
    Can(Box<dyn CanBus>),
    I2c(Box<dyn I2c>),
    Pwm(Box<dyn Pwm>),
    Uart(Box<dyn Uart>),
}

impl Peripheral {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Peripheral::Can(_) => ResourceKind::Can,
            Peripheral::I2c(_) => ResourceKind::I2c,
            Peripheral::Pwm(_) => ResourceKind::Pwm,
            Peripheral::Uart(_) => ResourceKind::Uart,
        }
    }

    pub fn as_can(&mut self) -> Result<&mut dyn CanBus, ResourceError> {
        match self {
            Peripheral::Can(can) => Ok(can.as_mut()),
            other => Err(mismatch(ResourceKind::Can, other.kind())),
        }
    }

    pub fn as_i2c(&mut self) -> Result<&mut dyn I2c, ResourceError> {
        match self {
            Peripheral::I2c(i2c) => Ok(i2c.as_mut()),
            other => Err(mismatch(ResourceKind::I2c, other.kind())),
        }
    }

    pub fn as_pwm(&mut self) -> Result<&mut dyn Pwm, ResourceError> {
        match self {
            Peripheral::Pwm(pwm) => Ok(pwm.as_mut()),
            other => Err(mismatch(ResourceKind::Pwm, other.kind())),
        }
    }

    pub fn as_uart(&mut self) -> Result<&mut dyn Uart, ResourceError> {
        match self {
            Peripheral::Uart(uart) => Ok(uart.as_mut()),
            other => Err(mismatch(ResourceKind::Uart, other.kind())),
        }
    }
}

fn mismatch(expected: ResourceKind, actual: ResourceKind) -> ResourceError {
    ResourceError::KindMismatch { expected, actual }
}

/// Exclusive claim on one slot. Dropping a lease does not release it;
/// call [`ResourceTable::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct Lease {
    id: ResourceId,
    kind: ResourceKind,
    token: u64,
    owner: Owner,
}

impl Lease {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }
}

struct Claim {
    owner: Owner,
    token: u64,
}

struct Slot {
    kind: ResourceKind,
    label: String,
    claim: Option<Claim>,
    device: Arc<AsyncMutex<Peripheral>>,
}

/// Arena of attached peripherals.
pub struct ResourceTable {
    slots: Mutex<SlotMap<ResourceId, Slot>>,
    next_token: AtomicU64,
}

impl Default for ResourceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(SlotMap::with_key()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Attach a platform driver. The table owns it from now on.
    pub fn attach(&self, label: impl Into<String>, peripheral: Peripheral) -> ResourceId {
        let label = label.into();
        let kind = peripheral.kind();
        let id = self.slots.lock().insert(Slot {
            kind,
            label: label.clone(),
            claim: None,
            device: Arc::new(AsyncMutex::new(peripheral)),
        });
        debug!(kind = %kind, label = %label, "Attached hardware resource");
        id
    }

    /// Acquire one specific peripheral.
    pub fn acquire(&self, id: ResourceId, owner: Owner) -> Result<Lease, ResourceError> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(id)
            .ok_or(ResourceError::UnknownResource(id))?;
        self.claim(id, slot, owner)
    }

    /// Acquire the first free peripheral of a kind.
    ///
    /// Fails with `NotAttached` if no peripheral of that kind exists and
    /// with `Busy` (naming one current holder) if all of them are held.
    pub fn acquire_kind(&self, kind: ResourceKind, owner: Owner) -> Result<Lease, ResourceError> {
        let mut slots = self.slots.lock();
        let mut busy = None;
        for (id, slot) in slots.iter_mut().filter(|(_, s)| s.kind == kind) {
            match &slot.claim {
                None => return self.claim(id, slot, owner),
                Some(claim) if busy.is_none() => {
                    busy = Some(ResourceError::Busy {
                        kind,
                        label: slot.label.clone(),
                        holder: claim.owner.clone(),
                    });
                }
                Some(_) => {}
            }
        }
        let err = busy.unwrap_or(ResourceError::NotAttached(kind));
        warn!(kind = %kind, owner = %owner, error = %err, "Hardware resource unavailable");
        Err(err)
    }

    fn claim(&self, id: ResourceId, slot: &mut Slot, owner: Owner) -> Result<Lease, ResourceError> {
        if let Some(claim) = &slot.claim {
            return Err(ResourceError::Busy {
                kind: slot.kind,
                label: slot.label.clone(),
                holder: claim.owner.clone(),
            });
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        slot.claim = Some(Claim {
            owner: owner.clone(),
            token,
        });
        debug!(kind = %slot.kind, label = %slot.label, owner = %owner, "Hardware resource acquired");
        Ok(Lease {
            id,
            kind: slot.kind,
            token,
            owner,
        })
    }

    /// Release a lease. Releasing twice, or releasing a lease that was
    /// already invalidated by [`reset`](Self::reset), is a no-op.
    pub fn release(&self, lease: &Lease) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(lease.id) {
            if slot.claim.as_ref().is_some_and(|c| c.token == lease.token) {
                slot.claim = None;
                debug!(kind = %slot.kind, label = %slot.label, owner = %lease.owner, "Hardware resource released");
            }
        }
    }

    /// Current holder of a slot.
    pub fn holder(&self, id: ResourceId) -> Option<Owner> {
        self.slots
            .lock()
            .get(id)
            .and_then(|slot| slot.claim.as_ref().map(|c| c.owner.clone()))
    }

    /// Whether the lease still grants access.
    pub fn is_valid(&self, lease: &Lease) -> bool {
        self.slots
            .lock()
            .get(lease.id)
            .and_then(|slot| slot.claim.as_ref())
            .is_some_and(|claim| claim.token == lease.token)
    }

    /// Drop every claim. Outstanding leases become stale.
    pub fn reset(&self) {
        let mut slots = self.slots.lock();
        for (_, slot) in slots.iter_mut() {
            slot.claim = None;
        }
        info!(resources = slots.len(), "Hardware resource table reset");
    }

    /// Lock the peripheral behind a valid lease.
    ///
    /// The returned guard keeps the driver locked; the lease is checked
    /// once, when the guard is taken.
    pub async fn lock(&self, lease: &Lease) -> Result<OwnedMutexGuard<Peripheral>, ResourceError> {
        let device = {
            let slots = self.slots.lock();
            let slot = slots
                .get(lease.id)
                .filter(|slot| slot.claim.as_ref().is_some_and(|c| c.token == lease.token))
                .ok_or(ResourceError::StaleLease(lease.kind))?;
            slot.device.clone()
        };
        Ok(device.lock_owned().await)
    }
}
