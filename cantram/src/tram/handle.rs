//! Command interface to a running [`TramCore`](super::TramCore).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::directory::Directory;
use super::pending::ReplySender;
use super::service::CoreState;
use super::stats::{BusEvent, BusStats, StatsSnapshot};
use super::value::{decode_read, encode_write};
use super::{Address, Operation, Status};
use crate::error::{Error, Result};
use crate::interface::{ChannelKind, Value};
use crate::module::{ModuleIdentity, TramModule};

/// A response as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub tag: u8,
    pub status: Status,
    pub data: Vec<u8>,
}

impl Reply {
    /// Response data, or the status as an error.
    pub fn into_data(self, address: Address, channel: u8) -> Result<Vec<u8>> {
        match self.status {
            Status::Ok => Ok(self.data),
            Status::Unsupported => Err(Error::Unsupported { address, channel }),
            Status::FaultedChannel => Err(Error::FaultedChannel { address, channel }),
            status => Err(Error::Rejected { address, status }),
        }
    }
}

/// Commands accepted by the service loop.
pub(crate) enum Command {
    Submit {
        id: u64,
        operation: Operation,
        address: Address,
        field: u8,
        data: Vec<u8>,
        reply: ReplySender,
    },
    Cancel {
        address: Address,
        id: u64,
    },
    Enumerate {
        reply: oneshot::Sender<Result<Directory>>,
    },
    Assign {
        id: u64,
        uid: u32,
        address: Address,
        reply: ReplySender,
    },
    Register {
        module: Box<dyn TramModule>,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// An outstanding request.
#[derive(Debug)]
pub struct Ticket {
    id: u64,
    address: Address,
    rx: oneshot::Receiver<Result<Reply>>,
}

impl Ticket {
    pub fn address(&self) -> Address {
        self.address
    }

    /// Wait for the response. Always resolves: the core answers every
    /// request with a reply, a timeout or a cancellation.
    pub async fn wait(self) -> Result<Reply> {
        self.rx.await.map_err(|_| Error::Stopped)?
    }
}

/// Cloneable handle to one bus.
#[derive(Clone)]
pub struct TramHandle {
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<BusEvent>,
    state: watch::Receiver<CoreState>,
    directory: watch::Receiver<Directory>,
    stats: Arc<BusStats>,
    next_id: Arc<AtomicU64>,
    submit_timeout: Duration,
}

impl TramHandle {
    pub(crate) fn new(
        cmd_tx: mpsc::Sender<Command>,
        events: broadcast::Sender<BusEvent>,
        state: watch::Receiver<CoreState>,
        directory: watch::Receiver<Directory>,
        stats: Arc<BusStats>,
        submit_timeout: Duration,
    ) -> Self {
        Self {
            cmd_tx,
            events,
            state,
            directory,
            stats,
            next_id: Arc::new(AtomicU64::new(1)),
            submit_timeout,
        }
    }

    async fn send(&self, command: Command, address: Address) -> Result<()> {
        match tokio::time::timeout(self.submit_timeout, self.cmd_tx.send(command)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Stopped),
            Err(_) => Err(Error::Busy(address)),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Hand a request to the core without waiting for the response.
    pub async fn submit(
        &self,
        address: Address,
        operation: Operation,
        field: u8,
        data: &[u8],
    ) -> Result<Ticket> {
        let id = self.next_id();
        let (reply, rx) = oneshot::channel();
        let command = Command::Submit {
            id,
            operation,
            address,
            field,
            data: data.to_vec(),
            reply,
        };
        self.send(command, address).await?;
        Ok(Ticket { id, address, rx })
    }

    /// Send one request and wait for its response.
    pub async fn request(
        &self,
        address: Address,
        operation: Operation,
        field: u8,
        data: &[u8],
    ) -> Result<Reply> {
        self.submit(address, operation, field, data)
            .await?
            .wait()
            .await
    }

    /// Withdraw an outstanding request. A response that still arrives is
    /// dropped and counted as late.
    pub async fn cancel(&self, ticket: &Ticket) -> Result<()> {
        let command = Command::Cancel {
            address: ticket.address,
            id: ticket.id,
        };
        self.send(command, ticket.address).await
    }

    /// Read a channel of a module whose channel kind is `kind`.
    pub async fn read(&self, address: Address, channel: u8, kind: ChannelKind) -> Result<Value> {
        let data = self
            .request(address, Operation::Read, channel, &[])
            .await?
            .into_data(address, channel)?;
        decode_read(kind, &data).ok_or_else(|| {
            Error::MalformedFrame(format!(
                "{} value from {} channel {}: {}",
                kind,
                address,
                channel,
                hex::encode(&data)
            ))
        })
    }

    pub async fn write(&self, address: Address, channel: u8, value: &Value) -> Result<()> {
        self.request(address, Operation::Write, channel, &encode_write(value))
            .await?
            .into_data(address, channel)
            .map(|_| ())
    }

    /// Every `(channel, kind)` pair a module reports.
    pub async fn describe(&self, address: Address) -> Result<Vec<(u8, ChannelKind)>> {
        let mut capabilities = Vec::new();
        let mut index = 0u8;
        loop {
            let reply = self
                .request(address, Operation::Describe, index, &[])
                .await?;
            if index == 0 && reply.status == Status::InvalidChannel {
                // No channels at all
                return Ok(capabilities);
            }
            let data = reply.into_data(address, index)?;
            let [count, channel, kind] = data[..] else {
                return Err(Error::MalformedFrame(format!(
                    "describe answer from {}: {}",
                    address,
                    hex::encode(&data)
                )));
            };
            let kind = ChannelKind::from_repr(kind).ok_or_else(|| {
                Error::MalformedFrame(format!("channel kind {} from {}", kind, address))
            })?;
            capabilities.push((channel, kind));
            index += 1;
            if index >= count {
                return Ok(capabilities);
            }
        }
    }

    /// Identify the module at `address`.
    pub async fn probe(&self, address: Address) -> Result<(u32, u8)> {
        let data = self
            .request(address, Operation::Probe, 0, &[])
            .await?
            .into_data(address, 0)?;
        ModuleIdentity::parse_probe(&data)
            .ok_or_else(|| Error::MalformedFrame(format!("probe answer from {}", address)))
    }

    /// Channels changed since the last poll, as a bit mask.
    pub async fn poll(&self, address: Address) -> Result<u32> {
        let data = self
            .request(address, Operation::Poll, 0, &[])
            .await?
            .into_data(address, 0)?;
        let bytes: [u8; 4] = data[..]
            .try_into()
            .map_err(|_| Error::MalformedFrame(format!("poll answer from {}", address)))?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Byte pass-through on a bus channel.
    pub async fn transfer(&self, address: Address, channel: u8, out: &[u8]) -> Result<Vec<u8>> {
        self.request(address, Operation::Transfer, channel, out)
            .await?
            .into_data(address, channel)
    }

    /// Probe the bus and rebuild the directory.
    pub async fn enumerate(&self) -> Result<Directory> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Enumerate { reply }, Address::BROADCAST)
            .await?;
        rx.await.map_err(|_| Error::Stopped)?
    }

    /// Move the module with `uid` to `address`. Fails with
    /// [`Error::DuplicateAddress`] if the address is held by another module
    /// or contested.
    pub async fn assign_address(&self, uid: u32, address: Address) -> Result<()> {
        let id = self.next_id();
        let (reply, rx) = oneshot::channel();
        self.send(
            Command::Assign {
                id,
                uid,
                address,
                reply,
            },
            address,
        )
        .await?;
        let reply = rx.await.map_err(|_| Error::Stopped)??;
        match reply.status {
            Status::Ok => Ok(()),
            Status::AddressInUse => Err(Error::DuplicateAddress(address)),
            status => Err(Error::Rejected { address, status }),
        }
    }

    /// Serve a module from this core.
    pub async fn register(&self, module: Box<dyn TramModule>) -> Result<()> {
        let address = module.address();
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register { module, reply }, address)
            .await?;
        rx.await.map_err(|_| Error::Stopped)?
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// Directory as of the last enumeration or assignment.
    pub fn directory(&self) -> Directory {
        self.directory.borrow().clone()
    }

    pub fn state(&self) -> CoreState {
        *self.state.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_status_maps_to_errors() {
        let address = Address::new(0x10).unwrap();
        let reply = |status| Reply {
            tag: 1,
            status,
            data: vec![1],
        };
        assert_eq!(reply(Status::Ok).into_data(address, 2).unwrap(), vec![1]);
        assert!(matches!(
            reply(Status::FaultedChannel).into_data(address, 2),
            Err(Error::FaultedChannel { channel: 2, .. })
        ));
        assert!(matches!(
            reply(Status::Unsupported).into_data(address, 2),
            Err(Error::Unsupported { .. })
        ));
        assert!(matches!(
            reply(Status::NoValue).into_data(address, 2),
            Err(Error::Rejected {
                status: Status::NoValue,
                ..
            })
        ));
    }
}
