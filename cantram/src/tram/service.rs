//! The bus service loop.
//!
//! [`TramCore::run`] owns everything that touches the CAN controller. It
//! races one receive against handle commands, the earliest pending
//! deadline and the module cycle tick, and handles whichever comes first.
//! Received frames are dispatched in every state; requests queued by
//! handles wait while an enumeration is collecting answers.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::directory::{Directory, ModuleEntry};
use super::frame::{TramFrame, MAX_DATA};
use super::handle::{Command, Reply, TramHandle};
use super::pending::{Outbound, PendingTable};
use super::stats::{BusEvent, BusStats};
use super::{Address, Direction, Operation, Status};
use crate::config::BusConfig;
use crate::error::{Error, Result};
use crate::hw_trait::{CanFrame, HwError};
use crate::module::{ModuleIdentity, Response, TramModule};
use crate::resource::{Lease, ResourceError, ResourceKind, ResourceTable};
use crate::tracing::prelude::*;

const COMMAND_QUEUE: usize = 64;
const EVENT_CAPACITY: usize = 128;

/// What the core is doing, as published to handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CoreState {
    Idle,
    /// Requests on the bus waiting for their response
    AwaitingResponse { outstanding: usize },
    Enumerating,
}

struct Enumeration {
    tag: u8,
    deadline: Instant,
    // address -> uid -> type code
    claims: BTreeMap<Address, BTreeMap<u32, u8>>,
    waiters: Vec<oneshot::Sender<Result<Directory>>>,
}

/// Tram protocol engine for one CAN controller.
pub struct TramCore {
    config: BusConfig,
    resources: Arc<ResourceTable>,
    can: Lease,
    modules: Vec<Box<dyn TramModule>>,
    directory: Directory,
    /// Addresses with more than one claimant at the last enumeration
    excluded: BTreeSet<Address>,
    pending: PendingTable,
    enumeration: Option<Enumeration>,
    next_tag: u8,
    stats: Arc<BusStats>,
    events: broadcast::Sender<BusEvent>,
    state_tx: watch::Sender<CoreState>,
    directory_tx: watch::Sender<Directory>,
    cmd_rx: mpsc::Receiver<Command>,
    handle: TramHandle,
}

async fn receive_frame(resources: &ResourceTable, can: &Lease) -> Result<CanFrame> {
    let mut guard = resources.lock(can).await?;
    Ok(guard.as_can()?.receive().await?)
}

async fn transmit_frame(resources: &ResourceTable, can: &Lease, frame: &TramFrame) -> Result<()> {
    let can_frame = frame.encode();
    let mut guard = resources.lock(can).await?;
    guard.as_can()?.transmit(&can_frame).await?;
    trace!(frame = ?can_frame, "Frame sent");
    Ok(())
}

impl TramCore {
    /// Create a core over a CAN lease.
    pub fn new(config: BusConfig, resources: Arc<ResourceTable>, can: Lease) -> Result<Self> {
        if can.kind() != ResourceKind::Can {
            return Err(ResourceError::KindMismatch {
                expected: ResourceKind::Can,
                actual: can.kind(),
            }
            .into());
        }
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(CoreState::Idle);
        let (directory_tx, directory_rx) = watch::channel(Directory::new());
        let stats = Arc::new(BusStats::default());
        let handle = TramHandle::new(
            cmd_tx,
            events.clone(),
            state_rx,
            directory_rx,
            stats.clone(),
            config.submit_timeout(),
        );

        Ok(Self {
            pending: PendingTable::new(config.max_queued_per_address),
            config,
            resources,
            can,
            modules: Vec::new(),
            directory: Directory::new(),
            excluded: BTreeSet::new(),
            enumeration: None,
            next_tag: 0,
            stats,
            events,
            state_tx,
            directory_tx,
            cmd_rx,
            handle,
        })
    }

    pub fn handle(&self) -> TramHandle {
        self.handle.clone()
    }

    /// Serve a module from this core. Its address must not be taken by
    /// another local module.
    pub fn register(&mut self, module: Box<dyn TramModule>) -> Result<()> {
        let address = module.address();
        if address.is_broadcast() {
            return Err(Error::Config(format!(
                "module {} cannot use the broadcast address",
                module.identity().hw_type
            )));
        }
        if self.local_index(address).is_some() {
            return Err(Error::DuplicateAddress(address));
        }
        info!(
            address = %address,
            module = %module.identity().hw_type,
            uid = module.identity().uid,
            "Module registered"
        );
        self.modules.push(module);
        Ok(())
    }

    /// Configure the controller and bring up every local module.
    ///
    /// Module failures are logged and returned; they do not stop the
    /// others.
    pub async fn initialize(&mut self) -> Result<Vec<(Address, Error)>> {
        {
            let mut guard = self.resources.lock(&self.can).await?;
            guard.as_can()?.configure(self.config.bitrate).await?;
        }
        info!(
            bitrate = self.config.bitrate.bits_per_second(),
            modules = self.modules.len(),
            "Tram bus configured"
        );

        let deadline = self.config.module_deadline();
        let mut failures = Vec::new();
        for module in self.modules.iter_mut() {
            let address = module.address();
            match time::timeout(deadline, module.initialize()).await {
                Ok(Ok(())) => debug!(address = %address, "Module initialized"),
                Ok(Err(e)) => {
                    error!(address = %address, error = %e, "Module initialization failed");
                    failures.push((address, e));
                }
                Err(_) => {
                    error!(address = %address, "Module initialization timed out");
                    failures.push((address, Error::Timeout { address, tag: 0 }));
                }
            }
        }
        Ok(failures)
    }

    /// Run the service loop until `cancel` fires or the controller goes
    /// away. Outstanding requests fail with [`Error::Stopped`].
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let mut cycle = time::interval(self.config.cycle_interval());
        cycle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            self.publish_state();
            let deadline = self.next_deadline();

            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),

                received = receive_frame(&self.resources, &self.can) => match received {
                    Ok(frame) => self.handle_frame(frame).await,
                    Err(Error::Hardware(HwError::Disconnected)) => {
                        error!("CAN controller disconnected");
                        break Err(Error::Hardware(HwError::Disconnected));
                    }
                    Err(Error::Resource(e)) => {
                        error!(error = %e, "CAN lease lost");
                        break Err(e.into());
                    }
                    Err(e) => warn!(error = %e, "CAN receive failed"),
                },

                Some(command) = self.cmd_rx.recv() => self.handle_command(command).await,

                _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.handle_deadlines(Instant::now()).await;
                }

                _ = cycle.tick() => self.run_cycle(Instant::now()).await,
            }
        };

        self.shutdown();
        result
    }

    fn shutdown(&mut self) {
        self.cmd_rx.close();
        while let Ok(command) = self.cmd_rx.try_recv() {
            match command {
                Command::Submit { reply, .. } | Command::Assign { reply, .. } => {
                    let _ = reply.send(Err(Error::Stopped));
                }
                Command::Enumerate { reply } => {
                    let _ = reply.send(Err(Error::Stopped));
                }
                Command::Register { reply, .. } => {
                    let _ = reply.send(Err(Error::Stopped));
                }
                Command::Cancel { .. } => {}
            }
        }
        for request in self.pending.drain() {
            request.finish(Err(Error::Stopped));
        }
        if let Some(enumeration) = self.enumeration.take() {
            for waiter in enumeration.waiters {
                let _ = waiter.send(Err(Error::Stopped));
            }
        }
        self.resources.release(&self.can);
        info!("Tram bus service stopped");
    }

    fn publish_state(&self) {
        let state = if self.enumeration.is_some() {
            CoreState::Enumerating
        } else if self.pending.in_flight() > 0 {
            CoreState::AwaitingResponse {
                outstanding: self.pending.in_flight(),
            }
        } else {
            CoreState::Idle
        };
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn next_deadline(&self) -> Option<Instant> {
        let modules = self.modules.iter().filter_map(|m| m.next_deadline());
        let enumeration = self.enumeration.as_ref().map(|e| e.deadline);
        self.pending
            .next_deadline()
            .into_iter()
            .chain(enumeration)
            .chain(modules)
            .min()
    }

    fn next_tag(&mut self) -> u8 {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        tag
    }

    fn emit(&self, event: BusEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn local_index(&self, address: Address) -> Option<usize> {
        self.modules.iter().position(|m| m.address() == address)
    }

    /// Local module answering requests at `address`.
    fn serving(&self, address: Address) -> Option<usize> {
        if self.excluded.contains(&address) {
            return None;
        }
        self.local_index(address)
    }

    async fn transmit(&mut self, frame: &TramFrame) -> Result<()> {
        transmit_frame(&self.resources, &self.can, frame).await
    }

    async fn respond(&mut self, operation: Operation, address: Address, tag: u8, response: Response) {
        let frame = TramFrame::response(operation, address, tag, response.status, &response.data)
            .or_else(|| {
                warn!(address = %address, len = response.data.len(), "Response data does not fit one frame");
                TramFrame::response(operation, address, tag, Status::InvalidPayload, &[])
            });
        let Some(frame) = frame else {
            return;
        };
        if let Err(e) = self.transmit(&frame).await {
            warn!(address = %address, tag, error = %e, "Failed to send response");
        }
    }

    /// Run one request against a local module, bounded by the module
    /// deadline.
    async fn dispatch(
        &mut self,
        index: usize,
        operation: Operation,
        field: u8,
        data: &[u8],
        tag: u8,
    ) -> Result<Response> {
        let deadline = self.config.module_deadline();
        let module = &mut self.modules[index];
        let address = module.address();
        match time::timeout(deadline, module.on_request(operation, field, data)).await {
            Ok(response) => {
                self.stats.request_served();
                trace!(address = %address, op = %operation, field, status = %response.status, "Request served");
                Ok(response)
            }
            Err(_) => {
                self.stats.timeout();
                warn!(address = %address, op = %operation, field, "Module missed its deadline");
                Err(Error::Timeout { address, tag })
            }
        }
    }

    async fn run_cycle(&mut self, now: Instant) {
        let deadline = self.config.module_deadline();
        for module in self.modules.iter_mut() {
            if time::timeout(deadline, module.cycle(now)).await.is_err() {
                warn!(address = %module.address(), "Module cycle missed its deadline");
            }
        }
    }

    async fn handle_deadlines(&mut self, now: Instant) {
        for flight in self.pending.expire(now) {
            self.stats.timeout();
            let address = flight.request.route;
            warn!(address = %address, tag = flight.tag, op = %flight.request.operation, "Request timed out");
            flight.request.finish(Err(Error::Timeout {
                address,
                tag: flight.tag,
            }));
        }

        if self.enumeration.as_ref().is_some_and(|e| e.deadline <= now) {
            self.finish_enumeration();
        }

        if self
            .modules
            .iter()
            .any(|m| m.next_deadline().is_some_and(|d| d <= now))
        {
            self.run_cycle(now).await;
        }

        self.pump().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                id,
                operation,
                address,
                field,
                data,
                reply,
            } => {
                if address.is_broadcast() {
                    let _ = reply.send(Err(Error::UnknownModule(address)));
                    return;
                }
                if data.len() > MAX_DATA {
                    let _ = reply.send(Err(Error::MalformedFrame(format!(
                        "{} data bytes do not fit one frame",
                        data.len()
                    ))));
                    return;
                }
                if let Some(index) = self.serving(address) {
                    let tag = self.next_tag();
                    let result = self
                        .dispatch(index, operation, field, &data, tag)
                        .await
                        .map(|response| Reply {
                            tag,
                            status: response.status,
                            data: response.data,
                        });
                    let _ = reply.send(result);
                    return;
                }
                self.queue(Outbound {
                    id,
                    operation,
                    route: address,
                    target: address,
                    field,
                    data,
                    reply,
                });
                self.pump().await;
            }
            Command::Cancel { address, id } => {
                if let Some(request) = self.pending.cancel(address, id) {
                    debug!(address = %address, op = %request.operation, "Request cancelled");
                    request.finish(Err(Error::Cancelled(address)));
                    self.pump().await;
                }
            }
            Command::Enumerate { reply } => match self.enumeration.as_mut() {
                Some(enumeration) => enumeration.waiters.push(reply),
                None => self.start_enumeration(reply).await,
            },
            Command::Assign {
                id,
                uid,
                address,
                reply,
            } => {
                if self.address_taken(address, uid) {
                    warn!(uid, to = %address, "Address assignment refused, target in use");
                    let _ = reply.send(Err(Error::DuplicateAddress(address)));
                    return;
                }
                if let Some(index) = self.modules.iter().position(|m| m.identity().uid == uid) {
                    let status = self.assign_local(index, address);
                    let tag = self.next_tag();
                    let _ = reply.send(Ok(Reply {
                        tag,
                        status,
                        data: Vec::new(),
                    }));
                    return;
                }
                self.queue(Outbound {
                    id,
                    operation: Operation::Assign,
                    route: address,
                    target: Address::BROADCAST,
                    field: address.raw(),
                    data: uid.to_le_bytes().to_vec(),
                    reply,
                });
                self.pump().await;
            }
            Command::Register { module, reply } => {
                let _ = reply.send(self.register(module));
            }
        }
    }

    fn queue(&mut self, request: Outbound) {
        if let Err(request) = self.pending.enqueue(request) {
            let address = request.route;
            debug!(address = %address, "Request queue full");
            request.finish(Err(Error::Busy(address)));
        }
    }

    /// Put the next queued request of every idle address on the bus.
    async fn pump(&mut self) {
        if self.enumeration.is_some() {
            return;
        }
        loop {
            let ready = self.pending.ready();
            if ready.is_empty() {
                return;
            }
            for request in ready {
                self.start_request(request).await;
            }
        }
    }

    async fn start_request(&mut self, request: Outbound) {
        let route = request.route;
        if !request.target.is_broadcast() && !self.directory.contains(route) {
            request.finish(Err(Error::UnknownModule(route)));
            return;
        }
        let tag = self.next_tag();
        let Some(frame) = TramFrame::request(
            request.operation,
            request.target,
            tag,
            request.field,
            &request.data,
        ) else {
            request.finish(Err(Error::MalformedFrame("request data too long".to_string())));
            return;
        };
        if let Err(e) = self.transmit(&frame).await {
            warn!(address = %route, error = %e, "Failed to send request");
            request.finish(Err(e));
            return;
        }
        trace!(address = %route, tag, op = %request.operation, "Request sent");
        let deadline = Instant::now() + self.config.request_timeout();
        self.pending.start(request, tag, deadline);
    }

    async fn start_enumeration(&mut self, reply: oneshot::Sender<Result<Directory>>) {
        let tag = self.next_tag();
        let mut claims: BTreeMap<Address, BTreeMap<u32, u8>> = BTreeMap::new();
        for module in &self.modules {
            let identity = module.identity();
            claims
                .entry(module.address())
                .or_default()
                .insert(identity.uid, identity.type_code);
        }

        let probe = TramFrame::request(Operation::Probe, Address::BROADCAST, tag, 0, &[]);
        if let Some(frame) = probe {
            if let Err(e) = self.transmit(&frame).await {
                error!(error = %e, "Failed to send enumeration probe");
                let _ = reply.send(Err(e));
                return;
            }
        }

        info!(tag, local = self.modules.len(), "Enumeration started");
        self.enumeration = Some(Enumeration {
            tag,
            deadline: Instant::now() + self.config.enumeration_window(),
            claims,
            waiters: vec![reply],
        });
    }

    fn finish_enumeration(&mut self) {
        let Some(enumeration) = self.enumeration.take() else {
            return;
        };
        self.pending.retire(Address::BROADCAST, enumeration.tag);

        let mut seen = BTreeSet::new();
        for (address, claimants) in &enumeration.claims {
            seen.insert(*address);
            if claimants.len() > 1 {
                for uid in claimants.keys() {
                    warn!(address = %address, uid, "Duplicate address");
                    self.emit(BusEvent::DuplicateAddress {
                        address: *address,
                        uid: *uid,
                    });
                }
                self.stats.duplicate_addresses(claimants.len() as u64);
                self.excluded.insert(*address);
                self.directory.remove(*address);
                continue;
            }
            let Some((uid, type_code)) = claimants.iter().next() else {
                continue;
            };
            self.excluded.remove(address);
            let local = self
                .modules
                .iter()
                .any(|m| m.address() == *address && m.identity().uid == *uid);
            let entry = ModuleEntry {
                address: *address,
                uid: *uid,
                type_code: *type_code,
                local,
            };
            let previous = self.directory.insert(entry);
            if previous.map(|p| p.uid) != Some(*uid) {
                info!(address = %address, uid, type_code, local, "Module joined");
                self.emit(BusEvent::ModuleJoined {
                    address: *address,
                    uid: *uid,
                    type_code: *type_code,
                });
            }
        }

        for address in self.directory.addresses() {
            if seen.contains(&address) {
                continue;
            }
            if let Some(entry) = self.directory.remove(address) {
                info!(address = %address, uid = entry.uid, "Module left");
                self.emit(BusEvent::ModuleLeft {
                    address,
                    uid: entry.uid,
                });
            }
        }

        // An address nobody claims any more is no longer in conflict
        self.excluded.retain(|address| seen.contains(address));

        info!(modules = self.directory.len(), excluded = self.excluded.len(), "Enumeration complete");
        self.emit(BusEvent::EnumerationComplete {
            modules: self.directory.len(),
        });
        self.directory_tx.send_replace(self.directory.clone());
        for waiter in enumeration.waiters {
            let _ = waiter.send(Ok(self.directory.clone()));
        }
    }

    /// Move local module `index` to `target`.
    fn assign_local(&mut self, index: usize, target: Address) -> Status {
        let module = &self.modules[index];
        let from = module.address();
        let uid = module.identity().uid;
        if from == target {
            return Status::Ok;
        }
        if self.address_taken(target, uid) {
            warn!(uid, to = %target, "Address assignment refused, target in use");
            return Status::AddressInUse;
        }
        self.modules[index].set_address(target);
        self.note_assignment(uid, Some(from), target, true);
        Status::Ok
    }

    /// Whether `address` belongs to a module other than `uid`, or is
    /// contested since the last enumeration.
    fn address_taken(&self, address: Address, uid: u32) -> bool {
        self.excluded.contains(&address)
            || self.directory.get(address).is_some_and(|e| e.uid != uid)
            || self
                .modules
                .iter()
                .any(|m| m.address() == address && m.identity().uid != uid)
    }

    fn note_assignment(&mut self, uid: u32, from: Option<Address>, to: Address, local: bool) {
        if let Some(entry) = self.directory.by_uid(uid).copied() {
            self.directory.remove(entry.address);
            self.directory.insert(ModuleEntry {
                address: to,
                local,
                ..entry
            });
            self.directory_tx.send_replace(self.directory.clone());
        }
        info!(uid, from = ?from, to = %to, "Module address assigned");
        self.emit(BusEvent::AddressAssigned { from, to, uid });
    }

    async fn handle_frame(&mut self, raw: CanFrame) {
        let frame = match TramFrame::decode(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.malformed_frame();
                debug!(frame = ?raw, error = %e, "Dropped malformed frame");
                return;
            }
        };
        match frame.direction {
            Direction::Request => self.handle_request(frame).await,
            Direction::Response => self.handle_response(frame).await,
        }
    }

    async fn handle_request(&mut self, frame: TramFrame) {
        if frame.address.is_broadcast() {
            match frame.operation {
                Operation::Probe => self.answer_probe(frame.tag).await,
                Operation::Assign => self.answer_assign(&frame).await,
                other => {
                    self.stats.malformed_frame();
                    debug!(op = %other, "Dropped broadcast request");
                }
            }
            return;
        }

        let Some(index) = self.serving(frame.address) else {
            self.stats.unknown_address();
            trace!(address = %frame.address, op = %frame.operation, "Request for unknown address");
            return;
        };
        let response = self
            .dispatch(index, frame.operation, frame.field, frame.data(), frame.tag)
            .await
            .unwrap_or_else(|_| Response::error(Status::Timeout));
        self.respond(frame.operation, frame.address, frame.tag, response)
            .await;
    }

    /// Every local module answers, excluded ones included: the conflict
    /// is only resolved by seeing all claimants.
    async fn answer_probe(&mut self, tag: u8) {
        let answers: Vec<(Address, Vec<u8>)> = self
            .modules
            .iter()
            .map(|m| (m.address(), m.identity().probe_data()))
            .collect();
        for (address, data) in answers {
            self.respond(Operation::Probe, address, tag, Response::ok(data))
                .await;
        }
    }

    async fn answer_assign(&mut self, frame: &TramFrame) {
        let Some(target) = Address::new(frame.field) else {
            self.stats.malformed_frame();
            return;
        };
        let Ok(uid) = <[u8; 4]>::try_from(frame.data()).map(u32::from_le_bytes) else {
            self.stats.malformed_frame();
            return;
        };
        let Some(index) = self.modules.iter().position(|m| m.identity().uid == uid) else {
            // Some other node's module
            return;
        };
        let status = self.assign_local(index, target);
        self.respond(Operation::Assign, target, frame.tag, Response::error(status))
            .await;
    }

    async fn handle_response(&mut self, frame: TramFrame) {
        let Some(status) = frame.status() else {
            self.stats.malformed_frame();
            return;
        };

        if let Some(enumeration) = self.enumeration.as_mut() {
            if frame.operation == Operation::Probe && frame.tag == enumeration.tag {
                match ModuleIdentity::parse_probe(frame.data()) {
                    Some((uid, type_code)) if status == Status::Ok => {
                        trace!(address = %frame.address, uid, "Probe answer");
                        enumeration
                            .claims
                            .entry(frame.address)
                            .or_default()
                            .insert(uid, type_code);
                    }
                    _ => {
                        self.stats.malformed_frame();
                        debug!(address = %frame.address, "Unreadable probe answer");
                    }
                }
                return;
            }
        }

        if let Some(request) = self.pending.complete(frame.address, frame.tag) {
            trace!(address = %frame.address, tag = frame.tag, status = %status, "Response received");
            if request.operation == Operation::Assign && status == Status::Ok {
                if let Ok(bytes) = <[u8; 4]>::try_from(request.data.as_slice()) {
                    let uid = u32::from_le_bytes(bytes);
                    let from = self.directory.by_uid(uid).map(|e| e.address);
                    self.note_assignment(uid, from, request.route, false);
                }
            }
            self.stats.request_completed();
            request.finish(Ok(Reply {
                tag: frame.tag,
                status,
                data: frame.data().to_vec(),
            }));
            self.pump().await;
            return;
        }

        let late_probe =
            frame.operation == Operation::Probe && self.pending.is_retired(Address::BROADCAST, frame.tag);
        if late_probe || self.pending.is_retired(frame.address, frame.tag) {
            self.stats.late_response();
            debug!(address = %frame.address, tag = frame.tag, "Late response dropped");
        } else {
            self.stats.unknown_address();
            trace!(address = %frame.address, tag = frame.tag, "Unsolicited response dropped");
        }
    }
}
