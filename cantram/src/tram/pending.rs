//! Outstanding requests.
//!
//! One request per address is on the bus at a time; the rest wait in a
//! FIFO queue for that address. Entries are keyed by the address the
//! response will come from (the target address for `ASSIGN`).

use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::handle::Reply;
use super::{Address, Operation};
use crate::error::Result;

/// How many cleared `(address, tag)` keys are remembered for late-response
/// accounting.
const RETIRED_KEYS: usize = 64;

pub(crate) type ReplySender = oneshot::Sender<Result<Reply>>;

/// A request accepted from a handle.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub id: u64,
    pub operation: Operation,
    /// Address the response will come from
    pub route: Address,
    /// Address in the transmitted identifier
    pub target: Address,
    pub field: u8,
    pub data: Vec<u8>,
    pub reply: ReplySender,
}

impl Outbound {
    pub fn finish(self, result: Result<Reply>) {
        // The caller may have dropped its ticket
        let _ = self.reply.send(result);
    }
}

#[derive(Debug)]
pub(crate) struct InFlight {
    pub request: Outbound,
    pub tag: u8,
    pub deadline: Instant,
}

#[derive(Debug)]
pub(crate) struct PendingTable {
    in_flight: HashMap<Address, InFlight>,
    queues: HashMap<Address, VecDeque<Outbound>>,
    retired: VecDeque<(Address, u8)>,
    max_queued: usize,
}

impl PendingTable {
    pub fn new(max_queued: usize) -> Self {
        Self {
            in_flight: HashMap::new(),
            queues: HashMap::new(),
            retired: VecDeque::with_capacity(RETIRED_KEYS),
            max_queued,
        }
    }

    /// Queue a request. Hands it back if the address already has one
    /// request in flight and `max_queued` waiting.
    pub fn enqueue(&mut self, request: Outbound) -> std::result::Result<(), Outbound> {
        let route = request.route;
        let queue = self.queues.entry(route).or_default();
        let occupied = queue.len() + usize::from(self.in_flight.contains_key(&route));
        if occupied > self.max_queued {
            return Err(request);
        }
        queue.push_back(request);
        Ok(())
    }

    /// Next queued request of every address with nothing in flight.
    pub fn ready(&mut self) -> Vec<Outbound> {
        let mut ready = Vec::new();
        for (address, queue) in self.queues.iter_mut() {
            if self.in_flight.contains_key(address) {
                continue;
            }
            if let Some(request) = queue.pop_front() {
                ready.push(request);
            }
        }
        self.queues.retain(|_, queue| !queue.is_empty());
        ready.sort_by_key(|r| r.id);
        ready
    }

    pub fn start(&mut self, request: Outbound, tag: u8, deadline: Instant) {
        self.in_flight.insert(
            request.route,
            InFlight {
                request,
                tag,
                deadline,
            },
        );
    }

    /// Take the in-flight request answered by `(address, tag)`.
    pub fn complete(&mut self, address: Address, tag: u8) -> Option<Outbound> {
        if self.in_flight.get(&address)?.tag != tag {
            return None;
        }
        self.in_flight.remove(&address).map(|f| f.request)
    }

    /// Take every in-flight request whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<InFlight> {
        let due: Vec<Address> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(address, _)| *address)
            .collect();
        let mut expired = Vec::with_capacity(due.len());
        for address in due {
            if let Some(flight) = self.in_flight.remove(&address) {
                self.retire(address, flight.tag);
                expired.push(flight);
            }
        }
        expired
    }

    /// Remove a request, queued or in flight.
    pub fn cancel(&mut self, route: Address, id: u64) -> Option<Outbound> {
        if self.in_flight.get(&route).is_some_and(|f| f.request.id == id) {
            let flight = self.in_flight.remove(&route)?;
            self.retire(route, flight.tag);
            return Some(flight.request);
        }
        let queue = self.queues.get_mut(&route)?;
        let index = queue.iter().position(|r| r.id == id)?;
        queue.remove(index)
    }

    /// Whether `(address, tag)` belonged to a request that was cleared.
    pub fn is_retired(&self, address: Address, tag: u8) -> bool {
        self.retired.contains(&(address, tag))
    }

    /// Remember a cleared key so a response to it counts as late.
    pub fn retire(&mut self, address: Address, tag: u8) {
        if self.retired.len() == RETIRED_KEYS {
            self.retired.pop_front();
        }
        self.retired.push_back((address, tag));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.values().map(|f| f.deadline).min()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Everything still outstanding, for shutdown.
    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut all: Vec<Outbound> = self.in_flight.drain().map(|(_, f)| f.request).collect();
        for (_, queue) in self.queues.drain() {
            all.extend(queue);
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(id: u64, address: u8) -> (Outbound, oneshot::Receiver<Result<Reply>>) {
        let (reply, rx) = oneshot::channel();
        let address = Address::new(address).unwrap();
        (
            Outbound {
                id,
                operation: Operation::Read,
                route: address,
                target: address,
                field: 0,
                data: Vec::new(),
                reply,
            },
            rx,
        )
    }

    #[test]
    fn one_in_flight_per_address() {
        let mut table = PendingTable::new(4);
        let (a1, _r1) = request(1, 0x10);
        let (a2, _r2) = request(2, 0x10);
        let (b1, _r3) = request(3, 0x11);
        table.enqueue(a1).unwrap();
        table.enqueue(a2).unwrap();
        table.enqueue(b1).unwrap();

        let ready: Vec<u64> = table.ready().into_iter().map(|r| r.id).collect();
        assert_eq!(ready, vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_depth_is_bounded() {
        let mut table = PendingTable::new(1);
        let (a1, _r1) = request(1, 0x10);
        let (a2, _r2) = request(2, 0x10);
        let (a3, _r3) = request(3, 0x10);
        table.enqueue(a1).unwrap();
        let first = table.ready().pop().unwrap();
        table.start(first, 7, Instant::now() + Duration::from_millis(10));
        table.enqueue(a2).unwrap();
        assert_eq!(table.enqueue(a3).map_err(|r| r.id), Err(3));
        assert!(table.ready().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_and_cancel_retire_the_tag() {
        let mut table = PendingTable::new(2);
        let address = Address::new(0x10).unwrap();
        let (a1, _r1) = request(1, 0x10);
        let now = Instant::now();
        table.start(a1, 5, now + Duration::from_millis(10));

        assert!(table.complete(address, 6).is_none());
        assert!(table.expire(now).is_empty());
        let expired = table.expire(now + Duration::from_millis(10));
        assert_eq!(expired.len(), 1);
        assert!(table.is_retired(address, 5));

        let (a2, _r2) = request(2, 0x10);
        table.start(a2, 6, now + Duration::from_millis(20));
        assert_eq!(table.cancel(address, 2).map(|r| r.id), Some(2));
        assert!(table.is_retired(address, 6));
        assert!(table.complete(address, 6).is_none());
    }
}
