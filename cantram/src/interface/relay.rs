//! Relay output with contact protection.
//!
//! Two toggles of one relay must be at least `min_dwell` apart. A write
//! that would toggle sooner is parked and applied by [`Interface::service`]
//! at the dwell boundary; a later write replaces the parked one, and a
//! write back to the current state cancels it. A parked write whose
//! output fails is retried no sooner than [`RETRY_INTERVAL`] later.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

use super::{Backing, ChannelKind, Interface, InterfaceError, OutputSink, Value};
use crate::tracing::prelude::*;

/// Shortest wait before retrying a parked toggle that failed.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

pub struct Relay {
    name: String,
    sink: OutputSink,
    min_dwell: Duration,
    applied: Option<bool>,
    last_toggle: Option<Instant>,
    pending: Option<bool>,
    retry_at: Option<Instant>,
}

impl Relay {
    pub fn new(name: impl Into<String>, sink: OutputSink, min_dwell: Duration) -> Self {
        Self {
            name: name.into(),
            sink,
            min_dwell,
            applied: None,
            last_toggle: None,
            pending: None,
            retry_at: None,
        }
    }

    /// State waiting for the dwell window to pass.
    pub fn pending(&self) -> Option<bool> {
        self.pending
    }

    fn earliest_toggle(&self) -> Option<Instant> {
        self.last_toggle.map(|at| at + self.min_dwell)
    }

    /// When the parked toggle may next be tried.
    fn earliest_service(&self) -> Option<Instant> {
        self.earliest_toggle().max(self.retry_at)
    }

    async fn apply(&mut self, state: bool, now: Instant) -> Result<(), InterfaceError> {
        self.sink.set(state).await?;
        if self.applied != Some(state) {
            self.last_toggle = Some(now);
        }
        self.applied = Some(state);
        self.pending = None;
        self.retry_at = None;
        debug!(channel = %self.name, state, "Relay switched");
        Ok(())
    }
}

#[async_trait]
impl Interface for Relay {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Relay
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn backing(&self) -> Backing {
        self.sink.backing()
    }

    async fn read(&mut self) -> Result<Value, InterfaceError> {
        self.applied.map(Value::Bool).ok_or(InterfaceError::NoValue)
    }

    async fn write(&mut self, value: Value) -> Result<(), InterfaceError> {
        let Value::Bool(state) = value else {
            return Err(InterfaceError::invalid_value(self.kind(), &value));
        };
        if self.applied == Some(state) {
            self.retry_at = None;
            if self.pending.take().is_some() {
                debug!(channel = %self.name, state, "Pending relay toggle withdrawn");
            }
            return Ok(());
        }
        let now = Instant::now();
        match self.earliest_toggle() {
            Some(earliest) if now < earliest => {
                self.pending = Some(state);
                debug!(
                    channel = %self.name,
                    state,
                    wait_ms = (earliest - now).as_millis() as u64,
                    "Relay toggle deferred"
                );
                Ok(())
            }
            _ => self.apply(state, now).await,
        }
    }

    fn last_value(&self) -> Option<Value> {
        self.applied.map(Value::Bool)
    }

    async fn service(&mut self, now: Instant) -> Result<(), InterfaceError> {
        let Some(state) = self.pending else {
            return Ok(());
        };
        if self.earliest_service().is_some_and(|earliest| now < earliest) {
            return Ok(());
        }
        let result = self.apply(state, now).await;
        if result.is_err() {
            self.retry_at = Some(now + self.min_dwell.max(RETRY_INTERVAL));
        }
        result
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.and(self.earliest_service())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::{ChannelOutputChip, ChipSelect, SharedChip};
    use crate::sim::{FakeOutputChip, OutputChipProbe};

    const DWELL: Duration = Duration::from_millis(100);

    fn relay() -> (Relay, OutputChipProbe) {
        let fake = FakeOutputChip::new(ChipSelect::Pin(12), 4);
        let probe = fake.probe();
        let chip: SharedChip<dyn ChannelOutputChip> =
            SharedChip::new(Box::new(fake), Duration::ZERO);
        (Relay::new("K1", OutputSink::Chip(chip, 0), DWELL), probe)
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_inside_dwell_is_deferred_not_dropped() {
        let (mut relay, probe) = relay();
        let start = Instant::now();
        relay.write(Value::Bool(true)).await.unwrap();
        assert_eq!(probe.mask(), 1);

        tokio::time::advance(Duration::from_millis(30)).await;
        relay.write(Value::Bool(false)).await.unwrap();
        assert_eq!(probe.mask(), 1, "applied before the dwell boundary");
        assert_eq!(relay.pending(), Some(false));
        assert_eq!(relay.next_deadline(), Some(start + DWELL));

        relay.service(Instant::now()).await.unwrap();
        assert_eq!(probe.mask(), 1);

        tokio::time::advance(Duration::from_millis(70)).await;
        relay.service(Instant::now()).await.unwrap();
        assert_eq!(probe.mask(), 0);
        assert_eq!(relay.read().await.unwrap(), Value::Bool(false));
        assert_eq!(relay.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn last_request_wins() {
        let (mut relay, probe) = relay();
        relay.write(Value::Bool(true)).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;

        relay.write(Value::Bool(false)).await.unwrap();
        relay.write(Value::Bool(true)).await.unwrap();
        assert_eq!(relay.pending(), None, "request back to current state cancels");

        relay.write(Value::Bool(false)).await.unwrap();
        tokio::time::advance(DWELL).await;
        relay.service(Instant::now()).await.unwrap();
        assert_eq!(probe.mask(), 0);
        assert_eq!(probe.writes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_parked_toggle_backs_off() {
        let (mut relay, probe) = relay();
        let start = Instant::now();
        relay.write(Value::Bool(true)).await.unwrap();
        relay.write(Value::Bool(false)).await.unwrap();
        probe.set_failing(true);

        tokio::time::advance(DWELL).await;
        let now = Instant::now();
        assert!(relay.service(now).await.is_err());
        assert_eq!(relay.pending(), Some(false));
        let retry = relay.next_deadline().unwrap();
        assert!(retry > now, "retry must lie in the future");
        assert_eq!(retry, start + DWELL + DWELL.max(RETRY_INTERVAL));

        // Servicing before the retry instant does not touch the chip
        let attempts = probe.attempts();
        relay.service(Instant::now()).await.unwrap();
        assert_eq!(probe.attempts(), attempts);

        probe.set_failing(false);
        tokio::time::advance(retry - Instant::now()).await;
        relay.service(Instant::now()).await.unwrap();
        assert_eq!(probe.mask(), 0);
        assert_eq!(relay.pending(), None);
        assert_eq!(relay.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_after_dwell_is_immediate() {
        let (mut relay, probe) = relay();
        relay.write(Value::Bool(true)).await.unwrap();
        tokio::time::advance(DWELL).await;
        relay.write(Value::Bool(false)).await.unwrap();
        assert_eq!(probe.mask(), 0);
        assert_eq!(relay.pending(), None);
    }
}
