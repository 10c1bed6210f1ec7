//! Downstream port model: bounded outstanding-request budgets, request
//! queues drained by the external peer, and completion matching by packet
//! uid. Saturation blocks the issuing unit; requests are never dropped.

use super::fifo::Fifo;
use super::packet::{Issuer, Request};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    CacheSide,
    MemSide,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("completion for unknown packet uid {uid} on {port:?}")]
    UnknownCompletion { port: PortKind, uid: u64 },
}

/// Tracks which packets are in flight against a fixed budget.
#[derive(Debug)]
pub struct OutstandingTracker {
    max: usize,
    in_flight: HashMap<u64, Issuer>,
}

impl OutstandingTracker {
    #[must_use]
    pub fn new(max: usize) -> Self {
        assert!(max > 0);
        Self {
            max,
            in_flight: HashMap::new(),
        }
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }

    #[must_use]
    pub fn has_space(&self, slots: usize) -> bool {
        self.in_flight.len() + slots <= self.max
    }

    pub fn insert(&mut self, uid: u64, issuer: Issuer) {
        assert!(self.in_flight.len() < self.max, "outstanding budget overrun");
        let previous = self.in_flight.insert(uid, issuer);
        assert!(previous.is_none(), "packet uid {uid} issued twice");
    }

    pub fn remove(&mut self, uid: u64) -> Option<Issuer> {
        self.in_flight.remove(&uid)
    }
}

/// One downstream request port.
///
/// Units issue through [`DownstreamPort::try_issue`]; the external peer
/// drains [`DownstreamPort::pop_request`] and answers through the owning
/// accelerator, which calls [`DownstreamPort::complete`].
#[derive(Debug)]
pub struct DownstreamPort {
    pub kind: PortKind,
    tracker: OutstandingTracker,
    queue: Fifo<Request>,
    /// Slots only the invalidator may take (one on the memory side).
    reserved_slots: usize,
    pub stats: stats::ports::Port,
}

impl DownstreamPort {
    #[must_use]
    pub fn new(kind: PortKind, max_outstanding: usize) -> Self {
        let reserved_slots = match kind {
            PortKind::CacheSide => 0,
            PortKind::MemSide => 1,
        };
        assert!(max_outstanding > reserved_slots);
        Self {
            kind,
            tracker: OutstandingTracker::new(max_outstanding),
            queue: Fifo::new(None),
            reserved_slots,
            stats: stats::ports::Port::default(),
        }
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.tracker.outstanding()
    }

    #[must_use]
    pub fn max_outstanding(&self) -> usize {
        self.tracker.max()
    }

    #[must_use]
    pub fn can_issue(&self, issuer: Issuer) -> bool {
        let reserved = match issuer {
            Issuer::Invalidator => 0,
            Issuer::Stream(_) | Issuer::Indirect(_) => self.reserved_slots,
        };
        self.tracker.has_space(1 + reserved)
    }

    /// Hand a request to the port. Returns it back when the outstanding
    /// budget is saturated; the unit must hold it and retry.
    pub fn try_issue(&mut self, request: Request) -> Result<(), Request> {
        if !self.can_issue(request.issuer) {
            self.stats.stalls += 1;
            log::trace!(
                "{:?}: {} blocked ({}/{} outstanding)",
                self.kind,
                request,
                self.tracker.outstanding(),
                self.tracker.max(),
            );
            return Err(request);
        }
        log::debug!("{:?}: issue {}", self.kind, request);
        self.tracker.insert(request.uid, request.issuer);
        self.stats.issued += 1;
        self.stats.record_outstanding(self.tracker.outstanding() as u64);
        self.queue.enqueue(request);
        Ok(())
    }

    /// Next request for the external peer.
    pub fn pop_request(&mut self) -> Option<Request> {
        self.queue.dequeue()
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.queue.len()
    }

    /// Match a completion back to its request. Each uid completes exactly
    /// once; a second completion is a protocol error, not a decrement.
    pub fn complete(&mut self, uid: u64) -> Result<Issuer, PortError> {
        let issuer = self
            .tracker
            .remove(uid)
            .ok_or(PortError::UnknownCompletion {
                port: self.kind,
                uid,
            })?;
        self.stats.completed += 1;
        Ok(issuer)
    }

    #[must_use]
    pub fn busy(&self) -> bool {
        self.tracker.outstanding() > 0 || !self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Builder;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn read(issuer: Issuer) -> Request {
        Builder::read(0x40, issuer).build()
    }

    #[test]
    fn budget_blocks_at_max_and_frees_on_completion() {
        let mut port = DownstreamPort::new(PortKind::CacheSide, 2);
        let first = read(Issuer::Stream(0));
        let first_uid = first.uid;
        port.try_issue(first).unwrap();
        port.try_issue(read(Issuer::Stream(0))).unwrap();

        let blocked = read(Issuer::Stream(0));
        let blocked = port.try_issue(blocked).unwrap_err();
        assert_eq!(port.stats.stalls, 1);

        assert_eq!(port.complete(first_uid), Ok(Issuer::Stream(0)));
        port.try_issue(blocked).unwrap();
        assert_eq!(port.outstanding(), 2);
    }

    #[test]
    fn unknown_or_double_completion_is_an_error() {
        let mut port = DownstreamPort::new(PortKind::CacheSide, 4);
        let request = read(Issuer::Indirect(0));
        let uid = request.uid;
        port.try_issue(request).unwrap();

        assert!(port.complete(uid).is_ok());
        assert_eq!(
            port.complete(uid),
            Err(PortError::UnknownCompletion {
                port: PortKind::CacheSide,
                uid
            })
        );
        assert_eq!(port.stats.completed, 1);
    }

    #[test]
    fn mem_side_reserves_last_slot_for_invalidator() {
        let mut port = DownstreamPort::new(PortKind::MemSide, 2);
        port.try_issue(read(Issuer::Indirect(0))).unwrap();
        // the last slot is not available to regular units
        assert!(!port.can_issue(Issuer::Indirect(0)));
        assert!(port.try_issue(read(Issuer::Indirect(0))).is_err());
        // but the invalidator may take it
        assert!(port.can_issue(Issuer::Invalidator));
        port.try_issue(read(Issuer::Invalidator)).unwrap();
        assert_eq!(port.outstanding(), 2);
    }

    #[test]
    fn outstanding_never_exceeds_budget_under_random_interleaving() {
        let mut rng = StdRng::seed_from_u64(0x0a11_0c8e);
        for trial in 0..20 {
            let max = rng.gen_range(1..32);
            let mut port = DownstreamPort::new(PortKind::CacheSide, max);
            let mut in_flight = Vec::new();
            let mut held: Option<Request> = None;
            for _ in 0..2000 {
                assert!(port.outstanding() <= max, "trial {trial} overran budget");
                if rng.gen_bool(0.5) {
                    let request = held.take().unwrap_or_else(|| read(Issuer::Stream(0)));
                    match port.try_issue(request) {
                        Ok(()) => {
                            let issued = port.pop_request().unwrap();
                            in_flight.push(issued.uid);
                        }
                        Err(request) => {
                            assert_eq!(port.outstanding(), max);
                            held = Some(request);
                        }
                    }
                } else if !in_flight.is_empty() {
                    let index = rng.gen_range(0..in_flight.len());
                    let uid = in_flight.swap_remove(index);
                    port.complete(uid).unwrap();
                }
            }
            assert_eq!(
                port.stats.issued,
                port.stats.completed + port.outstanding() as u64
            );
            assert!(port.stats.max_outstanding_seen <= max as u64);
        }
    }
}
