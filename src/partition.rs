//! Partitioning of new demand into per-shard bins.
//!
//! Demand for destination `d` always goes to shard `d % shard_count`, so each matching
//! shard sees every edge touching its destinations and no edge touching anyone else's.
//!
//! Flushing never loses demand. A bin that does not fit on its shard ring is parked and
//! retried first on the next flush. Edges that cannot get a bin because the pool is empty
//! stay staged.

use crate::demand::DemandEdge;
use crate::endpoint::NodeId;
use crate::pool::{ObjectPool, Pooled, Recycle};
use crate::ring::{Ring, RingFull};
use crossbeam_utils::Backoff;
use std::collections::VecDeque;
use tracing::debug;

/// Fixed-capacity batch of demand edges bound for one shard.
#[derive(Debug)]
pub struct Bin {
    edges: Vec<DemandEdge>,
    capacity: usize,
}

impl Bin {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            edges: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Add an edge; returns `false` (and keeps nothing) when the bin is full.
    pub fn push(&mut self, edge: DemandEdge) -> bool {
        if self.is_full() {
            return false;
        }
        self.edges.push(edge);
        true
    }

    pub fn is_full(&self) -> bool {
        self.edges.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn edges(&self) -> &[DemandEdge] {
        &self.edges
    }
}

impl Recycle for Bin {
    fn recycle(&mut self) {
        self.edges.clear();
    }
}

/// Shard owning destination `dst`.
#[inline]
pub fn shard_of(dst: NodeId, shard_count: usize) -> usize {
    dst as usize % shard_count
}

/// Outcome of one [`Partitioner::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub bins_enqueued: usize,
    pub edges_flushed: usize,
    /// Edges still waiting (parked in a bin or staged) after this flush.
    pub edges_deferred: usize,
}

impl FlushReport {
    /// Every staged edge reached its shard ring.
    pub fn is_complete(&self) -> bool {
        self.edges_deferred == 0
    }
}

/// Stages new demand per shard and moves it onto the shard rings in bins.
#[derive(Debug)]
pub struct Partitioner {
    shard_count: usize,
    retries: u32,
    staged: Vec<VecDeque<DemandEdge>>,
    parked: Vec<Option<Pooled<Bin>>>,
}

impl Partitioner {
    /// `retries` bounds how often a full ring is retried (with backoff) before a bin is parked.
    pub fn new(shard_count: usize, retries: u32) -> Self {
        Self {
            shard_count,
            retries,
            staged: (0..shard_count).map(|_| VecDeque::new()).collect(),
            parked: (0..shard_count).map(|_| None).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Queue new demand for its shard; nothing reaches the shard until [`flush`](Self::flush).
    pub fn stage(&mut self, edge: DemandEdge) {
        let shard = shard_of(edge.dst, self.shard_count);
        self.staged[shard].push_back(edge);
    }

    /// Edges not yet handed to a shard ring.
    pub fn pending_edges(&self) -> usize {
        let staged: usize = self.staged.iter().map(VecDeque::len).sum();
        let parked: usize = self.parked.iter().flatten().map(|bin| bin.len()).sum();
        staged + parked
    }

    /// Move staged demand onto the shard rings. `rings[k]` feeds shard `k`.
    pub fn flush(&mut self, pool: &ObjectPool<Bin>, rings: &[Ring<Pooled<Bin>>]) -> FlushReport {
        debug_assert_eq!(rings.len(), self.shard_count);
        let mut report = FlushReport::default();

        for (shard, ring) in rings.iter().enumerate() {
            loop {
                let bin = match self.parked[shard].take() {
                    Some(bin) => bin,
                    None => {
                        let staged = &mut self.staged[shard];
                        if staged.is_empty() {
                            break;
                        }
                        let Some(mut bin) = pool.acquire() else {
                            debug!(shard, staged = staged.len(), "bin pool exhausted, demand stays staged");
                            break;
                        };
                        while !bin.is_full() {
                            let Some(edge) = staged.pop_front() else {
                                break;
                            };
                            bin.push(edge);
                        }
                        bin
                    }
                };

                let edges = bin.len();
                match enqueue_with_retry(ring, bin, self.retries) {
                    Ok(()) => {
                        report.bins_enqueued += 1;
                        report.edges_flushed += edges;
                    }
                    Err(bin) => {
                        debug!(shard, edges, "shard ring full, bin parked");
                        self.parked[shard] = Some(bin);
                        break;
                    }
                }
            }
        }

        report.edges_deferred = self.pending_edges();
        report
    }

    /// Drop everything staged or parked; parked bins go back to their pool.
    pub fn clear(&mut self) {
        for staged in &mut self.staged {
            staged.clear();
        }
        for parked in &mut self.parked {
            parked.take();
        }
    }
}

fn enqueue_with_retry(
    ring: &Ring<Pooled<Bin>>,
    mut bin: Pooled<Bin>,
    retries: u32,
) -> Result<(), Pooled<Bin>> {
    let backoff = Backoff::new();
    for attempt in 0..=retries {
        match ring.enqueue(bin) {
            Ok(()) => return Ok(()),
            Err(RingFull(rejected)) => bin = rejected,
        }
        if attempt < retries {
            backoff.snooze();
        }
    }
    Err(bin)
}
