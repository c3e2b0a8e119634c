//! One timeslot's worth of admitted traffic.

use crate::endpoint::{Destination, Endpoint, NodeId, PathId};
use crate::error::{Result, SchedError};
use crate::pool::Recycle;
use std::collections::{HashMap, HashSet};

/// A (source, destination) pair scheduled to transmit in one timeslot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmittedEdge {
    pub src: Endpoint,
    pub dst: Endpoint,
    /// Path chosen by path selection; path 0 until then.
    pub path: PathId,
}

impl AdmittedEdge {
    pub fn new(src: Endpoint, dst: Endpoint) -> Self {
        Self {
            src,
            dst,
            path: PathId::default(),
        }
    }

    /// Whether the edge crosses the inter-rack links.
    pub fn is_inter_rack(&self) -> bool {
        self.src.rack != self.dst.rack
    }

    /// Destination as forwarding sees it, including the chosen path.
    pub fn destination(&self, nodes_per_rack: usize) -> Destination {
        Destination::new(self.dst, self.path, nodes_per_rack)
    }
}

/// Why a batch breaks the per-timeslot matching rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    /// The source appears in more than one edge.
    DuplicateSource(NodeId),
    /// The destination receives more than its per-timeslot capacity.
    DestinationOverloaded(NodeId),
}

/// Conflict-free schedule for a single timeslot.
///
/// Objects live in an [`ObjectPool`](crate::pool::ObjectPool); the edge buffer is allocated
/// once with a fixed capacity and never grows.
#[derive(Debug)]
pub struct AdmittedTraffic {
    timeslot: u64,
    edges: Vec<AdmittedEdge>,
    capacity: usize,
}

impl AdmittedTraffic {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            timeslot: 0,
            edges: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Clear the edges and stamp the batch with a new timeslot.
    pub fn reset(&mut self, timeslot: u64) {
        self.edges.clear();
        self.timeslot = timeslot;
    }

    pub fn timeslot(&self) -> u64 {
        self.timeslot
    }

    /// Number of admitted edges.
    pub fn size(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn edges(&self) -> &[AdmittedEdge] {
        &self.edges
    }

    /// Mutable access to the edges, e.g. for writing path ids.
    pub fn edges_mut(&mut self) -> &mut [AdmittedEdge] {
        &mut self.edges
    }

    pub fn push(&mut self, edge: AdmittedEdge) -> Result<()> {
        if self.edges.len() >= self.capacity {
            return Err(SchedError::BatchFull {
                capacity: self.capacity,
            });
        }
        self.edges.push(edge);
        Ok(())
    }

    /// Append every edge of `other` (a partial batch from another shard).
    pub fn append(&mut self, other: &AdmittedTraffic) -> Result<()> {
        if self.edges.len() + other.edges.len() > self.capacity {
            return Err(SchedError::BatchFull {
                capacity: self.capacity,
            });
        }
        self.edges.extend_from_slice(&other.edges);
        Ok(())
    }

    /// First violation of "one edge per source, at most `dst_capacity` per destination".
    pub fn conflicts(&self, dst_capacity: u16) -> Option<Conflict> {
        let mut sources = HashSet::with_capacity(self.edges.len());
        let mut destinations: HashMap<NodeId, u16> = HashMap::with_capacity(self.edges.len());
        for edge in &self.edges {
            if !sources.insert(edge.src.node) {
                return Some(Conflict::DuplicateSource(edge.src.node));
            }
            let load = destinations.entry(edge.dst.node).or_insert(0);
            *load += 1;
            if *load > dst_capacity {
                return Some(Conflict::DestinationOverloaded(edge.dst.node));
            }
        }
        None
    }
}

impl Recycle for AdmittedTraffic {
    fn recycle(&mut self) {
        self.reset(0);
    }
}
