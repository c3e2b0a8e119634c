//! Demand records and the per-pair backlog ledger.

use crate::endpoint::NodeId;
use crate::error::{Result, SchedError};
use std::collections::HashMap;

/// One unit of externally observed demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub src: NodeId,
    pub dst: NodeId,
    pub timeslot: u64,
    pub backlog: u32,
}

/// Newly added backlog for one pair, on its way to a matching shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemandEdge {
    pub src: NodeId,
    pub dst: NodeId,
    pub amount: u32,
}

/// Backlog satisfied by the matcher, reported back to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpentDemand {
    pub src: NodeId,
    pub dst: NodeId,
    pub amount: u32,
}

/// Outstanding backlog per (source, destination).
///
/// Pairs whose backlog drops to zero are forgotten, so the map only holds active pairs.
#[derive(Debug, Default)]
pub struct DemandLedger {
    node_count: usize,
    outstanding: HashMap<(NodeId, NodeId), u64>,
    total_added: u64,
    total_spent: u64,
}

impl DemandLedger {
    pub fn new(node_count: usize) -> Self {
        Self {
            node_count,
            ..Self::default()
        }
    }

    /// Forget everything and adopt a new node count.
    pub fn reset(&mut self, node_count: usize) {
        self.node_count = node_count;
        self.outstanding.clear();
        self.total_added = 0;
        self.total_spent = 0;
    }

    /// Reject endpoints outside `0..node_count`.
    pub fn check_pair(&self, src: NodeId, dst: NodeId) -> Result<()> {
        for (what, node) in [("source", src), ("destination", dst)] {
            if node as usize >= self.node_count {
                return Err(SchedError::OutOfRange {
                    what,
                    value: node as usize,
                    limit: self.node_count,
                });
            }
        }
        Ok(())
    }

    /// Accumulate `amount` more backlog for the pair.
    pub fn add(&mut self, src: NodeId, dst: NodeId, amount: u32) -> Result<()> {
        self.check_pair(src, dst)?;
        if amount == 0 {
            return Ok(());
        }
        *self.outstanding.entry((src, dst)).or_insert(0) += amount as u64;
        self.total_added += amount as u64;
        Ok(())
    }

    /// Remove backlog the matcher has admitted.
    pub fn spend(&mut self, spent: SpentDemand) -> Result<()> {
        let key = (spent.src, spent.dst);
        let outstanding = self.outstanding.get(&key).copied().unwrap_or(0);
        let amount = spent.amount as u64;
        if amount > outstanding {
            return Err(SchedError::LedgerUnderflow {
                src: spent.src,
                dst: spent.dst,
                outstanding,
                spent: amount,
            });
        }
        if amount == outstanding {
            self.outstanding.remove(&key);
        } else if let Some(slot) = self.outstanding.get_mut(&key) {
            *slot -= amount;
        }
        self.total_spent += amount;
        Ok(())
    }

    pub fn outstanding(&self, src: NodeId, dst: NodeId) -> u64 {
        self.outstanding.get(&(src, dst)).copied().unwrap_or(0)
    }

    pub fn total_outstanding(&self) -> u64 {
        self.total_added - self.total_spent
    }

    /// Pairs with non-zero backlog.
    pub fn active_pairs(&self) -> usize {
        self.outstanding.len()
    }

    pub fn total_added(&self) -> u64 {
        self.total_added
    }

    pub fn total_spent(&self) -> u64 {
        self.total_spent
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }
}
