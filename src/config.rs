//! Topology and engine configuration.
//!
//! [`Topology`] describes the fabric being scheduled and may change between experiments
//! (see [`AdmissibleState::reset`](crate::admissible::AdmissibleState::reset)).
//! [`EngineConfig`] fixes the shape of the rings and pools and never changes for the
//! lifetime of a scheduler instance.

use crate::endpoint::{MAX_NODES, NUM_PATHS};
use crate::error::{Result, SchedError};
use serde::{Deserialize, Serialize};

/// Shape of the fabric: nodes grouped into racks joined by capacity-limited links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub node_count: usize,
    pub rack_count: usize,
    pub nodes_per_rack: usize,
    /// Flows one inter-rack link (one rack, one path, one direction) carries per timeslot.
    pub inter_rack_capacity: usize,
    /// Cap cross-rack admissions per rack at what the rack's uplinks can carry.
    pub oversubscribed: bool,
}

impl Topology {
    /// All nodes in one rack; inter-rack capacity plays no role.
    pub fn single_rack(node_count: usize) -> Self {
        Self {
            node_count,
            rack_count: 1,
            nodes_per_rack: node_count,
            inter_rack_capacity: node_count,
            oversubscribed: false,
        }
    }

    /// `rack_count` full racks of `nodes_per_rack` nodes each.
    pub fn racks(rack_count: usize, nodes_per_rack: usize, inter_rack_capacity: usize) -> Self {
        Self {
            node_count: rack_count * nodes_per_rack,
            rack_count,
            nodes_per_rack,
            inter_rack_capacity,
            oversubscribed: false,
        }
    }

    /// Same topology with cross-rack admission limits enforced by the matcher.
    pub fn with_oversubscription(mut self) -> Self {
        self.oversubscribed = true;
        self
    }

    /// Cross-rack flows one rack may send (or receive) per timeslot.
    pub fn rack_limit(&self) -> usize {
        (self.inter_rack_capacity * NUM_PATHS).min(self.nodes_per_rack)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_count == 0 || self.node_count > MAX_NODES {
            return Err(SchedError::config(format!(
                "node count {} must be within 1..={MAX_NODES}",
                self.node_count
            )));
        }
        if self.nodes_per_rack == 0 {
            return Err(SchedError::config("nodes per rack must be non-zero"));
        }
        let expected_racks = self.node_count.div_ceil(self.nodes_per_rack);
        if self.rack_count != expected_racks {
            return Err(SchedError::config(format!(
                "{} nodes at {} per rack need {expected_racks} racks, got {}",
                self.node_count, self.nodes_per_rack, self.rack_count
            )));
        }
        if self.inter_rack_capacity > self.nodes_per_rack {
            return Err(SchedError::config(format!(
                "inter-rack capacity {} exceeds the {} nodes of a rack",
                self.inter_rack_capacity, self.nodes_per_rack
            )));
        }
        Ok(())
    }
}

impl Default for Topology {
    fn default() -> Self {
        Topology::single_rack(256)
    }
}

/// How shard matchers are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// Every shard runs on the calling thread inside `get_admissible_traffic`.
    #[default]
    Inline,
    /// One worker thread per shard, connected through rings only.
    Threaded,
}

/// Sizing and policy knobs for one scheduler instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mode: EngineMode,
    /// Number of independent matching shards (destinations are split `dst % shard_count`).
    pub shard_count: usize,
    /// Timeslots per `get_admissible_traffic` call, as a power of two.
    pub batch_shift: u32,
    /// Upper bound on `Topology::node_count` across resets; sizes admitted batches.
    pub max_nodes: usize,
    /// Admissions a destination can absorb per timeslot.
    pub dst_capacity: u16,
    /// Demand edges carried by one bin.
    pub bin_capacity: usize,
    pub bin_pool_size: usize,
    pub admitted_pool_size: usize,
    pub admitted_out_log2: u32,
    /// Per-shard demand ring size.
    pub new_demand_log2: u32,
    pub spent_log2: u32,
    /// Per-worker reply ring size (threaded mode).
    pub worker_reply_log2: u32,
    /// Attempts to enqueue a bin on a full shard ring before deferring it (threaded mode).
    pub flush_retries: u32,
    /// Cores to pin shard workers to, by shard index. Empty leaves placement to the OS.
    pub worker_cores: Vec<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: EngineMode::Inline,
            shard_count: 1,
            batch_shift: 4,
            max_nodes: 1024,
            dst_capacity: 1,
            bin_capacity: 256,
            bin_pool_size: 2048,
            admitted_pool_size: 256,
            admitted_out_log2: 8,
            new_demand_log2: 10,
            spent_log2: 15,
            worker_reply_log2: 8,
            flush_retries: 64,
            worker_cores: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn batch_size(&self) -> usize {
        1 << self.batch_shift
    }

    /// Shards that run on their own thread and therefore hold partial batches.
    pub fn threaded_shards(&self) -> usize {
        match self.mode {
            EngineMode::Inline => 0,
            EngineMode::Threaded => self.shard_count,
        }
    }

    /// Checks that do not depend on the topology or on resource objects.
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(SchedError::config("shard count must be non-zero"));
        }
        if self.batch_shift > 10 {
            return Err(SchedError::config(format!(
                "batch shift {} exceeds 10",
                self.batch_shift
            )));
        }
        if self.max_nodes == 0 || self.max_nodes > MAX_NODES {
            return Err(SchedError::config(format!(
                "max nodes {} must be within 1..={MAX_NODES}",
                self.max_nodes
            )));
        }
        if self.dst_capacity == 0 {
            return Err(SchedError::config("destination capacity must be non-zero"));
        }
        if self.bin_capacity == 0 {
            return Err(SchedError::config("bin capacity must be non-zero"));
        }
        Ok(())
    }

    /// Checks that tie this configuration to a particular topology.
    pub fn validate_topology(&self, topology: &Topology) -> Result<()> {
        topology.validate()?;
        if topology.node_count > self.max_nodes {
            return Err(SchedError::config(format!(
                "{} nodes exceed the configured maximum of {}",
                topology.node_count, self.max_nodes
            )));
        }
        if self.shard_count > topology.node_count {
            return Err(SchedError::config(format!(
                "{} shards for {} nodes leaves shards without destinations",
                self.shard_count, topology.node_count
            )));
        }
        Ok(())
    }
}
