//! Node, rack and path identifiers shared by every stage.
//!
//! Downstream forwarding expects the chosen path in the two most significant bits of a
//! 16-bit destination id. [`Destination`] is the typed view of that word; nothing else in
//! the crate packs bits by hand.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Flat node identifier, `0..node_count`.
pub type NodeId = u16;
/// Rack identifier, `node / nodes_per_rack`.
pub type RackId = u16;

/// Number of physical paths between any two racks.
pub const NUM_PATHS: usize = 4;
/// Bit position of the path id inside an encoded destination.
pub const PATH_SHIFT: u32 = 14;
/// Mask selecting the node id bits of an encoded destination.
pub const PATH_MASK: u16 = (1 << PATH_SHIFT) - 1;
/// Largest node count the destination encoding can address.
pub const MAX_NODES: usize = 1 << PATH_SHIFT;

/// One of the [`NUM_PATHS`] routes between a pair of racks.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PathId(u8);

impl PathId {
    /// Every path in ascending id order (the tie-break order of path selection).
    pub const ALL: [PathId; NUM_PATHS] = [PathId(0), PathId(1), PathId(2), PathId(3)];

    /// Build a path id, rejecting values outside `[0, NUM_PATHS)`.
    pub fn new(raw: u8) -> Option<Self> {
        ((raw as usize) < NUM_PATHS).then_some(PathId(raw))
    }

    /// Stable index for per-path arrays.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn raw(self) -> u8 {
        self.0
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "path{}", self.0)
    }
}

/// A node together with the rack it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub node: NodeId,
    pub rack: RackId,
}

impl Endpoint {
    pub fn new(node: NodeId, nodes_per_rack: usize) -> Self {
        debug_assert!(nodes_per_rack > 0);
        Endpoint {
            node,
            rack: (node as usize / nodes_per_rack) as RackId,
        }
    }

    /// Position of the node inside its rack.
    pub fn host(&self, nodes_per_rack: usize) -> u16 {
        (self.node as usize % nodes_per_rack) as u16
    }
}

/// Typed destination as seen by forwarding: rack, host within the rack, and path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub rack: RackId,
    pub host: u16,
    pub path: PathId,
}

impl Destination {
    pub fn new(endpoint: Endpoint, path: PathId, nodes_per_rack: usize) -> Self {
        Destination {
            rack: endpoint.rack,
            host: endpoint.host(nodes_per_rack),
            path,
        }
    }

    /// Flat node id addressed by this destination.
    pub fn node(&self, nodes_per_rack: usize) -> NodeId {
        (self.rack as usize * nodes_per_rack + self.host as usize) as NodeId
    }

    /// Pack into the 16-bit wire form: path in the high bits, node id below.
    pub fn encode(&self, nodes_per_rack: usize) -> u16 {
        let node = self.node(nodes_per_rack);
        debug_assert!(node <= PATH_MASK);
        ((self.path.raw() as u16) << PATH_SHIFT) | (node & PATH_MASK)
    }

    /// Unpack a 16-bit wire destination.
    pub fn decode(raw: u16, nodes_per_rack: usize) -> Self {
        let endpoint = Endpoint::new(raw & PATH_MASK, nodes_per_rack);
        // Two bits above PATH_SHIFT always fit NUM_PATHS.
        let path = PathId((raw >> PATH_SHIFT) as u8);
        Destination::new(endpoint, path, nodes_per_rack)
    }
}
