//! Path selection for admitted traffic, plus the independent validator.
//!
//! Every rack reaches every other rack over [`NUM_PATHS`] paths. A cross-rack flow on path
//! `p` uses the source rack's uplink `p` and the destination rack's downlink `p`; each link
//! carries at most `link_capacity` flows per timeslot. Same-rack flows never touch these
//! links.
//!
//! Selection walks the batch in order and gives each cross-rack edge the path whose busier
//! link is least loaded, lowest path id on ties. When every path is already at capacity
//! the edge is still placed on that least-loaded path and counted as overbooked, so the
//! schedule stays complete and [`paths_are_valid`] reports the violation.

use crate::admitted::AdmittedTraffic;
use crate::endpoint::{PathId, RackId, NUM_PATHS};
use crate::error::{Result, SchedError};
use serde::Serialize;
use tracing::warn;

/// Per-link flow counts for one timeslot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkLoads {
    uplinks: Vec<[usize; NUM_PATHS]>,
    downlinks: Vec<[usize; NUM_PATHS]>,
}

impl LinkLoads {
    pub fn new(rack_count: usize) -> Self {
        Self {
            uplinks: vec![[0; NUM_PATHS]; rack_count],
            downlinks: vec![[0; NUM_PATHS]; rack_count],
        }
    }

    /// Zero every counter, resizing for `rack_count` racks.
    pub fn clear(&mut self, rack_count: usize) {
        self.uplinks.clear();
        self.uplinks.resize(rack_count, [0; NUM_PATHS]);
        self.downlinks.clear();
        self.downlinks.resize(rack_count, [0; NUM_PATHS]);
    }

    pub fn rack_count(&self) -> usize {
        self.uplinks.len()
    }

    /// Flows leaving `rack` on `path`.
    pub fn uplink(&self, rack: RackId, path: PathId) -> usize {
        self.uplinks[rack as usize][path.index()]
    }

    /// Flows entering `rack` on `path`.
    pub fn downlink(&self, rack: RackId, path: PathId) -> usize {
        self.downlinks[rack as usize][path.index()]
    }

    /// Load of the busier of the two links a `src -> dst` flow on `path` would use.
    fn worse_link(&self, src: RackId, dst: RackId, path: PathId) -> usize {
        self.uplink(src, path).max(self.downlink(dst, path))
    }

    fn add(&mut self, src: RackId, dst: RackId, path: PathId) {
        self.uplinks[src as usize][path.index()] += 1;
        self.downlinks[dst as usize][path.index()] += 1;
    }

    /// Heaviest link in the fabric.
    pub fn max_load(&self) -> usize {
        self.uplinks
            .iter()
            .chain(&self.downlinks)
            .flat_map(|paths| paths.iter().copied())
            .max()
            .unwrap_or(0)
    }

    pub fn within(&self, link_capacity: usize) -> bool {
        self.max_load() <= link_capacity
    }
}

/// What one [`PathSelector::select_paths`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PathSelection {
    pub inter_rack: usize,
    pub intra_rack: usize,
    /// Cross-rack edges placed on a path that was already at capacity.
    pub overbooked: usize,
}

/// Reusable path selector; keeps its link counters between calls to avoid reallocating.
#[derive(Debug, Clone)]
pub struct PathSelector {
    link_capacity: usize,
    loads: LinkLoads,
}

impl PathSelector {
    pub fn new(link_capacity: usize) -> Self {
        Self {
            link_capacity,
            loads: LinkLoads::new(0),
        }
    }

    pub fn link_capacity(&self) -> usize {
        self.link_capacity
    }

    /// Link loads left by the last selection.
    pub fn loads(&self) -> &LinkLoads {
        &self.loads
    }

    /// Choose a path for every edge of `batch` and store it on the edge.
    ///
    /// The chosen path ends up in the top bits of each edge's
    /// [`Destination`](crate::endpoint::Destination) encoding. If any edge names a rack
    /// outside `0..rack_count` the batch is left untouched and `RackOutOfRange` is returned.
    pub fn select_paths(
        &mut self,
        batch: &mut AdmittedTraffic,
        rack_count: usize,
    ) -> Result<PathSelection> {
        check_racks(batch, rack_count)?;
        self.loads.clear(rack_count);

        let mut selection = PathSelection::default();
        for edge in batch.edges_mut() {
            if !edge.is_inter_rack() {
                edge.path = PathId::default();
                selection.intra_rack += 1;
                continue;
            }

            let (src, dst) = (edge.src.rack, edge.dst.rack);
            let mut best = PathId::default();
            let mut best_load = usize::MAX;
            for path in PathId::ALL {
                let load = self.loads.worse_link(src, dst, path);
                if load < best_load {
                    best = path;
                    best_load = load;
                }
            }
            if best_load >= self.link_capacity {
                selection.overbooked += 1;
            }
            self.loads.add(src, dst, best);
            edge.path = best;
            selection.inter_rack += 1;
        }

        if selection.overbooked > 0 {
            warn!(
                timeslot = batch.timeslot(),
                overbooked = selection.overbooked,
                link_capacity = self.link_capacity,
                "no path with spare capacity, links overbooked"
            );
        }
        Ok(selection)
    }
}

/// One-shot form of [`PathSelector::select_paths`].
pub fn select_paths(
    batch: &mut AdmittedTraffic,
    rack_count: usize,
    link_capacity: usize,
) -> Result<PathSelection> {
    PathSelector::new(link_capacity).select_paths(batch, rack_count)
}

/// Recount link usage from the paths stored on `batch`. `None` if an edge names a rack
/// outside `0..rack_count`.
pub fn link_loads(batch: &AdmittedTraffic, rack_count: usize) -> Option<LinkLoads> {
    check_racks(batch, rack_count).ok()?;
    let mut loads = LinkLoads::new(rack_count);
    for edge in batch.edges().iter().filter(|edge| edge.is_inter_rack()) {
        loads.add(edge.src.rack, edge.dst.rack, edge.path);
    }
    Some(loads)
}

/// Whether every inter-rack link stays within `link_capacity` under the paths stored on
/// `batch`. Pure; shares no state with any selector.
pub fn paths_are_valid(batch: &AdmittedTraffic, rack_count: usize, link_capacity: usize) -> bool {
    link_loads(batch, rack_count).is_some_and(|loads| loads.within(link_capacity))
}

fn check_racks(batch: &AdmittedTraffic, rack_count: usize) -> Result<()> {
    for edge in batch.edges() {
        for rack in [edge.src.rack, edge.dst.rack] {
            if rack as usize >= rack_count {
                return Err(SchedError::RackOutOfRange { rack, rack_count });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admitted::AdmittedEdge;
    use crate::endpoint::{Endpoint, NodeId};

    fn batch(nodes_per_rack: usize, pairs: &[(NodeId, NodeId)]) -> AdmittedTraffic {
        let mut batch = AdmittedTraffic::with_capacity(pairs.len());
        for &(src, dst) in pairs {
            batch
                .push(AdmittedEdge::new(
                    Endpoint::new(src, nodes_per_rack),
                    Endpoint::new(dst, nodes_per_rack),
                ))
                .unwrap();
        }
        batch
    }

    fn paths(batch: &AdmittedTraffic) -> Vec<u8> {
        batch.edges().iter().map(|edge| edge.path.raw()).collect()
    }

    #[test]
    fn two_cross_rack_flows_take_different_paths() {
        let mut admitted = batch(4, &[(0, 4), (1, 5)]);
        let selection = select_paths(&mut admitted, 2, 1).unwrap();
        assert_eq!(selection.inter_rack, 2);
        assert_eq!(selection.overbooked, 0);
        assert_eq!(paths(&admitted), vec![0, 1]);
        assert!(paths_are_valid(&admitted, 2, 1));
    }

    #[test]
    fn same_rack_flows_bypass_links() {
        let mut admitted = batch(4, &[(0, 1), (2, 3), (4, 5)]);
        let selection = select_paths(&mut admitted, 2, 0).unwrap();
        assert_eq!(selection.intra_rack, 3);
        assert_eq!(paths(&admitted), vec![0, 0, 0]);
        assert!(paths_are_valid(&admitted, 2, 0));
    }

    #[test]
    fn saturated_links_overbook_least_loaded_path() {
        // Five flows out of rack 0 with four single-flow paths.
        let mut admitted = batch(8, &[(0, 8), (1, 9), (2, 10), (3, 11), (4, 12)]);
        let selection = select_paths(&mut admitted, 2, 1).unwrap();
        assert_eq!(selection.overbooked, 1);
        assert_eq!(paths(&admitted), vec![0, 1, 2, 3, 0]);
        assert!(!paths_are_valid(&admitted, 2, 1));
        assert_eq!(link_loads(&admitted, 2).unwrap().max_load(), 2);
    }

    #[test]
    fn selection_balances_across_racks() {
        // Rack 0 -> 1 takes path 0; rack 2 -> 1 must avoid downlink (1, path 0).
        let mut admitted = batch(2, &[(0, 2), (4, 3)]);
        select_paths(&mut admitted, 3, 1).unwrap();
        assert_eq!(paths(&admitted), vec![0, 1]);
    }

    #[test]
    fn unknown_rack_is_an_error_and_invalid() {
        let mut admitted = batch(4, &[(0, 9)]);
        assert_eq!(
            select_paths(&mut admitted, 2, 1),
            Err(SchedError::RackOutOfRange {
                rack: 2,
                rack_count: 2
            })
        );
        assert!(!paths_are_valid(&admitted, 2, 1));
    }

    #[test]
    fn validator_sees_hand_placed_paths() {
        let mut admitted = batch(4, &[(0, 4), (1, 5)]);
        assert!(!paths_are_valid(&admitted, 2, 1));
        admitted.edges_mut()[1].path = PathId::new(3).unwrap();
        assert!(paths_are_valid(&admitted, 2, 1));
    }

    #[test]
    fn selector_reuses_counters_between_batches() {
        let mut selector = PathSelector::new(1);
        let mut first = batch(4, &[(0, 4), (1, 5)]);
        let mut second = batch(4, &[(2, 6)]);
        selector.select_paths(&mut first, 2).unwrap();
        selector.select_paths(&mut second, 2).unwrap();
        assert_eq!(paths(&second), vec![0]);
        assert_eq!(selector.loads().uplink(0, PathId::default()), 1);
    }
}
