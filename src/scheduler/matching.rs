//! Per-shard matching.
//!
//! A shard owns every demand edge whose destination maps to it and turns that backlog into
//! its share of one conflict-free matching per timeslot.
//!
//! Algorithm:
//! 1. Each edge carries its backlog and a service stamp; edges are kept in a `BTreeSet`
//!    ordered by `(stamp, src, dst)`. New edges are stamped on arrival.
//! 2. For a timeslot, walk the set in order and greedily admit every edge whose source is
//!    still unclaimed, whose destination has capacity left, and (when oversubscription
//!    limits apply) whose racks still have cross-rack room.
//! 3. Every admission moves one unit of backlog and emits a spent record. An edge with
//!    backlog left is re-stamped, so it queues behind everything that has been waiting
//!    longer. That gives round-robin service per destination.
//!
//! Destinations are disjoint between shards by partitioning. Sources and rack links are
//! shared, so every timeslot carries one [`TimeslotClaims`] that visits each shard exactly
//! once, starting at shard `t % shard_count`. A shard only sees what earlier shards in the
//! pass left free, and leaves the rest to the shards after it. The start rotates with the
//! timeslot so no shard always picks first.

use crate::admitted::{AdmittedEdge, AdmittedTraffic};
use crate::config::{EngineConfig, Topology};
use crate::demand::{DemandEdge, SpentDemand};
use crate::endpoint::{Endpoint, NodeId};
use crate::error::{Result, SchedError};
use crate::partition::{shard_of, Bin};
use crate::ring::Ring;
use std::collections::{BTreeSet, HashMap};

/// Everything a shard needs to know about the fabric and its own place in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardParams {
    pub shard_id: usize,
    pub shard_count: usize,
    pub node_count: usize,
    pub nodes_per_rack: usize,
    pub rack_count: usize,
    pub dst_capacity: u16,
    /// Cross-rack admissions per rack and direction per timeslot.
    pub rack_limit: Option<usize>,
}

impl ShardParams {
    pub fn new(topology: &Topology, config: &EngineConfig, shard_id: usize) -> Self {
        Self {
            shard_id,
            shard_count: config.shard_count,
            node_count: topology.node_count,
            nodes_per_rack: topology.nodes_per_rack,
            rack_count: topology.rack_count,
            dst_capacity: config.dst_capacity,
            rack_limit: topology.oversubscribed.then(|| topology.rack_limit()),
        }
    }

    /// Parameters for every shard of an engine, in shard order.
    pub fn all(topology: &Topology, config: &EngineConfig) -> Vec<Self> {
        (0..config.shard_count)
            .map(|shard_id| Self::new(topology, config, shard_id))
            .collect()
    }

    /// Whether this shard opens the claims pass for `timeslot`.
    pub fn starts_pass(&self, timeslot: u64) -> bool {
        first_shard(timeslot, self.shard_count) == self.shard_id
    }

    /// Shard the claims move on to after this one.
    pub fn next_shard(&self) -> usize {
        (self.shard_id + 1) % self.shard_count
    }

    /// Empty claims sized for this fabric.
    pub fn new_claims(&self) -> TimeslotClaims {
        TimeslotClaims::new(self.node_count, self.rack_count)
    }
}

/// Shard that sees a timeslot's claims first.
pub fn first_shard(timeslot: u64, shard_count: usize) -> usize {
    (timeslot % shard_count as u64) as usize
}

/// Sources and cross-rack room already taken in one timeslot.
///
/// Handed from shard to shard; each shard adds its own admissions before passing it on.
#[derive(Debug, Clone)]
pub struct TimeslotClaims {
    timeslot: u64,
    visits: usize,
    src_busy: Vec<bool>,
    free_sources: usize,
    rack_out: Vec<usize>,
    rack_in: Vec<usize>,
}

impl TimeslotClaims {
    pub fn new(node_count: usize, rack_count: usize) -> Self {
        Self {
            timeslot: 0,
            visits: 0,
            src_busy: vec![false; node_count],
            free_sources: node_count,
            rack_out: vec![0; rack_count],
            rack_in: vec![0; rack_count],
        }
    }

    /// Clear every claim and stamp the claims with `timeslot`.
    pub fn begin(&mut self, timeslot: u64) {
        self.timeslot = timeslot;
        self.visits = 0;
        self.src_busy.fill(false);
        self.free_sources = self.src_busy.len();
        self.rack_out.fill(0);
        self.rack_in.fill(0);
    }

    pub fn timeslot(&self) -> u64 {
        self.timeslot
    }

    /// Shards that have matched against these claims so far.
    pub fn visits(&self) -> usize {
        self.visits
    }

    pub fn is_claimed(&self, src: NodeId) -> bool {
        self.src_busy[src as usize]
    }

    pub fn free_sources(&self) -> usize {
        self.free_sources
    }

    /// Pass the claims on for a shard that admitted nothing this timeslot.
    pub fn skip(&mut self) {
        self.visits += 1;
    }

    /// Cross-rack admissions out of and into `rack` so far.
    pub fn rack_load(&self, rack: usize) -> (usize, usize) {
        (self.rack_out[rack], self.rack_in[rack])
    }
}

#[derive(Debug, Clone, Copy)]
struct EdgeState {
    backlog: u64,
    stamp: u64,
}

type OrderKey = (u64, NodeId, NodeId);

/// Backlog and matching state of one shard.
#[derive(Debug)]
pub struct ShardMatcher {
    params: ShardParams,
    edges: HashMap<(NodeId, NodeId), EdgeState>,
    order: BTreeSet<OrderKey>,
    next_stamp: u64,
    // Per-timeslot scratch, sized once.
    dst_load: Vec<u16>,
    picked: Vec<OrderKey>,
}

impl ShardMatcher {
    pub fn new(params: ShardParams) -> Self {
        Self {
            params,
            edges: HashMap::new(),
            order: BTreeSet::new(),
            next_stamp: 0,
            dst_load: vec![0; params.node_count],
            picked: Vec::with_capacity(params.node_count),
        }
    }

    pub fn params(&self) -> &ShardParams {
        &self.params
    }

    /// Take ownership of the demand carried by `bin`.
    pub fn absorb(&mut self, bin: &Bin) {
        for edge in bin.edges() {
            self.add_demand(*edge);
        }
    }

    fn add_demand(&mut self, edge: DemandEdge) {
        debug_assert_eq!(
            shard_of(edge.dst, self.params.shard_count),
            self.params.shard_id
        );
        if edge.amount == 0 {
            return;
        }
        match self.edges.get_mut(&(edge.src, edge.dst)) {
            Some(state) => state.backlog += edge.amount as u64,
            None => {
                let stamp = self.take_stamp();
                self.edges.insert(
                    (edge.src, edge.dst),
                    EdgeState {
                        backlog: edge.amount as u64,
                        stamp,
                    },
                );
                self.order.insert((stamp, edge.src, edge.dst));
            }
        }
    }

    fn take_stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }

    /// Backlog this shard still holds for a pair.
    pub fn backlog(&self, src: NodeId, dst: NodeId) -> u64 {
        self.edges.get(&(src, dst)).map_or(0, |state| state.backlog)
    }

    pub fn total_backlog(&self) -> u64 {
        self.edges.values().map(|state| state.backlog).sum()
    }

    pub fn active_edges(&self) -> usize {
        self.edges.len()
    }

    /// Add this shard's admissions for `claims.timeslot()` to `out` and report each one on
    /// `spent`. Returns the number of edges admitted.
    ///
    /// Sources already claimed by earlier shards in the pass are skipped; the ones taken
    /// here are claimed for the shards after it.
    ///
    /// Room for every possible admission on `out` and `spent` is checked first. On error
    /// nothing has been admitted, and the claims have still been passed through.
    pub fn match_timeslot(
        &mut self,
        claims: &mut TimeslotClaims,
        out: &mut AdmittedTraffic,
        spent: &Ring<SpentDemand>,
    ) -> Result<usize> {
        let params = self.params;
        debug_assert_eq!(claims.src_busy.len(), params.node_count);
        claims.visits += 1;

        let most = claims.free_sources.min(self.order.len());
        if out.capacity() - out.size() < most {
            return Err(SchedError::BatchFull {
                capacity: out.capacity(),
            });
        }
        if spent.free_slots() < most {
            return Err(SchedError::QueueFull { queue: "spent" });
        }

        self.dst_load.fill(0);
        self.picked.clear();

        for &(stamp, src, dst) in &self.order {
            if claims.free_sources == 0 {
                break;
            }
            let (s, d) = (src as usize, dst as usize);
            if claims.src_busy[s] || self.dst_load[d] >= params.dst_capacity {
                continue;
            }
            let src_rack = s / params.nodes_per_rack;
            let dst_rack = d / params.nodes_per_rack;
            let inter_rack = src_rack != dst_rack;
            if let Some(limit) = params.rack_limit {
                if inter_rack
                    && (claims.rack_out[src_rack] >= limit || claims.rack_in[dst_rack] >= limit)
                {
                    continue;
                }
            }

            claims.src_busy[s] = true;
            claims.free_sources -= 1;
            self.dst_load[d] += 1;
            if inter_rack {
                claims.rack_out[src_rack] += 1;
                claims.rack_in[dst_rack] += 1;
            }
            self.picked.push((stamp, src, dst));
        }

        let picked = std::mem::take(&mut self.picked);
        for &(stamp, src, dst) in &picked {
            out.push(AdmittedEdge::new(
                Endpoint::new(src, params.nodes_per_rack),
                Endpoint::new(dst, params.nodes_per_rack),
            ))?;
            spent
                .enqueue(SpentDemand {
                    src,
                    dst,
                    amount: 1,
                })
                .map_err(|_| SchedError::QueueFull { queue: "spent" })?;
            self.serve(stamp, src, dst);
        }
        let admitted = picked.len();
        self.picked = picked;
        Ok(admitted)
    }

    /// Consume one unit of backlog and move the edge to the back of the order.
    fn serve(&mut self, stamp: u64, src: NodeId, dst: NodeId) {
        self.order.remove(&(stamp, src, dst));
        let remaining = match self.edges.get_mut(&(src, dst)) {
            Some(state) => {
                state.backlog -= 1;
                state.backlog
            }
            None => return,
        };
        if remaining == 0 {
            self.edges.remove(&(src, dst));
            return;
        }
        let stamp = self.take_stamp();
        if let Some(state) = self.edges.get_mut(&(src, dst)) {
            state.stamp = stamp;
        }
        self.order.insert((stamp, src, dst));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MatcherHarness {
        matcher: ShardMatcher,
        claims: TimeslotClaims,
        spent: Ring<SpentDemand>,
    }

    impl MatcherHarness {
        fn new(topology: Topology, shard_count: usize, shard_id: usize) -> Self {
            let config = EngineConfig {
                shard_count,
                ..EngineConfig::default()
            };
            let params = ShardParams::new(&topology, &config, shard_id);
            Self {
                matcher: ShardMatcher::new(params),
                claims: params.new_claims(),
                spent: Ring::with_log2_capacity(8).unwrap(),
            }
        }

        fn demand(&mut self, src: NodeId, dst: NodeId, amount: u32) {
            let mut bin = Bin::with_capacity(1);
            bin.push(DemandEdge { src, dst, amount });
            self.matcher.absorb(&bin);
        }

        /// Match `timeslot` with fresh claims.
        fn step(&mut self, timeslot: u64) -> Vec<(NodeId, NodeId)> {
            self.claims.begin(timeslot);
            self.continue_pass()
        }

        /// Match against whatever the claims already hold.
        fn continue_pass(&mut self) -> Vec<(NodeId, NodeId)> {
            let mut out = AdmittedTraffic::with_capacity(64);
            out.reset(self.claims.timeslot());
            self.matcher
                .match_timeslot(&mut self.claims, &mut out, &self.spent)
                .unwrap();
            out.edges()
                .iter()
                .map(|edge| (edge.src.node, edge.dst.node))
                .collect()
        }
    }

    #[test]
    fn source_sends_to_one_destination_per_timeslot() {
        let mut harness = MatcherHarness::new(Topology::single_rack(4), 1, 0);
        harness.demand(0, 1, 1);
        harness.demand(0, 2, 1);

        assert_eq!(harness.step(0), vec![(0, 1)]);
        assert_eq!(harness.matcher.backlog(0, 2), 1);
        assert_eq!(harness.step(1), vec![(0, 2)]);
        assert_eq!(harness.matcher.active_edges(), 0);
    }

    #[test]
    fn destination_is_served_round_robin() {
        let mut harness = MatcherHarness::new(Topology::single_rack(8), 1, 0);
        harness.demand(0, 5, 2);
        harness.demand(1, 5, 2);

        assert_eq!(harness.step(0), vec![(0, 5)]);
        assert_eq!(harness.step(1), vec![(1, 5)]);
        assert_eq!(harness.step(2), vec![(0, 5)]);
        assert_eq!(harness.step(3), vec![(1, 5)]);
        assert_eq!(harness.matcher.total_backlog(), 0);
    }

    #[test]
    fn spent_records_follow_admissions() {
        let mut harness = MatcherHarness::new(Topology::single_rack(4), 1, 0);
        harness.demand(2, 3, 3);
        harness.step(0);
        let spent: Vec<SpentDemand> = harness.spent.drain().collect();
        assert_eq!(
            spent,
            vec![SpentDemand {
                src: 2,
                dst: 3,
                amount: 1
            }]
        );
        assert_eq!(harness.matcher.backlog(2, 3), 2);
    }

    #[test]
    fn sources_claimed_earlier_in_the_pass_are_skipped() {
        // Shard 0 of 2 owns even destinations.
        let mut harness = MatcherHarness::new(Topology::single_rack(4), 2, 0);
        harness.demand(1, 0, 1);
        harness.demand(3, 2, 1);

        harness.claims.begin(1);
        harness.claims.src_busy[1] = true;
        harness.claims.free_sources -= 1;
        assert_eq!(harness.continue_pass(), vec![(3, 2)]);
        assert!(harness.claims.is_claimed(3));
        assert_eq!(harness.claims.visits(), 1);
        assert_eq!(harness.matcher.backlog(1, 0), 1);
    }

    #[test]
    fn any_shard_serves_any_free_source() {
        let mut harness = MatcherHarness::new(Topology::single_rack(8), 4, 1);
        harness.demand(0, 1, 8);
        for timeslot in 0..8 {
            assert_eq!(harness.step(timeslot), vec![(0, 1)]);
        }
        assert_eq!(harness.matcher.total_backlog(), 0);
    }

    #[test]
    fn oversubscribed_racks_cap_cross_rack_admissions() {
        // No inter-rack capacity at all: only intra-rack traffic gets through.
        let topology = Topology::racks(2, 4, 0).with_oversubscription();
        let mut harness = MatcherHarness::new(topology, 1, 0);
        harness.demand(0, 4, 1);
        harness.demand(1, 2, 1);

        assert_eq!(harness.step(0), vec![(1, 2)]);
        assert_eq!(harness.matcher.backlog(0, 4), 1);
    }

    #[test]
    fn rack_limit_counts_each_direction() {
        let topology = Topology {
            node_count: 16,
            rack_count: 2,
            nodes_per_rack: 8,
            inter_rack_capacity: 1,
            oversubscribed: true,
        };
        let mut harness = MatcherHarness::new(topology, 1, 0);
        // Five flows out of rack 0; the limit is 1 * NUM_PATHS = 4.
        for src in 0..5 {
            harness.demand(src, 8 + src, 1);
        }
        assert_eq!(harness.step(0).len(), 4);
        assert_eq!(harness.claims.rack_load(0), (4, 0));
        assert_eq!(harness.step(1).len(), 1);
    }

    #[test]
    fn rack_room_used_earlier_in_the_pass_is_respected() {
        let topology = Topology::racks(2, 8, 1).with_oversubscription();
        let mut harness = MatcherHarness::new(topology, 2, 0);
        harness.demand(0, 8, 1);

        harness.claims.begin(0);
        harness.claims.rack_in[1] = 4;
        assert!(harness.continue_pass().is_empty());
        assert_eq!(harness.matcher.backlog(0, 8), 1);
    }

    #[test]
    fn full_spent_ring_is_reported() {
        let mut harness = MatcherHarness::new(Topology::single_rack(4), 1, 0);
        harness.spent = Ring::with_log2_capacity(0).unwrap();
        harness.demand(0, 1, 1);
        harness.demand(2, 3, 1);

        let mut out = AdmittedTraffic::with_capacity(4);
        harness.claims.begin(0);
        let err = harness
            .matcher
            .match_timeslot(&mut harness.claims, &mut out, &harness.spent)
            .unwrap_err();
        assert_eq!(err, SchedError::QueueFull { queue: "spent" });
        assert!(out.is_empty());
        assert!(harness.spent.is_empty());
        assert_eq!(harness.claims.free_sources(), 4);
        assert_eq!(harness.claims.visits(), 1);
        assert_eq!(harness.matcher.total_backlog(), 2);
    }

    #[test]
    fn full_batch_is_reported_before_admitting() {
        let mut harness = MatcherHarness::new(Topology::single_rack(4), 1, 0);
        harness.demand(0, 1, 1);
        harness.demand(2, 3, 1);

        let mut out = AdmittedTraffic::with_capacity(1);
        harness.claims.begin(0);
        let err = harness
            .matcher
            .match_timeslot(&mut harness.claims, &mut out, &harness.spent)
            .unwrap_err();
        assert_eq!(err, SchedError::BatchFull { capacity: 1 });
        assert!(harness.spent.is_empty());
        assert_eq!(harness.matcher.backlog(0, 1), 1);
    }

    #[test]
    fn pass_start_rotates_with_the_timeslot() {
        let topology = Topology::single_rack(8);
        let config = EngineConfig {
            shard_count: 3,
            ..EngineConfig::default()
        };
        let params = ShardParams::all(&topology, &config);
        for timeslot in 0..6 {
            let starters: Vec<usize> = params
                .iter()
                .filter(|p| p.starts_pass(timeslot))
                .map(|p| p.shard_id)
                .collect();
            assert_eq!(starters, vec![timeslot as usize % 3]);
        }
        assert_eq!(params[2].next_shard(), 0);
    }
}
