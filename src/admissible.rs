//! The admissible-traffic engine: demand in, conflict-free timeslot schedules out.
//!
//! [`AdmissibleState`] is the caller-owned context tying together the demand ledger, the
//! partitioner, the shard matchers and the rings and pools they talk through. A driver
//! runs one batch as follows:
//!
//! 1. [`add_backlog`](AdmissibleState::add_backlog) for every new request,
//! 2. [`flush_backlog`](AdmissibleState::flush_backlog),
//! 3. [`get_admissible_traffic`](AdmissibleState::get_admissible_traffic),
//! 4. [`handle_spent_demands`](AdmissibleState::handle_spent_demands),
//! 5. drain exactly one batch worth of results from
//!    [`q_admitted_out`](AdmissibleState::q_admitted_out) and drop them back into the pool.
//!
//! Backlog that is not admitted stays with the shard that owns its destination and takes
//! part in every following timeslot until it is served.

use crate::admitted::AdmittedTraffic;
use crate::config::{EngineConfig, Topology};
use crate::demand::{DemandEdge, DemandLedger, SpentDemand};
use crate::endpoint::NodeId;
use crate::error::{Result, SchedError};
use crate::partition::{Bin, FlushReport, Partitioner};
use crate::pool::{ObjectPool, PoolStats, Pooled};
use crate::ring::Ring;
use crate::scheduler::{ShardExecutor, ShardParams};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Rings and pools the engine runs on. They are created outside the engine and survive
/// every [`AdmissibleState::reset`].
#[derive(Debug, Clone)]
pub struct AdmissibleResources {
    /// One demand ring per shard, indexed by shard.
    pub q_new_demands: Vec<Ring<Pooled<Bin>>>,
    pub q_admitted_out: Ring<Pooled<AdmittedTraffic>>,
    pub q_spent: Ring<SpentDemand>,
    pub bin_pool: ObjectPool<Bin>,
    pub admitted_pool: ObjectPool<AdmittedTraffic>,
}

impl AdmissibleResources {
    /// Allocate every ring and pool with the sizes named in `config`.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        if config.bin_pool_size == 0 || config.admitted_pool_size == 0 {
            return Err(SchedError::config("pool sizes must be non-zero"));
        }
        let q_new_demands = (0..config.shard_count)
            .map(|_| Ring::with_log2_capacity(config.new_demand_log2))
            .collect::<Result<Vec<_>>>()?;
        let bin_capacity = config.bin_capacity;
        let edges_per_batch = config.max_nodes;
        Ok(Self {
            q_new_demands,
            q_admitted_out: Ring::with_log2_capacity(config.admitted_out_log2)?,
            q_spent: Ring::with_log2_capacity(config.spent_log2)?,
            bin_pool: ObjectPool::new(config.bin_pool_size, || Bin::with_capacity(bin_capacity)),
            admitted_pool: ObjectPool::new(config.admitted_pool_size, || {
                AdmittedTraffic::with_capacity(edges_per_batch)
            }),
        })
    }

    /// Refuse resources too small for one batch of `config` on `topology`.
    fn check_sizing(&self, config: &EngineConfig, topology: &Topology) -> Result<()> {
        let batch = config.batch_size();
        if self.q_new_demands.len() != config.shard_count {
            return Err(SchedError::config(format!(
                "{} demand rings for {} shards",
                self.q_new_demands.len(),
                config.shard_count
            )));
        }
        if self.q_admitted_out.capacity() < batch {
            return Err(SchedError::config(format!(
                "admitted output ring holds {} batches, one call produces {batch}",
                self.q_admitted_out.capacity()
            )));
        }
        let spent_needed = batch * topology.node_count;
        if self.q_spent.capacity() < spent_needed {
            return Err(SchedError::config(format!(
                "spent ring holds {} records, one call may produce {spent_needed}",
                self.q_spent.capacity()
            )));
        }
        let admitted_needed = batch * (1 + config.threaded_shards());
        if self.admitted_pool.capacity() < admitted_needed {
            return Err(SchedError::config(format!(
                "admitted pool holds {} objects, one call needs {admitted_needed}",
                self.admitted_pool.capacity()
            )));
        }
        if self.bin_pool.capacity() < config.shard_count {
            return Err(SchedError::config(format!(
                "bin pool holds {} bins for {} shards",
                self.bin_pool.capacity(),
                config.shard_count
            )));
        }
        if config.threaded_shards() > 0 && (1usize << config.worker_reply_log2) < batch {
            return Err(SchedError::config(format!(
                "worker reply ring holds {} replies, one call produces {batch}",
                1usize << config.worker_reply_log2
            )));
        }
        Ok(())
    }
}

/// Outcome of one [`AdmissibleState::get_admissible_traffic`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub first_timeslot: u64,
    /// Batches enqueued on the output ring, one per timeslot.
    pub timeslots: usize,
    pub admitted: usize,
}

/// Counters since the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub batches: u64,
    pub timeslots: u64,
    pub admitted_edges: u64,
    pub spent_handled: u64,
    pub edges_flushed: u64,
    /// Edges left waiting after the most recent flush.
    pub edges_deferred: u64,
    pub outstanding_backlog: u64,
    pub bin_pool: PoolStats,
    pub admitted_pool: PoolStats,
}

/// Scheduler context for one fabric.
#[derive(Debug)]
pub struct AdmissibleState {
    topology: Topology,
    config: EngineConfig,
    resources: AdmissibleResources,
    ledger: DemandLedger,
    partitioner: Partitioner,
    executor: ShardExecutor,
    next_timeslot: u64,
    stats: EngineStats,
}

impl AdmissibleState {
    /// Validate everything and wire the engine onto `resources`.
    ///
    /// # Arguments
    /// * `topology` - Fabric to schedule
    /// * `config` - Shard count, batch size and execution mode
    /// * `resources` - Rings and pools, usually from [`AdmissibleResources::from_config`]
    ///
    /// # Returns
    /// The ready engine, or a `Configuration` error when anything is inconsistent or
    /// undersized.
    pub fn new(
        topology: Topology,
        config: EngineConfig,
        resources: AdmissibleResources,
    ) -> Result<Self> {
        config.validate()?;
        config.validate_topology(&topology)?;
        resources.check_sizing(&config, &topology)?;

        let executor = ShardExecutor::new(
            &config,
            ShardParams::all(&topology, &config),
            &resources.q_new_demands,
            &resources.q_spent,
            &resources.admitted_pool,
        )?;
        let retries = if executor.is_threaded() {
            config.flush_retries
        } else {
            // The consumer is this thread; waiting on a full ring cannot help.
            0
        };

        info!(
            nodes = topology.node_count,
            racks = topology.rack_count,
            nodes_per_rack = topology.nodes_per_rack,
            inter_rack_capacity = topology.inter_rack_capacity,
            oversubscribed = topology.oversubscribed,
            shards = config.shard_count,
            mode = ?config.mode,
            batch = config.batch_size(),
            "admissible state initialized"
        );

        Ok(Self {
            ledger: DemandLedger::new(topology.node_count),
            partitioner: Partitioner::new(config.shard_count, retries),
            topology,
            config,
            resources,
            executor,
            next_timeslot: 0,
            stats: EngineStats::default(),
        })
    }

    /// Start a new experiment on `topology`, keeping every ring and pool.
    ///
    /// All demand, queued results and matcher state are discarded and the timeslot
    /// counter restarts at zero.
    ///
    /// A topology or sizing error is reported before anything is touched, so the engine
    /// is left unchanged. `WorkerStopped` from a threaded reset may leave some shards
    /// reset and others not; the engine should be dropped after it.
    pub fn reset(&mut self, topology: Topology) -> Result<()> {
        self.config.validate_topology(&topology)?;
        self.resources.check_sizing(&self.config, &topology)?;

        self.executor.reset(
            ShardParams::all(&topology, &self.config),
            &self.resources.q_new_demands,
        )?;
        self.partitioner.clear();
        for ring in &self.resources.q_new_demands {
            ring.drain().for_each(drop);
        }
        self.resources.q_spent.drain().for_each(drop);
        self.resources.q_admitted_out.drain().for_each(drop);
        self.ledger.reset(topology.node_count);
        self.topology = topology;
        self.next_timeslot = 0;
        self.stats = EngineStats::default();

        info!(
            nodes = topology.node_count,
            racks = topology.rack_count,
            inter_rack_capacity = topology.inter_rack_capacity,
            oversubscribed = topology.oversubscribed,
            "admissible state reset"
        );
        Ok(())
    }

    /// Record `amount` more backlog from `src` to `dst`.
    ///
    /// The demand reaches the matchers on the next [`flush_backlog`](Self::flush_backlog).
    pub fn add_backlog(&mut self, src: NodeId, dst: NodeId, amount: u32) -> Result<()> {
        self.ledger.add(src, dst, amount)?;
        if amount > 0 {
            self.partitioner.stage(DemandEdge { src, dst, amount });
        }
        Ok(())
    }

    /// Hand staged demand to the shards. Nothing is dropped: whatever does not fit is
    /// reported as deferred and goes out first on the next flush.
    pub fn flush_backlog(&mut self) -> FlushReport {
        let mut report =
            self.partitioner
                .flush(&self.resources.bin_pool, &self.resources.q_new_demands);

        // Inline matchers can take demand off the rings right here, which frees both ring
        // slots and bins for whatever was deferred.
        while !report.is_complete()
            && self.executor.absorb_queued(&self.resources.q_new_demands)
        {
            let retry = self
                .partitioner
                .flush(&self.resources.bin_pool, &self.resources.q_new_demands);
            report.bins_enqueued += retry.bins_enqueued;
            report.edges_flushed += retry.edges_flushed;
            report.edges_deferred = retry.edges_deferred;
            if retry.edges_flushed == 0 {
                break;
            }
        }

        if !report.is_complete() {
            debug!(
                deferred = report.edges_deferred,
                flushed = report.edges_flushed,
                "flush left demand deferred"
            );
        }
        self.stats.edges_flushed += report.edges_flushed as u64;
        self.stats.edges_deferred = report.edges_deferred as u64;
        report
    }

    /// Compute the next batch of timeslots and enqueue one admitted batch per timeslot on
    /// the output ring.
    ///
    /// Output room, spent-ring room and pool objects for the whole batch are checked up
    /// front; a shortage is reported before anything is produced and the timeslot counter
    /// stays put. An error from the shards themselves still consumes the batch's
    /// timeslots: whatever was admitted is on the output ring and the spent ring, and the
    /// next call starts after the failed batch.
    pub fn get_admissible_traffic(&mut self) -> Result<BatchSummary> {
        let batch = self.config.batch_size();
        let resources = &self.resources;
        if resources.q_admitted_out.free_slots() < batch {
            return Err(SchedError::QueueFull {
                queue: "admitted_out",
            });
        }
        if resources.q_spent.free_slots() < batch * self.topology.node_count {
            return Err(SchedError::QueueFull { queue: "spent" });
        }
        // Each worker takes all of its partials before matching anything.
        let pool_needed = batch * self.config.threaded_shards().max(1);
        if resources.admitted_pool.available() < pool_needed {
            return Err(SchedError::PoolExhausted {
                pool: "admitted_traffic",
            });
        }

        let first_timeslot = self.next_timeslot;
        let result = self.executor.run_batch(
            first_timeslot,
            batch,
            &resources.q_new_demands,
            &resources.q_spent,
            &resources.admitted_pool,
            &resources.q_admitted_out,
        );
        self.next_timeslot += batch as u64;
        self.stats.batches += 1;
        self.stats.timeslots += batch as u64;
        let admitted = match result {
            Ok(admitted) => admitted,
            Err(err) => {
                warn!(first_timeslot, timeslots = batch, error = %err, "batch failed");
                return Err(err);
            }
        };

        self.stats.admitted_edges += admitted as u64;
        debug!(first_timeslot, timeslots = batch, admitted, "batch computed");

        Ok(BatchSummary {
            first_timeslot,
            timeslots: batch,
            admitted,
        })
    }

    /// Apply every queued spent record to the ledger. Returns the number of records.
    ///
    /// A record larger than the pair's outstanding backlog stops the drain with
    /// `LedgerUnderflow`, which names the pair and the amount. That record is not applied;
    /// records before it are, and records after it stay queued for the next call.
    pub fn handle_spent_demands(&mut self) -> Result<usize> {
        let mut handled = 0;
        let mut failed = None;
        while let Some(spent) = self.resources.q_spent.dequeue() {
            if let Err(err) = self.ledger.spend(spent) {
                failed = Some(err);
                break;
            }
            handled += 1;
        }
        self.stats.spent_handled += handled as u64;
        match failed {
            Some(err) => {
                warn!(error = %err, handled, "spent record rejected");
                Err(err)
            }
            None => Ok(handled),
        }
    }

    /// Take every admitted batch currently on the output ring, oldest first.
    pub fn drain_admitted(&self) -> Vec<Pooled<AdmittedTraffic>> {
        self.resources.q_admitted_out.drain().collect()
    }

    pub fn q_admitted_out(&self) -> &Ring<Pooled<AdmittedTraffic>> {
        &self.resources.q_admitted_out
    }

    pub fn admitted_traffic_pool(&self) -> &ObjectPool<AdmittedTraffic> {
        &self.resources.admitted_pool
    }

    pub fn bin_pool(&self) -> &ObjectPool<Bin> {
        &self.resources.bin_pool
    }

    pub fn ledger(&self) -> &DemandLedger {
        &self.ledger
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size()
    }

    /// First timeslot of the next batch.
    pub fn next_timeslot(&self) -> u64 {
        self.next_timeslot
    }

    /// Edges added but not yet handed to a shard.
    pub fn pending_edges(&self) -> usize {
        self.partitioner.pending_edges()
    }

    /// Backlog held by the shard matchers; `None` when they run on worker threads.
    pub fn shard_backlog(&self) -> Option<u64> {
        self.executor.total_backlog()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            outstanding_backlog: self.ledger.total_outstanding(),
            bin_pool: self.resources.bin_pool.stats(),
            admitted_pool: self.resources.admitted_pool.stats(),
            ..self.stats
        }
    }
}
