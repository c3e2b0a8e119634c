//! Matching stages.
//!
//! [`matching`] holds the per-shard algorithm; [`shard_worker`] runs shards on their own
//! threads. [`ShardExecutor`] hides which of the two execution models is in use.

pub mod matching;
pub mod shard_worker;

pub use matching::{first_shard, ShardMatcher, ShardParams, TimeslotClaims};
pub use shard_worker::{ShardCommand, ShardReply, ShardWorkers};

use crate::admitted::AdmittedTraffic;
use crate::config::{EngineConfig, EngineMode};
use crate::demand::SpentDemand;
use crate::error::{Result, SchedError};
use crate::partition::Bin;
use crate::pool::{ObjectPool, Pooled};
use crate::ring::Ring;

/// Runs the shard matchers for one batch of timeslots.
#[derive(Debug)]
pub enum ShardExecutor {
    /// All shards on the calling thread. Each timeslot's claims visit the shards starting
    /// at [`first_shard`].
    Inline {
        matchers: Vec<ShardMatcher>,
        claims: TimeslotClaims,
    },
    /// One worker thread per shard.
    Threaded(ShardWorkers),
}

impl ShardExecutor {
    pub fn new(
        config: &EngineConfig,
        params: Vec<ShardParams>,
        demand: &[Ring<Pooled<Bin>>],
        spent: &Ring<SpentDemand>,
        pool: &ObjectPool<AdmittedTraffic>,
    ) -> Result<Self> {
        match config.mode {
            EngineMode::Inline => Ok(inline(params)),
            EngineMode::Threaded => Ok(ShardExecutor::Threaded(ShardWorkers::spawn(
                params,
                demand,
                spent,
                pool,
                config.worker_reply_log2,
                &config.worker_cores,
            )?)),
        }
    }

    /// Compute `count` timeslots from `first_timeslot` and enqueue one batch per timeslot
    /// on `out`. Returns the number of admitted edges.
    pub fn run_batch(
        &mut self,
        first_timeslot: u64,
        count: usize,
        demand: &[Ring<Pooled<Bin>>],
        spent: &Ring<SpentDemand>,
        pool: &ObjectPool<AdmittedTraffic>,
        out: &Ring<Pooled<AdmittedTraffic>>,
    ) -> Result<usize> {
        match self {
            ShardExecutor::Inline { matchers, claims } => {
                absorb_into(matchers, demand);

                let shard_count = matchers.len();
                let mut admitted = 0;
                for offset in 0..count as u64 {
                    let timeslot = first_timeslot + offset;
                    let mut batch = pool.acquire().ok_or(SchedError::PoolExhausted {
                        pool: "admitted_traffic",
                    })?;
                    batch.reset(timeslot);
                    claims.begin(timeslot);
                    let start = first_shard(timeslot, shard_count);
                    for position in 0..shard_count {
                        let matcher = &mut matchers[(start + position) % shard_count];
                        if let Err(err) = matcher.match_timeslot(claims, &mut batch, spent) {
                            // Earlier shards' admissions were already reported as spent.
                            admitted += batch.size();
                            let _ = out.enqueue(batch);
                            return Err(err);
                        }
                    }
                    admitted += batch.size();
                    out.enqueue(batch).map_err(|_| SchedError::QueueFull {
                        queue: "admitted_out",
                    })?;
                }
                Ok(admitted)
            }
            ShardExecutor::Threaded(workers) => workers.run_batch(first_timeslot, count, out),
        }
    }

    /// Move queued demand into the inline matchers, freeing ring slots and bins. Threaded
    /// workers absorb on their own, so this returns `false` for them.
    pub fn absorb_queued(&mut self, demand: &[Ring<Pooled<Bin>>]) -> bool {
        match self {
            ShardExecutor::Inline { matchers, .. } => absorb_into(matchers, demand),
            ShardExecutor::Threaded(_) => false,
        }
    }

    /// Throw away all matcher state and adopt `params`. Demand still queued for the
    /// shards is discarded.
    pub fn reset(&mut self, params: Vec<ShardParams>, demand: &[Ring<Pooled<Bin>>]) -> Result<()> {
        match self {
            ShardExecutor::Inline { .. } => {
                for ring in demand {
                    ring.drain().for_each(drop);
                }
                *self = inline(params);
                Ok(())
            }
            ShardExecutor::Threaded(workers) => workers.reset(params),
        }
    }

    /// Backlog held by the matchers. Only known for inline execution.
    pub fn total_backlog(&self) -> Option<u64> {
        match self {
            ShardExecutor::Inline { matchers, .. } => {
                Some(matchers.iter().map(ShardMatcher::total_backlog).sum())
            }
            ShardExecutor::Threaded(_) => None,
        }
    }

    pub fn is_threaded(&self) -> bool {
        matches!(self, ShardExecutor::Threaded(_))
    }
}

fn inline(params: Vec<ShardParams>) -> ShardExecutor {
    let claims = match params.first() {
        Some(first) => first.new_claims(),
        None => TimeslotClaims::new(0, 0),
    };
    ShardExecutor::Inline {
        matchers: params.into_iter().map(ShardMatcher::new).collect(),
        claims,
    }
}

fn absorb_into(matchers: &mut [ShardMatcher], demand: &[Ring<Pooled<Bin>>]) -> bool {
    let mut absorbed = false;
    for (matcher, ring) in matchers.iter_mut().zip(demand) {
        for bin in ring.drain() {
            matcher.absorb(&bin);
            absorbed = true;
        }
    }
    absorbed
}
