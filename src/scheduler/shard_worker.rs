//! Threaded shard execution.
//!
//! Each shard runs on its own thread and owns its [`ShardMatcher`] outright. Workers share
//! nothing but rings and pools:
//!
//! ```text
//!   partitioner --demand ring k--> worker k --reply ring k--> collector --> admitted out
//!   caller -------control ring k--^    |  \--spent ring (shared)--> ledger
//!                        claims ring --+--> worker k+1
//! ```
//!
//! A `Compute` command makes the worker absorb everything on its demand ring, take one
//! partial batch per timeslot from the pool, and then work through the timeslots in order.
//! For each timeslot the worker either opens the claims pass or waits for the claims from
//! its predecessor, matches against them, and hands them to its successor. The collector
//! merges partials in shard order, one timeslot at a time, so the output ring stays in
//! timeslot order.

use super::matching::{ShardMatcher, ShardParams, TimeslotClaims};
use crate::admitted::AdmittedTraffic;
use crate::demand::SpentDemand;
use crate::error::{Result, SchedError};
use crate::partition::Bin;
use crate::pool::{ObjectPool, Pooled};
use crate::ring::{Ring, RingFull};
use crate::threading::pin_current_thread;
use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const CONTROL_RING_LOG2: u32 = 3;
const IDLE_PARK: Duration = Duration::from_micros(50);

/// Instruction sent to a shard worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardCommand {
    /// Produce partial batches for `count` timeslots starting at `first_timeslot`.
    Compute { first_timeslot: u64, count: usize },
    /// Drop all matcher state and queued demand, then adopt new parameters.
    Reset(ShardParams),
    Shutdown,
}

/// Message from a shard worker back to the collector.
#[derive(Debug)]
pub enum ShardReply {
    /// This shard's admissions for one timeslot.
    Timeslot(Pooled<AdmittedTraffic>),
    ResetDone,
    /// This shard admitted nothing for one timeslot; the worker moves on to the next one.
    Failed(SchedError),
}

/// Rings a worker thread reads and writes.
struct WorkerEnds {
    demand: Ring<Pooled<Bin>>,
    control: Ring<ShardCommand>,
    replies: Ring<ShardReply>,
    spent: Ring<SpentDemand>,
    pool: ObjectPool<AdmittedTraffic>,
    claims_in: Ring<TimeslotClaims>,
    claims_out: Ring<TimeslotClaims>,
}

struct WorkerLink {
    control: Ring<ShardCommand>,
    replies: Ring<ShardReply>,
    handle: Option<JoinHandle<()>>,
}

/// One worker thread per shard, driven through control and reply rings.
pub struct ShardWorkers {
    links: Vec<WorkerLink>,
    running: Arc<AtomicBool>,
}

impl std::fmt::Debug for ShardWorkers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardWorkers")
            .field("shards", &self.links.len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl ShardWorkers {
    /// Start one worker per entry of `params`.
    ///
    /// # Arguments
    /// * `params` - Matcher parameters, indexed by shard
    /// * `demand` - Demand ring feeding each shard, indexed by shard
    /// * `spent` - Shared ring every worker reports admissions on
    /// * `pool` - Pool partial batches are taken from
    /// * `reply_log2` - Size of each worker's reply and claims rings
    /// * `cores` - Cores to pin workers to, by shard; empty leaves placement to the OS
    pub fn spawn(
        params: Vec<ShardParams>,
        demand: &[Ring<Pooled<Bin>>],
        spent: &Ring<SpentDemand>,
        pool: &ObjectPool<AdmittedTraffic>,
        reply_log2: u32,
        cores: &[usize],
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let mut workers = ShardWorkers {
            links: Vec::with_capacity(params.len()),
            running: running.clone(),
        };

        // Shard k reads claims from ring k and writes them to ring k+1.
        let claims = (0..params.len())
            .map(|_| Ring::with_log2_capacity(reply_log2))
            .collect::<Result<Vec<Ring<TimeslotClaims>>>>()?;

        for (shard, (params, demand)) in params.into_iter().zip(demand).enumerate() {
            let control = Ring::with_log2_capacity(CONTROL_RING_LOG2)?;
            let replies = Ring::with_log2_capacity(reply_log2)?;
            let ends = WorkerEnds {
                demand: demand.clone(),
                control: control.clone(),
                replies: replies.clone(),
                spent: spent.clone(),
                pool: pool.clone(),
                claims_in: claims[shard].clone(),
                claims_out: claims[params.next_shard()].clone(),
            };
            let core = (!cores.is_empty()).then(|| cores[shard % cores.len()]);
            let running = running.clone();
            // On failure `workers` is dropped, which stops the threads started so far.
            let handle = thread::Builder::new()
                .name(format!("Shard-Worker-{shard}"))
                .spawn(move || {
                    if let Some(core) = core {
                        pin_current_thread(core);
                    }
                    ShardWorker::new(params, ends, running).run();
                })
                .map_err(|err| SchedError::WorkerSpawn {
                    shard,
                    message: err.to_string(),
                })?;
            workers.links.push(WorkerLink {
                control,
                replies,
                handle: Some(handle),
            });
        }
        debug!(shards = workers.links.len(), "shard workers started");
        Ok(workers)
    }

    pub fn shard_count(&self) -> usize {
        self.links.len()
    }

    /// Have every worker compute `count` timeslots and merge their partials onto `out`.
    ///
    /// Every reply is consumed even after a failure so the workers and the collector stay
    /// in step. A timeslot some shards failed is still delivered with the admissions of
    /// the shards that succeeded, since those were already reported as spent. The first
    /// failure is returned. Returns the number of admitted edges.
    pub fn run_batch(
        &self,
        first_timeslot: u64,
        count: usize,
        out: &Ring<Pooled<AdmittedTraffic>>,
    ) -> Result<usize> {
        for shard in 0..self.links.len() {
            self.send(
                shard,
                ShardCommand::Compute {
                    first_timeslot,
                    count,
                },
            )?;
        }

        let mut admitted = 0;
        let mut first_error: Option<SchedError> = None;
        for offset in 0..count as u64 {
            let mut merged: Option<Pooled<AdmittedTraffic>> = None;
            for shard in 0..self.links.len() {
                match self.await_reply(shard)? {
                    ShardReply::Timeslot(partial) => {
                        debug_assert_eq!(partial.timeslot(), first_timeslot + offset);
                        match merged.as_mut() {
                            None => merged = Some(partial),
                            Some(batch) => {
                                if let Err(err) = batch.append(&partial) {
                                    first_error.get_or_insert(err);
                                }
                            }
                        }
                    }
                    ShardReply::Failed(err) => {
                        first_error.get_or_insert(err);
                    }
                    ShardReply::ResetDone => {}
                }
            }

            if let Some(batch) = merged {
                admitted += batch.size();
                if out.enqueue(batch).is_err() {
                    first_error.get_or_insert(SchedError::QueueFull {
                        queue: "admitted_out",
                    });
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(admitted),
        }
    }

    /// Reset every worker's matcher and wait until all of them have done so.
    pub fn reset(&self, params: Vec<ShardParams>) -> Result<()> {
        for (shard, params) in params.into_iter().enumerate() {
            self.send(shard, ShardCommand::Reset(params))?;
        }
        for shard in 0..self.links.len() {
            // Anything still in flight from before the reset is released on the way.
            while !matches!(self.await_reply(shard)?, ShardReply::ResetDone) {}
        }
        Ok(())
    }

    /// Stop and join every worker. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        for link in &self.links {
            let _ = link.control.enqueue(ShardCommand::Shutdown);
        }
        for link in &mut self.links {
            if let Some(handle) = link.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn worker_alive(&self, shard: usize) -> bool {
        self.links[shard]
            .handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn send(&self, shard: usize, command: ShardCommand) -> Result<()> {
        let backoff = Backoff::new();
        let mut command = command;
        loop {
            match self.links[shard].control.enqueue(command) {
                Ok(()) => return Ok(()),
                Err(RingFull(rejected)) => command = rejected,
            }
            if !self.worker_alive(shard) {
                warn!(shard, "shard worker stopped");
                return Err(SchedError::WorkerStopped { shard });
            }
            backoff.snooze();
        }
    }

    fn await_reply(&self, shard: usize) -> Result<ShardReply> {
        let replies = &self.links[shard].replies;
        let backoff = Backoff::new();
        loop {
            if let Some(reply) = replies.dequeue() {
                return Ok(reply);
            }
            if !self.worker_alive(shard) {
                // The worker may have replied right before exiting.
                if let Some(reply) = replies.dequeue() {
                    return Ok(reply);
                }
                warn!(shard, "shard worker stopped");
                return Err(SchedError::WorkerStopped { shard });
            }
            backoff.snooze();
        }
    }
}

impl Drop for ShardWorkers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by one worker thread.
struct ShardWorker {
    matcher: ShardMatcher,
    /// Claims this shard closed a pass with, reused when it opens one.
    spare: Vec<TimeslotClaims>,
    ends: WorkerEnds,
    running: Arc<AtomicBool>,
}

impl ShardWorker {
    fn new(params: ShardParams, ends: WorkerEnds, running: Arc<AtomicBool>) -> Self {
        Self {
            matcher: ShardMatcher::new(params),
            spare: Vec::new(),
            ends,
            running,
        }
    }

    fn run(mut self) {
        let backoff = Backoff::new();
        while self.running.load(Ordering::Acquire) {
            let mut busy = self.absorb_pending();

            match self.ends.control.dequeue() {
                Some(ShardCommand::Compute {
                    first_timeslot,
                    count,
                }) => {
                    if !self.compute(first_timeslot, count) {
                        return;
                    }
                    busy = true;
                }
                Some(ShardCommand::Reset(params)) => {
                    for _ in self.ends.demand.drain() {}
                    for _ in self.ends.claims_in.drain() {}
                    self.spare.clear();
                    self.matcher = ShardMatcher::new(params);
                    if !deliver(&self.ends.replies, ShardReply::ResetDone, &self.running) {
                        return;
                    }
                    busy = true;
                }
                Some(ShardCommand::Shutdown) => break,
                None => {}
            }

            if busy {
                backoff.reset();
            } else if backoff.is_completed() {
                thread::park_timeout(IDLE_PARK);
            } else {
                backoff.snooze();
            }
        }
    }

    fn absorb_pending(&mut self) -> bool {
        let mut absorbed = false;
        while let Some(bin) = self.ends.demand.dequeue() {
            self.matcher.absorb(&bin);
            absorbed = true;
        }
        absorbed
    }

    /// Work through `count` timeslots. Returns `false` on shutdown.
    ///
    /// All partials are taken from the pool up front. If the pool cannot cover the whole
    /// batch the shard admits nothing: it still passes every timeslot's claims on and
    /// replies `Failed` for each, so the other shards finish their batch.
    fn compute(&mut self, first_timeslot: u64, count: usize) -> bool {
        self.absorb_pending();

        let mut partials = Vec::with_capacity(count);
        while partials.len() < count {
            match self.ends.pool.acquire() {
                Some(partial) => partials.push(partial),
                None => break,
            }
        }
        if partials.len() < count {
            warn!(
                shard = self.matcher.params().shard_id,
                needed = count,
                got = partials.len(),
                "admitted traffic pool exhausted"
            );
            partials.clear();
        }

        for offset in 0..count as u64 {
            let timeslot = first_timeslot + offset;
            let Some(mut claims) = self.take_claims(timeslot) else {
                return false;
            };
            let reply = match partials.pop() {
                Some(mut partial) => {
                    partial.reset(timeslot);
                    match self
                        .matcher
                        .match_timeslot(&mut claims, &mut partial, &self.ends.spent)
                    {
                        Ok(_) => ShardReply::Timeslot(partial),
                        Err(err) => ShardReply::Failed(err),
                    }
                }
                None => {
                    claims.skip();
                    ShardReply::Failed(SchedError::PoolExhausted {
                        pool: "admitted_traffic",
                    })
                }
            };
            if !self.pass_on(claims) || !deliver(&self.ends.replies, reply, &self.running) {
                return false;
            }
        }
        true
    }

    /// Open the pass for `timeslot` or wait for the claims from the previous shard.
    fn take_claims(&mut self, timeslot: u64) -> Option<TimeslotClaims> {
        let params = *self.matcher.params();
        if params.starts_pass(timeslot) {
            let mut claims = self.spare.pop().unwrap_or_else(|| params.new_claims());
            claims.begin(timeslot);
            return Some(claims);
        }

        let backoff = Backoff::new();
        loop {
            if let Some(claims) = self.ends.claims_in.dequeue() {
                debug_assert_eq!(claims.timeslot(), timeslot);
                return Some(claims);
            }
            if !self.running.load(Ordering::Acquire) {
                return None;
            }
            backoff.snooze();
        }
    }

    /// Hand the claims to the next shard, or keep them if every shard has seen them.
    /// Returns `false` on shutdown.
    fn pass_on(&mut self, claims: TimeslotClaims) -> bool {
        if claims.visits() >= self.matcher.params().shard_count {
            self.spare.push(claims);
            return true;
        }
        let backoff = Backoff::new();
        let mut claims = claims;
        loop {
            match self.ends.claims_out.enqueue(claims) {
                Ok(()) => return true,
                Err(RingFull(rejected)) => claims = rejected,
            }
            if !self.running.load(Ordering::Acquire) {
                return false;
            }
            backoff.snooze();
        }
    }
}

/// Push a reply, waiting for the collector to make room. Returns `false` on shutdown.
fn deliver(replies: &Ring<ShardReply>, reply: ShardReply, running: &AtomicBool) -> bool {
    let backoff = Backoff::new();
    let mut reply = reply;
    loop {
        match replies.enqueue(reply) {
            Ok(()) => return true,
            Err(RingFull(rejected)) => reply = rejected,
        }
        if !running.load(Ordering::Acquire) {
            return false;
        }
        backoff.snooze();
    }
}
