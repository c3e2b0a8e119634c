//! Batch driver: feeds a timeslot-ordered request stream through the engine.

use crate::admissible::AdmissibleState;
use crate::admitted::AdmittedTraffic;
use crate::demand::Request;
use crate::error::{Result, SchedError};
use serde::Serialize;
use tracing::debug;

/// Totals for one [`BatchDriver::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriverSummary {
    pub batches: usize,
    pub timeslots: usize,
    pub requests_issued: usize,
    /// Requests stamped after the last batch, left for a later run.
    pub requests_remaining: usize,
    pub admitted_edges: usize,
}

/// Drives [`AdmissibleState`] one batch at a time.
///
/// Before each batch every request whose timeslot falls at or before that batch is added
/// to the engine. After the batch, spent demand is applied and exactly one batch worth of
/// admitted traffic is handed to the consumer and then returned to its pool.
#[derive(Debug, Default)]
pub struct BatchDriver {
    last_timeslot: Option<u64>,
}

impl BatchDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `batches` batches over `requests`.
    ///
    /// # Arguments
    /// * `state` - Engine to drive; its timeslot counter decides where the first batch starts
    /// * `requests` - Demand sorted by non-decreasing timeslot
    /// * `batches` - Number of `get_admissible_traffic` calls to make
    /// * `consume` - Called with every admitted batch, in timeslot order
    ///
    /// # Returns
    /// A summary of the run, or the first error. Requests that go backwards in time fail
    /// with `UnorderedRequest`.
    pub fn run<F>(
        &mut self,
        state: &mut AdmissibleState,
        requests: &[Request],
        batches: usize,
        mut consume: F,
    ) -> Result<DriverSummary>
    where
        F: FnMut(&mut AdmittedTraffic) -> Result<()>,
    {
        let batch_size = state.batch_size();
        let mut summary = DriverSummary::default();
        let mut cursor = 0;

        for _ in 0..batches {
            let horizon = state.next_timeslot() + batch_size as u64;
            while let Some(request) = requests.get(cursor) {
                if request.timeslot >= horizon {
                    break;
                }
                self.check_order(request)?;
                state.add_backlog(request.src, request.dst, request.backlog)?;
                cursor += 1;
            }

            state.flush_backlog();
            let computed = state.get_admissible_traffic()?;
            state.handle_spent_demands()?;

            for _ in 0..computed.timeslots {
                let Some(mut admitted) = state.q_admitted_out().dequeue() else {
                    break;
                };
                consume(&mut admitted)?;
            }

            summary.batches += 1;
            summary.timeslots += computed.timeslots;
            summary.admitted_edges += computed.admitted;
        }

        summary.requests_issued = cursor;
        summary.requests_remaining = requests.len() - cursor;
        debug!(
            batches = summary.batches,
            issued = summary.requests_issued,
            admitted = summary.admitted_edges,
            "driver run finished"
        );
        Ok(summary)
    }

    fn check_order(&mut self, request: &Request) -> Result<()> {
        if let Some(previous) = self.last_timeslot {
            if request.timeslot < previous {
                return Err(SchedError::UnorderedRequest {
                    previous,
                    timeslot: request.timeslot,
                });
            }
        }
        self.last_timeslot = Some(request.timeslot);
        Ok(())
    }
}
