//! Central arbiter scheduling core for a datacenter fabric.
//!
//! Endpoints report backlog; the arbiter decides, timeslot by timeslot, which sources may
//! send to which destinations so that no source sends twice and no destination is
//! overrun, then picks an inter-rack path for every admitted flow.
//!
//! The entry point is [`AdmissibleState`]; [`BatchDriver`] shows the intended calling
//! sequence and [`path_selection`] post-processes admitted batches.

pub mod admissible;
pub mod admitted;
pub mod config;
pub mod demand;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod partition;
pub mod path_selection;
pub mod pool;
pub mod ring;
pub mod scheduler;
pub mod threading;

pub use admissible::{AdmissibleResources, AdmissibleState, BatchSummary, EngineStats};
pub use admitted::{AdmittedEdge, AdmittedTraffic, Conflict};
pub use config::{EngineConfig, EngineMode, Topology};
pub use demand::{DemandLedger, Request, SpentDemand};
pub use driver::{BatchDriver, DriverSummary};
pub use endpoint::{Destination, Endpoint, NodeId, PathId, RackId, NUM_PATHS};
pub use error::{Result, SchedError};
pub use path_selection::{paths_are_valid, select_paths, PathSelection, PathSelector};
pub use pool::{ObjectPool, Pooled};
pub use ring::Ring;
