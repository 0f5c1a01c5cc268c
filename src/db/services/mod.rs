//! Data access services. Every persisted mutation of fleets, instances, jobs
//! and findings goes through one of these types.

pub mod export;
pub mod fleet_service;
pub mod job_service;

pub use export::{ExportFormat, ExportedResults};
pub use fleet_service::{FleetDetails, FleetSpec, FleetStore, FleetSummary, ReconcileReport};
pub use job_service::{ChunkFailure, JobProgress, JobTracker, NewJob};
