pub mod config;
pub mod fleet_locks;
pub mod fleet_manager;
pub mod workload_dispatcher;

pub use fleet_manager::{FleetManager, ScaleDirection};
pub use workload_dispatcher::{ActiveJobs, DispatchHandle, DispatchRequest, WorkloadDispatcher};
