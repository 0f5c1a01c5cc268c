pub mod fleet_routes;
pub mod job_routes;
