pub mod controller;
pub mod db;
pub mod error;
pub mod server;
pub mod version;
pub mod web;

pub use error::{ErrorKind, OrchestratorError, Result};
