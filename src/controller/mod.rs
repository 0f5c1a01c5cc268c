//! Remote Execution Client.
//!
//! Every fleet and workload operation reaches the provisioning controller
//! through a [`RemoteSession`]. Sessions are handed out by a [`SessionPool`]
//! so that concurrent operations never share one channel, and commands are
//! always built as [`RemoteCommand`] argument vectors.

pub mod command;
pub mod inventory;
pub mod mock;
pub mod pool;
pub mod ssh;

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;

use crate::error::Result;

pub use command::{ControllerCommand, RemoteCommand};
pub use inventory::ObservedInstance;
pub use pool::{SessionGuard, SessionPool};

/// Address and credential of the controller host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControllerEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
    pub known_hosts_path: Option<PathBuf>,
}

impl fmt::Display for ControllerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// One authenticated channel to the controller.
///
/// Receivers are `&mut self`: a session runs one command at a time.
#[async_trait]
pub trait RemoteSession: Send {
    /// Establishes the session. Calling it on a connected session is a no-op.
    async fn connect(&mut self) -> Result<()>;

    /// Runs `command` to completion and returns its captured stdout.
    async fn execute(&mut self, command: &RemoteCommand) -> Result<String>;

    /// Releases the session. Safe to call more than once.
    async fn close(&mut self);
}

/// Creates unconnected sessions for an endpoint.
pub trait SessionFactory: Send + Sync {
    fn open(&self, endpoint: &ControllerEndpoint) -> Box<dyn RemoteSession>;
}
