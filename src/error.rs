//! Error taxonomy shared by every layer of the orchestrator.
//!
//! Each variant maps onto one caller-visible [`ErrorKind`]. Database and
//! serialization failures are internal and surface as their own kinds so the
//! HTTP layer can answer with a 500 instead of blaming the caller.

use sea_orm::DbErr;
use serde::Serialize;
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("Controller connection error: {0}")]
    Connection(String),
    #[error("Remote command `{command}` exited with status {exit_status}: {stderr}")]
    Execution {
        command: String,
        exit_status: i32,
        stderr: String,
    },
    #[error("Timed out after {seconds}s while {operation}")]
    Timeout { operation: String, seconds: u64 },
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(String),
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Connection,
    Execution,
    Timeout,
    InvalidState,
    UnsupportedFormat,
    Database,
    Serialization,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::Connection => "connection_error",
            ErrorKind::Execution => "execution_error",
            ErrorKind::Timeout => "timeout_error",
            ErrorKind::InvalidState => "invalid_state_error",
            ErrorKind::UnsupportedFormat => "unsupported_format_error",
            ErrorKind::Database => "database_error",
            ErrorKind::Serialization => "serialization_error",
        };
        f.write_str(name)
    }
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Validation(_) => ErrorKind::Validation,
            OrchestratorError::NotFound { .. } => ErrorKind::NotFound,
            OrchestratorError::Connection(_) => ErrorKind::Connection,
            OrchestratorError::Execution { .. } => ErrorKind::Execution,
            OrchestratorError::Timeout { .. } => ErrorKind::Timeout,
            OrchestratorError::InvalidState(_) => ErrorKind::InvalidState,
            OrchestratorError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            OrchestratorError::Database(_) => ErrorKind::Database,
            OrchestratorError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// True for failures that happened on the controller side of an operation.
    pub fn is_remote(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection | ErrorKind::Execution | ErrorKind::Timeout
        )
    }

    pub fn fleet_not_found(id: impl fmt::Display) -> Self {
        OrchestratorError::NotFound {
            entity: "Fleet",
            id: id.to_string(),
        }
    }

    pub fn job_not_found(id: impl fmt::Display) -> Self {
        OrchestratorError::NotFound {
            entity: "Job",
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
