use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::error::{ErrorKind, OrchestratorError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation | ErrorKind::UnsupportedFormat => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Connection | ErrorKind::Execution => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::InvalidState => StatusCode::CONFLICT,
        ErrorKind::Database | ErrorKind::Serialization => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind, error_message) = match self {
            AppError::InvalidInput(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorKind::Validation.to_string(),
                msg,
            ),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized".to_string(), msg),
            AppError::Orchestrator(err) => {
                let status = status_for(err.kind());
                if status.is_server_error() {
                    error!(error = %err, kind = %err.kind(), "Request failed.");
                }
                (status, err.kind().to_string(), err.to_string())
            }
        };
        (
            status,
            Json(serde_json::json!({ "error": error_message, "kind": kind })),
        )
            .into_response()
    }
}

impl From<sea_orm::DbErr> for AppError {
    fn from(err: sea_orm::DbErr) -> Self {
        AppError::Orchestrator(OrchestratorError::Database(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_status_codes() {
        let cases = [
            (OrchestratorError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (OrchestratorError::fleet_not_found("f"), StatusCode::NOT_FOUND),
            (OrchestratorError::Connection("down".into()), StatusCode::BAD_GATEWAY),
            (
                OrchestratorError::Timeout {
                    operation: "listing".into(),
                    seconds: 5,
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (OrchestratorError::InvalidState("busy".into()), StatusCode::CONFLICT),
            (OrchestratorError::UnsupportedFormat("xml".into()), StatusCode::BAD_REQUEST),
        ];
        for (err, expected) in cases {
            assert_eq!(AppError::from(err).into_response().status(), expected);
        }
        assert_eq!(
            AppError::Unauthorized("missing".into()).into_response().status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
