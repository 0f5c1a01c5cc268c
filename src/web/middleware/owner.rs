use axum::{
    body::Body as AxumBody,
    http::Request,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::web::error::AppError;
use crate::web::models::OwnerContext;

/// Header carrying the authenticated user id, set by the upstream gateway.
pub const OWNER_HEADER: &str = "x-owner-id";

pub async fn owner(mut req: Request<AxumBody>, next: Next) -> Result<Response, AppError> {
    let raw = req
        .headers()
        .get(OWNER_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized(format!("missing {OWNER_HEADER} header")))?;

    let id = raw.trim().parse::<i32>().map_err(|_| {
        warn!(value = %raw, "Rejected malformed owner header.");
        AppError::Unauthorized(format!("invalid {OWNER_HEADER} header"))
    })?;

    req.extensions_mut().insert(OwnerContext { id });
    Ok(next.run(req).await)
}
