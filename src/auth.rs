use axum::extract::State;
use axum::http::{header, HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::AppError;
use crate::security;
use crate::AppState;

/// Middleware guarding the campaign API with the `ADMIN_API_TOKEN` bearer
/// token. With no token configured every request is rejected.
pub async fn admin_token_middleware(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let expected = state
        .config
        .admin_api_token
        .as_deref()
        .ok_or(AppError::Unauthorized)?;
    let provided = bearer_token(req.headers()).ok_or(AppError::Unauthorized)?;

    if !security::constant_time_eq(provided, expected) {
        tracing::warn!("Rejected campaign API request with invalid token");
        return Err(AppError::Unauthorized);
    }
    Ok(next.run(req).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
