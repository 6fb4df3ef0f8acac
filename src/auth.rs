//! Owner guard for write endpoints.
//!
//! When an owner token is configured, every non-read request must carry
//! it, either as `Authorization: Bearer <token>` or in the
//! `X-Owner-Token` header. Reads stay public. With no token configured
//! the guard passes everything through (local/dev mode).

use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};

use crate::error::ApiError;
use crate::handler::AppState;

const OWNER_TOKEN_HEADER: &str = "x-owner-token";

fn bearer_token(req: &Request) -> Option<&str> {
    if let Some(value) = req.headers().get("authorization") {
        let value = value.to_str().ok()?;
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim());
        }
    }
    req.headers()
        .get(OWNER_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

pub async fn require_owner(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.owner_token.as_deref() else {
        return Ok(next.run(req).await);
    };

    if matches!(*req.method(), Method::GET | Method::HEAD | Method::OPTIONS) {
        return Ok(next.run(req).await);
    }

    match bearer_token(&req) {
        Some(token) if token == expected => Ok(next.run(req).await),
        Some(_) => Err(ApiError::Unauthorized("Invalid token")),
        None => Err(ApiError::Unauthorized("Missing token")),
    }
}
