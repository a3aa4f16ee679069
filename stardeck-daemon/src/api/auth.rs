//! Caller identity.
//!
//! Every `/api/v1` request carries a bearer token (or `?token=` for WebSocket clients that
//! cannot set headers). The token resolves to a user id through `api_tokens`; the resolved
//! `Actor` is attached to the request for handlers and audit events.

use super::error::ApiError;
use super::AppState;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use stardeck_core::Actor;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Identity used when no tokens are configured.
pub const LOCAL_USER: &str = "local";

/// Token from `Authorization: Bearer <token>`, else from a `token` query parameter.
pub fn bearer_token<'a>(headers: &'a HeaderMap, query: Option<&'a str>) -> Option<&'a str> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());

    from_header.or_else(|| {
        query?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| value)
            .filter(|t| !t.is_empty())
    })
}

/// Resolve a token against the configured map.
///
/// With no tokens configured the daemon trusts every caller as `local`.
pub fn resolve_actor(
    tokens: &HashMap<String, String>,
    token: Option<&str>,
    ip: Option<String>,
) -> Result<Actor, ApiError> {
    if tokens.is_empty() {
        return Ok(Actor::new(LOCAL_USER, ip));
    }
    let token = token.ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;
    tokens
        .get(token)
        .map(|user| Actor::new(user.clone(), ip))
        .ok_or_else(|| ApiError::Unauthorized("invalid bearer token".to_string()))
}

/// Middleware attaching the caller's `Actor` to the request.
pub async fn require_identity(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let token = bearer_token(request.headers(), request.uri().query());
    let actor = resolve_actor(&state.config.api_tokens, token, ip)?;
    debug!(user = ?actor.user_id, path = %request.uri().path(), "authenticated request");

    request.extensions_mut().insert(actor);
    Ok(next.run(request).await)
}
