//! HTTP API handlers for ydl-dl

pub mod downloads;
pub mod health;

pub use downloads::download_routes;
pub use health::health_routes;

use axum::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use std::net::SocketAddr;

use crate::error::ApiError;
use crate::models::Owner;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Owner of the request
///
/// An `X-User-Id` header marks an authenticated user; otherwise the client
/// address (first `X-Forwarded-For` hop, then the peer address) is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOwner(pub Owner);

#[async_trait]
impl<S> FromRequestParts<S> for RequestOwner
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(value) = parts.headers.get(USER_ID_HEADER) {
            let user_id = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<i64>().ok())
                .ok_or_else(|| ApiError::BadRequest("Malformed X-User-Id header".to_string()))?;
            return Ok(RequestOwner(Owner::User(user_id)));
        }

        let forwarded = parts
            .headers
            .get(FORWARDED_FOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = forwarded {
            return Ok(RequestOwner(Owner::Ip(ip.to_string())));
        }

        parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| RequestOwner(Owner::Ip(addr.ip().to_string())))
            .ok_or_else(|| ApiError::BadRequest("Cannot identify the requester".to_string()))
    }
}
