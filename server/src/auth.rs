//! Shared-secret authentication.
//!
//! When an API key is configured, loopback clients may omit it (an incorrect
//! key is still rejected) and non-loopback clients must supply it. Health is
//! mounted outside this layer and stays public.

use axum::extract::ConnectInfo;
use axum::extract::Request;
use axum::extract::State;
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;

use crucible_protocol::API_KEY_HEADER;

use crate::AppState;
use crate::error::ApiError;

pub async fn require_api_key(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    if addr.ip().is_loopback() {
        match provided {
            Some(key) if key != expected => Err(ApiError::InvalidApiKey),
            _ => Ok(next.run(request).await),
        }
    } else {
        match provided {
            None => Err(ApiError::ApiKeyRequired),
            Some(key) if key != expected => Err(ApiError::InvalidApiKey),
            Some(_) => Ok(next.run(request).await),
        }
    }
}
