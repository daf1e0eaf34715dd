//! HTTP surface of the crucible execution service.
//!
//! [`build_router`] assembles the full `/api/v1` API around a fresh
//! [`SessionRegistry`]; tests create their own router (and therefore their
//! own state) per case. The binary in `main.rs` layers CLI/env configuration
//! and graceful shutdown on top.

mod auth;
mod error;
mod routes;
mod streams;

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::get;
use axum::routing::post;

use crucible_core::Result;
use crucible_core::SessionRegistry;
use crucible_core::VerificationPolicy;
use crucible_protocol::API_PREFIX;

pub use error::ApiError;
use streams::StreamRegistry;

/// Server configuration, fully resolved (CLI flags and environment
/// fallbacks are the binary's concern).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub work_dir: PathBuf,
    pub api_key: Option<String>,
    pub verification: Option<VerificationPolicy>,
}

#[derive(Clone)]
pub struct AppState {
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) streams: Arc<StreamRegistry>,
    pub(crate) api_key: Option<String>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let registry = Arc::new(SessionRegistry::new(
            config.work_dir,
            config.verification,
        )?);
        Ok(Self {
            registry,
            streams: Arc::new(StreamRegistry::default()),
            api_key: config.api_key,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

/// Builds the versioned API router. Health stays outside the auth layer;
/// everything else requires the shared secret when one is configured.
pub fn build_router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/sessions", get(routes::list_sessions).post(routes::create_session))
        .route(
            "/sessions/{session_id}",
            get(routes::session_info).delete(routes::stop_session),
        )
        .route("/sessions/{session_id}/plugins", post(routes::load_plugin))
        .route("/sessions/{session_id}/variables", post(routes::update_variables))
        .route("/sessions/{session_id}/files", post(routes::upload_file))
        .route("/sessions/{session_id}/execute", post(routes::execute))
        .route(
            "/sessions/{session_id}/execute/{exec_id}/stream",
            get(routes::execute_stream),
        )
        .route(
            "/sessions/{session_id}/artifacts/{*file_name}",
            get(routes::download_artifact),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    let api = Router::new()
        .route("/health", get(routes::health))
        .merge(authed);

    Router::new().nest(API_PREFIX, api).with_state(state)
}
