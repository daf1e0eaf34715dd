use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientErr>;

/// Failures of the HTTP session client. HTTP status is preserved so callers
/// can disambiguate (404 is additionally surfaced as [`ClientErr::SessionGone`]
/// on session-scoped calls).
#[derive(Error, Debug)]
pub enum ClientErr {
    #[error("server error ({status}): {detail}")]
    Status { status: StatusCode, detail: String },

    #[error("Session {0} is gone")]
    SessionGone(String),

    #[error("no result received from streaming execution")]
    MissingResult,

    #[error("client used before start()")]
    NotStarted,

    #[error("stream error: {0}")]
    Stream(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Client-side failure to launch or reach the service. Fatal to the caller.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to launch server: {0}")]
    Launch(String),

    #[error("server not reachable at {0}")]
    Unreachable(String),

    #[error("server did not become ready within {0:?}")]
    ReadyTimeout(Duration),

    #[error("server process exited with {status} before becoming ready; stderr: {stderr}")]
    Exited { status: String, stderr: String },

    #[error("container error: {0}")]
    Container(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
