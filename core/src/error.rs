use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreErr>;

#[derive(Error, Debug)]
pub enum CoreErr {
    /// Returned by the registry when a create collides with a live session.
    #[error("Session {0} already exists")]
    SessionExists(String),

    #[error("Session {0} not found")]
    SessionNotFound(String),

    /// The session is still registered but its kernel thread has exited.
    /// Every subsequent operation on the session fails with this.
    #[error("Session {0} is gone: kernel no longer running")]
    SessionGone(String),

    #[error("failed to start kernel: {0}")]
    KernelStartFailed(String),

    #[error("failed to load plugin {name}: {reason}")]
    PluginLoadFailed { name: String, reason: String },

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("artifact {0} not found")]
    ArtifactNotFound(String),

    /// The resolved artifact path points outside the session cwd.
    #[error("path {0} escapes the session working directory")]
    PathEscape(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
