//! Wire types shared between the crucible execution server and its clients.
//!
//! Every request/response body of the HTTP API lives here as a plain serde
//! type so that the server and the client cannot drift apart. The types are
//! deliberately free of any transport or runtime dependency.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;

/// Versioned prefix under which every API route is mounted.
pub const API_PREFIX: &str = "/api/v1";

/// Header carrying the shared secret, when one is configured.
pub const API_KEY_HEADER: &str = "x-api-key";

/// SSE event names, in the order they appear on a stream.
pub const EVENT_OUTPUT: &str = "output";
pub const EVENT_RESULT: &str = "result";
pub const EVENT_DONE: &str = "done";

/// Path of the SSE stream for one execution.
pub fn stream_path(session_id: &str, exec_id: &str) -> String {
    format!("{API_PREFIX}/sessions/{session_id}/execute/{exec_id}/stream")
}

/// Path under which an artifact file can be downloaded.
pub fn artifact_path(session_id: &str, file_name: &str) -> String {
    format!("{API_PREFIX}/sessions/{session_id}/artifacts/{file_name}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Image,
    Chart,
    Dataframe,
    File,
    Text,
    Svg,
    Html,
}

/// Encoding of inline artifact content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    Utf8,
    Base64,
}

/// A file or inline payload produced by one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionArtifact {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub original_name: String,
    /// File name within the session cwd, once the artifact is on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Inline content; persisted to `file_name` by the server before the
    /// result is returned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_content: Option<String>,
    #[serde(default)]
    pub file_content_encoding: ContentEncoding,
    #[serde(default)]
    pub preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// Outcome of one `execute` call. An execution that raised inside the kernel
/// is still a successful HTTP response; `is_success` and `error` carry the
/// distinction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub code: String,
    pub is_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub stdout: Vec<String>,
    #[serde(default)]
    pub stderr: Vec<String>,
    /// `(level, tag, message)` entries emitted by the host during execution.
    #[serde(default)]
    pub log: Vec<(String, String, String)>,
    #[serde(default)]
    pub artifact: Vec<ExecutionArtifact>,
    /// `(name, rendered value)` snapshot of visible session variables.
    #[serde(default)]
    pub variables: Vec<(String, String)>,
}

impl ExecutionResult {
    /// A failed result that never reached the kernel (verification errors,
    /// dead session, ...).
    pub fn failure(execution_id: &str, code: &str, error: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            code: code.to_string(),
            is_success: false,
            error: Some(error.into()),
            output: String::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            log: Vec::new(),
            artifact: Vec::new(),
            variables: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub cwd: String,
    pub session_dir: String,
    pub loaded_plugins: Vec<String>,
    pub execution_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_sessions: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    /// Always `"created"`.
    pub status: String,
    pub cwd: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopSessionResponse {
    pub session_id: String,
    /// Always `"stopped"`.
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadPluginRequest {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadPluginResponse {
    pub name: String,
    /// Always `"loaded"`.
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateVariablesRequest {
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateVariablesResponse {
    /// Always `"updated"`.
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadEncoding {
    Base64,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadFileRequest {
    pub filename: String,
    pub content: String,
    pub encoding: UploadEncoding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadFileResponse {
    /// Absolute path the file was written to, server-side.
    pub path: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteCodeRequest {
    pub exec_id: String,
    pub code: String,
    #[serde(default)]
    pub stream: bool,
}

/// Response to an `execute` request with `stream: true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteStreamResponse {
    pub execution_id: String,
    pub stream_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Payload of one SSE `output` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEvent {
    #[serde(rename = "type")]
    pub stream: OutputStream,
    pub text: String,
}

/// Error body shared by every non-2xx response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}
