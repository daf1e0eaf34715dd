//! HTTP implementation of the kernel-host operation surface.
//!
//! One [`SessionClient`] is bound to a single session id and base URL.
//! `start` is idempotent and adopts an already-existing session (409);
//! `stop` tolerates a missing session (404) and an unreachable server,
//! which is expected during shutdown.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderValue;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crucible_protocol::API_KEY_HEADER;
use crucible_protocol::CreateSessionRequest;
use crucible_protocol::CreateSessionResponse;
use crucible_protocol::EVENT_DONE;
use crucible_protocol::EVENT_OUTPUT;
use crucible_protocol::EVENT_RESULT;
use crucible_protocol::ErrorBody;
use crucible_protocol::ExecuteStreamResponse;
use crucible_protocol::ExecutionResult;
use crucible_protocol::HealthResponse;
use crucible_protocol::OutputEvent;
use crucible_protocol::OutputStream;
use crucible_protocol::SessionInfo;
use crucible_protocol::UploadEncoding;

use crate::error::ClientErr;
use crate::error::Result;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default overall request timeout; long enough for slow executions, kept
/// alive on streams by SSE keepalives.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Callback receiving output lines as the server produces them.
pub type OnOutput<'a> = &'a mut (dyn FnMut(OutputStream, &str) + Send);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub cwd: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            cwd: None,
        }
    }
}

pub struct SessionClient {
    session_id: String,
    base_url: String,
    cwd: Option<String>,
    started: bool,
    http: reqwest::Client,
}

impl SessionClient {
    pub fn new(base_url: &str, session_id: &str, config: ClientConfig) -> Self {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &config.api_key {
            match HeaderValue::from_str(api_key) {
                Ok(value) => {
                    headers.insert(API_KEY_HEADER, value);
                }
                Err(err) => warn!("ignoring unusable api key: {err}"),
            }
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            session_id: session_id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            cwd: config.cwd,
            started: false,
            http,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Working directory assigned by the server on start.
    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base_url)
    }

    fn session_path(&self, suffix: &str) -> String {
        self.api(&format!("/sessions/{}{suffix}", self.session_id))
    }

    /// Reads the error body of a failed response. 404 means the session no
    /// longer exists server-side.
    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ClientErr::SessionGone(self.session_id.clone()));
        }
        Err(error_for(status, response).await)
    }

    pub async fn health_check(&self) -> Result<HealthResponse> {
        let response = self.http.get(self.api("/health")).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(error_for(status, response).await);
        }
        Ok(response.json().await?)
    }

    /// Creates the session. A 409 means the session already exists and is
    /// adopted; the client is started either way.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        let response = self
            .http
            .post(self.api("/sessions"))
            .json(&CreateSessionRequest {
                session_id: Some(self.session_id.clone()),
                cwd: self.cwd.clone(),
            })
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                let body: CreateSessionResponse = response.json().await?;
                self.cwd = Some(body.cwd);
                self.started = true;
                info!("started session {} on {}", self.session_id, self.base_url);
                Ok(())
            }
            StatusCode::CONFLICT => {
                self.started = true;
                info!("session {} already exists, reusing", self.session_id);
                Ok(())
            }
            status => Err(error_for(status, response).await),
        }
    }

    /// Stops the session. Idempotent: a 404 or an unreachable server both
    /// leave the client cleanly stopped.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        let response = self
            .http
            .delete(self.session_path(""))
            .send()
            .await;
        match response {
            Ok(response) => match response.status() {
                status if status.is_success() => {
                    self.started = false;
                    info!("stopped session {}", self.session_id);
                    Ok(())
                }
                StatusCode::NOT_FOUND => {
                    self.started = false;
                    Ok(())
                }
                status => Err(error_for(status, response).await),
            },
            Err(err) if err.is_connect() || err.is_timeout() => {
                debug!(
                    "server unavailable while stopping session {} (expected during shutdown)",
                    self.session_id
                );
                self.started = false;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn session_info(&self) -> Result<SessionInfo> {
        let response = self.http.get(self.session_path("")).send().await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn load_plugin(
        &self,
        name: &str,
        code: &str,
        config: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let response = self
            .http
            .post(self.session_path("/plugins"))
            .json(&serde_json::json!({ "name": name, "code": code, "config": config }))
            .send()
            .await?;
        self.check(response).await?;
        info!("loaded plugin {name} in session {}", self.session_id);
        Ok(())
    }

    pub async fn update_session_var(&self, variables: &HashMap<String, String>) -> Result<()> {
        let response = self
            .http
            .post(self.session_path("/variables"))
            .json(&serde_json::json!({ "variables": variables }))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    /// Executes code in the session. With an output callback the streaming
    /// pair (initiate POST + SSE GET) is used; without it, the sync POST.
    pub async fn execute(
        &self,
        exec_id: &str,
        code: &str,
        on_output: Option<OnOutput<'_>>,
    ) -> Result<ExecutionResult> {
        match on_output {
            Some(on_output) => self.execute_streaming(exec_id, code, on_output).await,
            None => self.execute_sync(exec_id, code).await,
        }
    }

    async fn execute_sync(&self, exec_id: &str, code: &str) -> Result<ExecutionResult> {
        let response = self
            .http
            .post(self.session_path("/execute"))
            .json(&serde_json::json!({ "exec_id": exec_id, "code": code, "stream": false }))
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    async fn execute_streaming(
        &self,
        exec_id: &str,
        code: &str,
        on_output: OnOutput<'_>,
    ) -> Result<ExecutionResult> {
        let response = self
            .http
            .post(self.session_path("/execute"))
            .json(&serde_json::json!({ "exec_id": exec_id, "code": code, "stream": true }))
            .send()
            .await?;
        let init: ExecuteStreamResponse = self.check(response).await?.json().await?;

        // The server may hand back either a path or a full URL.
        let stream_url = if init.stream_url.starts_with("http") {
            init.stream_url
        } else {
            format!("{}{}", self.base_url, init.stream_url)
        };

        let response = self
            .http
            .get(stream_url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = self.check(response).await?;

        let mut final_result: Option<ExecutionResult> = None;
        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.map_err(|err| ClientErr::Stream(err.to_string()))?;
            match event.event.as_str() {
                EVENT_OUTPUT => {
                    if let Ok(output) = serde_json::from_str::<OutputEvent>(&event.data) {
                        on_output(output.stream, &output.text);
                    }
                }
                EVENT_RESULT => {
                    final_result = serde_json::from_str(&event.data).ok();
                }
                EVENT_DONE => break,
                _ => {}
            }
        }

        final_result.ok_or(ClientErr::MissingResult)
    }

    /// Uploads a file into the session cwd; the payload travels
    /// base64-encoded. Returns the server-side path.
    pub async fn upload_file(&self, filename: &str, content: &[u8]) -> Result<String> {
        let response = self
            .http
            .post(self.session_path("/files"))
            .json(&serde_json::json!({
                "filename": filename,
                "content": BASE64.encode(content),
                "encoding": UploadEncoding::Base64,
            }))
            .send()
            .await?;
        let body: serde_json::Value = self.check(response).await?.json().await?;
        info!("uploaded file {filename} to session {}", self.session_id);
        Ok(body["path"].as_str().unwrap_or_default().to_string())
    }

    /// Raw artifact download.
    pub async fn download_artifact(&self, file_name: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(self.session_path(&format!("/artifacts/{file_name}")))
            .send()
            .await?;
        let response = self.check(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

async fn error_for(status: StatusCode, response: reqwest::Response) -> ClientErr {
    let detail = match response.text().await {
        Ok(text) => match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => body.detail,
            Err(_) => text,
        },
        Err(_) => String::new(),
    };
    ClientErr::Status { status, detail }
}
