//! The provider façade the agent layer talks to: ensures the service is up,
//! vends per-session clients, and tears everything down on clean-up.

use std::path::PathBuf;
use std::time::Duration;

use tracing::info;
use url::Url;

use crate::client::ClientConfig;
use crate::client::DEFAULT_REQUEST_TIMEOUT;
use crate::client::SessionClient;
use crate::error::SupervisorError;
use crate::supervisor::LaunchMode;
use crate::supervisor::ServerSupervisor;
use crate::supervisor::SupervisorConfig;

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub server_url: String,
    pub api_key: Option<String>,
    /// When false the provider only attaches to `server_url` and never
    /// launches anything.
    pub auto_start: bool,
    pub container: bool,
    pub container_image: Option<String>,
    pub work_dir: PathBuf,
    pub request_timeout: Duration,
    pub startup_timeout: Duration,
    pub kill_existing: bool,
    pub server_program: Option<PathBuf>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".to_string(),
            api_key: None,
            auto_start: true,
            container: false,
            container_image: None,
            work_dir: PathBuf::from("."),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            startup_timeout: Duration::from_secs(60),
            kill_existing: true,
            server_program: None,
        }
    }
}

pub struct ServiceProvider {
    config: ProviderConfig,
    supervisor: Option<ServerSupervisor>,
    initialized: bool,
}

impl ServiceProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            supervisor: None,
            initialized: false,
        }
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        let parsed = Url::parse(&self.config.server_url).ok();
        let host = parsed
            .as_ref()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let port = parsed
            .as_ref()
            .and_then(Url::port_or_known_default)
            .unwrap_or(8000);

        let mode = if !self.config.auto_start {
            LaunchMode::Attach
        } else if self.config.container {
            LaunchMode::Container
        } else {
            LaunchMode::Subprocess
        };

        let mut supervisor = SupervisorConfig {
            host,
            port,
            api_key: self.config.api_key.clone(),
            work_dir: self.config.work_dir.clone(),
            mode,
            server_program: self.config.server_program.clone(),
            startup_timeout: self.config.startup_timeout,
            kill_existing: self.config.kill_existing,
            ..SupervisorConfig::default()
        };
        if let Some(image) = &self.config.container_image {
            supervisor.container_image = image.clone();
        }
        supervisor
    }

    /// Makes sure the service is reachable, launching it if configured to.
    /// Safe to call repeatedly.
    pub async fn initialize(&mut self) -> Result<(), SupervisorError> {
        if self.initialized {
            return Ok(());
        }

        let mut supervisor = ServerSupervisor::new(self.supervisor_config());
        supervisor.ensure_running().await?;
        self.supervisor = Some(supervisor);

        self.initialized = true;
        info!(
            "execution service provider initialized with server at {}",
            self.config.server_url
        );
        Ok(())
    }

    /// Vends a client bound to `session_id`. Initializes on first use.
    ///
    /// The optional cwd is accepted for interface parity but not forwarded:
    /// the server owns cwd placement, and the client adopts the assigned
    /// cwd from the create response.
    pub async fn get_session_client(
        &mut self,
        session_id: &str,
        _cwd: Option<PathBuf>,
    ) -> Result<SessionClient, SupervisorError> {
        if !self.initialized {
            self.initialize().await?;
        }

        Ok(SessionClient::new(
            &self.config.server_url,
            session_id,
            ClientConfig {
                api_key: self.config.api_key.clone(),
                timeout: self.config.request_timeout,
                cwd: None,
            },
        ))
    }

    /// Stops the supervised server (if this provider launched one).
    /// Idempotent.
    pub async fn clean_up(&mut self) {
        if let Some(mut supervisor) = self.supervisor.take() {
            supervisor.stop().await;
        }
        self.initialized = false;
        info!("execution service provider cleaned up");
    }
}
