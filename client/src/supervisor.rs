//! Client-side service supervision.
//!
//! [`ServerSupervisor::ensure_running`] leaves the execution server
//! reachable at the configured address or fails with a
//! [`SupervisorError`]. Three modes: attach to a server someone else runs,
//! spawn the server binary as a child in its own process group, or run the
//! published container image with the work dir bind-mounted.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::time::Instant;
use tracing::info;
use tracing::warn;

use crucible_protocol::API_KEY_HEADER;

use crate::error::SupervisorError;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const GRACEFUL_STOP: Duration = Duration::from_secs(10);
const PORT_RELEASE_WAIT: Duration = Duration::from_secs(5);

const DEFAULT_CONTAINER_IMAGE: &str = "crucible/executor:latest";
const CONTAINER_WORK_DIR: &str = "/workspace";
const CONTAINER_PORT: u16 = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Only health-check a server someone else is responsible for.
    Attach,
    /// Spawn the server binary as a child process.
    Subprocess,
    /// Run the server container image.
    Container,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub work_dir: PathBuf,
    pub mode: LaunchMode,
    /// Server binary override; defaults to a sibling of the current
    /// executable, then a `PATH` lookup.
    pub server_program: Option<PathBuf>,
    pub container_image: String,
    pub startup_timeout: Duration,
    pub kill_existing: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            api_key: None,
            work_dir: PathBuf::from("."),
            mode: LaunchMode::Subprocess,
            server_program: None,
            container_image: DEFAULT_CONTAINER_IMAGE.to_string(),
            startup_timeout: Duration::from_secs(60),
            kill_existing: true,
        }
    }
}

pub struct ServerSupervisor {
    config: SupervisorConfig,
    http: reqwest::Client,
    child: Option<Child>,
    container_id: Option<String>,
    started: bool,
}

impl ServerSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HEALTH_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            config,
            http,
            child: None,
            container_id: None,
            started: false,
        }
    }

    pub fn server_url(&self) -> String {
        format!("http://{}:{}", self.config.host, self.config.port)
    }

    pub async fn is_server_running(&self) -> bool {
        let mut request = self
            .http
            .get(format!("{}/api/v1/health", self.server_url()));
        if let Some(api_key) = &self.config.api_key {
            request = request.header(API_KEY_HEADER, api_key);
        }
        matches!(request.send().await, Ok(response) if response.status().is_success())
    }

    /// Leaves the service reachable at the configured URL or fails.
    /// Idempotent once successful.
    pub async fn ensure_running(&mut self) -> Result<(), SupervisorError> {
        if self.started {
            return Ok(());
        }

        if self.config.mode == LaunchMode::Attach {
            if self.is_server_running().await {
                self.started = true;
                return Ok(());
            }
            return Err(SupervisorError::Unreachable(self.server_url()));
        }

        if self.is_server_running().await {
            if self.config.kill_existing {
                info!(
                    "found existing server at {}, replacing it",
                    self.server_url()
                );
                self.kill_existing_server().await;
                tokio::time::sleep(Duration::from_secs(1)).await;
            } else {
                info!("execution server already running at {}", self.server_url());
                self.started = true;
                return Ok(());
            }
        }

        match self.config.mode {
            LaunchMode::Subprocess => self.spawn_subprocess()?,
            LaunchMode::Container => self.start_container().await?,
            LaunchMode::Attach => {}
        }

        self.wait_ready().await
    }

    /// Resolves and terminates whichever process owns the target port:
    /// graceful signal first, then forceful, then poll until the port is
    /// released.
    pub async fn kill_existing_server(&self) -> bool {
        let Some(pid) = self.pid_on_port().await else {
            return false;
        };
        info!(
            "killing existing server process (pid {pid}) on port {}",
            self.config.port
        );

        #[cfg(unix)]
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        #[cfg(windows)]
        {
            let _ = tokio::process::Command::new("taskkill")
                .args(["/F", "/PID", &pid.to_string()])
                .output()
                .await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        #[cfg(unix)]
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }

        let deadline = Instant::now() + PORT_RELEASE_WAIT;
        while Instant::now() < deadline {
            if self.pid_on_port().await.is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        warn!(
            "a process may still be listening on port {}",
            self.config.port
        );
        true
    }

    async fn pid_on_port(&self) -> Option<i32> {
        #[cfg(unix)]
        {
            let output = tokio::process::Command::new("lsof")
                .args(["-ti", &format!(":{}", self.config.port)])
                .output()
                .await
                .ok()?;
            parse_lsof_pid(&String::from_utf8_lossy(&output.stdout))
        }
        #[cfg(windows)]
        {
            let output = tokio::process::Command::new("netstat")
                .args(["-ano"])
                .output()
                .await
                .ok()?;
            parse_netstat_pid(&String::from_utf8_lossy(&output.stdout), self.config.port)
        }
    }

    fn resolve_server_program(&self) -> PathBuf {
        if let Some(program) = &self.config.server_program {
            return program.clone();
        }
        if let Ok(exe) = std::env::current_exe()
            && let Some(dir) = exe.parent()
        {
            let sibling = dir.join("crucible-server");
            if sibling.exists() {
                return sibling;
            }
        }
        PathBuf::from("crucible-server")
    }

    fn spawn_subprocess(&mut self) -> Result<(), SupervisorError> {
        let program = self.resolve_server_program();
        info!(
            "starting server subprocess {} on {}:{}",
            program.display(),
            self.config.host,
            self.config.port
        );

        let mut command = std::process::Command::new(&program);
        command
            .arg("--host")
            .arg(&self.config.host)
            .arg("--port")
            .arg(self.config.port.to_string())
            .arg("--work-dir")
            .arg(&self.config.work_dir)
            .env("SERVER_HOST", &self.config.host)
            .env("SERVER_PORT", self.config.port.to_string())
            .env("SERVER_WORK_DIR", &self.config.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(api_key) = &self.config.api_key {
            command.arg("--api-key").arg(api_key);
            command.env("SERVER_API_KEY", api_key);
        }
        // Its own process group, so stop() can signal the whole group.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut command = tokio::process::Command::from(command);
        command.kill_on_drop(true);
        let child = command.spawn().map_err(|err| {
            SupervisorError::Launch(format!("failed to spawn {}: {err}", program.display()))
        })?;
        info!("server subprocess started with pid {:?}", child.id());
        self.child = Some(child);
        Ok(())
    }

    async fn start_container(&mut self) -> Result<(), SupervisorError> {
        let image = self.config.container_image.clone();
        if docker(&["image", "inspect", &image]).await.is_err() {
            info!("pulling image {image}");
            docker(&["pull", &image]).await?;
        }

        let work_dir = std::fs::canonicalize(&self.config.work_dir)?;
        let volume = format!("{}:{CONTAINER_WORK_DIR}", work_dir.to_string_lossy());
        let port_map = format!("{}:{CONTAINER_PORT}", self.config.port);
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--rm".into(),
            "-p".into(),
            port_map,
            "-v".into(),
            volume,
            "-e".into(),
            "SERVER_HOST=0.0.0.0".into(),
            "-e".into(),
            format!("SERVER_PORT={CONTAINER_PORT}"),
            "-e".into(),
            format!("SERVER_WORK_DIR={CONTAINER_WORK_DIR}"),
        ];
        if let Some(api_key) = &self.config.api_key {
            args.push("-e".into());
            args.push(format!("SERVER_API_KEY={api_key}"));
        }
        args.push(image);

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = docker(&arg_refs).await?;
        let container_id = stdout.trim().to_string();
        info!("server container started with id {container_id}");
        self.container_id = Some(container_id);
        Ok(())
    }

    /// Polls `/health` until success or the startup budget runs out. If the
    /// child exits first, its stderr is surfaced in the error.
    async fn wait_ready(&mut self) -> Result<(), SupervisorError> {
        info!("waiting for execution server at {}", self.server_url());
        let start = Instant::now();
        let deadline = start + self.config.startup_timeout;

        loop {
            if self.is_server_running().await {
                info!(
                    "execution server ready ({:.1}s)",
                    start.elapsed().as_secs_f32()
                );
                self.started = true;
                return Ok(());
            }

            if let Some(child) = &mut self.child
                && let Some(status) = child.try_wait()?
            {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let mut buf = Vec::new();
                    let _ = tokio::time::timeout(
                        Duration::from_secs(2),
                        pipe.read_to_end(&mut buf),
                    )
                    .await;
                    stderr = String::from_utf8_lossy(&buf).to_string();
                }
                self.child = None;
                return Err(SupervisorError::Exited {
                    status: status.to_string(),
                    stderr,
                });
            }

            if Instant::now() >= deadline {
                return Err(SupervisorError::ReadyTimeout(self.config.startup_timeout));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Graceful shutdown: signal the process group, escalate after the
    /// grace period; containers get `docker stop` with the same budget.
    /// Idempotent.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!("stopping server subprocess (pid {:?})", child.id());
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    unsafe {
                        libc::killpg(pid as i32, libc::SIGTERM);
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }

            if tokio::time::timeout(GRACEFUL_STOP, child.wait()).await.is_err() {
                warn!("server did not stop gracefully, forcing kill");
                #[cfg(unix)]
                {
                    if let Some(pid) = child.id() {
                        unsafe {
                            libc::killpg(pid as i32, libc::SIGKILL);
                        }
                    }
                }
                let _ = child.start_kill();
                let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
            }
        }

        if let Some(container_id) = self.container_id.take() {
            info!("stopping server container {container_id}");
            if let Err(err) = docker(&["stop", "-t", "10", &container_id]).await {
                warn!("error stopping container: {err}");
            }
        }

        self.started = false;
    }
}

async fn docker(args: &[&str]) -> Result<String, SupervisorError> {
    let output = tokio::process::Command::new("docker")
        .args(args)
        .output()
        .await
        .map_err(|err| SupervisorError::Container(format!("failed to run docker: {err}")))?;
    if !output.status.success() {
        return Err(SupervisorError::Container(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn parse_lsof_pid(stdout: &str) -> Option<i32> {
    stdout.lines().next()?.trim().parse().ok()
}

#[cfg_attr(unix, allow(dead_code))]
fn parse_netstat_pid(stdout: &str, port: u16) -> Option<i32> {
    let needle = format!(":{port}");
    for line in stdout.lines() {
        if line.contains(&needle) && line.contains("LISTENING") {
            return line.split_whitespace().last()?.parse().ok();
        }
    }
    None
}
