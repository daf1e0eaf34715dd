//! Kernel host: one persistent interpreter per session.
//!
//! A [`KernelHandle`] owns the channel to a dedicated kernel thread which in
//! turn owns the session's interpreter. Requests are processed strictly in
//! arrival order, which gives every session the serialized-execution
//! guarantee; separate sessions have separate threads and run concurrently.
//! If the kernel thread is gone, every operation fails with
//! [`CoreErr::SessionGone`].

pub(crate) mod artifacts;
mod interpreter;
pub mod magics;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;

use crucible_protocol::ExecutionResult;
use crucible_protocol::OutputStream;

use crate::error::CoreErr;
use crate::error::Result;
use crate::verifier::VerificationPolicy;
use crate::verifier::Violation;
use crate::verifier::verify_code;

use interpreter::Interpreter;
pub use interpreter::OutputCallback;

/// How long `stop` waits for the kernel thread to acknowledge shutdown.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

enum KernelRequest {
    Execute {
        exec_id: String,
        code: String,
        prepared: String,
        installs: Vec<String>,
        on_output: Option<Arc<OutputCallback>>,
        reply: oneshot::Sender<ExecutionResult>,
    },
    LoadPlugin {
        name: String,
        source: String,
        config: HashMap<String, serde_json::Value>,
        reply: oneshot::Sender<std::result::Result<(), String>>,
    },
    UpdateVars {
        vars: HashMap<String, String>,
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Host-side handle to a session's kernel thread.
#[derive(Debug)]
pub struct KernelHandle {
    session_id: String,
    tx: mpsc::Sender<KernelRequest>,
    alive: Arc<AtomicBool>,
    verification: Option<VerificationPolicy>,
}

impl KernelHandle {
    /// Creates the working directories and spawns the kernel thread.
    pub fn start(
        session_id: &str,
        session_dir: &Path,
        cwd: &Path,
        verification: Option<VerificationPolicy>,
    ) -> Result<Self> {
        fs::create_dir_all(session_dir)
            .and_then(|()| fs::create_dir_all(cwd))
            .map_err(|err| CoreErr::KernelStartFailed(err.to_string()))?;

        let alive = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();
        let thread_session_id = session_id.to_string();
        let thread_cwd = cwd.to_path_buf();
        let thread_alive = alive.clone();
        std::thread::Builder::new()
            .name(format!("kernel-{session_id}"))
            .spawn(move || run_kernel(thread_session_id, thread_cwd, rx, thread_alive))
            .map_err(|err| CoreErr::KernelStartFailed(err.to_string()))?;

        info!("started kernel for session {session_id} with cwd {}", cwd.display());
        Ok(Self {
            session_id: session_id.to_string(),
            tx,
            alive,
            verification,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Runs the pre-execution pipeline (magic split, verification) and then
    /// executes on the kernel. Verification failures produce a failed
    /// [`ExecutionResult`] without touching the interpreter.
    pub async fn execute(
        &self,
        exec_id: &str,
        code: &str,
        on_output: Option<Arc<OutputCallback>>,
    ) -> Result<ExecutionResult> {
        let split = magics::separate_magics_and_code(code);

        let violations = match &self.verification {
            Some(policy) => verify_code(code, policy),
            None if !split.magics.is_empty() => vec![Violation {
                line: None,
                text: String::new(),
                message: format!(
                    "Magic commands except package install are not allowed. Details: {:?}",
                    split.magics
                ),
            }],
            None => Vec::new(),
        };
        if !violations.is_empty() {
            let error = violations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n");
            debug!("execution {exec_id} rejected by verifier: {error}");
            return Ok(ExecutionResult::failure(exec_id, code, error));
        }

        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(KernelRequest::Execute {
                exec_id: exec_id.to_string(),
                code: code.to_string(),
                prepared: split.code,
                installs: split.package_installs,
                on_output,
                reply,
            })
            .map_err(|_| CoreErr::SessionGone(self.session_id.clone()))?;
        reply_rx
            .await
            .map_err(|_| CoreErr::SessionGone(self.session_id.clone()))
    }

    pub async fn load_plugin(
        &self,
        name: &str,
        source: &str,
        config: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(KernelRequest::LoadPlugin {
                name: name.to_string(),
                source: source.to_string(),
                config,
                reply,
            })
            .map_err(|_| CoreErr::SessionGone(self.session_id.clone()))?;
        reply_rx
            .await
            .map_err(|_| CoreErr::SessionGone(self.session_id.clone()))?
            .map_err(|reason| CoreErr::PluginLoadFailed {
                name: name.to_string(),
                reason,
            })
    }

    pub async fn update_session_vars(&self, vars: HashMap<String, String>) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(KernelRequest::UpdateVars { vars, reply })
            .map_err(|_| CoreErr::SessionGone(self.session_id.clone()))?;
        reply_rx
            .await
            .map_err(|_| CoreErr::SessionGone(self.session_id.clone()))
    }

    /// Asks the kernel thread to exit and waits up to [`STOP_TIMEOUT`].
    /// Idempotent; never fails for an already-stopped kernel.
    pub async fn stop(&self) {
        let (reply, reply_rx) = oneshot::channel();
        if self.tx.send(KernelRequest::Stop { reply }).is_ok() {
            let _ = tokio::time::timeout(STOP_TIMEOUT, reply_rx).await;
        }
    }
}

/// Clears the alive flag when the kernel thread exits, however it exits.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn run_kernel(
    session_id: String,
    cwd: PathBuf,
    rx: mpsc::Receiver<KernelRequest>,
    alive: Arc<AtomicBool>,
) {
    let _guard = AliveGuard(alive);
    let mut interpreter = Interpreter::new(cwd.clone());
    let mut installed_packages: Vec<String> = Vec::new();

    while let Ok(request) = rx.recv() {
        match request {
            KernelRequest::Execute {
                exec_id,
                code,
                prepared,
                installs,
                on_output,
                reply,
            } => {
                let result = run_execution(
                    &mut interpreter,
                    &mut installed_packages,
                    &cwd,
                    exec_id,
                    code,
                    &prepared,
                    &installs,
                    on_output,
                );
                let _ = reply.send(result);
            }
            KernelRequest::LoadPlugin {
                name,
                source,
                config,
                reply,
            } => {
                let _ = reply.send(interpreter.load_plugin(&name, &source, &config));
            }
            KernelRequest::UpdateVars { vars, reply } => {
                interpreter.update_session_vars(vars);
                let _ = reply.send(());
            }
            KernelRequest::Stop { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }

    debug!("kernel thread for session {session_id} exited");
}

#[allow(clippy::too_many_arguments)]
fn run_execution(
    interpreter: &mut Interpreter,
    installed_packages: &mut Vec<String>,
    cwd: &Path,
    exec_id: String,
    code: String,
    prepared: &str,
    installs: &[String],
    on_output: Option<Arc<OutputCallback>>,
) -> ExecutionResult {
    let mut log = Vec::new();
    let mut stderr = Vec::new();
    for install in installs {
        let packages = magics::requested_packages(install);
        let message = format!("recorded install request: {}", packages.join(", "));
        // Installer notices are host-side diagnostics: they go to stderr
        // (streamed like any other output line) and to the log.
        let line = format!("{message}\n");
        if let Some(on_output) = &on_output {
            on_output(OutputStream::Stderr, &line);
        }
        stderr.push(line);
        log.push((
            "info".to_string(),
            "package_installer".to_string(),
            message,
        ));
        for package in packages {
            if !installed_packages.contains(&package) {
                installed_packages.push(package);
            }
        }
    }

    let before = artifacts::snapshot_cwd(cwd);
    let outcome = interpreter.execute(prepared, on_output.as_deref());
    let mut artifact = artifacts::collect_new_artifacts(cwd, &before);
    artifact.extend(outcome.inline_artifacts);
    let variables = interpreter.snapshot_variables();

    ExecutionResult {
        execution_id: exec_id,
        code,
        is_success: outcome.error.is_none(),
        error: outcome.error,
        output: outcome.output,
        stdout: outcome.stdout,
        stderr,
        log,
        artifact,
        variables,
    }
}
