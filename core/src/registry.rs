//! Session registry: the id → session map and everything that operates on a
//! session from the outside (execute, plugins, variables, uploads, artifact
//! resolution).
//!
//! A single mutex guards the map. Kernel operations are never performed
//! while it is held; only map mutations are.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use chrono::DateTime;
use chrono::Utc;
use tracing::error;
use tracing::info;
use uuid::Uuid;

use crucible_protocol::ExecutionResult;
use crucible_protocol::SessionInfo;
use crucible_protocol::SessionStatus;
use crucible_protocol::artifact_path;

use crate::error::CoreErr;
use crate::error::Result;
use crate::kernel::KernelHandle;
use crate::kernel::OutputCallback;
use crate::kernel::artifacts::persist_inline_artifacts;
use crate::verifier::VerificationPolicy;

#[derive(Debug)]
struct SessionState {
    last_activity: DateTime<Utc>,
    loaded_plugins: Vec<String>,
    execution_count: u64,
}

/// One live execution session and its kernel.
#[derive(Debug)]
pub struct Session {
    session_id: String,
    session_dir: PathBuf,
    cwd: PathBuf,
    kernel: KernelHandle,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn status(&self) -> SessionStatus {
        if self.kernel.is_alive() {
            SessionStatus::Running
        } else {
            SessionStatus::Stopped
        }
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        SessionInfo {
            session_id: self.session_id.clone(),
            status: self.status(),
            created_at: self.created_at,
            last_activity: state.last_activity,
            cwd: self.cwd.to_string_lossy().to_string(),
            session_dir: self.session_dir.to_string_lossy().to_string(),
            loaded_plugins: state.loaded_plugins.clone(),
            execution_count: state.execution_count,
        }
    }

    fn touch(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_activity = Utc::now();
    }
}

/// Tracks live sessions keyed by id.
pub struct SessionRegistry {
    work_dir: PathBuf,
    verification: Option<VerificationPolicy>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(work_dir: impl Into<PathBuf>, verification: Option<VerificationPolicy>) -> Result<Self> {
        let work_dir = work_dir.into();
        fs::create_dir_all(&work_dir)?;
        info!("session registry initialized with work_dir {}", work_dir.display());
        Ok(Self {
            work_dir,
            verification,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .ok_or_else(|| CoreErr::SessionNotFound(session_id.to_string()))
    }

    pub fn list_info(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions.iter().map(|session| session.info()).collect()
    }

    /// Creates a session and starts its kernel. An absent id is
    /// auto-generated; a duplicate id fails with [`CoreErr::SessionExists`].
    pub fn create(
        &self,
        session_id: Option<String>,
        cwd: Option<PathBuf>,
    ) -> Result<Arc<Session>> {
        let session_id =
            session_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&session_id) {
            return Err(CoreErr::SessionExists(session_id));
        }

        let session_dir = self.work_dir.join("sessions").join(&session_id);
        let cwd = cwd.unwrap_or_else(|| session_dir.join("cwd"));

        let kernel = KernelHandle::start(
            &session_id,
            &session_dir,
            &cwd,
            self.verification.clone(),
        )?;

        let now = Utc::now();
        let session = Arc::new(Session {
            session_id: session_id.clone(),
            session_dir,
            cwd,
            kernel,
            created_at: now,
            state: Mutex::new(SessionState {
                last_activity: now,
                loaded_plugins: Vec::new(),
                execution_count: 0,
            }),
        });
        sessions.insert(session_id.clone(), session.clone());
        info!("created session {session_id} with cwd {}", session.cwd.display());
        Ok(session)
    }

    /// Stops and removes a session. The session leaves the map even if the
    /// kernel shutdown misbehaves.
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            sessions
                .remove(session_id)
                .ok_or_else(|| CoreErr::SessionNotFound(session_id.to_string()))?
        };
        session.kernel.stop().await;
        info!("stopped session {session_id}");
        Ok(())
    }

    /// Best-effort stop of every session; the registry ends up empty.
    pub async fn cleanup_all(&self) {
        let session_ids: Vec<String> = {
            let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            sessions.keys().cloned().collect()
        };
        for session_id in session_ids {
            if let Err(err) = self.stop(&session_id).await {
                error!("error cleaning up session {session_id}: {err}");
            }
        }
        info!("cleaned up all sessions");
    }

    /// Executes code in a session and finalizes the result: inline
    /// artifacts are persisted to the cwd and download URLs attached.
    pub async fn execute(
        &self,
        session_id: &str,
        exec_id: &str,
        code: &str,
        on_output: Option<Arc<OutputCallback>>,
    ) -> Result<ExecutionResult> {
        let session = self.get(session_id)?;
        let mut result = session.kernel.execute(exec_id, code, on_output).await?;

        persist_inline_artifacts(&session.cwd, &mut result.artifact);
        for artifact in &mut result.artifact {
            if let Some(file_name) = &artifact.file_name {
                artifact.download_url = Some(artifact_path(session_id, file_name));
            }
        }

        {
            let mut state = session.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.execution_count += 1;
            state.last_activity = Utc::now();
        }
        Ok(result)
    }

    pub async fn load_plugin(
        &self,
        session_id: &str,
        name: &str,
        code: &str,
        config: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let session = self.get(session_id)?;
        session.kernel.load_plugin(name, code, config).await?;

        let mut state = session.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.loaded_plugins.iter().any(|plugin| plugin == name) {
            state.loaded_plugins.push(name.to_string());
        }
        state.last_activity = Utc::now();
        info!("loaded plugin {name} in session {session_id}");
        Ok(())
    }

    pub async fn update_variables(
        &self,
        session_id: &str,
        variables: HashMap<String, String>,
    ) -> Result<()> {
        let session = self.get(session_id)?;
        session.kernel.update_session_vars(variables).await?;
        session.touch();
        Ok(())
    }

    /// Writes an uploaded file into the session cwd. The name is reduced to
    /// its basename, which is what prevents path traversal.
    pub fn upload_file(
        &self,
        session_id: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<PathBuf> {
        let session = self.get(session_id)?;

        let safe_name = Path::new(filename)
            .file_name()
            .ok_or_else(|| CoreErr::InvalidFileName(filename.to_string()))?;
        let path = session.cwd.join(safe_name);
        fs::write(&path, content)?;

        session.touch();
        info!(
            "uploaded file {} to session {session_id}",
            safe_name.to_string_lossy()
        );
        Ok(path)
    }

    /// Resolves an artifact name to a file under the session cwd. Escaping
    /// the cwd is a [`CoreErr::PathEscape`]; a missing file is
    /// [`CoreErr::ArtifactNotFound`].
    pub fn artifact_file(&self, session_id: &str, name: &str) -> Result<PathBuf> {
        let session = self.get(session_id)?;
        let candidate = session.cwd.join(name);
        if !candidate.is_file() {
            return Err(CoreErr::ArtifactNotFound(name.to_string()));
        }

        let cwd = session.cwd.canonicalize()?;
        let resolved = candidate.canonicalize()?;
        if !resolved.starts_with(&cwd) {
            return Err(CoreErr::PathEscape(name.to_string()));
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> SessionRegistry {
        SessionRegistry::new(dir.path(), None).expect("registry")
    }

    #[tokio::test]
    async fn create_builds_the_directory_layout() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);
        let session = registry.create(Some("s1".to_string()), None).expect("create");

        let expected_cwd = dir.path().join("sessions").join("s1").join("cwd");
        assert_eq!(session.cwd(), expected_cwd.as_path());
        assert!(expected_cwd.is_dir());
        assert_eq!(session.status(), SessionStatus::Running);
        assert!(registry.exists("s1"));
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn create_without_id_generates_one() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);
        let session = registry.create(None, None).expect("create");
        assert!(!session.session_id().is_empty());
        assert!(registry.exists(session.session_id()));
    }

    #[tokio::test]
    async fn duplicate_create_fails_with_session_exists() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);
        registry.create(Some("s1".to_string()), None).expect("create");
        let err = registry
            .create(Some("s1".to_string()), None)
            .expect_err("duplicate");
        assert_eq!(err.to_string(), "Session s1 already exists");
    }

    #[tokio::test]
    async fn stop_of_unknown_session_fails_with_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);
        let err = registry.stop("missing").await.expect_err("unknown");
        assert_eq!(err.to_string(), "Session missing not found");
    }

    #[tokio::test]
    async fn create_stop_create_with_the_same_id_succeeds() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);
        registry.create(Some("s1".to_string()), None).expect("create");
        registry.stop("s1").await.expect("stop");
        assert!(!registry.exists("s1"));
        registry
            .create(Some("s1".to_string()), None)
            .expect("create again");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_with_distinct_ids_all_succeed() {
        let dir = TempDir::new().expect("tempdir");
        let registry = Arc::new(registry(&dir));

        let mut handles = Vec::new();
        for i in 0..10 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.create(Some(format!("s{i}")), None).map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("create");
        }
        assert_eq!(registry.active_count(), 10);
        registry.cleanup_all().await;
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn execute_counts_results_including_failures() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);
        registry.create(Some("s1".to_string()), None).expect("create");

        let ok = registry
            .execute("s1", "e1", "x = 1\nx", None)
            .await
            .expect("execute");
        assert!(ok.is_success);
        let failed = registry
            .execute("s1", "e2", "undefined_name", None)
            .await
            .expect("execute");
        assert!(!failed.is_success);

        let info = registry.get("s1").expect("session").info();
        assert_eq!(info.execution_count, 2);
    }

    #[tokio::test]
    async fn upload_sanitizes_to_basename() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);
        registry.create(Some("s1".to_string()), None).expect("create");

        let path = registry
            .upload_file("s1", "../../etc/passwd", b"x")
            .expect("upload");
        assert!(path.ends_with("cwd/passwd"), "path = {}", path.display());
        assert_eq!(fs::read(&path).expect("read back"), b"x");
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);
        registry.create(Some("s1".to_string()), None).expect("create");

        registry
            .upload_file("s1", "data.bin", &[0, 159, 146, 150])
            .expect("upload");
        let resolved = registry.artifact_file("s1", "data.bin").expect("resolve");
        assert_eq!(fs::read(resolved).expect("read"), vec![0, 159, 146, 150]);
    }

    #[tokio::test]
    async fn artifact_resolution_rejects_escapes_and_missing_files() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);
        let session = registry.create(Some("s1".to_string()), None).expect("create");

        // A real file one level above the cwd: resolvable, but outside.
        let outside = session.cwd().parent().expect("session dir").join("meta.txt");
        fs::write(&outside, "secret").expect("write");
        let err = registry
            .artifact_file("s1", "../meta.txt")
            .expect_err("escape");
        assert!(matches!(err, CoreErr::PathEscape(_)));

        let err = registry
            .artifact_file("s1", "missing.txt")
            .expect_err("missing");
        assert!(matches!(err, CoreErr::ArtifactNotFound(_)));
    }

    #[tokio::test]
    async fn display_artifacts_are_persisted_and_downloadable() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);
        let session = registry.create(Some("s1".to_string()), None).expect("create");

        let result = registry
            .execute(
                "s1",
                "e1",
                "display('drawing', '<svg/>', 'image/svg+xml')",
                None,
            )
            .await
            .expect("execute");
        assert!(result.is_success);
        assert_eq!(result.artifact.len(), 1);
        let artifact = &result.artifact[0];
        assert_eq!(artifact.file_name.as_deref(), Some("drawing.svg"));
        assert_eq!(
            artifact.download_url.as_deref(),
            Some("/api/v1/sessions/s1/artifacts/drawing.svg")
        );
        assert_eq!(
            fs::read_to_string(session.cwd().join("drawing.svg")).expect("read back"),
            "<svg/>"
        );

        let resolved = registry.artifact_file("s1", "drawing.svg").expect("resolve");
        assert_eq!(fs::read_to_string(resolved).expect("read"), "<svg/>");
    }

    #[tokio::test]
    async fn write_file_artifacts_carry_download_urls() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);
        registry.create(Some("s1".to_string()), None).expect("create");

        let result = registry
            .execute("s1", "e1", "write_file('table.csv', 'a,b\\n1,2\\n')", None)
            .await
            .expect("execute");
        assert!(result.is_success);
        assert_eq!(result.artifact.len(), 1);
        assert_eq!(
            result.artifact[0].download_url.as_deref(),
            Some("/api/v1/sessions/s1/artifacts/table.csv")
        );
    }

    #[tokio::test]
    async fn plugin_registration_order_is_kept_and_unique() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);
        registry.create(Some("s1".to_string()), None).expect("create");

        registry
            .load_plugin("s1", "alpha", "def alpha():\n    return 1", HashMap::new())
            .await
            .expect("load");
        registry
            .load_plugin("s1", "beta", "def beta():\n    return 2", HashMap::new())
            .await
            .expect("load");
        registry
            .load_plugin("s1", "alpha", "def alpha():\n    return 3", HashMap::new())
            .await
            .expect("reload");

        let info = registry.get("s1").expect("session").info();
        assert_eq!(
            info.loaded_plugins,
            vec!["alpha".to_string(), "beta".to_string()]
        );

        let result = registry
            .execute("s1", "e1", "alpha()", None)
            .await
            .expect("execute");
        assert_eq!(result.output, "3");
    }

    #[tokio::test]
    async fn variables_updated_through_the_registry_reach_the_kernel() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);
        registry.create(Some("s1".to_string()), None).expect("create");

        registry
            .update_variables(
                "s1",
                HashMap::from([("token".to_string(), "abc".to_string())]),
            )
            .await
            .expect("update");
        let result = registry
            .execute("s1", "e1", "session_vars['token']", None)
            .await
            .expect("execute");
        assert_eq!(result.output, "abc");
    }
}
