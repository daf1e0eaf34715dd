#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

use crucible_client::ClientConfig;
use crucible_client::ClientErr;
use crucible_client::LaunchMode;
use crucible_client::ProviderConfig;
use crucible_client::ServerSupervisor;
use crucible_client::ServiceProvider;
use crucible_client::SessionClient;
use crucible_client::SupervisorConfig;
use crucible_client::SupervisorError;
use crucible_protocol::OutputStream;
use crucible_server::AppState;
use crucible_server::ServerConfig;
use crucible_server::build_router;

/// Spins up a real execution server in-process and returns its base URL.
async fn spawn_server() -> (String, TempDir) {
    let work_dir = TempDir::new().expect("tempdir");
    let state = AppState::new(ServerConfig {
        work_dir: work_dir.path().to_path_buf(),
        api_key: None,
        verification: None,
    })
    .expect("state");
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });
    (format!("http://{addr}"), work_dir)
}

#[tokio::test]
async fn start_execute_stop_round_trip() {
    let (base_url, _work_dir) = spawn_server().await;
    let mut client = SessionClient::new(&base_url, "s1", ClientConfig::default());

    client.start().await.expect("start");
    let cwd = client.cwd().expect("server-assigned cwd").to_string();
    assert!(cwd.ends_with("sessions/s1/cwd"), "cwd = {cwd}");

    // start() is idempotent.
    client.start().await.expect("second start");

    let result = client.execute("e1", "x = 2 + 2\nx", None).await.expect("execute");
    assert!(result.is_success);
    assert_eq!(result.output, "4");

    client.stop().await.expect("stop");
    client.stop().await.expect("stop is idempotent");
}

#[tokio::test]
async fn start_adopts_an_existing_session() {
    let (base_url, _work_dir) = spawn_server().await;

    // Someone else created the session first.
    let response = reqwest::Client::new()
        .post(format!("{base_url}/api/v1/sessions"))
        .json(&serde_json::json!({ "session_id": "shared" }))
        .send()
        .await
        .expect("create");
    assert_eq!(response.status(), 201);

    let mut client = SessionClient::new(&base_url, "shared", ClientConfig::default());
    client.start().await.expect("409 adopts the session");

    let result = client.execute("e1", "'alive'", None).await.expect("execute");
    assert_eq!(result.output, "alive");
}

#[tokio::test]
async fn streaming_execute_invokes_the_callback_in_order() {
    let (base_url, _work_dir) = spawn_server().await;
    let mut client = SessionClient::new(&base_url, "s1", ClientConfig::default());
    client.start().await.expect("start");

    let mut streamed: Vec<(OutputStream, String)> = Vec::new();
    let mut on_output = |stream: OutputStream, text: &str| {
        streamed.push((stream, text.to_string()));
    };
    let result = client
        .execute("e1", "print('a')\nprint('b')", Some(&mut on_output))
        .await
        .expect("execute");

    assert!(result.is_success);
    assert_eq!(result.stdout, vec!["a\n".to_string(), "b\n".to_string()]);
    assert_eq!(
        streamed,
        vec![
            (OutputStream::Stdout, "a\n".to_string()),
            (OutputStream::Stdout, "b\n".to_string()),
        ]
    );
}

#[tokio::test]
async fn execution_errors_arrive_in_the_result() {
    let (base_url, _work_dir) = spawn_server().await;
    let mut client = SessionClient::new(&base_url, "s1", ClientConfig::default());
    client.start().await.expect("start");

    let result = client
        .execute("e1", "undefined_name", None)
        .await
        .expect("transport succeeds");
    assert!(!result.is_success);
    assert!(
        result
            .error
            .expect("error text")
            .contains("undefined_name")
    );
}

#[tokio::test]
async fn upload_then_kernel_read_is_byte_identical() {
    let (base_url, _work_dir) = spawn_server().await;
    let mut client = SessionClient::new(&base_url, "s1", ClientConfig::default());
    client.start().await.expect("start");

    let payload = b"line one\nline two\n";
    let path = client
        .upload_file("input.txt", payload)
        .await
        .expect("upload");
    assert!(path.ends_with("input.txt"));

    let downloaded = client
        .download_artifact("input.txt")
        .await
        .expect("download");
    assert_eq!(downloaded, payload);
}

#[tokio::test]
async fn plugins_and_session_vars_work_through_the_client() {
    let (base_url, _work_dir) = spawn_server().await;
    let mut client = SessionClient::new(&base_url, "s1", ClientConfig::default());
    client.start().await.expect("start");

    client
        .load_plugin(
            "shout",
            "def shout(text):\n    return text.upper()",
            HashMap::new(),
        )
        .await
        .expect("plugin");
    client
        .update_session_var(&HashMap::from([(
            "who".to_string(),
            "ada".to_string(),
        )]))
        .await
        .expect("variables");

    let result = client
        .execute("e1", "shout(session_vars['who'])", None)
        .await
        .expect("execute");
    assert_eq!(result.output, "ADA");

    let info = client.session_info().await.expect("info");
    assert_eq!(info.loaded_plugins, vec!["shout".to_string()]);
}

#[tokio::test]
async fn stop_is_idempotent_after_server_side_delete() {
    let (base_url, _work_dir) = spawn_server().await;
    let mut client = SessionClient::new(&base_url, "s1", ClientConfig::default());
    client.start().await.expect("start");

    let response = reqwest::Client::new()
        .delete(format!("{base_url}/api/v1/sessions/s1"))
        .send()
        .await
        .expect("delete");
    assert_eq!(response.status(), 200);

    // The 404 from the server is absorbed.
    client.stop().await.expect("stop");
}

#[tokio::test]
async fn missing_session_maps_to_session_gone() {
    let (base_url, _work_dir) = spawn_server().await;
    let client = SessionClient::new(&base_url, "never-created", ClientConfig::default());

    let err = client
        .execute("e1", "1", None)
        .await
        .expect_err("session does not exist");
    assert!(matches!(err, ClientErr::SessionGone(_)), "err = {err}");
}

#[tokio::test]
async fn supervisor_attach_mode_health_checks() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock)
        .await;

    let address = mock.address();
    let mut supervisor = ServerSupervisor::new(SupervisorConfig {
        host: address.ip().to_string(),
        port: address.port(),
        mode: LaunchMode::Attach,
        ..SupervisorConfig::default()
    });
    supervisor.ensure_running().await.expect("attach succeeds");
    supervisor.stop().await;
}

#[tokio::test]
async fn supervisor_attach_mode_fails_when_nothing_listens() {
    // Grab a port that is free by binding and immediately dropping it.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let mut supervisor = ServerSupervisor::new(SupervisorConfig {
        host: "127.0.0.1".to_string(),
        port,
        mode: LaunchMode::Attach,
        ..SupervisorConfig::default()
    });
    let err = supervisor
        .ensure_running()
        .await
        .expect_err("nothing to attach to");
    assert!(matches!(err, SupervisorError::Unreachable(_)), "err = {err}");
}

#[tokio::test]
async fn supervisor_surfaces_spawn_failures() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let work_dir = TempDir::new().expect("tempdir");
    let mut supervisor = ServerSupervisor::new(SupervisorConfig {
        host: "127.0.0.1".to_string(),
        port,
        work_dir: work_dir.path().to_path_buf(),
        server_program: Some(PathBuf::from("/nonexistent/crucible-server")),
        startup_timeout: Duration::from_secs(2),
        kill_existing: false,
        ..SupervisorConfig::default()
    });
    let err = supervisor.ensure_running().await.expect_err("spawn fails");
    assert!(matches!(err, SupervisorError::Launch(_)), "err = {err}");
}

#[tokio::test]
async fn provider_attaches_and_vends_working_clients() {
    let (base_url, _work_dir) = spawn_server().await;

    let mut provider = ServiceProvider::new(ProviderConfig {
        server_url: base_url,
        auto_start: false,
        ..ProviderConfig::default()
    });
    provider.initialize().await.expect("initialize");

    let mut client = provider
        .get_session_client("s1", None)
        .await
        .expect("client");
    client.start().await.expect("start");
    let result = client.execute("e1", "40 + 2", None).await.expect("execute");
    assert_eq!(result.output, "42");
    client.stop().await.expect("stop");

    provider.clean_up().await;
}
