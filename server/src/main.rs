use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use clap::ValueEnum;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crucible_core::VerificationPolicy;
use crucible_server::AppState;
use crucible_server::ServerConfig;
use crucible_server::build_router;

#[derive(Parser, Debug)]
#[command(name = "crucible-server", version, about = "Crucible code execution server")]
struct Cli {
    /// Host to bind to.
    #[arg(long, env = "SERVER_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind to.
    #[arg(long, env = "SERVER_PORT", default_value_t = 8000)]
    port: u16,

    /// Shared secret; optional for loopback clients.
    #[arg(long, env = "SERVER_API_KEY")]
    api_key: Option<String>,

    /// Working directory for session data. Defaults to the current
    /// directory.
    #[arg(long, env = "SERVER_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Statically verify submitted code before execution (dangerous-name
    /// and magic-line checks).
    #[arg(long, env = "SERVER_VERIFY", default_value_t = false)]
    verify: bool,

    #[arg(long, env = "LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            // tracing has no level above error.
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let work_dir = match cli.work_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolve current directory")?,
    };

    println!();
    println!("{}", "=".repeat(60));
    println!("  Crucible Code Execution Server");
    println!("{}", "=".repeat(60));
    println!("  Host:      {}", cli.host);
    println!("  Port:      {}", cli.port);
    println!("  URL:       http://{}:{}", cli.host, cli.port);
    println!("  Health:    http://{}:{}/api/v1/health", cli.host, cli.port);
    println!("  Work Dir:  {}", work_dir.display());
    println!(
        "  API Key:   {}",
        if cli.api_key.is_some() {
            "configured"
        } else {
            "not required (loopback)"
        }
    );
    println!(
        "  Verify:    {}",
        if cli.verify { "enabled" } else { "disabled" }
    );
    println!("{}", "=".repeat(60));
    println!();

    let state = AppState::new(ServerConfig {
        work_dir,
        api_key: cli.api_key,
        verification: cli.verify.then(VerificationPolicy::default),
    })
    .context("initialize session registry")?;
    let registry = state.registry().clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind((cli.host.as_str(), cli.port))
        .await
        .with_context(|| format!("bind {}:{}", cli.host, cli.port))?;
    info!("serving on http://{}:{}", cli.host, cli.port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serve")?;

    info!("shutting down; stopping all sessions");
    registry.cleanup_all().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
