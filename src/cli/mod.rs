use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::{self, Settings};
use crate::error::Error;
use crate::mux::TmuxAdapter;
use crate::ports::PortAllocator;
use crate::session::registry::SessionRegistry;
use crate::status::StatusDetector;
use crate::store::Store;
use crate::web;

#[derive(Parser, Debug)]
#[command(
    name = "berth",
    version,
    about = "Terminal session orchestration for AI coding agents"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the orchestration server
    Serve {
        /// Bind address
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port number
        #[arg(short, long)]
        port: Option<u16>,

        /// Use a specific auth token
        #[arg(long)]
        token: Option<String>,
    },

    /// Check that the required external tools are installed
    Doctor,
}

pub async fn run(cli: Cli) -> Result<()> {
    config::ensure_dirs()?;

    match cli.command {
        Commands::Serve { host, port, token } => serve(host, port, token).await,
        Commands::Doctor => doctor().await,
    }
}

async fn serve(host: Option<String>, port: Option<u16>, token: Option<String>) -> Result<()> {
    // Hard requirements up front: a missing tool should fail startup, not
    // the first session.
    check_dependency("tmux", &["-V"]).await?;
    check_dependency("git", &["--version"]).await?;
    if let Err(e) = check_dependency("gh", &["--version"]).await {
        tracing::warn!(error = %e, "gh not found; remote-repository operations will fail");
    }

    let settings = Arc::new(Settings::load()?);
    let host = host.unwrap_or_else(|| settings.server.host.clone());
    let port = port.unwrap_or(settings.server.port);
    let token = token
        .or_else(|| settings.server.token.clone())
        .unwrap_or_else(web::server::generate_token);

    let store = Arc::new(Store::open(config::state_path()?)?);
    let mux: Arc<dyn crate::mux::MuxAdapter> = Arc::new(TmuxAdapter::new());
    let ports = Arc::new(PortAllocator::new(
        settings.ports.start,
        settings.ports.end,
    ));
    let registry = Arc::new(SessionRegistry::new(
        store.clone(),
        mux.clone(),
        ports,
        settings.clone(),
    ));

    let detector = StatusDetector::new(mux, store.clone(), &settings);
    let status_rx = detector.subscribe();
    detector.spawn_poll_loop(Duration::from_millis(settings.poll.interval_ms));

    tracing::info!(token = %token, "Session orchestrator starting");

    let state = Arc::new(web::server::WebState {
        registry,
        store,
        status_rx,
        settings,
        token,
    });
    web::server::start_web_server(&host, port, state).await
}

async fn doctor() -> Result<()> {
    let mut missing = Vec::new();
    for (binary, args) in [
        ("tmux", ["-V"].as_slice()),
        ("git", ["--version"].as_slice()),
        ("gh", ["--version"].as_slice()),
    ] {
        match check_dependency(binary, args).await {
            Ok(version) => println!("ok       {binary:<6} {version}"),
            Err(e) => {
                println!("missing  {binary:<6} ({e})");
                missing.push(binary);
            }
        }
    }

    if missing.is_empty() {
        println!("\nAll required tools are available.");
        Ok(())
    } else {
        Err(Error::DependencyMissing(missing.join(", ")).into())
    }
}

/// Probe one external binary, returning its version line.
async fn check_dependency(binary: &str, args: &[&str]) -> Result<String, Error> {
    let output = tokio::process::Command::new(binary)
        .args(args)
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::DependencyMissing(binary.to_string())
            } else {
                Error::Resource(e.to_string())
            }
        })?;
    let version = String::from_utf8_lossy(&output.stdout);
    Ok(version.lines().next().unwrap_or_default().to_string())
}
