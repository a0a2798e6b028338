//! ShadowGuard Provider
//!
//! Runs the tunnel controller as a standalone process. Wires the process
//! relay and hook-script routing into the controller and maps signals onto
//! lifecycle events:
//!
//! | Signal  | Event                                   |
//! |---------|-----------------------------------------|
//! | SIGINT  | user stop (clears the stored server)    |
//! | SIGTERM | system shutdown (server resumes later)  |
//! | SIGHUP  | configuration updated (re-read server)  |
//! | SIGUSR1 | OS sleep                                |
//! | SIGUSR2 | OS wake                                 |

use anyhow::{Context, Result};
use clap::Parser;
use sg_tunnel::{
    ConnectionState, ControllerHandle, HookRoutes, ProcessRelay, ProviderConfig,
    ServerConfiguration, StatusReceiver, StopReason, TunnelLifecycleController, TunnelStore, uri,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "sg-provider")]
#[command(version, about = "ShadowGuard packet tunnel provider")]
struct Args {
    /// Provider config file (.toml or .json)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Server to connect to: an ss:// share URI or a JSON file
    #[arg(long, short)]
    server: Option<String>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("sg-provider starting...");

    let config = match &args.config {
        Some(path) => ProviderConfig::load(path)
            .with_context(|| format!("loading provider config {}", path.display()))?,
        None => ProviderConfig::default(),
    };
    let server = args.server.as_deref().map(load_server).transpose()?;

    info!("Tunnel store: {}", config.store_path.display());
    let store = Arc::new(TunnelStore::open(&config.store_path));
    let relay = Arc::new(ProcessRelay::new(config.relay.clone()));
    let routes = Arc::new(HookRoutes::new(config.routes.clone()));
    let controller =
        TunnelLifecycleController::spawn(store, relay, routes, config.policy.to_policy());

    tokio::spawn(log_status(controller.subscribe()));

    if let Some(server) = &server {
        connect(&controller, server.clone()).await;
    }

    run_signals(&controller, args.server.as_deref()).await?;

    controller.shutdown().await;
    info!("sg-provider shutting down");
    Ok(())
}

/// Parse `--server`: a share URI or a JSON configuration file
fn load_server(arg: &str) -> Result<ServerConfiguration> {
    if arg.starts_with("ss://") {
        return uri::parse(arg).context("parsing share URI");
    }

    let path = Path::new(arg);
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading server file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing server file {}", path.display()))
}

async fn connect(controller: &ControllerHandle, server: ServerConfiguration) {
    info!("Connecting to {}", server.endpoint());
    if let Err(code) = controller.update_configuration(server).await {
        error!("Tunnel start failed: {}", code);
    }
}

async fn log_status(mut status: StatusReceiver) {
    while status.changed().await.is_ok() {
        let current = *status.borrow_and_update();
        if current.state == ConnectionState::Invalid {
            error!("Tunnel status: {}", current);
        } else {
            info!("Tunnel status: {}", current);
        }
    }
}

#[cfg(unix)]
async fn run_signals(controller: &ControllerHandle, server_arg: Option<&str>) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut sleep = signal(SignalKind::user_defined1())?;
    let mut wake = signal(SignalKind::user_defined2())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping tunnel");
                controller.stop(StopReason::UserInitiated).await;
                return Ok(());
            }
            _ = terminate.recv() => {
                info!("Terminated");
                return Ok(());
            }
            _ = hangup.recv() => match server_arg {
                Some(arg) => match load_server(arg) {
                    Ok(server) => connect(controller, server).await,
                    Err(e) => warn!("Keeping current server: {:#}", e),
                },
                None => controller.handle_wake().await,
            },
            _ = sleep.recv() => controller.handle_sleep().await,
            _ = wake.recv() => controller.handle_wake().await,
        }
    }
}

#[cfg(not(unix))]
async fn run_signals(controller: &ControllerHandle, _server_arg: Option<&str>) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Interrupted, stopping tunnel");
    controller.stop(StopReason::UserInitiated).await;
    Ok(())
}
