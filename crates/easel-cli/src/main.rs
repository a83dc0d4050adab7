//! `easel` command-line entry point.

mod passthrough;

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use easel::host::demo::demo_commands;
use easel::transport::{dialer, listener};
use easel::{
    Bridge, BridgeConfig, DialConfig, Dispatcher, HostConfig, ListenerConfig, RelayConfig, host,
    relay,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Request/response bridge between an LLM controller and an image-editor host
#[derive(Parser)]
#[command(name = "easel", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for the host to connect, then forward stdin calls to it
    Listen(ListenArgs),
    /// Dial a host or relay, then forward stdin calls to it
    Dial(DialArgs),
    /// Relay between a dialing host and a dialing controller
    Relay(RelayArgs),
    /// Run the demo host peer (echo, ping)
    Host(HostArgs),
}

#[derive(Args)]
struct ListenArgs {
    /// Interface to bind
    #[arg(long, env = "EASEL_HOST")]
    host: Option<String>,

    /// Port to bind
    #[arg(short, long, env = "EASEL_PORT")]
    port: Option<u16>,

    /// Per-call deadline in milliseconds
    #[arg(long, env = "EASEL_REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,
}

#[derive(Args)]
struct DialArgs {
    /// WebSocket URL of the host or relay
    #[arg(env = "EASEL_URL")]
    url: String,

    /// Handshake deadline in milliseconds
    #[arg(long, env = "EASEL_CONNECT_TIMEOUT_MS")]
    connect_timeout_ms: Option<u64>,

    /// Per-call deadline in milliseconds
    #[arg(long, env = "EASEL_REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,
}

#[derive(Args)]
struct RelayArgs {
    #[arg(long, env = "EASEL_HOST")]
    host: Option<String>,

    #[arg(short, long, env = "EASEL_PORT")]
    port: Option<u16>,

    /// Path the controller connects on; the host uses `/`
    #[arg(long, env = "EASEL_RELAY_SECONDARY_PATH")]
    secondary_path: Option<String>,
}

#[derive(Args)]
struct HostArgs {
    /// Bridge or relay URL to dial (ignored with --listen)
    #[arg(env = "EASEL_URL")]
    url: Option<String>,

    /// Accept a dialing bridge instead of dialing out
    #[arg(long)]
    listen: bool,

    /// Port to bind with --listen
    #[arg(short, long, env = "EASEL_PORT")]
    port: Option<u16>,

    /// Wait between reconnect attempts in milliseconds
    #[arg(long, env = "EASEL_RECONNECT_DELAY_MS")]
    reconnect_delay_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let shutdown = shutdown_token();

    match cli.command {
        Commands::Listen(args) => listen(args, shutdown).await,
        Commands::Dial(args) => dial(args, shutdown).await,
        Commands::Relay(args) => run_relay(args, shutdown).await,
        Commands::Host(args) => run_host(args, shutdown).await,
    }
}

fn bridge_config(request_timeout_ms: Option<u64>) -> BridgeConfig {
    let config = BridgeConfig::from_env();
    match request_timeout_ms {
        Some(ms) => config.with_request_timeout(Duration::from_millis(ms)),
        None => config,
    }
}

async fn listen(args: ListenArgs, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut config = ListenerConfig::from_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let bridge = Bridge::new(bridge_config(args.request_timeout_ms));
    let server = tokio::spawn(listener::serve(config, bridge.clone(), shutdown.clone()));

    passthrough::run(bridge, shutdown.clone()).await?;
    shutdown.cancel();
    server.await?
}

async fn dial(args: DialArgs, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut config = DialConfig::from_env();
    if let Some(ms) = args.connect_timeout_ms {
        config.connect_timeout = Duration::from_millis(ms);
    }

    let bridge = Bridge::new(bridge_config(args.request_timeout_ms));
    let handle = dialer::dial(&bridge, &args.url, &config).await?;
    tokio::spawn(async move {
        handle.closed().await;
        tracing::warn!(connection_id = %handle.id(), "Peer connection closed");
    });

    passthrough::run(bridge.clone(), shutdown).await?;
    bridge.close();
    Ok(())
}

async fn run_relay(args: RelayArgs, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut config = RelayConfig::from_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(path) = args.secondary_path {
        config.secondary_path = path;
    }
    relay::serve(config, shutdown).await
}

async fn run_host(args: HostArgs, shutdown: CancellationToken) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::new(demo_commands());

    if args.listen {
        if let Some(url) = &args.url {
            tracing::debug!(%url, "Listening, dial URL ignored");
        }
        let mut config = ListenerConfig::from_env();
        if let Some(port) = args.port {
            config.port = port;
        }
        return host::serve_listener(config, dispatcher, shutdown).await;
    }

    let mut config = HostConfig::from_env();
    if let Some(url) = args.url {
        config.url = url;
    }
    if let Some(ms) = args.reconnect_delay_ms {
        config.reconnect_delay = Duration::from_millis(ms);
    }
    host::run_host(config, dispatcher, shutdown).await;
    Ok(())
}

/// Install the global subscriber. Logs go to stderr; stdout carries call results.
fn init_tracing() {
    let json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");
    let filter = log_filter(
        std::env::var("RUST_LOG").ok().as_deref(),
        std::env::var("EASEL_LOG").ok().as_deref(),
    );

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .try_init();
}

/// `RUST_LOG` directives win. Otherwise `EASEL_LOG` sets one level for the
/// easel crates, defaulting to info.
fn log_filter(rust_log: Option<&str>, easel_log: Option<&str>) -> EnvFilter {
    if let Some(directives) = rust_log {
        return EnvFilter::new(directives);
    }
    let level = match easel_log.map(str::trim) {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn" | "warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    EnvFilter::new(format!("easel={level},easel_cli={level}"))
}

/// Cancelled on SIGINT or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        trigger.cancel();
    });
    token
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
