//! CLASP router daemon
//!
//! Binds the transport front-ends, supervises bridges, advertises over
//! discovery, and exposes the stdio control surface the desktop shell
//! drives.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 transport
//! bind failure, 3 internal invariant violation.

mod config;

#[cfg(feature = "bridges")]
mod control;

use clap::Parser;
use clasp_core::DEFAULT_PORT;
use clasp_router::{Router, RouterConfig};
use clasp_transport::WebSocketServer;
use config::DaemonConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "claspd", version, about = "CLASP router daemon")]
struct Cli {
    /// Config file (.json or .toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket listen address.
    #[arg(short, long)]
    listen: Option<String>,

    /// Raw TCP listen address.
    #[arg(long)]
    tcp: Option<String>,

    /// UDP listen address.
    #[arg(long)]
    udp: Option<String>,

    /// Router name for WELCOME and discovery.
    #[arg(short, long)]
    name: Option<String>,

    /// Advertise over mDNS and answer UDP probes.
    #[arg(short, long)]
    announce: bool,

    /// Refuse sessions that present no token.
    #[arg(long)]
    require_token: bool,

    /// Disable the stdio control surface.
    #[arg(long)]
    no_control: bool,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // A panic anywhere in the runtime is an invariant violation.
    std::panic::set_hook(Box::new(|info| {
        eprintln!("internal invariant violated: {info}");
        std::process::exit(3);
    }));

    let file_config = match &cli.config {
        Some(path) => match DaemonConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("config error: {e:#}");
                return ExitCode::from(1);
            }
        },
        None => DaemonConfig::default(),
    };

    match run(cli, file_config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

async fn run(cli: Cli, file: DaemonConfig) -> Result<(), u8> {
    let name = cli
        .name
        .or(file.name)
        .unwrap_or_else(|| "CLASP Router".to_string());
    let listen = cli
        .listen
        .or(file.listen)
        .unwrap_or_else(|| format!("0.0.0.0:{DEFAULT_PORT}"));
    let announce = cli.announce || file.announce;

    let tokens = file.token_book().map_err(|e| {
        error!("config error: {e:#}");
        1u8
    })?;

    let router_config = RouterConfig {
        name: name.clone(),
        require_token: cli.require_token || file.require_token,
        ..Default::default()
    };
    let router = Arc::new(Router::new(router_config, tokens));
    router.start();

    // WebSocket front-end is mandatory.
    let ws = WebSocketServer::bind(&listen).await.map_err(|e| {
        error!("cannot bind websocket on {listen}: {e}");
        2u8
    })?;
    let ws_port = ws.local_addr().map(|a| a.port()).unwrap_or(DEFAULT_PORT);
    info!(%listen, "websocket front-end up");
    {
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = router.serve(ws).await {
                warn!("websocket serve ended: {e}");
            }
        });
    }

    if let Some(addr) = cli.tcp.clone().or(file.tcp.clone()) {
        let server = clasp_transport::TcpServer::bind(&addr).await.map_err(|e| {
            error!("cannot bind tcp on {addr}: {e}");
            2u8
        })?;
        info!(%addr, "tcp front-end up");
        let router = router.clone();
        tokio::spawn(async move {
            let _ = router.serve(server).await;
        });
    }

    if let Some(addr) = cli.udp.clone().or(file.udp.clone()) {
        let server = clasp_transport::UdpServer::bind(&addr).await.map_err(|e| {
            error!("cannot bind udp on {addr}: {e}");
            2u8
        })?;
        info!(%addr, "udp front-end up");
        let router = router.clone();
        tokio::spawn(async move {
            let _ = router.serve(server).await;
        });
    }

    #[cfg(not(feature = "discovery"))]
    let _ = (announce, ws_port);

    #[cfg(feature = "discovery")]
    let _discovery = if announce {
        let identity = clasp_discovery::RouterIdentity {
            name: name.clone(),
            ws_port,
        };
        let mut advertiser = match clasp_discovery::MdnsAdvertiser::new() {
            Ok(advertiser) => Some(advertiser),
            Err(e) => {
                warn!("mdns unavailable: {e}");
                None
            }
        };
        if let Some(advertiser) = advertiser.as_mut() {
            if let Err(e) = advertiser.advertise(&identity) {
                warn!("mdns advertise failed: {e}");
            }
        }
        let responder = match clasp_discovery::ProbeResponder::bind(identity).await {
            Ok(responder) => Some(responder),
            Err(e) => {
                warn!("probe responder unavailable: {e}");
                None
            }
        };
        Some((advertiser, responder))
    } else {
        None
    };

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    #[cfg(feature = "bridges")]
    {
        let runtime = clasp_bridge::BridgeRuntime::new(router.dispatcher.clone());
        for entry in &file.bridges {
            let spec = clasp_bridge::BridgeSpec {
                id: entry.id.clone(),
                kind: entry.source.clone(),
                source_addr: entry.source_addr.clone(),
                target_addr: entry.target_addr.clone(),
                config: entry.config.clone(),
            };
            if let Err(e) = runtime.create(spec).await {
                error!("config error: bridge {}: {e}", entry.id);
                return Err(1);
            }
        }

        if !cli.no_control {
            let dispatcher = router.dispatcher.clone();
            let shutdown_tx = shutdown_tx.clone();
            tokio::spawn(control::run(dispatcher, runtime, shutdown_tx));
        }
    }

    // Hold the sender so the channel outlives a disabled control
    // surface; ctrl-c is then the only way down.
    let _shutdown_tx = shutdown_tx;

    info!(name = %name, "router ready");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
        }
        _ = shutdown_rx.recv() => {
            info!("shutdown via control surface");
        }
    }

    router.shutdown();
    // Let session tasks observe the signal.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}
