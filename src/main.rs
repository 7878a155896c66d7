use portgate::config::Config;
use portgate::logger::TracingLogger;
use portgate::router::ProxyRouter;
use portgate::scanner::{ScanEngine, ScanSettings};
use portgate::server::GatewayServer;
use portgate::upstream::HttpUpstream;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Version information
const VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("portgate.toml"));

    // The log file location lives in the config, so load it first
    let loaded = Config::load(&config_path);
    init_tracing(loaded.as_ref().ok().and_then(|c| c.log.file.as_deref()))?;

    let config = loaded.map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let settings = ScanSettings::from_config(&config.scanner)?;
    let bind_addr = config.gateway.bind_addr()?;

    let engine = Arc::new(ScanEngine::new(
        settings,
        config.scanner.provider.build(),
        TracingLogger::shared("port_scanner"),
    ));

    // Have a snapshot before the first request arrives
    let scanning = Arc::clone(&engine);
    if let Err(e) = tokio::task::spawn_blocking(move || scanning.scan_now()).await? {
        warn!(error = %e, "Initial port scan failed, starting with an empty snapshot");
    }
    engine.start()?;

    let upstream = Arc::new(HttpUpstream::new(config.gateway.request_timeout()));
    let router = Arc::new(
        ProxyRouter::new(
            config.gateway.base_port,
            engine.clone(),
            upstream,
            TracingLogger::shared("proxy_gateway"),
        )
        .with_targets(&config.gateway.targets),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = GatewayServer::bind(bind_addr, router, shutdown_rx)
        .await
        .map_err(|e| {
            error!(addr = %bind_addr, error = %e, "Failed to bind gateway");
            e
        })?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    wait_for_shutdown_signal().await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    // stop() joins the scanner thread, keep that off the async workers
    let stopping = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || stopping.stop()).await?;

    info!("Shutdown complete");
    Ok(())
}

/// Console output always; a plain-text file as well when configured
fn init_tracing(log_file: Option<&str>) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("portgate=debug".parse().expect("valid log directive"));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.gateway.bind,
        port = config.gateway.port,
        base_port = config.gateway.base_port,
        request_timeout_secs = config.gateway.request_timeout_secs,
        "Gateway configuration"
    );
    info!(
        targets = ?config.gateway.targets,
        "Proxy targets"
    );
    info!(
        begin = config.scanner.begin,
        end = config.scanner.end,
        interval_secs = config.scanner.interval().as_duration().as_secs(),
        provider = ?config.scanner.provider,
        families = ?config.scanner.families,
        "Scanner configuration"
    );
    if let Some(ref file) = config.log.file {
        info!(file = %file, "Logging to file");
    }
}
