// Hybrid object server: heartbeat discovery, value transport and object persistence daemon.

mod bridge;
mod config;
mod discovery;
mod persist;
mod transport;

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::Arc;

use anyhow::Context;
use hob_core::Hub;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("hob-server {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load()?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let ip = cfg.ip.clone().unwrap_or_else(detect_ip);
    info!(ip = %ip, version = VERSION, "starting hob-server");

    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let mut hub = Hub::with_bridge(&ip, Box::new(bridge::ServerBridge::new(write_tx)));
    let objects = persist::load_objects(&cfg.objects_dir)
        .with_context(|| format!("loading objects from {}", cfg.objects_dir.display()))?;
    for object in objects {
        let id = object.id.clone();
        if let Err(e) = hub.load_object(object) {
            warn!(object = %id, "not loaded: {e}");
        }
    }
    info!(count = hub.registry().objects().count(), "objects loaded");
    hub.initialize();
    let hub = Arc::new(Mutex::new(hub));

    let pool = Arc::new(Mutex::new(transport::TransportPool::new(
        transport::ConnectPolicy::from_config(&cfg),
    )));
    let (announce_tx, announce_rx) = mpsc::unbounded_channel();
    let outbox = transport::Outbox {
        pool: pool.clone(),
        announce: announce_tx,
    };
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let listener = tokio::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, cfg.server_port))
        .await
        .with_context(|| format!("binding value server on port {}", cfg.server_port))?;

    let writer = tokio::spawn(bridge::run_writer(
        cfg.objects_dir.clone(),
        write_rx,
        shutdown_tx.subscribe(),
    ));
    tokio::spawn(transport::run_server(
        listener,
        hub.clone(),
        outbox.clone(),
        shutdown_tx.subscribe(),
    ));
    tokio::spawn(transport::run_reconciler(
        hub.clone(),
        pool.clone(),
        cfg.socket_update_interval(),
        shutdown_tx.subscribe(),
    ));
    let settings = discovery::BeatSettings {
        port: cfg.beat_port,
        ttl: cfg.broadcast_ttl,
        interval: cfg.beat_interval(),
        jitter: cfg.beat_jitter(),
    };
    let disc_hub = hub.clone();
    let disc_shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = discovery::run_discovery(disc_hub, outbox, announce_rx, settings, disc_shutdown).await {
            warn!("discovery stopped: {e}");
        }
    });

    shutdown_signal().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(());
    hub.lock().await.shutdown();
    pool.lock().await.close_all();
    let _ = writer.await;
    Ok(())
}

/// Local address used for outbound traffic; `0.0.0.0` when there is no route.
fn detect_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let s = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        s.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(s.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| Ipv4Addr::UNSPECIFIED.to_string())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
