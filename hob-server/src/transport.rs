//! Value transport: TCP server for inbound frames and a pool of one outbound connection
//! per remote address, each with handshake, connect timeout and bounded reconnection.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hob_core::pool::SocketStatus;
use hob_core::protocol::ProtocolVersion;
use hob_core::wire::{self, FrameDecodeError, HANDSHAKE_LEN};
use hob_core::{Hub, OutboundAction, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::Config;

pub type SharedHub = Arc<Mutex<Hub>>;
pub type SharedPool = Arc<Mutex<TransportPool>>;

/// A heartbeat to broadcast once after `delay`.
#[derive(Debug)]
pub struct Announcement {
    pub object: String,
    pub datagram: Vec<u8>,
    pub delay: Duration,
}

/// Connection settings shared by every pooled connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectPolicy {
    pub port: u16,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_attempts: u32,
}

impl ConnectPolicy {
    pub fn from_config(c: &Config) -> Self {
        Self {
            port: c.server_port,
            connect_timeout: Duration::from_millis(c.connect_timeout_ms),
            reconnect_delay: Duration::from_millis(c.reconnect_delay_ms),
            max_attempts: c.max_reconnect_attempts,
        }
    }
}

struct Connection {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// One persistent connection per remote address.
pub struct TransportPool {
    policy: ConnectPolicy,
    connections: HashMap<String, Connection>,
}

impl TransportPool {
    pub fn new(policy: ConnectPolicy) -> Self {
        Self {
            policy,
            connections: HashMap::new(),
        }
    }

    /// Make sure a connection to `address` exists. A connection whose task gave up is replaced.
    /// Returns whether a new connection was started.
    pub fn ensure(&mut self, address: &str) -> bool {
        if let Some(c) = self.connections.get(address) {
            if !c.task.is_finished() {
                return false;
            }
            debug!(address, "restarting connection that gave up");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_outbound(
            address.to_string(),
            self.policy,
            rx,
            connected.clone(),
        ));
        self.connections.insert(
            address.to_string(),
            Connection {
                tx,
                connected,
                task,
            },
        );
        true
    }

    /// Queue a frame for `address`, creating the connection on first use.
    /// Frames queued while the connection is down are dropped at its next failed attempt.
    pub fn send(&mut self, address: &str, frame: Vec<u8>) {
        self.ensure(address);
        if let Some(c) = self.connections.get(address) {
            if c.tx.send(frame).is_err() {
                warn!(address, "connection closed; frame dropped");
            }
        }
    }

    pub fn addresses(&self) -> BTreeSet<String> {
        self.connections.keys().cloned().collect()
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.connections
            .get(address)
            .is_some_and(|c| c.connected.load(Ordering::Relaxed))
    }

    pub fn status(&self) -> SocketStatus {
        SocketStatus {
            total: self.connections.len(),
            connected: self
                .connections
                .values()
                .filter(|c| c.connected.load(Ordering::Relaxed))
                .count(),
        }
    }

    pub fn close_all(&mut self) {
        for (address, c) in self.connections.drain() {
            trace!(address = %address, "closing connection");
            c.task.abort();
        }
    }
}

/// Carries core actions to the pool and the heartbeat sender.
#[derive(Clone)]
pub struct Outbox {
    pub pool: SharedPool,
    pub announce: mpsc::UnboundedSender<Announcement>,
}

impl Outbox {
    pub async fn dispatch(&self, actions: Vec<OutboundAction>) {
        if actions.is_empty() {
            return;
        }
        let mut pool = self.pool.lock().await;
        for action in actions {
            match action {
                OutboundAction::Send { address, frame } => pool.send(&address, frame),
                OutboundAction::Announce {
                    object,
                    datagram,
                    delay,
                } => {
                    if let Err(e) = self.announce.send(Announcement {
                        object,
                        datagram,
                        delay,
                    }) {
                        debug!(object = %e.0.object, "announcer gone; announcement dropped");
                    }
                }
            }
        }
    }
}

fn io_err(e: impl std::error::Error + Send + Sync + 'static) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

/// Connector side: advertise our version, read back the negotiated one.
pub async fn handshake_connect<S>(stream: &mut S) -> std::io::Result<ProtocolVersion>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&wire::handshake_bytes(PROTOCOL_VERSION)).await?;
    stream.flush().await?;
    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await?;
    wire::parse_handshake(&buf).map_err(io_err)
}

/// Acceptor side: read the peer's version and answer with the older of the two.
pub async fn handshake_accept<S>(stream: &mut S) -> std::io::Result<ProtocolVersion>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await?;
    let theirs = wire::parse_handshake(&buf).map_err(io_err)?;
    let agreed = wire::negotiate(PROTOCOL_VERSION, theirs);
    stream.write_all(&wire::handshake_bytes(agreed)).await?;
    stream.flush().await?;
    Ok(agreed)
}

async fn connect(address: &str, policy: &ConnectPolicy) -> std::io::Result<(TcpStream, ProtocolVersion)> {
    let mut stream = tokio::time::timeout(policy.connect_timeout, TcpStream::connect((address, policy.port)))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    let version = handshake_connect(&mut stream).await?;
    Ok((stream, version))
}

async fn run_outbound(
    address: String,
    policy: ConnectPolicy,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    connected: Arc<AtomicBool>,
) {
    let mut attempts: u32 = 0;
    loop {
        match connect(&address, &policy).await {
            Ok((stream, version)) => {
                attempts = 0;
                connected.store(true, Ordering::Relaxed);
                info!(address = %address, protocol = %version, "connected");
                let pool_dropped = pump(stream, &mut rx).await;
                connected.store(false, Ordering::Relaxed);
                if pool_dropped {
                    return;
                }
                warn!(address = %address, "connection lost; reconnecting");
            }
            Err(e) => {
                attempts += 1;
                debug!(address = %address, attempt = attempts, "connect failed: {e}");
                let mut dropped = 0;
                while rx.try_recv().is_ok() {
                    dropped += 1;
                }
                if dropped > 0 {
                    warn!(address = %address, dropped, "dropping frames queued while disconnected");
                }
                if attempts >= policy.max_attempts {
                    warn!(address = %address, attempts, "giving up on connection");
                    return;
                }
            }
        }
        tokio::time::sleep(policy.reconnect_delay).await;
    }
}

/// Write queued frames until the peer goes away (false) or the pool drops the sender (true).
async fn pump(stream: TcpStream, rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> bool {
    let (mut reader, mut writer) = stream.into_split();
    let mut sink = [0u8; 64];
    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    return true;
                };
                if let Err(e) = writer.write_all(&frame).await {
                    warn!("write failed: {e}");
                    return false;
                }
            }
            read = reader.read(&mut sink) => {
                match read {
                    Ok(0) | Err(_) => return false,
                    Ok(_) => {}
                }
            }
        }
    }
}

/// Accept inbound connections until shutdown.
pub async fn run_server(
    listener: TcpListener,
    hub: SharedHub,
    outbox: Outbox,
    mut shutdown: broadcast::Receiver<()>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("value server listening on {addr}");
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let hub = hub.clone();
                        let outbox = outbox.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_inbound(stream, hub, outbox).await {
                                debug!(%peer, "inbound connection ended: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
            _ = shutdown.recv() => {
                debug!("value server shutting down");
                break;
            }
        }
    }
}

async fn handle_inbound(mut stream: TcpStream, hub: SharedHub, outbox: Outbox) -> std::io::Result<()> {
    let version = handshake_accept(&mut stream).await?;
    trace!(protocol = %version, "inbound handshake complete");
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        loop {
            match wire::decode_frame(&buf) {
                Ok((text, used)) => {
                    buf.drain(..used);
                    let actions = hub.lock().await.on_value_message_with(version, &text);
                    if let Some(actions) = actions {
                        outbox.dispatch(actions).await;
                    }
                }
                Err(FrameDecodeError::NeedMore) => break,
                Err(e) => return Err(io_err(e)),
            }
        }
    }
}

/// Periodically open connections the link graph needs and log pool status when it changes.
pub async fn run_reconciler(
    hub: SharedHub,
    pool: SharedPool,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut last: Option<SocketStatus> = None;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let status = reconcile_once(&hub, &pool).await;
                if last != Some(status) {
                    report_status(&hub, &pool, status).await;
                    last = Some(status);
                }
            }
            _ = shutdown.recv() => {
                debug!("reconciler shutting down");
                break;
            }
        }
    }
}

/// One reconciliation pass. Never holds the hub and pool locks together.
pub async fn reconcile_once(hub: &SharedHub, pool: &SharedPool) -> SocketStatus {
    let open = pool.lock().await.addresses();
    let plan = hub.lock().await.reconcile(&open);
    for address in &plan.idle {
        debug!(address = %address, "connection no longer referenced by any link");
    }
    for address in &plan.to_open {
        debug!(address = %address, "opening connection");
    }
    let mut p = pool.lock().await;
    // Wanted rather than to_open: also revives connections that gave up.
    for address in &plan.wanted {
        p.ensure(address);
    }
    p.status()
}

async fn report_status(hub: &SharedHub, pool: &SharedPool, status: SocketStatus) {
    let waiting: Vec<String> = {
        let p = pool.lock().await;
        p.addresses().into_iter().filter(|a| !p.is_connected(a)).collect()
    };
    {
        let h = hub.lock().await;
        for address in &waiting {
            for id in hob_core::pool::objects_at(h.known(), address) {
                info!(object = id, address = %address, "looking for object");
            }
        }
    }
    info!("{status}");
}
