//! LAN discovery: broadcast heartbeats for local objects, feed received datagrams to the hub.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hob_core::discovery::{jittered, ping_datagram};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::transport::{Announcement, Outbox, SharedHub};

/// Heartbeat timing and addressing.
#[derive(Debug, Clone, Copy)]
pub struct BeatSettings {
    pub port: u16,
    pub ttl: u32,
    pub interval: Duration,
    pub jitter: Duration,
}

/// Run heartbeat broadcast, datagram reception and one-shot announcements until shutdown.
pub async fn run_discovery(
    hub: SharedHub,
    outbox: Outbox,
    announcements: mpsc::UnboundedReceiver<Announcement>,
    settings: BeatSettings,
    shutdown: broadcast::Sender<()>,
) -> std::io::Result<()> {
    let listen = make_listen_socket(settings.port)?;
    let send = Arc::new(make_send_socket(settings.ttl)?);
    let dest = SocketAddr::from((Ipv4Addr::BROADCAST, settings.port));

    if let Err(e) = send.send_to(&ping_datagram(), dest).await {
        warn!("initial ping failed: {e}");
    }

    let beat_task = tokio::spawn(beat_loop(
        hub.clone(),
        send.clone(),
        dest,
        settings,
        shutdown.subscribe(),
    ));
    let recv_task = tokio::spawn(recv_loop(listen, hub, outbox, shutdown.subscribe()));
    let announce_task = tokio::spawn(announce_loop(send, dest, announcements, shutdown.subscribe()));

    let (_, recv, _) = tokio::join!(beat_task, recv_task, announce_task);
    match recv {
        Ok(r) => r,
        Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
    }
}

fn make_listen_socket(port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

fn make_send_socket(ttl: u32) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    std_sock.set_broadcast(true)?;
    std_sock.set_ttl(ttl)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Every jittered interval, broadcast one heartbeat per local active object.
async fn beat_loop(
    hub: SharedHub,
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    settings: BeatSettings,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let datagrams: Vec<Vec<u8>> = {
            let h = hub.lock().await;
            h.local_object_ids()
                .iter()
                .filter_map(|id| h.heartbeat(id))
                .map(|hb| hb.to_datagram())
                .collect()
        };
        for d in &datagrams {
            if let Err(e) = socket.send_to(d, dest).await {
                warn!("heartbeat send failed: {e}");
            }
        }
        trace!(count = datagrams.len(), "heartbeats sent");
        tokio::select! {
            _ = tokio::time::sleep(jittered(settings.interval, settings.jitter)) => {}
            _ = shutdown.recv() => {
                debug!("heartbeat loop shutting down");
                return;
            }
        }
    }
}

async fn recv_loop(
    socket: UdpSocket,
    hub: SharedHub,
    outbox: Outbox,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, from) = received?;
                trace!(%from, len = n, "datagram");
                let actions = hub.lock().await.on_datagram(&buf[..n]);
                outbox.dispatch(actions).await;
            }
            _ = shutdown.recv() => {
                debug!("discovery receiver shutting down");
                return Ok(());
            }
        }
    }
}

/// Send each one-shot announcement after its delay.
async fn announce_loop(
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<Announcement>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            next = rx.recv() => {
                let Some(a) = next else { return };
                let socket = socket.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(a.delay).await;
                    match socket.send_to(&a.datagram, dest).await {
                        Ok(_) => debug!(object = %a.object, "announced"),
                        Err(e) => warn!(object = %a.object, "announce failed: {e}"),
                    }
                });
            }
            _ = shutdown.recv() => return,
        }
    }
}
