//! Local-socket transport over TCP.
//!
//! Each connection gets a read loop task that splits the byte stream into
//! frames and a writer task that is the sole owner of the write half, so
//! frames from concurrent senders are never interleaved. Events land in a
//! shared queue drained by [`PeerTransport::poll`].
//!
//! The peer identity of a TCP peer is its remote socket address.

use crate::codec::FrameBuffer;
use crate::protocol::Reliability;
use crate::transport::{lock, PeerTransport, TransportError, TransportEvent};
use anyhow::{Context, Result};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use voxlink_core::PeerId;

const READ_CHUNK: usize = 16 * 1024;

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

struct PeerLink {
    id: u64,
    outbound: UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
}

/// Connection table and event queue shared with the background tasks.
///
/// Lock order is `peers` then `events`.
#[derive(Default)]
struct Links {
    next_id: AtomicU64,
    events: Mutex<VecDeque<TransportEvent>>,
    peers: Mutex<HashMap<PeerId, PeerLink>>,
}

fn event_peer(event: &TransportEvent) -> &PeerId {
    match event {
        TransportEvent::Connected { peer }
        | TransportEvent::Disconnected { peer, .. }
        | TransportEvent::Frame { peer, .. } => peer,
    }
}

impl Links {
    /// Start the read and write tasks for a freshly opened stream.
    fn attach(self: &Arc<Self>, peer: PeerId, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "Failed to disable Nagle: {}", e);
        }
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(write_loop(write_half, rx, peer.clone()));

        // Hold the table while spawning so the reader's first frame and an
        // immediate EOF both find the link.
        let mut peers = lock(&self.peers);
        lock(&self.events).push_back(TransportEvent::Connected { peer: peer.clone() });
        let reader = tokio::spawn(read_loop(read_half, peer.clone(), id, Arc::clone(self)));
        let previous = peers.insert(
            peer,
            PeerLink {
                id,
                outbound: tx,
                reader,
            },
        );
        drop(peers);
        if let Some(old) = previous {
            let _ = old.outbound.send(Outbound::Close);
            old.reader.abort();
        }
    }

    /// Queue a frame read on connection `id`. Returns `false` once that
    /// connection is no longer current.
    fn push_frame(&self, peer: &PeerId, id: u64, data: Vec<u8>) -> bool {
        let peers = lock(&self.peers);
        if peers.get(peer).map(|link| link.id) != Some(id) {
            return false;
        }
        lock(&self.events).push_back(TransportEvent::Frame {
            peer: peer.clone(),
            data,
        });
        true
    }

    /// Record a remote close or read failure on connection `id`.
    fn remote_closed(&self, peer: &PeerId, id: u64, reason: String) {
        let mut peers = lock(&self.peers);
        if peers.get(peer).map(|link| link.id) != Some(id) {
            return;
        }
        if let Some(link) = peers.remove(peer) {
            let _ = link.outbound.send(Outbound::Close);
            info!(%peer, %reason, "Peer disconnected");
            lock(&self.events).push_back(TransportEvent::Disconnected {
                peer: peer.clone(),
                reason,
            });
        }
    }

    fn send(&self, peer: &PeerId, frame: &[u8]) -> Result<(), TransportError> {
        let peers = lock(&self.peers);
        let link = peers
            .get(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;
        link.outbound
            .send(Outbound::Frame(frame.to_vec()))
            .map_err(|_| TransportError::Closed(peer.clone()))
    }

    /// Close locally. Events from the connection that were not polled yet
    /// are discarded.
    fn close(&self, peer: &PeerId, reason: &str) -> Result<(), TransportError> {
        let mut peers = lock(&self.peers);
        let link = peers
            .remove(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;
        lock(&self.events).retain(|event| event_peer(event) != peer);
        drop(peers);
        debug!(%peer, reason, "Closing connection");
        link.reader.abort();
        link.outbound
            .send(Outbound::Close)
            .map_err(|_| TransportError::Closed(peer.clone()))
    }

    fn close_all(&self, reason: &str) {
        let drained: Vec<(PeerId, PeerLink)> = {
            let mut peers = lock(&self.peers);
            lock(&self.events).clear();
            peers.drain().collect()
        };
        for (peer, link) in drained {
            debug!(%peer, reason, "Closing connection");
            link.reader.abort();
            let _ = link.outbound.send(Outbound::Close);
        }
    }

    fn poll(&self, max_events: usize) -> Vec<TransportEvent> {
        let mut events = lock(&self.events);
        let count = max_events.min(events.len());
        events.drain(..count).collect()
    }
}

async fn read_loop(mut reader: OwnedReadHalf, peer: PeerId, id: u64, links: Arc<Links>) {
    let mut frames = FrameBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    let reason = 'read: loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break "connection closed by peer".to_string(),
            Ok(n) => {
                frames.extend(&chunk[..n]);
                loop {
                    match frames.next_frame() {
                        Ok(Some(data)) => {
                            trace!(%peer, len = data.len(), "Received frame");
                            if !links.push_frame(&peer, id, data) {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => break 'read format!("malformed stream: {e}"),
                    }
                }
            }
            Err(e) => break format!("read failed: {e}"),
        }
    };

    links.remote_closed(&peer, id, reason);
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: UnboundedReceiver<Outbound>,
    peer: PeerId,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => {
                if let Err(e) = writer.write_all(&frame).await {
                    warn!(%peer, "Write failed: {}", e);
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!(%peer, "Shutdown failed: {}", e);
    }
}

/// Host side of the local-socket transport: a listener plus one link per
/// accepted peer.
pub struct TcpHostTransport {
    local_addr: SocketAddr,
    links: Arc<Links>,
    accept_task: JoinHandle<()>,
}

impl TcpHostTransport {
    /// Bind a listener and start accepting peers in the background.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind host listener on {addr}"))?;
        let local_addr = listener.local_addr()?;
        info!("Host transport listening on {}", local_addr);

        let links = Arc::new(Links::default());
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&links)));

        Ok(Self {
            local_addr,
            links,
            accept_task,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(listener: TcpListener, links: Arc<Links>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                links.attach(PeerId::new(addr.to_string()), stream);
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

impl PeerTransport for TcpHostTransport {
    fn send(
        &self,
        peer: &PeerId,
        frame: &[u8],
        _reliability: Reliability,
    ) -> Result<(), TransportError> {
        self.links.send(peer, frame)
    }

    fn poll(&self, max_events: usize) -> Vec<TransportEvent> {
        self.links.poll(max_events)
    }

    fn close(&self, peer: &PeerId, reason: &str) -> Result<(), TransportError> {
        self.links.close(peer, reason)
    }

    fn shutdown(&self) -> Result<(), TransportError> {
        self.accept_task.abort();
        self.links.close_all("host shutting down");
        Ok(())
    }

    fn max_packet_size(&self) -> Option<usize> {
        None
    }
}

impl Drop for TcpHostTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Client side of the local-socket transport: one link to the host.
pub struct TcpClientTransport {
    host: PeerId,
    links: Arc<Links>,
}

impl TcpClientTransport {
    /// Connect to a host listening at `addr`.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        info!("Connecting to host at {}", addr);
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to host at {addr}"))?;
        let host = PeerId::new(addr.to_string());

        let links = Arc::new(Links::default());
        links.attach(host.clone(), stream);
        info!("Connected to host at {}", addr);

        Ok(Self { host, links })
    }

    /// Peer identity of the host this transport is connected to.
    pub fn host_peer(&self) -> &PeerId {
        &self.host
    }
}

impl PeerTransport for TcpClientTransport {
    fn send(
        &self,
        peer: &PeerId,
        frame: &[u8],
        _reliability: Reliability,
    ) -> Result<(), TransportError> {
        self.links.send(peer, frame)
    }

    fn poll(&self, max_events: usize) -> Vec<TransportEvent> {
        self.links.poll(max_events)
    }

    fn close(&self, peer: &PeerId, reason: &str) -> Result<(), TransportError> {
        self.links.close(peer, reason)
    }

    fn shutdown(&self) -> Result<(), TransportError> {
        self.links.close_all("client shutting down");
        Ok(())
    }

    fn max_packet_size(&self) -> Option<usize> {
        None
    }
}
