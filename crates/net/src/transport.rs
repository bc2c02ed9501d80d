//! Transport contract shared by the local-socket and relay adapters.
//!
//! Adapters move opaque frames (see [`crate::codec`]) to and from peers and
//! report connection changes as events. The host and client engines only ever
//! talk to a `dyn PeerTransport`, so the adapter is picked once at startup.

use crate::protocol::Reliability;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use voxlink_core::PeerId;

/// Something that happened on the transport since the last poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer connection was opened.
    Connected {
        /// Remote peer.
        peer: PeerId,
    },
    /// A peer connection was closed by the remote side or failed.
    Disconnected {
        /// Remote peer.
        peer: PeerId,
        /// Human-readable cause.
        reason: String,
    },
    /// A complete frame arrived.
    Frame {
        /// Sending peer.
        peer: PeerId,
        /// Frame bytes, length prefix included.
        data: Vec<u8>,
    },
}

/// Transport-level failure. Affects only the named peer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No open connection to the peer.
    #[error("no connection to peer {0}")]
    UnknownPeer(PeerId),
    /// The connection's sender has gone away.
    #[error("connection to peer {0} is closed")]
    Closed(PeerId),
    /// Frame too large for this transport and reliability tier.
    #[error("packet of {len} bytes exceeds transport limit of {max}")]
    PacketTooLarge {
        /// Frame length.
        len: usize,
        /// Transport limit.
        max: usize,
    },
    /// The relay backend refused the operation.
    #[error("relay backend error: {0}")]
    Backend(String),
    /// Socket failure.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame transport selected at startup.
///
/// Implementations must preserve per-peer FIFO order for reliable frames and
/// must never block the caller on send or poll.
pub trait PeerTransport: Send + Sync {
    /// Queue a frame for `peer` with the requested delivery tier.
    fn send(&self, peer: &PeerId, frame: &[u8], reliability: Reliability)
        -> Result<(), TransportError>;

    /// Drain at most `max_events` pending events without waiting.
    fn poll(&self, max_events: usize) -> Vec<TransportEvent>;

    /// Close the connection to `peer` after already-queued frames are sent.
    ///
    /// No [`TransportEvent::Disconnected`] is reported for a local close, and
    /// frames from that connection that were not polled yet are dropped.
    fn close(&self, peer: &PeerId, reason: &str) -> Result<(), TransportError>;

    /// Close every connection and stop accepting new ones.
    fn shutdown(&self) -> Result<(), TransportError>;

    /// Largest frame a single send accepts, or `None` for stream transports.
    fn max_packet_size(&self) -> Option<usize>;
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
