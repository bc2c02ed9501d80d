//! Relay-based peer-to-peer transport.
//!
//! The relay library (see [`RelayBackend`]) delivers packets addressed by peer
//! identity, with a reliability tier per packet and a connection-request /
//! connection-closed callback model instead of a listening socket. This
//! adapter turns that into a [`PeerTransport`]:
//!
//! - connection callbacks arrive on the library's thread and are queued as
//!   [`TransportEvent`]s;
//! - [`PeerTransport::poll`] drains pending packets (bounded per call) and then
//!   the queued connection events, so frames a peer sent before closing are
//!   seen before its close;
//! - reliable frames larger than the relay packet limit are split into ordered
//!   fragments and reassembled here. Unreliable frames that do not fit are
//!   rejected.

use crate::protocol::{Reliability, MAX_FRAME_LEN};
use crate::transport::{lock, PeerTransport, TransportError, TransportEvent};
use crossbeam_queue::SegQueue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tracing::{debug, info, warn};
use voxlink_core::PeerId;

/// Relay channel carrying reliable-ordered packets.
pub const RELIABLE_CHANNEL: u8 = 0;
/// Relay channel carrying unreliable packets.
pub const UNRELIABLE_CHANNEL: u8 = 1;

const PACKET_WHOLE: u8 = 0;
const PACKET_FRAGMENT: u8 = 1;
const PACKET_LAST_FRAGMENT: u8 = 2;
const ENVELOPE_LEN: usize = 1;

/// Error reported by a relay backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// No route to the remote identity.
    #[error("peer {0} is not reachable")]
    Unreachable(PeerId),
    /// Packet exceeds the backend limit.
    #[error("packet of {len} bytes exceeds relay limit of {max}")]
    PacketTooLarge {
        /// Packet length.
        len: usize,
        /// Relay limit.
        max: usize,
    },
    /// The local endpoint has been shut down.
    #[error("relay endpoint is closed")]
    Closed,
}

impl From<RelayError> for TransportError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::PacketTooLarge { len, max } => TransportError::PacketTooLarge { len, max },
            other => TransportError::Backend(other.to_string()),
        }
    }
}

/// Packet received from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPacket {
    /// Sender identity.
    pub from: PeerId,
    /// Channel the packet was sent on.
    pub channel: u8,
    /// Packet bytes.
    pub data: Vec<u8>,
}

/// Connection notifications raised by the relay library on its own thread.
pub trait RelayNotify: Send + Sync {
    /// A remote identity wants to open a connection to us.
    fn connection_requested(&self, remote: &PeerId);
    /// A connection was closed by the remote side or lost.
    fn connection_closed(&self, remote: &PeerId, reason: &str);
}

/// Surface of the peer-to-peer relay library consumed by [`RelayTransport`].
pub trait RelayBackend: Send + Sync {
    /// Identity of the local endpoint.
    fn local_id(&self) -> &PeerId;
    /// Largest packet one send accepts.
    fn max_packet_size(&self) -> usize;
    /// Register the connection notification handler.
    fn set_notify(&self, notify: Weak<dyn RelayNotify>);
    /// Accept a pending connection request.
    fn accept_connection(&self, remote: &PeerId) -> Result<(), RelayError>;
    /// Close the connection to `remote`. Packets already sent are still
    /// delivered.
    fn close_connection(&self, remote: &PeerId) -> Result<(), RelayError>;
    /// Send one packet.
    fn send_packet(
        &self,
        remote: &PeerId,
        channel: u8,
        reliability: Reliability,
        data: &[u8],
    ) -> Result<(), RelayError>;
    /// Pop the next received packet without waiting.
    fn receive_packet(&self) -> Option<RelayPacket>;
}

/// Parse a join-info string into the host's peer identity.
///
/// Accepts `puid=<identifier>` and `<scheme>://join/<identifier>`.
pub fn parse_join_info(info: &str) -> Option<PeerId> {
    let info = info.trim();
    let id = if let Some(id) = info.strip_prefix("puid=") {
        id
    } else {
        let (_scheme, rest) = info.split_once("://")?;
        rest.strip_prefix("join/")?.trim_end_matches('/')
    };

    if id.is_empty() || id.contains(['/', '?', '#']) || id.chars().any(char::is_whitespace) {
        return None;
    }
    Some(PeerId::new(id))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Role {
    Host,
    Client { host: PeerId },
}

/// Connection state touched by both the relay callback thread and the pump.
struct RelayState {
    role: Role,
    backend: Weak<dyn RelayBackend>,
    events: SegQueue<TransportEvent>,
    connected: Mutex<HashSet<PeerId>>,
}

impl RelayNotify for RelayState {
    fn connection_requested(&self, remote: &PeerId) {
        if let Role::Client { host } = &self.role {
            if remote != host {
                debug!(%remote, "Ignoring connection request from non-host peer");
                return;
            }
        }
        let Some(backend) = self.backend.upgrade() else {
            return;
        };
        match backend.accept_connection(remote) {
            Ok(()) => {
                info!(%remote, "Accepted relay connection");
                lock(&self.connected).insert(remote.clone());
                self.events.push(TransportEvent::Connected {
                    peer: remote.clone(),
                });
            }
            Err(e) => warn!(%remote, "Failed to accept relay connection: {}", e),
        }
    }

    fn connection_closed(&self, remote: &PeerId, reason: &str) {
        let was_connected = lock(&self.connected).remove(remote);
        if was_connected {
            info!(%remote, reason, "Relay connection closed");
            self.events.push(TransportEvent::Disconnected {
                peer: remote.clone(),
                reason: reason.to_string(),
            });
        }
    }
}

/// [`PeerTransport`] over a [`RelayBackend`].
pub struct RelayTransport {
    backend: Arc<dyn RelayBackend>,
    state: Arc<RelayState>,
    reassembly: Mutex<HashMap<PeerId, Vec<u8>>>,
    // Packets pulled from the backend ahead of a local close, oldest first.
    backlog: Mutex<VecDeque<RelayPacket>>,
}

impl RelayTransport {
    /// Create the host side: every connection request is accepted.
    pub fn host(backend: Arc<dyn RelayBackend>) -> Self {
        Self::with_role(backend, Role::Host)
    }

    /// Create the client side: only the given host may connect, and it is
    /// treated as connected from the start.
    pub fn client(backend: Arc<dyn RelayBackend>, host: PeerId) -> Self {
        let transport = Self::with_role(backend, Role::Client { host: host.clone() });
        lock(&transport.state.connected).insert(host);
        transport
    }

    fn with_role(backend: Arc<dyn RelayBackend>, role: Role) -> Self {
        let state = Arc::new(RelayState {
            role,
            backend: Arc::downgrade(&backend),
            events: SegQueue::new(),
            connected: Mutex::new(HashSet::new()),
        });
        let notify: Arc<dyn RelayNotify> = state.clone();
        backend.set_notify(Arc::downgrade(&notify));
        info!(local = %backend.local_id(), "Relay transport ready");
        Self {
            backend,
            state,
            reassembly: Mutex::new(HashMap::new()),
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    /// Identity of the local relay endpoint.
    pub fn local_id(&self) -> &PeerId {
        self.backend.local_id()
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        lock(&self.state.connected).contains(peer)
    }

    /// Whether packets from `from` are delivered. A client keeps reading what
    /// the host sent before closing; a host drops traffic from peers it closed.
    fn accepts_from(&self, from: &PeerId) -> bool {
        match &self.state.role {
            Role::Client { host } => from == host,
            Role::Host => self.is_connected(from),
        }
    }

    /// Strip the envelope and reassemble fragments. Returns a complete frame
    /// when one is available.
    fn accept_packet(&self, packet: RelayPacket) -> Option<Vec<u8>> {
        let (&kind, body) = packet.data.split_first()?;
        match kind {
            PACKET_WHOLE => Some(body.to_vec()),
            PACKET_FRAGMENT | PACKET_LAST_FRAGMENT => {
                let mut reassembly = lock(&self.reassembly);
                let buffer = reassembly.entry(packet.from.clone()).or_default();
                buffer.extend_from_slice(body);
                if buffer.len() > MAX_FRAME_LEN {
                    warn!(peer = %packet.from, "Dropping oversized fragmented frame");
                    reassembly.remove(&packet.from);
                    return None;
                }
                if kind == PACKET_LAST_FRAGMENT {
                    reassembly.remove(&packet.from)
                } else {
                    None
                }
            }
            other => {
                debug!(peer = %packet.from, kind = other, "Dropping packet with unknown envelope");
                None
            }
        }
    }
}

impl PeerTransport for RelayTransport {
    fn send(
        &self,
        peer: &PeerId,
        frame: &[u8],
        reliability: Reliability,
    ) -> Result<(), TransportError> {
        if !self.is_connected(peer) {
            return Err(TransportError::UnknownPeer(peer.clone()));
        }

        let max = self.backend.max_packet_size();
        let capacity = max.saturating_sub(ENVELOPE_LEN);
        if capacity == 0 {
            return Err(TransportError::PacketTooLarge {
                len: frame.len(),
                max,
            });
        }

        let channel = if reliability.is_reliable() {
            RELIABLE_CHANNEL
        } else {
            UNRELIABLE_CHANNEL
        };

        if frame.len() <= capacity {
            let mut packet = Vec::with_capacity(frame.len() + ENVELOPE_LEN);
            packet.push(PACKET_WHOLE);
            packet.extend_from_slice(frame);
            self.backend
                .send_packet(peer, channel, reliability, &packet)?;
            return Ok(());
        }

        if !reliability.is_reliable() {
            warn!(%peer, len = frame.len(), max, "Dropping oversized unreliable frame");
            return Err(TransportError::PacketTooLarge {
                len: frame.len(),
                max,
            });
        }

        let pieces = frame.chunks(capacity);
        let count = pieces.len();
        debug!(%peer, len = frame.len(), fragments = count, "Fragmenting reliable frame");
        for (index, piece) in pieces.enumerate() {
            let kind = if index + 1 == count {
                PACKET_LAST_FRAGMENT
            } else {
                PACKET_FRAGMENT
            };
            let mut packet = Vec::with_capacity(piece.len() + ENVELOPE_LEN);
            packet.push(kind);
            packet.extend_from_slice(piece);
            self.backend
                .send_packet(peer, channel, reliability, &packet)?;
        }
        Ok(())
    }

    fn poll(&self, max_events: usize) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        let mut budget = max_events;

        while budget > 0 {
            let next = lock(&self.backlog).pop_front();
            let Some(packet) = next.or_else(|| self.backend.receive_packet()) else {
                break;
            };
            budget -= 1;
            if !self.accepts_from(&packet.from) {
                debug!(peer = %packet.from, "Dropping packet from unconnected peer");
                continue;
            }
            let peer = packet.from.clone();
            if let Some(data) = self.accept_packet(packet) {
                events.push(TransportEvent::Frame { peer, data });
            }
        }

        while events.len() < max_events {
            match self.state.events.pop() {
                Some(event) => {
                    if let TransportEvent::Disconnected { peer, .. } = &event {
                        lock(&self.reassembly).remove(peer);
                    }
                    events.push(event);
                }
                None => break,
            }
        }
        events
    }

    fn close(&self, peer: &PeerId, reason: &str) -> Result<(), TransportError> {
        let was_connected = lock(&self.state.connected).remove(peer);
        lock(&self.reassembly).remove(peer);
        if !was_connected {
            return Err(TransportError::UnknownPeer(peer.clone()));
        }
        debug!(%peer, reason, "Closing relay connection");
        {
            let mut backlog = lock(&self.backlog);
            while let Some(packet) = self.backend.receive_packet() {
                backlog.push_back(packet);
            }
            backlog.retain(|packet| &packet.from != peer);
        }
        self.backend.close_connection(peer)?;
        Ok(())
    }

    fn shutdown(&self) -> Result<(), TransportError> {
        let peers: Vec<PeerId> = lock(&self.state.connected).drain().collect();
        lock(&self.reassembly).clear();
        lock(&self.backlog).clear();
        let mut first_error = None;
        for peer in peers {
            if let Err(e) = self.backend.close_connection(&peer) {
                warn!(%peer, "Failed to close relay connection: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn max_packet_size(&self) -> Option<usize> {
        Some(self.backend.max_packet_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_message, encode_message};
    use crate::memory_relay::MemoryRelay;
    use crate::protocol::{ChunkData, Message, PlayerState, Welcome};
    use voxlink_core::ChunkCoord;

    fn pair(relay: &MemoryRelay) -> (RelayTransport, RelayTransport) {
        let host = RelayTransport::host(relay.endpoint("host-puid"));
        let client = RelayTransport::client(relay.endpoint("client-puid"), "host-puid".into());
        (host, client)
    }

    fn sync_complete() -> Vec<u8> {
        encode_message(&Message::WorldSyncComplete).unwrap()
    }

    fn frames(events: Vec<TransportEvent>) -> Vec<Message> {
        events
            .into_iter()
            .filter_map(|event| match event {
                TransportEvent::Frame { data, .. } => decode_message(&data).ok(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_parse_join_info() {
        assert_eq!(parse_join_info("puid=0002abcd"), Some("0002abcd".into()));
        assert_eq!(
            parse_join_info("voxlink://join/0002abcd"),
            Some("0002abcd".into())
        );
        assert_eq!(
            parse_join_info("  voxlink://join/0002abcd/ "),
            Some("0002abcd".into())
        );
        assert_eq!(parse_join_info("puid="), None);
        assert_eq!(parse_join_info("voxlink://host/0002abcd"), None);
        assert_eq!(parse_join_info("voxlink://join/a/b"), None);
        assert_eq!(parse_join_info("0002abcd"), None);
    }

    #[test]
    fn test_connection_request_is_accepted_by_host() {
        let relay = MemoryRelay::new();
        let (host, client) = pair(&relay);

        let hello = encode_message(&Message::Welcome(Welcome { player_id: 0 })).unwrap();
        client
            .send(&"host-puid".into(), &hello, Reliability::ReliableOrdered)
            .expect("send");

        let events = host.poll(16);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], TransportEvent::Frame { peer, .. }
            if peer.as_str() == "client-puid"));
        assert!(matches!(&events[1], TransportEvent::Connected { peer }
            if peer.as_str() == "client-puid"));
    }

    #[test]
    fn test_host_cannot_send_to_unconnected_peer() {
        let relay = MemoryRelay::new();
        let (host, _client) = pair(&relay);
        let err = host
            .send(&"client-puid".into(), b"x", Reliability::ReliableOrdered)
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer(_)));
    }

    #[test]
    fn test_large_reliable_frame_is_fragmented_in_order() {
        let relay = MemoryRelay::with_max_packet_size(64);
        let (host, client) = pair(&relay);
        client
            .send(&"host-puid".into(), &sync_complete(), Reliability::ReliableOrdered)
            .unwrap();
        host.poll(16);

        let noisy: Vec<u16> = (0..4096u32).map(|i| (i * 7919 % 4001) as u16).collect();
        let chunk = Message::ChunkData(ChunkData {
            coord: ChunkCoord::new(1, 0, 1),
            blocks: noisy,
        });
        let encoded = encode_message(&chunk).unwrap();
        assert!(encoded.len() > 64);

        let peer: PeerId = "client-puid".into();
        host.send(&peer, &encoded, Reliability::ReliableOrdered).unwrap();
        host.send(&peer, &sync_complete(), Reliability::ReliableOrdered)
            .unwrap();

        let received = frames(client.poll(usize::MAX));
        assert_eq!(received, vec![chunk, Message::WorldSyncComplete]);
    }

    #[test]
    fn test_large_unreliable_frame_is_rejected() {
        let relay = MemoryRelay::with_max_packet_size(16);
        let (_host, client) = pair(&relay);
        let state = encode_message(&Message::PlayerState(PlayerState {
            player_id: 1,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            yaw: 0.0,
            pitch: 0.0,
        }))
        .unwrap();
        let err = client
            .send(&"host-puid".into(), &state, Reliability::UnreliableUnordered)
            .unwrap_err();
        assert!(matches!(err, TransportError::PacketTooLarge { .. }));
    }

    #[test]
    fn test_close_delivers_queued_frames_before_disconnect() {
        let relay = MemoryRelay::new();
        let (host, client) = pair(&relay);
        client
            .send(&"host-puid".into(), &sync_complete(), Reliability::ReliableOrdered)
            .unwrap();
        host.poll(16);

        let peer: PeerId = "client-puid".into();
        let denied = Message::JoinDenied {
            reason: "full".to_string(),
        };
        host.send(&peer, &encode_message(&denied).unwrap(), Reliability::ReliableOrdered)
            .unwrap();
        host.close(&peer, "declined").unwrap();
        assert!(host.close(&peer, "again").is_err());

        let events = client.poll(16);
        assert_eq!(events.len(), 2);
        assert_eq!(frames(events.clone()), vec![denied]);
        assert!(matches!(&events[1], TransportEvent::Disconnected { peer, .. }
            if peer.as_str() == "host-puid"));
    }

    #[test]
    fn test_local_close_drops_unpolled_packets_across_reconnect() {
        let relay = MemoryRelay::new();
        let (host, client) = pair(&relay);
        let stale = Message::Chat(crate::protocol::Chat {
            from_player_id: 1,
            to_player_id: voxlink_core::ALL_PLAYERS,
            text: "before close".to_string(),
        });
        client
            .send(
                &"host-puid".into(),
                &encode_message(&stale).unwrap(),
                Reliability::ReliableOrdered,
            )
            .unwrap();
        host.close(&"client-puid".into(), "declined").unwrap();
        drop(client);

        let again = RelayTransport::client(relay.endpoint("client-puid"), "host-puid".into());
        again
            .send(
                &"host-puid".into(),
                &encode_message(&Message::WorldSyncComplete).unwrap(),
                Reliability::ReliableOrdered,
            )
            .unwrap();

        let events = host.poll(16);
        assert_eq!(frames(events.clone()), vec![Message::WorldSyncComplete]);
        assert!(events
            .iter()
            .all(|event| !matches!(event, TransportEvent::Disconnected { .. })));
    }

    #[test]
    fn test_poll_is_bounded() {
        let relay = MemoryRelay::new();
        let (host, client) = pair(&relay);
        let frame = encode_message(&Message::WorldSyncComplete).unwrap();
        for _ in 0..10 {
            client
                .send(&"host-puid".into(), &frame, Reliability::ReliableOrdered)
                .unwrap();
        }
        assert_eq!(host.poll(4).len(), 4);
        assert_eq!(host.poll(4).len(), 4);
        // Two frames plus the connection event.
        assert_eq!(host.poll(4).len(), 3);
        assert!(host.poll(4).is_empty());
    }
}
