//! Host session engine.
//!
//! [`HostSession`] is the authoritative fan-out point for one hosted game. It
//! owns the client and pending-join registries behind a single mutex, turns
//! inbound transport frames into typed events on lock-free queues, and pushes
//! the host's own events out through the codec.
//!
//! Per-peer lifecycle, as seen by the host:
//!
//! ```text
//! Unknown ──Hello──▶ PendingApproval ──approve──▶ Active ──disconnect/kick──▶ Removed
//!    │                    │  └──decline──▶ connection closed, Unknown
//!    │                    └──disconnect──▶ Unknown
//!    ├──Hello (pre-approved or auto-accept)──▶ Active
//!    └──Hello (gate denies)──▶ connection closed, no state
//! ```
//!
//! The online gate sees only the first Hello of a connection attempt; its
//! verdict holds while the peer stays pending or active. Closing a connection
//! discards whatever the transport still held from it, so a declined peer
//! needs no tombstone.

use crate::config::HostConfig;
use crossbeam_queue::SegQueue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, instrument, trace, warn};
use voxlink_core::{
    GateVerdict, PeerId, PlayerId, TicketValidator, WorldAuthority, ALL_PLAYERS,
    FIRST_CLIENT_PLAYER_ID, HOST_PLAYER_ID,
};
use voxlink_net::{
    decode_message, BlockSet, Chat, ChunkData, Hello, ItemPickup, ItemSpawn, Message,
    MessageLink, PeerTransport, PersistenceRecord, PlayerEntry, PlayerList, PlayerState,
    SendError, Teleport, TransportEvent, Welcome, WorldInfo,
};

const SHUTDOWN_REASON: &str = "The host closed the game";

/// A peer waiting for the hosting player's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    /// Requesting peer.
    pub peer: PeerId,
    /// Name from the peer's latest Hello.
    pub name: String,
}

/// Change in the set of active players.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterEvent {
    /// A peer became an active player.
    Joined {
        /// Assigned player id.
        player_id: PlayerId,
        /// Display name.
        name: String,
    },
    /// An active player left or was kicked.
    Left {
        /// Player id of the departed player.
        player_id: PlayerId,
        /// Why the player left.
        reason: String,
    },
}

/// Inbound typed queues, drained by the game loop.
#[derive(Default)]
pub struct HostQueues {
    /// Position updates from clients.
    pub player_states: SegQueue<PlayerState>,
    /// Block changes accepted by the world authority.
    pub block_sets: SegQueue<BlockSet>,
    /// Item drops spawned by clients.
    pub item_spawns: SegQueue<ItemSpawn>,
    /// Item pickups reported by clients.
    pub item_pickups: SegQueue<ItemPickup>,
    /// Chat addressed to everyone or to the host.
    pub chats: SegQueue<Chat>,
    /// Client save data.
    pub persistence_snapshots: SegQueue<PersistenceRecord>,
    /// New join requests awaiting a decision. Each pending peer appears once.
    pub join_requests: SegQueue<JoinRequest>,
    /// Players joining and leaving.
    pub roster: SegQueue<RosterEvent>,
}

#[derive(Debug)]
struct ClientState {
    player_id: PlayerId,
    name: String,
}

#[derive(Debug)]
struct PendingJoin {
    name: String,
    approval_in_flight: bool,
}

#[derive(Debug)]
struct Registry {
    clients: HashMap<PeerId, ClientState>,
    pending: HashMap<PeerId, PendingJoin>,
    pre_approved: HashSet<PeerId>,
    deferred_approvals: VecDeque<PeerId>,
    next_player_id: PlayerId,
}

impl Registry {
    fn new(pre_approved: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            clients: HashMap::new(),
            pending: HashMap::new(),
            pre_approved: pre_approved.into_iter().collect(),
            deferred_approvals: VecDeque::new(),
            next_player_id: FIRST_CLIENT_PLAYER_ID,
        }
    }

    fn peer_of(&self, player_id: PlayerId) -> Option<PeerId> {
        self.clients
            .iter()
            .find(|(_, client)| client.player_id == player_id)
            .map(|(peer, _)| peer.clone())
    }

    fn peers_except(&self, except: Option<&PeerId>) -> Vec<PeerId> {
        self.clients
            .keys()
            .filter(|peer| Some(*peer) != except)
            .cloned()
            .collect()
    }
}

enum HelloOutcome {
    Resync { player_id: PlayerId, renamed: bool },
    Admit,
    Pending { first: bool },
    Ignored,
}

/// Authoritative host of one multiplayer game.
pub struct HostSession {
    link: MessageLink,
    world: Arc<dyn WorldAuthority>,
    world_info: WorldInfo,
    config: HostConfig,
    gate: Option<Arc<dyn TicketValidator>>,
    registry: Mutex<Registry>,
    queues: HostQueues,
    disposed: AtomicBool,
}

impl HostSession {
    /// Create a host over `transport`, serving `world` described by `world_info`.
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        world: Arc<dyn WorldAuthority>,
        world_info: WorldInfo,
        config: HostConfig,
    ) -> Self {
        info!(
            world = %world_info.world_name,
            require_approval = config.require_approval,
            gate_required = config.gate_required,
            "Hosting session"
        );
        Self {
            link: MessageLink::new(transport),
            world,
            world_info,
            registry: Mutex::new(Registry::new(config.pre_approved.iter().cloned())),
            config,
            gate: None,
            queues: HostQueues::default(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Attach the online-gate validator consulted when the gate is required.
    pub fn with_gate(mut self, gate: Arc<dyn TicketValidator>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Inbound typed queues.
    pub fn queues(&self) -> &HostQueues {
        &self.queues
    }

    /// World parameters sent to joining clients.
    pub fn world_info(&self) -> &WorldInfo {
        &self.world_info
    }

    /// Session configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Number of active clients (the host itself excluded).
    pub fn client_count(&self) -> usize {
        self.registry().clients.len()
    }

    /// Current player list: the host first, then clients by player id.
    pub fn players(&self) -> Vec<PlayerEntry> {
        let registry = self.registry();
        let mut players: Vec<PlayerEntry> = registry
            .clients
            .values()
            .map(|client| PlayerEntry {
                player_id: client.player_id,
                name: client.name.clone(),
            })
            .collect();
        players.sort_by_key(|entry| entry.player_id);
        players.insert(
            0,
            PlayerEntry {
                player_id: HOST_PLAYER_ID,
                name: self.config.host_name.clone(),
            },
        );
        players
    }

    /// Peers waiting for a decision, ordered by identity.
    pub fn pending_join_requests(&self) -> Vec<JoinRequest> {
        let registry = self.registry();
        let mut requests: Vec<JoinRequest> = registry
            .pending
            .iter()
            .map(|(peer, pending)| JoinRequest {
                peer: peer.clone(),
                name: pending.name.clone(),
            })
            .collect();
        requests.sort_by(|a, b| a.peer.cmp(&b.peer));
        requests
    }

    /// Whether [`HostSession::dispose`] has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Pump the session: run deferred approvals, then handle at most
    /// `max_events_per_poll` transport events. Never waits for data.
    ///
    /// Returns the number of transport events handled.
    pub fn poll(&self) -> usize {
        if self.is_disposed() {
            return 0;
        }

        let deferred: Vec<PeerId> = self.registry().deferred_approvals.drain(..).collect();
        for peer in deferred {
            self.run_deferred_approval(&peer);
        }

        let events = self.link.poll(self.config.max_events_per_poll);
        let handled = events.len();
        for event in events {
            match event {
                TransportEvent::Connected { peer } => {
                    debug!(%peer, "Peer connected");
                }
                TransportEvent::Disconnected { peer, reason } => {
                    self.handle_disconnect(&peer, &reason);
                }
                TransportEvent::Frame { peer, data } => match decode_message(&data) {
                    Ok(msg) => self.handle_message(&peer, msg),
                    Err(e) => warn!(%peer, len = data.len(), "Dropping malformed frame: {}", e),
                },
            }
        }
        handled
    }

    /// Mark `peer` as socially pre-approved. A peer already waiting for
    /// approval is promoted on the next poll, exactly once.
    pub fn pre_approve_puid(&self, peer: impl Into<PeerId>) {
        let peer = peer.into();
        let mut guard = self.registry();
        let registry = &mut *guard;
        registry.pre_approved.insert(peer.clone());
        if let Some(pending) = registry.pending.get_mut(&peer) {
            if !pending.approval_in_flight {
                pending.approval_in_flight = true;
                registry.deferred_approvals.push_back(peer.clone());
                info!(%peer, "Pre-approved pending peer, admitting on next poll");
            }
        }
    }

    /// Admit a pending peer. Returns `false` if `peer` has no pending request.
    #[instrument(skip(self, peer), fields(peer = %peer))]
    pub fn approve_join_request(&self, peer: &PeerId) -> bool {
        let pending = self.registry().pending.remove(peer);
        match pending {
            Some(pending) => {
                info!(name = %pending.name, "Join request approved");
                self.admit(peer, pending.name);
                true
            }
            None => {
                debug!("No pending join request");
                false
            }
        }
    }

    /// Refuse a pending peer: send `JoinDenied(reason)` and close its
    /// connection. Returns `false` if `peer` has no pending request.
    #[instrument(skip(self, peer), fields(peer = %peer))]
    pub fn decline_join_request(&self, peer: &PeerId, reason: &str) -> bool {
        if self.registry().pending.remove(peer).is_none() {
            debug!("No pending join request");
            return false;
        }
        info!(reason, "Join request declined");
        let denied = Message::JoinDenied {
            reason: reason.to_string(),
        };
        if let Err(e) = self.link.send_and_close(peer, &denied, reason) {
            warn!("Failed to deliver join denial: {}", e);
        }
        true
    }

    /// Remove an active player: best-effort `HostShutdown(reason)`, close the
    /// connection, then broadcast the new player list.
    #[instrument(skip(self))]
    pub fn kick_player(&self, player_id: PlayerId, reason: &str) -> bool {
        let removed = {
            let mut registry = self.registry();
            registry
                .peer_of(player_id)
                .and_then(|peer| registry.clients.remove(&peer).map(|client| (peer, client)))
        };
        let Some((peer, client)) = removed else {
            debug!("No such player");
            return false;
        };

        info!(%peer, name = %client.name, reason, "Kicking player");
        let shutdown = Message::HostShutdown {
            reason: reason.to_string(),
        };
        if let Err(e) = self.link.send_and_close(&peer, &shutdown, reason) {
            warn!(%peer, "Kick notification failed: {}", e);
        }
        self.queues.roster.push(RosterEvent::Left {
            player_id,
            reason: reason.to_string(),
        });
        self.broadcast_player_list();
        true
    }

    /// Apply a block change made by the host and broadcast it. Returns
    /// `false` if the world authority rejects it.
    pub fn broadcast_block_set(&self, x: i32, y: i32, z: i32, block_id: u16) -> bool {
        if !self.world.set_block(x, y, z, block_id) {
            debug!(x, y, z, block_id, "Host block change rejected");
            return false;
        }
        let set = BlockSet {
            player_id: HOST_PLAYER_ID,
            x,
            y,
            z,
            block_id,
        };
        self.broadcast(None, &Message::BlockSet(set));
        true
    }

    /// Send the host player's position to every client.
    pub fn broadcast_player_state(&self, mut state: PlayerState) {
        state.player_id = HOST_PLAYER_ID;
        self.broadcast(None, &Message::PlayerState(state));
    }

    /// Send a chat line from the host to everyone (`ALL_PLAYERS`) or to one
    /// player. Returns the number of clients it was sent to.
    pub fn send_chat(&self, to_player_id: PlayerId, text: impl Into<String>) -> usize {
        let chat = Chat {
            from_player_id: HOST_PLAYER_ID,
            to_player_id,
            text: text.into(),
        };
        let recipients = {
            let registry = self.registry();
            if to_player_id == ALL_PLAYERS {
                registry.peers_except(None)
            } else {
                registry.peer_of(to_player_id).into_iter().collect()
            }
        };
        self.broadcast_to(&recipients, &Message::Chat(chat))
    }

    /// Announce an item drop spawned by the host.
    pub fn broadcast_item_spawn(&self, spawn: ItemSpawn) {
        self.broadcast(None, &Message::ItemSpawn(spawn));
    }

    /// Announce an item pickup resolved by the host.
    pub fn broadcast_item_pickup(&self, pickup: ItemPickup) {
        self.broadcast(None, &Message::ItemPickup(pickup));
    }

    /// Move a player. Returns `false` if the player is not active or the send
    /// failed.
    pub fn teleport_player(&self, player_id: PlayerId, x: f32, y: f32, z: f32) -> bool {
        let teleport = Teleport { player_id, x, y, z };
        self.send_to_player(player_id, &Message::Teleport(teleport))
    }

    /// Return saved data to the player named in `record`.
    pub fn send_persistence_restore(&self, record: PersistenceRecord) -> bool {
        let player_id = record.player_id;
        self.send_to_player(player_id, &Message::PersistenceRestore(record))
    }

    /// Tell every client the host is leaving, close the transport and clear
    /// the registries. Safe to call more than once.
    #[instrument(skip(self))]
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let peers = {
            let mut registry = self.registry();
            let peers: Vec<PeerId> = registry.clients.keys().cloned().collect();
            registry.clients.clear();
            registry.pending.clear();
            registry.deferred_approvals.clear();
            peers
        };
        info!(clients = peers.len(), "Disposing host session");

        let shutdown = Message::HostShutdown {
            reason: SHUTDOWN_REASON.to_string(),
        };
        if let Err(e) = self.link.broadcast(&peers, &shutdown) {
            warn!("Failed to encode shutdown notice: {}", e);
        }
        if let Err(e) = self.link.transport().shutdown() {
            warn!("Transport shutdown failed: {}", e);
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle_message(&self, peer: &PeerId, msg: Message) {
        if let Message::Hello(hello) = msg {
            self.on_peer_hello(peer, hello);
            return;
        }

        let sender = self.registry().clients.get(peer).map(|c| c.player_id);
        let Some(sender_id) = sender else {
            debug!(%peer, kind = ?msg.message_type(), "Ignoring message from inactive peer");
            return;
        };

        match msg {
            Message::PlayerState(mut state) => {
                state.player_id = sender_id;
                trace!(player_id = sender_id, "Player state");
                self.queues.player_states.push(state);
                self.broadcast(Some(peer), &Message::PlayerState(state));
            }
            Message::BlockSet(mut set) => {
                set.player_id = sender_id;
                if !self.world.set_block(set.x, set.y, set.z, set.block_id) {
                    debug!(
                        player_id = sender_id,
                        x = set.x,
                        y = set.y,
                        z = set.z,
                        block_id = set.block_id,
                        "Dropping rejected block change"
                    );
                    return;
                }
                self.queues.block_sets.push(set);
                self.broadcast(Some(peer), &Message::BlockSet(set));
            }
            Message::ItemSpawn(spawn) => {
                self.queues.item_spawns.push(spawn);
                self.broadcast(Some(peer), &Message::ItemSpawn(spawn));
            }
            Message::ItemPickup(mut pickup) => {
                pickup.player_id = sender_id;
                self.queues.item_pickups.push(pickup);
                self.broadcast(Some(peer), &Message::ItemPickup(pickup));
            }
            Message::Chat(mut chat) => {
                chat.from_player_id = sender_id;
                self.route_chat(peer, chat);
            }
            Message::PersistenceSnapshot(mut record) => {
                record.player_id = sender_id;
                debug!(
                    player_id = sender_id,
                    bytes = record.payload.len(),
                    "Persistence snapshot received"
                );
                self.queues.persistence_snapshots.push(record);
            }
            other => {
                warn!(%peer, kind = ?other.message_type(), "Unexpected message from client");
            }
        }
    }

    #[instrument(skip(self, peer, hello), fields(peer = %peer, name = %hello.name))]
    fn on_peer_hello(&self, peer: &PeerId, hello: Hello) {
        let known = {
            let registry = self.registry();
            registry.clients.contains_key(peer) || registry.pending.contains_key(peer)
        };

        if !known {
            if let GateVerdict::Denied(reason) = self.check_gate(&hello.ticket) {
                warn!(reason = %reason, "Online gate denied peer");
                let denied = Message::JoinDenied {
                    reason: reason.clone(),
                };
                if let Err(e) = self.link.send_and_close(peer, &denied, &reason) {
                    warn!("Failed to deliver gate denial: {}", e);
                }
                return;
            }
        }

        let outcome = {
            let mut guard = self.registry();
            let registry = &mut *guard;
            if let Some(client) = registry.clients.get_mut(peer) {
                let renamed = client.name != hello.name;
                client.name = hello.name.clone();
                HelloOutcome::Resync {
                    player_id: client.player_id,
                    renamed,
                }
            } else if registry.pre_approved.contains(peer) || !self.config.require_approval {
                if registry.pending.get(peer).is_some_and(|p| p.approval_in_flight) {
                    // The deferred promotion will admit it.
                    HelloOutcome::Ignored
                } else {
                    registry.pending.remove(peer);
                    HelloOutcome::Admit
                }
            } else if let Some(pending) = registry.pending.get_mut(peer) {
                pending.name = hello.name.clone();
                HelloOutcome::Pending { first: false }
            } else {
                registry.pending.insert(
                    peer.clone(),
                    PendingJoin {
                        name: hello.name.clone(),
                        approval_in_flight: false,
                    },
                );
                HelloOutcome::Pending { first: true }
            }
        };

        match outcome {
            HelloOutcome::Resync { player_id, renamed } => {
                debug!(player_id, renamed, "Resending world sync to active client");
                if let Err(e) = self.send_world_sync(peer, player_id) {
                    warn!("World resync failed: {}", e);
                }
                if renamed {
                    self.broadcast_player_list();
                }
            }
            HelloOutcome::Admit => {
                self.admit(peer, hello.name);
            }
            HelloOutcome::Pending { first: true } => {
                info!("Join request awaiting approval");
                self.queues.join_requests.push(JoinRequest {
                    peer: peer.clone(),
                    name: hello.name,
                });
            }
            HelloOutcome::Pending { first: false } => {
                trace!("Repeated Hello from pending peer");
            }
            HelloOutcome::Ignored => {}
        }
    }

    fn check_gate(&self, ticket: &str) -> GateVerdict {
        if !self.config.gate_required {
            return GateVerdict::Allowed;
        }
        match &self.gate {
            Some(gate) => gate.validate_peer_ticket(ticket, self.config.gate_timeout()),
            None => GateVerdict::Denied("Online gate unavailable".to_string()),
        }
    }

    fn run_deferred_approval(&self, peer: &PeerId) {
        let pending = {
            let mut registry = self.registry();
            match registry.pending.get(peer) {
                Some(pending) if pending.approval_in_flight => registry.pending.remove(peer),
                _ => None,
            }
        };
        // A manual approval or a disconnect may have resolved it already.
        if let Some(pending) = pending {
            info!(%peer, name = %pending.name, "Admitting pre-approved peer");
            self.admit(peer, pending.name);
        }
    }

    /// Register `peer` as an active client and stream the world to it.
    fn admit(&self, peer: &PeerId, name: String) {
        let player_id = {
            let mut registry = self.registry();
            if let Some(existing) = registry.clients.get(peer) {
                debug!(%peer, player_id = existing.player_id, "Peer already active");
                return;
            }
            let player_id = registry.next_player_id;
            registry.next_player_id += 1;
            registry.clients.insert(
                peer.clone(),
                ClientState {
                    player_id,
                    name: name.clone(),
                },
            );
            player_id
        };

        info!(%peer, player_id, name = %name, "Player joined");
        if let Err(e) = self.send_world_sync(peer, player_id) {
            warn!(%peer, "World sync failed: {}", e);
        }
        self.queues.roster.push(RosterEvent::Joined { player_id, name });
        self.broadcast_player_list();
    }

    /// Welcome, WorldInfo, every loaded chunk, then WorldSyncComplete, all on
    /// the reliable tier so the sentinel arrives last.
    fn send_world_sync(&self, peer: &PeerId, player_id: PlayerId) -> Result<(), SendError> {
        self.link.send(peer, &Message::Welcome(Welcome { player_id }))?;
        self.link
            .send(peer, &Message::WorldInfo(self.world_info.clone()))?;

        let volume = self.world_info.chunk_dims.volume();
        let mut sent = 0usize;
        for chunk in self.world.loaded_chunks() {
            if Some(chunk.blocks.len()) != volume {
                warn!(
                    coord = ?chunk.coord,
                    blocks = chunk.blocks.len(),
                    "Skipping chunk with wrong volume"
                );
                continue;
            }
            let data = ChunkData {
                coord: chunk.coord,
                blocks: chunk.blocks,
            };
            self.link.send(peer, &Message::ChunkData(data))?;
            sent += 1;
        }

        self.link.send(peer, &Message::WorldSyncComplete)?;
        debug!(%peer, player_id, chunks = sent, "World sync sent");
        Ok(())
    }

    fn handle_disconnect(&self, peer: &PeerId, reason: &str) {
        let (client, was_pending) = {
            let mut registry = self.registry();
            let was_pending = registry.pending.remove(peer).is_some();
            (registry.clients.remove(peer), was_pending)
        };

        if let Some(client) = client {
            info!(%peer, player_id = client.player_id, reason, "Player disconnected");
            self.queues.roster.push(RosterEvent::Left {
                player_id: client.player_id,
                reason: reason.to_string(),
            });
            self.broadcast_player_list();
        } else if was_pending {
            info!(%peer, reason, "Pending peer disconnected before a decision");
        } else {
            debug!(%peer, reason, "Peer disconnected");
        }
    }

    fn route_chat(&self, sender: &PeerId, chat: Chat) {
        if chat.to_player_id == ALL_PLAYERS {
            self.queues.chats.push(chat.clone());
            self.broadcast(None, &Message::Chat(chat));
            return;
        }

        if chat.to_player_id == HOST_PLAYER_ID {
            self.queues.chats.push(chat.clone());
        }
        let recipient = self.registry().peer_of(chat.to_player_id);
        let mut peers = vec![sender.clone()];
        if let Some(recipient) = recipient {
            if &recipient != sender {
                peers.push(recipient);
            }
        }
        self.broadcast_to(&peers, &Message::Chat(chat));
    }

    fn broadcast_player_list(&self) {
        let list = PlayerList {
            players: self.players(),
        };
        self.broadcast(None, &Message::PlayerList(list));
    }

    fn broadcast(&self, except: Option<&PeerId>, msg: &Message) -> usize {
        let peers = self.registry().peers_except(except);
        self.broadcast_to(&peers, msg)
    }

    fn broadcast_to(&self, peers: &[PeerId], msg: &Message) -> usize {
        if peers.is_empty() {
            return 0;
        }
        match self.link.broadcast(peers, msg) {
            Ok(delivered) => delivered,
            Err(e) => {
                warn!(kind = ?msg.message_type(), "Failed to encode broadcast: {}", e);
                0
            }
        }
    }

    fn send_to_player(&self, player_id: PlayerId, msg: &Message) -> bool {
        let Some(peer) = self.registry().peer_of(player_id) else {
            debug!(player_id, "No such player");
            return false;
        };
        match self.link.send(&peer, msg) {
            Ok(()) => true,
            Err(e) => {
                warn!(%peer, kind = ?msg.message_type(), "Send failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxlink_core::{ChunkCoord, ChunkDims};
    use voxlink_net::{MemoryRelay, Reliability, RelayTransport};
    use voxlink_testkit::{flat_world, MemoryWorld, StaticGate};

    const HOST: &str = "host-puid";

    struct Harness {
        relay: MemoryRelay,
        host: HostSession,
        world: Arc<MemoryWorld>,
    }

    struct TestPeer {
        id: PeerId,
        link: MessageLink,
    }

    impl TestPeer {
        fn send(&self, msg: Message) {
            self.link.send(&HOST.into(), &msg).expect("send to host");
        }

        fn hello(&self, name: &str) {
            self.send(Message::Hello(Hello {
                name: name.to_string(),
                ticket: String::new(),
            }));
        }

        fn received(&self) -> Vec<Message> {
            self.link
                .poll(usize::MAX)
                .into_iter()
                .filter_map(|event| match event {
                    TransportEvent::Frame { data, .. } => {
                        Some(decode_message(&data).expect("decode"))
                    }
                    _ => None,
                })
                .collect()
        }

        fn events(&self) -> Vec<TransportEvent> {
            self.link.poll(usize::MAX)
        }
    }

    fn world_info() -> WorldInfo {
        WorldInfo {
            world_name: "W".to_string(),
            seed: 42,
            chunk_dims: ChunkDims::new(16, 16, 16),
            ..WorldInfo::default()
        }
    }

    fn harness(config: HostConfig) -> Harness {
        let relay = MemoryRelay::new();
        let transport = Arc::new(RelayTransport::host(relay.endpoint(HOST)));
        let world = Arc::new(flat_world(
            ChunkDims::new(16, 16, 16),
            &[ChunkCoord::new(0, 0, 0), ChunkCoord::new(1, 0, 0)],
        ));
        let host = HostSession::new(transport, world.clone(), world_info(), config);
        Harness { relay, host, world }
    }

    impl Harness {
        fn peer(&self, id: &str) -> TestPeer {
            let transport = RelayTransport::client(self.relay.endpoint(id), HOST.into());
            TestPeer {
                id: id.into(),
                link: MessageLink::new(Arc::new(transport)),
            }
        }

        /// A second host over the same relay endpoint, with `gate` attached.
        fn gated(&self, gate: Arc<StaticGate>) -> HostSession {
            HostSession::new(
                self.host.link.transport().clone(),
                self.world.clone(),
                world_info(),
                self.host.config().clone(),
            )
            .with_gate(gate)
        }

        /// Connect a peer and approve it, discarding the join traffic.
        fn joined(&self, id: &str) -> TestPeer {
            let peer = self.peer(id);
            peer.hello(id);
            self.host.poll();
            assert!(self.host.approve_join_request(&peer.id));
            peer.received();
            peer
        }
    }

    fn welcomes(messages: &[Message]) -> usize {
        messages
            .iter()
            .filter(|m| matches!(m, Message::Welcome(_)))
            .count()
    }

    fn drain<T>(queue: &SegQueue<T>) -> Vec<T> {
        std::iter::from_fn(|| queue.pop()).collect()
    }

    #[test]
    fn test_repeated_hello_creates_one_pending_request() {
        let h = harness(HostConfig::default());
        let alice = h.peer("alice");
        alice.hello("Alice");
        alice.hello("Alice");
        h.host.poll();
        alice.hello("Alice");
        h.host.poll();

        assert_eq!(
            h.host.pending_join_requests(),
            vec![JoinRequest {
                peer: "alice".into(),
                name: "Alice".to_string()
            }]
        );
        assert_eq!(drain(&h.host.queues().join_requests).len(), 1);
        assert!(alice.received().is_empty());
        assert_eq!(h.host.client_count(), 0);
    }

    #[test]
    fn test_approve_streams_world_in_order() {
        let h = harness(HostConfig::default());
        let alice = h.peer("alice");
        alice.hello("Alice");
        h.host.poll();
        assert!(h.host.approve_join_request(&alice.id));

        let messages = alice.received();
        assert_eq!(messages.len(), 6);
        assert_eq!(messages[0], Message::Welcome(Welcome { player_id: 1 }));
        assert_eq!(messages[1], Message::WorldInfo(world_info()));
        assert!(matches!(&messages[2], Message::ChunkData(c)
            if c.coord == ChunkCoord::new(0, 0, 0) && c.blocks.len() == 4096));
        assert!(matches!(&messages[3], Message::ChunkData(c)
            if c.coord == ChunkCoord::new(1, 0, 0)));
        assert_eq!(messages[4], Message::WorldSyncComplete);
        assert_eq!(
            messages[5],
            Message::PlayerList(PlayerList {
                players: vec![
                    PlayerEntry { player_id: 0, name: "Host".to_string() },
                    PlayerEntry { player_id: 1, name: "Alice".to_string() },
                ]
            })
        );

        assert!(!h.host.approve_join_request(&alice.id));
        assert_eq!(
            drain(&h.host.queues().roster),
            vec![RosterEvent::Joined { player_id: 1, name: "Alice".to_string() }]
        );
    }

    #[test]
    fn test_player_ids_are_never_reused() {
        let h = harness(HostConfig::default());
        let alice = h.joined("alice");
        alice.link.transport().close(&HOST.into(), "bye").unwrap();
        h.host.poll();
        assert_eq!(h.host.client_count(), 0);

        let bob = h.peer("bob");
        bob.hello("Bob");
        h.host.poll();
        h.host.approve_join_request(&bob.id);
        assert_eq!(bob.received()[0], Message::Welcome(Welcome { player_id: 2 }));
    }

    #[test]
    fn test_pre_approved_peer_is_admitted_on_hello() {
        let config = HostConfig {
            pre_approved: vec!["alice".into()],
            ..HostConfig::default()
        };
        let h = harness(config);
        let alice = h.peer("alice");
        alice.hello("Alice");
        h.host.poll();

        assert_eq!(welcomes(&alice.received()), 1);
        assert!(h.host.pending_join_requests().is_empty());
        assert!(h.host.queues().join_requests.is_empty());
    }

    #[test]
    fn test_auto_accept_when_approval_not_required() {
        let config = HostConfig {
            require_approval: false,
            ..HostConfig::default()
        };
        let h = harness(config);
        let alice = h.peer("alice");
        alice.hello("Alice");
        h.host.poll();
        assert_eq!(h.host.client_count(), 1);
        assert_eq!(welcomes(&alice.received()), 1);
    }

    #[test]
    fn test_pre_approving_pending_peer_admits_once() {
        let h = harness(HostConfig::default());
        let alice = h.peer("alice");
        alice.hello("Alice");
        h.host.poll();

        h.host.pre_approve_puid("alice");
        h.host.pre_approve_puid("alice");
        assert_eq!(h.host.client_count(), 0, "promotion waits for the next poll");
        h.host.poll();
        h.host.poll();

        let messages = alice.received();
        assert_eq!(welcomes(&messages), 1);
        assert_eq!(
            messages
                .iter()
                .filter(|m| matches!(m, Message::WorldInfo(_)))
                .count(),
            1
        );
        assert_eq!(h.host.client_count(), 1);
        assert!(!h.host.approve_join_request(&alice.id));
    }

    #[test]
    fn test_manual_approval_beats_deferred_promotion() {
        let h = harness(HostConfig::default());
        let alice = h.peer("alice");
        alice.hello("Alice");
        h.host.poll();

        h.host.pre_approve_puid("alice");
        assert!(h.host.approve_join_request(&alice.id));
        h.host.poll();
        h.host.poll();

        assert_eq!(welcomes(&alice.received()), 1);
        assert_eq!(h.host.client_count(), 1);
    }

    #[test]
    fn test_decline_denies_and_closes() {
        let h = harness(HostConfig::default());
        let alice = h.peer("alice");
        alice.hello("Alice");
        h.host.poll();

        assert!(h.host.decline_join_request(&alice.id, "Not today"));
        assert!(!h.host.decline_join_request(&alice.id, "Not today"));

        let events = alice.events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            TransportEvent::Frame { data, .. } => assert_eq!(
                decode_message(data).unwrap(),
                Message::JoinDenied { reason: "Not today".to_string() }
            ),
            other => panic!("expected frame, got {other:?}"),
        }
        assert!(matches!(events[1], TransportEvent::Disconnected { .. }));
        assert!(h.host.pending_join_requests().is_empty());
        assert_eq!(h.host.client_count(), 0);
    }

    #[test]
    fn test_declined_peer_starts_over_on_reconnect() {
        let h = harness(HostConfig::default());
        let alice = h.peer("alice");
        alice.hello("Alice");
        h.host.poll();
        // Still queued on the host when the decline lands.
        alice.hello("Alice");
        assert!(h.host.decline_join_request(&alice.id, "Not today"));
        h.host.poll();
        assert!(h.host.pending_join_requests().is_empty());
        assert_eq!(drain(&h.host.queues().join_requests).len(), 1);

        let again = h.peer("alice");
        again.hello("Alice again");
        h.host.poll();
        assert_eq!(
            drain(&h.host.queues().join_requests),
            vec![JoinRequest {
                peer: "alice".into(),
                name: "Alice again".to_string()
            }]
        );
        assert!(h.host.approve_join_request(&again.id));
        assert_eq!(welcomes(&again.received()), 1);
    }

    #[test]
    fn test_gate_denial_leaves_no_state() {
        let config = HostConfig {
            gate_required: true,
            ..HostConfig::default()
        };
        let h = harness(config);
        let gate = Arc::new(StaticGate::new(["good-ticket"]));
        let host = h.gated(gate.clone());

        let mallory = h.peer("mallory");
        mallory.send(Message::Hello(Hello {
            name: "Mallory".to_string(),
            ticket: "forged".to_string(),
        }));
        host.poll();

        assert_eq!(gate.calls(), 1);
        assert_eq!(
            mallory.received(),
            vec![Message::JoinDenied { reason: "online ticket rejected".to_string() }]
        );
        assert!(host.pending_join_requests().is_empty());
        assert!(host.queues().join_requests.is_empty());
        assert_eq!(host.client_count(), 0);

        let alice = h.peer("alice");
        alice.send(Message::Hello(Hello {
            name: "Alice".to_string(),
            ticket: "good-ticket".to_string(),
        }));
        host.poll();
        assert_eq!(host.pending_join_requests().len(), 1);
    }

    #[test]
    fn test_gate_verdict_holds_while_pending() {
        let config = HostConfig {
            gate_required: true,
            ..HostConfig::default()
        };
        let h = harness(config);
        let gate = Arc::new(StaticGate::new(["good-ticket"]));
        let host = h.gated(gate.clone());

        let alice = h.peer("alice");
        for ticket in ["good-ticket", "expired-ticket", "expired-ticket"] {
            alice.send(Message::Hello(Hello {
                name: "Alice".to_string(),
                ticket: ticket.to_string(),
            }));
            host.poll();
        }

        assert_eq!(gate.calls(), 1);
        assert!(alice.received().is_empty());
        assert_eq!(host.pending_join_requests().len(), 1);

        assert!(host.approve_join_request(&alice.id));
        assert_eq!(welcomes(&alice.received()), 1);
        assert_eq!(host.client_count(), 1);
    }

    #[test]
    fn test_required_gate_without_validator_denies() {
        let config = HostConfig {
            gate_required: true,
            ..HostConfig::default()
        };
        let h = harness(config);
        let alice = h.peer("alice");
        alice.hello("Alice");
        h.host.poll();
        assert!(matches!(&alice.received()[..], [Message::JoinDenied { .. }]));
        assert!(h.host.pending_join_requests().is_empty());
    }

    #[test]
    fn test_rejected_block_reaches_no_queue() {
        let h = harness(HostConfig::default());
        let alice = h.joined("alice");
        let bob = h.joined("bob");
        alice.received();

        // Outside every loaded chunk.
        alice.send(Message::BlockSet(BlockSet {
            player_id: 1,
            x: 500,
            y: 5,
            z: 500,
            block_id: 3,
        }));
        h.host.poll();
        assert!(h.host.queues().block_sets.is_empty());
        assert!(alice.received().is_empty());
        assert!(bob.received().is_empty());

        alice.send(Message::BlockSet(BlockSet {
            player_id: 99,
            x: 4,
            y: 5,
            z: 4,
            block_id: 3,
        }));
        h.host.poll();
        let accepted = BlockSet {
            player_id: 1,
            x: 4,
            y: 5,
            z: 4,
            block_id: 3,
        };
        assert_eq!(drain(&h.host.queues().block_sets), vec![accepted]);
        assert_eq!(h.world.block(4, 5, 4), Some(3));
        assert_eq!(bob.received(), vec![Message::BlockSet(accepted)]);
        assert!(alice.received().is_empty());
    }

    #[test]
    fn test_chat_routing() {
        let h = harness(HostConfig::default());
        let alice = h.joined("alice");
        let bob = h.joined("bob");
        let carol = h.joined("carol");
        alice.received();
        bob.received();

        alice.send(Message::Chat(Chat {
            from_player_id: 1,
            to_player_id: ALL_PLAYERS,
            text: "hi all".to_string(),
        }));
        h.host.poll();
        assert_eq!(drain(&h.host.queues().chats).len(), 1);
        assert_eq!(alice.received().len(), 1);
        assert_eq!(bob.received().len(), 1);
        assert_eq!(carol.received().len(), 1);

        alice.send(Message::Chat(Chat {
            from_player_id: 1,
            to_player_id: 2,
            text: "psst".to_string(),
        }));
        h.host.poll();
        assert!(h.host.queues().chats.is_empty());
        let whisper = Message::Chat(Chat {
            from_player_id: 1,
            to_player_id: 2,
            text: "psst".to_string(),
        });
        assert_eq!(alice.received(), vec![whisper.clone()]);
        assert_eq!(bob.received(), vec![whisper]);
        assert!(carol.received().is_empty());

        alice.send(Message::Chat(Chat {
            from_player_id: 1,
            to_player_id: HOST_PLAYER_ID,
            text: "to host".to_string(),
        }));
        h.host.poll();
        assert_eq!(drain(&h.host.queues().chats).len(), 1);
        assert!(bob.received().is_empty());

        assert_eq!(h.host.send_chat(ALL_PLAYERS, "server notice"), 3);
        assert_eq!(h.host.send_chat(3, "just carol"), 1);
        assert_eq!(carol.received().len(), 2);
    }

    #[test]
    fn test_player_state_forwarded_to_others_unreliably() {
        let h = harness(HostConfig::default());
        let alice = h.joined("alice");
        let bob = h.joined("bob");
        alice.received();

        alice.send(Message::PlayerState(PlayerState {
            player_id: 7,
            x: 1.0,
            y: 65.0,
            z: -3.5,
            yaw: 90.0,
            pitch: 0.0,
        }));
        h.host.poll();

        let state = h.host.queues().player_states.pop().expect("queued");
        assert_eq!(state.player_id, 1);
        assert_eq!(bob.received(), vec![Message::PlayerState(state)]);
        assert!(alice.received().is_empty());
        assert_eq!(Message::PlayerState(state).reliability(), Reliability::UnreliableUnordered);
    }

    #[test]
    fn test_messages_from_unapproved_peer_are_ignored() {
        let h = harness(HostConfig::default());
        let alice = h.peer("alice");
        alice.hello("Alice");
        alice.send(Message::BlockSet(BlockSet {
            player_id: 1,
            x: 1,
            y: 1,
            z: 1,
            block_id: 0,
        }));
        h.host.poll();
        assert!(h.host.queues().block_sets.is_empty());
        assert_eq!(h.world.block(1, 1, 1), Some(1));
    }

    #[test]
    fn test_hello_from_active_client_resyncs_and_renames() {
        let h = harness(HostConfig::default());
        let alice = h.joined("alice");
        alice.hello("Alicia");
        h.host.poll();

        let messages = alice.received();
        assert_eq!(messages[0], Message::Welcome(Welcome { player_id: 1 }));
        assert_eq!(messages[messages.len() - 2], Message::WorldSyncComplete);
        assert!(matches!(
            messages.last(),
            Some(Message::PlayerList(list)) if list.players[1].name == "Alicia"
        ));
        assert_eq!(h.host.client_count(), 1);
    }

    #[test]
    fn test_kick_player() {
        let h = harness(HostConfig::default());
        let alice = h.joined("alice");
        let bob = h.joined("bob");
        alice.received();

        assert!(h.host.kick_player(2, "Be nice"));
        assert!(!h.host.kick_player(2, "Be nice"));

        let events = bob.events();
        assert!(matches!(events.last(), Some(TransportEvent::Disconnected { .. })));
        let shutdown = Message::HostShutdown {
            reason: "Be nice".to_string(),
        };
        assert!(events.iter().any(|e| matches!(e, TransportEvent::Frame { data, .. }
            if decode_message(data).unwrap() == shutdown)));

        assert_eq!(
            alice.received(),
            vec![Message::PlayerList(PlayerList {
                players: vec![
                    PlayerEntry { player_id: 0, name: "Host".to_string() },
                    PlayerEntry { player_id: 1, name: "alice".to_string() },
                ]
            })]
        );
        assert_eq!(h.host.client_count(), 1);
    }

    #[test]
    fn test_disconnect_of_pending_peer_returns_to_unknown() {
        let h = harness(HostConfig::default());
        let alice = h.peer("alice");
        alice.hello("Alice");
        h.host.poll();
        alice.link.transport().shutdown().unwrap();
        h.host.poll();
        assert!(h.host.pending_join_requests().is_empty());
        assert!(!h.host.approve_join_request(&alice.id));
    }

    #[test]
    fn test_host_events_reach_clients() {
        let h = harness(HostConfig::default());
        let alice = h.joined("alice");

        assert!(h.host.broadcast_block_set(0, 15, 0, 9));
        assert!(!h.host.broadcast_block_set(0, 15, 0, 900));
        assert!(h.host.teleport_player(1, 0.5, 80.0, 0.5));
        assert!(!h.host.teleport_player(5, 0.0, 0.0, 0.0));
        assert!(h.host.send_persistence_restore(PersistenceRecord {
            player_id: 1,
            username: "alice".to_string(),
            timestamp_ms: 1_700_000_000_000,
            payload: vec![1, 2, 3],
        }));

        let messages = alice.received();
        assert_eq!(messages.len(), 3);
        assert!(matches!(
            messages[0],
            Message::BlockSet(BlockSet { player_id: 0, block_id: 9, .. })
        ));
        assert!(matches!(messages[1], Message::Teleport(Teleport { player_id: 1, .. })));
        assert!(matches!(messages[2], Message::PersistenceRestore(_)));
    }

    #[test]
    fn test_dispose_notifies_every_client_once() {
        let h = harness(HostConfig::default());
        let alice = h.joined("alice");
        let bob = h.joined("bob");
        alice.received();

        h.host.dispose();
        h.host.dispose();

        for peer in [&alice, &bob] {
            let shutdowns = peer
                .received()
                .into_iter()
                .filter(|m| matches!(m, Message::HostShutdown { .. }))
                .count();
            assert_eq!(shutdowns, 1);
        }
        assert_eq!(h.host.client_count(), 0);
        assert!(h.host.is_disposed());
        assert_eq!(h.host.poll(), 0);
    }
}
