//! Client session engine.
//!
//! A [`ClientSession`] is one peer's view of a hosted game. The handshake
//! ([`ClientSession::connect`] / [`ClientSession::request_join_approval`])
//! resends Hello until the host answers; afterwards the game loop calls
//! [`ClientSession::poll`] and drains [`ClientQueues`].

use crate::config::ClientConfig;
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, trace, warn};
use voxlink_core::{PeerId, PlayerId, TicketSource};
use voxlink_net::{
    decode_message_with_volume, BlockSet, Chat, ChunkData, Hello, ItemPickup, ItemSpawn, Message,
    MessageLink, PeerTransport, PersistenceRecord, PlayerEntry, PlayerList, PlayerState,
    Teleport, TransportEvent, WorldInfo,
};

const LOCAL_DISCONNECT_REASON: &str = "Left the game";

/// Handshake failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The host identity is empty or malformed.
    #[error("invalid host information")]
    InvalidHostInfo,
    /// The username is empty.
    #[error("username must not be empty")]
    InvalidUsername,
    /// The host refused the join.
    #[error("join denied: {0}")]
    Denied(String),
    /// No Welcome and WorldInfo before the deadline.
    #[error("timed out waiting for the host")]
    Timeout,
    /// The connection closed before the host answered.
    #[error("connection lost during handshake: {0}")]
    Disconnected(String),
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedWorld {
    /// Id assigned by the host.
    pub player_id: PlayerId,
    /// World parameters.
    pub world_info: WorldInfo,
}

/// Outcome of [`ClientSession::request_join_approval`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinApproval {
    /// The host admitted us.
    Approved(JoinedWorld),
    /// The host declined, with its reason.
    Declined(String),
    /// No answer yet; ask again later.
    Pending,
}

/// Initial world stream, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum WorldSyncEvent {
    /// Player id assignment.
    Welcome(PlayerId),
    /// World parameters.
    WorldInfo(WorldInfo),
    /// One chunk.
    Chunk(ChunkData),
    /// Every chunk of the initial stream has arrived.
    SyncComplete,
}

/// Inbound typed queues, drained by the game loop.
#[derive(Default)]
pub struct ClientQueues {
    /// Welcome, WorldInfo, chunks and the sync sentinel, in order.
    pub world_sync: SegQueue<WorldSyncEvent>,
    /// Other players' positions.
    pub player_states: SegQueue<PlayerState>,
    /// Block changes made by other players or the host.
    pub block_sets: SegQueue<BlockSet>,
    /// Item drops.
    pub item_spawns: SegQueue<ItemSpawn>,
    /// Item pickups.
    pub item_pickups: SegQueue<ItemPickup>,
    /// Chat lines.
    pub chats: SegQueue<Chat>,
    /// Player list updates.
    pub player_lists: SegQueue<PlayerList>,
    /// Forced repositions of the local player.
    pub teleports: SegQueue<Teleport>,
    /// Saved data returned by the host.
    pub persistence_restores: SegQueue<PersistenceRecord>,
}

#[derive(Debug, Default)]
struct SessionState {
    host: Option<PeerId>,
    player_id: Option<PlayerId>,
    world_info: Option<WorldInfo>,
    denied: Option<String>,
    players: Vec<PlayerEntry>,
    synced: bool,
}

enum HandshakeStatus {
    Waiting,
    Joined(JoinedWorld),
    Denied(String),
    Lost(String),
}

/// One peer's session with a host.
pub struct ClientSession {
    link: MessageLink,
    config: ClientConfig,
    tickets: Option<Arc<dyn TicketSource>>,
    state: Mutex<SessionState>,
    queues: ClientQueues,
    connected: AtomicBool,
    disconnect_reason: OnceLock<String>,
    reason_delivered: AtomicBool,
}

impl ClientSession {
    /// Create a session over `transport`. Nothing is sent until a handshake
    /// starts.
    pub fn new(transport: Arc<dyn PeerTransport>, config: ClientConfig) -> Self {
        Self {
            link: MessageLink::new(transport),
            config,
            tickets: None,
            state: Mutex::new(SessionState::default()),
            queues: ClientQueues::default(),
            connected: AtomicBool::new(false),
            disconnect_reason: OnceLock::new(),
            reason_delivered: AtomicBool::new(false),
        }
    }

    /// Attach the source of online-gate tickets put into Hello.
    pub fn with_ticket_source(mut self, tickets: Arc<dyn TicketSource>) -> Self {
        self.tickets = Some(tickets);
        self
    }

    /// Join `host` as `username`, resending Hello until the host answers.
    ///
    /// A host that leaves the request pending past `timeout` yields
    /// [`ConnectError::Timeout`].
    #[instrument(skip(self, host), fields(host = %host))]
    pub async fn connect(
        &self,
        host: &PeerId,
        username: &str,
        timeout: Duration,
    ) -> Result<JoinedWorld, ConnectError> {
        match self.handshake(host, username, timeout).await? {
            HandshakeStatus::Joined(joined) => Ok(joined),
            HandshakeStatus::Denied(reason) => Err(ConnectError::Denied(reason)),
            HandshakeStatus::Lost(reason) => Err(ConnectError::Disconnected(reason)),
            HandshakeStatus::Waiting => Err(ConnectError::Timeout),
        }
    }

    /// Ask `host` to admit `username` when the host approves joins manually.
    ///
    /// A timeout is [`JoinApproval::Pending`], not an error: call again later.
    #[instrument(skip(self, host), fields(host = %host))]
    pub async fn request_join_approval(
        &self,
        host: &PeerId,
        username: &str,
        timeout: Duration,
    ) -> Result<JoinApproval, ConnectError> {
        match self.handshake(host, username, timeout).await? {
            HandshakeStatus::Joined(joined) => Ok(JoinApproval::Approved(joined)),
            HandshakeStatus::Denied(reason) => Ok(JoinApproval::Declined(reason)),
            HandshakeStatus::Lost(reason) => Err(ConnectError::Disconnected(reason)),
            HandshakeStatus::Waiting => Ok(JoinApproval::Pending),
        }
    }

    async fn handshake(
        &self,
        host: &PeerId,
        username: &str,
        timeout: Duration,
    ) -> Result<HandshakeStatus, ConnectError> {
        if host.is_blank() {
            return Err(ConnectError::InvalidHostInfo);
        }
        let username = username.trim();
        if username.is_empty() {
            return Err(ConnectError::InvalidUsername);
        }

        {
            let mut state = self.state();
            if state.host.as_ref() != Some(host) {
                *state = SessionState {
                    host: Some(host.clone()),
                    ..SessionState::default()
                };
            } else {
                state.denied = None;
            }
        }
        info!(username, "Joining host");

        let deadline = Instant::now() + timeout;
        let mut next_hello = Instant::now();
        loop {
            let now = Instant::now();
            if now >= next_hello {
                self.send_hello(host, username);
                next_hello = now + self.config.hello_interval();
            }

            self.poll();
            let status = self.handshake_status();
            if !matches!(status, HandshakeStatus::Waiting) {
                return Ok(status);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(?timeout, "No answer from host");
                return Ok(HandshakeStatus::Waiting);
            }
            sleep(self.config.poll_interval().min(deadline - now)).await;
        }
    }

    fn send_hello(&self, host: &PeerId, username: &str) {
        let ticket = self
            .tickets
            .as_ref()
            .map(|source| source.issue_ticket())
            .unwrap_or_default();
        let hello = Message::Hello(Hello {
            name: username.to_string(),
            ticket,
        });
        match self.link.send(host, &hello) {
            Ok(()) => debug!("Sent Hello"),
            Err(e) => warn!("Failed to send Hello: {}", e),
        }
    }

    fn handshake_status(&self) -> HandshakeStatus {
        let state = self.state();
        if let Some(reason) = &state.denied {
            return HandshakeStatus::Denied(reason.clone());
        }
        if let (Some(player_id), Some(world_info)) = (state.player_id, &state.world_info) {
            return HandshakeStatus::Joined(JoinedWorld {
                player_id,
                world_info: world_info.clone(),
            });
        }
        match self.disconnect_reason.get() {
            Some(reason) => HandshakeStatus::Lost(reason.clone()),
            None => HandshakeStatus::Waiting,
        }
    }

    /// Drain at most `max_events_per_poll` transport events into the typed
    /// queues. Never waits for data. Returns the number of events handled.
    pub fn poll(&self) -> usize {
        let events = self.link.poll(self.config.max_events_per_poll);
        let handled = events.len();
        let host = self.state().host.clone();

        for event in events {
            match event {
                TransportEvent::Connected { peer } => debug!(%peer, "Transport connected"),
                TransportEvent::Disconnected { peer, reason } => {
                    if host.as_ref() == Some(&peer) {
                        self.mark_disconnected(reason);
                    }
                }
                TransportEvent::Frame { peer, data } => {
                    if host.as_ref() != Some(&peer) {
                        debug!(%peer, "Ignoring frame from non-host peer");
                        continue;
                    }
                    let volume = self
                        .state()
                        .world_info
                        .as_ref()
                        .and_then(|info| info.chunk_dims.volume());
                    match decode_message_with_volume(&data, volume) {
                        Ok(msg) => self.handle_message(msg),
                        Err(e) => warn!(len = data.len(), "Dropping malformed frame: {}", e),
                    }
                }
            }
        }
        handled
    }

    fn handle_message(&self, msg: Message) {
        match msg {
            Message::Welcome(welcome) => {
                info!(player_id = welcome.player_id, "Welcomed by host");
                self.state().player_id = Some(welcome.player_id);
                self.queues
                    .world_sync
                    .push(WorldSyncEvent::Welcome(welcome.player_id));
            }
            Message::WorldInfo(info) => {
                debug!(world = %info.world_name, seed = info.seed, "World info received");
                let joined = {
                    let mut state = self.state();
                    state.world_info = Some(info.clone());
                    state.player_id.is_some()
                };
                if joined {
                    self.connected.store(true, Ordering::SeqCst);
                }
                self.queues.world_sync.push(WorldSyncEvent::WorldInfo(info));
            }
            Message::ChunkData(chunk) => {
                trace!(coord = ?chunk.coord, "Chunk received");
                self.queues.world_sync.push(WorldSyncEvent::Chunk(chunk));
            }
            Message::WorldSyncComplete => {
                info!("World sync complete");
                self.state().synced = true;
                self.queues.world_sync.push(WorldSyncEvent::SyncComplete);
            }
            Message::PlayerState(state) => self.queues.player_states.push(state),
            Message::BlockSet(set) => self.queues.block_sets.push(set),
            Message::ItemSpawn(spawn) => self.queues.item_spawns.push(spawn),
            Message::ItemPickup(pickup) => self.queues.item_pickups.push(pickup),
            Message::Chat(chat) => self.queues.chats.push(chat),
            Message::PlayerList(list) => {
                debug!(players = list.players.len(), "Player list updated");
                self.state().players = list.players.clone();
                self.queues.player_lists.push(list);
            }
            Message::Teleport(teleport) => self.queues.teleports.push(teleport),
            Message::PersistenceRestore(record) => self.queues.persistence_restores.push(record),
            Message::JoinDenied { reason } => {
                warn!(reason = %reason, "Join denied");
                self.state().denied = Some(reason.clone());
                self.mark_disconnected(reason);
            }
            Message::HostShutdown { reason } => {
                self.mark_disconnected(reason);
            }
            other => warn!(kind = ?other.message_type(), "Unexpected message from host"),
        }
    }

    fn mark_disconnected(&self, reason: String) {
        self.connected.store(false, Ordering::SeqCst);
        match self.disconnect_reason.set(reason) {
            Ok(()) => info!(reason = ?self.disconnect_reason.get(), "Disconnected from host"),
            Err(later) => debug!(reason = %later, "Ignoring repeated disconnect"),
        }
    }

    /// Inbound typed queues.
    pub fn queues(&self) -> &ClientQueues {
        &self.queues
    }

    /// Whether the handshake completed and the host has not gone away.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The disconnect reason, handed out once. Later calls return `None`.
    pub fn take_disconnect_reason(&self) -> Option<String> {
        let reason = self.disconnect_reason.get()?;
        if self.reason_delivered.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(reason.clone())
    }

    /// Player id assigned by the host.
    pub fn player_id(&self) -> Option<PlayerId> {
        self.state().player_id
    }

    /// World parameters received from the host.
    pub fn world_info(&self) -> Option<WorldInfo> {
        self.state().world_info.clone()
    }

    /// Latest player list.
    pub fn players(&self) -> Vec<PlayerEntry> {
        self.state().players.clone()
    }

    /// Whether the initial chunk stream has completed.
    pub fn is_world_synced(&self) -> bool {
        self.state().synced
    }

    /// Send our position (unreliable tier).
    pub fn send_player_state(&self, x: f32, y: f32, z: f32, yaw: f32, pitch: f32) -> bool {
        let Some(player_id) = self.player_id() else {
            return false;
        };
        self.send(Message::PlayerState(PlayerState {
            player_id,
            x,
            y,
            z,
            yaw,
            pitch,
        }))
    }

    /// Ask the host to change a block.
    pub fn send_block_set(&self, x: i32, y: i32, z: i32, block_id: u16) -> bool {
        let Some(player_id) = self.player_id() else {
            return false;
        };
        self.send(Message::BlockSet(BlockSet {
            player_id,
            x,
            y,
            z,
            block_id,
        }))
    }

    /// Report an item drop.
    pub fn send_item_spawn(&self, spawn: ItemSpawn) -> bool {
        self.send(Message::ItemSpawn(spawn))
    }

    /// Report picking up an item drop.
    pub fn send_item_pickup(&self, drop_id: i32) -> bool {
        let Some(player_id) = self.player_id() else {
            return false;
        };
        self.send(Message::ItemPickup(ItemPickup { drop_id, player_id }))
    }

    /// Send a chat line to everyone (`ALL_PLAYERS`) or one player.
    pub fn send_chat(&self, to_player_id: PlayerId, text: impl Into<String>) -> bool {
        let Some(from_player_id) = self.player_id() else {
            return false;
        };
        self.send(Message::Chat(Chat {
            from_player_id,
            to_player_id,
            text: text.into(),
        }))
    }

    /// Push save data to the host.
    pub fn send_persistence_snapshot(
        &self,
        username: impl Into<String>,
        timestamp_ms: i64,
        payload: Vec<u8>,
    ) -> bool {
        let Some(player_id) = self.player_id() else {
            return false;
        };
        self.send(Message::PersistenceSnapshot(PersistenceRecord {
            player_id,
            username: username.into(),
            timestamp_ms,
            payload,
        }))
    }

    /// Fire-and-forget send to the host. Returns whether the frame was queued.
    fn send(&self, msg: Message) -> bool {
        if !self.is_connected() {
            debug!(kind = ?msg.message_type(), "Not connected, dropping outbound message");
            return false;
        }
        let Some(host) = self.state().host.clone() else {
            return false;
        };
        match self.link.send(&host, &msg) {
            Ok(()) => true,
            Err(e) => {
                warn!(kind = ?msg.message_type(), "Send to host failed: {}", e);
                false
            }
        }
    }

    /// Leave the game: close the connection to the host and release the
    /// transport.
    pub fn dispose(&self) {
        let host = self.state().host.clone();
        if let Some(host) = host {
            if let Err(e) = self.link.transport().close(&host, LOCAL_DISCONNECT_REASON) {
                debug!("Closing host connection: {}", e);
            }
        }
        if let Err(e) = self.link.transport().shutdown() {
            warn!("Transport shutdown failed: {}", e);
        }
        self.mark_disconnected(LOCAL_DISCONNECT_REASON.to_string());
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
