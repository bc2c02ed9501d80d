//! Protocol message definitions for host/client communication.
//!
//! Every message is a one-byte type tag followed by fixed-width little-endian
//! fields; see [`crate::codec`] for the byte layout.

use serde::{Deserialize, Serialize};
use voxlink_core::{BlockId, ChunkCoord, ChunkDims, PlayerId};

/// Largest packet the relay transport accepts in one send.
///
/// The codec warns about frames above this size; the relay adapter fragments
/// reliable frames and rejects unreliable ones that exceed it.
pub const MAX_PACKET_SIZE: usize = 1170;

/// Largest frame (length prefix excluded) accepted from a byte stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Maximum length of any string field in bytes.
pub const MAX_STRING_LEN: usize = 4096;

/// Maximum entries in a player list.
pub const MAX_PLAYER_LIST: usize = 256;

/// Maximum persistence payload accepted on decode (1 MiB).
pub const MAX_PERSISTENCE_PAYLOAD: usize = 1024 * 1024;

/// Maximum number of blocks in one chunk (for example 32 x 256 x 32).
pub const MAX_CHUNK_VOLUME: usize = 262_144;

/// Delivery guarantee requested from the transport for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reliability {
    /// Delivered once, in order relative to other reliable messages.
    ReliableOrdered,
    /// May be dropped or reordered.
    UnreliableUnordered,
}

impl Reliability {
    /// Check if this tier guarantees delivery.
    pub fn is_reliable(&self) -> bool {
        matches!(self, Reliability::ReliableOrdered)
    }
}

/// One-byte message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client greeting.
    Hello = 1,
    /// Player id assignment.
    Welcome = 2,
    /// World parameters.
    WorldInfo = 3,
    /// Player position update.
    PlayerState = 4,
    /// Block change.
    BlockSet = 5,
    /// Dropped item spawned.
    ItemSpawn = 6,
    /// Dropped item collected.
    ItemPickup = 7,
    /// Chat line.
    Chat = 8,
    /// Connected players.
    PlayerList = 9,
    /// Full chunk contents.
    ChunkData = 10,
    /// End of the initial chunk stream.
    WorldSyncComplete = 11,
    /// Forced reposition.
    Teleport = 12,
    /// Client-side save data pushed to the host.
    PersistenceSnapshot = 13,
    /// Saved data returned to a client.
    PersistenceRestore = 14,
    /// Join refused.
    JoinDenied = 15,
    /// Host is closing the session for this peer.
    HostShutdown = 16,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MessageType::Hello,
            2 => MessageType::Welcome,
            3 => MessageType::WorldInfo,
            4 => MessageType::PlayerState,
            5 => MessageType::BlockSet,
            6 => MessageType::ItemSpawn,
            7 => MessageType::ItemPickup,
            8 => MessageType::Chat,
            9 => MessageType::PlayerList,
            10 => MessageType::ChunkData,
            11 => MessageType::WorldSyncComplete,
            12 => MessageType::Teleport,
            13 => MessageType::PersistenceSnapshot,
            14 => MessageType::PersistenceRestore,
            15 => MessageType::JoinDenied,
            16 => MessageType::HostShutdown,
            other => return Err(other),
        })
    }
}

/// Game mode advertised in [`WorldInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum GameMode {
    /// Survival rules.
    #[default]
    Survival = 0,
    /// Creative rules.
    Creative = 1,
    /// Observer only.
    Spectator = 2,
}

impl GameMode {
    /// Try to convert from the wire representation.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Survival),
            1 => Some(Self::Creative),
            2 => Some(Self::Spectator),
            _ => None,
        }
    }
}

/// Client greeting, resent until the host answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Requested display name.
    pub name: String,
    /// Gate ticket, empty when the client has none.
    pub ticket: String,
}

/// Player id assignment sent on join approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Welcome {
    /// Id assigned by the host.
    pub player_id: PlayerId,
}

/// World parameters, immutable for the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldInfo {
    /// Display name of the world.
    pub world_name: String,
    /// Game mode.
    pub game_mode: GameMode,
    /// Chunk dimensions in blocks.
    pub chunk_dims: ChunkDims,
    /// World generation seed.
    pub seed: i32,
    /// Whether players collide with each other.
    pub player_collision: bool,
    /// Stable world identifier.
    pub world_id: String,
}

impl Default for WorldInfo {
    fn default() -> Self {
        Self {
            world_name: "World".to_string(),
            game_mode: GameMode::Survival,
            chunk_dims: ChunkDims::default(),
            seed: 0,
            player_collision: true,
            world_id: String::new(),
        }
    }
}

/// Player position and orientation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerState {
    /// Player this state belongs to.
    pub player_id: PlayerId,
    /// X position.
    pub x: f32,
    /// Y position.
    pub y: f32,
    /// Z position.
    pub z: f32,
    /// Yaw in degrees.
    pub yaw: f32,
    /// Pitch in degrees.
    pub pitch: f32,
}

/// Block change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSet {
    /// Player that made the change.
    pub player_id: PlayerId,
    /// Block X coordinate.
    pub x: i32,
    /// Block Y coordinate.
    pub y: i32,
    /// Block Z coordinate.
    pub z: i32,
    /// New block id.
    pub block_id: BlockId,
}

/// Dropped item spawned into the world.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ItemSpawn {
    /// Identifier of this dropped item.
    pub drop_id: i32,
    /// Item type.
    pub item_id: i32,
    /// Stack size.
    pub count: i32,
    /// X position.
    pub x: f32,
    /// Y position.
    pub y: f32,
    /// Z position.
    pub z: f32,
}

/// Dropped item collected by a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemPickup {
    /// Identifier of the collected drop.
    pub drop_id: i32,
    /// Collecting player.
    pub player_id: PlayerId,
}

/// Chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    /// Sender.
    pub from_player_id: PlayerId,
    /// Recipient, or [`voxlink_core::ALL_PLAYERS`].
    pub to_player_id: PlayerId,
    /// Message text.
    pub text: String,
}

/// Entry in a [`PlayerList`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerEntry {
    /// Player id.
    pub player_id: PlayerId,
    /// Display name.
    pub name: String,
}

/// Connected players, host first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerList {
    /// Players ordered by id.
    pub players: Vec<PlayerEntry>,
}

/// Full contents of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    /// Chunk coordinate.
    pub coord: ChunkCoord,
    /// Block ids, compressed on the wire.
    pub blocks: Vec<BlockId>,
}

/// Forced reposition of a player.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Teleport {
    /// Player to move.
    pub player_id: PlayerId,
    /// Target X.
    pub x: f32,
    /// Target Y.
    pub y: f32,
    /// Target Z.
    pub z: f32,
}

/// Opaque per-player save data, used by both persistence messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceRecord {
    /// Player the data belongs to.
    pub player_id: PlayerId,
    /// Username the data was saved under.
    pub username: String,
    /// Save time as milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Opaque payload, not interpreted by the session layer.
    pub payload: Vec<u8>,
}

/// Every message understood by the session layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Client greeting.
    Hello(Hello),
    /// Player id assignment.
    Welcome(Welcome),
    /// World parameters.
    WorldInfo(WorldInfo),
    /// Player position update.
    PlayerState(PlayerState),
    /// Block change.
    BlockSet(BlockSet),
    /// Dropped item spawned.
    ItemSpawn(ItemSpawn),
    /// Dropped item collected.
    ItemPickup(ItemPickup),
    /// Chat line.
    Chat(Chat),
    /// Connected players.
    PlayerList(PlayerList),
    /// Full chunk contents.
    ChunkData(ChunkData),
    /// End of the initial chunk stream.
    WorldSyncComplete,
    /// Forced reposition.
    Teleport(Teleport),
    /// Client save data pushed to the host.
    PersistenceSnapshot(PersistenceRecord),
    /// Saved data returned to a client.
    PersistenceRestore(PersistenceRecord),
    /// Join refused.
    JoinDenied {
        /// Reason shown to the player.
        reason: String,
    },
    /// Host closing the session.
    HostShutdown {
        /// Reason shown to the player.
        reason: String,
    },
}

impl Message {
    /// Wire tag for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::Welcome(_) => MessageType::Welcome,
            Message::WorldInfo(_) => MessageType::WorldInfo,
            Message::PlayerState(_) => MessageType::PlayerState,
            Message::BlockSet(_) => MessageType::BlockSet,
            Message::ItemSpawn(_) => MessageType::ItemSpawn,
            Message::ItemPickup(_) => MessageType::ItemPickup,
            Message::Chat(_) => MessageType::Chat,
            Message::PlayerList(_) => MessageType::PlayerList,
            Message::ChunkData(_) => MessageType::ChunkData,
            Message::WorldSyncComplete => MessageType::WorldSyncComplete,
            Message::Teleport(_) => MessageType::Teleport,
            Message::PersistenceSnapshot(_) => MessageType::PersistenceSnapshot,
            Message::PersistenceRestore(_) => MessageType::PersistenceRestore,
            Message::JoinDenied { .. } => MessageType::JoinDenied,
            Message::HostShutdown { .. } => MessageType::HostShutdown,
        }
    }

    /// Reliability tier the transport should use for this message.
    ///
    /// Only high-frequency position updates may be dropped.
    pub fn reliability(&self) -> Reliability {
        match self {
            Message::PlayerState(_) => Reliability::UnreliableUnordered,
            _ => Reliability::ReliableOrdered,
        }
    }
}

macro_rules! impl_from_payload {
    ($($ty:ident),* $(,)?) => {
        $(
            impl From<$ty> for Message {
                fn from(value: $ty) -> Self {
                    Message::$ty(value)
                }
            }
        )*
    };
}

impl_from_payload!(
    Hello,
    Welcome,
    WorldInfo,
    PlayerState,
    BlockSet,
    ItemSpawn,
    ItemPickup,
    Chat,
    PlayerList,
    ChunkData,
    Teleport,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_tags_roundtrip() {
        for tag in 1u8..=16 {
            let ty = MessageType::try_from(tag).expect("known tag");
            assert_eq!(ty as u8, tag);
        }
        assert_eq!(MessageType::try_from(0), Err(0));
        assert_eq!(MessageType::try_from(17), Err(17));
    }

    #[test]
    fn only_player_state_is_unreliable() {
        let state = Message::PlayerState(PlayerState {
            player_id: 1,
            x: 0.0,
            y: 64.0,
            z: 0.0,
            yaw: 0.0,
            pitch: 0.0,
        });
        assert_eq!(state.reliability(), Reliability::UnreliableUnordered);
        assert!(Message::WorldSyncComplete.reliability().is_reliable());
        assert!(Message::HostShutdown {
            reason: String::new()
        }
        .reliability()
        .is_reliable());
    }

    #[test]
    fn game_mode_from_wire() {
        assert_eq!(GameMode::from_u8(0), Some(GameMode::Survival));
        assert_eq!(GameMode::from_u8(1), Some(GameMode::Creative));
        assert_eq!(GameMode::from_u8(2), Some(GameMode::Spectator));
        assert_eq!(GameMode::from_u8(3), None);
    }

    #[test]
    fn test_constants_values() {
        assert_eq!(MAX_PERSISTENCE_PAYLOAD, 1_048_576);
        assert!(MAX_PACKET_SIZE < MAX_FRAME_LEN);
        assert!(MAX_CHUNK_VOLUME >= 16 * 16 * 16);
    }
}
