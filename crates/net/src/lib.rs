#![warn(missing_docs)]
//! Session networking for voxlink: the wire protocol, frame codec, and the two
//! transport adapters (direct TCP sockets and a peer-to-peer relay).

pub mod chunk_encoding;
pub mod codec;
mod connection;
mod memory_relay;
pub mod protocol;
mod relay;
mod tcp;
mod transport;

pub use codec::{
    decode_message, decode_message_with_volume, encode_message, frame_len, DecodeError,
    EncodeError, FrameBuffer,
};
pub use connection::{MessageLink, SendError};
pub use memory_relay::{MemoryRelay, MemoryRelayEndpoint};
pub use protocol::{
    BlockSet, Chat, ChunkData, GameMode, Hello, ItemPickup, ItemSpawn, Message, MessageType,
    PersistenceRecord, PlayerEntry, PlayerList, PlayerState, Reliability, Teleport, Welcome,
    WorldInfo,
};
pub use relay::{
    parse_join_info, RelayBackend, RelayError, RelayNotify, RelayPacket, RelayTransport,
    RELIABLE_CHANNEL, UNRELIABLE_CHANNEL,
};
pub use tcp::{TcpClientTransport, TcpHostTransport};
pub use transport::{PeerTransport, TransportError, TransportEvent};
