#![warn(missing_docs)]
//! Core primitives shared across the session layer.

pub mod authority;
pub mod gate;
pub mod peer;

pub use authority::{ChunkCoord, ChunkDims, ChunkSnapshot, WorldAuthority};
pub use gate::{GateVerdict, TicketSource, TicketValidator};
pub use peer::PeerId;

/// Host-assigned player identifier.
///
/// Encoded as a 4-byte signed integer on the wire.
pub type PlayerId = i32;

/// Block identifier.
pub type BlockId = u16;

/// Player id reserved for the hosting player.
pub const HOST_PLAYER_ID: PlayerId = 0;

/// First player id handed out to a joining client.
pub const FIRST_CLIENT_PLAYER_ID: PlayerId = 1;

/// Chat recipient sentinel meaning "every player".
pub const ALL_PLAYERS: PlayerId = -1;
