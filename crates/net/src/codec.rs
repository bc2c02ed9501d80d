//! Message encoding and decoding with framing.
//!
//! Frame format: `[length: u32 LE][message_type: u8][fields]`, where the
//! length covers the type tag and the fields. Integers are fixed-width little
//! endian (`i32`, `u32`, `i64`), floats are IEEE-754 `f32`, strings and byte
//! payloads carry a `u32` length prefix. Decoding never reads past the supplied
//! buffer: any field whose implied length exceeds what remains is reported as
//! [`DecodeError::Truncated`].

use crate::chunk_encoding::{compress_blocks, decompress_blocks};
use crate::protocol::{
    BlockSet, Chat, ChunkData, GameMode, Hello, ItemPickup, ItemSpawn, Message, MessageType,
    PersistenceRecord, PlayerEntry, PlayerList, PlayerState, Teleport, Welcome, WorldInfo,
    MAX_CHUNK_VOLUME, MAX_FRAME_LEN, MAX_PACKET_SIZE, MAX_PERSISTENCE_PAYLOAD, MAX_PLAYER_LIST,
    MAX_STRING_LEN,
};
use thiserror::Error;
use tracing::warn;
use voxlink_core::{ChunkCoord, ChunkDims};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX: usize = 4;

/// Error produced while decoding a frame. The frame is dropped; the connection
/// carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A field claims more bytes than remain in the frame.
    #[error("truncated {field}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Field being read.
        field: &'static str,
        /// Bytes the field needs.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },
    /// Unrecognised message type tag.
    #[error("unknown message type {0}")]
    UnknownType(u8),
    /// A string field is not UTF-8.
    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 {
        /// Offending field.
        field: &'static str,
    },
    /// A length-prefixed field exceeds its limit.
    #[error("{field} length {len} exceeds limit {max}")]
    TooLong {
        /// Offending field.
        field: &'static str,
        /// Declared length.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },
    /// An enum or flag field holds an unknown value.
    #[error("invalid value {value} for {field}")]
    InvalidValue {
        /// Offending field.
        field: &'static str,
        /// Raw value.
        value: u32,
    },
    /// Chunk block count differs from the world's chunk volume.
    #[error("chunk carries {actual} blocks, world expects {expected}")]
    ChunkVolumeMismatch {
        /// Volume declared by the world.
        expected: usize,
        /// Volume declared by the frame.
        actual: usize,
    },
    /// Chunk payload inflated to the wrong size.
    #[error("chunk payload inflated to {actual} bytes, expected {expected}")]
    ChunkLengthMismatch {
        /// Expected byte count.
        expected: usize,
        /// Produced byte count.
        actual: usize,
    },
    /// Chunk payload is not a valid DEFLATE stream.
    #[error("corrupt chunk payload: {0}")]
    Decompress(String),
    /// Bytes left over after the message.
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
    /// Declared frame length exceeds [`MAX_FRAME_LEN`].
    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(usize),
}

/// Error produced while encoding a message.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// A field exceeds the limit the decoder enforces.
    #[error("{field} length {len} exceeds limit {max}")]
    TooLong {
        /// Offending field.
        field: &'static str,
        /// Actual length.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },
    /// Chunk compression failed.
    #[error("failed to compress chunk: {0}")]
    Compress(#[from] std::io::Error),
}

/// Encode a message into a length-prefixed frame.
///
/// Frames above [`MAX_PACKET_SIZE`] are encoded anyway and logged; whether
/// they can be sent is up to the transport.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    let mut w = FrameWriter::new(msg.message_type());

    match msg {
        Message::Hello(hello) => {
            w.string("name", &hello.name)?;
            w.string("ticket", &hello.ticket)?;
        }
        Message::Welcome(welcome) => w.i32(welcome.player_id),
        Message::WorldInfo(info) => {
            w.string("world_name", &info.world_name)?;
            w.u8(info.game_mode as u8);
            w.i32(info.chunk_dims.x);
            w.i32(info.chunk_dims.y);
            w.i32(info.chunk_dims.z);
            w.i32(info.seed);
            w.bool(info.player_collision);
            w.string("world_id", &info.world_id)?;
        }
        Message::PlayerState(state) => {
            w.i32(state.player_id);
            w.f32(state.x);
            w.f32(state.y);
            w.f32(state.z);
            w.f32(state.yaw);
            w.f32(state.pitch);
        }
        Message::BlockSet(set) => {
            w.i32(set.player_id);
            w.i32(set.x);
            w.i32(set.y);
            w.i32(set.z);
            w.u16(set.block_id);
        }
        Message::ItemSpawn(spawn) => {
            w.i32(spawn.drop_id);
            w.i32(spawn.item_id);
            w.i32(spawn.count);
            w.f32(spawn.x);
            w.f32(spawn.y);
            w.f32(spawn.z);
        }
        Message::ItemPickup(pickup) => {
            w.i32(pickup.drop_id);
            w.i32(pickup.player_id);
        }
        Message::Chat(chat) => {
            w.i32(chat.from_player_id);
            w.i32(chat.to_player_id);
            w.string("text", &chat.text)?;
        }
        Message::PlayerList(list) => {
            check_len("players", list.players.len(), MAX_PLAYER_LIST)?;
            w.u32(list.players.len() as u32);
            for entry in &list.players {
                w.i32(entry.player_id);
                w.string("player name", &entry.name)?;
            }
        }
        Message::ChunkData(chunk) => {
            check_len("chunk blocks", chunk.blocks.len(), MAX_CHUNK_VOLUME)?;
            let compressed = compress_blocks(&chunk.blocks)?;
            w.i32(chunk.coord.x);
            w.i32(chunk.coord.y);
            w.i32(chunk.coord.z);
            w.u32(chunk.blocks.len() as u32);
            w.bytes(&compressed);
        }
        Message::WorldSyncComplete => {}
        Message::Teleport(teleport) => {
            w.i32(teleport.player_id);
            w.f32(teleport.x);
            w.f32(teleport.y);
            w.f32(teleport.z);
        }
        Message::PersistenceSnapshot(record) | Message::PersistenceRestore(record) => {
            check_len("payload", record.payload.len(), MAX_PERSISTENCE_PAYLOAD)?;
            w.i32(record.player_id);
            w.string("username", &record.username)?;
            w.i64(record.timestamp_ms);
            w.bytes(&record.payload);
        }
        Message::JoinDenied { reason } | Message::HostShutdown { reason } => {
            w.string("reason", reason)?;
        }
    }

    let frame = w.finish();
    if frame.len() > MAX_PACKET_SIZE {
        warn!(
            message_type = ?msg.message_type(),
            len = frame.len(),
            max = MAX_PACKET_SIZE,
            "Encoded frame exceeds max packet size"
        );
    }
    Ok(frame)
}

/// Decode one frame.
///
/// ChunkData frames are checked against their own declared block count only;
/// use [`decode_message_with_volume`] once the world's chunk volume is known.
pub fn decode_message(data: &[u8]) -> Result<Message, DecodeError> {
    decode_message_with_volume(data, None)
}

/// Decode one frame, rejecting ChunkData whose block count differs from
/// `chunk_volume`.
pub fn decode_message_with_volume(
    data: &[u8],
    chunk_volume: Option<usize>,
) -> Result<Message, DecodeError> {
    let body = frame_body(data)?;
    let mut r = Reader::new(body);

    let tag = r.u8("message type")?;
    let ty = MessageType::try_from(tag).map_err(DecodeError::UnknownType)?;

    let msg = match ty {
        MessageType::Hello => Message::Hello(Hello {
            name: r.string("name")?,
            ticket: r.string("ticket")?,
        }),
        MessageType::Welcome => Message::Welcome(Welcome {
            player_id: r.i32("player_id")?,
        }),
        MessageType::WorldInfo => {
            let world_name = r.string("world_name")?;
            let mode = r.u8("game_mode")?;
            let game_mode = GameMode::from_u8(mode).ok_or(DecodeError::InvalidValue {
                field: "game_mode",
                value: mode as u32,
            })?;
            let chunk_dims = ChunkDims::new(
                r.i32("chunk_dims.x")?,
                r.i32("chunk_dims.y")?,
                r.i32("chunk_dims.z")?,
            );
            Message::WorldInfo(WorldInfo {
                world_name,
                game_mode,
                chunk_dims,
                seed: r.i32("seed")?,
                player_collision: r.bool("player_collision")?,
                world_id: r.string("world_id")?,
            })
        }
        MessageType::PlayerState => Message::PlayerState(PlayerState {
            player_id: r.i32("player_id")?,
            x: r.f32("x")?,
            y: r.f32("y")?,
            z: r.f32("z")?,
            yaw: r.f32("yaw")?,
            pitch: r.f32("pitch")?,
        }),
        MessageType::BlockSet => Message::BlockSet(BlockSet {
            player_id: r.i32("player_id")?,
            x: r.i32("x")?,
            y: r.i32("y")?,
            z: r.i32("z")?,
            block_id: r.u16("block_id")?,
        }),
        MessageType::ItemSpawn => Message::ItemSpawn(ItemSpawn {
            drop_id: r.i32("drop_id")?,
            item_id: r.i32("item_id")?,
            count: r.i32("count")?,
            x: r.f32("x")?,
            y: r.f32("y")?,
            z: r.f32("z")?,
        }),
        MessageType::ItemPickup => Message::ItemPickup(ItemPickup {
            drop_id: r.i32("drop_id")?,
            player_id: r.i32("player_id")?,
        }),
        MessageType::Chat => Message::Chat(Chat {
            from_player_id: r.i32("from_player_id")?,
            to_player_id: r.i32("to_player_id")?,
            text: r.string("text")?,
        }),
        MessageType::PlayerList => {
            let count = r.u32("player count")? as usize;
            if count > MAX_PLAYER_LIST {
                return Err(DecodeError::TooLong {
                    field: "players",
                    len: count,
                    max: MAX_PLAYER_LIST,
                });
            }
            let mut players = Vec::with_capacity(count);
            for _ in 0..count {
                players.push(PlayerEntry {
                    player_id: r.i32("player_id")?,
                    name: r.string("player name")?,
                });
            }
            Message::PlayerList(PlayerList { players })
        }
        MessageType::ChunkData => {
            let coord = ChunkCoord::new(r.i32("chunk x")?, r.i32("chunk y")?, r.i32("chunk z")?);
            let volume = r.u32("block count")? as usize;
            if volume > MAX_CHUNK_VOLUME {
                return Err(DecodeError::TooLong {
                    field: "chunk blocks",
                    len: volume,
                    max: MAX_CHUNK_VOLUME,
                });
            }
            if let Some(expected) = chunk_volume {
                if volume != expected {
                    return Err(DecodeError::ChunkVolumeMismatch {
                        expected,
                        actual: volume,
                    });
                }
            }
            let compressed = r.bytes("chunk payload", usize::MAX)?;
            let blocks = decompress_blocks(compressed, volume)?;
            Message::ChunkData(ChunkData { coord, blocks })
        }
        MessageType::WorldSyncComplete => Message::WorldSyncComplete,
        MessageType::Teleport => Message::Teleport(Teleport {
            player_id: r.i32("player_id")?,
            x: r.f32("x")?,
            y: r.f32("y")?,
            z: r.f32("z")?,
        }),
        MessageType::PersistenceSnapshot => Message::PersistenceSnapshot(read_record(&mut r)?),
        MessageType::PersistenceRestore => Message::PersistenceRestore(read_record(&mut r)?),
        MessageType::JoinDenied => Message::JoinDenied {
            reason: r.string("reason")?,
        },
        MessageType::HostShutdown => Message::HostShutdown {
            reason: r.string("reason")?,
        },
    };

    r.finish()?;
    Ok(msg)
}

/// Total length (prefix included) of the frame at the start of `data`, if the
/// prefix is complete.
pub fn frame_len(data: &[u8]) -> Option<usize> {
    let prefix: [u8; LENGTH_PREFIX] = data.get(..LENGTH_PREFIX)?.try_into().ok()?;
    Some(LENGTH_PREFIX + u32::from_le_bytes(prefix) as usize)
}

fn frame_body(data: &[u8]) -> Result<&[u8], DecodeError> {
    let total = frame_len(data).ok_or(DecodeError::Truncated {
        field: "length prefix",
        needed: LENGTH_PREFIX,
        remaining: data.len(),
    })?;
    let declared = total - LENGTH_PREFIX;
    if declared > MAX_FRAME_LEN {
        return Err(DecodeError::FrameTooLarge(declared));
    }
    if data.len() < total {
        return Err(DecodeError::Truncated {
            field: "frame",
            needed: declared,
            remaining: data.len() - LENGTH_PREFIX,
        });
    }
    if data.len() > total {
        return Err(DecodeError::TrailingBytes(data.len() - total));
    }
    Ok(&data[LENGTH_PREFIX..total])
}

fn read_record(r: &mut Reader<'_>) -> Result<PersistenceRecord, DecodeError> {
    Ok(PersistenceRecord {
        player_id: r.i32("player_id")?,
        username: r.string("username")?,
        timestamp_ms: r.i64("timestamp_ms")?,
        payload: r.bytes("payload", MAX_PERSISTENCE_PAYLOAD)?.to_vec(),
    })
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<(), EncodeError> {
    if len > max {
        return Err(EncodeError::TooLong { field, len, max });
    }
    Ok(())
}

/// Accumulates bytes from a stream and splits them into whole frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, prefix included.
    ///
    /// Returns `Ok(None)` while the frame is still incomplete. A declared
    /// length above [`MAX_FRAME_LEN`] is an error; the stream cannot be
    /// resynchronised after it.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        let Some(total) = frame_len(&self.buf) else {
            return Ok(None);
        };
        if total - LENGTH_PREFIX > MAX_FRAME_LEN {
            return Err(DecodeError::FrameTooLarge(total - LENGTH_PREFIX));
        }
        if self.buf.len() < total {
            return Ok(None);
        }
        Ok(Some(self.buf.drain(..total).collect()))
    }
}

struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    fn new(ty: MessageType) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&[0u8; LENGTH_PREFIX]);
        buf.push(ty as u8);
        Self { buf }
    }

    fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn bytes(&mut self, value: &[u8]) {
        self.u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }

    fn string(&mut self, field: &'static str, value: &str) -> Result<(), EncodeError> {
        check_len(field, value.len(), MAX_STRING_LEN)?;
        self.bytes(value.as_bytes());
        Ok(())
    }

    fn finish(mut self) -> Vec<u8> {
        let len = (self.buf.len() - LENGTH_PREFIX) as u32;
        self.buf[..LENGTH_PREFIX].copy_from_slice(&len.to_le_bytes());
        self.buf
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, field: &'static str, needed: usize) -> Result<&'a [u8], DecodeError> {
        if needed > self.remaining() {
            return Err(DecodeError::Truncated {
                field,
                needed,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], DecodeError> {
        let slice = self.take(field, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.array::<1>(field)?[0])
    }

    fn bool(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        match self.u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidValue {
                field,
                value: other as u32,
            }),
        }
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array(field)?))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array(field)?))
    }

    fn i32(&mut self, field: &'static str) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.array(field)?))
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.array(field)?))
    }

    fn f32(&mut self, field: &'static str) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.array(field)?))
    }

    fn bytes(&mut self, field: &'static str, max: usize) -> Result<&'a [u8], DecodeError> {
        let len = self.u32(field)? as usize;
        if len > max {
            return Err(DecodeError::TooLong { field, len, max });
        }
        self.take(field, len)
    }

    fn string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let raw = self.bytes(field, MAX_STRING_LEN)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8 { field })
    }

    fn finish(&self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(DecodeError::TrailingBytes(extra)),
        }
    }
}
