//! World authority contract.
//!
//! The voxel simulation lives outside the session layer. The host consumes it
//! through [`WorldAuthority`] only: a mutate-and-validate block call and a
//! snapshot of the currently loaded chunks for initial world sync.

use crate::BlockId;
use serde::{Deserialize, Serialize};

/// Chunk coordinate in chunk space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoord {
    /// X coordinate.
    pub x: i32,
    /// Y coordinate.
    pub y: i32,
    /// Z coordinate.
    pub z: i32,
}

impl ChunkCoord {
    /// Create a new chunk coordinate.
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

/// Size of a chunk in blocks along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkDims {
    /// Blocks along X.
    pub x: i32,
    /// Blocks along Y.
    pub y: i32,
    /// Blocks along Z.
    pub z: i32,
}

impl ChunkDims {
    /// Create chunk dimensions.
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Number of blocks in one chunk, or `None` when any axis is non-positive
    /// or the product overflows.
    pub fn volume(&self) -> Option<usize> {
        if self.x <= 0 || self.y <= 0 || self.z <= 0 {
            return None;
        }
        (self.x as usize)
            .checked_mul(self.y as usize)?
            .checked_mul(self.z as usize)
    }
}

impl Default for ChunkDims {
    fn default() -> Self {
        Self::new(16, 16, 16)
    }
}

/// Copy of one loaded chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSnapshot {
    /// Chunk coordinate.
    pub coord: ChunkCoord,
    /// Block ids in x-fastest, then z, then y order.
    pub blocks: Vec<BlockId>,
}

/// Authoritative world consumed by the host session.
///
/// Implementations must be callable from the pump thread while the
/// simulation mutates chunks elsewhere.
pub trait WorldAuthority: Send + Sync {
    /// Apply a block change if it is valid. Returns `false` for a rejected
    /// placement, in which case the world is unchanged.
    fn set_block(&self, x: i32, y: i32, z: i32, id: BlockId) -> bool;

    /// Snapshot every loaded chunk. Must not fail when the chunk set changes
    /// concurrently; chunks loaded mid-call may or may not be included.
    fn loaded_chunks(&self) -> Vec<ChunkSnapshot>;
}
