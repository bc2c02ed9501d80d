//! Chunk-map world authority.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;
use voxlink_core::{BlockId, ChunkCoord, ChunkDims, ChunkSnapshot, WorldAuthority};

/// Default highest valid block id.
pub const DEFAULT_MAX_BLOCK_ID: BlockId = 255;

/// World authority backed by a map of fully materialised chunks.
///
/// A block change is valid when its chunk is loaded and the id does not
/// exceed the configured maximum.
#[derive(Debug)]
pub struct MemoryWorld {
    dims: ChunkDims,
    max_block_id: BlockId,
    chunks: RwLock<BTreeMap<ChunkCoord, Vec<BlockId>>>,
}

impl MemoryWorld {
    /// Empty world with the given chunk size.
    pub fn new(dims: ChunkDims) -> Self {
        Self {
            dims,
            max_block_id: DEFAULT_MAX_BLOCK_ID,
            chunks: RwLock::new(BTreeMap::new()),
        }
    }

    /// Override the highest valid block id.
    pub fn with_max_block_id(mut self, max_block_id: BlockId) -> Self {
        self.max_block_id = max_block_id;
        self
    }

    /// Chunk size.
    pub fn dims(&self) -> ChunkDims {
        self.dims
    }

    /// Load a chunk. Returns `false` if `blocks` does not match the chunk volume.
    pub fn insert_chunk(&self, coord: ChunkCoord, blocks: Vec<BlockId>) -> bool {
        if Some(blocks.len()) != self.dims.volume() {
            return false;
        }
        self.write().insert(coord, blocks);
        true
    }

    /// Unload a chunk.
    pub fn remove_chunk(&self, coord: ChunkCoord) -> bool {
        self.write().remove(&coord).is_some()
    }

    /// Number of loaded chunks.
    pub fn chunk_count(&self) -> usize {
        self.read().len()
    }

    /// Block at a world position, if its chunk is loaded.
    pub fn block(&self, x: i32, y: i32, z: i32) -> Option<BlockId> {
        let (coord, index) = self.locate(x, y, z)?;
        self.read().get(&coord).and_then(|blocks| blocks.get(index).copied())
    }

    fn locate(&self, x: i32, y: i32, z: i32) -> Option<(ChunkCoord, usize)> {
        self.dims.volume()?;
        let ChunkDims { x: dx, y: dy, z: dz } = self.dims;
        let coord = ChunkCoord::new(x.div_euclid(dx), y.div_euclid(dy), z.div_euclid(dz));
        let (lx, ly, lz) = (
            x.rem_euclid(dx) as usize,
            y.rem_euclid(dy) as usize,
            z.rem_euclid(dz) as usize,
        );
        let (dx, dz) = (dx as usize, dz as usize);
        Some((coord, lx + lz * dx + ly * dx * dz))
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<ChunkCoord, Vec<BlockId>>> {
        self.chunks.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<ChunkCoord, Vec<BlockId>>> {
        self.chunks.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl WorldAuthority for MemoryWorld {
    fn set_block(&self, x: i32, y: i32, z: i32, id: BlockId) -> bool {
        if id > self.max_block_id {
            debug!(x, y, z, id, "Rejected block: unknown id");
            return false;
        }
        let Some((coord, index)) = self.locate(x, y, z) else {
            return false;
        };
        let mut chunks = self.write();
        match chunks.get_mut(&coord).and_then(|blocks| blocks.get_mut(index)) {
            Some(slot) => {
                *slot = id;
                true
            }
            None => {
                debug!(x, y, z, "Rejected block: chunk not loaded");
                false
            }
        }
    }

    fn loaded_chunks(&self) -> Vec<ChunkSnapshot> {
        self.read()
            .iter()
            .map(|(coord, blocks)| ChunkSnapshot {
                coord: *coord,
                blocks: blocks.clone(),
            })
            .collect()
    }
}

/// World with the given chunks loaded as flat terrain: stone below local
/// height 3, grass at 3, air above.
pub fn flat_world(dims: ChunkDims, coords: &[ChunkCoord]) -> MemoryWorld {
    let world = MemoryWorld::new(dims);
    let Some(volume) = dims.volume() else {
        return world;
    };
    let layer = (dims.x.max(1) as usize) * (dims.z.max(1) as usize);
    let blocks: Vec<BlockId> = (0..volume)
        .map(|i| match i / layer {
            0..=2 => 1,
            3 => 2,
            _ => 0,
        })
        .collect();
    for coord in coords {
        world.insert_chunk(*coord, blocks.clone());
    }
    world
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_world_layout() {
        let world = flat_world(ChunkDims::new(16, 16, 16), &[ChunkCoord::new(0, 0, 0)]);
        assert_eq!(world.chunk_count(), 1);
        assert_eq!(world.block(5, 0, 5), Some(1));
        assert_eq!(world.block(5, 3, 5), Some(2));
        assert_eq!(world.block(5, 4, 5), Some(0));
        assert_eq!(world.block(16, 0, 0), None);
    }

    #[test]
    fn test_set_block_validation() {
        let world = flat_world(ChunkDims::new(16, 16, 16), &[ChunkCoord::new(-1, 0, 0)]);
        assert!(world.set_block(-1, 8, 15, 42));
        assert_eq!(world.block(-1, 8, 15), Some(42));
        assert!(!world.set_block(0, 8, 0, 42), "chunk not loaded");
        assert!(!world.set_block(-1, 8, 15, 256), "id out of range");
        assert_eq!(world.block(-1, 8, 15), Some(42));
    }

    #[test]
    fn test_insert_rejects_wrong_volume() {
        let world = MemoryWorld::new(ChunkDims::new(4, 4, 4));
        assert!(!world.insert_chunk(ChunkCoord::new(0, 0, 0), vec![0; 63]));
        assert!(world.insert_chunk(ChunkCoord::new(0, 0, 0), vec![0; 64]));
        assert_eq!(world.loaded_chunks().len(), 1);
    }
}
