pub mod block;
pub mod chunk;
pub mod compound;
pub mod entity;
pub mod format;
pub mod position;
pub mod section;

use std::sync::Arc;

use bytes::BytesMut;
use dashmap::{DashMap, DashSet};
use rayon::prelude::*;

use crate::error::{FormatError, PlaceError};
use block::BlockState;
use chunk::{RegionChunk, RegionContext};
use compound::Compound;
use entity::NativeEntity;
use position::{BlockPos, ChunkPos};

/// All loaded region chunks. Thread-safe, lock-sharded by chunk.
///
/// Loading a chunk enables it; unloading disables it. Block edits made
/// through the world mark the chunk dirty for the next save.
pub struct World {
    ctx: Arc<RegionContext>,
    chunks: DashMap<ChunkPos, Arc<RegionChunk>>,
    /// Chunks that have been modified since the last save.
    dirty: DashSet<ChunkPos>,
}

impl World {
    pub fn new(ctx: Arc<RegionContext>) -> Self {
        Self {
            ctx,
            chunks: DashMap::new(),
            dirty: DashSet::new(),
        }
    }

    pub fn context(&self) -> &Arc<RegionContext> {
        &self.ctx
    }

    /// A new, empty, not yet loaded chunk.
    pub fn create_chunk(&self, pos: ChunkPos) -> Arc<RegionChunk> {
        RegionChunk::new(pos, Arc::clone(&self.ctx))
    }

    /// Decode a chunk written by [`RegionChunk::write`]. Not loaded yet.
    pub fn read_chunk(&self, pos: ChunkPos, mut bytes: &[u8]) -> Result<Arc<RegionChunk>, FormatError> {
        RegionChunk::read(pos, Arc::clone(&self.ctx), &mut bytes)
    }

    /// Insert and enable `chunk`. A chunk previously loaded at the same
    /// position is disabled and returned.
    pub fn load_chunk(&self, chunk: Arc<RegionChunk>) -> Option<Arc<RegionChunk>> {
        let previous = self.chunks.insert(chunk.pos(), Arc::clone(&chunk));
        if let Some(previous) = &previous {
            previous.disable();
        }
        chunk.enable();
        previous
    }

    /// Disable and remove the chunk at `pos`, clearing its dirty mark. The
    /// caller is responsible for persisting it first.
    pub fn unload_chunk(&self, pos: ChunkPos) -> Option<Arc<RegionChunk>> {
        let (_, chunk) = self.chunks.remove(&pos)?;
        self.dirty.remove(&pos);
        chunk.disable();
        Some(chunk)
    }

    pub fn get_chunk(&self, pos: ChunkPos) -> Option<Arc<RegionChunk>> {
        self.chunks.get(&pos).map(|c| Arc::clone(&c))
    }

    pub fn has_chunk(&self, pos: ChunkPos) -> bool {
        self.chunks.contains_key(&pos)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_positions(&self) -> Vec<ChunkPos> {
        self.chunks.iter().map(|e| *e.key()).collect()
    }

    /// The loaded chunk at `pos`, loading an empty one if there is none.
    fn chunk_or_create(&self, pos: ChunkPos) -> Arc<RegionChunk> {
        if let Some(chunk) = self.get_chunk(pos) {
            return chunk;
        }
        let created = self.create_chunk(pos);
        let chunk = Arc::clone(self.chunks.entry(pos).or_insert(created).value());
        chunk.enable();
        chunk
    }

    // ── Blocks ──────────────────────────────────────────────────────────────

    /// Read a block. `None` for air, unloaded chunks and heights outside the
    /// world.
    pub fn get_block_state(&self, pos: BlockPos) -> Option<BlockState> {
        if !self.ctx.bounds.contains_y(pos.y) {
            return None;
        }
        self.get_chunk(pos.chunk())?.get_block_state(pos)
    }

    /// Write a block, creating the chunk if needed. Tile entities are left
    /// alone; see [`place_block`](Self::place_block).
    ///
    /// # Panics
    /// If `pos.y` is outside the world's vertical bounds.
    pub fn set_block_state(&self, pos: BlockPos, state: Option<&BlockState>) -> Option<BlockState> {
        let chunk_pos = pos.chunk();
        let previous = self.chunk_or_create(chunk_pos).set_block_state(pos, state);
        self.dirty.insert(chunk_pos);
        previous
    }

    /// Place `state` at an empty position, creating its tile entity (with an
    /// empty record) when the block has one. Returns that entity.
    pub fn place_block(
        &self,
        pos: BlockPos,
        state: &BlockState,
    ) -> Result<Option<Arc<dyn NativeEntity>>, PlaceError> {
        if !self.ctx.host.can_place(pos) {
            return Err(PlaceError::Denied(pos));
        }
        if !self.ctx.bounds.contains_y(pos.y) {
            return Err(PlaceError::OutOfBounds(pos));
        }

        let chunk_pos = pos.chunk();
        let chunk = self.chunk_or_create(chunk_pos);
        if chunk.get_block_state(pos).is_some() {
            return Err(PlaceError::Occupied(pos));
        }

        let entity = match state.block().create_tile_entity(pos, state, Compound::new()) {
            None => None,
            Some(Ok(entity)) => Some(entity),
            Some(Err(cause)) => return Err(PlaceError::Construct { pos, cause }),
        };

        chunk.set_block_state(pos, Some(state));
        if let Some(entity) = &entity {
            chunk.set_native_entity(pos, Some(Arc::clone(entity)));
        }
        self.dirty.insert(chunk_pos);
        tracing::debug!("Placed {:?} at {:?}", state, pos);
        Ok(entity)
    }

    /// Remove the block at `pos` together with its tile entity. Returns the
    /// previous state.
    pub fn break_block(&self, pos: BlockPos) -> Option<BlockState> {
        if !self.ctx.bounds.contains_y(pos.y) {
            return None;
        }
        let chunk_pos = pos.chunk();
        let chunk = self.get_chunk(chunk_pos)?;
        chunk.set_native_entity(pos, None);
        let previous = chunk.set_block_state(pos, None);
        if previous.is_some() {
            self.dirty.insert(chunk_pos);
        }
        previous
    }

    pub fn get_native_entity(&self, pos: BlockPos) -> Option<Arc<dyn NativeEntity>> {
        self.get_chunk(pos.chunk())?.get_native_entity(pos)
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    pub fn mark_dirty(&self, pos: ChunkPos) {
        self.dirty.insert(pos);
    }

    /// Drain and return all chunk positions that have been modified since the
    /// last call. After this returns, the dirty set is empty.
    pub fn take_dirty_chunks(&self) -> Vec<ChunkPos> {
        let dirty: Vec<ChunkPos> = self.dirty.iter().map(|e| *e).collect();
        // A chunk dirtied between collect and remove is simply saved again
        // next time.
        for pos in &dirty {
            self.dirty.remove(pos);
        }
        dirty
    }

    /// Number of chunks currently marked dirty.
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Serialize the loaded chunks among `positions` in parallel. `None`
    /// marks a chunk with nothing to persist. Unloaded positions are skipped.
    pub fn encode_chunks(&self, positions: &[ChunkPos]) -> Vec<(ChunkPos, Option<Vec<u8>>)> {
        let chunks: Vec<Arc<RegionChunk>> = positions.iter().filter_map(|p| self.get_chunk(*p)).collect();
        chunks
            .par_iter()
            .map(|chunk| {
                let mut out = BytesMut::new();
                let bytes = chunk.write(&mut out).then(|| out.to_vec());
                (chunk.pos(), bytes)
            })
            .collect()
    }
}
