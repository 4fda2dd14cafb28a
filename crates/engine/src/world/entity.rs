//! Tile entities stored in a [`RegionChunk`](super::chunk::RegionChunk).
//!
//! *Native* entities are devices authored by this system: they are ticked on
//! both clocks and persisted. *Foreign* entities wrap host-owned devices
//! (chests, furnaces, ...) so networks can talk to them; they are tracked by
//! presence only and never ticked.

use std::collections::HashMap;
use std::sync::Arc;

use super::block::BlockState;
use super::compound::Compound;
use super::position::BlockPos;

/// A stateful device owned by this system.
///
/// Entities are shared between the sync tick, the async ticker and network
/// code, so all mutable state lives behind interior mutability.
pub trait NativeEntity: Send + Sync + 'static {
    fn pos(&self) -> BlockPos;

    fn block_state(&self) -> BlockState;

    /// Called whenever the voxel under this entity is replaced by another
    /// present state.
    fn set_block_state(&self, state: BlockState);

    /// Serialize the current in-memory state into a persisted record.
    fn save_data(&self) -> Compound;

    fn handle_enable(&self) {}

    /// `unloading` is set when the chunk is being disabled as a whole, and
    /// clear when this entity alone was removed or replaced.
    fn handle_disable(&self, _unloading: bool) {}

    fn handle_tick(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs on the worker pool; never interrupted once started.
    fn handle_async_tick(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn sync_tick_rate(&self) -> u32 {
        self.block_state().block().sync_tick_rate()
    }

    fn async_tick_rate(&self) -> f64 {
        self.block_state().block().async_tick_rate()
    }
}

/// A thin wrapper over a host-owned device.
pub trait ForeignEntity: Send + Sync + 'static {
    fn pos(&self) -> BlockPos;

    /// Constructor key, stored under [`Compound::TYPE_KEY`].
    fn kind(&self) -> &str;

    fn save_data(&self) -> Compound;

    fn handle_initialized(&self) {}

    fn handle_removed(&self, _unload: bool) {}
}

pub type ForeignEntityCtor = Arc<dyn Fn(BlockPos, Compound) -> anyhow::Result<Arc<dyn ForeignEntity>> + Send + Sync>;

/// Type-keyed constructors for foreign entities.
#[derive(Default)]
pub struct ForeignEntityRegistry {
    ctors: HashMap<String, ForeignEntityCtor>,
}

impl ForeignEntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: impl Into<String>,
        ctor: impl Fn(BlockPos, Compound) -> anyhow::Result<Arc<dyn ForeignEntity>> + Send + Sync + 'static,
    ) {
        self.ctors.insert(kind.into(), Arc::new(ctor));
    }

    pub fn has(&self, kind: &str) -> bool {
        self.ctors.contains_key(kind)
    }

    /// Rebuild a foreign entity from its persisted record.
    pub fn construct(&self, pos: BlockPos, data: Compound) -> anyhow::Result<Arc<dyn ForeignEntity>> {
        let kind = data
            .kind()
            .ok_or_else(|| anyhow::anyhow!("record has no type"))?;
        let ctor = self
            .ctors
            .get(kind)
            .ok_or_else(|| anyhow::anyhow!("unknown foreign entity type {kind}"))?;
        ctor(pos, data)
    }
}
