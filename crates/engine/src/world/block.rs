use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::compound::Compound;
use super::entity::NativeEntity;
use super::position::BlockPos;

/// Compact block-state identifier used for section storage.
///
/// Ids are assigned by a [`BlockStateRegistry`] at startup and are not stable
/// across runs; persisted sections store block names instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct BlockId(pub u16);

impl BlockId {
    /// No block state. Sections made entirely of AIR are deallocated.
    pub const AIR: BlockId = BlockId(0);

    pub const fn new(id: u16) -> Self {
        Self(id)
    }
}

/// Behavior of a block type that this system owns.
///
/// Tick rates are read from the block, not the tile entity, so every tile
/// entity of a type shares the same cadence.
pub trait Block: Send + Sync + 'static {
    /// Namespaced id, e.g. `"machines:tank"`. Used as the persisted name.
    fn id(&self) -> &str;

    /// The placeholder substituted for blocks whose type no longer exists.
    /// It may carry leftover tile-entity data without being a tile entity.
    fn is_unknown(&self) -> bool {
        false
    }

    /// Builds the tile entity for a block of this type, or `None` if this
    /// block has no tile entity.
    fn create_tile_entity(
        &self,
        _pos: BlockPos,
        _state: &BlockState,
        _data: Compound,
    ) -> Option<anyhow::Result<Arc<dyn NativeEntity>>> {
        None
    }

    /// Synchronous ticks per 20 host ticks: 20 ticks every tick, 0 never.
    fn sync_tick_rate(&self) -> u32 {
        0
    }

    /// Asynchronous ticks per second. 0 disables the async ticker.
    fn async_tick_rate(&self) -> f64 {
        0.0
    }

    fn handle_random_tick(&self, _pos: BlockPos, _state: &BlockState) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called under the owning chunk's lock; must not call back into it.
    fn load_model(&self, _pos: BlockPos, _state: &BlockState) {}

    /// Called under the owning chunk's lock; must not call back into it.
    fn unload_model(&self, _pos: BlockPos, _state: &BlockState) {}
}

/// A registered block state: what occupies a voxel.
#[derive(Clone)]
pub struct BlockState {
    id: BlockId,
    block: Arc<dyn Block>,
}

impl BlockState {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn block(&self) -> &Arc<dyn Block> {
        &self.block
    }

    pub fn name(&self) -> &str {
        self.block.id()
    }
}

impl PartialEq for BlockState {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BlockState {}

impl fmt::Debug for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.block.id(), self.id.0)
    }
}

/// Maps block states to and from compact [`BlockId`]s and persisted names.
///
/// Built once at startup, then shared read-only behind an `Arc`.
pub struct BlockStateRegistry {
    states: Vec<BlockState>,
    by_name: HashMap<String, BlockId>,
    unknown: Option<BlockId>,
}

impl BlockStateRegistry {
    pub fn new() -> Self {
        Self {
            states: Vec::new(),
            by_name: HashMap::new(),
            unknown: None,
        }
    }

    /// Register a block and return its state. Registering the same name
    /// twice returns the existing state.
    ///
    /// # Panics
    /// If more than `u16::MAX - 1` states are registered.
    pub fn register(&mut self, block: Arc<dyn Block>) -> BlockState {
        if let Some(&id) = self.by_name.get(block.id()) {
            return self.states[id.0 as usize - 1].clone();
        }
        let raw = u16::try_from(self.states.len() + 1).expect("block state id space exhausted");
        let state = BlockState {
            id: BlockId(raw),
            block,
        };
        if state.block.is_unknown() {
            self.unknown = Some(state.id);
        }
        self.by_name.insert(state.name().to_owned(), state.id);
        self.states.push(state.clone());
        state
    }

    pub fn get(&self, id: BlockId) -> Option<&BlockState> {
        if id == BlockId::AIR {
            return None;
        }
        self.states.get(id.0 as usize - 1)
    }

    pub fn by_name(&self, name: &str) -> Option<&BlockState> {
        self.by_name.get(name).and_then(|&id| self.get(id))
    }

    /// The unknown placeholder, if one was registered.
    pub fn unknown(&self) -> Option<&BlockState> {
        self.unknown.and_then(|id| self.get(id))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl Default for BlockStateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A block with no behavior beyond its name. Useful for simple decorative
/// blocks and for the unknown placeholder.
pub struct SimpleBlock {
    id: String,
    unknown: bool,
}

impl SimpleBlock {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            unknown: false,
        }
    }

    pub fn unknown(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            unknown: true,
        }
    }
}

impl Block for SimpleBlock {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_unknown(&self) -> bool {
        self.unknown
    }
}
