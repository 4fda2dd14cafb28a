//! The narrow interface through which the engine consults the host game.

use crate::sched::DEFAULT_TICK_RATE;
use crate::world::position::{BlockPos, ChunkPos};

/// A device the host owns, as reported by [`Host::block_entities`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBlockEntity {
    pub pos: BlockPos,
    /// Foreign-entity constructor key, e.g. `"chest"`.
    pub kind: String,
}

pub trait Host: Send + Sync + 'static {
    /// Host ticks per second as configured. 20 at normal speed.
    fn tick_rate(&self) -> f64 {
        DEFAULT_TICK_RATE
    }

    /// Random-tick samples per section per tick.
    fn random_tick_speed(&self) -> u32 {
        3
    }

    /// Allow/deny query for placing a block at `pos`.
    fn can_place(&self, _pos: BlockPos) -> bool {
        true
    }

    /// The host's authoritative list of its own devices in `chunk`.
    fn block_entities(&self, _chunk: ChunkPos) -> Vec<HostBlockEntity> {
        Vec::new()
    }
}
