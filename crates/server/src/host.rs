//! A self-contained [`Host`]: the server plays the role of the game that
//! owns the world, so it also keeps the list of host-owned devices
//! (chests, cauldrons) that foreign entities mirror.

use std::collections::HashMap;

use dashmap::{DashMap, DashSet};
use voxtile_engine::host::{Host, HostBlockEntity};
use voxtile_engine::world::position::{BlockPos, ChunkPos};

use crate::config::Config;

pub struct StandaloneHost {
    /// Configured ticks per second, not the measured rate.
    tick_rate: f64,
    random_tick_speed: u32,
    block_entities: DashMap<ChunkPos, HashMap<BlockPos, String>>,
    protected: DashSet<BlockPos>,
}

impl StandaloneHost {
    pub fn new(config: &Config) -> Self {
        Self {
            tick_rate: config.tick_rate,
            random_tick_speed: config.random_tick_speed,
            block_entities: DashMap::new(),
            protected: DashSet::new(),
        }
    }

    /// Register a host-owned device of type `kind` at `pos`.
    pub fn add_block_entity(&self, pos: BlockPos, kind: impl Into<String>) {
        self.block_entities
            .entry(pos.chunk())
            .or_default()
            .insert(pos, kind.into());
    }

    pub fn remove_block_entity(&self, pos: BlockPos) -> Option<String> {
        let mut entities = self.block_entities.get_mut(&pos.chunk())?;
        entities.remove(&pos)
    }

    /// Deny placement at `pos`.
    pub fn protect(&self, pos: BlockPos) {
        self.protected.insert(pos);
    }
}

impl Host for StandaloneHost {
    fn tick_rate(&self) -> f64 {
        self.tick_rate
    }

    fn random_tick_speed(&self) -> u32 {
        self.random_tick_speed
    }

    fn can_place(&self, pos: BlockPos) -> bool {
        !self.protected.contains(&pos)
    }

    fn block_entities(&self, chunk: ChunkPos) -> Vec<HostBlockEntity> {
        let Some(entities) = self.block_entities.get(&chunk) else {
            return Vec::new();
        };
        entities
            .iter()
            .map(|(pos, kind)| HostBlockEntity {
                pos: *pos,
                kind: kind.clone(),
            })
            .collect()
    }
}
