//! Foreign entities: thin wrappers over host-owned devices.
//!
//! The host decides which devices exist. [`ForeignEntityManager`] keeps the
//! wrappers of every loaded chunk in step with [`Host::block_entities`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use voxtile_engine::host::Host;
use voxtile_engine::network::pool::Pool;
use voxtile_engine::network::{ConnectionType, FluidContainer, FluidHolder, FluidType, NetworkEndPoint, NetworkManager};
use voxtile_engine::world::World;
use voxtile_engine::world::chunk::RegionChunk;
use voxtile_engine::world::compound::Compound;
use voxtile_engine::world::entity::{ForeignEntity, ForeignEntityRegistry};
use voxtile_engine::world::position::BlockPos;

use crate::metrics::Metrics;

pub const CHEST: &str = "chest";
pub const CAULDRON: &str = "cauldron";
pub const CAULDRON_CAPACITY: u64 = 1_000;

/// Register the wrappers this server knows how to build.
pub fn register(registry: &mut ForeignEntityRegistry, network: &Arc<NetworkManager>) {
    registry.register(CHEST, |pos, _data| Ok(Arc::new(Chest { pos }) as Arc<dyn ForeignEntity>));

    let network = Arc::clone(network);
    registry.register(CAULDRON, move |pos, data| {
        Cauldron::new(pos, &data, Arc::clone(&network)).map(|c| c as Arc<dyn ForeignEntity>)
    });
}

// ── Wrappers ────────────────────────────────────────────────────────────────

/// Presence only.
pub struct Chest {
    pos: BlockPos,
}

impl ForeignEntity for Chest {
    fn pos(&self) -> BlockPos {
        self.pos
    }

    fn kind(&self) -> &str {
        CHEST
    }

    fn save_data(&self) -> Compound {
        Compound::new()
    }
}

/// A host cauldron that accepts fluid from networks.
pub struct Cauldron {
    pos: BlockPos,
    container: Arc<FluidContainer>,
    holder: Arc<FluidHolder>,
    network: Arc<NetworkManager>,
    this: Weak<Cauldron>,
}

impl Cauldron {
    fn new(pos: BlockPos, data: &Compound, network: Arc<NetworkManager>) -> anyhow::Result<Arc<Self>> {
        let container = Arc::new(FluidContainer::new(CAULDRON_CAPACITY));
        if let Some(name) = data.get_str("fluid") {
            let ty = FluidType::from_name(name).ok_or_else(|| anyhow::anyhow!("unknown fluid {name}"))?;
            container.set(Some(ty), data.get_i64("amount").unwrap_or(0).max(0) as u64);
        }
        let holder = Arc::new(FluidHolder::uniform(&container, ConnectionType::Insert));
        Ok(Arc::new_cyclic(|this| Self {
            pos,
            container,
            holder,
            network,
            this: this.clone(),
        }))
    }

    pub fn container(&self) -> &Arc<FluidContainer> {
        &self.container
    }
}

impl ForeignEntity for Cauldron {
    fn pos(&self) -> BlockPos {
        self.pos
    }

    fn kind(&self) -> &str {
        CAULDRON
    }

    fn save_data(&self) -> Compound {
        let mut data = Compound::new();
        if let Some(ty) = self.container.fluid_type() {
            data.put_str("fluid", ty.name());
            data.put_i64("amount", self.container.amount() as i64);
        }
        data
    }

    fn handle_initialized(&self) {
        if let Some(this) = self.this.upgrade() {
            self.network.handle_end_point_add(this);
        }
    }

    fn handle_removed(&self, unload: bool) {
        self.network.handle_end_point_remove(self.pos, unload);
    }
}

impl NetworkEndPoint for Cauldron {
    fn pos(&self) -> BlockPos {
        self.pos
    }

    fn fluid_holder(&self) -> Option<Arc<FluidHolder>> {
        Some(Arc::clone(&self.holder))
    }
}

// ── Manager ─────────────────────────────────────────────────────────────────

pub struct ForeignEntityManager {
    world: Arc<World>,
    metrics: Arc<Metrics>,
}

impl ForeignEntityManager {
    pub fn new(world: Arc<World>, metrics: Arc<Metrics>) -> Self {
        Self { world, metrics }
    }

    /// Initialize the wrappers restored with `chunk`, then bring them in
    /// line with the host.
    pub fn handle_chunk_load(&self, chunk: &RegionChunk) {
        for entity in chunk.get_all_foreign_entities() {
            entity.handle_initialized();
        }
        self.refresh_chunk(chunk);
    }

    /// Release every wrapper of `chunk` without touching its records.
    pub fn handle_chunk_unload(&self, chunk: &RegionChunk) {
        for entity in chunk.get_all_foreign_entities() {
            entity.handle_removed(true);
        }
    }

    /// Diff `chunk` against the host's device list. Wrappers the host no
    /// longer lists (or lists with another type) are removed; listed devices
    /// with a registered constructor get a new wrapper. Returns
    /// `(added, removed)`.
    pub fn refresh_chunk(&self, chunk: &RegionChunk) -> (usize, usize) {
        let ctx = self.world.context();
        let listed: HashMap<BlockPos, String> = ctx
            .host
            .block_entities(chunk.pos())
            .into_iter()
            .filter(|e| chunk.contains(e.pos))
            .map(|e| (e.pos, e.kind))
            .collect();

        let mut removed = 0usize;
        for entity in chunk.get_all_foreign_entities() {
            let pos = entity.pos();
            if listed.get(&pos).is_some_and(|kind| kind == entity.kind()) {
                continue;
            }
            chunk.set_foreign_entity(pos, None);
            entity.handle_removed(false);
            removed += 1;
        }

        let mut added = 0usize;
        for (pos, kind) in listed {
            if chunk.get_foreign_entity(pos).is_some() || !ctx.foreign_types.has(&kind) {
                continue;
            }
            match ctx.foreign_types.construct(pos, Compound::with_type(&kind)) {
                Ok(entity) => {
                    chunk.set_foreign_entity(pos, Some(Arc::clone(&entity)));
                    entity.handle_initialized();
                    added += 1;
                }
                Err(e) => tracing::error!("Failed to wrap {} at {:?}: {:#}", kind, pos, e),
            }
        }

        if added > 0 || removed > 0 {
            tracing::debug!("Chunk {:?}: {} foreign entities added, {} removed", chunk.pos(), added, removed);
            self.world.mark_dirty(chunk.pos());
            self.metrics.record_foreign_diff(added, removed);
        }
        (added, removed)
    }

    /// Refresh every loaded chunk.
    pub fn tick(&self) {
        for pos in self.world.chunk_positions() {
            if let Some(chunk) = self.world.get_chunk(pos) {
                self.refresh_chunk(&chunk);
            }
        }
    }
}
