use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::{ReentrantMutex, RwLock};
use rand::Rng;
use tokio::runtime::Handle;

use super::block::{BlockState, BlockStateRegistry};
use super::compound::Compound;
use super::entity::{ForeignEntity, ForeignEntityRegistry, NativeEntity};
use super::format::{self, PresenceMask};
use super::position::{BlockPos, ChunkPos, WorldBounds};
use super::section::{RegionSection, SectionRead};
use crate::error::FormatError;
use crate::host::Host;
use crate::sched::cancel::CancelToken;
use crate::sched::clock::{SyncClock, SyncTaskId};
use crate::sched::ticker;

/// Everything a region chunk needs from its surroundings. Shared by all
/// chunks of a world.
pub struct RegionContext {
    pub registry: Arc<BlockStateRegistry>,
    pub foreign_types: Arc<ForeignEntityRegistry>,
    pub host: Arc<dyn Host>,
    pub clock: Arc<SyncClock>,
    /// Worker pool for async tickers.
    pub runtime: Handle,
    pub bounds: WorldBounds,
}

impl RegionContext {
    /// A context with a fresh [`SyncClock`].
    pub fn new(
        registry: Arc<BlockStateRegistry>,
        foreign_types: Arc<ForeignEntityRegistry>,
        host: Arc<dyn Host>,
        runtime: Handle,
        bounds: WorldBounds,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            foreign_types,
            host,
            clock: Arc::new(SyncClock::new()),
            runtime,
            bounds,
        })
    }
}

/// Whether an entity with `rate` sync ticks per 20 host ticks is due on
/// chunk tick `tick`. Rate 20 ticks every tick, 0 never.
pub fn sync_tick_due(rate: u32, tick: u64) -> bool {
    let rate = rate.min(20);
    if rate == 0 {
        return false;
    }
    match 20 - rate {
        0 => true,
        interval => tick % interval as u64 == 0,
    }
}

/// Structural state, guarded by the chunk lock.
#[derive(Default)]
struct ChunkState {
    foreign_data: HashMap<BlockPos, Compound>,
    native_data: HashMap<BlockPos, Compound>,
    foreign: HashMap<BlockPos, Arc<dyn ForeignEntity>>,
    native: HashMap<BlockPos, Arc<dyn NativeEntity>>,
    /// Present exactly while the chunk is enabled.
    ticking: Option<Ticking>,
}

struct Ticking {
    sync_task: SyncTaskId,
    group: CancelToken,
    tickers: HashMap<BlockPos, CancelToken>,
}

/// An entity whose enable hook ran without a matching disable hook yet.
struct Hooked {
    entity: Arc<dyn NativeEntity>,
    ticker: CancelToken,
}

enum HookChange {
    Enable(Arc<dyn NativeEntity>, CancelToken),
    Disable { entity: Arc<dyn NativeEntity>, unloading: bool },
}

/// One 16-wide column of the world: voxel sections plus the tile entities
/// standing in it.
///
/// Each section has its own lock; the entity maps, persisted records and
/// ticking state share one task-fair lock. Entity hooks are called without
/// holding the chunk lock (model hooks excepted), so hooks may call back into
/// the chunk. Enable and disable hooks are additionally serialized by a
/// reentrant lifecycle lock, so each entity's hooks strictly alternate and
/// the last one always matches the chunk's final state.
pub struct RegionChunk {
    pos: ChunkPos,
    ctx: Arc<RegionContext>,
    sections: Box<[RegionSection]>,
    state: RwLock<ChunkState>,
    enabled: AtomicBool,
    /// Lifecycle lock over the entities whose hooks are enabled.
    hooked: ReentrantMutex<RefCell<HashMap<BlockPos, Hooked>>>,
    hooks_pending: AtomicBool,
    tick: AtomicU64,
}

impl RegionChunk {
    /// An empty chunk.
    pub fn new(pos: ChunkPos, ctx: Arc<RegionContext>) -> Arc<Self> {
        let sections = (0..ctx.bounds.section_count())
            .map(|_| RegionSection::new(Arc::clone(&ctx.registry)))
            .collect();
        Self::from_parts(pos, ctx, sections, HashMap::new(), HashMap::new())
    }

    fn from_parts(
        pos: ChunkPos,
        ctx: Arc<RegionContext>,
        sections: Box<[RegionSection]>,
        foreign_data: HashMap<BlockPos, Compound>,
        native_data: HashMap<BlockPos, Compound>,
    ) -> Arc<Self> {
        let foreign = init_foreign_entities(&ctx, &foreign_data);
        let native = init_native_entities(&ctx, &sections, &native_data);
        Arc::new(Self {
            pos,
            ctx,
            sections,
            state: RwLock::new(ChunkState {
                foreign_data,
                native_data,
                foreign,
                native,
                ticking: None,
            }),
            enabled: AtomicBool::new(false),
            hooked: ReentrantMutex::new(RefCell::new(HashMap::new())),
            hooks_pending: AtomicBool::new(false),
            tick: AtomicU64::new(0),
        })
    }

    pub fn pos(&self) -> ChunkPos {
        self.pos
    }

    /// Whether `pos` lies in this chunk's column and within the world's
    /// vertical bounds.
    pub fn contains(&self, pos: BlockPos) -> bool {
        self.pos.contains(pos) && self.ctx.bounds.contains_y(pos.y)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Number of sync ticks run since creation.
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Indices of sections holding at least one block.
    pub fn non_empty_sections(&self) -> Vec<usize> {
        (0..self.sections.len())
            .filter(|&i| !self.sections[i].is_empty())
            .collect()
    }

    // ── Voxels ──────────────────────────────────────────────────────────────

    /// # Panics
    /// If `y` is outside the world's vertical bounds.
    fn section(&self, y: i32) -> &RegionSection {
        let bounds = &self.ctx.bounds;
        assert!(
            bounds.contains_y(y),
            "Invalid y coordinate {y}, world spans {}..{}",
            bounds.min_y,
            bounds.max_y()
        );
        &self.sections[bounds.section_index(y)]
    }

    fn section_local_y(&self, y: i32) -> u8 {
        ((y - self.ctx.bounds.min_y) & 0xF) as u8
    }

    /// # Panics
    /// If `pos.y` is outside the world's vertical bounds.
    pub fn get_block_state(&self, pos: BlockPos) -> Option<BlockState> {
        debug_assert!(self.pos.contains(pos), "{pos:?} is not in chunk {:?}", self.pos);
        let local = pos.local();
        self.section(pos.y)
            .get(local.x, self.section_local_y(pos.y), local.z)
    }

    /// Set the block state at `pos`, returning the previous one. A present
    /// state is forwarded to the native entity at `pos`, if any.
    ///
    /// # Panics
    /// If `pos.y` is outside the world's vertical bounds.
    pub fn set_block_state(&self, pos: BlockPos, state: Option<&BlockState>) -> Option<BlockState> {
        debug_assert!(self.pos.contains(pos), "{pos:?} is not in chunk {:?}", self.pos);
        let local = pos.local();
        let previous = self
            .section(pos.y)
            .set(local.x, self.section_local_y(pos.y), local.z, state);

        if let Some(state) = state {
            let entity = self.state.read().native.get(&pos).cloned();
            if let Some(entity) = entity {
                entity.set_block_state(state.clone());
            }
        }
        previous
    }

    // ── Entities ────────────────────────────────────────────────────────────

    pub fn get_foreign_entity(&self, pos: BlockPos) -> Option<Arc<dyn ForeignEntity>> {
        self.state.read().foreign.get(&pos).cloned()
    }

    pub fn get_all_foreign_entities(&self) -> Vec<Arc<dyn ForeignEntity>> {
        self.state.read().foreign.values().cloned().collect()
    }

    pub fn get_native_entity(&self, pos: BlockPos) -> Option<Arc<dyn NativeEntity>> {
        self.state.read().native.get(&pos).cloned()
    }

    pub fn get_all_native_entities(&self) -> Vec<Arc<dyn NativeEntity>> {
        self.state.read().native.values().cloned().collect()
    }

    /// The persisted record stored for the native entity at `pos`.
    pub fn get_native_data(&self, pos: BlockPos) -> Option<Compound> {
        self.state.read().native_data.get(&pos).cloned()
    }

    /// Look at the native entity at `pos` and its persisted record under a
    /// single acquisition of the chunk lock.
    pub fn inspect_native<R>(
        &self,
        pos: BlockPos,
        f: impl FnOnce(Option<&Arc<dyn NativeEntity>>, Option<&Compound>) -> R,
    ) -> R {
        let state = self.state.read();
        f(state.native.get(&pos), state.native_data.get(&pos))
    }

    /// Whether this chunk has anything worth persisting.
    pub fn has_data(&self) -> bool {
        let state = self.state.read();
        !state.foreign_data.is_empty()
            || !state.native_data.is_empty()
            || self.sections.iter().any(|s| !s.is_empty())
    }

    /// Insert, replace or (with `None`) remove the foreign entity at `pos`,
    /// keeping its persisted record in sync.
    pub fn set_foreign_entity(
        &self,
        pos: BlockPos,
        entity: Option<Arc<dyn ForeignEntity>>,
    ) -> Option<Arc<dyn ForeignEntity>> {
        let data = entity.as_ref().map(|e| {
            let mut data = e.save_data();
            data.put_str(Compound::TYPE_KEY, e.kind());
            data
        });

        let mut state = self.state.write();
        match (entity, data) {
            (Some(entity), Some(data)) => {
                state.foreign_data.insert(pos, data);
                state.foreign.insert(pos, entity)
            }
            _ => {
                state.foreign_data.remove(&pos);
                state.foreign.remove(&pos)
            }
        }
    }

    /// Insert, replace or (with `None`) remove the native entity at `pos`.
    ///
    /// The entity and its persisted record become visible together. A
    /// replaced entity's async ticker is cancelled before its disable hook
    /// runs. An inserted entity is enabled and starts ticking only if the
    /// chunk is enabled; ticker registration happens under the same
    /// exclusive lock as `enable`/`disable`, so the entity is never enabled
    /// twice.
    pub fn set_native_entity(
        &self,
        pos: BlockPos,
        entity: Option<Arc<dyn NativeEntity>>,
    ) -> Option<Arc<dyn NativeEntity>> {
        let data = entity.as_ref().map(|e| e.save_data());

        let previous = {
            let mut state = self.state.write();
            if let Some(ticking) = state.ticking.as_mut() {
                ticking.tickers.remove(&pos);
            }

            match (entity, data) {
                (Some(entity), Some(data)) => {
                    state.native_data.insert(pos, data);
                    if let Some(ticking) = state.ticking.as_mut() {
                        let token = ticking.group.child();
                        ticking.tickers.insert(pos, token);
                    }
                    state.native.insert(pos, entity)
                }
                _ => {
                    state.native_data.remove(&pos);
                    state.native.remove(&pos)
                }
            }
        };

        self.sync_hooks();
        previous
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Start sync ticking, random ticks and one async ticker per native
    /// entity, then call every entity's enable hook. No-op if already enabled.
    pub fn enable(self: &Arc<Self>) {
        {
            let mut state = self.state.write();
            if self
                .enabled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            let weak = Arc::downgrade(self);
            let sync_task = self.ctx.clock.schedule_repeating(Arc::new(move || {
                if let Some(chunk) = weak.upgrade() {
                    chunk.tick();
                }
            }));

            let group = CancelToken::new();
            let mut tickers = HashMap::with_capacity(state.native.len());
            for (pos, entity) in &state.native {
                tickers.insert(*pos, group.child());

                let block_state = entity.block_state();
                block_state.block().load_model(*pos, &block_state);
            }

            tracing::debug!("Enabled chunk {:?} with {} tile entities", self.pos, tickers.len());
            state.ticking = Some(Ticking {
                sync_task,
                group,
                tickers,
            });
        }

        self.sync_hooks();
    }

    /// Stop all ticking, wait for in-flight async ticks, then call every
    /// entity's disable hook. No-op if already disabled.
    pub fn disable(&self) {
        let ticking = {
            let mut state = self.state.write();
            if self
                .enabled
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            let ticking = state.ticking.take();
            if let Some(ticking) = &ticking {
                self.ctx.clock.cancel(ticking.sync_task);
            }
            for (pos, entity) in &state.native {
                let block_state = entity.block_state();
                block_state.block().unload_model(*pos, &block_state);
            }
            tracing::debug!("Disabled chunk {:?} with {} tile entities", self.pos, state.native.len());
            ticking
        };

        if let Some(ticking) = ticking {
            ticking.group.cancel();
        }

        self.sync_hooks();
    }

    /// Run whatever enable and disable hooks bring the entities in line with
    /// the chunk: an entity is enabled exactly while it is present in an
    /// enabled chunk. Hooks of one chunk run on one thread at a time; a
    /// caller that finds them running elsewhere leaves its change to that
    /// thread, which rechecks before it lets go.
    fn sync_hooks(&self) {
        self.hooks_pending.store(true, Ordering::SeqCst);
        loop {
            let Some(hooked) = self.hooked.try_lock() else {
                return;
            };
            self.hooks_pending.store(false, Ordering::SeqCst);
            loop {
                let changes = self.hook_changes(&hooked.borrow());
                if changes.is_empty() {
                    break;
                }
                for change in changes {
                    self.apply_hook(&hooked, change);
                }
            }
            drop(hooked);
            if !self.hooks_pending.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    /// Disables first, so a replaced entity is released before its
    /// successor is enabled.
    fn hook_changes(&self, hooked: &HashMap<BlockPos, Hooked>) -> Vec<HookChange> {
        let state = self.state.read();
        let enabled = self.is_enabled();
        let mut changes = Vec::new();

        for (pos, h) in hooked {
            match state.native.get(pos) {
                Some(current) if Arc::ptr_eq(current, &h.entity) => {
                    if !enabled {
                        changes.push(HookChange::Disable {
                            entity: Arc::clone(&h.entity),
                            unloading: true,
                        });
                    }
                }
                _ => changes.push(HookChange::Disable {
                    entity: Arc::clone(&h.entity),
                    unloading: false,
                }),
            }
        }

        if let Some(ticking) = state.ticking.as_ref().filter(|_| enabled) {
            for (pos, entity) in &state.native {
                if hooked.contains_key(pos) {
                    continue;
                }
                let token = ticking.tickers.get(pos).cloned().unwrap_or_else(|| ticking.group.child());
                changes.push(HookChange::Enable(Arc::clone(entity), token));
            }
        }
        changes
    }

    fn apply_hook(&self, hooked: &RefCell<HashMap<BlockPos, Hooked>>, change: HookChange) {
        match change {
            HookChange::Disable { entity, unloading } => {
                let pos = entity.pos();
                let h = {
                    let mut hooked = hooked.borrow_mut();
                    if !hooked.get(&pos).is_some_and(|h| Arc::ptr_eq(&h.entity, &entity)) {
                        return;
                    }
                    hooked.remove(&pos)
                };
                let Some(h) = h else {
                    return;
                };
                h.ticker.cancel();
                entity.handle_disable(unloading);
            }
            HookChange::Enable(entity, token) => {
                // Skip enables made stale by an earlier hook of this batch.
                if !self.is_enabled() || !self.is_current(&entity) {
                    return;
                }
                let pos = entity.pos();
                {
                    let mut hooked = hooked.borrow_mut();
                    if hooked.contains_key(&pos) {
                        return;
                    }
                    hooked.insert(
                        pos,
                        Hooked {
                            entity: Arc::clone(&entity),
                            ticker: token.clone(),
                        },
                    );
                }
                entity.handle_enable();
                self.spawn_async_ticker(entity, token);
            }
        }
    }

    fn spawn_async_ticker(&self, entity: Arc<dyn NativeEntity>, token: CancelToken) {
        ticker::spawn_async_ticker(&self.ctx.runtime, entity, token, Arc::clone(&self.ctx.host));
    }

    // ── Ticking ─────────────────────────────────────────────────────────────

    /// One sync tick: due tile entities, then random ticks. Normally driven by
    /// the [`SyncClock`] while enabled; does nothing while disabled.
    pub fn tick(&self) {
        if !self.is_enabled() {
            return;
        }
        let tick = self.tick.fetch_add(1, Ordering::Relaxed) + 1;

        for entity in self.get_all_native_entities() {
            if !sync_tick_due(entity.sync_tick_rate(), tick) {
                continue;
            }
            // Skip entities removed by an earlier entity in this tick.
            if !self.is_current(&entity) {
                continue;
            }
            if let Err(e) = entity.handle_tick() {
                tracing::error!("Tick of tile entity at {:?} failed: {:#}", entity.pos(), e);
            }
        }

        self.random_tick();
    }

    fn is_current(&self, entity: &Arc<dyn NativeEntity>) -> bool {
        self.state
            .read()
            .native
            .get(&entity.pos())
            .is_some_and(|e| Arc::ptr_eq(e, entity))
    }

    /// Sample `random_tick_speed` voxels in every non-empty section. Samples
    /// are taken under each section's read lock; hooks run after release so
    /// they may modify the chunk.
    fn random_tick(&self) {
        let speed = self.ctx.host.random_tick_speed();
        if speed == 0 {
            return;
        }

        let mut rng = rand::thread_rng();
        let mut samples = Vec::new();
        for (index, section) in self.sections.iter().enumerate() {
            let section = section.read();
            if section.is_empty() {
                continue;
            }
            let origin = self.pos.block_origin(self.ctx.bounds.section_base_y(index));
            for _ in 0..speed {
                let (x, y, z) = (rng.gen_range(0..16u8), rng.gen_range(0..16u8), rng.gen_range(0..16u8));
                if let Some(state) = section.get(x, y, z) {
                    samples.push((origin.offset(x as i32, y as i32, z as i32), state));
                }
            }
        }

        for (pos, state) in samples {
            if let Err(e) = state.block().handle_random_tick(pos, &state) {
                tracing::error!("Random tick of {:?} at {:?} failed: {:#}", state, pos, e);
            }
        }
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    /// Serialize this chunk into `out`.
    ///
    /// Returns false and writes nothing if the chunk holds no entity records
    /// and every section is empty; the caller should then drop any stored
    /// copy of this chunk. Entities are asked for their current state first;
    /// the maps and all sections are then encoded under the exclusive chunk
    /// lock plus every section's read lock.
    pub fn write(&self, out: &mut BytesMut) -> bool {
        let (foreign, native) = {
            let state = self.state.read();
            (
                state.foreign.values().cloned().collect::<Vec<_>>(),
                state.native.values().cloned().collect::<Vec<_>>(),
            )
        };
        let foreign_saved: Vec<_> = foreign
            .into_iter()
            .map(|e| {
                let mut data = e.save_data();
                data.put_str(Compound::TYPE_KEY, e.kind());
                (e, data)
            })
            .collect();
        let native_saved: Vec<_> = native.into_iter().map(|e| {
            let data = e.save_data();
            (e, data)
        }).collect();

        let mut state = self.state.write();
        let sections: Vec<SectionRead<'_>> = self.sections.iter().map(RegionSection::read).collect();

        if state.foreign_data.is_empty()
            && state.native_data.is_empty()
            && sections.iter().all(SectionRead::is_empty)
        {
            return false;
        }

        let ChunkState {
            foreign,
            native,
            foreign_data,
            native_data,
            ..
        } = &mut *state;
        for (entity, data) in foreign_saved {
            let pos = entity.pos();
            if foreign.get(&pos).is_some_and(|e| Arc::ptr_eq(e, &entity)) {
                foreign_data.insert(pos, data);
            }
        }
        for (entity, data) in native_saved {
            let pos = entity.pos();
            if native.get(&pos).is_some_and(|e| Arc::ptr_eq(e, &entity)) {
                native_data.insert(pos, data);
            }
        }

        write_entity_map(out, foreign_data);
        write_entity_map(out, native_data);

        let mut mask = PresenceMask::new(sections.len());
        let mut payload = BytesMut::new();
        for (index, section) in sections.iter().enumerate() {
            mask.set(index, section.encode(&mut payload));
        }
        out.put_i32(sections.len() as i32);
        mask.write(out);
        out.put_slice(&payload);
        true
    }

    /// Inverse of [`write`](Self::write). Entities are reconstructed before
    /// the chunk is returned; the chunk starts disabled.
    pub fn read(pos: ChunkPos, ctx: Arc<RegionContext>, buf: &mut impl Buf) -> Result<Arc<Self>, FormatError> {
        let foreign_data = read_entity_map(buf)?;
        let native_data = read_entity_map(buf)?;

        let found = format::read_i32(buf)?;
        let expected = ctx.bounds.section_count();
        if usize::try_from(found).ok() != Some(expected) {
            return Err(FormatError::SectionCount { found, expected });
        }

        let mask = PresenceMask::read(expected, buf)?;
        let mut sections = Vec::with_capacity(expected);
        for index in 0..expected {
            let section = if mask.get(index) {
                RegionSection::decode(Arc::clone(&ctx.registry), buf)?
            } else {
                RegionSection::new(Arc::clone(&ctx.registry))
            };
            sections.push(section);
        }

        Ok(Self::from_parts(
            pos,
            ctx,
            sections.into_boxed_slice(),
            foreign_data,
            native_data,
        ))
    }
}

impl Drop for RegionChunk {
    fn drop(&mut self) {
        if let Some(ticking) = self.state.get_mut().ticking.take() {
            self.ctx.clock.cancel(ticking.sync_task);
            ticking.group.cancel();
        }
    }
}

// ── Initialization ──────────────────────────────────────────────────────────

fn init_foreign_entities(
    ctx: &RegionContext,
    data: &HashMap<BlockPos, Compound>,
) -> HashMap<BlockPos, Arc<dyn ForeignEntity>> {
    let mut entities = HashMap::with_capacity(data.len());
    for (pos, record) in data {
        match ctx.foreign_types.construct(*pos, record.clone()) {
            Ok(entity) => {
                entities.insert(*pos, entity);
            }
            Err(e) => {
                tracing::error!("Failed to initialize foreign entity at {:?}, data={:?}: {:#}", pos, record, e);
            }
        }
    }
    entities
}

fn init_native_entities(
    ctx: &RegionContext,
    sections: &[RegionSection],
    data: &HashMap<BlockPos, Compound>,
) -> HashMap<BlockPos, Arc<dyn NativeEntity>> {
    let mut entities = HashMap::with_capacity(data.len());
    for (pos, record) in data {
        let state = if ctx.bounds.contains_y(pos.y) {
            let local = pos.local();
            sections[ctx.bounds.section_index(pos.y)].get(local.x, ((pos.y - ctx.bounds.min_y) & 0xF) as u8, local.z)
        } else {
            None
        };
        let Some(state) = state else {
            tracing::error!("Failed to initialize tile entity at {:?} because there is no block state", pos);
            continue;
        };

        // The placeholder for removed block types may keep orphaned data.
        if state.block().is_unknown() {
            continue;
        }

        match state.block().create_tile_entity(*pos, &state, record.clone()) {
            None => {
                tracing::error!(
                    "Failed to initialize tile entity at {:?} because {:?} is not a tile entity type",
                    pos,
                    state
                );
            }
            Some(Err(e)) => {
                tracing::error!(
                    "Failed to initialize tile entity at {:?}, state={:?}, data={:?}: {:#}",
                    pos,
                    state,
                    record,
                    e
                );
            }
            Some(Ok(entity)) => {
                entities.insert(*pos, entity);
            }
        }
    }
    entities
}

// ── Entity maps ─────────────────────────────────────────────────────────────

/// `u8` presence flag, then `i32` count and `(x, y, z, len, nbt)` per record.
/// Records are written in position order.
fn write_entity_map(out: &mut BytesMut, map: &HashMap<BlockPos, Compound>) {
    if map.is_empty() {
        out.put_u8(0);
        return;
    }

    let mut records = Vec::with_capacity(map.len());
    for (pos, data) in map {
        match data.to_bytes() {
            Ok(bytes) => records.push((*pos, bytes)),
            Err(e) => tracing::error!("Dropping unserializable record at {:?}: {}", pos, e),
        }
    }
    records.sort_unstable_by_key(|(pos, _)| *pos);

    out.put_u8(1);
    out.put_i32(records.len() as i32);
    for (pos, bytes) in records {
        out.put_i32(pos.x);
        out.put_i32(pos.y);
        out.put_i32(pos.z);
        out.put_i32(bytes.len() as i32);
        out.put_slice(&bytes);
    }
}

fn read_entity_map(buf: &mut impl Buf) -> Result<HashMap<BlockPos, Compound>, FormatError> {
    if format::read_u8(buf)? == 0 {
        return Ok(HashMap::new());
    }

    let count = format::read_len(buf)?;
    let mut map = HashMap::with_capacity(count.min(4096));
    for _ in 0..count {
        let pos = BlockPos::new(format::read_i32(buf)?, format::read_i32(buf)?, format::read_i32(buf)?);
        let len = format::read_len(buf)?;
        let bytes = format::read_bytes(buf, len)?;
        let data = Compound::from_bytes(&bytes).map_err(|source| FormatError::Record { pos, source })?;
        map.insert(pos, data);
    }
    Ok(map)
}
