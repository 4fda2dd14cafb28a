//! Region chunk behavior: voxel storage, entity lifecycle on both clocks,
//! persistence and concurrent access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use bytes::BytesMut;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::runtime::{Handle, Runtime};
use voxtile_engine::error::FormatError;
use voxtile_engine::host::Host;
use voxtile_engine::world::block::{Block, BlockState, BlockStateRegistry, SimpleBlock};
use voxtile_engine::world::chunk::{RegionChunk, RegionContext, sync_tick_due};
use voxtile_engine::world::compound::Compound;
use voxtile_engine::world::entity::{ForeignEntity, ForeignEntityRegistry, NativeEntity};
use voxtile_engine::world::position::{BlockPos, ChunkPos, WorldBounds};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct TestHost {
    random_tick_speed: u32,
}

impl Host for TestHost {
    fn random_tick_speed(&self) -> u32 {
        self.random_tick_speed
    }
}

/// A block whose tile entity counts everything that happens to it.
struct CounterBlock {
    id: String,
    sync_rate: u32,
    async_rate: f64,
}

impl Block for CounterBlock {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_tile_entity(
        &self,
        pos: BlockPos,
        state: &BlockState,
        data: Compound,
    ) -> Option<anyhow::Result<Arc<dyn NativeEntity>>> {
        if data.contains("broken") {
            return Some(Err(anyhow::anyhow!("broken record")));
        }
        let counter = Counter::new(pos, state.clone());
        counter.value.store(data.get_i64("value").unwrap_or(0) as u64, Ordering::SeqCst);
        Some(Ok(counter))
    }

    fn sync_tick_rate(&self) -> u32 {
        self.sync_rate
    }

    fn async_tick_rate(&self) -> f64 {
        self.async_rate
    }
}

/// Records every random tick it receives.
struct OreBlock {
    hits: Mutex<Vec<BlockPos>>,
}

impl Block for OreBlock {
    fn id(&self) -> &str {
        "test:ore"
    }

    fn handle_random_tick(&self, pos: BlockPos, _state: &BlockState) -> anyhow::Result<()> {
        self.hits.lock().unwrap().push(pos);
        Ok(())
    }
}

struct Counter {
    pos: BlockPos,
    state: Mutex<BlockState>,
    value: AtomicU64,
    ticks: AtomicU64,
    async_ticks: AtomicU64,
    enables: AtomicU32,
    disables: AtomicU32,
    /// Disables caused by the whole chunk going away.
    unloads: AtomicU32,
}

impl Counter {
    fn new(pos: BlockPos, state: BlockState) -> Arc<Self> {
        Arc::new(Self {
            pos,
            state: Mutex::new(state),
            value: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            async_ticks: AtomicU64::new(0),
            enables: AtomicU32::new(0),
            disables: AtomicU32::new(0),
            unloads: AtomicU32::new(0),
        })
    }
}

impl NativeEntity for Counter {
    fn pos(&self) -> BlockPos {
        self.pos
    }

    fn block_state(&self) -> BlockState {
        self.state.lock().unwrap().clone()
    }

    fn set_block_state(&self, state: BlockState) {
        *self.state.lock().unwrap() = state;
    }

    fn save_data(&self) -> Compound {
        let mut data = Compound::new();
        data.put_i64("value", self.value.load(Ordering::SeqCst) as i64);
        data
    }

    fn handle_enable(&self) {
        self.enables.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_disable(&self, unloading: bool) {
        self.disables.fetch_add(1, Ordering::SeqCst);
        if unloading {
            self.unloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handle_tick(&self) -> anyhow::Result<()> {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn handle_async_tick(&self) -> anyhow::Result<()> {
        std::thread::sleep(Duration::from_millis(2));
        self.async_ticks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Parks in its first enable hook until released, and logs every hook.
struct Gated {
    pos: BlockPos,
    state: BlockState,
    entered: Mutex<Option<mpsc::Sender<()>>>,
    release: Mutex<Option<mpsc::Receiver<()>>>,
    hooks: Mutex<Vec<&'static str>>,
}

impl Gated {
    fn new(pos: BlockPos, state: BlockState, entered: mpsc::Sender<()>, release: mpsc::Receiver<()>) -> Arc<Self> {
        Arc::new(Self {
            pos,
            state,
            entered: Mutex::new(Some(entered)),
            release: Mutex::new(Some(release)),
            hooks: Mutex::new(Vec::new()),
        })
    }
}

impl NativeEntity for Gated {
    fn pos(&self) -> BlockPos {
        self.pos
    }

    fn block_state(&self) -> BlockState {
        self.state.clone()
    }

    fn set_block_state(&self, _state: BlockState) {}

    fn save_data(&self) -> Compound {
        Compound::new()
    }

    fn handle_enable(&self) {
        if let Some(entered) = self.entered.lock().unwrap().take() {
            entered.send(()).unwrap();
        }
        let release = self.release.lock().unwrap().take();
        if let Some(release) = release {
            release.recv().unwrap();
        }
        self.hooks.lock().unwrap().push("enable");
    }

    fn handle_disable(&self, _unloading: bool) {
        self.hooks.lock().unwrap().push("disable");
    }
}

struct Note {
    pos: BlockPos,
    text: String,
}

impl ForeignEntity for Note {
    fn pos(&self) -> BlockPos {
        self.pos
    }

    fn kind(&self) -> &str {
        "note"
    }

    fn save_data(&self) -> Compound {
        let mut data = Compound::new();
        data.put_str("text", self.text.as_str());
        data
    }
}

fn note(pos: BlockPos, data: Compound) -> anyhow::Result<Arc<dyn ForeignEntity>> {
    let text = data.get_str("text").unwrap_or_default().to_owned();
    Ok(Arc::new(Note { pos, text }))
}

struct Blocks {
    stone: BlockState,
    dirt: BlockState,
    counter: BlockState,
    slow: BlockState,
    rate18: BlockState,
    rate19: BlockState,
    idle: BlockState,
    asynchronous: BlockState,
}

fn counter_block(id: &str, sync_rate: u32, async_rate: f64) -> Arc<dyn Block> {
    Arc::new(CounterBlock {
        id: id.to_owned(),
        sync_rate,
        async_rate,
    })
}

fn blocks(registry: &mut BlockStateRegistry) -> Blocks {
    Blocks {
        stone: registry.register(Arc::new(SimpleBlock::new("test:stone"))),
        dirt: registry.register(Arc::new(SimpleBlock::new("test:dirt"))),
        counter: registry.register(counter_block("test:counter", 20, 0.0)),
        slow: registry.register(counter_block("test:slow", 10, 0.0)),
        rate18: registry.register(counter_block("test:rate18", 18, 0.0)),
        rate19: registry.register(counter_block("test:rate19", 19, 0.0)),
        idle: registry.register(counter_block("test:idle", 0, 0.0)),
        asynchronous: registry.register(counter_block("test:async", 0, 200.0)),
    }
}

fn context_with(registry: BlockStateRegistry, random_tick_speed: u32, runtime: Handle) -> Arc<RegionContext> {
    let mut foreign = ForeignEntityRegistry::new();
    foreign.register("note", note);
    RegionContext::new(
        Arc::new(registry),
        Arc::new(foreign),
        Arc::new(TestHost { random_tick_speed }),
        runtime,
        WorldBounds::default(),
    )
}

fn setup(runtime: Handle) -> (Arc<RegionContext>, Blocks) {
    let mut registry = BlockStateRegistry::new();
    let blocks = blocks(&mut registry);
    (context_with(registry, 0, runtime), blocks)
}

fn insert(chunk: &RegionChunk, counter: &Arc<Counter>) {
    chunk.set_block_state(counter.pos, Some(&counter.block_state()));
    chunk.set_native_entity(counter.pos, Some(Arc::clone(counter) as Arc<dyn NativeEntity>));
}

fn roundtrip(chunk: &RegionChunk, ctx: &Arc<RegionContext>) -> Arc<RegionChunk> {
    let mut out = BytesMut::new();
    assert!(chunk.write(&mut out));
    RegionChunk::read(chunk.pos(), Arc::clone(ctx), &mut out.freeze()).unwrap()
}

// ---------------------------------------------------------------------------
// Voxels
// ---------------------------------------------------------------------------

#[test]
fn last_write_wins_per_coordinate() {
    let rt = Runtime::new().unwrap();
    let (ctx, blocks) = setup(rt.handle().clone());
    let chunk = RegionChunk::new(ChunkPos::new(-3, 5), Arc::clone(&ctx));
    let states = [None, Some(&blocks.stone), Some(&blocks.dirt)];

    let mut rng = StdRng::seed_from_u64(7);
    let mut expected: HashMap<BlockPos, Option<BlockState>> = HashMap::new();
    for _ in 0..5000 {
        let pos = BlockPos::new(-48 + rng.gen_range(0..16), rng.gen_range(-64..320), 80 + rng.gen_range(0..16));
        let state = states[rng.gen_range(0..states.len())];
        chunk.set_block_state(pos, state);
        expected.insert(pos, state.cloned());
    }

    for (pos, state) in &expected {
        assert_eq!(&chunk.get_block_state(*pos), state, "at {pos:?}");
    }
}

#[test]
#[should_panic(expected = "Invalid y coordinate")]
fn height_outside_world_panics() {
    let rt = Runtime::new().unwrap();
    let (ctx, blocks) = setup(rt.handle().clone());
    let chunk = RegionChunk::new(ChunkPos::new(0, 0), ctx);
    chunk.set_block_state(BlockPos::new(0, 320, 0), Some(&blocks.stone));
}

#[test]
fn replacing_block_updates_entity_state() {
    let rt = Runtime::new().unwrap();
    let (ctx, blocks) = setup(rt.handle().clone());
    let chunk = RegionChunk::new(ChunkPos::new(0, 0), ctx);
    let counter = Counter::new(BlockPos::new(1, 2, 3), blocks.counter.clone());
    insert(&chunk, &counter);

    chunk.set_block_state(counter.pos, Some(&blocks.slow));
    assert_eq!(counter.block_state(), blocks.slow);

    chunk.set_block_state(counter.pos, None);
    assert_eq!(counter.block_state(), blocks.slow);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn empty_chunk_writes_nothing() {
    let rt = Runtime::new().unwrap();
    let (ctx, blocks) = setup(rt.handle().clone());
    let chunk = RegionChunk::new(ChunkPos::new(0, 0), ctx);
    let mut out = BytesMut::new();
    assert!(!chunk.write(&mut out));
    assert_eq!(out.len(), 0);

    chunk.set_block_state(BlockPos::new(4, 100, 4), Some(&blocks.stone));
    chunk.set_block_state(BlockPos::new(4, 100, 4), None);
    assert!(!chunk.write(&mut out));
    assert_eq!(out.len(), 0);
}

#[test]
fn write_then_read_reproduces_chunk() {
    let rt = Runtime::new().unwrap();
    let (ctx, blocks) = setup(rt.handle().clone());
    let chunk = RegionChunk::new(ChunkPos::new(2, -1), Arc::clone(&ctx));

    let placed = [
        (BlockPos::new(32, -64, -16), &blocks.stone),
        (BlockPos::new(47, 0, -1), &blocks.dirt),
        (BlockPos::new(40, 319, -8), &blocks.stone),
    ];
    for (pos, state) in placed {
        chunk.set_block_state(pos, Some(state));
    }
    let counter = Counter::new(BlockPos::new(33, 70, -10), blocks.counter.clone());
    counter.value.store(42, Ordering::SeqCst);
    insert(&chunk, &counter);
    let note_pos = BlockPos::new(34, 71, -11);
    chunk.set_foreign_entity(
        note_pos,
        Some(Arc::new(Note {
            pos: note_pos,
            text: "hello".into(),
        })),
    );

    let copy = roundtrip(&chunk, &ctx);

    for (pos, state) in placed {
        assert_eq!(copy.get_block_state(pos).as_ref(), Some(state));
    }
    assert_eq!(copy.get_block_state(counter.pos), Some(blocks.counter.clone()));
    assert_eq!(copy.non_empty_sections(), chunk.non_empty_sections());
    assert_eq!(copy.get_native_data(counter.pos), chunk.get_native_data(counter.pos));
    assert_eq!(copy.get_native_data(counter.pos).unwrap().get_i64("value"), Some(42));

    let restored = copy.get_native_entity(counter.pos).expect("entity rebuilt");
    assert_eq!(restored.save_data().get_i64("value"), Some(42));

    let note = copy.get_foreign_entity(note_pos).expect("note rebuilt");
    assert_eq!(note.save_data().get_str("text"), Some("hello"));
    assert!(!copy.is_enabled());
}

#[test]
fn write_flushes_live_entity_state() {
    let rt = Runtime::new().unwrap();
    let (ctx, blocks) = setup(rt.handle().clone());
    let chunk = RegionChunk::new(ChunkPos::new(0, 0), Arc::clone(&ctx));
    let counter = Counter::new(BlockPos::new(1, 1, 1), blocks.counter.clone());
    insert(&chunk, &counter);

    counter.value.store(9, Ordering::SeqCst);
    let copy = roundtrip(&chunk, &ctx);
    assert_eq!(copy.get_native_data(counter.pos).unwrap().get_i64("value"), Some(9));
    assert_eq!(chunk.get_native_data(counter.pos).unwrap().get_i64("value"), Some(9));
}

#[test]
fn entity_without_block_is_skipped_alone() {
    let rt = Runtime::new().unwrap();
    let (ctx, blocks) = setup(rt.handle().clone());
    let chunk = RegionChunk::new(ChunkPos::new(0, 0), Arc::clone(&ctx));
    let orphan = Counter::new(BlockPos::new(1, 1, 1), blocks.counter.clone());
    let kept = Counter::new(BlockPos::new(2, 1, 1), blocks.counter.clone());
    insert(&chunk, &orphan);
    insert(&chunk, &kept);
    chunk.set_block_state(orphan.pos, None);

    let copy = roundtrip(&chunk, &ctx);
    assert!(copy.get_native_entity(orphan.pos).is_none());
    assert!(copy.get_native_entity(kept.pos).is_some());
    // The record survives for a later fix-up.
    assert!(copy.get_native_data(orphan.pos).is_some());
}

#[test]
fn failing_constructor_skips_entity() {
    let rt = Runtime::new().unwrap();
    let (ctx, blocks) = setup(rt.handle().clone());
    let chunk = RegionChunk::new(ChunkPos::new(0, 0), Arc::clone(&ctx));

    struct Broken(Arc<Counter>);
    impl NativeEntity for Broken {
        fn pos(&self) -> BlockPos {
            self.0.pos
        }
        fn block_state(&self) -> BlockState {
            self.0.block_state()
        }
        fn set_block_state(&self, state: BlockState) {
            self.0.set_block_state(state)
        }
        fn save_data(&self) -> Compound {
            let mut data = Compound::new();
            data.put_i32("broken", 1);
            data
        }
    }

    let broken = Counter::new(BlockPos::new(3, 3, 3), blocks.counter.clone());
    chunk.set_block_state(broken.pos, Some(&blocks.counter));
    chunk.set_native_entity(broken.pos, Some(Arc::new(Broken(Arc::clone(&broken)))));
    let good = Counter::new(BlockPos::new(4, 3, 3), blocks.counter.clone());
    insert(&chunk, &good);

    let copy = roundtrip(&chunk, &ctx);
    assert!(copy.get_native_entity(broken.pos).is_none());
    assert!(copy.get_native_entity(good.pos).is_some());
}

#[test]
fn unknown_blocks_keep_their_records() {
    let rt = Runtime::new().unwrap();
    let (ctx, blocks) = setup(rt.handle().clone());
    let chunk = RegionChunk::new(ChunkPos::new(0, 0), Arc::clone(&ctx));
    let counter = Counter::new(BlockPos::new(5, 5, 5), blocks.counter.clone());
    counter.value.store(3, Ordering::SeqCst);
    insert(&chunk, &counter);
    let mut out = BytesMut::new();
    assert!(chunk.write(&mut out));

    // A server that no longer knows the counter block.
    let mut registry = BlockStateRegistry::new();
    let unknown = registry.register(Arc::new(SimpleBlock::unknown("test:unknown")));
    let other = context_with(registry, 0, rt.handle().clone());
    let copy = RegionChunk::read(chunk.pos(), other, &mut out.freeze()).unwrap();

    assert_eq!(copy.get_block_state(counter.pos), Some(unknown));
    assert!(copy.get_native_entity(counter.pos).is_none());
    assert_eq!(copy.get_native_data(counter.pos).unwrap().get_i64("value"), Some(3));
}

#[test]
fn truncated_stream_is_an_error() {
    let rt = Runtime::new().unwrap();
    let (ctx, blocks) = setup(rt.handle().clone());
    let chunk = RegionChunk::new(ChunkPos::new(0, 0), Arc::clone(&ctx));
    chunk.set_block_state(BlockPos::new(0, 0, 0), Some(&blocks.stone));
    let mut out = BytesMut::new();
    assert!(chunk.write(&mut out));

    let cut = &out[..out.len() - 3];
    let err = RegionChunk::read(chunk.pos(), Arc::clone(&ctx), &mut &cut[..]).err().unwrap();
    assert!(matches!(err, FormatError::UnexpectedEof { .. }), "{err}");

    let short_world = RegionContext::new(
        Arc::clone(&ctx.registry),
        Arc::clone(&ctx.foreign_types),
        Arc::clone(&ctx.host),
        rt.handle().clone(),
        WorldBounds::new(0, 256),
    );
    let err = RegionChunk::read(chunk.pos(), short_world, &mut &out[..]).err().unwrap();
    assert!(matches!(err, FormatError::SectionCount { found: 24, expected: 16 }), "{err}");
}

// ---------------------------------------------------------------------------
// Sync ticking
// ---------------------------------------------------------------------------

#[test]
fn sync_interval_from_rate() {
    assert!((1..100).all(|t| sync_tick_due(20, t)));
    assert!((1..100).all(|t| sync_tick_due(19, t)));
    assert!((1..100).all(|t| !sync_tick_due(0, t)));
    assert!(sync_tick_due(18, 2) && !sync_tick_due(18, 3));
    assert!(sync_tick_due(30, 7));
}

#[test]
fn clock_drives_enabled_chunks_only() {
    let rt = Runtime::new().unwrap();
    let (ctx, blocks) = setup(rt.handle().clone());
    let chunk = RegionChunk::new(ChunkPos::new(0, 0), Arc::clone(&ctx));
    let every = Counter::new(BlockPos::new(0, 0, 0), blocks.counter.clone());
    let almost = Counter::new(BlockPos::new(1, 0, 0), blocks.rate19.clone());
    let half = Counter::new(BlockPos::new(2, 0, 0), blocks.rate18.clone());
    let tenth = Counter::new(BlockPos::new(3, 0, 0), blocks.slow.clone());
    let never = Counter::new(BlockPos::new(4, 0, 0), blocks.idle.clone());
    for counter in [&every, &almost, &half, &tenth, &never] {
        insert(&chunk, counter);
    }

    ctx.clock.tick();
    assert_eq!(every.ticks.load(Ordering::SeqCst), 0);

    chunk.enable();
    for _ in 0..10 {
        ctx.clock.tick();
    }
    assert_eq!(chunk.current_tick(), 10);
    assert_eq!(every.ticks.load(Ordering::SeqCst), 10);
    assert_eq!(almost.ticks.load(Ordering::SeqCst), 10);
    assert_eq!(half.ticks.load(Ordering::SeqCst), 5);
    assert_eq!(tenth.ticks.load(Ordering::SeqCst), 1);
    assert_eq!(never.ticks.load(Ordering::SeqCst), 0);

    chunk.disable();
    assert_eq!(ctx.clock.task_count(), 0);
    ctx.clock.tick();
    assert_eq!(every.ticks.load(Ordering::SeqCst), 10);
}

#[test]
fn enable_and_disable_are_idempotent() {
    let rt = Runtime::new().unwrap();
    let (ctx, blocks) = setup(rt.handle().clone());
    let chunk = RegionChunk::new(ChunkPos::new(0, 0), Arc::clone(&ctx));
    let counter = Counter::new(BlockPos::new(0, 0, 0), blocks.counter.clone());
    insert(&chunk, &counter);

    chunk.enable();
    chunk.enable();
    assert_eq!(counter.enables.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.clock.task_count(), 1);

    chunk.disable();
    chunk.disable();
    assert_eq!(counter.disables.load(Ordering::SeqCst), 1);
}

#[test]
fn removed_entity_is_disabled_and_stops_ticking() {
    let rt = Runtime::new().unwrap();
    let (ctx, blocks) = setup(rt.handle().clone());
    let chunk = RegionChunk::new(ChunkPos::new(0, 0), Arc::clone(&ctx));
    let counter = Counter::new(BlockPos::new(0, 0, 0), blocks.counter.clone());
    insert(&chunk, &counter);
    chunk.enable();
    ctx.clock.tick();

    let previous = chunk.set_native_entity(counter.pos, None);
    assert!(previous.is_some());
    assert!(chunk.get_native_data(counter.pos).is_none());
    assert_eq!(counter.disables.load(Ordering::SeqCst), 1);

    ctx.clock.tick();
    assert_eq!(counter.ticks.load(Ordering::SeqCst), 1);
}

#[test]
fn disable_hook_tells_removal_from_unload() {
    let rt = Runtime::new().unwrap();
    let (ctx, blocks) = setup(rt.handle().clone());
    let chunk = RegionChunk::new(ChunkPos::new(0, 0), ctx);
    let removed = Counter::new(BlockPos::new(0, 0, 0), blocks.idle.clone());
    let kept = Counter::new(BlockPos::new(1, 0, 0), blocks.idle.clone());
    insert(&chunk, &removed);
    insert(&chunk, &kept);
    chunk.enable();

    chunk.set_native_entity(removed.pos, None);
    chunk.disable();

    assert_eq!(removed.disables.load(Ordering::SeqCst), 1);
    assert_eq!(removed.unloads.load(Ordering::SeqCst), 0);
    assert_eq!(kept.disables.load(Ordering::SeqCst), 1);
    assert_eq!(kept.unloads.load(Ordering::SeqCst), 1);
}

#[test]
fn random_ticks_sample_occupied_sections() {
    let rt = Runtime::new().unwrap();
    let ore = Arc::new(OreBlock {
        hits: Mutex::new(Vec::new()),
    });
    let mut registry = BlockStateRegistry::new();
    let state = registry.register(Arc::clone(&ore) as Arc<dyn Block>);
    let ctx = context_with(registry, 3, rt.handle().clone());
    let chunk = RegionChunk::new(ChunkPos::new(1, 1), Arc::clone(&ctx));

    // Fill section 5 (y 16..32) completely.
    for y in 16..32 {
        for z in 16..32 {
            for x in 16..32 {
                chunk.set_block_state(BlockPos::new(x, y, z), Some(&state));
            }
        }
    }
    chunk.enable();
    for _ in 0..10 {
        ctx.clock.tick();
    }

    let hits = ore.hits.lock().unwrap();
    assert_eq!(hits.len(), 30);
    assert!(hits.iter().all(|p| (16..32).contains(&p.y) && chunk.pos().contains(*p)));
}

// ---------------------------------------------------------------------------
// Async ticking
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disable_freezes_async_ticks() {
    let (ctx, blocks) = setup(Handle::current());
    let chunk = RegionChunk::new(ChunkPos::new(0, 0), Arc::clone(&ctx));
    let counters: Vec<_> = (0..4)
        .map(|i| Counter::new(BlockPos::new(i, 10, 0), blocks.asynchronous.clone()))
        .collect();
    for counter in &counters {
        insert(&chunk, counter);
    }

    chunk.enable();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(counters.iter().all(|c| c.async_ticks.load(Ordering::SeqCst) > 0));

    let disabler = Arc::clone(&chunk);
    tokio::task::spawn_blocking(move || disabler.disable()).await.unwrap();
    let frozen: Vec<u64> = counters.iter().map(|c| c.async_ticks.load(Ordering::SeqCst)).collect();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let after: Vec<u64> = counters.iter().map(|c| c.async_ticks.load(Ordering::SeqCst)).collect();
    assert_eq!(frozen, after);
    assert!(counters.iter().all(|c| c.disables.load(Ordering::SeqCst) == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn entity_inserted_into_enabled_chunk_ticks_async() {
    let (ctx, blocks) = setup(Handle::current());
    let chunk = RegionChunk::new(ChunkPos::new(0, 0), Arc::clone(&ctx));
    chunk.enable();

    let counter = Counter::new(BlockPos::new(0, 0, 0), blocks.asynchronous.clone());
    insert(&chunk, &counter);
    assert_eq!(counter.enables.load(Ordering::SeqCst), 1);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(counter.async_ticks.load(Ordering::SeqCst) > 0);

    // Replacing cancels the old ticker.
    let replacement = Counter::new(counter.pos, blocks.asynchronous.clone());
    let cancelled = {
        let chunk = Arc::clone(&chunk);
        let replacement = Arc::clone(&replacement);
        tokio::task::spawn_blocking(move || {
            chunk.set_native_entity(replacement.pos, Some(replacement as Arc<dyn NativeEntity>))
        })
        .await
        .unwrap()
    };
    assert!(cancelled.is_some());
    let frozen = counter.async_ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(counter.async_ticks.load(Ordering::SeqCst), frozen);
    assert!(replacement.async_ticks.load(Ordering::SeqCst) > 0);

    let disabler = Arc::clone(&chunk);
    tokio::task::spawn_blocking(move || disabler.disable()).await.unwrap();
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn entity_and_record_become_visible_together() {
    let rt = Runtime::new().unwrap();
    let (ctx, blocks) = setup(rt.handle().clone());
    let chunk = RegionChunk::new(ChunkPos::new(0, 0), ctx);
    let positions: Vec<BlockPos> = (0..256).map(|i| BlockPos::new(i % 16, i / 16, 0)).collect();
    for pos in &positions {
        chunk.set_block_state(*pos, Some(&blocks.counter));
    }

    let done = AtomicBool::new(false);
    std::thread::scope(|s| {
        s.spawn(|| {
            for round in 0..20 {
                for pos in &positions {
                    let entity = (round % 2 == 0).then(|| Counter::new(*pos, blocks.counter.clone()) as Arc<dyn NativeEntity>);
                    chunk.set_native_entity(*pos, entity);
                }
            }
            done.store(true, Ordering::SeqCst);
        });
        for _ in 0..3 {
            s.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    for pos in &positions {
                        chunk.inspect_native(*pos, |entity, data| {
                            assert_eq!(entity.is_some(), data.is_some(), "torn entry at {pos:?}");
                        });
                        assert_eq!(chunk.get_block_state(*pos), Some(blocks.counter.clone()));
                    }
                }
            });
        }
    });
}

#[test]
fn concurrent_enable_and_insert_enables_once() {
    let rt = Runtime::new().unwrap();
    let (ctx, blocks) = setup(rt.handle().clone());
    for _ in 0..200 {
        let chunk = RegionChunk::new(ChunkPos::new(0, 0), Arc::clone(&ctx));
        let counter = Counter::new(BlockPos::new(0, 0, 0), blocks.counter.clone());
        chunk.set_block_state(counter.pos, Some(&blocks.counter));

        std::thread::scope(|s| {
            s.spawn(|| chunk.enable());
            s.spawn(|| {
                chunk.set_native_entity(counter.pos, Some(Arc::clone(&counter) as Arc<dyn NativeEntity>));
            });
        });

        assert_eq!(counter.enables.load(Ordering::SeqCst), 1);
        chunk.disable();
    }
}

#[test]
fn disable_during_enable_hooks_ends_disabled() {
    let rt = Runtime::new().unwrap();
    let (ctx, blocks) = setup(rt.handle().clone());
    let chunk = RegionChunk::new(ChunkPos::new(0, 0), ctx);
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let gated = Gated::new(BlockPos::new(8, 8, 8), blocks.idle.clone(), entered_tx, release_rx);
    chunk.set_block_state(gated.pos, Some(&blocks.idle));
    chunk.set_native_entity(gated.pos, Some(Arc::clone(&gated) as Arc<dyn NativeEntity>));
    let counters: Vec<_> = (0..8)
        .map(|i| Counter::new(BlockPos::new(i, 0, 0), blocks.idle.clone()))
        .collect();
    for counter in &counters {
        insert(&chunk, counter);
    }

    let enabling = {
        let chunk = Arc::clone(&chunk);
        std::thread::spawn(move || chunk.enable())
    };
    entered_rx.recv().unwrap();

    // The enable hooks are parked; disabling must not slip its hooks in first.
    let disabling = {
        let chunk = Arc::clone(&chunk);
        std::thread::spawn(move || chunk.disable())
    };
    std::thread::sleep(Duration::from_millis(20));
    release_tx.send(()).unwrap();
    enabling.join().unwrap();
    disabling.join().unwrap();

    assert!(!chunk.is_enabled());
    assert_eq!(*gated.hooks.lock().unwrap(), vec!["enable", "disable"]);
    for counter in &counters {
        let enables = counter.enables.load(Ordering::SeqCst);
        assert!(enables <= 1);
        assert_eq!(counter.disables.load(Ordering::SeqCst), enables);
    }
}
