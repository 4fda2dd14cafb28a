//! The standalone server: owns the world, its host, the network manager and
//! the foreign-entity manager, and drives them from one tick loop.
//!
//! Background loops follow the same shape: a `tokio::time::interval` whose
//! first (immediate) tick is skipped, then one unit of work per tick.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use voxtile_engine::host::Host;
use voxtile_engine::network::NetworkManager;
use voxtile_engine::world::World;
use voxtile_engine::world::block::BlockStateRegistry;
use voxtile_engine::world::chunk::RegionContext;
use voxtile_engine::world::entity::ForeignEntityRegistry;
use voxtile_engine::world::position::ChunkPos;

use crate::block::{self, Content};
use crate::config::Config;
use crate::foreign::{self, ForeignEntityManager};
use crate::host::StandaloneHost;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::persistence;

/// How often the periodic stats line is logged.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

pub struct Server {
    pub config: Config,
    pub host: Arc<StandaloneHost>,
    pub network: Arc<NetworkManager>,
    pub world: Arc<World>,
    pub foreign: ForeignEntityManager,
    pub metrics: Arc<Metrics>,
    pub content: Content,
    world_dir: PathBuf,
}

impl Server {
    /// Build a server whose async tickers run on `runtime`. Nothing is loaded
    /// yet; see [`Server::load`].
    pub fn new(config: Config, world_dir: impl Into<PathBuf>, runtime: Handle) -> Self {
        let metrics = Arc::new(Metrics::new());
        let network = Arc::new(NetworkManager::new(config.network.clone()));

        let mut registry = BlockStateRegistry::new();
        let content = block::register(&mut registry, &network, &metrics);
        let mut foreign_types = ForeignEntityRegistry::new();
        foreign::register(&mut foreign_types, &network);

        let host = Arc::new(StandaloneHost::new(&config));
        let ctx = RegionContext::new(
            Arc::new(registry),
            Arc::new(foreign_types),
            Arc::clone(&host) as Arc<dyn Host>,
            runtime,
            config.bounds(),
        );
        let world = Arc::new(World::new(ctx));
        let foreign = ForeignEntityManager::new(Arc::clone(&world), Arc::clone(&metrics));

        Self {
            config,
            host,
            network,
            world,
            foreign,
            metrics,
            content,
            world_dir: world_dir.into(),
        }
    }

    pub fn world_dir(&self) -> &Path {
        &self.world_dir
    }

    /// Load every stored chunk. Returns the number loaded.
    pub fn load(&self) -> Result<usize> {
        let loaded = persistence::load_world(&self.world, &self.world_dir)?;
        for pos in &loaded {
            if let Some(chunk) = self.world.get_chunk(*pos) {
                self.foreign.handle_chunk_load(&chunk);
            }
        }
        Ok(loaded.len())
    }

    /// Load the stored chunk at `pos`, or an empty one. Returns `false` if it
    /// was already loaded.
    pub fn load_chunk(&self, pos: ChunkPos) -> Result<bool> {
        if self.world.has_chunk(pos) {
            return Ok(false);
        }
        let chunk = match persistence::read_chunk(&self.world, &self.world_dir, pos)? {
            Some(chunk) => chunk,
            None => self.world.create_chunk(pos),
        };
        self.world.load_chunk(Arc::clone(&chunk));
        self.foreign.handle_chunk_load(&chunk);
        Ok(true)
    }

    /// Save and unload the chunk at `pos`. Returns `false` if it was not
    /// loaded.
    pub fn unload_chunk(&self, pos: ChunkPos) -> Result<bool> {
        let Some(chunk) = self.world.get_chunk(pos) else {
            return Ok(false);
        };
        persistence::save_chunks(&self.world, &self.world_dir, &[pos])?;
        self.world.unload_chunk(pos);
        self.foreign.handle_chunk_unload(&chunk);
        Ok(true)
    }

    /// Save every dirty chunk. Returns the number saved.
    pub fn save(&self) -> Result<usize> {
        let saved = persistence::save_world(&self.world, &self.world_dir)?;
        self.metrics.record_save(saved);
        Ok(saved)
    }

    /// One host tick: sync entity ticks and random ticks, then networks, then
    /// the foreign-entity diff. Returns the number of clock tasks run.
    pub fn tick(&self) -> usize {
        let start = Instant::now();
        let tasks = self.world.context().clock.tick();
        self.network.tick();
        self.foreign.tick();
        self.metrics.record_tick(tasks, start.elapsed());
        tasks
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.world.chunk_count() as u64, self.network.network_count() as u64)
    }
}

// ── Background loops ────────────────────────────────────────────────────────

/// Spawn the host tick loop at the configured rate. The achieved rate is
/// measured once per second of ticks and only reported; the host keeps
/// advertising the configured rate.
///
/// Ticks block on chunk locks, so this needs the multi-threaded runtime.
pub fn start_tick_loop(server: Arc<Server>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let target = server.config.tick_rate;
        let window = target.ceil().max(1.0) as u64;
        let mut interval = tokio::time::interval(server.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        tracing::info!("Tick loop started at {} ticks/s", target);

        let mut ticks = 0u64;
        let mut window_start = Instant::now();
        loop {
            interval.tick().await;
            tokio::task::block_in_place(|| server.tick());

            ticks += 1;
            if ticks % window == 0 {
                let rate = (window as f64 / window_start.elapsed().as_secs_f64()).min(target);
                window_start = Instant::now();
                if rate < target * 0.9 {
                    tracing::warn!("Server is running behind: {:.1} ticks/s", rate);
                }
            }
        }
    })
}

pub fn start_autosave(server: Arc<Server>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = server.config.autosave_interval();
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            tracing::info!("Autosaving...");
            match tokio::task::block_in_place(|| server.save()) {
                Ok(n) => tracing::info!("Autosave complete: {} chunks", n),
                Err(e) => tracing::error!("Autosave failed: {:#}", e),
            }
        }
    })
}

/// Log a JSON metrics snapshot every [`STATS_INTERVAL`].
pub fn start_stats_logger(server: Arc<Server>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let snapshot = server.snapshot();
            match serde_json::to_string(&snapshot) {
                Ok(json) => tracing::info!(mean_tick = ?snapshot.mean_tick(), "stats {}", json),
                Err(e) => tracing::warn!("Failed to encode stats: {}", e),
            }
        }
    })
}
