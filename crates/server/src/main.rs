use std::path::PathBuf;
use std::sync::Arc;

use voxtile_engine::world::position::{BlockPos, ChunkPos};
use voxtile_server::config::Config;
use voxtile_server::server::{self, Server};

#[tokio::main]
async fn main() {
    let demo_ticks: Option<u64> = std::env::args()
        .any(|a| a == "--demo")
        .then(|| {
            std::env::args()
                .skip_while(|a| a != "--demo")
                .nth(1)
                .and_then(|s| s.parse().ok())
                .unwrap_or(100)
        });
    let config_path: PathBuf = std::env::args()
        .skip_while(|a| a != "--config")
        .nth(1)
        .unwrap_or_else(|| "voxtile.toml".into())
        .into();
    let world_dir: PathBuf = std::env::args()
        .skip_while(|a| a != "--world")
        .nth(1)
        .unwrap_or_else(|| "world".into())
        .into();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::exit(1);
        }
    };

    if let Some(ticks) = demo_ticks {
        run_demo(config, ticks).await;
        return;
    }

    tracing::info!("voxtile -- region-chunk device server");

    let server = Arc::new(Server::new(config, world_dir, tokio::runtime::Handle::current()));
    match tokio::task::block_in_place(|| server.load()) {
        Ok(0) => tracing::info!("No saved chunks found"),
        Ok(n) => tracing::info!("Loaded {} chunks from {}", n, server.world_dir().display()),
        Err(e) => {
            tracing::error!("Failed to load world: {:#}", e);
            std::process::exit(1);
        }
    }

    let ticking = server::start_tick_loop(Arc::clone(&server));
    server::start_autosave(Arc::clone(&server));
    server::start_stats_logger(Arc::clone(&server));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
    }
    tracing::info!("Ctrl+C received, shutting down...");
    ticking.abort();

    // ── Save on shutdown ─────────────────────────────────────────────────
    tracing::info!("Saving world before exit...");
    match tokio::task::block_in_place(|| server.save()) {
        Ok(n) => tracing::info!("Shutdown save complete: {} chunks written", n),
        Err(e) => tracing::error!("Shutdown save failed: {:#}", e),
    }
}

/// Build a pump → pipe → tank line plus a solar panel charging a battery in
/// a throwaway world, tick it, and report where the resources ended up.
async fn run_demo(config: Config, ticks: u64) {
    let world_dir = std::env::temp_dir().join("voxtile-demo");
    let server = Server::new(config, &world_dir, tokio::runtime::Handle::current());
    let content = &server.content;

    tracing::info!("voxtile -- device demo ({} ticks)", ticks);

    let pump = BlockPos::new(0, 64, 0);
    let tank = BlockPos::new(4, 64, 0);
    let solar = BlockPos::new(0, 64, 4);
    let battery = BlockPos::new(1, 64, 4);

    let placed = [
        (pump, &content.pump),
        (pump.offset(1, 0, 0), &content.pipe),
        (pump.offset(2, 0, 0), &content.pipe),
        (pump.offset(3, 0, 0), &content.pipe),
        (tank, &content.tank),
        (solar, &content.solar_panel),
        (battery, &content.battery),
    ];
    for (pos, state) in placed {
        if let Err(e) = server.world.place_block(pos, state) {
            tracing::error!("Could not place {} at {:?}: {}", state.name(), pos, e);
            return;
        }
    }
    server.host.add_block_entity(BlockPos::new(8, 64, 8), "chest");

    let tick_interval = server.config.tick_interval();
    for _ in 0..ticks {
        tokio::task::block_in_place(|| server.tick());
        tokio::time::sleep(tick_interval).await;
    }

    tracing::info!(
        "{} networks; pump is in {:?}",
        server.network.network_count(),
        server.network.networks_at(pump)
    );
    let stored = |pos: BlockPos, key: &str| -> i64 {
        server
            .world
            .get_native_entity(pos)
            .and_then(|e| e.save_data().get_i64(key))
            .unwrap_or(0)
    };
    tracing::info!(
        "Pump holds {} mB, tank holds {} mB, battery holds {} energy",
        stored(pump, "amount"),
        stored(tank, "amount"),
        stored(battery, "energy")
    );
    tracing::info!(
        "Foreign entities in chunk {:?}: {}",
        ChunkPos::new(0, 0),
        server
            .world
            .get_chunk(ChunkPos::new(0, 0))
            .map_or(0, |c| c.get_all_foreign_entities().len())
    );

    let snapshot = server.snapshot();
    tracing::info!(
        "Ran {} ticks, {} clock tasks, mean tick {:.2?}",
        snapshot.ticks_total,
        snapshot.sync_tasks_total,
        snapshot.mean_tick()
    );
}
