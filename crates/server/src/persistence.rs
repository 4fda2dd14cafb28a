//! Region-chunk persistence in region containers.
//!
//! Chunks are grouped 32×32 per file under `<dir>/region/r.X.Z.vxr`. Each
//! slot holds the bytes of [`RegionChunk::write`], compressed by
//! `fastanvil`. A chunk with nothing to persist is removed from its slot.

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};

use voxtile_engine::world::World;
use voxtile_engine::world::chunk::RegionChunk;
use voxtile_engine::world::position::ChunkPos;

const REGION_EXTENSION: &str = "vxr";
const REGION_SIZE: i32 = 32;

type Region = fastanvil::Region<Cursor<Vec<u8>>>;

fn region_of(pos: ChunkPos) -> (i32, i32) {
    (pos.x.div_euclid(REGION_SIZE), pos.z.div_euclid(REGION_SIZE))
}

fn local_of(pos: ChunkPos) -> (usize, usize) {
    (
        pos.x.rem_euclid(REGION_SIZE) as usize,
        pos.z.rem_euclid(REGION_SIZE) as usize,
    )
}

fn region_path(dir: &Path, (rx, rz): (i32, i32)) -> PathBuf {
    dir.join("region").join(format!("r.{rx}.{rz}.{REGION_EXTENSION}"))
}

/// Parse `r.X.Z.vxr` into region coordinates.
fn parse_region_name(name: &str) -> Option<(i32, i32)> {
    let stem = name.strip_suffix(REGION_EXTENSION)?.strip_suffix('.')?;
    let mut parts = stem.split('.');
    if parts.next()? != "r" {
        return None;
    }
    let rx = parts.next()?.parse().ok()?;
    let rz = parts.next()?.parse().ok()?;
    parts.next().is_none().then_some((rx, rz))
}

fn open_region(path: &Path) -> Result<Region> {
    let bytes = fs::read(path).with_context(|| format!("reading region {}", path.display()))?;
    fastanvil::Region::from_stream(Cursor::new(bytes))
        .with_context(|| format!("parsing region {}", path.display()))
}

fn flush_region(region: Region, path: &Path) -> Result<()> {
    let mut cursor = region
        .into_inner()
        .with_context(|| format!("finishing region {}", path.display()))?;
    let len = cursor.stream_position()? as usize;
    let data = cursor.into_inner();
    fs::write(path, &data[..len]).with_context(|| format!("writing region {}", path.display()))
}

// ── Save ─────────────────────────────────────────────────────────────────────

/// Save every dirty chunk. Returns the number of chunks written or removed.
///
/// On failure the drained chunks are marked dirty again so the next save
/// retries them.
pub fn save_world(world: &World, dir: &Path) -> Result<usize> {
    let dirty = world.take_dirty_chunks();
    if dirty.is_empty() {
        tracing::debug!("World save: nothing to save");
        return Ok(0);
    }
    save_chunks(world, dir, &dirty).inspect_err(|_| {
        for pos in &dirty {
            world.mark_dirty(*pos);
        }
    })
}

/// Save the loaded chunks among `positions`, dirty or not. Used before
/// unloading a chunk.
pub fn save_chunks(world: &World, dir: &Path, positions: &[ChunkPos]) -> Result<usize> {
    let start = Instant::now();
    let region_dir = dir.join("region");
    fs::create_dir_all(&region_dir)
        .with_context(|| format!("creating {}", region_dir.display()))?;

    let mut by_region: HashMap<(i32, i32), Vec<(ChunkPos, Option<Vec<u8>>)>> = HashMap::new();
    for (pos, bytes) in world.encode_chunks(positions) {
        by_region.entry(region_of(pos)).or_default().push((pos, bytes));
    }

    let mut written = 0usize;
    let mut removed = 0usize;
    for (coords, chunks) in &by_region {
        let path = region_path(dir, *coords);
        let exists = path.exists();
        if !exists && chunks.iter().all(|(_, bytes)| bytes.is_none()) {
            continue;
        }

        let mut region = if exists {
            open_region(&path)?
        } else {
            fastanvil::Region::new(Cursor::new(Vec::new()))
                .with_context(|| format!("creating region {}", path.display()))?
        };

        for (pos, bytes) in chunks {
            let (x, z) = local_of(*pos);
            match bytes {
                Some(bytes) => {
                    region
                        .write_chunk(x, z, bytes)
                        .with_context(|| format!("writing chunk {:?}", pos))?;
                    written += 1;
                }
                None => {
                    region
                        .remove_chunk(x, z)
                        .with_context(|| format!("removing chunk {:?}", pos))?;
                    removed += 1;
                }
            }
        }
        flush_region(region, &path)?;
    }

    tracing::info!(
        "World saved: {} chunks written, {} removed across {} regions ({:.2?})",
        written,
        removed,
        by_region.len(),
        start.elapsed(),
    );
    Ok(written + removed)
}

// ── Load ─────────────────────────────────────────────────────────────────────

/// Decode the stored chunk at `pos`, if any. The chunk is not loaded into
/// `world`.
pub fn read_chunk(world: &World, dir: &Path, pos: ChunkPos) -> Result<Option<Arc<RegionChunk>>> {
    let path = region_path(dir, region_of(pos));
    if !path.exists() {
        return Ok(None);
    }
    let mut region = open_region(&path)?;
    let (x, z) = local_of(pos);
    let Some(bytes) = region
        .read_chunk(x, z)
        .with_context(|| format!("reading chunk {:?}", pos))?
    else {
        return Ok(None);
    };
    let chunk = world
        .read_chunk(pos, &bytes)
        .with_context(|| format!("decoding chunk {:?}", pos))?;
    Ok(Some(chunk))
}

/// Load and enable every stored chunk. Chunks that fail to decode are
/// logged and skipped. Returns the positions loaded.
pub fn load_world(world: &World, dir: &Path) -> Result<Vec<ChunkPos>> {
    let region_dir = dir.join("region");
    if !region_dir.is_dir() {
        return Ok(Vec::new());
    }

    let start = Instant::now();
    let mut loaded = Vec::new();
    let mut region_count = 0usize;

    for entry in fs::read_dir(&region_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((rx, rz)) = parse_region_name(name) else {
            tracing::warn!("Skipping unexpected file in region dir: {}", name);
            continue;
        };

        let mut region = open_region(&path)?;
        for x in 0..REGION_SIZE {
            for z in 0..REGION_SIZE {
                let pos = ChunkPos::new(rx * REGION_SIZE + x, rz * REGION_SIZE + z);
                let Some(bytes) = region
                    .read_chunk(x as usize, z as usize)
                    .with_context(|| format!("reading chunk {:?} from {}", pos, name))?
                else {
                    continue;
                };
                match world.read_chunk(pos, &bytes) {
                    Ok(chunk) => {
                        world.load_chunk(chunk);
                        loaded.push(pos);
                    }
                    Err(e) => tracing::error!("Skipping corrupt chunk {:?}: {}", pos, e),
                }
            }
        }
        region_count += 1;
    }

    tracing::info!(
        "World loaded: {} chunks from {} regions ({:.2?})",
        loaded.len(),
        region_count,
        start.elapsed(),
    );
    Ok(loaded)
}

// ── Tests ────────────────────────────────────────────────────────────────────
