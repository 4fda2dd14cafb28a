use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::{RwLock, RwLockReadGuard};

use super::block::{BlockId, BlockState, BlockStateRegistry};
use super::format::{self, bits_per_entry, pack_indices, packed_len, unpack_indices};
use crate::error::FormatError;

/// Number of blocks along each axis of a section.
pub const SECTION_SIZE: usize = 16;
/// Total block count in one section.
pub const SECTION_VOLUME: usize = SECTION_SIZE * SECTION_SIZE * SECTION_SIZE;

struct SectionData {
    /// `None` while the section is entirely air.
    blocks: Option<Box<[BlockId; SECTION_VOLUME]>>,
    non_air: u16,
}

impl SectionData {
    const fn empty() -> Self {
        Self {
            blocks: None,
            non_air: 0,
        }
    }

    #[inline]
    fn get(&self, index: usize) -> BlockId {
        match &self.blocks {
            Some(blocks) => blocks[index],
            None => BlockId::AIR,
        }
    }
}

#[inline]
fn index(x: u8, y: u8, z: u8) -> usize {
    assert!(
        (x as usize) < SECTION_SIZE && (y as usize) < SECTION_SIZE && (z as usize) < SECTION_SIZE,
        "section coordinate ({x}, {y}, {z}) out of range"
    );
    (y as usize) * SECTION_SIZE * SECTION_SIZE + (z as usize) * SECTION_SIZE + (x as usize)
}

/// A 16x16x16 cube of block states with its own lock.
///
/// Stored as a flat array in YZX order (x varies fastest). The array is only
/// allocated while at least one voxel is occupied, and a running count of
/// occupied voxels makes [`is_empty`](Self::is_empty) O(1).
pub struct RegionSection {
    registry: Arc<BlockStateRegistry>,
    data: RwLock<SectionData>,
}

impl RegionSection {
    pub fn new(registry: Arc<BlockStateRegistry>) -> Self {
        Self {
            registry,
            data: RwLock::new(SectionData::empty()),
        }
    }

    pub fn get(&self, x: u8, y: u8, z: u8) -> Option<BlockState> {
        let i = index(x, y, z);
        let id = self.data.read().get(i);
        self.registry.get(id).cloned()
    }

    /// Store `state` (or clear the voxel) and return the previous state.
    pub fn set(&self, x: u8, y: u8, z: u8, state: Option<&BlockState>) -> Option<BlockState> {
        let i = index(x, y, z);
        let new = state.map_or(BlockId::AIR, BlockState::id);
        let mut data = self.data.write();

        let previous = data.get(i);
        if previous == new {
            return self.registry.get(previous).cloned();
        }

        let blocks = data
            .blocks
            .get_or_insert_with(|| Box::new([BlockId::AIR; SECTION_VOLUME]));
        blocks[i] = new;

        if previous == BlockId::AIR {
            data.non_air += 1;
        } else if new == BlockId::AIR {
            data.non_air -= 1;
            if data.non_air == 0 {
                data.blocks = None;
            }
        }

        self.registry.get(previous).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().non_air == 0
    }

    /// Number of occupied voxels.
    pub fn occupied(&self) -> usize {
        self.data.read().non_air as usize
    }

    /// Hold this section's read lock for a consistent multi-voxel view.
    pub fn read(&self) -> SectionRead<'_> {
        SectionRead {
            registry: &self.registry,
            data: self.data.read(),
        }
    }

    /// Append this section's payload to `out`. Returns false, writing nothing,
    /// if the section is empty.
    pub fn encode(&self, out: &mut BytesMut) -> bool {
        self.read().encode(out)
    }

    /// Decode a section payload. Names the registry does not know resolve to
    /// its unknown placeholder, or to air when there is none.
    pub fn decode(registry: Arc<BlockStateRegistry>, buf: &mut impl Buf) -> Result<Self, FormatError> {
        let palette_len = format::read_u16(buf)? as usize;
        if palette_len > SECTION_VOLUME {
            return Err(FormatError::PaletteTooLarge(palette_len));
        }

        let mut palette = Vec::with_capacity(palette_len);
        for _ in 0..palette_len {
            let name = format::read_string(buf)?;
            let id = match registry.by_name(&name) {
                Some(state) => state.id(),
                None => {
                    let fallback = registry.unknown();
                    tracing::warn!("Unknown block '{}' in section data, replacing with {:?}", name, fallback);
                    fallback.map_or(BlockId::AIR, BlockState::id)
                }
            };
            palette.push(id);
        }

        let bits = format::read_u16(buf)?;
        if bits == 0 || bits > 16 {
            return Err(FormatError::BitsPerEntry(bits));
        }
        let bits = bits as usize;

        let word_count = packed_len(SECTION_VOLUME, bits);
        format::ensure(buf, word_count * 8)?;
        let mut words = Vec::with_capacity(word_count);
        for _ in 0..word_count {
            words.push(format::read_u64(buf)?);
        }

        let mut indices = vec![0u16; SECTION_VOLUME];
        unpack_indices(&words, bits, &mut indices);

        let mut blocks = Box::new([BlockId::AIR; SECTION_VOLUME]);
        let mut non_air = 0u16;
        for (slot, &idx) in blocks.iter_mut().zip(&indices) {
            if idx == 0 {
                continue;
            }
            let id = *palette.get(idx as usize - 1).ok_or(FormatError::PaletteIndex {
                index: idx as usize,
                len: palette.len(),
            })?;
            if id != BlockId::AIR {
                *slot = id;
                non_air += 1;
            }
        }

        let data = if non_air == 0 {
            SectionData::empty()
        } else {
            SectionData {
                blocks: Some(blocks),
                non_air,
            }
        };

        Ok(Self {
            registry,
            data: RwLock::new(data),
        })
    }
}

/// A section held under its read lock.
pub struct SectionRead<'a> {
    registry: &'a BlockStateRegistry,
    data: RwLockReadGuard<'a, SectionData>,
}

impl SectionRead<'_> {
    pub fn get(&self, x: u8, y: u8, z: u8) -> Option<BlockState> {
        self.registry.get(self.data.get(index(x, y, z))).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.data.non_air == 0
    }

    /// See [`RegionSection::encode`].
    ///
    /// Payload: `u16` palette length, palette names, `u16` bits per entry,
    /// then the packed words. Index 0 is air, index `i + 1` is palette entry `i`.
    pub fn encode(&self, out: &mut BytesMut) -> bool {
        let Some(blocks) = self.data.blocks.as_ref().filter(|_| self.data.non_air > 0) else {
            return false;
        };

        let mut palette: Vec<BlockId> = Vec::new();
        let mut lookup: HashMap<BlockId, u16> = HashMap::new();
        let mut indices = vec![0u16; SECTION_VOLUME];
        for (slot, &id) in indices.iter_mut().zip(blocks.iter()) {
            if id == BlockId::AIR {
                continue;
            }
            *slot = *lookup.entry(id).or_insert_with(|| {
                palette.push(id);
                palette.len() as u16
            });
        }

        out.put_u16(palette.len() as u16);
        for &id in &palette {
            let name = self.registry.get(id).map_or("", BlockState::name);
            format::write_string(out, name);
        }

        let bits = bits_per_entry(palette.len() + 1);
        out.put_u16(bits as u16);
        for word in pack_indices(&indices, bits) {
            out.put_u64(word);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::block::SimpleBlock;

    fn registry() -> (Arc<BlockStateRegistry>, BlockState, BlockState) {
        let mut reg = BlockStateRegistry::new();
        let stone = reg.register(Arc::new(SimpleBlock::new("test:stone")));
        let glass = reg.register(Arc::new(SimpleBlock::new("test:glass")));
        (Arc::new(reg), stone, glass)
    }

    #[test]
    fn set_get_and_emptiness() {
        let (reg, stone, glass) = registry();
        let section = RegionSection::new(reg);
        assert!(section.is_empty());

        assert_eq!(section.set(1, 2, 3, Some(&stone)), None);
        assert_eq!(section.set(1, 2, 3, Some(&glass)), Some(stone.clone()));
        assert_eq!(section.get(1, 2, 3), Some(glass.clone()));
        assert_eq!(section.get(3, 2, 1), None);
        assert!(!section.is_empty());

        assert_eq!(section.set(1, 2, 3, None), Some(glass));
        assert!(section.is_empty());
    }

    #[test]
    fn empty_section_encodes_nothing() {
        let (reg, stone, _) = registry();
        let section = RegionSection::new(reg);
        section.set(0, 0, 0, Some(&stone));
        section.set(0, 0, 0, None);

        let mut out = BytesMut::new();
        assert!(!section.encode(&mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn encode_decode_preserves_voxels() {
        let (reg, stone, glass) = registry();
        let section = RegionSection::new(Arc::clone(&reg));
        section.set(0, 0, 0, Some(&stone));
        section.set(15, 15, 15, Some(&glass));
        section.set(7, 3, 9, Some(&stone));

        let mut out = BytesMut::new();
        assert!(section.encode(&mut out));
        let mut buf = out.freeze();
        let back = RegionSection::decode(reg, &mut buf).unwrap();
        assert!(!buf.has_remaining());

        assert_eq!(back.occupied(), 3);
        assert_eq!(back.get(0, 0, 0), Some(stone.clone()));
        assert_eq!(back.get(15, 15, 15), Some(glass));
        assert_eq!(back.get(7, 3, 9), Some(stone));
        assert_eq!(back.get(1, 1, 1), None);
    }

    #[test]
    fn unknown_names_become_placeholder() {
        let (reg, stone, _) = registry();
        let section = RegionSection::new(reg);
        section.set(4, 4, 4, Some(&stone));
        let mut out = BytesMut::new();
        section.encode(&mut out);

        let mut other = BlockStateRegistry::new();
        let unknown = other.register(Arc::new(SimpleBlock::unknown("test:unknown")));
        let back = RegionSection::decode(Arc::new(other), &mut out.freeze()).unwrap();
        assert_eq!(back.get(4, 4, 4), Some(unknown));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_coordinate_panics() {
        let (reg, _, _) = registry();
        RegionSection::new(reg).get(16, 0, 0);
    }
}
