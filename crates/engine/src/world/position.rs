/// Absolute block position in the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// The chunk this block belongs to.
    pub const fn chunk(&self) -> ChunkPos {
        ChunkPos {
            x: self.x >> 4,
            z: self.z >> 4,
        }
    }

    /// Position within the chunk (0..16 for x and z, y unchanged).
    pub const fn local(&self) -> LocalBlockPos {
        LocalBlockPos {
            x: (self.x & 0xF) as u8,
            y: self.y,
            z: (self.z & 0xF) as u8,
        }
    }

    pub const fn offset(&self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }

    /// The neighbor across `face`.
    pub const fn advance(&self, face: BlockFace) -> Self {
        let (dx, dy, dz) = face.offset();
        self.offset(dx, dy, dz)
    }

    /// The six cardinal neighbors, in [`BlockFace::ALL`] order.
    pub fn neighbors(&self) -> [BlockPos; 6] {
        BlockFace::ALL.map(|face| self.advance(face))
    }
}

/// Chunk column position (each chunk is 16x16 blocks horizontally).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub const fn block_origin(&self, y: i32) -> BlockPos {
        BlockPos::new(self.x << 4, y, self.z << 4)
    }

    /// Whether `pos` lies in this chunk's column.
    pub const fn contains(&self, pos: BlockPos) -> bool {
        pos.x >> 4 == self.x && pos.z >> 4 == self.z
    }
}

/// Block position local to a chunk (x, z in 0..16, y absolute).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalBlockPos {
    pub x: u8,
    pub y: i32,
    pub z: u8,
}

/// One of the six faces of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockFace {
    North,
    East,
    South,
    West,
    Up,
    Down,
}

impl BlockFace {
    pub const ALL: [BlockFace; 6] = [
        BlockFace::North,
        BlockFace::East,
        BlockFace::South,
        BlockFace::West,
        BlockFace::Up,
        BlockFace::Down,
    ];

    pub const fn opposite(self) -> Self {
        match self {
            BlockFace::North => BlockFace::South,
            BlockFace::East => BlockFace::West,
            BlockFace::South => BlockFace::North,
            BlockFace::West => BlockFace::East,
            BlockFace::Up => BlockFace::Down,
            BlockFace::Down => BlockFace::Up,
        }
    }

    /// Unit step `(dx, dy, dz)` towards this face. North is -z.
    pub const fn offset(self) -> (i32, i32, i32) {
        match self {
            BlockFace::North => (0, 0, -1),
            BlockFace::East => (1, 0, 0),
            BlockFace::South => (0, 0, 1),
            BlockFace::West => (-1, 0, 0),
            BlockFace::Up => (0, 1, 0),
            BlockFace::Down => (0, -1, 0),
        }
    }
}

/// Vertical extent of a world. `height` is a multiple of 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldBounds {
    pub min_y: i32,
    pub height: u32,
}

impl WorldBounds {
    pub const fn new(min_y: i32, height: u32) -> Self {
        Self { min_y, height }
    }

    /// Exclusive upper bound.
    pub const fn max_y(&self) -> i32 {
        self.min_y + self.height as i32
    }

    pub const fn section_count(&self) -> usize {
        (self.height >> 4) as usize
    }

    pub const fn contains_y(&self, y: i32) -> bool {
        y >= self.min_y && y < self.max_y()
    }

    /// Index of the section holding `y`. Caller checks [`Self::contains_y`].
    pub const fn section_index(&self, y: i32) -> usize {
        ((y - self.min_y) >> 4) as usize
    }

    /// Lowest block y of section `index`.
    pub const fn section_base_y(&self, index: usize) -> i32 {
        self.min_y + (index as i32) * 16
    }
}

impl Default for WorldBounds {
    /// The overworld extent: y in -64..320.
    fn default() -> Self {
        Self::new(-64, 384)
    }
}
