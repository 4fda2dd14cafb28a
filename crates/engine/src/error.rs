//! Error types surfaced by the engine.

use crate::world::position::BlockPos;

/// Failures while decoding (or, rarely, encoding) persisted region data.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("negative length {0} in stream")]
    NegativeLength(i32),

    #[error("invalid UTF-8 in block name")]
    InvalidName(#[from] std::string::FromUtf8Error),

    #[error("section palette holds {0} entries, at most 4096 allowed")]
    PaletteTooLarge(usize),

    #[error("bits per entry {0} out of range")]
    BitsPerEntry(u16),

    #[error("palette index {index} out of range for palette of {len}")]
    PaletteIndex { index: usize, len: usize },

    #[error("stream holds {found} sections, world expects {expected}")]
    SectionCount { found: i32, expected: usize },

    #[error("entity record at {pos:?}: {source}")]
    Record {
        pos: BlockPos,
        #[source]
        source: fastnbt::error::Error,
    },
}

/// Why a block could not be placed through [`crate::world::World::place_block`].
#[derive(Debug, thiserror::Error)]
pub enum PlaceError {
    #[error("placement at {0:?} denied by the host")]
    Denied(BlockPos),

    #[error("{0:?} is outside the world's height")]
    OutOfBounds(BlockPos),

    #[error("{0:?} is already occupied")]
    Occupied(BlockPos),

    #[error("tile entity at {pos:?} failed to construct: {cause:#}")]
    Construct { pos: BlockPos, cause: anyhow::Error },
}
