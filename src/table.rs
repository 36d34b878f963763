//! Tile table decoder.
//!
//! Layout of a dumped `Table` payload:
//!
//! ```text
//! offset 0  : i32 dim
//! offset 4  : i32 x
//! offset 8  : i32 y
//! offset 12 : i32 z
//! offset 16 : i32 unknown
//! offset 20 : y*z rows of x u16 cells, replayed in buffer order
//! ```
use tracing::trace;

use crate::error::TableDecodeError;

pub const HEADER_LEN: usize = 20;
pub const TILE_SIZE: usize = 2;

/// Byte order of the integers inside a table payload. Fixed per file family,
/// never sniffed from the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TableByteOrder {
    #[default]
    Little,
    Big,
    Native,
}

/// The runtime that writes `.rvdata`/`.rvdata2` files dumps tables little-endian.
pub const DEFAULT_TABLE_BYTE_ORDER: TableByteOrder = TableByteOrder::Little;

/// A decoded table. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileTable {
    pub dim: i32,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub unknown: i32,
    /// Exactly `y * z` rows of exactly `x` cells.
    pub data: Vec<Vec<u16>>,
}

impl TableByteOrder {
    fn i32(self, b: [u8; 4]) -> i32 {
        match self {
            TableByteOrder::Little => i32::from_le_bytes(b),
            TableByteOrder::Big => i32::from_be_bytes(b),
            TableByteOrder::Native => i32::from_ne_bytes(b),
        }
    }
    fn u16(self, b: [u8; 2]) -> u16 {
        match self {
            TableByteOrder::Little => u16::from_le_bytes(b),
            TableByteOrder::Big => u16::from_be_bytes(b),
            TableByteOrder::Native => u16::from_ne_bytes(b),
        }
    }
}

/// Total payload length a header declares, or `None` if it overflows.
pub fn expected_len(x: usize, y: usize, z: usize) -> Option<usize> {
    x.checked_mul(y)?
        .checked_mul(z)?
        .checked_mul(TILE_SIZE)?
        .checked_add(HEADER_LEN)
}

pub fn decode_table(buf: &[u8], order: TableByteOrder) -> Result<TileTable, TableDecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(TableDecodeError::Truncated { expected: HEADER_LEN, actual: buf.len() });
    }
    let word = |i: usize| order.i32([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
    let (dim, x, y, z, unknown) = (word(0), word(4), word(8), word(12), word(16));

    if x <= 0 || y <= 0 || z <= 0 {
        return Err(TableDecodeError::InvalidDimensions { x, y, z });
    }
    // positive i32 always fits usize on supported targets
    let (cols, y_len, z_len) = (x as usize, y as usize, z as usize);
    let expected = expected_len(cols, y_len, z_len).unwrap_or(usize::MAX);
    if buf.len() < expected {
        return Err(TableDecodeError::Truncated { expected, actual: buf.len() });
    }
    trace!(dim, x, y, z, unknown, trailing = buf.len() - expected, "table header");

    let row_len = cols * TILE_SIZE;
    let data = buf[HEADER_LEN..expected]
        .chunks_exact(row_len)
        .map(|row| {
            row.chunks_exact(TILE_SIZE)
                .map(|cell| order.u16([cell[0], cell[1]]))
                .collect::<Vec<u16>>()
        })
        .collect::<Vec<_>>();
    debug_assert_eq!(data.len(), y_len * z_len);

    Ok(TileTable { dim, x, y, z, unknown, data })
}
