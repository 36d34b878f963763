//! Converts marshaled game data (`.rxdata`, `.rvdata`, `.rvdata2`) into a
//! tree where every node is a `{value, type}` envelope naming the runtime
//! type it came from. `Table` payloads are decoded into tile grids; other
//! dumped objects pass through as escaped byte strings.
//!
//! Converting a tree back into marshaled data is not implemented.
pub mod cli;
pub mod emit;
pub mod error;
pub mod graph;
pub mod marshal;
pub mod table;
pub mod tagged;

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

pub use error::{ConvertError, EmitError, MarshalError, TableDecodeError};
pub use graph::Node;
pub use tagged::{convert, ConvertOptions, Tagged, Value};

/// Reads a marshal stream and converts its root object.
pub fn convert_bytes(data: &[u8], options: &ConvertOptions) -> Result<Tagged, ConvertError> {
    let graph = marshal::load(data)?;
    tagged::convert(&graph, options)
}

pub fn convert_file(path: &Path, options: &ConvertOptions) -> Result<Tagged> {
    let data = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    debug!(path = %path.display(), bytes = data.len(), "read input");
    convert_bytes(&data, options).with_context(|| format!("failed to convert {}", path.display()))
}
