//! Error taxonomy for the marshal → tagged-tree pipeline.
use thiserror::Error;

/// Failure while turning an object graph into a tagged tree.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// The graph contains something the transform has no tagged shape for.
    #[error("unsupported input format at {path}: {reason}")]
    UnsupportedInputFormat { path: String, reason: String },

    /// A `Table` object whose payload failed validation. Fatal for the whole
    /// conversion.
    #[error("invalid Table at {path}: {source}")]
    Table {
        path: String,
        #[source]
        source: TableDecodeError,
    },

    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableDecodeError {
    #[error("buffer truncated: expected {expected} bytes, found {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("non-positive dimensions x={x} y={y} z={z}")]
    InvalidDimensions { x: i32, y: i32, z: i32 },
    #[error("object carries named attributes instead of a dumped payload")]
    MissingPayload,
}

/// Failure while reading the marshal byte stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarshalError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEof(usize),
    #[error("unsupported marshal version {major}.{minor}")]
    Version { major: u8, minor: u8 },
    #[error("unknown type byte {byte:#04x} at offset {offset}")]
    UnknownType { byte: u8, offset: usize },
    #[error("symbol link {0} out of range")]
    BadSymbolLink(usize),
    #[error("object link {0} out of range")]
    BadObjectLink(usize),
    #[error("object link {0} refers to an object still being read (cyclic graph)")]
    CyclicLink(usize),
    #[error("invalid float literal {0:?}")]
    BadFloat(String),
    #[error("negative length {0}")]
    NegativeLength(i64),
    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),
    #[error("more than {0} nodes once object links are expanded")]
    TooLarge(usize),
}

/// Failure of a text encoder or its sink.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to encode YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
