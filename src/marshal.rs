//! Reader for the Marshal 4.8 stream that `.rxdata`/`.rvdata`/`.rvdata2`
//! files are written in.
//!
//! Object links (`@`) are resolved by re-reading the linked object from
//! where it started, so a shared subtree shows up as a copy at every place it
//! is referenced.
use indexmap::IndexMap;
use tracing::{debug, trace, warn};

use crate::error::MarshalError;
use crate::graph::{type_names, Node, Scalar};

pub const MAJOR_VERSION: u8 = 4;
pub const MINOR_VERSION: u8 = 8;
pub const DEFAULT_MAX_DEPTH: usize = 512;
/// Nodes produced in total, links expanded. Keeps link chains that double
/// at every level from growing the tree without bound.
pub const DEFAULT_MAX_NODES: usize = 10_000_000;
/// Stack for threads that read and convert. Unoptimized builds spend a few
/// KiB of stack per nesting level, so `DEFAULT_MAX_DEPTH` needs more than a
/// default 2 MiB thread.
pub const READER_STACK_SIZE: usize = 64 * 1024 * 1024;

// type bytes
const NIL: u8 = b'0';
const TRUE: u8 = b'T';
const FALSE: u8 = b'F';
const FIXNUM: u8 = b'i';
const EXTENDED: u8 = b'e';
const UCLASS: u8 = b'C';
const OBJECT: u8 = b'o';
const USERDEF: u8 = b'u';
const USRMARSHAL: u8 = b'U';
const FLOAT: u8 = b'f';
const BIGNUM: u8 = b'l';
const STRING: u8 = b'"';
const REGEXP: u8 = b'/';
const ARRAY: u8 = b'[';
const HASH: u8 = b'{';
const HASH_DEF: u8 = b'}';
const STRUCT: u8 = b'S';
const MODULE_OLD: u8 = b'M';
const CLASS: u8 = b'c';
const MODULE: u8 = b'm';
const SYMBOL: u8 = b':';
const SYMLINK: u8 = b';';
const IVAR: u8 = b'I';
const LINK: u8 = b'@';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadLimits {
    pub max_depth: usize,
    pub max_nodes: usize,
}

impl Default for LoadLimits {
    fn default() -> Self {
        Self { max_depth: DEFAULT_MAX_DEPTH, max_nodes: DEFAULT_MAX_NODES }
    }
}

/// Reads one marshaled root object.
pub fn load(data: &[u8]) -> Result<Node, MarshalError> {
    load_with_limits(data, LoadLimits::default())
}

pub fn load_with_limits(data: &[u8], limits: LoadLimits) -> Result<Node, MarshalError> {
    let mut reader = Reader::new(data, limits);
    let major = reader.u8()?;
    let minor = reader.u8()?;
    if major != MAJOR_VERSION || minor > MINOR_VERSION {
        return Err(MarshalError::Version { major, minor });
    }
    let root = reader.node()?;
    if reader.remaining() > 0 {
        warn!(trailing = reader.remaining(), "ignoring bytes after the root object");
    }
    debug!(
        symbols = reader.symbols.len(),
        objects = reader.objects.len(),
        nodes = reader.nodes,
        "marshal stream read"
    );
    Ok(root)
}

/// Where a registered object's bytes begin, and whether it has been read
/// completely (links to incomplete objects are cycles).
#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    done: bool,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    symbols: Vec<String>,
    objects: Vec<Span>,
    depth: usize,
    nodes: usize,
    limits: LoadLimits,
    /// Start of the outermost wrapper (`I`, `e`, `C`) around the object
    /// about to be registered.
    wrapper_start: Option<usize>,
    /// Re-reading a linked object: tables are already populated.
    replaying: bool,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], limits: LoadLimits) -> Self {
        Self {
            data,
            pos: 0,
            symbols: Vec::new(),
            objects: Vec::new(),
            depth: 0,
            nodes: 0,
            limits,
            wrapper_start: None,
            replaying: false,
        }
    }

    // ---------------------------- primitives ---------------------------- //

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn u8(&mut self) -> Result<u8, MarshalError> {
        let b = *self.data.get(self.pos).ok_or(MarshalError::UnexpectedEof(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn buf(&mut self, n: usize) -> Result<&'a [u8], MarshalError> {
        if self.remaining() < n {
            return Err(MarshalError::UnexpectedEof(self.data.len()));
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.data[start..start + n])
    }

    /// Packed integer: one length/sign byte, then up to four little-endian bytes.
    fn long(&mut self) -> Result<i64, MarshalError> {
        let c = self.u8()? as i8;
        Ok(match c {
            0 => 0,
            5..=127 => i64::from(c) - 5,
            -128..=-5 => i64::from(c) + 5,
            1..=4 => {
                let mut x: i64 = 0;
                for i in 0..c as u32 {
                    x |= i64::from(self.u8()?) << (8 * i);
                }
                x
            }
            -4..=-1 => {
                let mut x: i64 = -1;
                for i in 0..c.unsigned_abs() as u32 {
                    x &= !(0xffi64 << (8 * i));
                    x |= i64::from(self.u8()?) << (8 * i);
                }
                x
            }
        })
    }

    fn len(&mut self) -> Result<usize, MarshalError> {
        let n = self.long()?;
        usize::try_from(n).map_err(|_| MarshalError::NegativeLength(n))
    }

    fn bytes(&mut self) -> Result<&'a [u8], MarshalError> {
        let n = self.len()?;
        self.buf(n)
    }

    // ------------------------------ tables ------------------------------ //

    fn symbol_body(&mut self) -> Result<String, MarshalError> {
        let name = String::from_utf8_lossy(self.bytes()?).into_owned();
        if !self.replaying {
            self.symbols.push(name.clone());
        }
        Ok(name)
    }

    /// A symbol in name position (class names, attribute names).
    fn symbol(&mut self) -> Result<String, MarshalError> {
        let offset = self.pos;
        match self.u8()? {
            SYMBOL => self.symbol_body(),
            SYMLINK => self.symlink(),
            IVAR => {
                let offset = self.pos;
                match self.u8()? {
                    SYMBOL => {
                        let name = self.symbol_body()?;
                        self.skip_ivars()?;
                        Ok(name)
                    }
                    byte => Err(MarshalError::UnknownType { byte, offset }),
                }
            }
            byte => Err(MarshalError::UnknownType { byte, offset }),
        }
    }

    fn symlink(&mut self) -> Result<String, MarshalError> {
        let index = self.len()?;
        self.symbols.get(index).cloned().ok_or(MarshalError::BadSymbolLink(index))
    }

    fn register(&mut self, type_start: usize) -> usize {
        let start = self.wrapper_start.take().unwrap_or(type_start);
        if self.replaying {
            return usize::MAX;
        }
        self.objects.push(Span { start, done: false });
        self.objects.len() - 1
    }

    fn complete(&mut self, index: usize) {
        if let Some(span) = self.objects.get_mut(index) {
            span.done = true;
        }
    }

    fn link(&mut self) -> Result<Node, MarshalError> {
        let index = self.len()?;
        let span = *self.objects.get(index).ok_or(MarshalError::BadObjectLink(index))?;
        if !span.done {
            return Err(MarshalError::CyclicLink(index));
        }
        trace!(index, start = span.start, "resolving object link");
        let (pos, replaying) = (self.pos, self.replaying);
        self.pos = span.start;
        self.replaying = true;
        let node = self.node();
        self.pos = pos;
        self.replaying = replaying;
        node
    }

    // ------------------------------ objects ----------------------------- //

    fn node(&mut self) -> Result<Node, MarshalError> {
        if self.depth >= self.limits.max_depth {
            return Err(MarshalError::TooDeep(self.limits.max_depth));
        }
        if self.nodes >= self.limits.max_nodes {
            return Err(MarshalError::TooLarge(self.limits.max_nodes));
        }
        self.nodes += 1;
        self.depth += 1;
        let node = self.node_inner();
        self.depth -= 1;
        node
    }

    fn node_inner(&mut self) -> Result<Node, MarshalError> {
        let start = self.pos;
        let node = match self.u8()? {
            NIL => Node::nil(),
            TRUE => Node::bool(true),
            FALSE => Node::bool(false),
            FIXNUM => Node::int(self.long()?),
            SYMBOL => Node::symbol(self.symbol_body()?),
            SYMLINK => Node::symbol(self.symlink()?),
            LINK => self.link()?,
            IVAR => self.ivar(start)?,
            EXTENDED => {
                self.wrapper_start.get_or_insert(start);
                let module = self.symbol()?;
                trace!(module = module.as_str(), "ignoring extended module");
                let node = self.node()?;
                self.wrapper_start = None;
                node
            }
            UCLASS => {
                self.wrapper_start.get_or_insert(start);
                let class_name = self.symbol()?;
                let mut node = self.node()?;
                self.wrapper_start = None;
                node.rename(class_name);
                node
            }
            FLOAT => {
                let index = self.register(start);
                let node = Node::float(parse_float(self.bytes()?)?);
                self.complete(index);
                node
            }
            BIGNUM => {
                let index = self.register(start);
                let node = self.bignum()?;
                self.complete(index);
                node
            }
            STRING => {
                let index = self.register(start);
                let node = Node::bytes(self.bytes()?);
                self.complete(index);
                node
            }
            REGEXP => {
                let index = self.register(start);
                let source = String::from_utf8_lossy(self.bytes()?).into_owned();
                let _options = self.u8()?;
                self.complete(index);
                Node::scalar(Scalar::Str(source), type_names::REGEXP)
            }
            type_byte @ (CLASS | MODULE | MODULE_OLD) => {
                let index = self.register(start);
                let name = String::from_utf8_lossy(self.bytes()?).into_owned();
                self.complete(index);
                let type_name = if type_byte == CLASS { type_names::CLASS } else { type_names::MODULE };
                Node::scalar(Scalar::Str(name), type_name)
            }
            ARRAY => {
                let index = self.register(start);
                let n = self.len()?;
                let mut items = Vec::with_capacity(n.min(self.remaining()));
                for _ in 0..n {
                    items.push(self.node()?);
                }
                self.complete(index);
                Node::array(items)
            }
            byte @ (HASH | HASH_DEF) => {
                let index = self.register(start);
                let n = self.len()?;
                let mut entries = Vec::with_capacity(n.min(self.remaining()));
                for _ in 0..n {
                    let key = self.node()?;
                    let value = self.node()?;
                    entries.push((key, value));
                }
                if byte == HASH_DEF {
                    let default = self.node()?;
                    debug!(default_type = default.type_name(), "dropping hash default value");
                }
                self.complete(index);
                Node::hash(entries)
            }
            OBJECT | STRUCT => {
                let index = self.register(start);
                let class_name = self.symbol()?;
                let attributes = self.attributes()?;
                self.complete(index);
                Node::object(class_name, attributes)
            }
            USERDEF => {
                let class_name = self.symbol()?;
                let index = self.register(start);
                let payload = self.bytes()?.to_vec();
                self.complete(index);
                Node::dumped(class_name, payload)
            }
            USRMARSHAL => {
                let index = self.register(start);
                let class_name = self.symbol()?;
                let loaded = self.node()?;
                self.complete(index);
                let mut attributes = IndexMap::with_capacity(1);
                attributes.insert("marshal_load".to_string(), loaded);
                Node::object(class_name, attributes)
            }
            byte => return Err(MarshalError::UnknownType { byte, offset: start }),
        };
        Ok(node)
    }

    /// `I`: an object followed by instance variables. On strings, an
    /// encoding variable marks the bytes as text.
    fn ivar(&mut self, start: usize) -> Result<Node, MarshalError> {
        self.wrapper_start.get_or_insert(start);
        let mut node = self.node()?;
        // an unregistered inner object (a symbol) leaves the start unclaimed
        self.wrapper_start = None;

        let n = self.len()?;
        let mut encoded = false;
        for _ in 0..n {
            let key = self.symbol()?;
            let value = self.node()?;
            match key.as_str() {
                "E" | "encoding" => encoded = true,
                _ => trace!(key = key.as_str(), value_type = value.type_name(), "ignoring instance variable"),
            }
        }
        if encoded {
            if let Node::Bytes { data, type_name } = &node {
                let text = String::from_utf8_lossy(data).into_owned();
                let type_name = if type_name == type_names::BINARY_STRING {
                    type_names::STRING.to_string()
                } else {
                    type_name.clone()
                };
                node = Node::scalar(Scalar::Str(text), type_name);
            }
        }
        Ok(node)
    }

    fn attributes(&mut self) -> Result<IndexMap<String, Node>, MarshalError> {
        let n = self.len()?;
        let mut attributes = IndexMap::with_capacity(n.min(self.remaining()));
        for _ in 0..n {
            let name = self.symbol()?;
            let value = self.node()?;
            attributes.insert(name, value);
        }
        Ok(attributes)
    }

    fn skip_ivars(&mut self) -> Result<(), MarshalError> {
        let n = self.len()?;
        for _ in 0..n {
            self.symbol()?;
            self.node()?;
        }
        Ok(())
    }

    /// Sign byte, length in 16-bit words, little-endian magnitude.
    fn bignum(&mut self) -> Result<Node, MarshalError> {
        let negative = self.u8()? == b'-';
        let words = self.len()?;
        let magnitude = self.buf(words.saturating_mul(2))?;
        let significant = magnitude.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);

        if significant <= 8 {
            let mut raw = [0u8; 8];
            raw[..significant].copy_from_slice(&magnitude[..significant]);
            let value = u64::from_le_bytes(raw);
            let signed = if negative {
                0i64.checked_sub_unsigned(value)
            } else {
                i64::try_from(value).ok()
            };
            if let Some(i) = signed {
                return Ok(Node::int(i));
            }
        }
        // wider than i64: keep the magnitude, lose the low digits
        let approx = magnitude.iter().rev().fold(0f64, |acc, &b| acc * 256.0 + f64::from(b));
        Ok(Node::scalar(
            Scalar::Float(if negative { -approx } else { approx }),
            type_names::INTEGER,
        ))
    }
}

fn parse_float(raw: &[u8]) -> Result<f64, MarshalError> {
    // old writers append mantissa bytes after a NUL
    let raw = raw.split(|&b| b == 0).next().unwrap_or_default();
    let text = String::from_utf8_lossy(raw);
    match text.as_ref() {
        "inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        "nan" => Ok(f64::NAN),
        other => other.parse::<f64>().map_err(|_| MarshalError::BadFloat(other.to_string())),
    }
}
