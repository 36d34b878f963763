//! Graph → tagged tree.
//!
//! Every node of the output is a `{value, type}` envelope where `type` names
//! the runtime type of the *input* node. Container children are wrapped one
//! by one, and the wrapper is always applied by whoever assembles the
//! surrounding container, so no node is ever wrapped twice.
//!
//! The walk keeps its own stack of open containers instead of recursing,
//! so graph depth is bounded by heap, not by the thread's stack.
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::{ConvertError, TableDecodeError};
use crate::graph::{type_names, Node, Object, ObjectBody, Scalar, TABLE_CLASS};
use crate::table::{decode_table, TableByteOrder, TileTable, DEFAULT_TABLE_BYTE_ORDER};

// ————————————————————————————————————————————————————————————————————————————
// TYPES
// ————————————————————————————————————————————————————————————————————————————

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tagged {
    pub value: Value,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Map(IndexMap<String, Tagged>),
    Seq(Vec<Tagged>),
    /// Decoded table cells. Leaf data, not a graph node.
    Grid(Vec<Vec<u16>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertOptions {
    pub table_byte_order: TableByteOrder,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self { table_byte_order: DEFAULT_TABLE_BYTE_ORDER }
    }
}

impl Tagged {
    pub fn new(value: Value, type_name: impl Into<String>) -> Self {
        Self { value, type_name: type_name.into() }
    }
}

impl From<&Scalar> for Value {
    fn from(scalar: &Scalar) -> Self {
        match scalar {
            Scalar::Nil => Value::Nil,
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(i) => Value::Int(*i),
            Scalar::Float(f) => Value::Float(*f),
            Scalar::Str(s) | Scalar::Symbol(s) => Value::Str(s.clone()),
        }
    }
}

// ————————————————————————————————————————————————————————————————————————————
// TRANSFORM
// ————————————————————————————————————————————————————————————————————————————

/// Converts a whole graph. The root is wrapped with its own type name.
pub fn convert(root: &Node, options: &ConvertOptions) -> Result<Tagged, ConvertError> {
    debug!(root_type = root.type_name(), "converting graph");
    let mut stack = match visit(root, options) {
        Ok(Step::Done(tagged)) => return Ok(tagged),
        Ok(Step::Descend(frame)) => vec![frame],
        Err(failure) => return Err(failure.at(&[], &Slot::Root)),
    };

    while let Some(frame) = stack.last_mut() {
        let next = frame.next_child();
        match next {
            Ok(Some((slot, child))) => match visit(child, options) {
                Ok(Step::Done(tagged)) => {
                    if let Err(failure) = frame.push(slot.clone(), tagged) {
                        return Err(failure.at(&stack, &slot));
                    }
                }
                Ok(Step::Descend(mut child_frame)) => {
                    child_frame.slot = slot;
                    stack.push(child_frame);
                }
                Err(failure) => return Err(failure.at(&stack, &slot)),
            },
            Ok(None) => {
                let Some(done) = stack.pop() else { break };
                let slot = done.slot.clone();
                let tagged = done.finish();
                match stack.last_mut() {
                    None => return Ok(tagged),
                    Some(parent) => {
                        if let Err(failure) = parent.push(slot.clone(), tagged) {
                            return Err(failure.at(&stack, &slot));
                        }
                    }
                }
            }
            Err(failure) => {
                let slot = frame.slot.clone();
                let parents = &stack[..stack.len() - 1];
                return Err(failure.at(parents, &slot));
            }
        }
    }
    unreachable!("the root frame returns its envelope before the stack drains")
}

/// Leaf nodes, tables and dumped objects are finished on the spot; other
/// containers open a frame whose children are visited later.
enum Step<'a> {
    Done(Tagged),
    Descend(Frame<'a>),
}

fn visit<'a>(node: &'a Node, options: &ConvertOptions) -> Result<Step<'a>, Failure> {
    let step = match node {
        Node::Scalar { value, type_name } => Step::Done(Tagged::new(value.into(), type_name)),
        Node::Bytes { data, type_name } => {
            Step::Done(Tagged::new(Value::Str(debug_bytes(data)), type_name))
        }
        Node::Object(Object { class_name, body }) if class_name == TABLE_CLASS => {
            let ObjectBody::Dump(payload) = body else {
                return Err(Failure::Table(TableDecodeError::MissingPayload));
            };
            let table = decode_table(payload, options.table_byte_order).map_err(Failure::Table)?;
            Step::Done(tag_table(table, class_name))
        }
        Node::Object(Object { class_name, body: ObjectBody::Dump(payload) }) => {
            Step::Done(Tagged::new(Value::Str(debug_bytes(payload)), class_name))
        }
        Node::Object(Object { class_name, body: ObjectBody::Attributes(attributes) }) => {
            Step::Descend(Frame::new(
                class_name,
                Children::Attributes(attributes.iter()),
                Inner::Map(IndexMap::with_capacity(attributes.len())),
            ))
        }
        Node::Mapping { entries, type_name } => Step::Descend(Frame::new(
            type_name,
            Children::Entries(entries.iter()),
            Inner::Map(IndexMap::with_capacity(entries.len())),
        )),
        Node::Sequence { items, type_name } => Step::Descend(Frame::new(
            type_name,
            Children::Items(items.iter().enumerate()),
            Inner::Seq(Vec::with_capacity(items.len())),
        )),
    };
    Ok(step)
}

/// Wraps a decoded table and each of its fields.
fn tag_table(table: TileTable, type_name: &str) -> Tagged {
    trace!(dim = table.dim, rows = table.data.len(), "tagging table");
    let int = |v: i32| Tagged::new(Value::Int(v.into()), type_names::INTEGER);
    let mut fields = IndexMap::with_capacity(6);
    fields.insert("dim".to_string(), int(table.dim));
    fields.insert("x".to_string(), int(table.x));
    fields.insert("y".to_string(), int(table.y));
    fields.insert("z".to_string(), int(table.z));
    fields.insert("unknown".to_string(), int(table.unknown));
    fields.insert("data".to_string(), Tagged::new(Value::Grid(table.data), type_names::ARRAY));
    Tagged::new(Value::Map(fields), type_name)
}

/// Escaped byte-string literal, e.g. `b"\x00\x01"`. One-way.
pub fn debug_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + 3);
    out.push_str("b\"");
    for &byte in data {
        out.extend(std::ascii::escape_default(byte).map(char::from));
    }
    out.push('"');
    out
}

/// Text form of a mapping key. Containers have none.
fn key_text(key: &Node) -> Result<String, Failure> {
    match key {
        Node::Scalar { value, .. } => Ok(match value {
            Scalar::Nil => "nil".to_string(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(i) => i.to_string(),
            // `1.0` stays distinct from the integer key `1`
            Scalar::Float(f) => format!("{f:?}"),
            Scalar::Str(s) | Scalar::Symbol(s) => s.clone(),
        }),
        Node::Bytes { data, .. } => Ok(debug_bytes(data)),
        other => Err(Failure::Unsupported(format!(
            "mapping key of type {} has no text form",
            other.type_name()
        ))),
    }
}

// ————————————————————————————————————————————————————————————————————————————
// WORK STACK
// ————————————————————————————————————————————————————————————————————————————

/// Where a finished child lands in its parent.
#[derive(Debug, Clone)]
enum Slot {
    Root,
    Key(String),
    Index(usize),
}

enum Children<'a> {
    Attributes(indexmap::map::Iter<'a, String, Node>),
    Entries(std::slice::Iter<'a, (Node, Node)>),
    Items(std::iter::Enumerate<std::slice::Iter<'a, Node>>),
}

enum Inner {
    Map(IndexMap<String, Tagged>),
    Seq(Vec<Tagged>),
}

struct Frame<'a> {
    type_name: &'a str,
    slot: Slot,
    children: Children<'a>,
    inner: Inner,
}

impl<'a> Frame<'a> {
    fn new(type_name: &'a str, children: Children<'a>, inner: Inner) -> Self {
        Self { type_name, slot: Slot::Root, children, inner }
    }

    fn next_child(&mut self) -> Result<Option<(Slot, &'a Node)>, Failure> {
        Ok(match &mut self.children {
            Children::Attributes(it) => it.next().map(|(name, child)| (Slot::Key(name.clone()), child)),
            Children::Entries(it) => match it.next() {
                Some((key, child)) => Some((Slot::Key(key_text(key)?), child)),
                None => None,
            },
            Children::Items(it) => it.next().map(|(i, child)| (Slot::Index(i), child)),
        })
    }

    fn push(&mut self, slot: Slot, tagged: Tagged) -> Result<(), Failure> {
        match (&mut self.inner, slot) {
            (Inner::Map(map), Slot::Key(key)) => {
                if map.contains_key(&key) {
                    return Err(Failure::Unsupported(format!("duplicate mapping key {key:?}")));
                }
                map.insert(key, tagged);
            }
            (Inner::Seq(items), _) => items.push(tagged),
            (Inner::Map(_), _) => unreachable!("mapping children always carry a key"),
        }
        Ok(())
    }

    fn finish(self) -> Tagged {
        let value = match self.inner {
            Inner::Map(map) => Value::Map(map),
            Inner::Seq(items) => Value::Seq(items),
        };
        Tagged::new(value, self.type_name)
    }
}

/// An error before the tree path is known.
enum Failure {
    Unsupported(String),
    Table(TableDecodeError),
}

impl Failure {
    fn at(self, frames: &[Frame<'_>], last: &Slot) -> ConvertError {
        let path = render_path(frames.iter().map(|f| &f.slot).chain([last]));
        match self {
            Failure::Unsupported(reason) => ConvertError::UnsupportedInputFormat { path, reason },
            Failure::Table(source) => ConvertError::Table { path, source },
        }
    }
}

fn render_path<'s>(slots: impl Iterator<Item = &'s Slot>) -> String {
    let mut path = String::from("$");
    for slot in slots {
        match slot {
            Slot::Root => {}
            Slot::Key(key) if needs_quoting(key) => path.push_str(&format!("[{key:?}]")),
            Slot::Key(key) => {
                path.push('.');
                path.push_str(key);
            }
            Slot::Index(i) => path.push_str(&format!("[{i}]")),
        }
    }
    path
}

fn needs_quoting(key: &str) -> bool {
    key.is_empty() || key.chars().any(|c| matches!(c, '.' | '[' | ']' | '"') || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: Vec<(&str, Node)>) -> IndexMap<String, Node> {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn table_bytes(header: [i32; 5], cells: &[u16]) -> Vec<u8> {
        let mut out = Vec::new();
        for h in header {
            out.extend_from_slice(&h.to_le_bytes());
        }
        for c in cells {
            out.extend_from_slice(&c.to_le_bytes());
        }
        out
    }

    fn run(node: &Node) -> Tagged {
        convert(node, &ConvertOptions::default()).unwrap()
    }

    /// Walks every envelope reachable through containers.
    fn assert_tagged_once(tagged: &Tagged) {
        let mut pending = vec![tagged];
        while let Some(t) = pending.pop() {
            assert!(!t.type_name.is_empty());
            match &t.value {
                Value::Map(map) => pending.extend(map.values()),
                Value::Seq(items) => pending.extend(items.iter()),
                _ => {}
            }
        }
    }

    #[test]
    fn scalars_keep_their_value() {
        assert_eq!(run(&Node::int(42)), Tagged::new(Value::Int(42), "Integer"));
        assert_eq!(run(&Node::float(1.5)), Tagged::new(Value::Float(1.5), "Float"));
        assert_eq!(run(&Node::bool(true)), Tagged::new(Value::Bool(true), "TrueClass"));
        assert_eq!(run(&Node::nil()), Tagged::new(Value::Nil, "NilClass"));
    }

    #[test]
    fn attribute_order_is_preserved() {
        let node = Node::object(
            "RPG::Actor",
            attrs(vec![("@c", Node::int(3)), ("@a", Node::int(1)), ("@b", Node::int(2))]),
        );
        let tagged = run(&node);
        assert_eq!(tagged.type_name, "RPG::Actor");
        let Value::Map(map) = &tagged.value else { panic!("expected a map") };
        assert_eq!(map.keys().collect::<Vec<_>>(), ["@c", "@a", "@b"]);
        assert_eq!(map["@a"], Tagged::new(Value::Int(1), "Integer"));
    }

    #[test]
    fn nested_children_are_wrapped_exactly_once() {
        let node = Node::object(
            "RPG::Map",
            attrs(vec![
                ("@events", Node::hash(vec![(Node::int(1), Node::array(vec![Node::string("x")]))])),
                ("@bgm", Node::nil()),
            ]),
        );
        let tagged = run(&node);
        assert_tagged_once(&tagged);

        let Value::Map(map) = &tagged.value else { panic!("expected a map") };
        let events = &map["@events"];
        assert_eq!(events.type_name, "Hash");
        let Value::Map(events) = &events.value else { panic!("expected a map") };
        let list = &events["1"];
        assert_eq!(list.type_name, "Array");
        assert_eq!(list.value, Value::Seq(vec![Tagged::new(Value::Str("x".into()), "String")]));
    }

    #[test]
    fn empty_containers_stay_wrapped() {
        assert_eq!(
            run(&Node::object("RPG::Empty", IndexMap::new())),
            Tagged::new(Value::Map(IndexMap::new()), "RPG::Empty")
        );
        assert_eq!(run(&Node::array(vec![])), Tagged::new(Value::Seq(vec![]), "Array"));
        assert_eq!(run(&Node::hash(vec![])), Tagged::new(Value::Map(IndexMap::new()), "Hash"));
    }

    #[test]
    fn bytes_become_debug_text() {
        let tagged = run(&Node::array(vec![Node::bytes(vec![0u8, 1])]));
        assert_eq!(
            tagged.value,
            Value::Seq(vec![Tagged::new(Value::Str(r#"b"\x00\x01""#.into()), "BinaryString")])
        );
    }

    #[test]
    fn table_is_decoded_and_field_tagged() {
        let node = Node::object(
            "RPG::Map",
            attrs(vec![("@data", Node::dumped("Table", table_bytes([2, 3, 2, 1, 0], &[1, 2, 3, 4, 5, 6])))]),
        );
        let tagged = run(&node);
        let Value::Map(map) = &tagged.value else { panic!("expected a map") };
        let table = &map["@data"];
        assert_eq!(table.type_name, "Table");
        let Value::Map(fields) = &table.value else { panic!("expected table fields") };
        assert_eq!(
            fields.keys().collect::<Vec<_>>(),
            ["dim", "x", "y", "z", "unknown", "data"]
        );
        assert_eq!(fields["dim"], Tagged::new(Value::Int(2), "Integer"));
        assert_eq!(
            fields["data"],
            Tagged::new(Value::Grid(vec![vec![1, 2, 3], vec![4, 5, 6]]), "Array")
        );
    }

    #[test]
    fn truncated_table_fails_with_its_path() {
        let node = Node::object(
            "RPG::Map",
            attrs(vec![(
                "@layers",
                Node::array(vec![Node::nil(), Node::dumped("Table", table_bytes([2, 3, 2, 1, 0], &[1]))]),
            )]),
        );
        let err = convert(&node, &ConvertOptions::default()).unwrap_err();
        match err {
            ConvertError::Table { path, source } => {
                assert_eq!(path, "$.@layers[1]");
                assert_eq!(source, TableDecodeError::Truncated { expected: 32, actual: 22 });
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn table_with_attributes_is_missing_its_payload() {
        let err = convert(&Node::object("Table", IndexMap::new()), &ConvertOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            ConvertError::Table { source: TableDecodeError::MissingPayload, .. }
        ));
    }

    #[test]
    fn other_dumped_objects_pass_through_as_bytes() {
        let tagged = run(&Node::dumped("Color", vec![0xffu8, b'a']));
        assert_eq!(tagged, Tagged::new(Value::Str(r#"b"\xffa""#.into()), "Color"));
    }

    #[test]
    fn mapping_keys_render_as_text() {
        let tagged = run(&Node::hash(vec![
            (Node::symbol("name"), Node::int(1)),
            (Node::int(-4), Node::int(2)),
            (Node::nil(), Node::int(3)),
        ]));
        let Value::Map(map) = &tagged.value else { panic!("expected a map") };
        assert_eq!(map.keys().collect::<Vec<_>>(), ["name", "-4", "nil"]);
    }

    #[test]
    fn colliding_keys_are_rejected() {
        let node = Node::hash(vec![(Node::int(1), Node::nil()), (Node::string("1"), Node::nil())]);
        let err = convert(&node, &ConvertOptions::default()).unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedInputFormat { ref path, .. } if path == "$.1"));
    }

    #[test]
    fn float_keys_keep_their_fraction() {
        let node = Node::hash(vec![
            (Node::int(1), Node::string("int")),
            (Node::float(1.0), Node::string("float")),
            (Node::float(2.5), Node::nil()),
        ]);
        let root = run(&node);
        let Value::Map(fields) = &root.value else { panic!("expected a map") };
        assert_eq!(fields.keys().collect::<Vec<_>>(), ["1", "1.0", "2.5"]);
        assert_eq!(fields["1.0"].value, Value::Str("float".into()));
    }

    #[test]
    fn error_paths_quote_keys_with_separators() {
        let bad = Node::hash(vec![(Node::array(vec![]), Node::nil())]);
        let node = Node::object(
            "Holder",
            attrs(vec![(
                "@h",
                Node::hash(vec![(Node::string("a.b"), Node::hash(vec![(Node::string("c[0]"), bad)]))]),
            )]),
        );
        let err = convert(&node, &ConvertOptions::default()).unwrap_err();
        assert!(
            matches!(err, ConvertError::UnsupportedInputFormat { ref path, .. } if path == r#"$.@h["a.b"]["c[0]"]"#),
            "{err}"
        );
    }

    #[test]
    fn container_keys_are_rejected() {
        let node = Node::object(
            "Holder",
            attrs(vec![("@h", Node::hash(vec![(Node::array(vec![]), Node::nil())]))]),
        );
        let err = convert(&node, &ConvertOptions::default()).unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedInputFormat { ref path, .. } if path == "$.@h"));
    }

    #[test]
    fn deep_graphs_do_not_recurse() {
        let mut node = Node::int(0);
        for _ in 0..50_000 {
            node = Node::array(vec![node]);
        }
        let root = run(&node);
        let mut tagged = &root;
        let mut depth = 0;
        while let Value::Seq(items) = &tagged.value {
            tagged = &items[0];
            depth += 1;
        }
        assert_eq!(depth, 50_000);
        assert_eq!(tagged.value, Value::Int(0));
        // drop glue recurses, so leak both trees instead
        std::mem::forget(root);
        std::mem::forget(node);
    }
}
