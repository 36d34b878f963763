// Strongly-typed input graph. Produced by `marshal`, consumed by `tagged`.

use indexmap::IndexMap;

/// Class tag of the one dumped object whose payload is decoded rather than
/// passed through.
pub const TABLE_CLASS: &str = "Table";

/// Runtime type names used when the graph comes from the marshal reader.
pub mod type_names {
    pub const NIL: &str = "NilClass";
    pub const TRUE: &str = "TrueClass";
    pub const FALSE: &str = "FalseClass";
    pub const INTEGER: &str = "Integer";
    pub const FLOAT: &str = "Float";
    pub const STRING: &str = "String";
    pub const BINARY_STRING: &str = "BinaryString";
    pub const SYMBOL: &str = "Symbol";
    pub const ARRAY: &str = "Array";
    pub const HASH: &str = "Hash";
    pub const CLASS: &str = "Class";
    pub const MODULE: &str = "Module";
    pub const REGEXP: &str = "Regexp";
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Symbol(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Scalar { value: Scalar, type_name: String },
    Bytes { data: Vec<u8>, type_name: String },
    Object(Object),
    Mapping { entries: Vec<(Node, Node)>, type_name: String },
    Sequence { items: Vec<Node>, type_name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub class_name: String,
    pub body: ObjectBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectBody {
    /// Named attributes in stream order.
    Attributes(IndexMap<String, Node>),
    /// Opaque payload written by the class's own dump routine.
    Dump(Vec<u8>),
}

impl Node {
    pub fn nil() -> Self {
        Node::scalar(Scalar::Nil, type_names::NIL)
    }
    pub fn bool(value: bool) -> Self {
        let type_name = if value { type_names::TRUE } else { type_names::FALSE };
        Node::scalar(Scalar::Bool(value), type_name)
    }
    pub fn int(value: i64) -> Self {
        Node::scalar(Scalar::Int(value), type_names::INTEGER)
    }
    pub fn float(value: f64) -> Self {
        Node::scalar(Scalar::Float(value), type_names::FLOAT)
    }
    pub fn string(value: impl Into<String>) -> Self {
        Node::scalar(Scalar::Str(value.into()), type_names::STRING)
    }
    pub fn symbol(value: impl Into<String>) -> Self {
        Node::scalar(Scalar::Symbol(value.into()), type_names::SYMBOL)
    }
    pub fn scalar(value: Scalar, type_name: impl Into<String>) -> Self {
        Node::Scalar { value, type_name: type_name.into() }
    }
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Node::Bytes { data: data.into(), type_name: type_names::BINARY_STRING.into() }
    }
    pub fn array(items: Vec<Node>) -> Self {
        Node::Sequence { items, type_name: type_names::ARRAY.into() }
    }
    pub fn hash(entries: Vec<(Node, Node)>) -> Self {
        Node::Mapping { entries, type_name: type_names::HASH.into() }
    }
    pub fn object(class_name: impl Into<String>, attributes: IndexMap<String, Node>) -> Self {
        Node::Object(Object {
            class_name: class_name.into(),
            body: ObjectBody::Attributes(attributes),
        })
    }
    pub fn dumped(class_name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Node::Object(Object {
            class_name: class_name.into(),
            body: ObjectBody::Dump(payload.into()),
        })
    }

    /// The runtime type that produced this node: the class tag for objects,
    /// the scalar or container type name otherwise.
    pub fn type_name(&self) -> &str {
        match self {
            Node::Scalar { type_name, .. }
            | Node::Bytes { type_name, .. }
            | Node::Mapping { type_name, .. }
            | Node::Sequence { type_name, .. } => type_name,
            Node::Object(obj) => &obj.class_name,
        }
    }

    /// Replaces the runtime type name. Objects keep their class tag.
    pub(crate) fn rename(&mut self, name: String) {
        match self {
            Node::Scalar { type_name, .. }
            | Node::Bytes { type_name, .. }
            | Node::Mapping { type_name, .. }
            | Node::Sequence { type_name, .. } => *type_name = name,
            Node::Object(_) => {}
        }
    }
}
