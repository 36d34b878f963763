// ————————————————————————————————————————————————————————————————————————————
// TEXT ENCODERS
// ————————————————————————————————————————————————————————————————————————————
//
// JSON: pretty, 4-space indent, keys sorted at every level.
// YAML: block style, insertion order.

use std::io::Write;
use std::path::Path;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::error::EmitError;
use crate::tagged::{Tagged, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Yaml => "yaml",
        }
    }

    /// Picks the format from an output path's extension, if it names one.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(OutputFormat::Json),
            "yaml" | "yml" => Some(OutputFormat::Yaml),
            _ => None,
        }
    }
}

pub fn write_tree<W: Write>(tree: &Tagged, format: OutputFormat, writer: W) -> Result<(), EmitError> {
    match format {
        OutputFormat::Json => write_json(tree, writer),
        OutputFormat::Yaml => write_yaml(tree, writer),
    }
}

pub fn write_json<W: Write>(tree: &Tagged, mut writer: W) -> Result<(), EmitError> {
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut writer, formatter);
    SortedKeys(tree).serialize(&mut ser)?;
    writer.write_all(b"\n")?;
    Ok(())
}

pub fn write_yaml<W: Write>(tree: &Tagged, writer: W) -> Result<(), EmitError> {
    serde_yaml::to_writer(writer, tree)?;
    Ok(())
}

pub fn to_json_string(tree: &Tagged) -> Result<String, EmitError> {
    let mut out = Vec::new();
    write_json(tree, &mut out)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

pub fn to_yaml_string(tree: &Tagged) -> Result<String, EmitError> {
    Ok(serde_yaml::to_string(tree)?)
}

/// Serializes an envelope with every map's keys in lexicographic order.
struct SortedKeys<'a>(&'a Tagged);

struct SortedValue<'a>(&'a Value);

impl Serialize for SortedKeys<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", &self.0.type_name)?;
        map.serialize_entry("value", &SortedValue(&self.0.value))?;
        map.end()
    }
}

impl Serialize for SortedValue<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Value::Map(fields) => {
                let mut entries = fields.iter().collect::<Vec<_>>();
                entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, child) in entries {
                    map.serialize_entry(key, &SortedKeys(child))?;
                }
                map.end()
            }
            Value::Seq(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for child in items {
                    seq.serialize_element(&SortedKeys(child))?;
                }
                seq.end()
            }
            leaf => leaf.serialize(serializer),
        }
    }
}
