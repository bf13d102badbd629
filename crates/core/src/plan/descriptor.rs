use crate::sch::Schema;
use revision::revisioned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A tagged configuration value carried by source and sink descriptors.
///
/// Config maps are stored as ordered pairs so that re-encoding a decoded
/// descriptor iterates entries in insertion order.
#[revisioned(revision = 1)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ConfigValue {
	I32(i32),
	U32(u32),
	Bool(bool),
	Char(char),
	F32(f32),
	F64(f64),
	Str(String),
	Enum {
		value: String,
	},
}

impl fmt::Display for ConfigValue {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			ConfigValue::I32(v) => write!(f, "{v}"),
			ConfigValue::U32(v) => write!(f, "{v}"),
			ConfigValue::Bool(v) => write!(f, "{v}"),
			ConfigValue::Char(v) => write!(f, "{v}"),
			ConfigValue::F32(v) => write!(f, "{v}"),
			ConfigValue::F64(v) => write!(f, "{v}"),
			ConfigValue::Str(v) => write!(f, "{v}"),
			ConfigValue::Enum {
				value,
			} => write!(f, "{value}"),
		}
	}
}

/// One entry of an ordered descriptor config map
#[revisioned(revision = 1)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
	pub key: String,
	pub value: ConfigValue,
}

/// How raw source payloads are split into tuples and fields
#[revisioned(revision = 1)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParserConfig {
	pub parser_type: String,
	pub tuple_delimiter: String,
	pub field_delimiter: String,
}

impl Default for ParserConfig {
	fn default() -> Self {
		ParserConfig {
			parser_type: "CSV".to_owned(),
			tuple_delimiter: "\n".to_owned(),
			field_delimiter: ",".to_owned(),
		}
	}
}

/// The physical transport a source reads from
#[revisioned(revision = 1)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum SourceType {
	Csv,
	Tcp,
	Mqtt,
	Generator,
}

/// Describes a stream source; the physical driver lives outside the core
#[revisioned(revision = 1)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
	pub logical_source: String,
	pub source_type: SourceType,
	pub schema: Schema,
	pub parser: ParserConfig,
	pub config: Vec<ConfigEntry>,
}

impl SourceDescriptor {
	/// A descriptor for a named logical source with the given schema
	pub fn new(logical_source: impl Into<String>, source_type: SourceType, schema: Schema) -> Self {
		SourceDescriptor {
			logical_source: logical_source.into(),
			source_type,
			schema,
			parser: ParserConfig::default(),
			config: Vec::new(),
		}
	}

	/// Appends a configuration entry, preserving insertion order
	pub fn with_config(mut self, key: impl Into<String>, value: ConfigValue) -> Self {
		self.config.push(ConfigEntry {
			key: key.into(),
			value,
		});
		self
	}
}

/// The physical transport a sink writes to
#[revisioned(revision = 1)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum SinkType {
	Print,
	File,
	Tcp,
	Null,
}

/// Describes a stream sink; the physical driver lives outside the core
#[revisioned(revision = 1)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SinkDescriptor {
	pub sink_type: SinkType,
	pub add_timestamp: bool,
	pub config: Vec<ConfigEntry>,
}

impl SinkDescriptor {
	pub fn new(sink_type: SinkType) -> Self {
		SinkDescriptor {
			sink_type,
			add_timestamp: false,
			config: Vec::new(),
		}
	}
}

/// A user-defined function applied by a map or flat-map operator.
///
/// The payload bytes are opaque to the core; execution dispatches through a
/// proxy trampoline registered under `symbol`.
#[revisioned(revision = 1)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UdfDescriptor {
	pub symbol: String,
	pub payload: Vec<u8>,
	pub output_schema: Schema,
}
