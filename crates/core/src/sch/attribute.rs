use crate::sch::Kind;
use crate::sch::QUALIFIER_SEPARATOR;
use revision::revisioned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single named and typed attribute of a schema
#[revisioned(revision = 1)]
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Attribute {
	pub(crate) name: String,
	pub(crate) kind: Kind,
}

impl Attribute {
	/// Creates an attribute from an already qualified name
	pub fn new(name: impl Into<String>, kind: Kind) -> Self {
		Attribute {
			name: name.into(),
			kind,
		}
	}

	/// Creates an attribute qualified with a source name
	pub fn qualified(source: &str, field: &str, kind: Kind) -> Self {
		Attribute {
			name: format!("{source}{QUALIFIER_SEPARATOR}{field}"),
			kind,
		}
	}

	/// The fully-qualified attribute name
	pub fn name(&self) -> &str {
		&self.name
	}

	/// The attribute kind
	pub fn kind(&self) -> Kind {
		self.kind
	}

	/// The qualifier prefix, if the name is qualified
	pub fn qualifier(&self) -> Option<&str> {
		self.name.split_once(QUALIFIER_SEPARATOR).map(|(q, _)| q)
	}

	/// The field name without its qualifier
	pub fn field(&self) -> &str {
		self.name.split_once(QUALIFIER_SEPARATOR).map_or(self.name.as_str(), |(_, f)| f)
	}

	/// Whether a possibly unqualified name refers to this attribute
	pub fn matches(&self, name: &str) -> bool {
		self.name == name || self.field() == name
	}

	/// Replaces the qualifier prefix, qualifying the name if it was bare
	pub(crate) fn requalify(&mut self, source: &str) {
		self.name = format!("{source}{QUALIFIER_SEPARATOR}{}", self.field());
	}
}

impl fmt::Display for Attribute {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}: {}", self.name, self.kind)
	}
}
