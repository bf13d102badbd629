use crate::err::Error;
use crate::sch::Attribute;
use crate::sch::Kind;
use crate::sch::QUALIFIER_SEPARATOR;
use revision::revisioned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An ordered sequence of typed attributes describing a record layout
#[revisioned(revision = 1)]
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Schema {
	attributes: Vec<Attribute>,
}

impl Schema {
	/// Creates an empty schema
	pub fn new() -> Self {
		Schema::default()
	}

	/// Builds a schema from qualified `(name, kind)` pairs
	pub fn from_fields<I, S>(fields: I) -> Result<Self, Error>
	where
		I: IntoIterator<Item = (S, Kind)>,
		S: Into<String>,
	{
		let mut schema = Schema::new();
		for (name, kind) in fields {
			schema.push(Attribute::new(name, kind))?;
		}
		Ok(schema)
	}

	/// Appends an attribute, rejecting duplicate qualified names
	pub fn push(&mut self, attribute: Attribute) -> Result<(), Error> {
		if self.attributes.iter().any(|a| a.name() == attribute.name()) {
			return Err(Error::DuplicateAttribute {
				name: attribute.name().to_owned(),
			});
		}
		self.attributes.push(attribute);
		Ok(())
	}

	/// The attributes of this schema, in layout order
	pub fn attributes(&self) -> &[Attribute] {
		&self.attributes
	}

	/// The number of attributes
	pub fn len(&self) -> usize {
		self.attributes.len()
	}

	/// Whether the schema has no attributes
	pub fn is_empty(&self) -> bool {
		self.attributes.is_empty()
	}

	/// The fixed byte width of one row
	pub fn row_width(&self) -> u32 {
		self.attributes.iter().map(|a| a.kind().width()).sum()
	}

	/// The byte offset of the attribute at `index` within a row
	pub fn offset_of(&self, index: usize) -> u32 {
		self.attributes[..index].iter().map(|a| a.kind().width()).sum()
	}

	/// Resolves a field name to its attribute index.
	///
	/// Resolution is two-phase: first an exact fully-qualified match, then
	/// a unique match on the unqualified field suffix. A name matching more
	/// than one attribute in the second phase is ambiguous.
	pub fn resolve(&self, name: &str) -> Result<usize, Error> {
		if let Some(idx) = self.attributes.iter().position(|a| a.name() == name) {
			return Ok(idx);
		}
		let mut found = None;
		for (idx, attribute) in self.attributes.iter().enumerate() {
			if attribute.field() == name {
				if found.is_some() {
					return Err(Error::AmbiguousField {
						name: name.to_owned(),
					});
				}
				found = Some(idx);
			}
		}
		found.ok_or_else(|| Error::UnresolvedField {
			name: name.to_owned(),
		})
	}

	/// The attribute a field name resolves to
	pub fn attribute(&self, name: &str) -> Result<&Attribute, Error> {
		self.resolve(name).map(|idx| &self.attributes[idx])
	}

	/// The kind a field name resolves to
	pub fn kind_of(&self, name: &str) -> Result<Kind, Error> {
		self.attribute(name).map(|a| a.kind())
	}

	/// Whether a field name resolves against this schema
	pub fn contains(&self, name: &str) -> bool {
		self.resolve(name).is_ok()
	}

	/// Rewrites the qualifier prefix of every attribute, as done when a
	/// stream is renamed
	pub fn requalify(&mut self, source: &str) {
		for attribute in self.attributes.iter_mut() {
			attribute.requalify(source);
		}
	}

	/// The qualifier shared by all attributes, if there is exactly one
	pub fn sole_qualifier(&self) -> Option<&str> {
		let mut qualifiers = self.attributes.iter().filter_map(|a| a.qualifier());
		let first = qualifiers.next()?;
		qualifiers.all(|q| q == first).then_some(first)
	}

	/// Appends all attributes of another schema, rejecting duplicates
	pub fn extend(&mut self, other: &Schema) -> Result<(), Error> {
		for attribute in other.attributes() {
			self.push(attribute.clone())?;
		}
		Ok(())
	}

	/// Finds the common unqualified suffix between a field of this schema
	/// and a field of another schema, used to align join keys whose names
	/// differ only in their source prefix
	pub fn common_suffix<'a>(&self, other: &Schema, left: &'a str, right: &'a str) -> Option<&'a str> {
		let left_field = left.rsplit(QUALIFIER_SEPARATOR).next()?;
		let right_field = right.rsplit(QUALIFIER_SEPARATOR).next()?;
		if left_field != right_field {
			return None;
		}
		(self.contains(left) && other.contains(right)).then_some(left_field)
	}
}

impl fmt::Display for Schema {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "[")?;
		for (idx, attribute) in self.attributes.iter().enumerate() {
			if idx > 0 {
				write!(f, ", ")?;
			}
			write!(f, "{attribute}")?;
		}
		write!(f, "]")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn schema() -> Schema {
		Schema::from_fields([
			("cars$id", Kind::U32),
			("cars$value", Kind::U64),
			("cars$ts", Kind::U64),
		])
		.unwrap()
	}

	#[test]
	fn resolves_qualified_and_suffix_names() {
		let schema = schema();
		assert_eq!(schema.resolve("cars$id").unwrap(), 0);
		assert_eq!(schema.resolve("value").unwrap(), 1);
		assert!(matches!(
			schema.resolve("speed"),
			Err(Error::UnresolvedField { .. })
		));
	}

	#[test]
	fn suffix_resolution_detects_ambiguity() {
		let mut schema = schema();
		schema.push(Attribute::new("bikes$id", Kind::U32)).unwrap();
		assert!(matches!(schema.resolve("id"), Err(Error::AmbiguousField { .. })));
		// An exact qualified name still resolves
		assert_eq!(schema.resolve("bikes$id").unwrap(), 3);
	}

	#[test]
	fn rejects_duplicate_attributes() {
		let mut schema = schema();
		let duplicate = Attribute::new("cars$id", Kind::U32);
		assert!(matches!(schema.push(duplicate), Err(Error::DuplicateAttribute { .. })));
	}

	#[test]
	fn computes_row_layout() {
		let schema = schema();
		assert_eq!(schema.row_width(), 20);
		assert_eq!(schema.offset_of(0), 0);
		assert_eq!(schema.offset_of(1), 4);
		assert_eq!(schema.offset_of(2), 12);
	}

	#[test]
	fn requalifies_on_rename() {
		let mut schema = schema();
		schema.requalify("vehicles");
		assert!(schema.contains("vehicles$id"));
		assert!(!schema.contains("cars$id"));
	}
}
