//! Typed record layout and attribute qualification.
//!
//! A [`Schema`] is an ordered sequence of typed attributes. Every attribute
//! carries a fully-qualified `source$field` name; names within one schema
//! are unique after full qualification. Rows are fixed-width; the per-kind
//! byte widths determine the field offsets used by the execution IR.

pub(crate) mod attribute;
pub(crate) mod kind;
pub(crate) mod schema;
pub(crate) mod value;

pub use attribute::Attribute;
pub use kind::Kind;
pub use schema::Schema;
pub use value::Value;

/// The character separating the source qualifier from the field name
pub const QUALIFIER_SEPARATOR: char = '$';
