use revision::revisioned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The wire type of a single attribute
#[revisioned(revision = 1)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Kind {
	Bool,
	I8,
	I16,
	I32,
	I64,
	U8,
	U16,
	U32,
	U64,
	F32,
	F64,
	/// A character field with a fixed byte length
	FixedChar(u32),
	/// A character field stored out of row as a child-buffer reference
	VariableChar,
}

impl Kind {
	/// The number of bytes a value of this kind occupies within a row
	pub fn width(&self) -> u32 {
		match self {
			Kind::Bool | Kind::I8 | Kind::U8 => 1,
			Kind::I16 | Kind::U16 => 2,
			Kind::I32 | Kind::U32 | Kind::F32 => 4,
			Kind::I64 | Kind::U64 | Kind::F64 => 8,
			Kind::FixedChar(n) => *n,
			// Out-of-row reference: child buffer index and byte length
			Kind::VariableChar => 8,
		}
	}

	/// Whether values of this kind support arithmetic aggregation
	pub fn is_numeric(&self) -> bool {
		!matches!(self, Kind::Bool | Kind::FixedChar(_) | Kind::VariableChar)
	}
}

impl fmt::Display for Kind {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Kind::Bool => write!(f, "bool"),
			Kind::I8 => write!(f, "i8"),
			Kind::I16 => write!(f, "i16"),
			Kind::I32 => write!(f, "i32"),
			Kind::I64 => write!(f, "i64"),
			Kind::U8 => write!(f, "u8"),
			Kind::U16 => write!(f, "u16"),
			Kind::U32 => write!(f, "u32"),
			Kind::U64 => write!(f, "u64"),
			Kind::F32 => write!(f, "f32"),
			Kind::F64 => write!(f, "f64"),
			Kind::FixedChar(n) => write!(f, "char({n})"),
			Kind::VariableChar => write!(f, "text"),
		}
	}
}
