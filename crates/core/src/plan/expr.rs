use crate::err::Error;
use crate::sch::Kind;
use crate::sch::Schema;
use crate::sch::Value;
use revision::revisioned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A scalar expression over the attributes of one record
#[revisioned(revision = 1)]
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Expr {
	/// A reference to an attribute, resolved against the input schema
	Field(String),
	/// A literal value
	Constant(Value),
	Unary {
		o: UnaryOperator,
		v: Box<Expr>,
	},
	Binary {
		l: Box<Expr>,
		o: BinaryOperator,
		r: Box<Expr>,
	},
}

#[revisioned(revision = 1)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum UnaryOperator {
	Not,
	Neg,
}

#[revisioned(revision = 1)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum BinaryOperator {
	And,
	Or,
	Equal,
	NotEqual,
	LessThan,
	LessThanOrEqual,
	MoreThan,
	MoreThanOrEqual,
	Add,
	Sub,
	Mul,
	Div,
	Rem,
}

impl Expr {
	/// A field access expression
	pub fn field(name: impl Into<String>) -> Expr {
		Expr::Field(name.into())
	}

	/// A literal expression
	pub fn constant(value: impl Into<Value>) -> Expr {
		Expr::Constant(value.into())
	}

	/// A binary expression
	pub fn binary(l: Expr, o: BinaryOperator, r: Expr) -> Expr {
		Expr::Binary {
			l: Box::new(l),
			o,
			r: Box::new(r),
		}
	}

	/// Collects every field name referenced by this expression
	pub fn fields<'a>(&'a self, out: &mut Vec<&'a str>) {
		match self {
			Expr::Field(name) => out.push(name),
			Expr::Constant(_) => {}
			Expr::Unary {
				v,
				..
			} => v.fields(out),
			Expr::Binary {
				l,
				r,
				..
			} => {
				l.fields(out);
				r.fields(out);
			}
		}
	}

	/// Derives the result kind of this expression against an input schema
	pub fn kind(&self, schema: &Schema) -> Result<Kind, Error> {
		match self {
			Expr::Field(name) => schema.kind_of(name),
			Expr::Constant(value) => Ok(value.kind()),
			Expr::Unary {
				o,
				v,
			} => match o {
				UnaryOperator::Not => {
					v.kind(schema)?;
					Ok(Kind::Bool)
				}
				UnaryOperator::Neg => v.kind(schema),
			},
			Expr::Binary {
				l,
				o,
				r,
			} => {
				let lk = l.kind(schema)?;
				r.kind(schema)?;
				match o {
					BinaryOperator::And
					| BinaryOperator::Or
					| BinaryOperator::Equal
					| BinaryOperator::NotEqual
					| BinaryOperator::LessThan
					| BinaryOperator::LessThanOrEqual
					| BinaryOperator::MoreThan
					| BinaryOperator::MoreThanOrEqual => Ok(Kind::Bool),
					_ => Ok(lk),
				}
			}
		}
	}

	/// Evaluates this expression against one record
	pub fn compute(&self, schema: &Schema, row: &[Value]) -> Result<Value, Error> {
		match self {
			Expr::Field(name) => {
				let idx = schema.resolve(name)?;
				Ok(row[idx].clone())
			}
			Expr::Constant(value) => Ok(value.clone()),
			Expr::Unary {
				o,
				v,
			} => {
				let operand = v.compute(schema, row)?;
				match o {
					UnaryOperator::Not => Ok(Value::Bool(!operand.is_truthy())),
					UnaryOperator::Neg => Value::zero(operand.kind()).try_sub(&operand),
				}
			}
			Expr::Binary {
				l,
				o,
				r,
			} => {
				let l = l.compute(schema, row)?;
				// Short-circuit the boolean connectives
				match o {
					BinaryOperator::And if !l.is_truthy() => return Ok(Value::Bool(false)),
					BinaryOperator::Or if l.is_truthy() => return Ok(Value::Bool(true)),
					_ => {}
				}
				let r = r.compute(schema, row)?;
				match o {
					BinaryOperator::And => Ok(Value::Bool(l.is_truthy() && r.is_truthy())),
					BinaryOperator::Or => Ok(Value::Bool(l.is_truthy() || r.is_truthy())),
					BinaryOperator::Equal => Ok(Value::Bool(l == r)),
					BinaryOperator::NotEqual => Ok(Value::Bool(l != r)),
					BinaryOperator::LessThan => Ok(Value::Bool(l < r)),
					BinaryOperator::LessThanOrEqual => Ok(Value::Bool(l <= r)),
					BinaryOperator::MoreThan => Ok(Value::Bool(l > r)),
					BinaryOperator::MoreThanOrEqual => Ok(Value::Bool(l >= r)),
					BinaryOperator::Add => l.try_add(&r),
					BinaryOperator::Sub => l.try_sub(&r),
					BinaryOperator::Mul => l.try_mul(&r),
					BinaryOperator::Div => {
						if r.as_f64() == 0.0 {
							return Err(Error::InvalidArithmetic {
								message: "division by zero".to_owned(),
							});
						}
						match (l.as_u64(), r.as_u64()) {
							(Some(l), Some(r)) => Ok(Value::U64(l / r)),
							_ => Ok(Value::F64(l.as_f64() / r.as_f64())),
						}
					}
					BinaryOperator::Rem => match (l.as_u64(), r.as_u64()) {
						(Some(l), Some(r)) if r != 0 => Ok(Value::U64(l % r)),
						_ => Err(Error::InvalidArithmetic {
							message: "remainder of non-integer values".to_owned(),
						}),
					},
				}
			}
		}
	}

	/// When this expression is a `left = right` field comparison, the pair
	/// of referenced field names
	pub fn as_field_equality(&self) -> Option<(&str, &str)> {
		match self {
			Expr::Binary {
				l,
				o: BinaryOperator::Equal,
				r,
			} => match (l.as_ref(), r.as_ref()) {
				(Expr::Field(l), Expr::Field(r)) => Some((l, r)),
				_ => None,
			},
			_ => None,
		}
	}
}

impl fmt::Display for UnaryOperator {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			UnaryOperator::Not => write!(f, "!"),
			UnaryOperator::Neg => write!(f, "-"),
		}
	}
}

impl fmt::Display for BinaryOperator {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			BinaryOperator::And => write!(f, "&&"),
			BinaryOperator::Or => write!(f, "||"),
			BinaryOperator::Equal => write!(f, "=="),
			BinaryOperator::NotEqual => write!(f, "!="),
			BinaryOperator::LessThan => write!(f, "<"),
			BinaryOperator::LessThanOrEqual => write!(f, "<="),
			BinaryOperator::MoreThan => write!(f, ">"),
			BinaryOperator::MoreThanOrEqual => write!(f, ">="),
			BinaryOperator::Add => write!(f, "+"),
			BinaryOperator::Sub => write!(f, "-"),
			BinaryOperator::Mul => write!(f, "*"),
			BinaryOperator::Div => write!(f, "/"),
			BinaryOperator::Rem => write!(f, "%"),
		}
	}
}

impl fmt::Display for Expr {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Expr::Field(name) => write!(f, "{name}"),
			Expr::Constant(value) => write!(f, "{value}"),
			Expr::Unary {
				o,
				v,
			} => write!(f, "{o}{v}"),
			Expr::Binary {
				l,
				o,
				r,
			} => write!(f, "{l} {o} {r}"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn schema() -> Schema {
		Schema::from_fields([("cars$id", Kind::U32), ("cars$value", Kind::U64)]).unwrap()
	}

	#[test]
	fn computes_comparison_against_row() {
		let expr = Expr::binary(
			Expr::field("id"),
			BinaryOperator::LessThan,
			Expr::Constant(Value::U32(45)),
		);
		let row = vec![Value::U32(7), Value::U64(100)];
		assert_eq!(expr.compute(&schema(), &row).unwrap(), Value::Bool(true));
	}

	#[test]
	fn computes_arithmetic_assignment() {
		let expr = Expr::binary(
			Expr::field("value"),
			BinaryOperator::Mul,
			Expr::Constant(Value::U64(2)),
		);
		let row = vec![Value::U32(7), Value::U64(100)];
		assert_eq!(expr.compute(&schema(), &row).unwrap(), Value::U64(200));
	}

	#[test]
	fn comparison_kinds_are_boolean() {
		let expr = Expr::binary(
			Expr::field("cars$value"),
			BinaryOperator::MoreThan,
			Expr::Constant(Value::U64(5)),
		);
		assert_eq!(expr.kind(&schema()).unwrap(), Kind::Bool);
	}

	#[test]
	fn extracts_join_key_equality() {
		let expr = Expr::binary(Expr::field("left$id"), BinaryOperator::Equal, Expr::field("right$id"));
		assert_eq!(expr.as_field_equality(), Some(("left$id", "right$id")));
	}
}
