use crate::sch::Kind;
use std::fmt;

/// An SSA value identifier, unique within one function
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "v{}", self.0)
	}
}

/// A basic block identifier, unique within one function
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "b{}", self.0)
	}
}

/// The comparison predicates of the IR
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompareOp {
	Lt,
	Le,
	Eq,
	Ne,
	Gt,
	Ge,
}

/// One non-terminating IR operation
#[derive(Clone, Debug)]
pub enum Operation {
	/// Computes `base + row * row_width + field_offset`
	Address {
		out: ValueId,
		base: ValueId,
		row: ValueId,
		row_width: u32,
		field_offset: u32,
	},
	/// Loads a typed value from an address
	Load {
		out: ValueId,
		address: ValueId,
		kind: Kind,
	},
	/// Stores a typed value to an address
	Store {
		address: ValueId,
		value: ValueId,
		kind: Kind,
	},
	ConstInt {
		out: ValueId,
		value: i64,
	},
	AddInt {
		out: ValueId,
		l: ValueId,
		r: ValueId,
	},
	Mul {
		out: ValueId,
		l: ValueId,
		r: ValueId,
	},
	Negate {
		out: ValueId,
		v: ValueId,
	},
	Compare {
		out: ValueId,
		l: ValueId,
		cmp: CompareOp,
		r: ValueId,
	},
	/// Dispatches to a pre-registered native symbol
	ProxyCall {
		out: Option<ValueId>,
		symbol: String,
		args: Vec<ValueId>,
	},
}

impl Operation {
	/// The value this operation defines, if any
	pub fn defines(&self) -> Option<ValueId> {
		match self {
			Operation::Address {
				out,
				..
			}
			| Operation::Load {
				out,
				..
			}
			| Operation::ConstInt {
				out,
				..
			}
			| Operation::AddInt {
				out,
				..
			}
			| Operation::Mul {
				out,
				..
			}
			| Operation::Negate {
				out,
				..
			}
			| Operation::Compare {
				out,
				..
			} => Some(*out),
			Operation::ProxyCall {
				out,
				..
			} => *out,
			Operation::Store {
				..
			} => None,
		}
	}

	/// The values this operation uses
	pub fn uses(&self, out: &mut Vec<ValueId>) {
		match self {
			Operation::Address {
				base,
				row,
				..
			} => {
				out.push(*base);
				out.push(*row);
			}
			Operation::Load {
				address,
				..
			} => out.push(*address),
			Operation::Store {
				address,
				value,
				..
			} => {
				out.push(*address);
				out.push(*value);
			}
			Operation::ConstInt {
				..
			} => {}
			Operation::AddInt {
				l,
				r,
				..
			}
			| Operation::Mul {
				l,
				r,
				..
			}
			| Operation::Compare {
				l,
				r,
				..
			} => {
				out.push(*l);
				out.push(*r);
			}
			Operation::Negate {
				v,
				..
			} => out.push(*v),
			Operation::ProxyCall {
				args,
				..
			} => out.extend(args.iter().copied()),
		}
	}
}

/// The single exit point of a basic block
#[derive(Clone, Debug)]
pub enum Terminator {
	/// An unconditional forward edge
	Branch {
		target: BlockId,
		args: Vec<ValueId>,
	},
	/// A two-way conditional edge
	If {
		condition: ValueId,
		then_block: BlockId,
		then_args: Vec<ValueId>,
		else_block: BlockId,
		else_args: Vec<ValueId>,
	},
	/// The back edge of a loop, targeting its head block
	Loop {
		head: BlockId,
		args: Vec<ValueId>,
	},
	Return {
		value: Option<ValueId>,
	},
}

/// A basic block with explicit input arguments and a single terminator
#[derive(Clone, Debug)]
pub struct BasicBlock {
	pub id: BlockId,
	pub args: Vec<ValueId>,
	pub ops: Vec<Operation>,
	pub terminator: Option<Terminator>,
}

/// A block-structured SSA function
#[derive(Clone, Debug)]
pub struct IrFunction {
	pub name: String,
	pub entry: BlockId,
	pub blocks: Vec<BasicBlock>,
}

impl IrFunction {
	pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
		self.blocks.iter().find(|block| block.id == id)
	}
}

impl fmt::Display for IrFunction {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		writeln!(f, "fn {} entry {}", self.name, self.entry)?;
		for block in &self.blocks {
			write!(f, "{}(", block.id)?;
			for (idx, arg) in block.args.iter().enumerate() {
				if idx > 0 {
					write!(f, ", ")?;
				}
				write!(f, "{arg}")?;
			}
			writeln!(f, "): {} ops, {:?}", block.ops.len(), block.terminator.is_some())?;
		}
		Ok(())
	}
}
