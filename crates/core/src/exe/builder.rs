use crate::err::Error;
use crate::exe::ir::BasicBlock;
use crate::exe::ir::BlockId;
use crate::exe::ir::CompareOp;
use crate::exe::ir::IrFunction;
use crate::exe::ir::Operation;
use crate::exe::ir::Terminator;
use crate::exe::ir::ValueId;
use crate::exe::verify::verify;
use crate::sch::Kind;
use std::collections::HashMap;
use std::collections::HashSet;

/// Builds a block-structured SSA function.
///
/// The builder keeps one value frame per block, so definition-before-use is
/// established while the function is built rather than re-derived later.
/// Scope levels track lexical nesting; when nested control flow closes, the
/// innermost terminator dominates and later attempts to terminate the same
/// block are ignored.
pub struct FunctionBuilder {
	name: String,
	blocks: Vec<BasicBlock>,
	frames: HashMap<BlockId, HashSet<ValueId>>,
	scopes: Vec<BlockId>,
	current: Option<BlockId>,
	next_value: u32,
	next_block: u32,
}

impl FunctionBuilder {
	pub fn new(name: impl Into<String>) -> Self {
		FunctionBuilder {
			name: name.into(),
			blocks: Vec::new(),
			frames: HashMap::new(),
			scopes: Vec::new(),
			current: None,
			next_value: 0,
			next_block: 0,
		}
	}

	/// Creates a block with the given number of input arguments
	pub fn create_block(&mut self, arg_count: usize) -> (BlockId, Vec<ValueId>) {
		let id = BlockId(self.next_block);
		self.next_block += 1;
		let args: Vec<ValueId> = (0..arg_count).map(|_| self.fresh_value()).collect();
		self.frames.insert(id, args.iter().copied().collect());
		self.blocks.push(BasicBlock {
			id,
			args: args.clone(),
			ops: Vec::new(),
			terminator: None,
		});
		(id, args)
	}

	/// Moves the insertion point to a block
	pub fn switch_to(&mut self, block: BlockId) {
		self.current = Some(block);
	}

	/// Enters a lexical scope whose merge target is `merge`
	pub fn enter_scope(&mut self, merge: BlockId) {
		self.scopes.push(merge);
	}

	/// Leaves the innermost lexical scope
	pub fn exit_scope(&mut self) {
		self.scopes.pop();
	}

	/// The merge target of the innermost open scope
	pub fn merge_target(&self) -> Option<BlockId> {
		self.scopes.last().copied()
	}

	pub fn const_int(&mut self, value: i64) -> Result<ValueId, Error> {
		let out = self.fresh_value();
		self.push(Operation::ConstInt {
			out,
			value,
		})?;
		Ok(out)
	}

	pub fn add_int(&mut self, l: ValueId, r: ValueId) -> Result<ValueId, Error> {
		let out = self.fresh_value();
		self.push(Operation::AddInt {
			out,
			l,
			r,
		})?;
		Ok(out)
	}

	pub fn mul(&mut self, l: ValueId, r: ValueId) -> Result<ValueId, Error> {
		let out = self.fresh_value();
		self.push(Operation::Mul {
			out,
			l,
			r,
		})?;
		Ok(out)
	}

	pub fn negate(&mut self, v: ValueId) -> Result<ValueId, Error> {
		let out = self.fresh_value();
		self.push(Operation::Negate {
			out,
			v,
		})?;
		Ok(out)
	}

	pub fn compare(&mut self, l: ValueId, cmp: CompareOp, r: ValueId) -> Result<ValueId, Error> {
		let out = self.fresh_value();
		self.push(Operation::Compare {
			out,
			l,
			cmp,
			r,
		})?;
		Ok(out)
	}

	pub fn address(
		&mut self,
		base: ValueId,
		row: ValueId,
		row_width: u32,
		field_offset: u32,
	) -> Result<ValueId, Error> {
		let out = self.fresh_value();
		self.push(Operation::Address {
			out,
			base,
			row,
			row_width,
			field_offset,
		})?;
		Ok(out)
	}

	pub fn load(&mut self, address: ValueId, kind: Kind) -> Result<ValueId, Error> {
		let out = self.fresh_value();
		self.push(Operation::Load {
			out,
			address,
			kind,
		})?;
		Ok(out)
	}

	pub fn store(&mut self, address: ValueId, value: ValueId, kind: Kind) -> Result<(), Error> {
		self.push(Operation::Store {
			address,
			value,
			kind,
		})
	}

	pub fn proxy_call(
		&mut self,
		symbol: impl Into<String>,
		args: Vec<ValueId>,
		returns: bool,
	) -> Result<Option<ValueId>, Error> {
		let out = returns.then(|| self.fresh_value());
		self.push(Operation::ProxyCall {
			out,
			symbol: symbol.into(),
			args,
		})?;
		Ok(out)
	}

	/// Terminates the current block; when the block already ended inside a
	/// nested scope, the innermost terminator dominates and this call is a
	/// no-op
	pub fn terminate(&mut self, terminator: Terminator) -> Result<(), Error> {
		let current = self.current_block()?;
		let block = self
			.blocks
			.iter_mut()
			.find(|block| block.id == current)
			.expect("unreachable: current block disappeared");
		if block.terminator.is_none() {
			block.terminator = Some(terminator);
		}
		Ok(())
	}

	/// Finishes the function, verifying its structure
	pub fn finish(self) -> Result<IrFunction, Error> {
		let entry = self
			.blocks
			.first()
			.map(|block| block.id)
			.ok_or_else(|| Error::MalformedIr {
				message: "function has no blocks".to_owned(),
			})?;
		let function = IrFunction {
			name: self.name,
			entry,
			blocks: self.blocks,
		};
		verify(&function)?;
		Ok(function)
	}

	fn fresh_value(&mut self) -> ValueId {
		let id = ValueId(self.next_value);
		self.next_value += 1;
		id
	}

	fn current_block(&self) -> Result<BlockId, Error> {
		self.current.ok_or_else(|| Error::MalformedIr {
			message: "no insertion block selected".to_owned(),
		})
	}

	/// Appends one operation, recording defined values in the block frame
	/// and checking every use against it
	fn push(&mut self, op: Operation) -> Result<(), Error> {
		let current = self.current_block()?;
		let frame = self
			.frames
			.get_mut(&current)
			.expect("unreachable: block frame disappeared");
		let mut uses = Vec::new();
		op.uses(&mut uses);
		for used in uses {
			if !frame.contains(&used) {
				return Err(Error::MalformedIr {
					message: format!("{used} is used in {current} before definition"),
				});
			}
		}
		if let Some(defined) = op.defines() {
			frame.insert(defined);
		}
		let block = self
			.blocks
			.iter_mut()
			.find(|block| block.id == current)
			.expect("unreachable: current block disappeared");
		if block.terminator.is_some() {
			return Err(Error::MalformedIr {
				message: format!("{current} already ended with a terminator"),
			});
		}
		block.ops.push(op);
		Ok(())
	}
}
