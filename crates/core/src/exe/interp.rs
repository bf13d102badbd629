use crate::err::Error;
use crate::exe::ir::BlockId;
use crate::exe::ir::CompareOp;
use crate::exe::ir::IrFunction;
use crate::exe::ir::Operation;
use crate::exe::ir::Terminator;
use crate::exe::ir::ValueId;
use crate::sch::Kind;
use ahash::AHashMap;

/// The addressable memory of one pipeline invocation.
///
/// Addresses are virtual: the upper half selects a region, the lower half
/// the byte offset within it. Region zero is the input tuple buffer,
/// region one the output tuple buffer.
pub struct ExecContext {
	regions: Vec<Vec<u8>>,
	tuples_in: u64,
	tuples_out: u64,
}

const REGION_SHIFT: u32 = 32;

impl ExecContext {
	pub fn new(input: Vec<u8>, output_capacity: usize, tuples_in: u64) -> Self {
		ExecContext {
			regions: vec![input, vec![0u8; output_capacity]],
			tuples_in,
			tuples_out: 0,
		}
	}

	/// The virtual base address of a region
	pub fn base_of(&self, region: usize) -> i64 {
		(region as i64) << REGION_SHIFT
	}

	pub fn tuples_in(&self) -> u64 {
		self.tuples_in
	}

	pub fn tuples_out(&self) -> u64 {
		self.tuples_out
	}

	pub fn set_tuples_out(&mut self, count: u64) {
		self.tuples_out = count;
	}

	/// The output region contents
	pub fn output(&self) -> &[u8] {
		&self.regions[1]
	}

	fn slice(&self, address: i64, len: usize) -> Result<&[u8], Error> {
		let region = (address >> REGION_SHIFT) as usize;
		let offset = (address & ((1i64 << REGION_SHIFT) - 1)) as usize;
		let region = self.regions.get(region).ok_or_else(|| Error::MalformedIr {
			message: format!("load from unmapped region {region}"),
		})?;
		region.get(offset..offset + len).ok_or_else(|| Error::MalformedIr {
			message: format!("access beyond region end at offset {offset}"),
		})
	}

	fn slice_mut(&mut self, address: i64, len: usize) -> Result<&mut [u8], Error> {
		let region_idx = (address >> REGION_SHIFT) as usize;
		let offset = (address & ((1i64 << REGION_SHIFT) - 1)) as usize;
		let region = self.regions.get_mut(region_idx).ok_or_else(|| Error::MalformedIr {
			message: format!("store to unmapped region {region_idx}"),
		})?;
		region.get_mut(offset..offset + len).ok_or_else(|| Error::MalformedIr {
			message: format!("access beyond region end at offset {offset}"),
		})
	}
}

/// A native function callable through a proxy-call operation
pub type ProxyFn = Box<dyn Fn(&mut ExecContext, &[i64]) -> i64 + Send + Sync>;

/// Pre-registered native symbols resolved at pipeline setup.
///
/// The default registry provides the buffer accessors every compiled
/// pipeline needs; user-defined trampolines are registered on top.
pub struct ProxyRegistry {
	symbols: AHashMap<String, ProxyFn>,
}

impl Default for ProxyRegistry {
	fn default() -> Self {
		let mut registry = ProxyRegistry {
			symbols: AHashMap::new(),
		};
		registry.register("get_data_buffer", |ctx, args| {
			ctx.base_of(args.first().copied().unwrap_or(0) as usize)
		});
		registry.register("get_num_tuples", |ctx, _| ctx.tuples_in() as i64);
		registry.register("set_num_tuples", |ctx, args| {
			ctx.set_tuples_out(args.first().copied().unwrap_or(0) as u64);
			0
		});
		registry
	}
}

impl ProxyRegistry {
	pub fn new() -> Self {
		ProxyRegistry::default()
	}

	/// Registers a native symbol; a later registration shadows an earlier
	/// one of the same name
	pub fn register(
		&mut self,
		symbol: impl Into<String>,
		function: impl Fn(&mut ExecContext, &[i64]) -> i64 + Send + Sync + 'static,
	) {
		self.symbols.insert(symbol.into(), Box::new(function));
	}

	fn call(&self, symbol: &str, ctx: &mut ExecContext, args: &[i64]) -> Result<i64, Error> {
		let function = self.symbols.get(symbol).ok_or_else(|| Error::UnknownProxySymbol {
			symbol: symbol.to_owned(),
		})?;
		Ok(function(ctx, args))
	}
}

/// The step budget guarding against non-terminating loops
const MAX_STEPS: u64 = 1 << 32;

/// Executes a verified IR function against one execution context
pub fn run(
	function: &IrFunction,
	registry: &ProxyRegistry,
	ctx: &mut ExecContext,
) -> Result<Option<i64>, Error> {
	let mut env: AHashMap<ValueId, i64> = AHashMap::new();
	let mut block_id = function.entry;
	let mut incoming: Vec<i64> = Vec::new();
	let mut steps = 0u64;
	loop {
		let block = function.block(block_id).ok_or_else(|| Error::MalformedIr {
			message: format!("jump to unknown block {block_id}"),
		})?;
		for (arg, value) in block.args.iter().zip(incoming.iter()) {
			env.insert(*arg, *value);
		}
		for op in &block.ops {
			steps += 1;
			if steps > MAX_STEPS {
				return Err(Error::MalformedIr {
					message: "step budget exhausted".to_owned(),
				});
			}
			execute(op, registry, ctx, &mut env)?;
		}
		let terminator = block.terminator.as_ref().ok_or_else(|| Error::MalformedIr {
			message: format!("{block_id} has no terminator"),
		})?;
		let (next, args) = match terminator {
			Terminator::Branch {
				target,
				args,
			} => (*target, args),
			Terminator::If {
				condition,
				then_block,
				then_args,
				else_block,
				else_args,
			} => {
				if read(&env, *condition)? != 0 {
					(*then_block, then_args)
				} else {
					(*else_block, else_args)
				}
			}
			Terminator::Loop {
				head,
				args,
			} => (*head, args),
			Terminator::Return {
				value,
			} => {
				return match value {
					Some(value) => Ok(Some(read(&env, *value)?)),
					None => Ok(None),
				}
			}
		};
		incoming = args.iter().map(|arg| read(&env, *arg)).collect::<Result<_, _>>()?;
		block_id = next;
	}
}

fn execute(
	op: &Operation,
	registry: &ProxyRegistry,
	ctx: &mut ExecContext,
	env: &mut AHashMap<ValueId, i64>,
) -> Result<(), Error> {
	match op {
		Operation::Address {
			out,
			base,
			row,
			row_width,
			field_offset,
		} => {
			let address = read(env, *base)?
				+ read(env, *row)? * (*row_width as i64)
				+ (*field_offset as i64);
			env.insert(*out, address);
		}
		Operation::Load {
			out,
			address,
			kind,
		} => {
			let address = read(env, *address)?;
			let value = load(ctx, address, *kind)?;
			env.insert(*out, value);
		}
		Operation::Store {
			address,
			value,
			kind,
		} => {
			let address = read(env, *address)?;
			let value = read(env, *value)?;
			store(ctx, address, value, *kind)?;
		}
		Operation::ConstInt {
			out,
			value,
		} => {
			env.insert(*out, *value);
		}
		Operation::AddInt {
			out,
			l,
			r,
		} => {
			let value = read(env, *l)?.wrapping_add(read(env, *r)?);
			env.insert(*out, value);
		}
		Operation::Mul {
			out,
			l,
			r,
		} => {
			let value = read(env, *l)?.wrapping_mul(read(env, *r)?);
			env.insert(*out, value);
		}
		Operation::Negate {
			out,
			v,
		} => {
			let value = read(env, *v)?.wrapping_neg();
			env.insert(*out, value);
		}
		Operation::Compare {
			out,
			l,
			cmp,
			r,
		} => {
			let l = read(env, *l)?;
			let r = read(env, *r)?;
			let value = match cmp {
				CompareOp::Lt => l < r,
				CompareOp::Le => l <= r,
				CompareOp::Eq => l == r,
				CompareOp::Ne => l != r,
				CompareOp::Gt => l > r,
				CompareOp::Ge => l >= r,
			};
			env.insert(*out, value as i64);
		}
		Operation::ProxyCall {
			out,
			symbol,
			args,
		} => {
			let args: Vec<i64> =
				args.iter().map(|arg| read(env, *arg)).collect::<Result<_, _>>()?;
			let value = registry.call(symbol, ctx, &args)?;
			if let Some(out) = out {
				env.insert(*out, value);
			}
		}
	}
	Ok(())
}

fn read(env: &AHashMap<ValueId, i64>, value: ValueId) -> Result<i64, Error> {
	env.get(&value).copied().ok_or_else(|| Error::MalformedIr {
		message: format!("{value} was read before it was written"),
	})
}

fn load(ctx: &ExecContext, address: i64, kind: Kind) -> Result<i64, Error> {
	let width = kind.width() as usize;
	let bytes = ctx.slice(address, width)?;
	let mut raw = [0u8; 8];
	raw[..width].copy_from_slice(bytes);
	let unsigned = u64::from_le_bytes(raw);
	let value = match kind {
		Kind::I8 => bytes[0] as i8 as i64,
		Kind::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
		Kind::I32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
		Kind::I64 => unsigned as i64,
		_ => unsigned as i64,
	};
	Ok(value)
}

fn store(ctx: &mut ExecContext, address: i64, value: i64, kind: Kind) -> Result<(), Error> {
	let width = kind.width() as usize;
	let raw = (value as u64).to_le_bytes();
	let bytes = ctx.slice_mut(address, width)?;
	bytes.copy_from_slice(&raw[..width]);
	Ok(())
}
