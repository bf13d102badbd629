use crate::err::Error;
use crate::exe::ir::IrFunction;
use crate::exe::ir::Terminator;
use std::collections::HashSet;

/// Structural verification of an IR function.
///
/// Every block must end with exactly one terminator, every terminator
/// target must exist and receive the arity its block declares, values must
/// be defined before use within their block, and no value may be defined
/// twice.
pub fn verify(function: &IrFunction) -> Result<(), Error> {
	let mut defined_anywhere = HashSet::new();
	for block in &function.blocks {
		let mut frame: HashSet<_> = block.args.iter().copied().collect();
		for arg in &block.args {
			if !defined_anywhere.insert(*arg) {
				return Err(Error::MalformedIr {
					message: format!("{arg} is defined more than once"),
				});
			}
		}
		for op in &block.ops {
			let mut uses = Vec::new();
			op.uses(&mut uses);
			for used in uses {
				if !frame.contains(&used) {
					return Err(Error::MalformedIr {
						message: format!(
							"{used} is used in {} before definition",
							block.id
						),
					});
				}
			}
			if let Some(out) = op.defines() {
				if !defined_anywhere.insert(out) {
					return Err(Error::MalformedIr {
						message: format!("{out} is defined more than once"),
					});
				}
				frame.insert(out);
			}
		}
		let terminator = block.terminator.as_ref().ok_or_else(|| Error::MalformedIr {
			message: format!("{} has no terminator", block.id),
		})?;
		let check_edge = |target, args: &Vec<_>| -> Result<(), Error> {
			let target_block = function.block(target).ok_or_else(|| Error::MalformedIr {
				message: format!("{} targets the unknown block {target}", block.id),
			})?;
			if target_block.args.len() != args.len() {
				return Err(Error::MalformedIr {
					message: format!(
						"{} passes {} arguments to {target} which takes {}",
						block.id,
						args.len(),
						target_block.args.len()
					),
				});
			}
			for arg in args {
				if !frame.contains(arg) {
					return Err(Error::MalformedIr {
						message: format!("{arg} is passed from {} before definition", block.id),
					});
				}
			}
			Ok(())
		};
		match terminator {
			Terminator::Branch {
				target,
				args,
			} => check_edge(*target, args)?,
			Terminator::If {
				condition,
				then_block,
				then_args,
				else_block,
				else_args,
			} => {
				if !frame.contains(condition) {
					return Err(Error::MalformedIr {
						message: format!(
							"{condition} is used as a condition in {} before definition",
							block.id
						),
					});
				}
				check_edge(*then_block, then_args)?;
				check_edge(*else_block, else_args)?;
			}
			Terminator::Loop {
				head,
				args,
			} => check_edge(*head, args)?,
			Terminator::Return {
				value,
			} => {
				if let Some(value) = value {
					if !frame.contains(value) {
						return Err(Error::MalformedIr {
							message: format!(
								"{value} is returned from {} before definition",
								block.id
							),
						});
					}
				}
			}
		}
	}
	if function.block(function.entry).is_none() {
		return Err(Error::MalformedIr {
			message: "entry block does not exist".to_owned(),
		});
	}
	Ok(())
}
