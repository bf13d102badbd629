use crate::err::Error;
use crate::exe::builder::FunctionBuilder;
use crate::exe::ir::CompareOp;
use crate::exe::ir::IrFunction;
use crate::exe::ir::Terminator;
use crate::exe::ir::ValueId;
use crate::plan::infer::qualify;
use crate::plan::BinaryOperator;
use crate::plan::Expr;
use crate::plan::ProjectField;
use crate::plan::UnaryOperator;
use crate::sch::Kind;
use crate::sch::Schema;
use crate::sch::Value;
use ahash::AHashMap;

/// One stage of a compilable row pipeline
#[derive(Clone, Debug)]
pub enum PipelineStep {
	Filter {
		predicate: Expr,
	},
	Map {
		field: String,
		expr: Expr,
	},
	Project {
		fields: Vec<ProjectField>,
	},
}

/// Whether a kind fits the integer domain of the compiled pipeline
fn is_int(kind: Kind) -> bool {
	matches!(
		kind,
		Kind::Bool
			| Kind::I8 | Kind::I16
			| Kind::I32 | Kind::I64
			| Kind::U8 | Kind::U16
			| Kind::U32 | Kind::U64
	)
}

/// Compiles a scan→filter→map→emit pipeline over fixed-width integer rows
/// into an IR function.
///
/// The produced function iterates the input buffer with a loop whose body
/// filters and transforms one row, storing survivors to the output buffer.
/// Pipelines touching non-integer kinds are rejected; the caller falls back
/// to direct interpretation.
pub fn compile_pipeline(
	name: &str,
	input: &Schema,
	output: &Schema,
	steps: &[PipelineStep],
) -> Result<IrFunction, Error> {
	for attribute in input.attributes().iter().chain(output.attributes()) {
		if !is_int(attribute.kind()) {
			return Err(Error::MalformedIr {
				message: format!("attribute {attribute} is outside the compiled domain"),
			});
		}
	}
	let in_width = input.row_width();
	let out_width = output.row_width();
	let mut builder = FunctionBuilder::new(name);

	// Block layout: entry -> head -> body -> (emit | cont) -> cont -> head,
	// with head exiting to the epilogue once the row index reaches the count
	let (entry, _) = builder.create_block(0);
	// head(idx, out_idx, in_base, out_base, count)
	let (head, head_args) = builder.create_block(5);
	// body(idx, out_idx, in_base, out_base, count)
	let (body, body_args) = builder.create_block(5);
	// emit(idx, out_idx, in_base, out_base, count, fields...)
	let (emit, emit_args) = builder.create_block(5 + output.len());
	// cont(idx, out_idx, in_base, out_base, count)
	let (cont, cont_args) = builder.create_block(5);
	// exit(out_idx)
	let (exit, exit_args) = builder.create_block(1);

	builder.switch_to(entry);
	let region_in = builder.const_int(0)?;
	let region_out = builder.const_int(1)?;
	let in_base = builder
		.proxy_call("get_data_buffer", vec![region_in], true)?
		.expect("unreachable: get_data_buffer returns a value");
	let out_base = builder
		.proxy_call("get_data_buffer", vec![region_out], true)?
		.expect("unreachable: get_data_buffer returns a value");
	let count = builder
		.proxy_call("get_num_tuples", Vec::new(), true)?
		.expect("unreachable: get_num_tuples returns a value");
	let zero = builder.const_int(0)?;
	builder.terminate(Terminator::Branch {
		target: head,
		args: vec![zero, zero, in_base, out_base, count],
	})?;

	builder.switch_to(head);
	let more = builder.compare(head_args[0], CompareOp::Lt, head_args[4])?;
	builder.terminate(Terminator::If {
		condition: more,
		then_block: body,
		then_args: head_args.clone(),
		else_block: exit,
		else_args: vec![head_args[1]],
	})?;

	// The loop body is the innermost scope; its row-level If re-targets the
	// continuation block
	builder.switch_to(body);
	builder.enter_scope(cont);
	let row = body_args[0];
	// Load every input field once per row
	let mut env: AHashMap<String, ValueId> = AHashMap::new();
	let mut current = input.clone();
	for (idx, attribute) in input.attributes().iter().enumerate() {
		let address =
			builder.address(body_args[2], row, in_width, input.offset_of(idx))?;
		let value = builder.load(address, attribute.kind())?;
		env.insert(attribute.name().to_owned(), value);
	}
	// Apply the pipeline stages in straight-line form, collecting the
	// conjunction of every filter predicate
	let mut conditions: Vec<ValueId> = Vec::new();
	for step in steps {
		match step {
			PipelineStep::Filter {
				predicate,
			} => {
				let value = compile_expr(&mut builder, &env, &current, predicate)?;
				conditions.push(value);
			}
			PipelineStep::Map {
				field,
				expr,
			} => {
				let value = compile_expr(&mut builder, &env, &current, expr)?;
				let kind = expr.kind(&current)?;
				let name = qualify(field, &current);
				if !current.contains(&name) {
					current.push(crate::sch::Attribute::new(name.clone(), kind))?;
				}
				env.insert(name, value);
			}
			PipelineStep::Project {
				fields,
			} => {
				let mut next = Schema::new();
				let mut next_env = AHashMap::new();
				for field in fields {
					let value = compile_expr(&mut builder, &env, &current, &field.expr)?;
					let kind = field.expr.kind(&current)?;
					let name = match (&field.alias, &field.expr) {
						(Some(alias), _) => qualify(alias, &current),
						(None, Expr::Field(name)) => {
							current.attribute(name)?.name().to_owned()
						}
						(None, _) => {
							return Err(Error::MalformedIr {
								message: "projection expression without alias".to_owned(),
							})
						}
					};
					next.push(crate::sch::Attribute::new(name.clone(), kind))?;
					next_env.insert(name, value);
				}
				current = next;
				env = next_env;
			}
		}
	}
	let selected = match conditions.split_first() {
		None => builder.const_int(1)?,
		Some((first, rest)) => {
			let mut all = *first;
			for condition in rest {
				all = builder.mul(all, *condition)?;
			}
			all
		}
	};
	// The emitted row follows the output schema's layout
	let mut outputs = Vec::with_capacity(output.len());
	for attribute in output.attributes() {
		let value = env.get(attribute.name()).copied().ok_or_else(|| Error::MalformedIr {
			message: format!("output attribute {attribute} was never computed"),
		})?;
		outputs.push(value);
	}
	let mut emit_call_args = body_args.clone();
	emit_call_args.extend(outputs);
	let merge = builder.merge_target().expect("unreachable: loop body scope is open");
	builder.terminate(Terminator::If {
		condition: selected,
		then_block: emit,
		then_args: emit_call_args,
		else_block: merge,
		else_args: body_args.clone(),
	})?;
	builder.exit_scope();

	builder.switch_to(emit);
	for (idx, _) in output.attributes().iter().enumerate() {
		let address =
			builder.address(emit_args[3], emit_args[1], out_width, output.offset_of(idx))?;
		let kind = output.attributes()[idx].kind();
		builder.store(address, emit_args[5 + idx], kind)?;
	}
	let one = builder.const_int(1)?;
	let next_out = builder.add_int(emit_args[1], one)?;
	builder.terminate(Terminator::Branch {
		target: cont,
		args: vec![emit_args[0], next_out, emit_args[2], emit_args[3], emit_args[4]],
	})?;

	builder.switch_to(cont);
	let one = builder.const_int(1)?;
	let next_row = builder.add_int(cont_args[0], one)?;
	builder.terminate(Terminator::Loop {
		head,
		args: vec![next_row, cont_args[1], cont_args[2], cont_args[3], cont_args[4]],
	})?;

	builder.switch_to(exit);
	builder.proxy_call("set_num_tuples", vec![exit_args[0]], false)?;
	builder.terminate(Terminator::Return {
		value: Some(exit_args[0]),
	})?;

	builder.finish()
}

/// Lowers a scalar expression to straight-line IR over the value
/// environment; booleans are the integers zero and one
fn compile_expr(
	builder: &mut FunctionBuilder,
	env: &AHashMap<String, ValueId>,
	schema: &Schema,
	expr: &Expr,
) -> Result<ValueId, Error> {
	match expr {
		Expr::Field(name) => {
			let attribute = schema.attribute(name)?;
			env.get(attribute.name()).copied().ok_or_else(|| Error::MalformedIr {
				message: format!("field {name} is not materialized"),
			})
		}
		Expr::Constant(value) => match value {
			Value::Bool(v) => builder.const_int(*v as i64),
			Value::I8(v) => builder.const_int(*v as i64),
			Value::I16(v) => builder.const_int(*v as i64),
			Value::I32(v) => builder.const_int(*v as i64),
			Value::I64(v) => builder.const_int(*v),
			Value::U8(v) => builder.const_int(*v as i64),
			Value::U16(v) => builder.const_int(*v as i64),
			Value::U32(v) => builder.const_int(*v as i64),
			Value::U64(v) => builder.const_int(*v as i64),
			_ => Err(Error::MalformedIr {
				message: "constant is outside the compiled domain".to_owned(),
			}),
		},
		Expr::Unary {
			o,
			v,
		} => {
			let value = compile_expr(builder, env, schema, v)?;
			match o {
				UnaryOperator::Neg => builder.negate(value),
				UnaryOperator::Not => {
					let zero = builder.const_int(0)?;
					builder.compare(value, CompareOp::Eq, zero)
				}
			}
		}
		Expr::Binary {
			l,
			o,
			r,
		} => {
			let lv = compile_expr(builder, env, schema, l)?;
			let rv = compile_expr(builder, env, schema, r)?;
			match o {
				BinaryOperator::Add => builder.add_int(lv, rv),
				BinaryOperator::Sub => {
					let negated = builder.negate(rv)?;
					builder.add_int(lv, negated)
				}
				BinaryOperator::Mul => builder.mul(lv, rv),
				BinaryOperator::Equal => builder.compare(lv, CompareOp::Eq, rv),
				BinaryOperator::NotEqual => builder.compare(lv, CompareOp::Ne, rv),
				BinaryOperator::LessThan => builder.compare(lv, CompareOp::Lt, rv),
				BinaryOperator::LessThanOrEqual => builder.compare(lv, CompareOp::Le, rv),
				BinaryOperator::MoreThan => builder.compare(lv, CompareOp::Gt, rv),
				BinaryOperator::MoreThanOrEqual => builder.compare(lv, CompareOp::Ge, rv),
				BinaryOperator::And => {
					let zero = builder.const_int(0)?;
					let lb = builder.compare(lv, CompareOp::Ne, zero)?;
					let rb = builder.compare(rv, CompareOp::Ne, zero)?;
					builder.mul(lb, rb)
				}
				BinaryOperator::Or => {
					let zero = builder.const_int(0)?;
					let lb = builder.compare(lv, CompareOp::Ne, zero)?;
					let rb = builder.compare(rv, CompareOp::Ne, zero)?;
					let sum = builder.add_int(lb, rb)?;
					builder.compare(sum, CompareOp::Ne, zero)
				}
				BinaryOperator::Div | BinaryOperator::Rem => Err(Error::MalformedIr {
					message: "division is outside the compiled domain".to_owned(),
				}),
			}
		}
	}
}
