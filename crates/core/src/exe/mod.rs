//! The execution IR and its evaluator.
//!
//! Stage pipelines lower to a block-structured SSA form: basic blocks with
//! explicit argument lists and a single terminator. Address computation is
//! `base + row * row_width + field_offset`; calls into the runtime
//! dispatch through pre-registered proxy symbols. The verified IR is
//! executed by a register evaluator against tuple buffers.

pub(crate) mod builder;
pub(crate) mod interp;
pub(crate) mod ir;
pub(crate) mod lower;
pub(crate) mod verify;

pub use builder::FunctionBuilder;
pub use interp::ExecContext;
pub use interp::ProxyRegistry;
pub use interp::run;
pub use ir::BasicBlock;
pub use ir::BlockId;
pub use ir::CompareOp;
pub use ir::IrFunction;
pub use ir::Operation;
pub use ir::Terminator;
pub use ir::ValueId;
pub use lower::compile_pipeline;
pub use lower::PipelineStep;
pub use verify::verify;

#[cfg(test)]
mod tests {
	use super::*;
	use crate::err::Error;
	use crate::plan::BinaryOperator;
	use crate::plan::Expr;
	use crate::sch::Kind;
	use crate::sch::Schema;
	use crate::sch::Value;

	fn schema_in() -> Schema {
		Schema::from_fields([("car$id", Kind::U32), ("car$value", Kind::U64)]).unwrap()
	}

	fn rows_to_buffer(schema: &Schema, rows: &[Vec<Value>]) -> Vec<u8> {
		let width = schema.row_width() as usize;
		let mut out = vec![0u8; width * rows.len()];
		for (row_idx, row) in rows.iter().enumerate() {
			for (field_idx, value) in row.iter().enumerate() {
				let offset = row_idx * width + schema.offset_of(field_idx) as usize;
				let len = schema.attributes()[field_idx].kind().width() as usize;
				value.write_to(&mut out[offset..offset + len]);
			}
		}
		out
	}

	#[test]
	fn filter_map_pipeline_compiles_and_runs() {
		let input = schema_in();
		let mut output = input.clone();
		output
			.push(crate::sch::Attribute::new("car$c", Kind::U64))
			.unwrap();
		let steps = vec![
			PipelineStep::Filter {
				predicate: Expr::binary(
					Expr::field("id"),
					BinaryOperator::LessThan,
					Expr::Constant(Value::U32(45)),
				),
			},
			PipelineStep::Map {
				field: "c".to_owned(),
				expr: Expr::binary(
					Expr::field("value"),
					BinaryOperator::Mul,
					Expr::Constant(Value::U64(2)),
				),
			},
		];
		let function = compile_pipeline("filter_map", &input, &output, &steps).unwrap();
		let rows = vec![
			vec![Value::U32(7), Value::U64(100)],
			vec![Value::U32(99), Value::U64(5)],
			vec![Value::U32(44), Value::U64(3)],
		];
		let buffer = rows_to_buffer(&input, &rows);
		let mut ctx = ExecContext::new(buffer, output.row_width() as usize * 3, 3);
		let registry = ProxyRegistry::new();
		let produced = run(&function, &registry, &mut ctx).unwrap();
		assert_eq!(produced, Some(2));
		assert_eq!(ctx.tuples_out(), 2);
		// First surviving row: id 7, value 100, c 200
		let out_width = output.row_width() as usize;
		let first = &ctx.output()[..out_width];
		assert_eq!(Value::read_from(Kind::U32, &first[0..4]), Value::U32(7));
		assert_eq!(Value::read_from(Kind::U64, &first[4..12]), Value::U64(100));
		assert_eq!(Value::read_from(Kind::U64, &first[12..20]), Value::U64(200));
	}

	#[test]
	fn projection_reorders_and_renames() {
		let input = schema_in();
		let output = Schema::from_fields([("car$twice", Kind::U64)]).unwrap();
		let steps = vec![PipelineStep::Project {
			fields: vec![crate::plan::ProjectField::aliased(
				Expr::binary(
					Expr::field("value"),
					BinaryOperator::Add,
					Expr::field("value"),
				),
				"twice",
			)],
		}];
		let function = compile_pipeline("project", &input, &output, &steps).unwrap();
		let buffer = rows_to_buffer(&input, &[vec![Value::U32(1), Value::U64(21)]]);
		let mut ctx = ExecContext::new(buffer, 8, 1);
		let registry = ProxyRegistry::new();
		run(&function, &registry, &mut ctx).unwrap();
		assert_eq!(Value::read_from(Kind::U64, &ctx.output()[..8]), Value::U64(42));
	}

	#[test]
	fn float_pipelines_are_rejected() {
		let input = Schema::from_fields([("s$v", Kind::F64)]).unwrap();
		let output = input.clone();
		assert!(matches!(
			compile_pipeline("floats", &input, &output, &[]),
			Err(Error::MalformedIr { .. })
		));
	}

	#[test]
	fn udf_trampolines_dispatch_through_the_registry() {
		let mut builder = FunctionBuilder::new("udf");
		let (entry, _) = builder.create_block(0);
		builder.switch_to(entry);
		let seven = builder.const_int(7).unwrap();
		let result = builder.proxy_call("triple", vec![seven], true).unwrap().unwrap();
		builder
			.terminate(Terminator::Return {
				value: Some(result),
			})
			.unwrap();
		let function = builder.finish().unwrap();
		let mut registry = ProxyRegistry::new();
		registry.register("triple", |_, args| args[0] * 3);
		let mut ctx = ExecContext::new(Vec::new(), 0, 0);
		assert_eq!(run(&function, &registry, &mut ctx).unwrap(), Some(21));
	}

	#[test]
	fn unknown_proxy_symbols_fail() {
		let mut builder = FunctionBuilder::new("missing");
		let (entry, _) = builder.create_block(0);
		builder.switch_to(entry);
		let out = builder.proxy_call("nowhere", Vec::new(), true).unwrap().unwrap();
		builder
			.terminate(Terminator::Return {
				value: Some(out),
			})
			.unwrap();
		let function = builder.finish().unwrap();
		let registry = ProxyRegistry::new();
		let mut ctx = ExecContext::new(Vec::new(), 0, 0);
		assert!(matches!(
			run(&function, &registry, &mut ctx),
			Err(Error::UnknownProxySymbol { .. })
		));
	}

	#[test]
	fn blocks_require_a_terminator() {
		let mut builder = FunctionBuilder::new("unterminated");
		let (entry, _) = builder.create_block(0);
		builder.switch_to(entry);
		builder.const_int(1).unwrap();
		assert!(matches!(builder.finish(), Err(Error::MalformedIr { .. })));
	}

	#[test]
	fn the_innermost_terminator_dominates() {
		let mut builder = FunctionBuilder::new("nested");
		let (entry, _) = builder.create_block(0);
		let (merge, merge_args) = builder.create_block(1);
		builder.switch_to(entry);
		let one = builder.const_int(1).unwrap();
		builder.enter_scope(merge);
		// The inner scope ends the block first
		builder
			.terminate(Terminator::Branch {
				target: merge,
				args: vec![one],
			})
			.unwrap();
		builder.exit_scope();
		// A later attempt from the enclosing scope is ignored
		let ignored = Terminator::Return {
			value: None,
		};
		builder.terminate(ignored).unwrap();
		builder.switch_to(merge);
		builder
			.terminate(Terminator::Return {
				value: Some(merge_args[0]),
			})
			.unwrap();
		let function = builder.finish().unwrap();
		let registry = ProxyRegistry::new();
		let mut ctx = ExecContext::new(Vec::new(), 0, 0);
		assert_eq!(run(&function, &registry, &mut ctx).unwrap(), Some(1));
	}
}
