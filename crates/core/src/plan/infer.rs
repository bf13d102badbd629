use crate::err::Error;
use crate::plan::Inputs;
use crate::plan::LogicalDetails;
use crate::plan::OperatorId;
use crate::plan::OriginId;
use crate::plan::QueryPlan;
use crate::plan::TimeCharacteristic;
use crate::plan::WindowType;
use crate::sch::Attribute;
use crate::sch::Kind;
use crate::sch::Schema;
use crate::sch::QUALIFIER_SEPARATOR;
use crate::plan::AggregateFunction;

/// Derives the output schema and origin set of every operator, bottom-up.
///
/// Inference validates window definitions, join timestamps and origin-set
/// invariants, and assigns the number of physical input edges to window
/// operators so their handlers can count per-origin termination.
pub fn infer(plan: &mut QueryPlan) -> Result<(), Error> {
	let order = plan.topological();
	for id in order {
		let node = match plan.node(id) {
			Some(node) => node,
			None => continue,
		};
		trace!("Inferring types for {node}");
		// Snapshot the already inferred child outputs
		let children: Vec<(Schema, Vec<OriginId>)> = node
			.children
			.iter()
			.filter_map(|c| plan.node(*c))
			.map(|c| (c.output_schema.clone(), c.output_origins.clone()))
			.collect();
		let details = node.details.clone();
		let (inputs, output_schema, output_origins, input_edges) =
			infer_operator(id, &details, children)?;
		let node = plan.node_mut(id).expect("unreachable: node disappeared during inference");
		node.inputs = inputs;
		node.output_schema = output_schema;
		node.output_origins = output_origins;
		node.input_edges = input_edges;
	}
	Ok(())
}

#[allow(clippy::type_complexity)]
fn infer_operator(
	id: OperatorId,
	details: &LogicalDetails,
	children: Vec<(Schema, Vec<OriginId>)>,
) -> Result<(Inputs, Schema, Vec<OriginId>, u32), Error> {
	match details {
		LogicalDetails::Source {
			descriptor,
			origin,
		} => {
			let mut schema = descriptor.schema.clone();
			if schema.sole_qualifier().is_none() {
				schema.requalify(&descriptor.logical_source);
			}
			Ok((
				Inputs::Unary {
					schema: Schema::new(),
					origins: Vec::new(),
				},
				schema,
				vec![*origin],
				0,
			))
		}
		LogicalDetails::Sink { .. }
		| LogicalDetails::Watermark { .. }
		| LogicalDetails::Iteration { .. } => {
			let (schema, origins) = unary_input(id, children)?;
			if let LogicalDetails::Watermark {
				strategy: crate::plan::WatermarkStrategy::EventTime {
					on_field,
					..
				},
			} = details
			{
				schema.resolve(on_field)?;
			}
			let out = schema.clone();
			let outo = origins.clone();
			Ok((
				Inputs::Unary {
					schema,
					origins,
				},
				out,
				outo,
				0,
			))
		}
		LogicalDetails::Filter {
			predicate,
		} => {
			let (schema, origins) = unary_input(id, children)?;
			let kind = predicate.kind(&schema)?;
			if kind != Kind::Bool {
				return Err(Error::SchemaMismatch {
					id,
					message: format!("filter predicate has kind {kind}, expected bool"),
				});
			}
			let out = schema.clone();
			let outo = origins.clone();
			Ok((
				Inputs::Unary {
					schema,
					origins,
				},
				out,
				outo,
				0,
			))
		}
		LogicalDetails::Projection {
			fields,
		} => {
			let (schema, origins) = unary_input(id, children)?;
			let mut out = Schema::new();
			for field in fields {
				let kind = field.expr.kind(&schema)?;
				let name = match (&field.alias, &field.expr) {
					(Some(alias), _) => qualify(alias, &schema),
					(None, crate::plan::Expr::Field(name)) => {
						schema.attribute(name)?.name().to_owned()
					}
					(None, expr) => {
						return Err(Error::SchemaMismatch {
							id,
							message: format!("projection expression '{expr}' requires an alias"),
						})
					}
				};
				out.push(Attribute::new(name, kind))?;
			}
			let outo = origins.clone();
			Ok((
				Inputs::Unary {
					schema,
					origins,
				},
				out,
				outo,
				0,
			))
		}
		LogicalDetails::Map {
			field,
			expr,
		} => {
			let (schema, origins) = unary_input(id, children)?;
			let kind = expr.kind(&schema)?;
			let name = qualify(field, &schema);
			let mut out = schema.clone();
			if !out.contains(&name) {
				out.push(Attribute::new(name, kind))?;
			}
			let outo = origins.clone();
			Ok((
				Inputs::Unary {
					schema,
					origins,
				},
				out,
				outo,
				0,
			))
		}
		LogicalDetails::MapUdf {
			descriptor,
		}
		| LogicalDetails::FlatMapUdf {
			descriptor,
		} => {
			let (schema, origins) = unary_input(id, children)?;
			let out = descriptor.output_schema.clone();
			let outo = origins.clone();
			Ok((
				Inputs::Unary {
					schema,
					origins,
				},
				out,
				outo,
				0,
			))
		}
		LogicalDetails::InferModel {
			input_fields,
			output_fields,
			..
		} => {
			let (schema, origins) = unary_input(id, children)?;
			for field in input_fields {
				schema.resolve(field)?;
			}
			let mut out = schema.clone();
			for field in output_fields {
				out.push(Attribute::new(qualify(&field.name, &schema), field.kind))?;
			}
			let outo = origins.clone();
			Ok((
				Inputs::Unary {
					schema,
					origins,
				},
				out,
				outo,
				0,
			))
		}
		LogicalDetails::Union => {
			let (left, left_origins, right, right_origins) = binary_input(id, children)?;
			if left.len() != right.len() {
				return Err(Error::SchemaMismatch {
					id,
					message: format!(
						"union inputs have {} and {} attributes",
						left.len(),
						right.len()
					),
				});
			}
			for (l, r) in left.attributes().iter().zip(right.attributes()) {
				if l.kind() != r.kind() {
					return Err(Error::SchemaMismatch {
						id,
						message: format!("union attribute kinds differ: {l} vs {r}"),
					});
				}
			}
			let origins = merged_origins(id, &left_origins, &right_origins)?;
			let out = left.clone();
			Ok((
				Inputs::Binary {
					left,
					right,
					left_origins,
					right_origins,
				},
				out,
				origins,
				0,
			))
		}
		LogicalDetails::Window {
			definition,
			..
		} => {
			let (schema, origins) = unary_input(id, children)?;
			if origins.is_empty() {
				return Err(Error::EmptyOriginSet {
					id,
				});
			}
			validate_window(id, &definition.window_type)?;
			if let TimeCharacteristic::EventTime {
				field,
				..
			} = &definition.time
			{
				if schema.resolve(field).is_err() {
					return Err(Error::InvalidWindow {
						id,
						message: " schema does not contain a timestamp attribute".to_owned(),
					});
				}
			}
			if let WindowType::Threshold {
				predicate,
				..
			} = &definition.window_type
			{
				predicate.kind(&schema)?;
			}
			let mut out = Schema::new();
			out.push(Attribute::new(qualify(&definition.start_field, &schema), Kind::U64))?;
			out.push(Attribute::new(qualify(&definition.end_field, &schema), Kind::U64))?;
			for key in &definition.keys {
				let attribute = schema.attribute(key)?;
				out.push(attribute.clone())?;
			}
			for aggregation in &definition.aggregations {
				let on = schema.attribute(&aggregation.on_field)?;
				if !on.kind().is_numeric()
					&& !matches!(aggregation.function, AggregateFunction::Count)
				{
					return Err(Error::InvalidWindow {
						id,
						message: format!(
							"aggregation {} cannot be applied to {}",
							aggregation.function, on
						),
					});
				}
				let kind = match aggregation.function {
					AggregateFunction::Sum
					| AggregateFunction::Min
					| AggregateFunction::Max => on.kind(),
					AggregateFunction::Count => Kind::U64,
					AggregateFunction::Avg | AggregateFunction::Median => Kind::F64,
				};
				out.push(Attribute::new(qualify(&aggregation.as_field, &schema), kind))?;
			}
			let edges = origins.len() as u32;
			let outo = origins.clone();
			Ok((
				Inputs::Unary {
					schema,
					origins,
				},
				out,
				outo,
				edges,
			))
		}
		LogicalDetails::Join {
			definition,
		} => {
			let (left, left_origins, right, right_origins) = binary_input(id, children)?;
			if left_origins.is_empty() || right_origins.is_empty() {
				return Err(Error::EmptyOriginSet {
					id,
				});
			}
			validate_window(id, &definition.window_type)?;
			if left.resolve(&definition.left_time_field).is_err()
				|| right.resolve(&definition.right_time_field).is_err()
			{
				return Err(Error::JoinTimestampMissing {
					id,
				});
			}
			if let Some((lk, rk)) = definition.keys() {
				// Align differently qualified key names on their common suffix
				let (lk, rk) = match (left.resolve(lk), right.resolve(rk)) {
					(Ok(_), Ok(_)) => (lk.to_owned(), rk.to_owned()),
					_ => match left.common_suffix(&right, lk, rk) {
						Some(suffix) => (suffix.to_owned(), suffix.to_owned()),
						None => {
							return Err(Error::SchemaMismatch {
								id,
								message: format!(
									"join keys '{lk}' and '{rk}' share no common suffix"
								),
							})
						}
					},
				};
				let lkind = left.kind_of(&lk)?;
				let rkind = right.kind_of(&rk)?;
				if lkind != rkind {
					return Err(Error::SchemaMismatch {
						id,
						message: format!("join key kinds differ: {lkind} vs {rkind}"),
					});
				}
			}
			// Combine both sides under a compound qualifier
			let lq = left.sole_qualifier().unwrap_or("left").to_owned();
			let rq = right.sole_qualifier().unwrap_or("right").to_owned();
			let compound = format!("{lq}{rq}");
			let mut out = Schema::new();
			out.push(Attribute::qualified(&compound, &definition.start_field, Kind::U64))?;
			out.push(Attribute::qualified(&compound, &definition.end_field, Kind::U64))?;
			out.extend(&left)?;
			out.extend(&right)?;
			let origins = merged_origins(id, &left_origins, &right_origins)?;
			Ok((
				Inputs::Binary {
					left,
					right,
					left_origins,
					right_origins,
				},
				out,
				origins,
				0,
			))
		}
	}
}

fn unary_input(
	id: OperatorId,
	mut children: Vec<(Schema, Vec<OriginId>)>,
) -> Result<(Schema, Vec<OriginId>), Error> {
	if children.is_empty() {
		return Err(Error::SchemaMismatch {
			id,
			message: "operator has no input".to_owned(),
		});
	}
	// Multiple children on a unary operator feed a multiplex during
	// lowering; their schemas must agree
	let (first, mut origins) = children.remove(0);
	for (schema, more) in children {
		if schema != first {
			return Err(Error::SchemaMismatch {
				id,
				message: format!("input schemas differ: {first} vs {schema}"),
			});
		}
		origins.extend(more);
	}
	Ok((first, origins))
}

#[allow(clippy::type_complexity)]
fn binary_input(
	id: OperatorId,
	mut children: Vec<(Schema, Vec<OriginId>)>,
) -> Result<(Schema, Vec<OriginId>, Schema, Vec<OriginId>), Error> {
	if children.len() != 2 {
		return Err(Error::SchemaMismatch {
			id,
			message: format!("binary operator has {} inputs, expected 2", children.len()),
		});
	}
	let (left, left_origins) = children.remove(0);
	let (right, right_origins) = children.remove(0);
	Ok((left, left_origins, right, right_origins))
}

fn merged_origins(
	id: OperatorId,
	left: &[OriginId],
	right: &[OriginId],
) -> Result<Vec<OriginId>, Error> {
	let mut all = left.to_vec();
	all.extend(right.iter().copied());
	let mut seen = std::collections::HashSet::new();
	for origin in &all {
		if !seen.insert(*origin) {
			return Err(Error::DuplicateOriginId {
				id,
				origin: *origin,
			});
		}
	}
	Ok(all)
}

fn validate_window(id: OperatorId, window: &WindowType) -> Result<(), Error> {
	match window {
		WindowType::Tumbling {
			size,
		} => {
			if *size == 0 {
				return Err(Error::InvalidWindow {
					id,
					message: "tumbling window size must be positive".to_owned(),
				});
			}
		}
		WindowType::Sliding {
			size,
			slide,
		} => {
			if *slide == 0 {
				return Err(Error::InvalidWindow {
					id,
					message: "sliding window slide must be positive".to_owned(),
				});
			}
			if slide > size {
				return Err(Error::InvalidWindow {
					id,
					message: format!("sliding window slide {slide} exceeds size {size}"),
				});
			}
		}
		WindowType::Threshold {
			..
		} => {}
	}
	Ok(())
}

/// Qualifies a bare field name with the schema's sole qualifier
pub(crate) fn qualify(name: &str, schema: &Schema) -> String {
	if name.contains(QUALIFIER_SEPARATOR) {
		return name.to_owned();
	}
	match schema.sole_qualifier() {
		Some(qualifier) => format!("{qualifier}{QUALIFIER_SEPARATOR}{name}"),
		None => name.to_owned(),
	}
}
