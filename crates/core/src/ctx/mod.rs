//! Per-query runtime state.
//!
//! A [`QueryContext`] owns every operator handler of one deployed query and
//! drives the physical pipeline: records flow from the sources through the
//! stateless operators into the stateful handlers, watermark advances pull
//! finished windows and join results towards the sinks, and undeploying
//! drains all handlers deterministically.

pub(crate) mod clock;

pub use clock::SizedClock;
pub use clock::SystemClock;

use crate::buf::BufferManager;
use crate::cnf;
use crate::cnf::CompilerOptions;
use crate::cnf::QueryCompilerType;
use crate::err::Error;
use crate::exe;
use crate::exe::ExecContext;
use crate::exe::IrFunction;
use crate::exe::PipelineStep;
use crate::exe::ProxyRegistry;
use crate::join::BuildSide;
use crate::phy::PhysicalDetails;
use crate::phy::PhysicalPlan;
use crate::phy::WindowHandlerRef;
use crate::plan::OperatorId;
use crate::plan::OriginId;
use crate::plan::WatermarkStrategy;
use crate::sch::Schema;
use crate::sch::Value;
use crate::win::StreamRecord;
use ahash::AHashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// The lifecycle of one deployed query
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum QueryState {
	Running,
	Draining,
	Stopped,
	Failed(String),
}

/// A user-defined function callable from map and flat-map operators; one
/// input row maps to any number of output rows
pub type UdfFn = Box<dyn Fn(&[Value]) -> Vec<Vec<Value>> + Send + Sync>;

/// What flows along a physical edge at runtime
enum Flow {
	Record(StreamRecord),
	Watermark(u64),
}

/// The runtime of one deployed query.
///
/// All shared operator handlers are owned here; dropping the context after
/// [`QueryContext::undeploy`] releases every handler deterministically.
pub struct QueryContext {
	plan: PhysicalPlan,
	options: CompilerOptions,
	buffers: BufferManager,
	clock: SizedClock,
	state: Mutex<QueryState>,
	sources: AHashMap<OriginId, OperatorId>,
	outputs: Mutex<AHashMap<OperatorId, Vec<StreamRecord>>>,
	/// Per-assigner, per-origin maximum stamped timestamp
	stamped: Mutex<AHashMap<(OperatorId, OriginId), u64>>,
	/// Per-origin and per-CEP-operator match counters
	iterations: Mutex<AHashMap<(OperatorId, OriginId), u64>>,
	compiled: AHashMap<OperatorId, CompiledStage>,
	registry: ProxyRegistry,
	udfs: AHashMap<String, UdfFn>,
}

struct CompiledStage {
	function: IrFunction,
	input: Schema,
	output: Schema,
}

impl QueryContext {
	/// Deploys a lowered plan, creating the per-query runtime state
	pub fn deploy(
		plan: PhysicalPlan,
		options: CompilerOptions,
		buffers: BufferManager,
	) -> Result<Self, Error> {
		let mut sources = AHashMap::new();
		for node in plan.nodes() {
			if let PhysicalDetails::Source {
				origin,
				..
			} = &node.details
			{
				sources.insert(*origin, node.id);
			}
		}
		let mut compiled = AHashMap::new();
		if options.compiler_type == QueryCompilerType::Compiled {
			for node in plan.nodes() {
				let step = match &node.details {
					PhysicalDetails::Filter {
						predicate,
					} => PipelineStep::Filter {
						predicate: predicate.clone(),
					},
					PhysicalDetails::Map {
						field,
						expr,
					} => PipelineStep::Map {
						field: field.clone(),
						expr: expr.clone(),
					},
					PhysicalDetails::Project {
						fields,
					} => PipelineStep::Project {
						fields: fields.clone(),
					},
					_ => continue,
				};
				let name = format!("stage_{}", node.id);
				match exe::compile_pipeline(
					&name,
					&node.input_schema,
					&node.output_schema,
					&[step],
				) {
					Ok(function) => {
						debug!("Compiled {} to IR", node.id);
						compiled.insert(
							node.id,
							CompiledStage {
								function,
								input: node.input_schema.clone(),
								output: node.output_schema.clone(),
							},
						);
					}
					// Stages outside the compiled domain run interpreted
					Err(error) => trace!("Stage {} stays interpreted: {error}", node.id),
				}
			}
		}
		debug!("Deployed query with {} physical operators", plan.len());
		Ok(QueryContext {
			plan,
			options,
			buffers,
			clock: SizedClock::default(),
			state: Mutex::new(QueryState::Running),
			sources,
			outputs: Mutex::new(AHashMap::new()),
			stamped: Mutex::new(AHashMap::new()),
			iterations: Mutex::new(AHashMap::new()),
			compiled,
			registry: ProxyRegistry::new(),
			udfs: AHashMap::new(),
		})
	}

	/// Registers a user-defined function trampoline before records flow
	pub fn register_udf(
		&mut self,
		symbol: impl Into<String>,
		function: impl Fn(&[Value]) -> Vec<Vec<Value>> + Send + Sync + 'static,
	) {
		self.udfs.insert(symbol.into(), Box::new(function));
	}

	/// The current lifecycle state
	pub fn state(&self) -> QueryState {
		self.state.lock().expect("unreachable: query state poisoned").clone()
	}

	/// Feeds one batch of records from an origin, advancing its watermark
	/// to the largest observed timestamp
	pub fn process(&self, origin: OriginId, batch: Vec<StreamRecord>) -> Result<(), Error> {
		if self.state() != QueryState::Running {
			return Err(Error::QueryFailed {
				id: OperatorId::default(),
				origin,
				watermark: 0,
				message: format!("query is not running but {:?}", self.state()),
			});
		}
		let source = *self.sources.get(&origin).ok_or(Error::EmptyOriginSet {
			id: OperatorId::default(),
		})?;
		let worker = origin.0 as usize % self.options.worker_threads.max(1);
		let mut watermark = 0;
		let result = (|| -> Result<(), Error> {
			for record in batch {
				watermark = watermark.max(record.ts);
				self.inject(source, worker, origin, Flow::Record(record))?;
			}
			self.inject(source, worker, origin, Flow::Watermark(watermark))
		})();
		if let Err(error) = result {
			let failure = Error::QueryFailed {
				id: source,
				origin,
				watermark,
				message: error.to_string(),
			};
			self.fail(&failure);
			return Err(failure);
		}
		Ok(())
	}

	/// The records a sink has produced so far; draining them resets the
	/// sink's buffer
	pub fn take_sink_output(&self, sink: OperatorId) -> Vec<StreamRecord> {
		self.outputs
			.lock()
			.expect("unreachable: sink outputs poisoned")
			.remove(&sink)
			.unwrap_or_default()
	}

	/// Marks the query as draining, flushes every handler and emits all
	/// pending windows, then stops the query
	pub fn undeploy(&self) -> Result<(), Error> {
		*self.state.lock().expect("unreachable: query state poisoned") = QueryState::Draining;
		debug!("Undeploying query; draining all handlers");
		let order = self.plan.topological();
		// Terminal markers flow from pre-aggregators and builds first
		for id in &order {
			let node = self.plan.node(*id).expect("unreachable: plan node disappeared");
			match &node.details {
				PhysicalDetails::SlicePreAggregation {
					handler,
				} => match handler {
					WindowHandlerRef::Keyed(handler) => handler.drain()?,
					WindowHandlerRef::Global(handler) => handler.drain()?,
				},
				PhysicalDetails::ThresholdWindow {
					handler,
				} => {
					for row in handler.flush() {
						let record = row.into_record();
						for parent in node.parents.clone() {
							self.inject(parent, 0, OriginId::default(), Flow::Record(record.clone()))?;
						}
					}
				}
				_ => {}
			}
		}
		// Then the sinks flush whatever became complete
		for id in &order {
			let node = self.plan.node(*id).expect("unreachable: plan node disappeared");
			match &node.details {
				PhysicalDetails::WindowSink {
					handler,
				}
				| PhysicalDetails::SlidingWindowSink {
					handler,
				} => {
					let rows = match handler {
						WindowHandlerRef::Keyed(handler) => handler.poll_windows()?,
						WindowHandlerRef::Global(handler) => handler.poll_windows()?,
					};
					for row in rows {
						let record = row.into_record();
						for parent in node.parents.clone() {
							self.inject(parent, 0, OriginId::default(), Flow::Record(record.clone()))?;
						}
					}
				}
				PhysicalDetails::JoinSink {
					handler,
				} => {
					let out_origin = handler.definition().output_origin;
					for record in handler.drain()? {
						for parent in node.parents.clone() {
							self.inject(parent, 0, out_origin, Flow::Record(record.clone()))?;
						}
					}
				}
				_ => {}
			}
		}
		*self.state.lock().expect("unreachable: query state poisoned") = QueryState::Stopped;
		Ok(())
	}

	fn fail(&self, error: &Error) {
		error!("Query failed: {error}");
		*self.state.lock().expect("unreachable: query state poisoned") =
			QueryState::Failed(error.to_string());
	}

	/// Routes one flow unit through a physical operator
	fn inject(
		&self,
		id: OperatorId,
		worker: usize,
		origin: OriginId,
		flow: Flow,
	) -> Result<(), Error> {
		let node = self.plan.node(id).ok_or(Error::UnknownOperator {
			id,
		})?;
		match (&node.details, flow) {
			(PhysicalDetails::Source { .. }, flow) => self.forward(node, worker, origin, flow),
			(PhysicalDetails::Sink { .. }, Flow::Record(record)) => {
				self.outputs
					.lock()
					.expect("unreachable: sink outputs poisoned")
					.entry(id)
					.or_default()
					.push(record);
				Ok(())
			}
			(PhysicalDetails::Sink { .. }, Flow::Watermark(_)) => Ok(()),
			(PhysicalDetails::Multiplex, flow) | (PhysicalDetails::Demultiplex, flow) => {
				self.forward(node, worker, origin, flow)
			}
			(PhysicalDetails::Filter { predicate }, Flow::Record(record)) => {
				if let Some(stage) = self.compiled.get(&id) {
					return self.run_compiled(node, stage, worker, origin, record);
				}
				if predicate.compute(&node.input_schema, &record.row)?.is_truthy() {
					self.forward(node, worker, origin, Flow::Record(record))?;
				}
				Ok(())
			}
			(PhysicalDetails::Map { field, expr }, Flow::Record(record)) => {
				if let Some(stage) = self.compiled.get(&id) {
					return self.run_compiled(node, stage, worker, origin, record);
				}
				let value = expr.compute(&node.input_schema, &record.row)?;
				let mut row = record.row;
				let name = crate::plan::infer::qualify(field, &node.input_schema);
				match node.input_schema.resolve(&name) {
					Ok(idx) => row[idx] = value,
					Err(_) => row.push(value),
				}
				self.forward(node, worker, origin, Flow::Record(StreamRecord::new(record.ts, row)))
			}
			(PhysicalDetails::Project { fields }, Flow::Record(record)) => {
				if let Some(stage) = self.compiled.get(&id) {
					return self.run_compiled(node, stage, worker, origin, record);
				}
				let mut row = Vec::with_capacity(fields.len());
				for field in fields {
					row.push(field.expr.compute(&node.input_schema, &record.row)?);
				}
				self.forward(node, worker, origin, Flow::Record(StreamRecord::new(record.ts, row)))
			}
			(PhysicalDetails::MapUdf { descriptor }, Flow::Record(record)) => {
				let udf = self.udfs.get(&descriptor.symbol).ok_or_else(|| {
					Error::UnknownProxySymbol {
						symbol: descriptor.symbol.clone(),
					}
				})?;
				let mut rows = udf(&record.row);
				let row = rows.drain(..).next().unwrap_or_default();
				self.forward(node, worker, origin, Flow::Record(StreamRecord::new(record.ts, row)))
			}
			(PhysicalDetails::FlatMapUdf { descriptor }, Flow::Record(record)) => {
				let udf = self.udfs.get(&descriptor.symbol).ok_or_else(|| {
					Error::UnknownProxySymbol {
						symbol: descriptor.symbol.clone(),
					}
				})?;
				for row in udf(&record.row) {
					self.forward(
						node,
						worker,
						origin,
						Flow::Record(StreamRecord::new(record.ts, row)),
					)?;
				}
				Ok(())
			}
			(PhysicalDetails::WatermarkAssignment { strategy }, Flow::Record(record)) => {
				let ts = match strategy {
					WatermarkStrategy::EventTime {
						on_field,
						multiplier,
					} => {
						let idx = node.input_schema.resolve(on_field)?;
						record.row[idx].as_u64().unwrap_or(record.ts) * multiplier
					}
					WatermarkStrategy::IngestionTime => self.clock.now(),
				};
				let mut stamped =
					self.stamped.lock().expect("unreachable: stamped map poisoned");
				let entry = stamped.entry((id, origin)).or_insert(0);
				*entry = (*entry).max(ts);
				drop(stamped);
				self.forward(node, worker, origin, Flow::Record(StreamRecord::new(ts, record.row)))
			}
			(PhysicalDetails::WatermarkAssignment { .. }, Flow::Watermark(upstream)) => {
				let stamped = self.stamped.lock().expect("unreachable: stamped map poisoned");
				let watermark = stamped.get(&(id, origin)).copied().unwrap_or(upstream);
				drop(stamped);
				self.forward(node, worker, origin, Flow::Watermark(watermark))
			}
			(PhysicalDetails::IterationCep { min, max }, Flow::Record(record)) => {
				let mut iterations =
					self.iterations.lock().expect("unreachable: iteration map poisoned");
				let seen = iterations.entry((id, origin)).or_insert(0);
				*seen += 1;
				let emit = *seen >= *min && *seen <= *max;
				drop(iterations);
				if emit {
					self.forward(node, worker, origin, Flow::Record(record))?;
				}
				Ok(())
			}
			(PhysicalDetails::SlicePreAggregation { handler }, Flow::Record(record)) => {
				match handler {
					WindowHandlerRef::Keyed(handler) => {
						handler.on_record(worker, origin, &record)?
					}
					WindowHandlerRef::Global(handler) => {
						handler.on_record(worker, origin, &record)?
					}
				}
				Ok(())
			}
			(PhysicalDetails::SlicePreAggregation { handler }, Flow::Watermark(watermark)) => {
				match handler {
					WindowHandlerRef::Keyed(handler) => handler.on_watermark(origin, watermark)?,
					WindowHandlerRef::Global(handler) => {
						handler.on_watermark(origin, watermark)?
					}
				}
				self.forward(node, worker, origin, Flow::Watermark(watermark))
			}
			(PhysicalDetails::SliceMerging { .. }, flow) => {
				// Merging happens when the sink polls the shared handler
				self.forward(node, worker, origin, flow)
			}
			(
				PhysicalDetails::WindowSink { handler }
				| PhysicalDetails::SlidingWindowSink { handler },
				Flow::Watermark(watermark),
			) => {
				let rows = match handler {
					WindowHandlerRef::Keyed(handler) => handler.poll_windows()?,
					WindowHandlerRef::Global(handler) => handler.poll_windows()?,
				};
				for row in rows {
					self.forward(node, worker, origin, Flow::Record(row.into_record()))?;
				}
				self.forward(node, worker, origin, Flow::Watermark(watermark))
			}
			(
				PhysicalDetails::WindowSink { .. } | PhysicalDetails::SlidingWindowSink { .. },
				Flow::Record(_),
			) => Ok(()),
			(PhysicalDetails::ThresholdWindow { handler }, Flow::Record(record)) => {
				if let Some(row) = handler.on_record(origin, &record)? {
					self.forward(node, worker, origin, Flow::Record(row.into_record()))?;
				}
				Ok(())
			}
			(PhysicalDetails::ThresholdWindow { .. }, Flow::Watermark(watermark)) => {
				self.forward(node, worker, origin, Flow::Watermark(watermark))
			}
			(PhysicalDetails::JoinBuild { side, handler }, Flow::Record(record)) => {
				handler.on_record(*side, worker, &record)?;
				Ok(())
			}
			(PhysicalDetails::JoinBuild { side, handler }, Flow::Watermark(watermark)) => {
				handler.on_watermark(*side, origin, watermark);
				self.forward(node, worker, origin, Flow::Watermark(watermark))
			}
			(PhysicalDetails::JoinSink { handler }, Flow::Watermark(watermark)) => {
				// Joined records carry the join's own output origin
				let out_origin = handler.definition().output_origin;
				for record in handler.poll_output()? {
					self.forward(node, worker, out_origin, Flow::Record(record))?;
				}
				self.forward(node, worker, origin, Flow::Watermark(watermark))
			}
			(PhysicalDetails::JoinSink { .. }, Flow::Record(_)) => Ok(()),
			(
				PhysicalDetails::Filter { .. }
				| PhysicalDetails::Map { .. }
				| PhysicalDetails::Project { .. }
				| PhysicalDetails::MapUdf { .. }
				| PhysicalDetails::FlatMapUdf { .. }
				| PhysicalDetails::IterationCep { .. },
				Flow::Watermark(watermark),
			) => self.forward(node, worker, origin, Flow::Watermark(watermark)),
			(details, _) => Err(Error::UnknownOperator {
				id: {
					trace!("No runtime for {}", details.name());
					id
				},
			}),
		}
	}

	/// Passes a flow unit to every parent of a node
	fn forward(
		&self,
		node: &crate::phy::PhysicalOperator,
		worker: usize,
		origin: OriginId,
		flow: Flow,
	) -> Result<(), Error> {
		match flow {
			Flow::Record(record) => {
				for parent in &node.parents {
					self.inject(*parent, worker, origin, Flow::Record(record.clone()))?;
				}
			}
			Flow::Watermark(watermark) => {
				for parent in &node.parents {
					self.inject(*parent, worker, origin, Flow::Watermark(watermark))?;
				}
			}
		}
		Ok(())
	}

	/// Executes one record through a compiled stage, materializing it in a
	/// tuple buffer from the pool
	fn run_compiled(
		&self,
		node: &crate::phy::PhysicalOperator,
		stage: &CompiledStage,
		worker: usize,
		origin: OriginId,
		record: StreamRecord,
	) -> Result<(), Error> {
		let buffer = self.with_retry(|| self.buffers.get_buffer_blocking())?;
		// Materialize the row at the start of the buffer
		buffer.with_data_mut(|data| {
			for (idx, value) in record.row.iter().enumerate() {
				let offset = stage.input.offset_of(idx) as usize;
				let len = stage.input.attributes()[idx].kind().width() as usize;
				value.write_to(&mut data[offset..offset + len]);
			}
		});
		let input = buffer.to_vec();
		let out_width = stage.output.row_width() as usize;
		let mut ctx = ExecContext::new(input, out_width, 1);
		exe::run(&stage.function, &self.registry, &mut ctx)?;
		for row_idx in 0..ctx.tuples_out() as usize {
			let mut row = Vec::with_capacity(stage.output.len());
			for (idx, attribute) in stage.output.attributes().iter().enumerate() {
				let offset = row_idx * out_width + stage.output.offset_of(idx) as usize;
				let len = attribute.kind().width() as usize;
				row.push(Value::read_from(
					attribute.kind(),
					&ctx.output()[offset..offset + len],
				));
			}
			self.forward(node, worker, origin, Flow::Record(StreamRecord::new(record.ts, row)))?;
		}
		Ok(())
	}

	/// Retries a transient buffer failure with bounded backoff
	fn with_retry<T>(&self, mut f: impl FnMut() -> Result<T, Error>) -> Result<T, Error> {
		let mut attempt = 0;
		loop {
			match f() {
				Ok(value) => return Ok(value),
				Err(error) if error.is_transient() && attempt < *cnf::TRANSIENT_RETRIES => {
					attempt += 1;
					trace!("Transient buffer error, retrying ({attempt}): {error}");
					std::thread::sleep(Duration::from_millis(attempt as u64));
				}
				Err(error) => return Err(error),
			}
		}
	}
}

impl fmt::Debug for QueryContext {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("QueryContext")
			.field("operators", &self.plan.len())
			.field("state", &self.state())
			.finish()
	}
}
