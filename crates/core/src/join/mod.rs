//! The stream join engine.
//!
//! A windowed join builds per-window state on both sides and probes once
//! both sides' watermarks passed the window end. Four build strategies are
//! selectable per query: per-worker hash tables merged at the window
//! boundary, a striped-lock shared table, a lock-free shared table, and
//! paged nested-loop vectors.

pub(crate) mod paged;
pub(crate) mod state;

use crate::cnf::HashJoinOptions;
use crate::cnf::StreamJoinStrategy;
use crate::err::Error;
use crate::join::state::SideState;
use crate::plan::JoinDefinition;
use crate::plan::JoinType;
use crate::plan::OriginId;
use crate::sch::Schema;
use crate::sch::Value;
use crate::win::HandlerState;
use crate::win::StreamRecord;
use crate::win::WatermarkTracker;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

/// Which input of a join a build operator feeds
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum BuildSide {
	Left,
	Right,
}

impl fmt::Display for BuildSide {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			BuildSide::Left => write!(f, "Left"),
			BuildSide::Right => write!(f, "Right"),
		}
	}
}

/// The lifecycle of one join window
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JoinPhase {
	/// Created, no rows buffered yet
	Buffering,
	/// At least one side is receiving rows
	Building,
	/// Both sides sealed; pairs are being produced
	Probing,
	/// Output produced; awaiting garbage collection
	Emitted,
}

struct JoinWindow {
	phase: JoinPhase,
	left: SideState,
	right: SideState,
}

/// The shared state between both build operators and the sink of one
/// stream join.
///
/// Build operators insert rows into the window state of their side; the
/// sink probes a window once the watermarks of both sides passed its end,
/// emitting the combined rows with the compound window schema.
pub struct JoinHandler {
	definition: JoinDefinition,
	strategy: StreamJoinStrategy,
	options: HashJoinOptions,
	left_schema: Schema,
	right_schema: Schema,
	left_key: Option<usize>,
	right_key: Option<usize>,
	size: u64,
	slide: u64,
	workers: usize,
	left_tracker: WatermarkTracker,
	right_tracker: WatermarkTracker,
	windows: Mutex<BTreeMap<u64, JoinWindow>>,
	emitted_to: Mutex<u64>,
	state: Mutex<HandlerState>,
}

impl JoinHandler {
	pub fn new(
		definition: JoinDefinition,
		strategy: StreamJoinStrategy,
		options: HashJoinOptions,
		left_schema: Schema,
		right_schema: Schema,
		left_origins: Vec<OriginId>,
		right_origins: Vec<OriginId>,
		workers: usize,
	) -> Result<Self, Error> {
		let (size, slide) = match (definition.window_type.size(), definition.window_type.slide()) {
			(Some(size), Some(slide)) => (size, slide),
			_ => {
				return Err(Error::InvalidWindow {
					id: Default::default(),
					message: "stream joins require a sized window".to_owned(),
				})
			}
		};
		let (left_key, right_key) = match definition.join_type {
			JoinType::Cartesian => (None, None),
			JoinType::Inner => match definition.keys() {
				Some((left, right)) => (
					Some(left_schema.resolve(left)?),
					Some(right_schema.resolve(right)?),
				),
				None => (None, None),
			},
		};
		Ok(JoinHandler {
			definition,
			strategy,
			options,
			left_key,
			right_key,
			size,
			slide,
			workers: workers.max(1),
			left_tracker: WatermarkTracker::new(left_origins),
			right_tracker: WatermarkTracker::new(right_origins),
			windows: Mutex::new(BTreeMap::new()),
			emitted_to: Mutex::new(0),
			state: Mutex::new(HandlerState::Running),
			left_schema,
			right_schema,
		})
	}

	/// Buffers one record into every window it falls into
	pub fn on_record(
		&self,
		side: BuildSide,
		worker: usize,
		record: &StreamRecord,
	) -> Result<(), Error> {
		let key = match side {
			BuildSide::Left => self.left_key,
			BuildSide::Right => self.right_key,
		};
		let key = match key {
			Some(idx) => record.row[idx].clone(),
			None => Value::Bool(true),
		};
		let row_width = record.row.len();
		let mut windows = self.windows.lock().expect("unreachable: join windows poisoned");
		for wstart in self.windows_of(record.ts) {
			let window = windows.entry(wstart).or_insert_with(|| JoinWindow {
				phase: JoinPhase::Buffering,
				left: SideState::new(self.strategy, &self.options, self.workers, row_width),
				right: SideState::new(self.strategy, &self.options, self.workers, row_width),
			});
			window.phase = match window.phase {
				JoinPhase::Buffering => JoinPhase::Building,
				phase => phase,
			};
			match side {
				BuildSide::Left => window.left.insert(worker, key.clone(), record.row.clone()),
				BuildSide::Right => window.right.insert(worker, key.clone(), record.row.clone()),
			}
		}
		Ok(())
	}

	/// Advances one side's watermark
	pub fn on_watermark(&self, side: BuildSide, origin: OriginId, ts: u64) {
		match side {
			BuildSide::Left => self.left_tracker.update(origin, ts),
			BuildSide::Right => self.right_tracker.update(origin, ts),
		};
	}

	/// Emits every window sealed on both sides, in non-decreasing end
	/// order, and garbage-collects its state
	pub fn poll_output(&self) -> Result<Vec<StreamRecord>, Error> {
		let sealed = match (self.left_tracker.current(), self.right_tracker.current()) {
			(Some(left), Some(right)) => left.min(right),
			_ => return Ok(Vec::new()),
		};
		self.emit_below(sealed)
	}

	/// Flushes all remaining windows on teardown
	pub fn drain(&self) -> Result<Vec<StreamRecord>, Error> {
		*self.state.lock().expect("unreachable: join state poisoned") = HandlerState::Draining;
		for origin in self.left_tracker.origins().to_vec() {
			self.left_tracker.terminate(origin);
		}
		for origin in self.right_tracker.origins().to_vec() {
			self.right_tracker.terminate(origin);
		}
		let rows = self.emit_below(u64::MAX)?;
		*self.state.lock().expect("unreachable: join state poisoned") = HandlerState::Terminated;
		Ok(rows)
	}

	/// The lifecycle phase of the window starting at `wstart`, if present
	pub fn window_phase(&self, wstart: u64) -> Option<JoinPhase> {
		self.windows
			.lock()
			.expect("unreachable: join windows poisoned")
			.get(&wstart)
			.map(|window| window.phase)
	}

	/// The current lifecycle state of the handler
	pub fn state(&self) -> HandlerState {
		*self.state.lock().expect("unreachable: join state poisoned")
	}

	pub fn definition(&self) -> &JoinDefinition {
		&self.definition
	}

	/// The output schema qualifier compound of both input qualifiers
	pub fn compound_qualifier(&self) -> String {
		let left = self.left_schema.sole_qualifier().unwrap_or("left");
		let right = self.right_schema.sole_qualifier().unwrap_or("right");
		format!("{left}{right}")
	}

	fn emit_below(&self, sealed: u64) -> Result<Vec<StreamRecord>, Error> {
		let mut windows = self.windows.lock().expect("unreachable: join windows poisoned");
		let mut emitted_to = self.emitted_to.lock().expect("unreachable: join emit poisoned");
		let mut out = Vec::new();
		let ready: Vec<u64> = windows
			.iter()
			.filter(|(wstart, window)| {
				let wend = **wstart + self.size;
				wend <= sealed && window.phase != JoinPhase::Emitted && wend > *emitted_to
			})
			.map(|(wstart, _)| *wstart)
			.collect();
		for wstart in ready {
			let window = windows.get_mut(&wstart).expect("unreachable: join window disappeared");
			window.phase = JoinPhase::Probing;
			let wend = wstart + self.size;
			out.extend(self.probe(wstart, wend, window)?);
			window.phase = JoinPhase::Emitted;
			*emitted_to = wend;
		}
		// Windows whose output left the handler are collected; late
		// re-opened windows below the emission horizon never re-emit
		let horizon = *emitted_to;
		windows.retain(|wstart, window| {
			window.phase != JoinPhase::Emitted && wstart + self.size > horizon
		});
		Ok(out)
	}

	fn probe(&self, wstart: u64, wend: u64, window: &JoinWindow) -> Result<Vec<StreamRecord>, Error> {
		let mut rows = Vec::new();
		let paged = self.strategy == StreamJoinStrategy::NestedLoopJoin;
		match self.definition.join_type {
			JoinType::Inner if self.left_key.is_some() && !paged => {
				let left = window.left.merged();
				let right = window.right.merged();
				let mut keys: Vec<&Value> = left.keys().collect();
				keys.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
				for key in keys {
					let Some(matching) = right.get(key) else {
						continue;
					};
					for left_row in &left[key] {
						for right_row in matching {
							rows.push(self.joined(wstart, wend, left_row, right_row));
						}
					}
				}
			}
			_ => {
				// Pairwise probing iterates all pairs within the window; an
				// inner join still applies the key predicate per pair
				let keys = match self.definition.join_type {
					JoinType::Inner => self.left_key.zip(self.right_key),
					JoinType::Cartesian => None,
				};
				for left_row in window.left.all_rows() {
					for right_row in window.right.all_rows() {
						if let Some((l, r)) = keys {
							if left_row[l] != right_row[r] {
								continue;
							}
						}
						rows.push(self.joined(wstart, wend, &left_row, &right_row));
					}
				}
			}
		}
		trace!("Join window [{wstart}, {wend}) produced {} rows", rows.len());
		Ok(rows)
	}

	fn joined(
		&self,
		wstart: u64,
		wend: u64,
		left: &[Value],
		right: &[Value],
	) -> StreamRecord {
		let mut row = Vec::with_capacity(2 + left.len() + right.len());
		row.push(Value::U64(wstart));
		row.push(Value::U64(wend));
		row.extend(left.iter().cloned());
		row.extend(right.iter().cloned());
		StreamRecord {
			ts: wstart,
			row,
		}
	}

	fn windows_of(&self, ts: u64) -> Vec<u64> {
		let base = ts - ts % self.slide;
		let first = base.saturating_sub(self.size - self.slide);
		(0..)
			.map(|i| first + i * self.slide)
			.take_while(|wstart| *wstart <= ts && ts < wstart + self.size)
			.collect()
	}
}
