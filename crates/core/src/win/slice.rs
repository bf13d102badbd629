use crate::err::Error;
use crate::plan::AggregateFunction;
use crate::plan::Aggregation;
use crate::sch::Kind;
use crate::sch::Schema;
use crate::sch::Value;
use ahash::AHashMap;

/// The running state of one aggregation function
#[derive(Clone, Debug)]
pub enum AggState {
	Sum(Value),
	Min(Option<Value>),
	Max(Option<Value>),
	Count(u64),
	Avg {
		sum: f64,
		count: u64,
	},
	Median(Vec<f64>),
}

impl AggState {
	fn new(function: AggregateFunction, kind: Kind) -> Self {
		match function {
			AggregateFunction::Sum => AggState::Sum(Value::zero(kind)),
			AggregateFunction::Min => AggState::Min(None),
			AggregateFunction::Max => AggState::Max(None),
			AggregateFunction::Count => AggState::Count(0),
			AggregateFunction::Avg => AggState::Avg {
				sum: 0.0,
				count: 0,
			},
			AggregateFunction::Median => AggState::Median(Vec::new()),
		}
	}

	fn update(&mut self, value: &Value) -> Result<(), Error> {
		match self {
			AggState::Sum(sum) => *sum = sum.try_add(value)?,
			AggState::Min(min) => match min {
				Some(current) if *current <= *value => {}
				_ => *min = Some(value.clone()),
			},
			AggState::Max(max) => match max {
				Some(current) if *current >= *value => {}
				_ => *max = Some(value.clone()),
			},
			AggState::Count(count) => *count += 1,
			AggState::Avg {
				sum,
				count,
			} => {
				*sum += value.as_f64();
				*count += 1;
			}
			AggState::Median(samples) => samples.push(value.as_f64()),
		}
		Ok(())
	}

	fn combine(&mut self, other: &AggState) -> Result<(), Error> {
		match (self, other) {
			(AggState::Sum(l), AggState::Sum(r)) => *l = l.try_add(r)?,
			(AggState::Min(l), AggState::Min(r)) => {
				if let Some(r) = r {
					match l {
						Some(current) if *current <= *r => {}
						_ => *l = Some(r.clone()),
					}
				}
			}
			(AggState::Max(l), AggState::Max(r)) => {
				if let Some(r) = r {
					match l {
						Some(current) if *current >= *r => {}
						_ => *l = Some(r.clone()),
					}
				}
			}
			(AggState::Count(l), AggState::Count(r)) => *l += r,
			(
				AggState::Avg {
					sum,
					count,
				},
				AggState::Avg {
					sum: rsum,
					count: rcount,
				},
			) => {
				*sum += rsum;
				*count += rcount;
			}
			(AggState::Median(l), AggState::Median(r)) => l.extend_from_slice(r),
			_ => {
				return Err(Error::InvalidArithmetic {
					message: "cannot combine differing aggregation states".to_owned(),
				})
			}
		}
		Ok(())
	}

	fn finalize(&self) -> Value {
		match self {
			AggState::Sum(sum) => sum.clone(),
			AggState::Min(min) => min.clone().unwrap_or(Value::U64(0)),
			AggState::Max(max) => max.clone().unwrap_or(Value::U64(0)),
			AggState::Count(count) => Value::U64(*count),
			AggState::Avg {
				sum,
				count,
			} => Value::F64(if *count == 0 {
				0.0
			} else {
				sum / *count as f64
			}),
			AggState::Median(samples) => {
				if samples.is_empty() {
					return Value::F64(0.0);
				}
				let mut sorted = samples.clone();
				sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
				let mid = sorted.len() / 2;
				let median = if sorted.len() % 2 == 0 {
					(sorted[mid - 1] + sorted[mid]) / 2.0
				} else {
					sorted[mid]
				};
				Value::F64(median)
			}
		}
	}
}

/// The aggregation state of one group within one slice
#[derive(Clone, Debug)]
pub struct AggregationCell {
	states: Vec<AggState>,
}

impl AggregationCell {
	/// Seeds one state per aggregation column
	pub fn new(aggregations: &[Aggregation], schema: &Schema) -> Result<Self, Error> {
		let mut states = Vec::with_capacity(aggregations.len());
		for aggregation in aggregations {
			let kind = schema.kind_of(&aggregation.on_field)?;
			states.push(AggState::new(aggregation.function, kind));
		}
		Ok(AggregationCell {
			states,
		})
	}

	/// Feeds one record into every aggregation state
	pub fn update(&mut self, inputs: &[usize], row: &[Value]) -> Result<(), Error> {
		for (state, input) in self.states.iter_mut().zip(inputs) {
			state.update(&row[*input])?;
		}
		Ok(())
	}

	/// Merges another cell of the same layout into this one
	pub fn combine(&mut self, other: &AggregationCell) -> Result<(), Error> {
		for (state, other) in self.states.iter_mut().zip(&other.states) {
			state.combine(other)?;
		}
		Ok(())
	}

	/// The final aggregate values, one per aggregation column
	pub fn finalize(&self) -> Vec<Value> {
		self.states.iter().map(|state| state.finalize()).collect()
	}
}

/// The pre-aggregated payload of one slice
#[derive(Clone, Debug)]
pub enum SliceData {
	Global(AggregationCell),
	Keyed(AHashMap<Vec<Value>, AggregationCell>),
}

/// Pre-aggregated state for one contiguous half-open time interval,
/// produced per origin and per worker
#[derive(Clone, Debug)]
pub struct Slice {
	pub start: u64,
	pub end: u64,
	pub tuples: u64,
	pub data: SliceData,
}

impl Slice {
	pub fn global(start: u64, end: u64, aggregations: &[Aggregation], schema: &Schema) -> Result<Self, Error> {
		Ok(Slice {
			start,
			end,
			tuples: 0,
			data: SliceData::Global(AggregationCell::new(aggregations, schema)?),
		})
	}

	pub fn keyed(start: u64, end: u64) -> Self {
		Slice {
			start,
			end,
			tuples: 0,
			data: SliceData::Keyed(AHashMap::new()),
		}
	}

	/// Merges a slice covering the same interval into this one
	pub fn merge_from(&mut self, other: &Slice) -> Result<(), Error> {
		debug_assert_eq!(self.start, other.start);
		debug_assert_eq!(self.end, other.end);
		self.tuples += other.tuples;
		match (&mut self.data, &other.data) {
			(SliceData::Global(l), SliceData::Global(r)) => l.combine(r),
			(SliceData::Keyed(l), SliceData::Keyed(r)) => {
				for (key, cell) in r {
					match l.get_mut(key) {
						Some(existing) => existing.combine(cell)?,
						None => {
							l.insert(key.clone(), cell.clone());
						}
					}
				}
				Ok(())
			}
			_ => Err(Error::InvalidArithmetic {
				message: "cannot merge keyed and global slices".to_owned(),
			}),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn schema() -> Schema {
		Schema::from_fields([("s$value", Kind::U64)]).unwrap()
	}

	fn aggregations() -> Vec<Aggregation> {
		vec![
			Aggregation::new(AggregateFunction::Sum, "value", "sum"),
			Aggregation::new(AggregateFunction::Count, "value", "cnt"),
			Aggregation::new(AggregateFunction::Avg, "value", "avg"),
		]
	}

	#[test]
	fn cell_aggregates_and_finalizes() {
		let mut cell = AggregationCell::new(&aggregations(), &schema()).unwrap();
		let inputs = vec![0, 0, 0];
		cell.update(&inputs, &[Value::U64(10)]).unwrap();
		cell.update(&inputs, &[Value::U64(20)]).unwrap();
		assert_eq!(
			cell.finalize(),
			vec![Value::U64(30), Value::U64(2), Value::F64(15.0)]
		);
	}

	#[test]
	fn combining_cells_matches_sequential_updates() {
		let inputs = vec![0, 0, 0];
		let mut left = AggregationCell::new(&aggregations(), &schema()).unwrap();
		let mut right = AggregationCell::new(&aggregations(), &schema()).unwrap();
		left.update(&inputs, &[Value::U64(5)]).unwrap();
		right.update(&inputs, &[Value::U64(7)]).unwrap();
		left.combine(&right).unwrap();
		assert_eq!(
			left.finalize(),
			vec![Value::U64(12), Value::U64(2), Value::F64(6.0)]
		);
	}

	#[test]
	fn median_is_order_insensitive() {
		let aggs = vec![Aggregation::new(AggregateFunction::Median, "value", "med")];
		let mut cell = AggregationCell::new(&aggs, &schema()).unwrap();
		for v in [9u64, 1, 5] {
			cell.update(&[0], &[Value::U64(v)]).unwrap();
		}
		assert_eq!(cell.finalize(), vec![Value::F64(5.0)]);
	}

	#[test]
	fn keyed_slices_merge_by_key() {
		let schema = schema();
		let aggs = vec![Aggregation::new(AggregateFunction::Sum, "value", "sum")];
		let mut a = Slice::keyed(0, 1000);
		let mut b = Slice::keyed(0, 1000);
		for (slice, value) in [(&mut a, 10u64), (&mut b, 20u64)] {
			if let SliceData::Keyed(cells) = &mut slice.data {
				let cell = cells
					.entry(vec![Value::U32(1)])
					.or_insert_with(|| AggregationCell::new(&aggs, &schema).unwrap());
				cell.update(&[0], &[Value::U64(value)]).unwrap();
				slice.tuples += 1;
			}
		}
		a.merge_from(&b).unwrap();
		if let SliceData::Keyed(cells) = &a.data {
			assert_eq!(cells[&vec![Value::U32(1)]].finalize(), vec![Value::U64(30)]);
		} else {
			panic!("expected keyed slice");
		}
		assert_eq!(a.tuples, 2);
	}
}
