use crate::cnf::HashJoinOptions;
use crate::cnf::StreamJoinStrategy;
use crate::join::paged::PagedRows;
use crate::sch::Value;
use ahash::AHashMap;
use dashmap::DashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

/// The build state of one join side within one window, shaped by the
/// configured join strategy
pub(crate) enum SideState {
	/// Per-worker tables, merged when the window seals
	HashLocal {
		workers: Vec<Mutex<AHashMap<Value, Vec<Vec<Value>>>>>,
	},
	/// One shared table guarded by a striped lock
	HashGlobalLocking {
		stripes: Vec<Mutex<AHashMap<Value, Vec<Vec<Value>>>>>,
	},
	/// One shared table with lock-free inserts
	HashGlobalLockFree {
		table: DashMap<Value, Vec<Vec<Value>>, ahash::RandomState>,
	},
	/// Paged row vectors probed pairwise
	NestedLoop {
		pages: Mutex<PagedRows>,
	},
}

impl SideState {
	pub fn new(
		strategy: StreamJoinStrategy,
		options: &HashJoinOptions,
		workers: usize,
		row_width: usize,
	) -> Self {
		match strategy {
			StreamJoinStrategy::HashJoinLocal => SideState::HashLocal {
				workers: (0..workers.max(1)).map(|_| Mutex::new(AHashMap::new())).collect(),
			},
			StreamJoinStrategy::HashJoinGlobalLocking => SideState::HashGlobalLocking {
				stripes: (0..options.num_partitions.max(1))
					.map(|_| Mutex::new(AHashMap::new()))
					.collect(),
			},
			StreamJoinStrategy::HashJoinGlobalLockFree => SideState::HashGlobalLockFree {
				table: DashMap::with_hasher(ahash::RandomState::new()),
			},
			StreamJoinStrategy::NestedLoopJoin => SideState::NestedLoop {
				pages: Mutex::new(PagedRows::new(
					options.page_size,
					row_width,
					options.pre_alloc_pages,
				)),
			},
		}
	}

	/// Inserts one row under its join key
	pub fn insert(&self, worker: usize, key: Value, row: Vec<Value>) {
		match self {
			SideState::HashLocal {
				workers,
			} => {
				let mut table = workers[worker % workers.len()]
					.lock()
					.expect("unreachable: join table poisoned");
				table.entry(key).or_default().push(row);
			}
			SideState::HashGlobalLocking {
				stripes,
			} => {
				let stripe = stripe_of(&key, stripes.len());
				let mut table =
					stripes[stripe].lock().expect("unreachable: join stripe poisoned");
				table.entry(key).or_default().push(row);
			}
			SideState::HashGlobalLockFree {
				table,
			} => {
				table.entry(key).or_default().push(row);
			}
			SideState::NestedLoop {
				pages,
			} => {
				pages.lock().expect("unreachable: join pages poisoned").push(row);
			}
		}
	}

	/// Merges all partitions into one table, as done at the window boundary
	/// before probing
	pub fn merged(&self) -> AHashMap<Value, Vec<Vec<Value>>> {
		let mut merged: AHashMap<Value, Vec<Vec<Value>>> = AHashMap::new();
		match self {
			SideState::HashLocal {
				workers,
			} => {
				for table in workers {
					let table = table.lock().expect("unreachable: join table poisoned");
					for (key, rows) in table.iter() {
						merged.entry(key.clone()).or_default().extend(rows.iter().cloned());
					}
				}
			}
			SideState::HashGlobalLocking {
				stripes,
			} => {
				for stripe in stripes {
					let table = stripe.lock().expect("unreachable: join stripe poisoned");
					for (key, rows) in table.iter() {
						merged.entry(key.clone()).or_default().extend(rows.iter().cloned());
					}
				}
			}
			SideState::HashGlobalLockFree {
				table,
			} => {
				for entry in table.iter() {
					merged
						.entry(entry.key().clone())
						.or_default()
						.extend(entry.value().iter().cloned());
				}
			}
			SideState::NestedLoop {
				pages,
			} => {
				let pages = pages.lock().expect("unreachable: join pages poisoned");
				for row in pages.iter() {
					merged.entry(Value::Bool(true)).or_default().push(row.clone());
				}
			}
		}
		merged
	}

	/// All rows of this side in insertion order, for cartesian probing
	pub fn all_rows(&self) -> Vec<Vec<Value>> {
		match self {
			SideState::NestedLoop {
				pages,
			} => pages.lock().expect("unreachable: join pages poisoned").iter().cloned().collect(),
			_ => {
				let mut rows: Vec<Vec<Value>> =
					self.merged().into_values().flatten().collect();
				rows.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
				rows
			}
		}
	}

	/// The number of buffered rows
	pub fn len(&self) -> usize {
		match self {
			SideState::HashLocal {
				workers,
			} => workers
				.iter()
				.map(|t| {
					t.lock()
						.expect("unreachable: join table poisoned")
						.values()
						.map(Vec::len)
						.sum::<usize>()
				})
				.sum(),
			SideState::HashGlobalLocking {
				stripes,
			} => stripes
				.iter()
				.map(|t| {
					t.lock()
						.expect("unreachable: join stripe poisoned")
						.values()
						.map(Vec::len)
						.sum::<usize>()
				})
				.sum(),
			SideState::HashGlobalLockFree {
				table,
			} => table.iter().map(|entry| entry.value().len()).sum(),
			SideState::NestedLoop {
				pages,
			} => pages.lock().expect("unreachable: join pages poisoned").len(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

fn stripe_of(key: &Value, stripes: usize) -> usize {
	let mut hasher = ahash::AHasher::default();
	key.hash(&mut hasher);
	(hasher.finish() as usize) % stripes.max(1)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn options() -> HashJoinOptions {
		HashJoinOptions {
			total_size: 1024,
			page_size: 64,
			pre_alloc_pages: 1,
			num_partitions: 4,
		}
	}

	#[test]
	fn local_tables_merge_across_workers() {
		let state = SideState::new(StreamJoinStrategy::HashJoinLocal, &options(), 2, 8);
		state.insert(0, Value::U32(7), vec![Value::U32(7), Value::U64(1)]);
		state.insert(1, Value::U32(7), vec![Value::U32(7), Value::U64(2)]);
		let merged = state.merged();
		assert_eq!(merged[&Value::U32(7)].len(), 2);
	}

	#[test]
	fn striped_table_collects_all_keys() {
		let state = SideState::new(StreamJoinStrategy::HashJoinGlobalLocking, &options(), 1, 8);
		for key in 0..16u32 {
			state.insert(0, Value::U32(key), vec![Value::U32(key)]);
		}
		assert_eq!(state.len(), 16);
		assert_eq!(state.merged().len(), 16);
	}

	#[test]
	fn lock_free_table_accepts_concurrent_inserts() {
		let state = std::sync::Arc::new(SideState::new(
			StreamJoinStrategy::HashJoinGlobalLockFree,
			&options(),
			1,
			8,
		));
		let mut handles = Vec::new();
		for thread in 0..4u32 {
			let state = std::sync::Arc::clone(&state);
			handles.push(std::thread::spawn(move || {
				for i in 0..100u32 {
					state.insert(0, Value::U32(i % 8), vec![Value::U32(thread), Value::U32(i)]);
				}
			}));
		}
		for handle in handles {
			handle.join().unwrap();
		}
		assert_eq!(state.len(), 400);
	}
}
