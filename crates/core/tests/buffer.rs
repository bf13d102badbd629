use rillstream_core::buf::BufferManager;
use rillstream_core::buf::FloatingBuffer;
use rillstream_core::cnf::BufferOptions;
use serial_test::serial;
use std::time::Duration;
use std::time::Instant;
use temp_dir::TempDir;
use test_log::test;

fn manager(dir: &TempDir, buffers: usize, spill_batch: usize) -> BufferManager {
	BufferManager::new(
		BufferOptions::sized(1024, buffers)
			.with_spill_dir(dir.path())
			.with_spill_batch(spill_batch),
	)
	.unwrap()
}

fn eventually(mut check: impl FnMut() -> bool) -> bool {
	let deadline = Instant::now() + Duration::from_secs(2);
	while Instant::now() < deadline {
		if check() {
			return true;
		}
		std::thread::sleep(Duration::from_millis(5));
	}
	false
}

#[test]
#[serial]
fn spilled_buffer_restores_its_contents() {
	let dir = TempDir::new().unwrap();
	let manager = manager(&dir, 1, 64);

	let buffer1 = manager.get_buffer_no_blocking().unwrap();
	buffer1.fill(2);
	let floating = FloatingBuffer::from(buffer1);

	{
		// The only segment is held by the floating buffer; a blocking
		// request forces it to spill
		let buffer2 = manager.get_buffer_blocking().unwrap();
		buffer2.fill(3);
		assert!(floating.is_spilled());
	}

	let repinned = manager.pin_buffer(floating).unwrap();
	assert!(repinned.with_data(|data| data.iter().all(|byte| *byte == 2)));
	assert_eq!(repinned.len(), 1024);
}

#[test]
#[serial]
fn child_buffers_spill_and_restore_independently() {
	let dir = TempDir::new().unwrap();
	let manager = manager(&dir, 2, 64);

	let future_child = manager.get_buffer_blocking().unwrap();
	future_child.fill(1);
	let parent = manager.get_buffer_blocking().unwrap();
	parent.fill(2);
	let child = parent.store_return_as_child_buffer(future_child).unwrap();

	let float_child = FloatingBuffer::from(child);
	let float_parent = FloatingBuffer::from(parent);

	{
		let fresh = manager.get_buffer_blocking().unwrap();
		fresh.fill(3);
	}

	let repinned_child = manager.pin_buffer(float_child).unwrap();
	assert!(repinned_child.with_data(|data| data.iter().all(|byte| *byte == 1)));

	// The parent spills independently of its re-pinned child
	drop(repinned_child);
	manager.wait_for_write_completion_once();
	assert!(eventually(|| float_parent.is_spilled()));
	let repinned_parent = manager.pin_buffer(float_parent).unwrap();
	assert!(repinned_parent.with_data(|data| data.iter().all(|byte| *byte == 2)));
}

#[test]
#[serial]
fn clock_eviction_spills_one_batch_at_a_time() {
	let dir = TempDir::new().unwrap();
	let manager = manager(&dir, 8, 4);

	let parent = manager.get_buffer_no_blocking().unwrap();
	parent.fill(1);
	let mut floating: Vec<FloatingBuffer> = Vec::new();
	for value in 0..7u8 {
		let child = manager.get_buffer_no_blocking().unwrap();
		child.fill(value + 2);
		let child = parent.store_return_as_child_buffer(child).unwrap();
		floating.push(FloatingBuffer::from(child));
	}
	floating.push(FloatingBuffer::from(parent));

	// The ninth request selects the parent as the clock victim, which
	// forcibly spills its children first, one batch of four
	let pinned1 = manager.get_buffer_blocking().unwrap();
	pinned1.fill(9);
	assert!(eventually(|| floating[..4].iter().all(|buffer| buffer.is_spilled())));
	for buffer in &floating[4..] {
		assert!(!buffer.is_spilled());
	}

	// Three requests drain the already spilled batch, the fourth triggers
	// the next eviction cycle
	let mut pinned = vec![pinned1];
	for value in 0..4u8 {
		let next = manager.get_buffer_blocking().unwrap();
		next.fill(value + 10);
		pinned.push(next);
	}
	manager.wait_for_write_completion_once();
	assert!(eventually(|| floating.iter().all(|buffer| buffer.is_spilled())));

	// No pinned buffer was ever evicted
	for (idx, buffer) in pinned.iter().enumerate() {
		let expected = if idx == 0 {
			9
		} else {
			idx as u8 + 9
		};
		assert!(buffer.with_data(|data| data.iter().all(|byte| *byte == expected)));
	}
}

#[test]
fn repinned_spilled_buffers_reuse_the_cached_disk_copy() {
	let dir = TempDir::new().unwrap();
	let manager = manager(&dir, 1, 64);

	let buffer = manager.get_buffer_no_blocking().unwrap();
	buffer.fill(7);
	let floating = FloatingBuffer::from(buffer);

	// Spill, re-pin, float and spill again; the second eviction must not
	// write a second copy
	let holder = manager.get_buffer_blocking().unwrap();
	assert!(floating.is_spilled());
	drop(holder);
	let repinned = manager.pin_buffer(floating).unwrap();
	assert!(repinned.with_data(|data| data.iter().all(|byte| *byte == 7)));
	let floating = FloatingBuffer::from(repinned);

	let holder = manager.get_buffer_blocking().unwrap();
	assert!(floating.is_spilled());
	drop(holder);
	let repinned = manager.pin_buffer(floating).unwrap();
	assert!(repinned.with_data(|data| data.iter().all(|byte| *byte == 7)));
}

#[test]
fn zero_capacity_pools_are_exhausted() {
	let dir = TempDir::new().unwrap();
	let manager = BufferManager::new(
		BufferOptions::sized(1024, 0).with_spill_dir(dir.path()),
	)
	.unwrap();
	assert!(manager.get_buffer_blocking().is_err());
	assert!(manager.get_buffer_no_blocking().is_none());
}
