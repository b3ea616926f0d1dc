//! Per-object cache of recently read block runs.
//!
//! Entries are non-overlapping and kept ordered by starting block index. A cache miss on read
//! falls through to disk and populates a new entry; any write to the object invalidates the
//! whole cache rather than attempting to patch it in place, since partial invalidation would
//! require tracking exactly which bytes of which entry a write touched for little benefit on a
//! filesystem driver (most workloads are read-mostly or write-then-read-back, neither of which
//! benefits from surviving a write).

use alloc::vec::Vec;

struct Entry {
	/// File-relative index of the first block this entry covers.
	start: u64,
	/// Number of consecutive blocks covered.
	count: u32,
	data: Vec<u8>,
}

/// A per-object block cache. Callers hold this behind the object's `cacheLock`.
#[derive(Default)]
pub struct Cache {
	entries: Vec<Entry>,
}

impl Cache {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the bytes of file-relative block `block_index`, if cached.
	pub fn get_block(&self, block_index: u64, block_size: u32) -> Option<&[u8]> {
		let e = self
			.entries
			.iter()
			.find(|e| block_index >= e.start && block_index < e.start + e.count as u64)?;
		let off = (block_index - e.start) as usize * block_size as usize;
		Some(&e.data[off..off + block_size as usize])
	}

	/// Inserts a freshly read run of `count` consecutive blocks starting at `start`, evicting
	/// any existing entries it overlaps.
	pub fn insert(&mut self, start: u64, count: u32, data: Vec<u8>) {
		let end = start + count as u64;
		self.entries.retain(|e| e.start + e.count as u64 <= start || e.start >= end);
		let pos = self.entries.partition_point(|e| e.start < start);
		self.entries.insert(pos, Entry { start, count, data });
	}

	/// Drops every cached entry. Called on any write to the owning object.
	pub fn invalidate(&mut self) {
		self.entries.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn returns_none_on_miss_and_hit_after_insert() {
		let mut cache = Cache::new();
		assert!(cache.get_block(3, 512).is_none());
		cache.insert(2, 4, alloc::vec![0xabu8; 512 * 4]);
		assert_eq!(cache.get_block(3, 512).unwrap()[0], 0xab);
		assert!(cache.get_block(6, 512).is_none());
	}

	#[test]
	fn insert_evicts_overlapping_entries() {
		let mut cache = Cache::new();
		cache.insert(0, 4, alloc::vec![1u8; 512 * 4]);
		cache.insert(2, 4, alloc::vec![2u8; 512 * 4]);
		// The first entry's tail (blocks 2-3) overlapped, so it was evicted wholesale.
		assert!(cache.get_block(0, 512).is_none());
		assert_eq!(cache.get_block(2, 512).unwrap()[0], 2);
	}

	#[test]
	fn invalidate_clears_everything() {
		let mut cache = Cache::new();
		cache.insert(0, 1, alloc::vec![1u8; 512]);
		cache.invalidate();
		assert!(cache.get_block(0, 512).is_none());
	}
}
