//! The open-object table: deduplicates concurrently open handles to the same inode into a
//! single shared [`Object`], so that two descriptors reading and writing the same file observe
//! one cache and one set of locks rather than racing independent ones.
//!
//! The teacher kernel links these into an intrusive doubly-linked list threaded through the
//! object itself. An intrusive list requires unsafe pointer juggling to implement safely in
//! Rust without a GC, which buys nothing here since the table's access pattern is a plain
//! "find or insert by key" — so this crate keeps an owned `BTreeMap` instead, guarded by the
//! table's own lock (spec's `objectListLock`, the outermost lock in the hierarchy).

use crate::cache::Cache;
use crate::sync::{RwLock, Spin};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering::Relaxed};

/// Shared state for a single open inode, reference-counted by the number of live descriptors
/// pointing at it.
///
/// Lock tiers below the table's own lock, innermost last:
/// - [`Self::property`]: a spinlock for short, uncontended metadata twiddles (e.g. marking the
///   object unlinked).
/// - [`Self::content`]: a reader/writer lock guarding the inode record and its block-pointer
///   tree; readers may run concurrently, a resizing write excludes everyone.
/// - [`Self::cache`]: a reader/writer lock guarding the block-run [`Cache`].
pub struct Object {
	pub ino: u32,
	ref_count: AtomicU32,
	/// Set once the inode's link count has dropped to zero while this object was still open;
	/// the inode and its blocks are only actually freed once the last reference goes away. See
	/// DESIGN.md's note on the hard-link-count Open Question.
	pub unlinked: AtomicBool,
	pub property: Spin<()>,
	pub content: RwLock<()>,
	pub cache: RwLock<Cache>,
}

impl Object {
	fn new(ino: u32) -> Self {
		Self {
			ino,
			ref_count: AtomicU32::new(0),
			unlinked: AtomicBool::new(false),
			property: Spin::new(()),
			content: RwLock::new(()),
			cache: RwLock::new(Cache::new()),
		}
	}
}

/// The volume-wide table of open objects.
#[derive(Default)]
pub struct ObjectTable {
	inner: Spin<BTreeMap<u32, Arc<Object>>>,
}

impl ObjectTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the shared [`Object`] for `ino`, creating it if this is the first open handle,
	/// and bumps its reference count.
	pub fn acquire(&self, ino: u32) -> Arc<Object> {
		let mut map = self.inner.lock();
		if let Some(obj) = map.get(&ino) {
			obj.ref_count.fetch_add(1, Relaxed);
			return obj.clone();
		}
		let obj = Arc::new(Object::new(ino));
		obj.ref_count.store(1, Relaxed);
		map.insert(ino, obj.clone());
		obj
	}

	/// Drops one reference to `obj`. Returns `true` if this was the last reference, in which
	/// case the object has been removed from the table and the caller is responsible for
	/// deciding whether the underlying inode should now be freed (see [`Object::unlinked`]).
	pub fn release(&self, obj: &Arc<Object>) -> bool {
		let mut map = self.inner.lock();
		let prev = obj.ref_count.fetch_sub(1, Relaxed);
		debug_assert!(prev >= 1);
		if prev == 1 {
			map.remove(&obj.ino);
			true
		} else {
			false
		}
	}

	/// Looks up an already-open object without affecting its reference count, e.g. to mark it
	/// unlinked from a `delete` call racing an open handle.
	pub fn peek(&self, ino: u32) -> Option<Arc<Object>> {
		self.inner.lock().get(&ino).cloned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dedups_concurrent_opens_of_the_same_inode() {
		let table = ObjectTable::new();
		let a = table.acquire(5);
		let b = table.acquire(5);
		assert!(Arc::ptr_eq(&a, &b));
		assert!(!table.release(&a));
		assert!(table.release(&b));
		assert!(table.peek(5).is_none());
	}

	#[test]
	fn distinct_inodes_get_distinct_objects() {
		let table = ObjectTable::new();
		let a = table.acquire(1);
		let b = table.acquire(2);
		assert!(!Arc::ptr_eq(&a, &b));
	}
}
