//! Translation of a file-relative block index to an absolute disk block number by walking an
//! inode's direct and indirect pointers, allocating new pointer/data blocks on write.
//!
//! A [`LookupScratch`] caches the two most recently touched indirect-pointer blocks, standing in
//! for the original controller's `tmp1`/`tmp2` buffers: resolving a run of consecutive file
//! offsets through the same single- or double-indirect block only re-reads it once. It is owned
//! by the open descriptor that created it (see [`crate::object`]), dropped on close, and cloned
//! on `dup` rather than shared, since two descriptors walking independent offsets would otherwise
//! thrash each other's cache.

use crate::bgd::Bgdt;
use crate::device::{self, BlockDevice};
use crate::errno::{EResult, errno};
use crate::inode::{DIRECT_BLOCKS, DOUBLE_INDIRECT, SINGLE_INDIRECT, TRIPLE_INDIRECT};
use crate::superblock::Superblock;
use alloc::vec;
use alloc::vec::Vec;

/// Where a file-relative block index falls in the pointer tree.
enum Level {
	Direct(usize),
	Single(usize),
	Double(usize, usize),
	Triple(usize, usize, usize),
}

fn classify(file_blk: u32, ptrs_per_block: u32) -> EResult<Level> {
	let n = ptrs_per_block as u64;
	let mut idx = file_blk as u64;
	if idx < DIRECT_BLOCKS as u64 {
		return Ok(Level::Direct(idx as usize));
	}
	idx -= DIRECT_BLOCKS as u64;
	if idx < n {
		return Ok(Level::Single(idx as usize));
	}
	idx -= n;
	if idx < n * n {
		return Ok(Level::Double((idx / n) as usize, (idx % n) as usize));
	}
	idx -= n * n;
	if idx < n * n * n {
		let a = idx / (n * n);
		let b = (idx / n) % n;
		let c = idx % n;
		return Ok(Level::Triple(a as usize, b as usize, c as usize));
	}
	Err(errno!(EOVERFLOW))
}

fn ptrs_from_bytes(buf: &[u8]) -> Vec<u32> {
	buf.chunks_exact(4)
		.map(|c| u32::from_le_bytes(c.try_into().unwrap()))
		.collect()
}

fn ptrs_to_bytes(ptrs: &[u32], buf: &mut [u8]) {
	for (i, p) in ptrs.iter().enumerate() {
		buf[i * 4..i * 4 + 4].copy_from_slice(&p.to_le_bytes());
	}
}

/// A small cache of recently-decoded indirect-pointer blocks, keyed by their own disk block
/// number.
#[derive(Debug, Clone, Default)]
pub struct LookupScratch {
	slots: [Option<(u32, Vec<u32>)>; 2],
}

impl LookupScratch {
	pub fn new() -> Self {
		Self::default()
	}

	fn find(&self, block: u32) -> Option<&[u32]> {
		self.slots
			.iter()
			.find_map(|s| s.as_ref().filter(|(b, _)| *b == block).map(|(_, p)| p.as_slice()))
	}

	fn insert(&mut self, block: u32, ptrs: Vec<u32>) {
		self.slots[1] = self.slots[0].take();
		self.slots[0] = Some((block, ptrs));
	}

	fn update_in_place(&mut self, block: u32, ptrs: Vec<u32>) {
		for s in self.slots.iter_mut().flatten() {
			if s.0 == block {
				s.1 = ptrs;
				return;
			}
		}
		self.insert(block, ptrs);
	}

	fn load(
		&mut self,
		dev: &dyn BlockDevice,
		sp: &Superblock,
		partition_base: u64,
		block: u32,
	) -> EResult<Vec<u32>> {
		if let Some(p) = self.find(block) {
			return Ok(p.to_vec());
		}
		let buf = device::read_block(dev, sp.block_size(), partition_base, block)?;
		let ptrs = ptrs_from_bytes(&buf);
		self.insert(block, ptrs.clone());
		Ok(ptrs)
	}

	/// Drops every cached block. Called whenever the inode's pointer tree is mutated by someone
	/// other than the descriptor owning this scratch (e.g. truncation racing a read).
	pub fn invalidate(&mut self) {
		self.slots = [None, None];
	}
}

/// Reads the absolute data block number for file-relative block `file_blk`, without allocating.
/// A zero pointer anywhere along the path is a hole: returns `Ok(None)`.
pub fn resolve(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	partition_base: u64,
	i_block: &[u32; DIRECT_BLOCKS + 3],
	scratch: &mut LookupScratch,
	file_blk: u32,
) -> EResult<Option<u32>> {
	let n = sp.pointers_per_block();
	let chase = |scratch: &mut LookupScratch, start: u32, path: &[usize]| -> EResult<Option<u32>> {
		let mut cur = start;
		for &idx in path {
			if cur == 0 {
				return Ok(None);
			}
			let ptrs = scratch.load(dev, sp, partition_base, cur)?;
			cur = ptrs[idx];
		}
		Ok(if cur == 0 { None } else { Some(cur) })
	};
	match classify(file_blk, n)? {
		Level::Direct(i) => Ok(nz(i_block[i])),
		Level::Single(i) => chase(scratch, i_block[SINGLE_INDIRECT], &[i]),
		Level::Double(a, b) => chase(scratch, i_block[DOUBLE_INDIRECT], &[a, b]),
		Level::Triple(a, b, c) => chase(scratch, i_block[TRIPLE_INDIRECT], &[a, b, c]),
	}
}

fn nz(b: u32) -> Option<u32> {
	(b != 0).then_some(b)
}

/// Resolves `file_blk`, allocating any missing pointer or data block along the way. Newly
/// allocated blocks are zeroed. Returns the absolute data block number and how many new blocks
/// (pointer blocks plus the final data block) were allocated, for the caller to fold into the
/// inode's `i_blocks` accounting.
#[allow(clippy::too_many_arguments)]
pub fn resolve_or_alloc(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	bgdt: &Bgdt,
	partition_base: u64,
	i_block: &mut [u32; DIRECT_BLOCKS + 3],
	scratch: &mut LookupScratch,
	hint_group: u32,
	file_blk: u32,
) -> EResult<(u32, u32)> {
	let n = sp.pointers_per_block();
	let mut allocated = 0u32;
	let mut alloc_one = || -> EResult<u32> {
		let b = crate::bitmap::alloc_block(dev, sp, bgdt, partition_base, hint_group)?;
		device::zero_block(dev, sp.block_size(), partition_base, b)?;
		allocated += 1;
		Ok(b)
	};

	// Walks from `root_slot` (an entry of `i_block`) through `path`, allocating any zero
	// pointer it finds, and returns the final data block.
	fn walk(
		dev: &dyn BlockDevice,
		sp: &Superblock,
		partition_base: u64,
		scratch: &mut LookupScratch,
		root: &mut u32,
		path: &[usize],
		alloc_one: &mut impl FnMut() -> EResult<u32>,
	) -> EResult<u32> {
		if *root == 0 {
			*root = alloc_one()?;
		}
		let mut cur = *root;
		for (depth, &idx) in path.iter().enumerate() {
			let mut ptrs = scratch.load(dev, sp, partition_base, cur)?;
			if ptrs[idx] == 0 {
				ptrs[idx] = alloc_one()?;
				let mut buf = vec![0u8; sp.block_size() as usize];
				ptrs_to_bytes(&ptrs, &mut buf);
				device::write_block(dev, sp.block_size(), partition_base, cur, &buf)?;
				scratch.update_in_place(cur, ptrs.clone());
			}
			let next = ptrs[idx];
			if depth + 1 < path.len() {
				cur = next;
			} else {
				return Ok(next);
			}
		}
		Ok(cur)
	}

	let data_block = match classify(file_blk, n)? {
		Level::Direct(i) => {
			if i_block[i] == 0 {
				i_block[i] = alloc_one()?;
			}
			i_block[i]
		}
		Level::Single(i) => walk(dev, sp, partition_base, scratch, &mut i_block[SINGLE_INDIRECT], &[i], &mut alloc_one)?,
		Level::Double(a, b) => walk(
			dev,
			sp,
			partition_base,
			scratch,
			&mut i_block[DOUBLE_INDIRECT],
			&[a, b],
			&mut alloc_one,
		)?,
		Level::Triple(a, b, c) => walk(
			dev,
			sp,
			partition_base,
			scratch,
			&mut i_block[TRIPLE_INDIRECT],
			&[a, b, c],
			&mut alloc_one,
		)?,
	};
	Ok((data_block, allocated))
}

/// Links `data_block` (already allocated by the caller, e.g. from a contiguous run handed out by
/// [`crate::bitmap::alloc_blocks`]) into `file_blk`'s leaf slot, allocating any missing
/// intermediate indirect-pointer blocks along the way exactly as [`resolve_or_alloc`] would.
/// `data_block` is zeroed before being linked in. Returns the number of pointer blocks allocated
/// (the caller separately accounts for `data_block` itself, since it didn't come from here).
///
/// The caller must have already established that `file_blk` is a hole (`resolve` returned
/// `None`): this always overwrites the leaf slot, so linking in a block index that already
/// resolves to something would leak that existing block.
#[allow(clippy::too_many_arguments)]
pub fn assign(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	bgdt: &Bgdt,
	partition_base: u64,
	i_block: &mut [u32; DIRECT_BLOCKS + 3],
	scratch: &mut LookupScratch,
	hint_group: u32,
	file_blk: u32,
	data_block: u32,
) -> EResult<u32> {
	let n = sp.pointers_per_block();
	let mut allocated = 0u32;
	let mut alloc_one = || -> EResult<u32> {
		let b = crate::bitmap::alloc_block(dev, sp, bgdt, partition_base, hint_group)?;
		device::zero_block(dev, sp.block_size(), partition_base, b)?;
		allocated += 1;
		Ok(b)
	};
	device::zero_block(dev, sp.block_size(), partition_base, data_block)?;

	// Walks from `root` through `path`, allocating any zero pointer block it finds, and sets the
	// final slot in the path to `data_block`.
	fn set_leaf(
		dev: &dyn BlockDevice,
		sp: &Superblock,
		partition_base: u64,
		scratch: &mut LookupScratch,
		root: &mut u32,
		path: &[usize],
		data_block: u32,
		alloc_one: &mut impl FnMut() -> EResult<u32>,
	) -> EResult<()> {
		if *root == 0 {
			*root = alloc_one()?;
		}
		let mut cur = *root;
		for (depth, &idx) in path.iter().enumerate() {
			let mut ptrs = scratch.load(dev, sp, partition_base, cur)?;
			let last = depth + 1 == path.len();
			let changed = if last {
				ptrs[idx] = data_block;
				true
			} else if ptrs[idx] == 0 {
				ptrs[idx] = alloc_one()?;
				true
			} else {
				false
			};
			if changed {
				let mut buf = vec![0u8; sp.block_size() as usize];
				ptrs_to_bytes(&ptrs, &mut buf);
				device::write_block(dev, sp.block_size(), partition_base, cur, &buf)?;
				scratch.update_in_place(cur, ptrs.clone());
			}
			cur = ptrs[idx];
		}
		Ok(())
	}

	match classify(file_blk, n)? {
		Level::Direct(i) => i_block[i] = data_block,
		Level::Single(i) => set_leaf(dev, sp, partition_base, scratch, &mut i_block[SINGLE_INDIRECT], &[i], data_block, &mut alloc_one)?,
		Level::Double(a, b) => set_leaf(
			dev,
			sp,
			partition_base,
			scratch,
			&mut i_block[DOUBLE_INDIRECT],
			&[a, b],
			data_block,
			&mut alloc_one,
		)?,
		Level::Triple(a, b, c) => set_leaf(
			dev,
			sp,
			partition_base,
			scratch,
			&mut i_block[TRIPLE_INDIRECT],
			&[a, b, c],
			data_block,
			&mut alloc_one,
		)?,
	}
	Ok(allocated)
}

/// Frees every block reachable from `i_block` (data and indirect alike) and zeroes the pointer
/// array. Returns the number of blocks freed, for `i_blocks` accounting. Used both by truncation
/// to zero and by inode deletion.
pub fn free_all(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	bgdt: &Bgdt,
	partition_base: u64,
	i_block: &mut [u32; DIRECT_BLOCKS + 3],
) -> EResult<u32> {
	let mut freed = 0u32;
	fn free_recursive(
		dev: &dyn BlockDevice,
		sp: &Superblock,
		bgdt: &Bgdt,
		partition_base: u64,
		block: u32,
		depth: u32,
		freed: &mut u32,
	) -> EResult<()> {
		if block == 0 {
			return Ok(());
		}
		if depth > 0 {
			let buf = device::read_block(dev, sp.block_size(), partition_base, block)?;
			for child in ptrs_from_bytes(&buf) {
				free_recursive(dev, sp, bgdt, partition_base, child, depth - 1, freed)?;
			}
		}
		crate::bitmap::free_block(dev, sp, bgdt, partition_base, block)?;
		*freed += 1;
		Ok(())
	}
	for (i, block) in i_block.iter().enumerate() {
		let depth = match i {
			i if i < DIRECT_BLOCKS => 0,
			SINGLE_INDIRECT => 0,
			DOUBLE_INDIRECT => 1,
			TRIPLE_INDIRECT => 2,
			_ => unreachable!(),
		};
		free_recursive(dev, sp, bgdt, partition_base, *block, depth, &mut freed)?;
	}
	i_block.fill(0);
	Ok(freed)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bgd::{Bgdt, BlockGroupDescriptor};
	use crate::device::test_utils::RamDisk;

	fn make_sp() -> Superblock {
		let mut raw = [0u8; crate::superblock::SUPERBLOCK_SIZE];
		raw[0..4].copy_from_slice(&4096u32.to_le_bytes());
		raw[4..8].copy_from_slice(&8192u32.to_le_bytes());
		raw[20..24].copy_from_slice(&1u32.to_le_bytes());
		raw[24..28].copy_from_slice(&0u32.to_le_bytes()); // 1024-byte blocks, 256 ptrs/block
		raw[32..36].copy_from_slice(&8192u32.to_le_bytes());
		raw[40..44].copy_from_slice(&4096u32.to_le_bytes());
		Superblock::from_bytes(&raw)
	}

	fn make_bgdt() -> Bgdt {
		Bgdt::from_entries(
			vec![BlockGroupDescriptor {
				bg_block_bitmap: 2,
				bg_inode_bitmap: 3,
				bg_inode_table: 4,
				bg_free_blocks_count: 8000,
				bg_free_inodes_count: 4096,
				bg_used_dirs_count: 0,
			}],
			0,
		)
	}

	#[test]
	fn allocates_and_resolves_a_direct_block() {
		let dev = RamDisk::new(512, 2048);
		let sp = make_sp();
		let bgdt = make_bgdt();
		let mut i_block = [0u32; 15];
		let mut scratch = LookupScratch::new();
		let (b, allocated) =
			resolve_or_alloc(&dev, &sp, &bgdt, 0, &mut i_block, &mut scratch, 0, 0).unwrap();
		assert_eq!(allocated, 1);
		assert_eq!(resolve(&dev, &sp, 0, &i_block, &mut scratch, 0).unwrap(), Some(b));
		assert_eq!(resolve(&dev, &sp, 0, &i_block, &mut scratch, 1).unwrap(), None);
	}

	#[test]
	fn allocates_through_a_single_indirect_pointer() {
		let dev = RamDisk::new(512, 4096);
		let sp = make_sp();
		let bgdt = make_bgdt();
		let mut i_block = [0u32; 15];
		let mut scratch = LookupScratch::new();
		let file_blk = DIRECT_BLOCKS as u32 + 5;
		let (b, _) = resolve_or_alloc(&dev, &sp, &bgdt, 0, &mut i_block, &mut scratch, 0, file_blk).unwrap();
		assert_ne!(i_block[SINGLE_INDIRECT], 0);
		assert_eq!(resolve(&dev, &sp, 0, &i_block, &mut scratch, file_blk).unwrap(), Some(b));
	}

	#[test]
	fn allocates_through_a_double_indirect_pointer() {
		let dev = RamDisk::new(512, 8192);
		let sp = make_sp();
		let bgdt = make_bgdt();
		let mut i_block = [0u32; 15];
		let mut scratch = LookupScratch::new();
		let n = sp.pointers_per_block();
		let file_blk = DIRECT_BLOCKS as u32 + n + 3;
		let (b, _) = resolve_or_alloc(&dev, &sp, &bgdt, 0, &mut i_block, &mut scratch, 0, file_blk).unwrap();
		assert_ne!(i_block[DOUBLE_INDIRECT], 0);
		assert_eq!(resolve(&dev, &sp, 0, &i_block, &mut scratch, file_blk).unwrap(), Some(b));
	}

	#[test]
	fn allocates_through_a_triple_indirect_pointer() {
		let dev = RamDisk::new(512, 16384);
		let sp = make_sp();
		let bgdt = make_bgdt();
		let mut i_block = [0u32; 15];
		let mut scratch = LookupScratch::new();
		let n = sp.pointers_per_block() as u64;
		let file_blk = (DIRECT_BLOCKS as u64 + n + n * n + 7) as u32;
		let (b, _) = resolve_or_alloc(&dev, &sp, &bgdt, 0, &mut i_block, &mut scratch, 0, file_blk).unwrap();
		assert_ne!(i_block[TRIPLE_INDIRECT], 0);
		assert_eq!(resolve(&dev, &sp, 0, &i_block, &mut scratch, file_blk).unwrap(), Some(b));
	}

	#[test]
	fn assign_links_a_preallocated_run_across_direct_single_and_double_levels() {
		let dev = RamDisk::new(512, 8192);
		let sp = make_sp();
		let bgdt = make_bgdt();
		let mut i_block = [0u32; 15];
		let mut scratch = LookupScratch::new();
		let n = sp.pointers_per_block();

		// A direct block, a single-indirect one, and a double-indirect one, as three file-block
		// indices a contiguous run allocator would hand one block number apiece.
		let direct_blk = 3u32;
		let single_blk = DIRECT_BLOCKS as u32 + 5;
		let double_blk = DIRECT_BLOCKS as u32 + n + 9;

		let run_first =
			crate::bitmap::alloc_blocks(&dev, &sp, &bgdt, 0, 0, 3).unwrap();
		assign(&dev, &sp, &bgdt, 0, &mut i_block, &mut scratch, 0, direct_blk, run_first).unwrap();
		assign(&dev, &sp, &bgdt, 0, &mut i_block, &mut scratch, 0, single_blk, run_first + 1).unwrap();
		assign(&dev, &sp, &bgdt, 0, &mut i_block, &mut scratch, 0, double_blk, run_first + 2).unwrap();

		assert_eq!(resolve(&dev, &sp, 0, &i_block, &mut scratch, direct_blk).unwrap(), Some(run_first));
		assert_eq!(resolve(&dev, &sp, 0, &i_block, &mut scratch, single_blk).unwrap(), Some(run_first + 1));
		assert_eq!(resolve(&dev, &sp, 0, &i_block, &mut scratch, double_blk).unwrap(), Some(run_first + 2));
		// Untouched neighbors in the same indirect blocks remain holes.
		assert_eq!(resolve(&dev, &sp, 0, &i_block, &mut scratch, DIRECT_BLOCKS as u32 + 4).unwrap(), None);
	}

	#[test]
	fn free_all_reclaims_every_block() {
		let dev = RamDisk::new(512, 4096);
		let sp = make_sp();
		let bgdt = make_bgdt();
		let mut i_block = [0u32; 15];
		let mut scratch = LookupScratch::new();
		let file_blk = DIRECT_BLOCKS as u32 + 2;
		resolve_or_alloc(&dev, &sp, &bgdt, 0, &mut i_block, &mut scratch, 0, file_blk).unwrap();
		let before = bgdt.group(0).read().bg_free_blocks_count;
		let freed = free_all(&dev, &sp, &bgdt, 0, &mut i_block).unwrap();
		assert!(freed >= 2); // the data block plus its single-indirect pointer block
		assert_eq!(i_block, [0u32; 15]);
		assert_eq!(bgdt.group(0).read().bg_free_blocks_count, before + freed as u16);
	}
}
