//! Per-group block and inode bitmap allocator.
//!
//! Bitmaps are never mirrored in RAM: each allocation or free reads the relevant bitmap block
//! straight off disk, flips the bit, and writes the block back, exactly as the original
//! controller's `getDiskBytes`/`setDiskBytes` pair around a bitmap scan. The caller is expected
//! to be holding the target group's [`crate::bgd::Bgdt::group`] write lock for the duration of
//! the call; this module does no locking of its own.

use crate::bgd::Bgdt;
use crate::device::{self, BlockDevice};
use crate::errno::{EResult, errno};
use crate::superblock::Superblock;
use alloc::vec;
use core::sync::atomic::Ordering::Relaxed;

/// What kind of bitmap an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
	Block,
	Inode,
}

fn per_group(sp: &Superblock, kind: Kind) -> u32 {
	match kind {
		Kind::Block => sp.s_blocks_per_group,
		Kind::Inode => sp.s_inodes_per_group,
	}
}

fn total_count(sp: &Superblock, kind: Kind) -> u32 {
	match kind {
		Kind::Block => sp.s_blocks_count,
		Kind::Inode => sp.s_inodes_count,
	}
}

/// Number of valid (in-range) bits in `group`'s bitmap of the given kind; the last group may be
/// short, and mke2fs pre-sets the out-of-range tail bits to 1 so a linear scan never selects them.
fn valid_bits_in_group(sp: &Superblock, group: u32, kind: Kind) -> u32 {
	let per = per_group(sp, kind);
	let total = total_count(sp, kind);
	let start = group * per;
	total.saturating_sub(start).min(per)
}

fn bitmap_block(bgd: &crate::bgd::BlockGroupDescriptor, kind: Kind) -> u32 {
	match kind {
		Kind::Block => bgd.bg_block_bitmap,
		Kind::Inode => bgd.bg_inode_bitmap,
	}
}

fn read_bitmap(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	partition_base: u64,
	block: u32,
) -> EResult<alloc::vec::Vec<u8>> {
	let block_size = sp.block_size();
	let mut buf = vec![0u8; block_size as usize];
	let byte_off = partition_base + block as u64 * block_size as u64;
	device::read_bytes(dev, byte_off, &mut buf)?;
	Ok(buf)
}

fn write_bitmap(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	partition_base: u64,
	block: u32,
	buf: &[u8],
) -> EResult<()> {
	let block_size = sp.block_size();
	let byte_off = partition_base + block as u64 * block_size as u64;
	device::write_bytes(dev, byte_off, buf)
}

fn bit_get(buf: &[u8], bit: u32) -> bool {
	buf[(bit / 8) as usize] & (1 << (bit % 8)) != 0
}

fn bit_set(buf: &mut [u8], bit: u32, value: bool) {
	let byte = &mut buf[(bit / 8) as usize];
	let mask = 1 << (bit % 8);
	if value {
		*byte |= mask;
	} else {
		*byte &= !mask;
	}
}

/// Scans `group`'s bitmap of the given kind for a clear bit, sets it, and returns its index
/// within the group. Returns `None` if the group is full.
fn alloc_in_group(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	bgdt: &Bgdt,
	partition_base: u64,
	group: u32,
	kind: Kind,
) -> EResult<Option<u32>> {
	let valid = valid_bits_in_group(sp, group, kind);
	if valid == 0 {
		return Ok(None);
	}
	let bitmap_blk = {
		let bgd = bgdt.group(group).read();
		bitmap_block(&bgd, kind)
	};
	let mut buf = read_bitmap(dev, sp, partition_base, bitmap_blk)?;
	let Some(bit) = (0..valid).find(|&b| !bit_get(&buf, b)) else {
		return Ok(None);
	};
	bit_set(&mut buf, bit, true);
	write_bitmap(dev, sp, partition_base, bitmap_blk, &buf)?;

	let mut bgd = bgdt.group(group).write();
	match kind {
		Kind::Block => bgd.bg_free_blocks_count -= 1,
		Kind::Inode => bgd.bg_free_inodes_count -= 1,
	}
	Ok(Some(bit))
}

/// Scans `group`'s block bitmap for the first run of `n` consecutive clear bits and returns the
/// index of its first bit, or `None` if the group has no such run (even if it has `n` free bits
/// in total, scattered).
fn find_clear_run(buf: &[u8], valid: u32, n: u32) -> Option<u32> {
	let mut run_start = None;
	let mut run_len = 0u32;
	for b in 0..valid {
		if bit_get(buf, b) {
			run_len = 0;
			run_start = None;
			continue;
		}
		if run_len == 0 {
			run_start = Some(b);
		}
		run_len += 1;
		if run_len == n {
			return run_start;
		}
	}
	None
}

/// Scans `group`'s block bitmap for the first run of `n` clear bits, sets all of them, and
/// returns the index of the run's first bit. Returns `None` if the group has no such run.
fn alloc_run_in_group(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	bgdt: &Bgdt,
	partition_base: u64,
	group: u32,
	n: u32,
) -> EResult<Option<u32>> {
	let valid = valid_bits_in_group(sp, group, Kind::Block);
	if valid < n {
		return Ok(None);
	}
	let bitmap_blk = {
		let bgd = bgdt.group(group).read();
		bitmap_block(&bgd, Kind::Block)
	};
	let mut buf = read_bitmap(dev, sp, partition_base, bitmap_blk)?;
	let Some(start) = find_clear_run(&buf, valid, n) else {
		return Ok(None);
	};
	for b in start..start + n {
		bit_set(&mut buf, b, true);
	}
	write_bitmap(dev, sp, partition_base, bitmap_blk, &buf)?;

	let mut bgd = bgdt.group(group).write();
	bgd.bg_free_blocks_count -= n as u16;
	Ok(Some(start))
}

/// Allocates a free block, preferring `hint_group` and falling back to every other group in
/// order. Returns the block's absolute block number. Updates the group descriptor and the
/// superblock's free-block counter on success.
pub fn alloc_block(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	bgdt: &Bgdt,
	partition_base: u64,
	hint_group: u32,
) -> EResult<u32> {
	alloc_blocks(dev, sp, bgdt, partition_base, hint_group, 1)
}

/// Allocates a contiguous run of `n` blocks (spec.md §4.3's `findBlocks(group, n)`), preferring
/// `hint_group` and falling back to every other group in order. A group qualifies only if it
/// holds a run of `n` consecutive clear bits; a group with `n` free bits scattered across its
/// bitmap does not satisfy the request and is skipped, matching a linear bitmap scan rather than
/// a best-fit allocator. Returns the absolute block number of the run's first block.
pub fn alloc_blocks(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	bgdt: &Bgdt,
	partition_base: u64,
	hint_group: u32,
	n: u32,
) -> EResult<u32> {
	debug_assert!(n > 0);
	let groups = bgdt.len();
	for i in 0..groups {
		let group = (hint_group + i) % groups;
		if let Some(bit) = alloc_run_in_group(dev, sp, bgdt, partition_base, group, n)? {
			sp.s_free_blocks_count.fetch_sub(n, Relaxed);
			return Ok(sp.s_first_data_block + group * sp.s_blocks_per_group + bit);
		}
	}
	Err(errno!(ENOSPC))
}

/// Allocates a free inode, preferring `hint_group`. `is_dir` controls whether the group's
/// directory-count is bumped, matching the original controller's bookkeeping when a directory's
/// backing inode is allocated. Returns a 1-based inode number.
pub fn alloc_inode(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	bgdt: &Bgdt,
	partition_base: u64,
	hint_group: u32,
	is_dir: bool,
) -> EResult<u32> {
	let groups = bgdt.len();
	for i in 0..groups {
		let group = (hint_group + i) % groups;
		if let Some(bit) = alloc_in_group(dev, sp, bgdt, partition_base, group, Kind::Inode)? {
			sp.s_free_inodes_count.fetch_sub(1, Relaxed);
			if is_dir {
				bgdt.group(group).write().bg_used_dirs_count += 1;
			}
			return Ok(group * sp.s_inodes_per_group + bit + 1);
		}
	}
	Err(errno!(ENOSPC))
}

/// Clears `block`'s bit in its group's block bitmap.
pub fn free_block(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	bgdt: &Bgdt,
	partition_base: u64,
	block: u32,
) -> EResult<()> {
	let rel = block - sp.s_first_data_block;
	let group = rel / sp.s_blocks_per_group;
	let bit = rel % sp.s_blocks_per_group;
	free_bit(dev, sp, bgdt, partition_base, group, bit, Kind::Block)?;
	sp.s_free_blocks_count.fetch_add(1, Relaxed);
	Ok(())
}

/// Clears `inode`'s bit in its group's inode bitmap. `is_dir` mirrors [`alloc_inode`]'s bookkeeping.
pub fn free_inode(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	bgdt: &Bgdt,
	partition_base: u64,
	inode: u32,
	is_dir: bool,
) -> EResult<()> {
	let rel = inode - 1;
	let group = rel / sp.s_inodes_per_group;
	let bit = rel % sp.s_inodes_per_group;
	free_bit(dev, sp, bgdt, partition_base, group, bit, Kind::Inode)?;
	sp.s_free_inodes_count.fetch_add(1, Relaxed);
	if is_dir {
		let mut bgd = bgdt.group(group).write();
		bgd.bg_used_dirs_count = bgd.bg_used_dirs_count.saturating_sub(1);
	}
	Ok(())
}

fn free_bit(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	bgdt: &Bgdt,
	partition_base: u64,
	group: u32,
	bit: u32,
	kind: Kind,
) -> EResult<()> {
	let bitmap_blk = {
		let bgd = bgdt.group(group).read();
		bitmap_block(&bgd, kind)
	};
	let mut buf = read_bitmap(dev, sp, partition_base, bitmap_blk)?;
	bit_set(&mut buf, bit, false);
	write_bitmap(dev, sp, partition_base, bitmap_blk, &buf)?;
	let mut bgd = bgdt.group(group).write();
	match kind {
		Kind::Block => bgd.bg_free_blocks_count += 1,
		Kind::Inode => bgd.bg_free_inodes_count += 1,
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bgd::{BlockGroupDescriptor, Bgdt};
	use crate::device::test_utils::RamDisk;
	use alloc::vec::Vec;

	fn make_sp(blocks_per_group: u32, blocks_count: u32, inodes_per_group: u32, inodes_count: u32) -> Superblock {
		let mut raw = [0u8; crate::superblock::SUPERBLOCK_SIZE];
		raw[0..4].copy_from_slice(&inodes_count.to_le_bytes());
		raw[4..8].copy_from_slice(&blocks_count.to_le_bytes());
		raw[12..16].copy_from_slice(&blocks_count.to_le_bytes()); // s_free_blocks_count: fully free
		raw[16..20].copy_from_slice(&inodes_count.to_le_bytes()); // s_free_inodes_count: fully free
		raw[20..24].copy_from_slice(&1u32.to_le_bytes()); // s_first_data_block
		raw[24..28].copy_from_slice(&0u32.to_le_bytes()); // 1024-byte blocks
		raw[32..36].copy_from_slice(&blocks_per_group.to_le_bytes());
		raw[40..44].copy_from_slice(&inodes_per_group.to_le_bytes());
		Superblock::from_bytes(&raw)
	}

	fn make_bgdt(n: usize, block_bitmap: u32, inode_bitmap: u32) -> Bgdt {
		let entries: Vec<_> = (0..n)
			.map(|_| BlockGroupDescriptor {
				bg_block_bitmap: block_bitmap,
				bg_inode_bitmap: inode_bitmap,
				bg_inode_table: 0,
				bg_free_blocks_count: 8,
				bg_free_inodes_count: 8,
				bg_used_dirs_count: 0,
			})
			.collect();
		Bgdt::from_entries(entries, 0)
	}

	#[test]
	fn allocates_and_frees_a_block() {
		let dev = RamDisk::new(512, 64);
		let sp = make_sp(8, 8, 8, 8);
		let bgdt = make_bgdt(1, 2, 3);
		let b = alloc_block(&dev, &sp, &bgdt, 0, 0).unwrap();
		assert_eq!(b, 1);
		assert_eq!(sp.s_free_blocks_count.load(Relaxed), 7);
		assert_eq!(bgdt.group(0).read().bg_free_blocks_count, 7);
		free_block(&dev, &sp, &bgdt, 0, b).unwrap();
		assert_eq!(sp.s_free_blocks_count.load(Relaxed), 8);
		assert_eq!(bgdt.group(0).read().bg_free_blocks_count, 8);
	}

	#[test]
	fn allocates_an_inode_and_tracks_dirs() {
		let dev = RamDisk::new(512, 64);
		let sp = make_sp(8, 8, 8, 8);
		let bgdt = make_bgdt(1, 2, 3);
		let ino = alloc_inode(&dev, &sp, &bgdt, 0, 0, true).unwrap();
		assert_eq!(ino, 1);
		assert_eq!(bgdt.group(0).read().bg_used_dirs_count, 1);
		free_inode(&dev, &sp, &bgdt, 0, ino, true).unwrap();
		assert_eq!(bgdt.group(0).read().bg_used_dirs_count, 0);
	}

	#[test]
	fn allocates_a_contiguous_run_of_blocks() {
		let dev = RamDisk::new(512, 64);
		let sp = make_sp(16, 16, 8, 8);
		let bgdt = make_bgdt(1, 2, 3);
		let first = alloc_blocks(&dev, &sp, &bgdt, 0, 0, 5).unwrap();
		assert_eq!(first, 1);
		assert_eq!(sp.s_free_blocks_count.load(Relaxed), 11);
		assert_eq!(bgdt.group(0).read().bg_free_blocks_count, 11);
		// The run is contiguous: every bit in it reads as used, and a further single-block
		// allocation lands right after it rather than inside it.
		let next = alloc_block(&dev, &sp, &bgdt, 0, 0).unwrap();
		assert_eq!(next, first + 5);
	}

	#[test]
	fn a_run_that_does_not_fit_in_one_group_falls_through() {
		let dev = RamDisk::new(512, 64);
		let sp = make_sp(4, 8, 8, 8);
		// Two groups, each with its own block bitmap block (2 and 6) and inode bitmap (3 and 7)
		// so allocations in one never alias the other's bitmap.
		let entries = alloc::vec![
			BlockGroupDescriptor {
				bg_block_bitmap: 2,
				bg_inode_bitmap: 3,
				bg_inode_table: 0,
				bg_free_blocks_count: 4,
				bg_free_inodes_count: 4,
				bg_used_dirs_count: 0,
			},
			BlockGroupDescriptor {
				bg_block_bitmap: 6,
				bg_inode_bitmap: 7,
				bg_inode_table: 0,
				bg_free_blocks_count: 4,
				bg_free_inodes_count: 4,
				bg_used_dirs_count: 0,
			},
		];
		let bgdt = Bgdt::from_entries(entries, 0);
		// Group 0 only has 4 bits total and one already used, so a run of 4 must come from group 1.
		alloc_block(&dev, &sp, &bgdt, 0, 0).unwrap();
		let first = alloc_blocks(&dev, &sp, &bgdt, 0, 0, 4).unwrap();
		assert_eq!(first, sp.s_first_data_block + sp.s_blocks_per_group);
	}

	#[test]
	fn exhausted_group_reports_enospc() {
		let dev = RamDisk::new(512, 64);
		let sp = make_sp(4, 4, 4, 4);
		let bgdt = make_bgdt(1, 2, 3);
		for _ in 0..4 {
			alloc_block(&dev, &sp, &bgdt, 0, 0).unwrap();
		}
		assert!(alloc_block(&dev, &sp, &bgdt, 0, 0).is_err());
	}
}
