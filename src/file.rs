//! The block-aligned read/write/seek/mmap engine (spec.md §4.6) and the open descriptor
//! ([`FileHandle`]) that carries a resolved inode's per-call state.
//!
//! Grounded on the original controller's `ext2Read`/`ext2ReadInner`, `ext2Write`, `ext2Seek` and
//! `ext2Mmap`: block-aligned staging buffers, consecutive-run coalescing, and the cache/lock
//! discipline from spec.md §5.

use crate::bitmap;
use crate::block_chain::{self, LookupScratch};
use crate::device;
use crate::errno::{EResult, errno};
use crate::inode::{self, FileType, Inode};
use crate::object::Object;
use crate::volume::Volume;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::min;
use core::sync::atomic::Ordering::Relaxed;

/// Flags recognized by `open`, matching the POSIX names spec.md §6 lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
	/// Open for reading only. This is the absence of [`Self::WRONLY`]/[`Self::RDWR`], not a bit
	/// of its own, matching POSIX's `O_RDONLY == 0`; named here so callers can spell it out.
	pub const RDONLY: u32 = 0;
	pub const WRONLY: u32 = 1 << 0;
	pub const RDWR: u32 = 1 << 1;
	pub const CREAT: u32 = 1 << 2;
	pub const EXCL: u32 = 1 << 3;
	pub const TRUNC: u32 = 1 << 4;
	pub const APPEND: u32 = 1 << 5;
	pub const DIRECTORY: u32 = 1 << 6;
	pub const NOFOLLOW: u32 = 1 << 7;

	pub fn has(self, bit: u32) -> bool {
		self.0 & bit != 0
	}

	/// Whether this combination of flags permits writing.
	pub fn writable(self) -> bool {
		self.has(Self::WRONLY) || self.has(Self::RDWR)
	}
}

/// `whence` argument to [`Volume::seek`].
#[derive(Debug, Clone, Copy)]
pub enum Seek {
	Set(i64),
	Cur(i64),
	End(i64),
}

/// An open descriptor: a resolved inode plus the per-call state spec.md §3 describes (`ptr`, the
/// block-lookup scratch, an optional directory name).
///
/// Duplicated by [`Volume::duplicate`], which deep-copies the scratch buffer and bumps the shared
/// object's reference count; destroyed by [`Volume::close`].
pub struct FileHandle {
	pub(crate) object: Arc<Object>,
	pub(crate) ino: u32,
	pub(crate) inode: Inode,
	pub(crate) ptr: u64,
	pub(crate) flags: OpenFlags,
	pub(crate) scratch: LookupScratch,
	/// Owned path of the directory this descriptor was opened against, for directory descriptors
	/// only; carried so a later `readlink`-style rewrite has something to splice onto.
	pub(crate) dirname: Option<Vec<u8>>,
}

impl FileHandle {
	pub fn ino(&self) -> u32 {
		self.ino
	}

	pub fn flags(&self) -> OpenFlags {
		self.flags
	}

	pub fn file_type(&self) -> FileType {
		self.inode.file_type()
	}

	fn is_directory(&self) -> bool {
		self.file_type() == FileType::Directory
	}
}

impl Volume {
	/// Reads up to `buf.len()` bytes starting at the descriptor's cursor, advancing it by the
	/// number of bytes copied. Returns `0` at end of file.
	pub fn read(&self, fh: &mut FileHandle, buf: &mut [u8]) -> EResult<usize> {
		if fh.is_directory() {
			return Err(errno!(EISDIR));
		}

		// Locks (3) then (4), per spec.md §5: the file lock is held across every block of I/O
		// this call issues; the cache lock is taken and released block by block underneath it.
		// The descriptor's own copy of the inode is refreshed under the lock so that a writer's
		// size/block-chain update on another descriptor of the same object becomes visible here
		// once it has released (3), rather than this call acting on a stale snapshot from open.
		let _file_guard = fh.object.content.read();
		fh.inode = inode::get(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, fh.ino)?;

		let filesize = fh.inode.size(&self.sp);
		if fh.ptr >= filesize {
			return Ok(0);
		}
		let limit = min(buf.len() as u64, filesize - fh.ptr) as usize;
		if limit == 0 {
			return Ok(0);
		}

		let block_size = self.sp.block_size() as u64;
		let mut copied = 0usize;
		while copied < limit {
			let block_index = fh.ptr / block_size;
			let in_block = (fh.ptr % block_size) as usize;
			let hit = {
				let cache = fh.object.cache.read();
				cache.get_block(block_index, self.sp.block_size()).map(<[u8]>::to_vec)
			};
			if let Some(block_bytes) = hit {
				let to_copy = min(limit - copied, block_bytes.len() - in_block);
				buf[copied..copied + to_copy].copy_from_slice(&block_bytes[in_block..in_block + to_copy]);
				copied += to_copy;
				fh.ptr += to_copy as u64;
				continue;
			}
			// The maximal run of uncached blocks, bounded by the next cache hit or by how much
			// is still needed to satisfy `limit`.
			let needed_blocks = ((in_block as u64 + (limit - copied) as u64).div_ceil(block_size)).max(1);
			let mut run = 1u64;
			while run < needed_blocks {
				let hit = fh.object.cache.read().get_block(block_index + run, self.sp.block_size()).is_some();
				if hit {
					break;
				}
				run += 1;
			}
			let available = (run * block_size - in_block as u64) as usize;
			let to_copy = min(limit - copied, available);
			let got = self.read_inner(fh, &mut buf[copied..copied + to_copy], block_index, run)?;
			debug_assert_eq!(got, to_copy);
			copied += to_copy;
		}
		Ok(copied)
	}

	/// Resolves, reads and caches `count` consecutive file-relative blocks starting at
	/// `start_block`, then copies `out.len()` bytes starting at the descriptor's current cursor
	/// (which must fall within the first of those blocks) into `out`.
	fn read_inner(&self, fh: &mut FileHandle, out: &mut [u8], start_block: u64, count: u64) -> EResult<usize> {
		let mut blocks = Vec::with_capacity(count as usize);
		for i in 0..count {
			let b = block_chain::resolve(
				self.dev.as_ref(),
				&self.sp,
				self.partition_base,
				&fh.inode.i_block,
				&mut fh.scratch,
				(start_block + i) as u32,
			)?;
			blocks.push(b.unwrap_or(0));
		}
		let block_size = self.sp.block_size() as usize;
		let mut staging = vec![0u8; blocks.len() * block_size];
		let mut i = 0;
		while i < blocks.len() {
			if blocks[i] == 0 {
				// A hole: leave the staging region zeroed.
				i += 1;
				continue;
			}
			let mut j = i;
			while j + 1 < blocks.len() && blocks[j + 1] == blocks[j] + 1 {
				j += 1;
			}
			let byte_off = self.partition_base + blocks[i] as u64 * block_size as u64;
			device::read_bytes(self.dev.as_ref(), byte_off, &mut staging[i * block_size..(j + 1) * block_size])?;
			i = j + 1;
		}
		let in_block = (fh.ptr % block_size as u64) as usize;
		out.copy_from_slice(&staging[in_block..in_block + out.len()]);
		fh.object.cache.write().insert(start_block, blocks.len() as u32, staging);
		fh.ptr += out.len() as u64;
		Ok(out.len())
	}

	/// Writes `buf` starting at the descriptor's cursor, extending the file and allocating new
	/// blocks as needed. Returns the number of bytes written (always `buf.len()` barring an
	/// error, since this driver does not support short writes to a non-full device).
	pub fn write(&self, fh: &mut FileHandle, buf: &[u8]) -> EResult<usize> {
		if fh.is_directory() {
			return Err(errno!(EISDIR));
		}
		if buf.is_empty() {
			return Ok(0);
		}

		let _file_guard = fh.object.content.write();
		// Refresh this descriptor's inode and lookup scratch from disk under the file lock: a
		// sibling descriptor (same object, different `FileHandle`) may have extended the file or
		// its block chain since this descriptor last wrote, and per spec.md §5 that update must
		// become visible to every other descriptor once its writer releases (3).
		fh.inode = inode::get(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, fh.ino)?;
		fh.scratch.invalidate();
		fh.object.cache.write().invalidate();

		let restore_ptr = if fh.flags.has(OpenFlags::APPEND) {
			let saved = fh.ptr;
			fh.ptr = fh.inode.size(&self.sp);
			Some(saved)
		} else {
			None
		};

		let block_size = self.sp.block_size() as u64;
		let mut written = 0usize;
		if fh.ptr % block_size != 0 {
			written += self.write_head_block(fh, buf)?;
		}
		if written < buf.len() {
			written += self.write_aligned(fh, &buf[written..])?;
		}

		if fh.ptr > fh.inode.size(&self.sp) {
			fh.inode.set_size(&self.sp, fh.ptr, false);
		}
		inode::put(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, fh.ino, &fh.inode)?;

		if let Some(saved) = restore_ptr {
			fh.ptr = saved;
		}
		Ok(written)
	}

	/// Read-modify-writes the partial block at the descriptor's (non-aligned) cursor.
	fn write_head_block(&self, fh: &mut FileHandle, buf: &[u8]) -> EResult<usize> {
		let block_size = self.sp.block_size() as u64;
		let file_blk = (fh.ptr / block_size) as u32;
		let head_off = (fh.ptr % block_size) as usize;
		let hint_group = (fh.ino - 1) / self.sp.s_inodes_per_group;
		let (abs, _) = block_chain::resolve_or_alloc(
			self.dev.as_ref(),
			&self.sp,
			&self.bgdt,
			self.partition_base,
			&mut fh.inode.i_block,
			&mut fh.scratch,
			hint_group,
			file_blk,
		)?;
		let to_copy = min(block_size as usize - head_off, buf.len());
		let mut block_buf = device::read_block(self.dev.as_ref(), self.sp.block_size(), self.partition_base, abs)?;
		block_buf[head_off..head_off + to_copy].copy_from_slice(&buf[..to_copy]);
		device::write_block(self.dev.as_ref(), self.sp.block_size(), self.partition_base, abs, &block_buf)?;
		fh.ptr += to_copy as u64;
		Ok(to_copy)
	}

	/// Writes the block-aligned remainder of a write, pre-reading the first and last blocks to
	/// preserve their untouched tails, then emitting with consecutive-run coalescing.
	fn write_aligned(&self, fh: &mut FileHandle, buf: &[u8]) -> EResult<usize> {
		if buf.is_empty() {
			return Ok(0);
		}
		let block_size = self.sp.block_size() as u64;
		debug_assert_eq!(fh.ptr % block_size, 0);
		let block_size_us = block_size as usize;
		let blocks_required = (buf.len() as u64).div_ceil(block_size) as usize;
		let start_blk = (fh.ptr / block_size) as u32;
		let hint_group = (fh.ino - 1) / self.sp.s_inodes_per_group;

		// Resolve the chain first, without allocating: spec.md §4.6 write-step 2 calls for
		// allocating holes as one contiguous run biased to the inode's home group, rather than one
		// bitmap scan per block.
		let mut blocks: Vec<Option<u32>> = Vec::with_capacity(blocks_required);
		for i in 0..blocks_required {
			let existing = block_chain::resolve(
				self.dev.as_ref(),
				&self.sp,
				self.partition_base,
				&fh.inode.i_block,
				&mut fh.scratch,
				start_blk + i as u32,
			)?;
			blocks.push(existing);
		}
		let mut i = 0;
		while i < blocks.len() {
			if blocks[i].is_some() {
				i += 1;
				continue;
			}
			let mut j = i;
			while j < blocks.len() && blocks[j].is_none() {
				j += 1;
			}
			let run_len = (j - i) as u32;
			let first =
				bitmap::alloc_blocks(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, hint_group, run_len)?;
			for (k, slot) in blocks[i..j].iter_mut().enumerate() {
				let data_block = first + k as u32;
				block_chain::assign(
					self.dev.as_ref(),
					&self.sp,
					&self.bgdt,
					self.partition_base,
					&mut fh.inode.i_block,
					&mut fh.scratch,
					hint_group,
					start_blk + (i + k) as u32,
					data_block,
				)?;
				*slot = Some(data_block);
			}
			i = j;
		}
		let blocks: Vec<u32> = blocks.into_iter().map(|b| b.expect("every hole was just assigned")).collect();

		let mut staging = vec![0u8; blocks.len() * block_size_us];
		let byte_off = self.partition_base + blocks[0] as u64 * block_size;
		device::read_bytes(self.dev.as_ref(), byte_off, &mut staging[..block_size_us])?;
		if blocks.len() > 1 {
			let last = blocks.len() - 1;
			let byte_off = self.partition_base + blocks[last] as u64 * block_size;
			device::read_bytes(self.dev.as_ref(), byte_off, &mut staging[last * block_size_us..])?;
		}
		staging[..buf.len()].copy_from_slice(buf);

		let mut i = 0;
		while i < blocks.len() {
			let mut j = i;
			while j + 1 < blocks.len() && blocks[j + 1] == blocks[j] + 1 {
				j += 1;
			}
			let byte_off = self.partition_base + blocks[i] as u64 * block_size;
			device::write_bytes(self.dev.as_ref(), byte_off, &staging[i * block_size_us..(j + 1) * block_size_us])?;
			i = j + 1;
		}

		fh.ptr += buf.len() as u64;
		Ok(buf.len())
	}

	/// Repositions a descriptor's cursor. `SEEK_SET`/`SEEK_CUR`/`SEEK_END` per spec.md §4.6: a
	/// seek past end-of-file on a writable descriptor is realized immediately as a zero-filled
	/// write up to the target offset; on a read-only descriptor it fails `EINVAL`.
	pub fn seek(&self, fh: &mut FileHandle, whence: Seek) -> EResult<u64> {
		let size = fh.inode.size(&self.sp);
		let target = match whence {
			Seek::Set(off) => off,
			Seek::Cur(off) => fh.ptr as i64 + off,
			Seek::End(off) => size as i64 + off,
		};
		if target < 0 {
			return Err(errno!(EINVAL));
		}
		let target = target as u64;
		if target > size {
			if !fh.flags.writable() {
				return Err(errno!(EINVAL));
			}
			fh.ptr = size;
			let mut remaining = (target - size) as usize;
			let zeros = [0u8; 4096];
			while remaining > 0 {
				let chunk = min(remaining, zeros.len());
				self.write(fh, &zeros[..chunk])?;
				remaining -= chunk;
			}
		}
		fh.ptr = target;
		Ok(fh.ptr)
	}

	/// Returns the file's current size in bytes.
	pub fn get_filesize(&self, fh: &FileHandle) -> u64 {
		fh.inode.size(&self.sp)
	}

	/// Duplicates a descriptor: bumps the shared object's reference count and deep-copies the
	/// lookup scratch and directory name, per spec.md §3's descriptor lifecycle.
	pub fn duplicate(&self, fh: &FileHandle) -> FileHandle {
		let object = self.objects.acquire(fh.ino);
		FileHandle {
			object,
			ino: fh.ino,
			inode: fh.inode.clone(),
			ptr: fh.ptr,
			flags: fh.flags,
			scratch: fh.scratch.clone(),
			dirname: fh.dirname.clone(),
		}
	}

	/// Closes a descriptor: releases its reference to the shared object, finishing a deferred
	/// deletion (see [`Object::unlinked`]) if this was the last reference to an inode `delete`
	/// already unlinked while other descriptors were still open.
	pub fn close(&self, fh: FileHandle) -> EResult<()> {
		let was_dir = fh.is_directory();
		let ino = fh.ino;
		let unlinked = fh.object.unlinked.load(Relaxed);
		let last = self.objects.release(&fh.object);
		if last && unlinked {
			let mut inode = inode::get(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, ino)?;
			block_chain::free_all(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, &mut inode.i_block)?;
			inode::free(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, ino, was_dir)?;
		}
		Ok(())
	}
}

/// Flags recognized by [`Volume::mmap`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MapFlags(pub u32);

impl MapFlags {
	pub const PRIVATE: u32 = 1 << 0;
	pub const FIXED: u32 = 1 << 1;

	pub fn has(self, bit: u32) -> bool {
		self.0 & bit != 0
	}
}

/// The physical-memory allocator and address-space mapper `mmap` needs, supplied by the host
/// kernel. This is the mmap hook spec.md §1 lists as an external collaborator: the driver only
/// ever reads file content into pages this trait hands back, it never manages physical memory
/// itself.
pub trait AddressSpace {
	/// Size in bytes of one page.
	fn page_size(&self) -> usize;
	/// Reserves `pages` contiguous pages of unused virtual address space in the calling task,
	/// returning its base address.
	fn reserve(&self, pages: usize) -> EResult<u64>;
	/// Returns whether `addr` falls inside a window (kernel space, the HHDM) a `MAP_FIXED`
	/// request must never be allowed to target.
	fn is_reserved(&self, addr: u64) -> bool;
	/// Allocates `pages` fresh physical pages, returning the first page's physical address.
	fn alloc_pages(&self, pages: usize) -> EResult<u64>;
	/// Maps `pages` physical pages starting at `phys` into the task's address space at `virt`.
	fn map(&self, virt: u64, phys: u64, pages: usize, writable: bool) -> EResult<()>;
	/// Returns a pointer to `phys` through the host's higher-half direct map, valid for `len`
	/// bytes, so the driver can populate freshly allocated pages before they are mapped into the
	/// task.
	fn hhdm(&self, phys: u64, len: usize) -> *mut u8;
}

impl Volume {
	/// Maps `length` bytes of `fh` starting at `pgoffset` pages into the task's address space.
	/// Only private mappings are supported; anything else fails `ENOSYS`.
	#[allow(clippy::too_many_arguments)]
	pub fn mmap(
		&self,
		fh: &mut FileHandle,
		addr_space: &dyn AddressSpace,
		addr: u64,
		length: usize,
		writable: bool,
		flags: MapFlags,
		pgoffset: u64,
	) -> EResult<u64> {
		if !flags.has(MapFlags::PRIVATE) {
			return Err(errno!(ENOSYS));
		}
		if length == 0 {
			return Err(errno!(EINVAL));
		}
		if flags.has(MapFlags::FIXED) && addr_space.is_reserved(addr) {
			return Err(errno!(EACCES));
		}

		let page_size = addr_space.page_size();
		let pages = length.div_ceil(page_size);
		let virt = if flags.has(MapFlags::FIXED) {
			addr
		} else {
			addr_space.reserve(pages)?
		};
		let phys = addr_space.alloc_pages(pages)?;

		let mapped_len = pages * page_size;
		// SAFETY: `alloc_pages` just handed back `pages` fresh, exclusively-owned physical pages.
		let dst = unsafe { core::slice::from_raw_parts_mut(addr_space.hhdm(phys, mapped_len), mapped_len) };
		dst.fill(0);

		let saved_ptr = fh.ptr;
		fh.ptr = pgoffset * page_size as u64;
		let to_read = min(length, dst.len());
		self.read(fh, &mut dst[..to_read])?;
		fh.ptr = saved_ptr;

		addr_space.map(virt, phys, pages, writable)?;
		Ok(virt)
	}
}
