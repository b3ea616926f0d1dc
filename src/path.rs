//! Path resolution, symlink following and the directory-mutating operations built on top of it
//! (spec.md §4.9): `open`, `mkdir`, `symlink`, `link`, `delete`, `stat`/`lstat`/`fstat`,
//! `readlink` and `getdents64`.
//!
//! Grounded on the original controller's `ext2Open`/`ext2Stat`/`ext2Lstat`/`ext2Readlink`/
//! `ext2Delete`/`ext2Link`: a directory is walked one path component at a time through
//! [`crate::dirent::find`], with a symlink encountered mid-walk spliced into the remaining
//! component queue rather than resolved by recursion.

use crate::block_chain::{self, LookupScratch};
use crate::device;
use crate::dirent::{self, Dirent};
use crate::errno::{EResult, errno};
use crate::file::{FileHandle, OpenFlags};
use crate::inode::{self, FileType, Inode, ROOT_INODE, SYMLINK_INLINE_LIMIT};
use crate::volume::Volume;
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::Ordering::Relaxed;

/// Bound on the number of symlinks followed while resolving a single path, matching Linux's own
/// `MAXSYMLINKS`. Exceeding it fails `ELOOP` rather than looping forever on a symlink cycle.
const MAX_SYMLINK_HOPS: u32 = 40;

/// The subset of an inode's metadata `stat`/`lstat`/`fstat` report.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
	pub ino: u32,
	pub file_type: FileType,
	pub mode: u16,
	pub uid: u16,
	pub gid: u16,
	pub size: u64,
	pub links: u16,
	pub atime: u32,
	pub mtime: u32,
	pub ctime: u32,
}

/// Splits `path` into (is-absolute, non-empty components). `.`/`..` are not special-cased here:
/// they are ordinary directory entries ext2 stores for every directory, so [`dirent::find`]
/// resolves them the same way it resolves any other name.
fn split_path(path: &[u8]) -> (bool, VecDeque<Vec<u8>>) {
	let absolute = path.first() == Some(&b'/');
	let comps = path.split(|&b| b == b'/').filter(|s| !s.is_empty()).map(<[u8]>::to_vec).collect();
	(absolute, comps)
}

impl Volume {
	fn filetype_feature(&self) -> bool {
		self.sp.s_feature_incompat & crate::superblock::REQUIRED_FEATURE_FILETYPE != 0
	}

	/// Resolves `path` (relative to `start_inode` if not absolute) to an inode number.
	///
	/// A symlink encountered for a non-final component, or for the final component when
	/// `follow_final` is set, is read and spliced into the remaining path: an absolute target
	/// replaces the whole remaining queue (and resets the walk to the root), a relative target is
	/// inserted in front of it. `follow_final = false` (as used by `lstat`/`readlink`, and by
	/// `open` with `O_NOFOLLOW`) returns the symlink's own inode instead of its target.
	pub(crate) fn traverse(&self, path: &[u8], start_inode: u32, follow_final: bool) -> EResult<u32> {
		let (absolute, comps) = split_path(path);
		self.traverse_components(absolute, comps, start_inode, follow_final)
	}

	fn traverse_components(
		&self,
		absolute: bool,
		mut remaining: VecDeque<Vec<u8>>,
		start_inode: u32,
		follow_final: bool,
	) -> EResult<u32> {
		let mut current = if absolute { ROOT_INODE } else { start_inode };
		let mut symlink_hops = 0u32;
		while let Some(name) = remaining.pop_front() {
			let is_final = remaining.is_empty();
			let dir = inode::get(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, current)?;
			if dir.file_type() != FileType::Directory {
				return Err(errno!(ENOTDIR));
			}
			let mut scratch = LookupScratch::new();
			let found = dirent::find(
				self.dev.as_ref(),
				&self.sp,
				self.partition_base,
				&dir.i_block,
				&mut scratch,
				self.filetype_feature(),
				dir.size(&self.sp),
				&name,
			)?;
			let Some((ino, file_type)) = found else {
				return Err(errno!(ENOENT));
			};
			if file_type == Some(FileType::Symlink) && (!is_final || follow_final) {
				symlink_hops += 1;
				if symlink_hops > MAX_SYMLINK_HOPS {
					return Err(errno!(ELOOP));
				}
				let link_inode = inode::get(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, ino)?;
				let target = self.read_symlink_target(&link_inode)?;
				let (target_absolute, mut target_comps) = split_path(&target);
				if target_absolute {
					current = ROOT_INODE;
					target_comps.extend(remaining);
					remaining = target_comps;
				} else {
					target_comps.extend(remaining);
					remaining = target_comps;
				}
				continue;
			}
			current = ino;
		}
		Ok(current)
	}

	/// Resolves all but the last component of `path`, returning the parent directory's inode
	/// number and the final component's (unresolved) name.
	fn split_parent(&self, path: &[u8], cwd: u32) -> EResult<(u32, Vec<u8>)> {
		let (absolute, mut comps) = split_path(path);
		let name = comps.pop_back().ok_or(errno!(EINVAL))?;
		let parent = self.traverse_components(absolute, comps, cwd, true)?;
		Ok((parent, name))
	}

	/// Reads a symlink's target, from `i_block` directly if it is short enough to have been
	/// stored inline (see [`SYMLINK_INLINE_LIMIT`]), otherwise from its first data block.
	fn read_symlink_target(&self, inode: &Inode) -> EResult<Vec<u8>> {
		let size = inode.size(&self.sp);
		if size <= SYMLINK_INLINE_LIMIT {
			let mut buf = Vec::with_capacity(inode.i_block.len() * 4);
			for p in inode.i_block {
				buf.extend_from_slice(&p.to_le_bytes());
			}
			buf.truncate(size as usize);
			Ok(buf)
		} else {
			let mut scratch = LookupScratch::new();
			let Some(abs) = block_chain::resolve(self.dev.as_ref(), &self.sp, self.partition_base, &inode.i_block, &mut scratch, 0)?
			else {
				return Err(errno!(EUCLEAN));
			};
			let block = device::read_block(self.dev.as_ref(), self.sp.block_size(), self.partition_base, abs)?;
			Ok(block[..size as usize].to_vec())
		}
	}

	/// Stores `target` into a freshly allocated symlink inode, inline if short enough.
	fn write_symlink_target(&self, ino: u32, inode: &mut Inode, target: &[u8]) -> EResult<()> {
		if target.len() as u64 <= SYMLINK_INLINE_LIMIT {
			let mut padded = target.to_vec();
			padded.resize(inode.i_block.len() * 4, 0);
			for (i, chunk) in padded.chunks_exact(4).enumerate() {
				inode.i_block[i] = u32::from_le_bytes(chunk.try_into().unwrap());
			}
			inode.set_size(&self.sp, target.len() as u64, true);
		} else {
			let hint_group = (ino - 1) / self.sp.s_inodes_per_group;
			let mut scratch = LookupScratch::new();
			let (abs, _) = block_chain::resolve_or_alloc(
				self.dev.as_ref(),
				&self.sp,
				&self.bgdt,
				self.partition_base,
				&mut inode.i_block,
				&mut scratch,
				hint_group,
				0,
			)?;
			let mut buf = vec![0u8; self.sp.block_size() as usize];
			buf[..target.len()].copy_from_slice(target);
			device::write_block(self.dev.as_ref(), self.sp.block_size(), self.partition_base, abs, &buf)?;
			inode.set_size(&self.sp, target.len() as u64, false);
		}
		Ok(())
	}

	fn stat_of(&self, ino: u32, inode: &Inode) -> Stat {
		Stat {
			ino,
			file_type: inode.file_type(),
			mode: inode.i_mode & 0xfff,
			uid: inode.i_uid,
			gid: inode.i_gid,
			size: inode.size(&self.sp),
			links: inode.i_links_count,
			atime: inode.i_atime,
			mtime: inode.i_mtime,
			ctime: inode.i_ctime,
		}
	}

	/// Resolves `path`, following a trailing symlink.
	pub fn stat(&self, cwd: u32, path: &[u8]) -> EResult<Stat> {
		let ino = self.traverse(path, cwd, true)?;
		let inode = inode::get(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, ino)?;
		Ok(self.stat_of(ino, &inode))
	}

	/// Resolves `path` without following a trailing symlink.
	pub fn lstat(&self, cwd: u32, path: &[u8]) -> EResult<Stat> {
		let ino = self.traverse(path, cwd, false)?;
		let inode = inode::get(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, ino)?;
		Ok(self.stat_of(ino, &inode))
	}

	/// Reports the metadata of an already-open descriptor.
	pub fn fstat(&self, fh: &FileHandle) -> Stat {
		self.stat_of(fh.ino, &fh.inode)
	}

	/// Reads a symlink's target without following it.
	pub fn readlink(&self, cwd: u32, path: &[u8]) -> EResult<Vec<u8>> {
		let ino = self.traverse(path, cwd, false)?;
		let inode = inode::get(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, ino)?;
		if inode.file_type() != FileType::Symlink {
			return Err(errno!(EINVAL));
		}
		self.read_symlink_target(&inode)
	}

	/// Opens `path`, creating it as a regular file first if `O_CREAT` is set and it does not
	/// exist. `O_NOFOLLOW` on a path whose final component is a symlink fails `ELOOP`, matching
	/// spec.md §4.9 (distinct from `lstat`, which returns the symlink itself without error).
	pub fn open(&self, cwd: u32, path: &[u8], flags: OpenFlags, mode: u16, now: u32) -> EResult<FileHandle> {
		let follow_final = !flags.has(OpenFlags::NOFOLLOW);
		let ino = match self.traverse(path, cwd, follow_final) {
			Ok(ino) => {
				if flags.has(OpenFlags::CREAT) && flags.has(OpenFlags::EXCL) {
					return Err(errno!(EEXIST));
				}
				if !follow_final {
					let found = inode::get(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, ino)?;
					if found.file_type() == FileType::Symlink {
						return Err(errno!(ELOOP));
					}
				}
				ino
			}
			Err(e) if e == errno!(ENOENT) && flags.has(OpenFlags::CREAT) => {
				let (parent, name) = self.split_parent(path, cwd)?;
				self.touch(parent, &name, FileType::Regular, mode, now)?
			}
			Err(e) => return Err(e),
		};

		let mut inode = inode::get(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, ino)?;
		if flags.has(OpenFlags::DIRECTORY) && inode.file_type() != FileType::Directory {
			return Err(errno!(ENOTDIR));
		}
		if flags.has(OpenFlags::TRUNC) && inode.file_type() == FileType::Regular && inode.size(&self.sp) != 0 {
			block_chain::free_all(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, &mut inode.i_block)?;
			inode.set_size(&self.sp, 0, false);
			inode::put(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, ino, &inode)?;
		}

		Ok(FileHandle {
			object: self.objects.acquire(ino),
			ino,
			inode,
			ptr: 0,
			flags,
			scratch: LookupScratch::new(),
			dirname: None,
		})
	}

	/// Allocates a fresh inode of `file_type` and links it into `parent` as `name`.
	fn touch(&self, parent: u32, name: &[u8], file_type: FileType, mode: u16, now: u32) -> EResult<u32> {
		if name == b"." || name == b".." {
			return Err(errno!(EEXIST));
		}
		let mut parent_inode = inode::get(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, parent)?;
		if parent_inode.file_type() != FileType::Directory {
			return Err(errno!(ENOTDIR));
		}
		let filetype_feature = self.filetype_feature();
		let mut scratch = LookupScratch::new();
		let exists = dirent::find(
			self.dev.as_ref(),
			&self.sp,
			self.partition_base,
			&parent_inode.i_block,
			&mut scratch,
			filetype_feature,
			parent_inode.size(&self.sp),
			name,
		)?;
		if exists.is_some() {
			return Err(errno!(EEXIST));
		}

		let hint_group = (parent - 1) / self.sp.s_inodes_per_group;
		let mut rec = Inode::new(file_type, mode, 0, 0, now);
		rec.i_links_count = if file_type == FileType::Directory { 2 } else { 1 };
		let ino = inode::allocate(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, hint_group, &rec)?;

		if file_type == FileType::Directory {
			self.init_dir_block(ino, &mut rec, parent)?;
			inode::put(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, ino, &rec)?;
		}

		let mut size = parent_inode.size(&self.sp);
		dirent::allocate(
			self.dev.as_ref(),
			&self.sp,
			&self.bgdt,
			self.partition_base,
			&mut parent_inode.i_block,
			&mut scratch,
			hint_group,
			&mut size,
			filetype_feature,
			name,
			Some(file_type),
			ino,
		)?;
		if size != parent_inode.size(&self.sp) {
			parent_inode.set_size(&self.sp, size, false);
		}
		if file_type == FileType::Directory {
			// The new subdirectory's ".." entry counts as another link to its parent.
			parent_inode.i_links_count += 1;
		}
		inode::put(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, parent, &parent_inode)?;
		Ok(ino)
	}

	/// Writes a new directory's first data block with its `.`/`..` entries and records its size.
	fn init_dir_block(&self, ino: u32, rec: &mut Inode, parent: u32) -> EResult<()> {
		let hint_group = (ino - 1) / self.sp.s_inodes_per_group;
		let mut scratch = LookupScratch::new();
		let (abs, _) = block_chain::resolve_or_alloc(
			self.dev.as_ref(),
			&self.sp,
			&self.bgdt,
			self.partition_base,
			&mut rec.i_block,
			&mut scratch,
			hint_group,
			0,
		)?;
		let filetype_feature = self.filetype_feature();
		let block_size = self.sp.block_size() as usize;
		let mut buf = vec![0u8; block_size];
		let dot_len = dirent::rec_len_for(b".")? as usize;
		let dotdot_len = block_size - dot_len;
		let dot = Dirent { inode: ino, rec_len: dot_len as u16, file_type: Some(FileType::Directory), name: b".".to_vec() };
		let dotdot =
			Dirent { inode: parent, rec_len: dotdot_len as u16, file_type: Some(FileType::Directory), name: b"..".to_vec() };
		dot.encode(&mut buf[..dot_len], filetype_feature);
		dotdot.encode(&mut buf[dot_len..], filetype_feature);
		device::write_block(self.dev.as_ref(), self.sp.block_size(), self.partition_base, abs, &buf)?;
		rec.set_size(&self.sp, block_size as u64, false);
		Ok(())
	}

	/// Creates a directory at `path`.
	pub fn mkdir(&self, cwd: u32, path: &[u8], mode: u16, now: u32) -> EResult<u32> {
		let (parent, name) = self.split_parent(path, cwd)?;
		self.touch(parent, &name, FileType::Directory, mode, now)
	}

	/// Creates a symlink at `link_path` pointing to `target` (stored verbatim, not resolved).
	pub fn symlink(&self, cwd: u32, target: &[u8], link_path: &[u8], now: u32) -> EResult<u32> {
		let (parent, name) = self.split_parent(link_path, cwd)?;
		let ino = self.touch(parent, &name, FileType::Symlink, 0o777, now)?;
		let mut rec = inode::get(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, ino)?;
		self.write_symlink_target(ino, &mut rec, target)?;
		inode::put(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, ino, &rec)?;
		Ok(ino)
	}

	/// Adds a hard link at `new_path` to the regular file or directory `existing_path` resolves
	/// to. Any other file type is rejected.
	pub fn link(&self, cwd: u32, existing_path: &[u8], new_path: &[u8]) -> EResult<()> {
		let existing_ino = self.traverse(existing_path, cwd, true)?;
		let mut existing = inode::get(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, existing_ino)?;
		if !matches!(existing.file_type(), FileType::Regular | FileType::Directory) {
			return Err(errno!(EPERM));
		}

		let (parent, name) = self.split_parent(new_path, cwd)?;
		let mut parent_inode = inode::get(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, parent)?;
		if parent_inode.file_type() != FileType::Directory {
			return Err(errno!(ENOTDIR));
		}
		let filetype_feature = self.filetype_feature();
		let mut scratch = LookupScratch::new();
		if dirent::find(
			self.dev.as_ref(),
			&self.sp,
			self.partition_base,
			&parent_inode.i_block,
			&mut scratch,
			filetype_feature,
			parent_inode.size(&self.sp),
			&name,
		)?
		.is_some()
		{
			return Err(errno!(EEXIST));
		}

		let hint_group = (parent - 1) / self.sp.s_inodes_per_group;
		let mut size = parent_inode.size(&self.sp);
		dirent::allocate(
			self.dev.as_ref(),
			&self.sp,
			&self.bgdt,
			self.partition_base,
			&mut parent_inode.i_block,
			&mut scratch,
			hint_group,
			&mut size,
			filetype_feature,
			&name,
			Some(existing.file_type()),
			existing_ino,
		)?;
		if size != parent_inode.size(&self.sp) {
			parent_inode.set_size(&self.sp, size, false);
		}
		inode::put(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, parent, &parent_inode)?;

		existing.i_links_count += 1;
		inode::put(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, existing_ino, &existing)?;
		Ok(())
	}

	/// Removes the directory entry named by `path`'s final component. `directory` selects whether
	/// a directory (`ENOTDIR` if it isn't one, emptiness-checked first) or a non-directory
	/// (`EISDIR` if it is one) is expected, matching `rmdir` vs `unlink`.
	///
	/// `hard_links` is decremented unconditionally, even past zero it would otherwise go negative
	/// is clamped; actual deallocation is deferred to [`Volume::close`] if another descriptor has
	/// the inode open (see [`crate::object::Object::unlinked`]).
	pub fn delete(&self, cwd: u32, path: &[u8], directory: bool, now: u32) -> EResult<()> {
		if path == b"/" {
			return Err(errno!(EPERM));
		}
		let (parent, name) = self.split_parent(path, cwd)?;
		let mut parent_inode = inode::get(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, parent)?;
		let filetype_feature = self.filetype_feature();
		let mut scratch = LookupScratch::new();
		let Some((ino, file_type)) = dirent::find(
			self.dev.as_ref(),
			&self.sp,
			self.partition_base,
			&parent_inode.i_block,
			&mut scratch,
			filetype_feature,
			parent_inode.size(&self.sp),
			&name,
		)?
		else {
			return Err(errno!(ENOENT));
		};
		let is_dir = file_type == Some(FileType::Directory);
		if directory && !is_dir {
			return Err(errno!(ENOTDIR));
		}
		if !directory && is_dir {
			return Err(errno!(EISDIR));
		}

		let mut target = inode::get(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, ino)?;
		if is_dir {
			let mut only_dots = true;
			dirent::enumerate(
				self.dev.as_ref(),
				&self.sp,
				self.partition_base,
				&target.i_block,
				&mut LookupScratch::new(),
				filetype_feature,
				target.size(&self.sp),
				|_, _, entry_name| {
					if entry_name != b"." && entry_name != b".." {
						only_dots = false;
					}
					Ok(())
				},
			)?;
			if !only_dots {
				return Err(errno!(ENOTEMPTY));
			}
		}

		if !dirent::remove(
			self.dev.as_ref(),
			&self.sp,
			self.partition_base,
			&parent_inode.i_block,
			&mut scratch,
			filetype_feature,
			parent_inode.size(&self.sp),
			&name,
		)? {
			return Err(errno!(ENOENT));
		}
		if is_dir {
			parent_inode.i_links_count = parent_inode.i_links_count.saturating_sub(1);
		}
		inode::put(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, parent, &parent_inode)?;

		target.i_links_count = target.i_links_count.saturating_sub(1);
		let now_unlinked = target.i_links_count == 0;
		if now_unlinked {
			target.i_dtime = now;
		}

		if let Some(obj) = self.objects.peek(ino) {
			inode::put(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, ino, &target)?;
			if now_unlinked {
				obj.unlinked.store(true, Relaxed);
			}
		} else {
			inode::put(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, ino, &target)?;
			if now_unlinked {
				block_chain::free_all(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, &mut target.i_block)?;
				inode::free(self.dev.as_ref(), &self.sp, &self.bgdt, self.partition_base, ino, is_dir)?;
			}
		}
		Ok(())
	}

	/// Emits directory entries of an open directory descriptor in Linux `getdents64` ABI form,
	/// advancing the descriptor's cursor to resume from.
	pub fn getdents64(&self, fh: &mut FileHandle, buf: &mut [u8]) -> EResult<usize> {
		if fh.file_type() != FileType::Directory {
			return Err(errno!(ENOTDIR));
		}
		let _guard = fh.object.content.read();
		let (written, next_off) = dirent::getdents64(
			self.dev.as_ref(),
			&self.sp,
			self.partition_base,
			&fh.inode.i_block,
			&mut fh.scratch,
			self.filetype_feature(),
			fh.inode.size(&self.sp),
			fh.ptr,
			buf,
		)?;
		fh.ptr = next_off;
		Ok(written)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::device::test_utils::RamDisk;
	use crate::inode::FileType;
	use crate::superblock::{self, EXT2_MAGIC, FS_STATE_CLEAN, REQUIRED_FEATURE_FILETYPE};
	use crate::volume::MountOptions;
	use alloc::boxed::Box;

	/// A one-group, 1024-byte-block image with a root directory already formatted (`.`/`..`
	/// pointing at inode 2), blocks 1..=10 and inode 1..=2 pre-marked used.
	fn make_volume() -> Volume {
		let dev = RamDisk::new(512, 4096);

		let mut sb = [0u8; superblock::SUPERBLOCK_SIZE];
		sb[0..4].copy_from_slice(&64u32.to_le_bytes()); // s_inodes_count
		sb[4..8].copy_from_slice(&2048u32.to_le_bytes()); // s_blocks_count
		sb[16..20].copy_from_slice(&62u32.to_le_bytes()); // s_free_inodes_count
		sb[20..24].copy_from_slice(&1u32.to_le_bytes()); // s_first_data_block
		sb[24..28].copy_from_slice(&0u32.to_le_bytes()); // 1024-byte blocks
		sb[32..36].copy_from_slice(&2048u32.to_le_bytes()); // s_blocks_per_group
		sb[40..44].copy_from_slice(&64u32.to_le_bytes()); // s_inodes_per_group
		sb[56..58].copy_from_slice(&EXT2_MAGIC.to_le_bytes());
		sb[58..60].copy_from_slice(&FS_STATE_CLEAN.to_le_bytes());
		sb[76..80].copy_from_slice(&1u32.to_le_bytes()); // s_rev_level
		sb[88..90].copy_from_slice(&128u16.to_le_bytes()); // s_inode_size
		sb[96..100].copy_from_slice(&REQUIRED_FEATURE_FILETYPE.to_le_bytes());
		device::write_bytes(&dev, superblock::SUPERBLOCK_OFFSET, &sb).unwrap();

		let mut bgd_raw = Vec::new();
		bgd_raw.extend_from_slice(&4u32.to_le_bytes()); // bg_block_bitmap
		bgd_raw.extend_from_slice(&5u32.to_le_bytes()); // bg_inode_bitmap
		bgd_raw.extend_from_slice(&6u32.to_le_bytes()); // bg_inode_table (blocks 6..=13, 64 inodes)
		bgd_raw.extend_from_slice(&2023u16.to_le_bytes()); // bg_free_blocks_count
		bgd_raw.extend_from_slice(&62u16.to_le_bytes()); // bg_free_inodes_count
		bgd_raw.extend_from_slice(&1u16.to_le_bytes()); // bg_used_dirs_count (root)
		bgd_raw.resize(1024, 0);
		device::write_bytes(&dev, 2 * 1024, &bgd_raw).unwrap();

		// Blocks 1..=14 reserved: superblock, BGDT, bitmaps, 8-block inode table, root dir block.
		let mut block_bitmap = vec![0u8; 1024];
		block_bitmap[0] = 0xff;
		block_bitmap[1] = 0xff;
		device::write_bytes(&dev, 4 * 1024, &block_bitmap).unwrap();

		// Inode 1 reserved, inode 2 (root) used.
		let mut inode_bitmap = vec![0u8; 1024];
		inode_bitmap[0] = 0x03;
		device::write_bytes(&dev, 5 * 1024, &inode_bitmap).unwrap();

		let vol = Volume::mount(Box::new(dev), MountOptions::default()).unwrap();

		let mut root = Inode::new(FileType::Directory, 0o755, 0, 0, 1_000);
		root.i_links_count = 2;
		vol.init_dir_block(ROOT_INODE, &mut root, ROOT_INODE).unwrap();
		inode::put(vol.dev.as_ref(), &vol.sp, &vol.bgdt, vol.partition_base, ROOT_INODE, &root).unwrap();

		vol
	}

	#[test]
	fn creates_writes_closes_reopens_and_reads_back() {
		let vol = make_volume();
		let mut fh = vol.open(ROOT_INODE, b"/hello.txt", OpenFlags(OpenFlags::RDWR | OpenFlags::CREAT), 0o644, 2_000).unwrap();
		vol.write(&mut fh, b"0123456789012").unwrap();
		vol.close(fh).unwrap();

		let mut fh = vol.open(ROOT_INODE, b"/hello.txt", OpenFlags(OpenFlags::RDWR), 0, 2_001).unwrap();
		let mut buf = [0u8; 13];
		let n = vol.read(&mut fh, &mut buf).unwrap();
		assert_eq!(n, 13);
		assert_eq!(&buf, b"0123456789012");
	}

	#[test]
	fn open_excl_on_an_existing_file_fails() {
		let vol = make_volume();
		let fh = vol.open(ROOT_INODE, b"/a", OpenFlags(OpenFlags::RDWR | OpenFlags::CREAT), 0o644, 0).unwrap();
		vol.close(fh).unwrap();
		let flags = OpenFlags(OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::EXCL);
		assert_eq!(vol.open(ROOT_INODE, b"/a", flags, 0o644, 0), Err(errno!(EEXIST)));
	}

	#[test]
	fn mkdir_then_enumerate_then_remove() {
		let vol = make_volume();
		vol.mkdir(ROOT_INODE, b"/sub", 0o755, 0).unwrap();
		for i in 0..5 {
			let name = alloc::format!("/sub/f{i}");
			let fh = vol
				.open(ROOT_INODE, name.as_bytes(), OpenFlags(OpenFlags::RDWR | OpenFlags::CREAT), 0o644, 0)
				.unwrap();
			vol.close(fh).unwrap();
		}
		vol.delete(ROOT_INODE, b"/sub/f2", false, 0).unwrap();

		let sub_ino = vol.traverse(b"/sub", ROOT_INODE, true).unwrap();
		let mut fh = vol.open(ROOT_INODE, b"/sub", OpenFlags(OpenFlags::DIRECTORY), 0, 0).unwrap();
		assert_eq!(fh.ino(), sub_ino);
		let mut buf = [0u8; 4096];
		let written = vol.getdents64(&mut fh, &mut buf).unwrap();
		let mut names = Vec::new();
		let mut off = 0;
		while off < written {
			let reclen = u16::from_le_bytes(buf[off + 16..off + 18].try_into().unwrap()) as usize;
			let name_start = off + 19;
			let nul = buf[name_start..off + reclen].iter().position(|&b| b == 0).unwrap();
			names.push(buf[name_start..name_start + nul].to_vec());
			off += reclen;
		}
		assert!(names.contains(&b".".to_vec()));
		assert!(names.contains(&b"..".to_vec()));
		assert!(names.contains(&b"f0".to_vec()));
		assert!(!names.contains(&b"f2".to_vec()));
	}

	#[test]
	fn rmdir_on_a_nonempty_directory_fails() {
		let vol = make_volume();
		vol.mkdir(ROOT_INODE, b"/sub", 0o755, 0).unwrap();
		let fh = vol
			.open(ROOT_INODE, b"/sub/f", OpenFlags(OpenFlags::RDWR | OpenFlags::CREAT), 0o644, 0)
			.unwrap();
		vol.close(fh).unwrap();
		assert_eq!(vol.delete(ROOT_INODE, b"/sub", true, 0), Err(errno!(ENOTEMPTY)));
	}

	#[test]
	fn symlink_resolves_and_nofollow_reports_eloop() {
		let vol = make_volume();
		let mut fh = vol
			.open(ROOT_INODE, b"/target", OpenFlags(OpenFlags::RDWR | OpenFlags::CREAT), 0o644, 0)
			.unwrap();
		vol.write(&mut fh, b"contents").unwrap();
		vol.close(fh).unwrap();

		vol.symlink(ROOT_INODE, b"/target", b"/link", 0).unwrap();
		let target_ino = vol.traverse(b"/target", ROOT_INODE, true).unwrap();
		assert_eq!(vol.traverse(b"/link", ROOT_INODE, true).unwrap(), target_ino);

		let readback = vol.readlink(ROOT_INODE, b"/link").unwrap();
		assert_eq!(readback, b"/target");

		let flags = OpenFlags(OpenFlags::RDONLY | OpenFlags::NOFOLLOW);
		assert_eq!(vol.open(ROOT_INODE, b"/link", flags, 0, 0), Err(errno!(ELOOP)));
	}

	#[test]
	fn hardlink_shares_the_inode_and_bumps_link_count() {
		let vol = make_volume();
		let fh = vol
			.open(ROOT_INODE, b"/a", OpenFlags(OpenFlags::RDWR | OpenFlags::CREAT), 0o644, 0)
			.unwrap();
		vol.close(fh).unwrap();
		vol.link(ROOT_INODE, b"/a", b"/b").unwrap();
		let stat_a = vol.stat(ROOT_INODE, b"/a").unwrap();
		let stat_b = vol.stat(ROOT_INODE, b"/b").unwrap();
		assert_eq!(stat_a.ino, stat_b.ino);
		assert_eq!(stat_a.links, 2);
	}

	#[test]
	fn delete_defers_reclaim_while_a_handle_is_open() {
		let vol = make_volume();
		let mut fh = vol
			.open(ROOT_INODE, b"/a", OpenFlags(OpenFlags::RDWR | OpenFlags::CREAT), 0o644, 0)
			.unwrap();
		vol.write(&mut fh, b"still readable").unwrap();
		vol.delete(ROOT_INODE, b"/a", false, 0).unwrap();
		assert!(fh.object.unlinked.load(Relaxed));

		fh.ptr = 0;
		let mut buf = [0u8; 14];
		vol.read(&mut fh, &mut buf).unwrap();
		assert_eq!(&buf, b"still readable");
		vol.close(fh).unwrap();
	}
}
