//! Directory entries: variable-length records stored in a directory inode's data blocks, each
//! naming a subfile and pointing at its inode.
//!
//! The functions past [`fill_free`] form the directory engine proper (spec.md §4.8):
//! [`enumerate`], [`find`], [`allocate`] and [`remove`] walk a directory inode's data blocks
//! through [`crate::block_chain`], reusing the record codec above. They are free functions
//! taking the directory's `i_block` array and size rather than methods on some `Directory`
//! type, since the caller (`path.rs`) already holds the inode record's fields individually and
//! there is no benefit to re-bundling them here.

use crate::block_chain::{self, LookupScratch};
use crate::bgd::Bgdt;
use crate::device::{self, BlockDevice};
use crate::errno::{EResult, errno};
use crate::inode::{DIRECT_BLOCKS, FileType};
use crate::superblock::Superblock;
use alloc::vec;
use alloc::vec::Vec;

/// Offset of the `name` field within an entry.
pub const NAME_OFF: usize = 8;
/// Alignment required of every entry's `rec_len` and of every entry's start within a block.
pub const ALIGN: usize = 4;
/// Maximum length of a file name.
pub const NAME_MAX: usize = 255;

const TYPE_UNKNOWN: u8 = 0;
const TYPE_REGULAR: u8 = 1;
const TYPE_DIRECTORY: u8 = 2;
const TYPE_CHAR_DEVICE: u8 = 3;
const TYPE_BLOCK_DEVICE: u8 = 4;
const TYPE_FIFO: u8 = 5;
const TYPE_SOCKET: u8 = 6;
const TYPE_SYMLINK: u8 = 7;

/// A decoded directory entry. Entries are variable-length on disk; this is an owned, detached
/// copy rather than a view into the block buffer.
#[derive(Debug, Clone)]
pub struct Dirent {
	pub inode: u32,
	pub rec_len: u16,
	pub file_type: Option<FileType>,
	pub name: Vec<u8>,
}

impl Dirent {
	/// An entry is free (unused space available for reuse) when it points at inode 0.
	pub fn is_free(&self) -> bool {
		self.inode == 0
	}

	/// Decodes the entry starting at byte 0 of `buf`. `filetype_feature` reflects whether
	/// `REQUIRED_FEATURE_FILETYPE` is set, which determines whether `name_len`'s high byte is a
	/// type indicator or an extension of the name length.
	pub fn decode(buf: &[u8], filetype_feature: bool) -> EResult<Self> {
		if buf.len() < NAME_OFF {
			return Err(errno!(EUCLEAN));
		}
		let inode = u32::from_le_bytes(buf[0..4].try_into().unwrap());
		let rec_len = u16::from_le_bytes(buf[4..6].try_into().unwrap());
		let name_len_lo = buf[6];
		let type_or_hi = buf[7];
		if rec_len as usize > buf.len() || (rec_len as usize) < NAME_OFF || rec_len as usize % ALIGN != 0 {
			return Err(errno!(EUCLEAN));
		}
		let (name_len, file_type) = if filetype_feature {
			(name_len_lo as usize, decode_type(type_or_hi))
		} else {
			(((type_or_hi as usize) << 8) | name_len_lo as usize, None)
		};
		if inode != 0 && NAME_OFF + name_len > rec_len as usize {
			return Err(errno!(EUCLEAN));
		}
		let name = buf[NAME_OFF..NAME_OFF + name_len].to_vec();
		Ok(Self {
			inode,
			rec_len,
			file_type,
			name,
		})
	}

	/// Encodes this entry into the front of `buf`, which must be at least `rec_len` bytes.
	pub fn encode(&self, buf: &mut [u8], filetype_feature: bool) {
		buf[0..4].copy_from_slice(&self.inode.to_le_bytes());
		buf[4..6].copy_from_slice(&self.rec_len.to_le_bytes());
		let name_len = self.name.len();
		if filetype_feature {
			buf[6] = name_len as u8;
			buf[7] = self.file_type.map_or(TYPE_UNKNOWN, encode_type);
		} else {
			buf[6] = (name_len & 0xff) as u8;
			buf[7] = (name_len >> 8) as u8;
		}
		buf[NAME_OFF..NAME_OFF + name_len].copy_from_slice(&self.name);
	}

	/// Builds a free entry spanning `rec_len` bytes (no name, inode 0), used to pad the unused
	/// tail of a block.
	pub fn free_entry(rec_len: u16) -> Self {
		Self {
			inode: 0,
			rec_len,
			file_type: None,
			name: Vec::new(),
		}
	}
}

fn decode_type(t: u8) -> Option<FileType> {
	Some(match t {
		TYPE_REGULAR => FileType::Regular,
		TYPE_DIRECTORY => FileType::Directory,
		TYPE_CHAR_DEVICE => FileType::CharDevice,
		TYPE_BLOCK_DEVICE => FileType::BlockDevice,
		TYPE_FIFO => FileType::Fifo,
		TYPE_SOCKET => FileType::Socket,
		TYPE_SYMLINK => FileType::Symlink,
		_ => return None,
	})
}

fn encode_type(t: FileType) -> u8 {
	match t {
		FileType::Regular => TYPE_REGULAR,
		FileType::Directory => TYPE_DIRECTORY,
		FileType::CharDevice => TYPE_CHAR_DEVICE,
		FileType::BlockDevice => TYPE_BLOCK_DEVICE,
		FileType::Fifo => TYPE_FIFO,
		FileType::Socket => TYPE_SOCKET,
		FileType::Symlink => TYPE_SYMLINK,
	}
}

/// Iterates every entry (including free ones) in a single block's worth of directory content,
/// yielding `(offset within the block, entry)`.
pub fn iter_block(buf: &[u8], filetype_feature: bool) -> EResult<Vec<(usize, Dirent)>> {
	let mut out = Vec::new();
	let mut off = 0;
	while off < buf.len() {
		let ent = Dirent::decode(&buf[off..], filetype_feature)?;
		let rec_len = ent.rec_len as usize;
		out.push((off, ent));
		off += rec_len;
	}
	Ok(out)
}

/// Computes the record length needed to store `name`, rounded up to [`ALIGN`].
pub fn rec_len_for(name: &[u8]) -> EResult<u16> {
	if name.len() > NAME_MAX {
		return Err(errno!(ENAMETOOLONG));
	}
	let len = (NAME_OFF + name.len()).next_multiple_of(ALIGN);
	u16::try_from(len).map_err(|_| errno!(ENAMETOOLONG))
}

/// Fills `buf` with one or more free entries so that every byte of it is accounted for by some
/// entry, as ext2 directories require.
pub fn fill_free(buf: &mut [u8], filetype_feature: bool) {
	const MAX: usize = u16::MAX as usize;
	let mut i = 0;
	while buf.len() - i >= NAME_OFF {
		let remaining = buf.len() - i;
		let rec_len = if remaining > MAX {
			(MAX / 2).next_multiple_of(ALIGN)
		} else {
			remaining
		};
		Dirent::free_entry(rec_len as u16).encode(&mut buf[i..i + rec_len], filetype_feature);
		i += rec_len;
	}
}

/// The on-disk shape of a directory inode's block-pointer array, spelled out since this module
/// has no `Inode` of its own to borrow the type alias from.
type IBlock = [u32; DIRECT_BLOCKS + 3];

/// Linux `DT_*` constants, used by [`getdents64`]'s `d_type` field.
fn linux_d_type(t: FileType) -> u8 {
	match t {
		FileType::Fifo => 1,
		FileType::CharDevice => 2,
		FileType::Directory => 4,
		FileType::BlockDevice => 6,
		FileType::Regular => 8,
		FileType::Symlink => 10,
		FileType::Socket => 12,
	}
}

/// Walks every data block of a directory inode (up to `size` bytes), invoking `callback` with
/// `(inode, file_type, name)` for each live entry. Tombstoned entries (`inode == 0`) are skipped,
/// matching spec.md §4.8.
pub fn enumerate(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	partition_base: u64,
	i_block: &IBlock,
	scratch: &mut LookupScratch,
	filetype_feature: bool,
	size: u64,
	mut callback: impl FnMut(u32, Option<FileType>, &[u8]) -> EResult<()>,
) -> EResult<()> {
	let block_size = sp.block_size() as u64;
	let num_blocks = size.div_ceil(block_size.max(1));
	for file_blk in 0..num_blocks {
		let Some(abs) = block_chain::resolve(dev, sp, partition_base, i_block, scratch, file_blk as u32)? else {
			continue;
		};
		let buf = device::read_block(dev, sp.block_size(), partition_base, abs)?;
		for (_, ent) in iter_block(&buf, filetype_feature)? {
			if ent.is_free() {
				continue;
			}
			callback(ent.inode, ent.file_type, &ent.name)?;
		}
	}
	Ok(())
}

/// Looks up `name` among a directory's live entries, returning its inode number and file type.
pub fn find(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	partition_base: u64,
	i_block: &IBlock,
	scratch: &mut LookupScratch,
	filetype_feature: bool,
	size: u64,
	name: &[u8],
) -> EResult<Option<(u32, Option<FileType>)>> {
	let mut found = None;
	enumerate(dev, sp, partition_base, i_block, scratch, filetype_feature, size, |ino, ft, n| {
		if found.is_none() && n == name {
			found = Some((ino, ft));
		}
		Ok(())
	})?;
	Ok(found)
}

/// Adds a new `(name, target_ino)` entry to a directory.
///
/// Scans existing blocks for a record whose declared size leaves enough slack past its own
/// minimum size to host the new entry, splitting it in place. If none has room, allocates a
/// fresh directory block (via [`block_chain::resolve_or_alloc`]) sized to hold exactly one
/// record spanning the whole block, and grows `size` by one block. Returns the number of new
/// blocks allocated (0 or 1), for the caller's `i_blocks` accounting.
#[allow(clippy::too_many_arguments)]
pub fn allocate(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	bgdt: &Bgdt,
	partition_base: u64,
	i_block: &mut IBlock,
	scratch: &mut LookupScratch,
	hint_group: u32,
	size: &mut u64,
	filetype_feature: bool,
	name: &[u8],
	file_type: Option<FileType>,
	target_ino: u32,
) -> EResult<u32> {
	let needed = rec_len_for(name)? as usize;
	let block_size = sp.block_size() as u64;
	let num_blocks = size.div_ceil(block_size.max(1));
	for file_blk in 0..num_blocks {
		let Some(abs) = block_chain::resolve(dev, sp, partition_base, i_block, scratch, file_blk as u32)? else {
			continue;
		};
		let mut buf = device::read_block(dev, sp.block_size(), partition_base, abs)?;
		let entries = iter_block(&buf, filetype_feature)?;
		for (off, ent) in &entries {
			let min_self = if ent.is_free() { 0 } else { rec_len_for(&ent.name)? as usize };
			let slack = ent.rec_len as usize - min_self;
			if slack < needed {
				continue;
			}
			if !ent.is_free() {
				// Shrink the existing entry to its own minimum size; its name bytes already in
				// place stay valid since they sit before the new slack region.
				buf[off + 4..off + 6].copy_from_slice(&(min_self as u16).to_le_bytes());
			}
			let new_off = off + min_self;
			let new_ent = Dirent {
				inode: target_ino,
				rec_len: slack as u16,
				file_type,
				name: name.to_vec(),
			};
			new_ent.encode(&mut buf[new_off..new_off + slack], filetype_feature);
			device::write_block(dev, sp.block_size(), partition_base, abs, &buf)?;
			return Ok(0);
		}
	}
	// No slack anywhere: grow the directory by one block.
	let (abs, allocated) =
		block_chain::resolve_or_alloc(dev, sp, bgdt, partition_base, i_block, scratch, hint_group, num_blocks as u32)?;
	let mut buf = vec![0u8; sp.block_size() as usize];
	let new_ent = Dirent {
		inode: target_ino,
		rec_len: sp.block_size() as u16,
		file_type,
		name: name.to_vec(),
	};
	new_ent.encode(&mut buf, filetype_feature);
	device::write_block(dev, sp.block_size(), partition_base, abs, &buf)?;
	*size += block_size;
	Ok(allocated)
}

/// Removes the entry named `name` from a directory. If it is the first record in its block, it
/// is tombstoned in place (`inode = 0`); otherwise the preceding record's `rec_len` is extended
/// to absorb it. Returns `false` if no such entry exists.
pub fn remove(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	partition_base: u64,
	i_block: &IBlock,
	scratch: &mut LookupScratch,
	filetype_feature: bool,
	size: u64,
	name: &[u8],
) -> EResult<bool> {
	let block_size = sp.block_size() as u64;
	let num_blocks = size.div_ceil(block_size.max(1));
	for file_blk in 0..num_blocks {
		let Some(abs) = block_chain::resolve(dev, sp, partition_base, i_block, scratch, file_blk as u32)? else {
			continue;
		};
		let mut buf = device::read_block(dev, sp.block_size(), partition_base, abs)?;
		let entries = iter_block(&buf, filetype_feature)?;
		let Some(pos) = entries.iter().position(|(_, e)| !e.is_free() && e.name == name) else {
			continue;
		};
		let off = entries[pos].0;
		if pos == 0 {
			buf[off..off + 4].copy_from_slice(&0u32.to_le_bytes());
		} else {
			let (prev_off, prev) = &entries[pos - 1];
			let new_len = prev.rec_len + entries[pos].1.rec_len;
			buf[*prev_off + 4..*prev_off + 6].copy_from_slice(&new_len.to_le_bytes());
		}
		device::write_block(dev, sp.block_size(), partition_base, abs, &buf)?;
		return Ok(true);
	}
	Ok(false)
}

/// Emits Linux `struct linux_dirent64`-layout records into `buf` starting at byte offset
/// `start_off` within the directory's logical record stream, up to `buf.len()`. Returns the
/// number of bytes written and the offset to resume from on the next call.
#[allow(clippy::too_many_arguments)]
pub fn getdents64(
	dev: &dyn BlockDevice,
	sp: &Superblock,
	partition_base: u64,
	i_block: &IBlock,
	scratch: &mut LookupScratch,
	filetype_feature: bool,
	size: u64,
	start_off: u64,
	buf: &mut [u8],
) -> EResult<(usize, u64)> {
	const HEADER: usize = 8 + 8 + 2 + 1;
	let block_size = sp.block_size() as u64;
	let mut off = start_off;
	let mut written = 0usize;
	while off < size {
		let file_blk = (off / block_size) as u32;
		let in_block_off = (off % block_size) as usize;
		let Some(abs) = block_chain::resolve(dev, sp, partition_base, i_block, scratch, file_blk)? else {
			off += block_size - in_block_off as u64;
			continue;
		};
		let block_buf = device::read_block(dev, sp.block_size(), partition_base, abs)?;
		let ent = Dirent::decode(&block_buf[in_block_off..], filetype_feature)?;
		let next_off = off + ent.rec_len as u64;
		if ent.is_free() {
			off = next_off;
			continue;
		}
		let entry_len = (HEADER + ent.name.len() + 1).next_multiple_of(8);
		if written + entry_len > buf.len() {
			break;
		}
		let out = &mut buf[written..written + entry_len];
		out[0..8].copy_from_slice(&(ent.inode as u64).to_le_bytes());
		out[8..16].copy_from_slice(&next_off.to_le_bytes());
		out[16..18].copy_from_slice(&(entry_len as u16).to_le_bytes());
		out[18] = ent.file_type.map_or(0, linux_d_type);
		out[19..19 + ent.name.len()].copy_from_slice(&ent.name);
		out[19 + ent.name.len()..].fill(0);
		written += entry_len;
		off = next_off;
	}
	Ok((written, off))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bgd::{Bgdt, BlockGroupDescriptor};
	use crate::device::test_utils::RamDisk;

	fn make_sp() -> Superblock {
		let mut raw = [0u8; crate::superblock::SUPERBLOCK_SIZE];
		raw[0..4].copy_from_slice(&16u32.to_le_bytes());
		raw[4..8].copy_from_slice(&64u32.to_le_bytes());
		raw[20..24].copy_from_slice(&1u32.to_le_bytes());
		raw[24..28].copy_from_slice(&0u32.to_le_bytes()); // 1024-byte blocks
		raw[32..36].copy_from_slice(&64u32.to_le_bytes());
		raw[40..44].copy_from_slice(&16u32.to_le_bytes());
		Superblock::from_bytes(&raw)
	}

	fn make_bgdt() -> Bgdt {
		Bgdt::from_entries(
			vec![BlockGroupDescriptor {
				bg_block_bitmap: 2,
				bg_inode_bitmap: 3,
				bg_inode_table: 4,
				bg_free_blocks_count: 60,
				bg_free_inodes_count: 16,
				bg_used_dirs_count: 0,
			}],
			0,
		)
	}

	#[test]
	fn allocate_then_find_then_remove() {
		let dev = RamDisk::new(512, 256);
		let sp = make_sp();
		let bgdt = make_bgdt();
		let mut i_block = [0u32; DIRECT_BLOCKS + 3];
		let mut scratch = LookupScratch::new();
		let mut size = 0u64;
		allocate(
			&dev, &sp, &bgdt, 0, &mut i_block, &mut scratch, 0, &mut size, true, b"foo", Some(FileType::Regular), 5,
		)
		.unwrap();
		assert_eq!(size, sp.block_size() as u64);
		allocate(
			&dev, &sp, &bgdt, 0, &mut i_block, &mut scratch, 0, &mut size, true, b"bar", Some(FileType::Directory), 6,
		)
		.unwrap();
		// Second entry reused slack in the first block; size shouldn't have grown again.
		assert_eq!(size, sp.block_size() as u64);

		let found = find(&dev, &sp, 0, &i_block, &mut scratch, true, size, b"bar").unwrap();
		assert_eq!(found, Some((6, Some(FileType::Directory))));

		let mut names = Vec::new();
		enumerate(&dev, &sp, 0, &i_block, &mut scratch, true, size, |ino, _, name| {
			names.push((ino, name.to_vec()));
			Ok(())
		})
		.unwrap();
		assert_eq!(names.len(), 2);

		assert!(remove(&dev, &sp, 0, &i_block, &mut scratch, true, size, b"foo").unwrap());
		let found = find(&dev, &sp, 0, &i_block, &mut scratch, true, size, b"foo").unwrap();
		assert!(found.is_none());
		let found = find(&dev, &sp, 0, &i_block, &mut scratch, true, size, b"bar").unwrap();
		assert_eq!(found, Some((6, Some(FileType::Directory))));
	}

	#[test]
	fn getdents64_skips_removed_entries() {
		let dev = RamDisk::new(512, 256);
		let sp = make_sp();
		let bgdt = make_bgdt();
		let mut i_block = [0u32; DIRECT_BLOCKS + 3];
		let mut scratch = LookupScratch::new();
		let mut size = 0u64;
		for (i, name) in [b"a".as_slice(), b"b", b"c"].iter().enumerate() {
			allocate(
				&dev,
				&sp,
				&bgdt,
				0,
				&mut i_block,
				&mut scratch,
				0,
				&mut size,
				true,
				name,
				Some(FileType::Regular),
				10 + i as u32,
			)
			.unwrap();
		}
		remove(&dev, &sp, 0, &i_block, &mut scratch, true, size, b"b").unwrap();

		let mut buf = [0u8; 4096];
		let (written, end_off) = getdents64(&dev, &sp, 0, &i_block, &mut scratch, true, size, 0, &mut buf).unwrap();
		assert_eq!(end_off, size);
		// Decode the names back out of the linux_dirent64 stream.
		let mut seen = Vec::new();
		let mut off = 0;
		while off < written {
			let reclen = u16::from_le_bytes(buf[off + 16..off + 18].try_into().unwrap()) as usize;
			let name_start = off + 19;
			let nul = buf[name_start..off + reclen].iter().position(|&b| b == 0).unwrap();
			seen.push(buf[name_start..name_start + nul].to_vec());
			off += reclen;
		}
		assert_eq!(seen, vec![b"a".to_vec(), b"c".to_vec()]);
	}

	#[test]
	fn round_trips_a_named_entry() {
		let mut buf = [0u8; 16];
		let ent = Dirent {
			inode: 5,
			rec_len: 16,
			file_type: Some(FileType::Regular),
			name: b"hello".to_vec(),
		};
		ent.encode(&mut buf, true);
		let back = Dirent::decode(&buf, true).unwrap();
		assert_eq!(back.inode, 5);
		assert_eq!(back.name.as_slice(), b"hello");
		assert_eq!(back.file_type, Some(FileType::Regular));
	}

	#[test]
	fn fill_free_covers_the_whole_block() {
		let mut buf = [0xffu8; 64];
		fill_free(&mut buf, true);
		let entries = iter_block(&buf, true).unwrap();
		let total: usize = entries.iter().map(|(_, e)| e.rec_len as usize).sum();
		assert_eq!(total, buf.len());
		assert!(entries.iter().all(|(_, e)| e.is_free()));
	}

	#[test]
	fn rejects_truncated_rec_len() {
		let mut buf = [0u8; 8];
		buf[4..6].copy_from_slice(&100u16.to_le_bytes());
		assert!(Dirent::decode(&buf, true).is_err());
	}
}
