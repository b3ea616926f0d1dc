//! The ext2 superblock: the filesystem's root metadata structure.
//!
//! The superblock is a fixed 1024-byte structure stored at byte offset 1024 of the partition
//! (sector 2, assuming 512-byte sectors). Unlike the teacher's `macros::AnyRepr` derive, which
//! reinterprets a `repr(C)` struct directly over a page of the block cache, this standalone
//! crate does not carry that proc-macro workspace member, so the superblock (and the block group
//! descriptor, and the inode record) are parsed field-by-field from little-endian bytes instead.
//! The on-disk layout is identical either way.

use crate::errno::{EResult, errno};
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering::Relaxed};

/// Size in bytes of the on-disk superblock structure.
pub const SUPERBLOCK_SIZE: usize = 1024;
/// Byte offset of the superblock within the partition.
pub const SUPERBLOCK_OFFSET: u64 = 1024;

/// The ext2 magic number (`s_magic`).
pub const EXT2_MAGIC: u16 = 0xef53;

/// `s_state`: the filesystem was cleanly unmounted.
pub const FS_STATE_CLEAN: u16 = 1;
/// `s_state`: the filesystem has errors.
pub const FS_STATE_ERROR: u16 = 2;

/// `s_errors`: ignore the error and continue.
pub const ERR_ACTION_IGNORE: u16 = 1;
/// `s_errors`: remount read-only.
pub const ERR_ACTION_READ_ONLY: u16 = 2;
/// `s_errors`: trigger a kernel panic.
pub const ERR_ACTION_KERNEL_PANIC: u16 = 3;

/// `s_feature_incompat`: the filesystem uses compression.
pub const REQUIRED_FEATURE_COMPRESSION: u32 = 0x1;
/// `s_feature_incompat`: directory entries carry a file-type byte.
pub const REQUIRED_FEATURE_FILETYPE: u32 = 0x2;
/// `s_feature_incompat`: the filesystem needs journal replay.
pub const REQUIRED_FEATURE_JOURNAL_REPLAY: u32 = 0x4;
/// `s_feature_incompat`: the filesystem is a journal device.
pub const REQUIRED_FEATURE_JOURNAL_DEVICE: u32 = 0x8;

/// `s_feature_ro_compat`: file sizes use the 64-bit `i_dir_acl` extension.
pub const RO_FEATURE_64BIT_FILE_SIZE: u32 = 0x2;

/// The root directory always has inode number 2.
pub const ROOT_INODE: u32 = 2;

/// The minimum supported inode size for revision-1 filesystems.
pub const MIN_INODE_SIZE: u16 = 128;

/// The in-memory representation of the ext2 superblock.
///
/// Counters that are updated by concurrent allocations/frees (free block/inode counts, mount
/// count, mount time) are atomics so that callers holding only a shared reference to the
/// [`Volume`](crate::volume::Volume) can still update them under the appropriate group lock,
/// matching §5's rule that the superblock's free counters are updated under the group lock that
/// caused the delta.
#[derive(Debug)]
pub struct Superblock {
	pub s_inodes_count: u32,
	pub s_blocks_count: u32,
	pub s_r_blocks_count: u32,
	pub s_free_blocks_count: AtomicU32,
	pub s_free_inodes_count: AtomicU32,
	pub s_first_data_block: u32,
	pub s_log_block_size: u32,
	pub s_log_frag_size: u32,
	pub s_blocks_per_group: u32,
	pub s_frags_per_group: u32,
	pub s_inodes_per_group: u32,
	pub s_mtime: AtomicU32,
	pub s_wtime: u32,
	pub s_mnt_count: AtomicU16,
	pub s_max_mnt_count: u16,
	pub s_magic: u16,
	pub s_state: u16,
	pub s_errors: u16,
	pub s_minor_rev_level: u16,
	pub s_lastcheck: u32,
	pub s_checkinterval: u32,
	pub s_creator_os: u32,
	pub s_rev_level: u32,
	pub s_def_resuid: u16,
	pub s_def_resgid: u16,

	// Extended superblock fields (revision >= 1 only).
	pub s_first_ino: u32,
	pub s_inode_size: u16,
	pub s_block_group_nr: u16,
	pub s_feature_compat: u32,
	pub s_feature_incompat: u32,
	pub s_feature_ro_compat: u32,
	pub s_uuid: [u8; 16],
	pub s_volume_name: [u8; 16],
	pub s_last_mounted: [u8; 64],
	pub s_algo_bitmap: u32,
	pub s_prealloc_blocks: u8,
	pub s_prealloc_dir_blocks: u8,
	pub s_journal_uuid: [u8; 16],
	pub s_journal_inum: u32,
	pub s_journal_dev: u32,
	pub s_last_orphan: u32,

	/// Bytes 236..1024: everything past `s_last_orphan` (hash-tree seed/version, default mount
	/// options, journal backup, the rest of the reserved padding). This crate never reads or
	/// mutates any of it, but `persist_superblock` writes the struct's full 1024 bytes straight
	/// back, so it has to round-trip unchanged rather than get zeroed on every flush.
	pub s_reserved: [u8; SUPERBLOCK_SIZE - 236],
}

impl Superblock {
	/// Parses a superblock from its on-disk little-endian representation.
	pub fn from_bytes(buf: &[u8; SUPERBLOCK_SIZE]) -> Self {
		let u32_at = |o: usize| u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
		let u16_at = |o: usize| u16::from_le_bytes(buf[o..o + 2].try_into().unwrap());
		let bytes_at = |o: usize, n: usize| -> &[u8] { &buf[o..o + n] };
		let mut uuid = [0u8; 16];
		uuid.copy_from_slice(bytes_at(104, 16));
		let mut volume_name = [0u8; 16];
		volume_name.copy_from_slice(bytes_at(120, 16));
		let mut last_mounted = [0u8; 64];
		last_mounted.copy_from_slice(bytes_at(136, 64));
		let mut journal_uuid = [0u8; 16];
		journal_uuid.copy_from_slice(bytes_at(208, 16));
		let mut reserved = [0u8; SUPERBLOCK_SIZE - 236];
		reserved.copy_from_slice(bytes_at(236, SUPERBLOCK_SIZE - 236));
		Self {
			s_inodes_count: u32_at(0),
			s_blocks_count: u32_at(4),
			s_r_blocks_count: u32_at(8),
			s_free_blocks_count: AtomicU32::new(u32_at(12)),
			s_free_inodes_count: AtomicU32::new(u32_at(16)),
			s_first_data_block: u32_at(20),
			s_log_block_size: u32_at(24),
			s_log_frag_size: u32_at(28),
			s_blocks_per_group: u32_at(32),
			s_frags_per_group: u32_at(36),
			s_inodes_per_group: u32_at(40),
			s_mtime: AtomicU32::new(u32_at(44)),
			s_wtime: u32_at(48),
			s_mnt_count: AtomicU16::new(u16_at(52)),
			s_max_mnt_count: u16_at(54),
			s_magic: u16_at(56),
			s_state: u16_at(58),
			s_errors: u16_at(60),
			s_minor_rev_level: u16_at(62),
			s_lastcheck: u32_at(64),
			s_checkinterval: u32_at(68),
			s_creator_os: u32_at(72),
			s_rev_level: u32_at(76),
			s_def_resuid: u16_at(80),
			s_def_resgid: u16_at(82),
			s_first_ino: u32_at(84),
			s_inode_size: u16_at(88),
			s_block_group_nr: u16_at(90),
			s_feature_compat: u32_at(92),
			s_feature_incompat: u32_at(96),
			s_feature_ro_compat: u32_at(100),
			s_uuid: uuid,
			s_volume_name: volume_name,
			s_last_mounted: last_mounted,
			s_algo_bitmap: u32_at(200),
			s_prealloc_blocks: buf[204],
			s_prealloc_dir_blocks: buf[205],
			s_journal_uuid: journal_uuid,
			s_journal_inum: u32_at(224),
			s_journal_dev: u32_at(228),
			s_last_orphan: u32_at(232),
			s_reserved: reserved,
		}
	}

	/// Serializes the superblock back to its on-disk little-endian representation.
	pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
		let mut buf = [0u8; SUPERBLOCK_SIZE];
		buf[0..4].copy_from_slice(&self.s_inodes_count.to_le_bytes());
		buf[4..8].copy_from_slice(&self.s_blocks_count.to_le_bytes());
		buf[8..12].copy_from_slice(&self.s_r_blocks_count.to_le_bytes());
		buf[12..16].copy_from_slice(&self.s_free_blocks_count.load(Relaxed).to_le_bytes());
		buf[16..20].copy_from_slice(&self.s_free_inodes_count.load(Relaxed).to_le_bytes());
		buf[20..24].copy_from_slice(&self.s_first_data_block.to_le_bytes());
		buf[24..28].copy_from_slice(&self.s_log_block_size.to_le_bytes());
		buf[28..32].copy_from_slice(&self.s_log_frag_size.to_le_bytes());
		buf[32..36].copy_from_slice(&self.s_blocks_per_group.to_le_bytes());
		buf[36..40].copy_from_slice(&self.s_frags_per_group.to_le_bytes());
		buf[40..44].copy_from_slice(&self.s_inodes_per_group.to_le_bytes());
		buf[44..48].copy_from_slice(&self.s_mtime.load(Relaxed).to_le_bytes());
		buf[48..52].copy_from_slice(&self.s_wtime.to_le_bytes());
		buf[52..54].copy_from_slice(&self.s_mnt_count.load(Relaxed).to_le_bytes());
		buf[54..56].copy_from_slice(&self.s_max_mnt_count.to_le_bytes());
		buf[56..58].copy_from_slice(&self.s_magic.to_le_bytes());
		buf[58..60].copy_from_slice(&self.s_state.to_le_bytes());
		buf[60..62].copy_from_slice(&self.s_errors.to_le_bytes());
		buf[62..64].copy_from_slice(&self.s_minor_rev_level.to_le_bytes());
		buf[64..68].copy_from_slice(&self.s_lastcheck.to_le_bytes());
		buf[68..72].copy_from_slice(&self.s_checkinterval.to_le_bytes());
		buf[72..76].copy_from_slice(&self.s_creator_os.to_le_bytes());
		buf[76..80].copy_from_slice(&self.s_rev_level.to_le_bytes());
		buf[80..82].copy_from_slice(&self.s_def_resuid.to_le_bytes());
		buf[82..84].copy_from_slice(&self.s_def_resgid.to_le_bytes());
		buf[84..88].copy_from_slice(&self.s_first_ino.to_le_bytes());
		buf[88..90].copy_from_slice(&self.s_inode_size.to_le_bytes());
		buf[90..92].copy_from_slice(&self.s_block_group_nr.to_le_bytes());
		buf[92..96].copy_from_slice(&self.s_feature_compat.to_le_bytes());
		buf[96..100].copy_from_slice(&self.s_feature_incompat.to_le_bytes());
		buf[100..104].copy_from_slice(&self.s_feature_ro_compat.to_le_bytes());
		buf[104..120].copy_from_slice(&self.s_uuid);
		buf[120..136].copy_from_slice(&self.s_volume_name);
		buf[136..200].copy_from_slice(&self.s_last_mounted);
		buf[200..204].copy_from_slice(&self.s_algo_bitmap.to_le_bytes());
		buf[204] = self.s_prealloc_blocks;
		buf[205] = self.s_prealloc_dir_blocks;
		buf[208..224].copy_from_slice(&self.s_journal_uuid);
		buf[224..228].copy_from_slice(&self.s_journal_inum.to_le_bytes());
		buf[228..232].copy_from_slice(&self.s_journal_dev.to_le_bytes());
		buf[232..236].copy_from_slice(&self.s_last_orphan.to_le_bytes());
		buf[236..].copy_from_slice(&self.s_reserved);
		buf
	}

	/// Returns the size of a block in bytes: `1024 << s_log_block_size`.
	pub fn block_size(&self) -> u32 {
		1024u32 << self.s_log_block_size
	}

	/// Returns the number of 32-bit block pointers that fit in one block.
	pub fn pointers_per_block(&self) -> u32 {
		self.block_size() / 4
	}

	/// Returns the number of block groups, derived independently from the block and inode
	/// counts; mount-time validation requires both derivations to agree (§3).
	pub fn block_groups_from_blocks(&self) -> u32 {
		self.s_blocks_count.div_ceil(self.s_blocks_per_group)
	}

	/// See [`Self::block_groups_from_blocks`].
	pub fn block_groups_from_inodes(&self) -> u32 {
		self.s_inodes_count.div_ceil(self.s_inodes_per_group)
	}

	/// Returns the size of an inode record in bytes, defaulting to 128 for revision 0.
	pub fn inode_size(&self) -> u16 {
		if self.s_rev_level >= 1 {
			self.s_inode_size
		} else {
			MIN_INODE_SIZE
		}
	}

	/// Validates every invariant spec.md §3 places on the superblock.
	///
	/// On success, returns the derived `(block_size, block_groups)` pair.
	pub fn validate(&self) -> EResult<(u32, u32)> {
		if self.s_magic != EXT2_MAGIC {
			return Err(errno!(EINVAL));
		}
		if self.s_rev_level < 1 {
			// Revision 0 is explicitly out of scope.
			return Err(errno!(ENOSYS));
		}
		let block_size = self.block_size();
		const SECTOR_SIZE: u32 = 512;
		if block_size % SECTOR_SIZE != 0 {
			return Err(errno!(EINVAL));
		}
		let groups_by_blocks = self.block_groups_from_blocks();
		let groups_by_inodes = self.block_groups_from_inodes();
		if groups_by_blocks != groups_by_inodes {
			return Err(errno!(EINVAL));
		}
		let unsupported = REQUIRED_FEATURE_COMPRESSION
			| REQUIRED_FEATURE_JOURNAL_REPLAY
			| REQUIRED_FEATURE_JOURNAL_DEVICE;
		if self.s_feature_incompat & unsupported != 0 {
			return Err(errno!(ENOSYS));
		}
		if self.s_feature_incompat & REQUIRED_FEATURE_FILETYPE != REQUIRED_FEATURE_FILETYPE {
			return Err(errno!(ENOSYS));
		}
		if !self.inode_size().is_power_of_two() || self.inode_size() < MIN_INODE_SIZE {
			return Err(errno!(EINVAL));
		}
		if self.s_state != FS_STATE_CLEAN {
			match self.s_errors {
				ERR_ACTION_KERNEL_PANIC => panic!("ext2: superblock reports uncorrected errors"),
				_ => return Err(errno!(EUCLEAN)),
			}
		}
		Ok((block_size, groups_by_blocks))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample() -> [u8; SUPERBLOCK_SIZE] {
		let mut buf = [0u8; SUPERBLOCK_SIZE];
		buf[0..4].copy_from_slice(&2000u32.to_le_bytes()); // s_inodes_count
		buf[4..8].copy_from_slice(&8192u32.to_le_bytes()); // s_blocks_count
		buf[32..36].copy_from_slice(&8192u32.to_le_bytes()); // s_blocks_per_group
		buf[40..44].copy_from_slice(&2000u32.to_le_bytes()); // s_inodes_per_group
		buf[56..58].copy_from_slice(&EXT2_MAGIC.to_le_bytes());
		buf[58..60].copy_from_slice(&FS_STATE_CLEAN.to_le_bytes());
		buf[76..80].copy_from_slice(&1u32.to_le_bytes()); // s_rev_level
		buf[88..90].copy_from_slice(&128u16.to_le_bytes()); // s_inode_size
		buf[96..100].copy_from_slice(&REQUIRED_FEATURE_FILETYPE.to_le_bytes());
		buf
	}

	#[test]
	fn parses_round_trip() {
		let raw = sample();
		let sp = Superblock::from_bytes(&raw);
		assert_eq!(sp.s_magic, EXT2_MAGIC);
		assert_eq!(sp.to_bytes(), raw);
	}

	/// A real `mke2fs` image populates the reserved tail past `s_last_orphan` (hash seed,
	/// default mount options, journal backup, ...); a flush must not wipe it.
	#[test]
	fn preserves_the_reserved_tail_on_round_trip() {
		let mut raw = sample();
		for (i, b) in raw[236..].iter_mut().enumerate() {
			*b = (i % 256) as u8;
		}
		let sp = Superblock::from_bytes(&raw);
		assert_eq!(sp.to_bytes(), raw);
	}

	#[test]
	fn validates_block_groups() {
		let sp = Superblock::from_bytes(&sample());
		let (block_size, groups) = sp.validate().unwrap();
		assert_eq!(block_size, 1024);
		assert_eq!(groups, 1);
	}

	#[test]
	fn rejects_bad_magic() {
		let mut raw = sample();
		raw[56..58].copy_from_slice(&0u16.to_le_bytes());
		let sp = Superblock::from_bytes(&raw);
		assert!(sp.validate().is_err());
	}

	#[test]
	fn rejects_journal_replay_feature() {
		let mut raw = sample();
		buf_set_feature(&mut raw, REQUIRED_FEATURE_FILETYPE | REQUIRED_FEATURE_JOURNAL_REPLAY);
		let sp = Superblock::from_bytes(&raw);
		assert!(sp.validate().is_err());
	}

	fn buf_set_feature(buf: &mut [u8; SUPERBLOCK_SIZE], feature: u32) {
		buf[96..100].copy_from_slice(&feature.to_le_bytes());
	}
}
