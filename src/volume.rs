//! The mounted volume: ties the superblock, BGDT, open-object table and underlying device
//! together into the single value a mount point owns.
//!
//! Grounded on the original controller's `Ext2FS` struct (`partition`, cached superblock, cached
//! BGDT) and its `ext2Init`/mount sequence: read the superblock, validate it, load the BGDT that
//! immediately follows it, and hand back a value every other operation in this crate borrows.

use crate::bgd::Bgdt;
use crate::device::{self, BlockDevice};
use crate::errno::EResult;
use crate::log::{Level, Log, log_at};
use crate::object::ObjectTable;
use crate::superblock::{self, Superblock};
use alloc::boxed::Box;
use core::fmt::Arguments;

/// Options a caller supplies to [`Volume::mount`].
#[derive(Default)]
pub struct MountOptions {
	/// Byte offset of the partition's first sector on `dev`. `0` for a device dedicated to a
	/// single filesystem.
	pub partition_base: u64,
	/// Optional diagnostic sink; see [`crate::log`].
	pub logger: Option<Box<dyn Log>>,
}

/// A mounted ext2 volume.
///
/// Every field a concurrent operation needs to touch is either an atomic (the superblock's free
/// counters), guarded by its own lock (the BGDT's per-group entries, the open-object table), or
/// immutable for the volume's lifetime (`dev`, `partition_base`, the rest of the superblock).
/// This lets every operation in [`crate::file`] and [`crate::path`] take `&Volume` rather than
/// `&mut Volume`, matching spec.md §5's requirement that unrelated descriptors never serialize on
/// a single volume-wide mutex.
pub struct Volume {
	pub(crate) dev: Box<dyn BlockDevice>,
	pub(crate) partition_base: u64,
	pub(crate) sp: Superblock,
	pub(crate) bgdt: Bgdt,
	pub(crate) objects: ObjectTable,
	logger: Option<Box<dyn Log>>,
}

impl Volume {
	/// Mounts `dev` as an ext2 volume: reads and validates the superblock, then loads the BGDT
	/// that follows it.
	pub fn mount(dev: Box<dyn BlockDevice>, opts: MountOptions) -> EResult<Self> {
		let mut raw = [0u8; superblock::SUPERBLOCK_SIZE];
		device::read_bytes(dev.as_ref(), opts.partition_base + superblock::SUPERBLOCK_OFFSET, &mut raw)?;
		let sp = Superblock::from_bytes(&raw);
		let (block_size, groups) = sp.validate()?;
		let superblock_block = (superblock::SUPERBLOCK_OFFSET / block_size as u64) as u32;
		let bgdt = Bgdt::load(dev.as_ref(), &sp, opts.partition_base, superblock_block)?;
		log_at!(
			&opts.logger,
			Level::Info,
			"ext2: mounted volume ({} block group(s), {} byte blocks)",
			groups,
			block_size
		);
		Ok(Self {
			dev,
			partition_base: opts.partition_base,
			sp,
			bgdt,
			objects: ObjectTable::new(),
			logger: opts.logger,
		})
	}

	/// Writes the in-memory superblock back to disk. Callers are responsible for calling this
	/// periodically (e.g. on `sync`) and at unmount; the driver does not run a background flusher
	/// of its own, matching spec.md §9's redesign away from an implicit kernel timer.
	pub fn persist_superblock(&self) -> EResult<()> {
		let raw = self.sp.to_bytes();
		device::write_bytes(self.dev.as_ref(), self.partition_base + superblock::SUPERBLOCK_OFFSET, &raw)
	}

	/// Writes the in-memory BGDT back to disk.
	pub fn persist_bgdt(&self) -> EResult<()> {
		self.bgdt.persist(self.dev.as_ref(), &self.sp, self.partition_base)
	}

	pub(crate) fn log(&self, level: Level, args: Arguments) {
		log_at!(&self.logger, level, "{}", args);
	}
}
