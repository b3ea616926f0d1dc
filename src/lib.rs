/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! An ext2-compatible, read/write filesystem driver meant to be embedded in a freestanding
//! kernel.
//!
//! The driver speaks ext2 revision 1 with the `FILETYPE` feature only: volumes created by
//! conventional tooling (`mke2fs`, `e2fsprogs`) mount and round-trip correctly. It does not
//! implement journaling, compression, extended attributes, quotas, or ACLs beyond mode bits.
//!
//! The crate is split the way the on-disk format itself is layered:
//! - [`device`] is the sector-granular byte interface to the block device underneath.
//! - [`superblock`] and [`bgd`] load, validate and persist the superblock and block group
//!   descriptor table.
//! - [`bitmap`] allocates and frees blocks and inodes from the per-group bitmaps.
//! - [`inode`] fetches, modifies and deletes inode records.
//! - [`block_chain`] walks an inode's direct/indirect pointers to resolve file-relative block
//!   indices to absolute block numbers, allocating on write.
//! - [`object`] and [`cache`] deduplicate open handles to a single inode and cache recently read
//!   block runs.
//! - [`dirent`] parses and emits directory records.
//! - [`file`] is the block-aligned read/write/seek/mmap engine.
//! - [`path`] resolves paths, including symlinks, and dispatches `open`/`stat`/`link`/`delete`.
//! - [`volume`] ties all of the above into the [`Volume`](volume::Volume) a mount point owns.

#![cfg_attr(not(test), no_std)]
#![feature(negative_impls)]
#![allow(clippy::too_many_arguments)]

extern crate alloc;

pub mod errno;
pub mod sync;

pub mod bgd;
pub mod bitmap;
pub mod block_chain;
pub mod cache;
pub mod device;
pub mod dirent;
pub mod file;
pub mod inode;
pub mod log;
pub mod object;
pub mod path;
pub mod superblock;
pub mod volume;

pub use device::BlockDevice;
pub use errno::{EResult, Errno};
pub use file::{FileHandle, OpenFlags, Seek};
pub use volume::{MountOptions, Volume};
