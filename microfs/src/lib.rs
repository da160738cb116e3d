//! A small filesystem for block-addressed flash.
//!
//! The crate targets memories where a write may only clear bits and a whole
//! block must be erased to set them again. All device traffic goes through a
//! write-back block cache, so higher layers read and modify bytes while the
//! device only ever sees whole-block erase and program cycles.
//!
//! Layout: one superblock, an allocation bitmap for the data area, a fixed
//! inode table, then data blocks. Files carry up to [`ATTR_MAX`] bytes of
//! opaque attribute data in their inode for callers to use as they see fit.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod bitmap;
mod block_dev;
mod cache;
mod error;
mod fs;
mod layout;
mod vfs;

pub use block_dev::{BlockDevice, DeviceError, DeviceResult};
pub use error::{FsError, FsResult};
pub use fs::{FileSystem, FsStats};
pub use layout::{InodeKind, ATTR_MAX, DIRENT_SIZE, NAME_MAX};
pub use vfs::Inode;
