//! SimpleFS: a small block-addressed filesystem, its on-disk layout, metadata engine, and
//! allocator.
//!
//! Grounded throughout on the teacher's ext2 driver (`kernel/src/file/fs/ext2/`), generalized
//! from ext2's multi-block-group, four-level-indirection layout down to the single-region,
//! single-level-indirection layout the original SimpleFS driver implements
//! (`original_source/simple.h`, `original_source/mkfs-simplefs.c`).

pub mod bitmap;
pub mod block_device;
pub mod block_map;
pub mod buffer_cache;
pub mod codec;
pub mod dirent;
pub mod error;
pub mod fs;
pub mod inode;
pub mod superblock;

pub use block_device::{BlockDevice, BLOCK_SIZE};
pub use codec::ByteOrder;
pub use dirent::DirEntry;
pub use error::{Error, Result};
pub use fs::{FormatOptions, Filesystem};
pub use inode::{Inode, InodeType, ROOT_INODE_NO};
