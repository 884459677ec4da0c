//! The error taxonomy shared by every layer of the filesystem.

use std::io;

/// An error produced by any operation on the filesystem.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// The backing store failed to read or write.
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),

	/// The superblock's magic or block size did not match what this driver expects.
	#[error("corrupt header: {0}")]
	CorruptHeader(&'static str),

	/// A block or inode number fell outside the bounds of its region.
	#[error("out of range: {0}")]
	OutOfRange(&'static str),

	/// A lookup found no matching entry, or an inode number is not allocated.
	#[error("not found")]
	NotFound,

	/// A bitmap allocator has no free bit left to give out.
	#[error("no space left on device")]
	NoSpace,

	/// A directory entry name exceeded `MAX_NAME_LEN` bytes.
	#[error("name too long")]
	NameTooLong,

	/// A file offset exceeded the capacity of one indirect block.
	#[error("file too large")]
	FileTooLarge,

	/// A structurally malformed value (zero inode number, unknown mode bits, ...).
	#[error("invalid: {0}")]
	Invalid(&'static str),

	/// A directory insertion targeted a name that already exists.
	#[error("already exists")]
	AlreadyExists,
}

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
