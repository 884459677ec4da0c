//! Typed, block-granular I/O over a seekable byte-addressed backing store.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

/// The size, in bytes, of a single block.
///
/// The on-disk format fixes this at 4096; the superblock records it anyway so a
/// mismatch is detected rather than assumed.
pub const BLOCK_SIZE: usize = 4096;

/// A seekable, block-addressed backing store.
///
/// Reads return an owned block-sized buffer; writes go through the caller (normally the
/// buffer cache, see [`crate::buffer_cache`]) rather than hitting the device directly on every
/// mutation.
#[derive(Debug)]
pub struct BlockDevice {
	file: File,
	nr_blocks: u64,
}

impl BlockDevice {
	/// Wraps an already-open file, computing the device's size in blocks.
	///
	/// The file's length must be a multiple of [`BLOCK_SIZE`]; any remainder is ignored (it is
	/// not addressable).
	pub fn new(file: File) -> Result<Self> {
		let len = file.metadata()?.len();
		Ok(Self {
			file,
			nr_blocks: len / BLOCK_SIZE as u64,
		})
	}

	/// Returns the number of addressable blocks on the device.
	pub fn size_in_blocks(&self) -> u64 {
		self.nr_blocks
	}

	fn check_range(&self, n: u64) -> Result<()> {
		if n >= self.nr_blocks {
			return Err(Error::OutOfRange("block number exceeds device size"));
		}
		Ok(())
	}

	/// Reads the block at index `n`, returning an owned, [`BLOCK_SIZE`]-byte buffer.
	pub fn read_block(&mut self, n: u64) -> Result<Box<[u8; BLOCK_SIZE]>> {
		self.check_range(n)?;
		let mut buf = Box::new([0u8; BLOCK_SIZE]);
		self.file.seek(SeekFrom::Start(n * BLOCK_SIZE as u64))?;
		self.file.read_exact(buf.as_mut_slice())?;
		Ok(buf)
	}

	/// Writes a full block at index `n`.
	pub fn write_block(&mut self, n: u64, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
		self.check_range(n)?;
		self.file.seek(SeekFrom::Start(n * BLOCK_SIZE as u64))?;
		self.file.write_all(buf)?;
		Ok(())
	}

	/// Flushes the underlying file to the host OS.
	///
	/// The core makes no stronger durability assumption than "block-sized writes are not
	/// torn"; whether `sync` reaches the physical medium is the host's contract, not ours.
	pub fn sync(&mut self) -> Result<()> {
		self.file.sync_data()?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempfile;

	fn dev_with_blocks(n: u64) -> BlockDevice {
		let file = tempfile().unwrap();
		file.set_len(n * BLOCK_SIZE as u64).unwrap();
		BlockDevice::new(file).unwrap()
	}

	#[test]
	fn read_write_round_trip() {
		let mut dev = dev_with_blocks(4);
		let mut buf = Box::new([0u8; BLOCK_SIZE]);
		buf[0] = 0xab;
		buf[BLOCK_SIZE - 1] = 0xcd;
		dev.write_block(2, &buf).unwrap();
		let read_back = dev.read_block(2).unwrap();
		assert_eq!(*read_back, *buf);
	}

	#[test]
	fn out_of_range_read_fails() {
		let mut dev = dev_with_blocks(2);
		assert!(matches!(dev.read_block(2), Err(Error::OutOfRange(_))));
	}

	#[test]
	fn out_of_range_write_fails() {
		let mut dev = dev_with_blocks(2);
		let buf = Box::new([0u8; BLOCK_SIZE]);
		assert!(matches!(dev.write_block(5, &buf), Err(Error::OutOfRange(_))));
	}
}
