//! Maps block numbers to cached, reference-counted buffers with a dirty flag.
//!
//! Reworked from the teacher's page-backed `RcFrame`/`BufferCache` pair (see
//! `kernel/src/file/fs/ext2/mod.rs`'s `read_block`): no page-cache coupling, just an explicit
//! map of block-sized byte buffers addressed by block number. Buffers are `Arc<Mutex<_>>` rather
//! than `Rc<RefCell<_>>` so a handle obtained under one lock can still be touched from another
//! thread, per the concurrency model in which the engine is internally synchronized.

use crate::block_device::{BlockDevice, BLOCK_SIZE};
use crate::error::Result;
use log::trace;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A cached block buffer.
#[derive(Debug)]
pub struct Buffer {
	block_no: u64,
	data: [u8; BLOCK_SIZE],
	dirty: bool,
}

impl Buffer {
	/// The block number this buffer caches.
	pub fn block_no(&self) -> u64 {
		self.block_no
	}

	/// Borrows the buffer's bytes.
	pub fn data(&self) -> &[u8; BLOCK_SIZE] {
		&self.data
	}

	/// Mutably borrows the buffer's bytes. Does not implicitly mark the buffer dirty; callers
	/// must call [`BufferCache::mark_dirty`] once they are done mutating.
	pub fn data_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
		&mut self.data
	}
}

/// A reference-counted handle to a cached buffer.
pub type BufferHandle = Arc<Mutex<Buffer>>;

/// The buffer cache. Owns no device of its own; every operation that may need to fault in a
/// block is passed the [`BlockDevice`] explicitly, so the cache can be shared without owning the
/// device's lifetime.
#[derive(Debug, Default)]
pub struct BufferCache {
	entries: HashMap<u64, BufferHandle>,
}

impl BufferCache {
	/// Creates an empty cache.
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns a shared handle to the block's buffer, reading it from `dev` on first access.
	pub fn get(&mut self, dev: &mut BlockDevice, block_no: u64) -> Result<BufferHandle> {
		if let Some(buf) = self.entries.get(&block_no) {
			return Ok(buf.clone());
		}
		trace!("buffer cache miss for block {block_no}, reading from device");
		let data = dev.read_block(block_no)?;
		let buf = Arc::new(Mutex::new(Buffer {
			block_no,
			data: *data,
			dirty: false,
		}));
		self.entries.insert(block_no, buf.clone());
		Ok(buf)
	}

	/// Flips a buffer's dirty flag. Takes the handle rather than a block number since callers
	/// already hold one after a `get`.
	pub fn mark_dirty(&self, handle: &BufferHandle) {
		handle.lock().unwrap().dirty = true;
	}

	/// Writes a single block back to the device if dirty, clearing the dirty flag.
	pub fn sync_one(&mut self, dev: &mut BlockDevice, block_no: u64) -> Result<()> {
		let Some(buf) = self.entries.get(&block_no) else {
			return Ok(());
		};
		let mut buf = buf.lock().unwrap();
		if buf.dirty {
			dev.write_block(buf.block_no, &buf.data)?;
			buf.dirty = false;
		}
		Ok(())
	}

	/// Writes back every dirty buffer in the cache, in ascending block-number order so a crash
	/// mid-sync never reorders writes against the metadata-region ordering callers rely on.
	pub fn sync_all(&mut self, dev: &mut BlockDevice) -> Result<()> {
		let mut block_nos: Vec<u64> = self.entries.keys().copied().collect();
		block_nos.sort_unstable();
		for block_no in block_nos {
			self.sync_one(dev, block_no)?;
		}
		Ok(())
	}

	/// Discards a cached buffer without writing it back, used after rolling back a partially
	/// failed allocation.
	pub fn forget(&mut self, block_no: u64) {
		self.entries.remove(&block_no);
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
	fn repeated_get_shares_buffer() {
		let mut dev = dev_with_blocks(2);
		let mut cache = BufferCache::new();
		let a = cache.get(&mut dev, 0).unwrap();
		let b = cache.get(&mut dev, 0).unwrap();
		assert!(Arc::ptr_eq(&a, &b));
	}

	#[test]
	fn sync_one_writes_back_dirty_only() {
		let mut dev = dev_with_blocks(2);
		let mut cache = BufferCache::new();
		let buf = cache.get(&mut dev, 1).unwrap();
		buf.lock().unwrap().data_mut()[0] = 42;
		cache.mark_dirty(&buf);
		cache.sync_one(&mut dev, 1).unwrap();
		assert!(!buf.lock().unwrap().dirty);
		let reread = dev.read_block(1).unwrap();
		assert_eq!(reread[0], 42);
	}

	#[test]
	fn forget_discards_without_writing() {
		let mut dev = dev_with_blocks(2);
		let mut cache = BufferCache::new();
		let buf = cache.get(&mut dev, 0).unwrap();
		buf.lock().unwrap().data_mut()[0] = 7;
		cache.mark_dirty(&buf);
		cache.forget(0);
		cache.sync_one(&mut dev, 0).unwrap();
		let reread = dev.read_block(0).unwrap();
		assert_eq!(reread[0], 0);
	}
}
