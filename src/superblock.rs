//! The on-disk superblock, the derived metadata region layout, and the manager that owns
//! the global inode/block counters and bitmap buffers.
//!
//! Grounded on the teacher's [`Superblock`] (`kernel/src/file/fs/ext2/mod.rs`) for the
//! read/validate shape, and on `Ext2Fs::{alloc_inode_impl, alloc_block, free_block, sync_fs}` for
//! the manager, with the per-block-group loop removed: SimpleFS has exactly one inode bitmap and
//! one block bitmap for the whole volume (no block groups).

use crate::bitmap;
use crate::block_device::{BlockDevice, BLOCK_SIZE};
use crate::buffer_cache::BufferCache;
use crate::codec::ByteOrder;
use crate::error::{Error, Result};
use crate::inode::INODE_SIZE;
use log::debug;

/// The filesystem's magic number (`original_source/simple.h`'s `SIMPLEFS_MAGIC`).
pub const MAGIC: u64 = 0x1003_2013;

/// The block number the superblock is always stored at.
pub const SUPERBLOCK_BLOCK_NO: u64 = 0;

const BITS_PER_BLOCK: u64 = (BLOCK_SIZE * 8) as u64;
const INODES_PER_BLOCK: u64 = (BLOCK_SIZE / INODE_SIZE) as u64;

/// Returns `ceil(count / per_block)`.
fn blocks_for(count: u64, per_block: u64) -> u64 {
	count.div_ceil(per_block)
}

/// The 4096-byte, endian-tagged superblock record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
	pub inodes_count: u64,
	pub free_blocks: u64,
	pub nr_blocks: u64,
	pub inode_block_start: u64,
	pub inode_bitmap_start: u64,
	pub block_bitmap_start: u64,
	pub data_block_start: u64,
	pub block_size: u32,
	pub byte_order: ByteOrder,
}

impl Superblock {
	/// Lays out a fresh superblock for a device with `nr_blocks` total blocks and an inode region
	/// sized for `max_inodes` inodes.
	pub fn new_layout(nr_blocks: u64, max_inodes: u64, byte_order: ByteOrder) -> Result<Self> {
		let inode_block_start = 1;
		let inode_region_blocks = blocks_for(max_inodes, INODES_PER_BLOCK).max(1);
		let inode_bitmap_start = inode_block_start + inode_region_blocks;
		let inode_bitmap_blocks = blocks_for(max_inodes, BITS_PER_BLOCK).max(1);
		let block_bitmap_start = inode_bitmap_start + inode_bitmap_blocks;
		// The block bitmap must cover every block on the device, including the metadata region
		// that precedes it, so its own size doesn't change how many bits it needs to cover.
		let block_bitmap_blocks = blocks_for(nr_blocks, BITS_PER_BLOCK).max(1);
		let data_block_start = block_bitmap_start + block_bitmap_blocks;
		if data_block_start >= nr_blocks {
			return Err(Error::NoSpace);
		}
		let sb = Self {
			inodes_count: 0,
			free_blocks: nr_blocks - data_block_start,
			nr_blocks,
			inode_block_start,
			inode_bitmap_start,
			block_bitmap_start,
			data_block_start,
			block_size: BLOCK_SIZE as u32,
			byte_order,
		};
		sb.check_invariants()?;
		Ok(sb)
	}

	fn check_invariants(&self) -> Result<()> {
		if !(self.inode_block_start < self.inode_bitmap_start
			&& self.inode_bitmap_start < self.block_bitmap_start
			&& self.block_bitmap_start < self.data_block_start
			&& self.data_block_start < self.nr_blocks)
		{
			return Err(Error::CorruptHeader("metadata region offsets are out of order"));
		}
		if self.free_blocks > self.nr_blocks - self.data_block_start {
			return Err(Error::CorruptHeader("free_blocks exceeds data region size"));
		}
		Ok(())
	}

	/// The number of blocks spanning the inode bitmap region.
	pub fn inode_bitmap_blocks(&self) -> u64 {
		self.block_bitmap_start - self.inode_bitmap_start
	}

	/// The number of blocks spanning the block bitmap region.
	pub fn block_bitmap_blocks(&self) -> u64 {
		self.data_block_start - self.block_bitmap_start
	}

	/// Decodes a superblock from its 4096-byte on-disk form.
	///
	/// The version field (bytes 68..72) is always stored little-endian, independent of the
	/// byte order it selects for every other field (`original_source/simple.h`: "Version always
	/// stored as Little Endian").
	pub fn decode(buf: &[u8; BLOCK_SIZE]) -> Result<Self> {
		let version = u32::from_le_bytes(buf[68..72].try_into().unwrap());
		let byte_order = ByteOrder::from_version_field(version);
		let read_u64 = |range: std::ops::Range<usize>| byte_order.read_u64(buf[range].try_into().unwrap());
		let magic = read_u64(0..8);
		if magic != MAGIC {
			return Err(Error::CorruptHeader("magic number mismatch"));
		}
		let inodes_count = read_u64(8..16);
		let free_blocks = read_u64(16..24);
		let nr_blocks = read_u64(24..32);
		let inode_block_start = read_u64(32..40);
		let inode_bitmap_start = read_u64(40..48);
		let block_bitmap_start = read_u64(48..56);
		let data_block_start = read_u64(56..64);
		let block_size = byte_order.read_u32(buf[64..68].try_into().unwrap());
		if block_size != BLOCK_SIZE as u32 {
			return Err(Error::CorruptHeader("block size must be 4096"));
		}
		let sb = Self {
			inodes_count,
			free_blocks,
			nr_blocks,
			inode_block_start,
			inode_bitmap_start,
			block_bitmap_start,
			data_block_start,
			block_size,
			byte_order,
		};
		sb.check_invariants()?;
		Ok(sb)
	}

	/// Encodes the superblock into its 4096-byte on-disk form, zero-padded after byte 72.
	pub fn encode(&self) -> Box<[u8; BLOCK_SIZE]> {
		let bo = self.byte_order;
		let mut buf = Box::new([0u8; BLOCK_SIZE]);
		buf[0..8].copy_from_slice(&bo.write_u64(MAGIC));
		buf[8..16].copy_from_slice(&bo.write_u64(self.inodes_count));
		buf[16..24].copy_from_slice(&bo.write_u64(self.free_blocks));
		buf[24..32].copy_from_slice(&bo.write_u64(self.nr_blocks));
		buf[32..40].copy_from_slice(&bo.write_u64(self.inode_block_start));
		buf[40..48].copy_from_slice(&bo.write_u64(self.inode_bitmap_start));
		buf[48..56].copy_from_slice(&bo.write_u64(self.block_bitmap_start));
		buf[56..64].copy_from_slice(&bo.write_u64(self.data_block_start));
		buf[64..68].copy_from_slice(&bo.write_u32(self.block_size));
		buf[68..72].copy_from_slice(&bo.to_version_field().to_le_bytes());
		buf
	}
}

/// Owns the in-memory superblock and serializes every mutation of its global counters and
/// bitmap buffers.
///
/// Lock discipline (see spec §5): callers take `sb_lock` last, after `dir_update_lock` and
/// `inode_store_lock`; in this crate that ordering is enforced by [`crate::fs::Filesystem`],
/// which only ever calls into this manager from inside its own `sb` mutex guard.
#[derive(Debug)]
pub struct SuperblockManager {
	sb: Superblock,
	sb_dirty: bool,
	/// Where the next `allocate_data_block` scan resumes, so repeated single-block allocations
	/// don't re-scan already-full regions of the bitmap from the start every time.
	block_scan_cursor: u64,
}

impl SuperblockManager {
	pub fn new(sb: Superblock) -> Self {
		let block_scan_cursor = sb.block_bitmap_start;
		Self {
			sb,
			sb_dirty: false,
			block_scan_cursor,
		}
	}

	pub fn superblock(&self) -> &Superblock {
		&self.sb
	}

	/// Scans the inode bitmap for a free bit, sets it, and returns the 1-indexed inode number.
	pub fn allocate_inode_number(
		&mut self,
		dev: &mut BlockDevice,
		cache: &mut BufferCache,
	) -> Result<u64> {
		for blk_no in self.sb.inode_bitmap_start..self.sb.block_bitmap_start {
			let handle = cache.get(dev, blk_no)?;
			let found = {
				let mut buf = handle.lock().unwrap();
				bitmap::alloc_first_free(buf.data_mut(), BLOCK_SIZE)
			};
			if let Some(local_bit) = found {
				cache.mark_dirty(&handle);
				self.sb.inodes_count += 1;
				self.sb_dirty = true;
				let global_bit = (blk_no - self.sb.inode_bitmap_start) * BITS_PER_BLOCK + local_bit;
				return Ok(global_bit + 1);
			}
		}
		Err(Error::NoSpace)
	}

	/// Allocates `n_blocks` data blocks one at a time, returning the first one's block number.
	///
	/// On failure after a partial success, every bit set so far is rolled back in reverse order
	/// and the block bitmap (and `free_blocks`) end up exactly as they started.
	pub fn allocate_data_block(
		&mut self,
		dev: &mut BlockDevice,
		cache: &mut BufferCache,
		n_blocks: u64,
	) -> Result<u64> {
		let mut allocated = Vec::with_capacity(n_blocks as usize);
		for _ in 0..n_blocks {
			match self.allocate_one_block(dev, cache) {
				Ok(block_no) => allocated.push(block_no),
				Err(e) => {
					debug!(
						"allocate_data_block: rolling back {} of {} blocks after failure",
						allocated.len(),
						n_blocks
					);
					for block_no in allocated.into_iter().rev() {
						self.free_data_block(dev, cache, block_no)
							.expect("rollback of a block we just allocated cannot fail");
					}
					return Err(e);
				}
			}
		}
		Ok(allocated[0])
	}

	fn allocate_one_block(&mut self, dev: &mut BlockDevice, cache: &mut BufferCache) -> Result<u64> {
		if self.sb.free_blocks == 0 {
			return Err(Error::NoSpace);
		}
		let start = self.sb.block_bitmap_start;
		let end = self.sb.data_block_start;
		let first_try = self.block_scan_cursor.clamp(start, end.max(start + 1));
		let order = (first_try..end).chain(start..first_try);
		for blk_no in order {
			let handle = cache.get(dev, blk_no)?;
			let found = {
				let mut buf = handle.lock().unwrap();
				bitmap::alloc_first_free(buf.data_mut(), BLOCK_SIZE)
			};
			if let Some(local_bit) = found {
				cache.mark_dirty(&handle);
				self.block_scan_cursor = blk_no;
				self.sb.free_blocks -= 1;
				self.sb_dirty = true;
				let bit_index = (blk_no - start) * BITS_PER_BLOCK + local_bit;
				return Ok(self.sb.data_block_start + bit_index);
			}
		}
		Err(Error::NoSpace)
	}

	/// Clears the bit for `block_no` in the block bitmap, incrementing `free_blocks`.
	pub fn free_data_block(
		&mut self,
		dev: &mut BlockDevice,
		cache: &mut BufferCache,
		block_no: u64,
	) -> Result<()> {
		if block_no < self.sb.data_block_start || block_no >= self.sb.nr_blocks {
			return Err(Error::OutOfRange("block number outside the data region"));
		}
		let bit_index = block_no - self.sb.data_block_start;
		let blk_no = self.sb.block_bitmap_start + bit_index / BITS_PER_BLOCK;
		let local_bit = bit_index % BITS_PER_BLOCK;
		let handle = cache.get(dev, blk_no)?;
		let was_set = {
			let mut buf = handle.lock().unwrap();
			bitmap::free(buf.data_mut(), BLOCK_SIZE, local_bit)
		};
		if !was_set {
			return Err(Error::Invalid("freeing a block that was already free"));
		}
		cache.mark_dirty(&handle);
		self.sb.free_blocks += 1;
		self.sb_dirty = true;
		Ok(())
	}

	/// Clears the bit for `inode_no` in the inode bitmap, decrementing `inodes_count`.
	///
	/// Symmetric to [`Self::free_data_block`]; used to undo a just-allocated inode number when a
	/// later step of the same local operation fails, so a local error return never leaks an
	/// inode the caller never got to use.
	pub fn free_inode_number(
		&mut self,
		dev: &mut BlockDevice,
		cache: &mut BufferCache,
		inode_no: u64,
	) -> Result<()> {
		if inode_no == 0 {
			return Err(Error::Invalid("inode number zero is not a valid inode"));
		}
		let global_bit = inode_no - 1;
		let blk_no = self.sb.inode_bitmap_start + global_bit / BITS_PER_BLOCK;
		if blk_no >= self.sb.block_bitmap_start {
			return Err(Error::OutOfRange("inode number exceeds the inode bitmap"));
		}
		let local_bit = global_bit % BITS_PER_BLOCK;
		let handle = cache.get(dev, blk_no)?;
		let was_set = {
			let mut buf = handle.lock().unwrap();
			bitmap::free(buf.data_mut(), BLOCK_SIZE, local_bit)
		};
		if !was_set {
			return Err(Error::Invalid("freeing an inode number that was already free"));
		}
		cache.mark_dirty(&handle);
		self.sb.inodes_count -= 1;
		self.sb_dirty = true;
		Ok(())
	}

	/// Returns whether `inode_no`'s bit is set in the inode bitmap, i.e. whether it currently
	/// names an allocated inode.
	pub fn is_inode_allocated(
		&self,
		dev: &mut BlockDevice,
		cache: &mut BufferCache,
		inode_no: u64,
	) -> Result<bool> {
		if inode_no == 0 {
			return Ok(false);
		}
		let global_bit = inode_no - 1;
		let blk_no = self.sb.inode_bitmap_start + global_bit / BITS_PER_BLOCK;
		if blk_no >= self.sb.block_bitmap_start {
			return Ok(false);
		}
		let local_bit = (global_bit % BITS_PER_BLOCK) as usize;
		let byte_index = local_bit / 8;
		let bit_in_byte = local_bit % 8;
		let handle = cache.get(dev, blk_no)?;
		let buf = handle.lock().unwrap();
		Ok(buf.data()[byte_index] & (1 << bit_in_byte) != 0)
	}

	/// Writes back every dirty inode-table, inode-bitmap, and block-bitmap buffer, then the
	/// superblock block itself, in that order — so a crash never leaves `inodes_count`
	/// referencing inode-table bytes that were never written.
	pub fn sync_metadata(&mut self, dev: &mut BlockDevice, cache: &mut BufferCache) -> Result<()> {
		for blk_no in self.sb.inode_block_start..self.sb.inode_bitmap_start {
			cache.sync_one(dev, blk_no)?;
		}
		for blk_no in self.sb.inode_bitmap_start..self.sb.block_bitmap_start {
			cache.sync_one(dev, blk_no)?;
		}
		for blk_no in self.sb.block_bitmap_start..self.sb.data_block_start {
			cache.sync_one(dev, blk_no)?;
		}
		if self.sb_dirty {
			let handle = cache.get(dev, SUPERBLOCK_BLOCK_NO)?;
			handle.lock().unwrap().data_mut().copy_from_slice(self.sb.encode().as_slice());
			cache.mark_dirty(&handle);
			cache.sync_one(dev, SUPERBLOCK_BLOCK_NO)?;
			self.sb_dirty = false;
		}
		Ok(())
	}
}
