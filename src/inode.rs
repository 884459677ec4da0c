//! The fixed-size on-disk inode record and the store that reads and writes it by inode number.
//!
//! Grounded on the teacher's `Ext2INode`/`INodeWrap` (`kernel/src/file/fs/ext2/inode.rs`) for the
//! read-modify-write-by-number shape, with the variable-length ext2 fields collapsed to the
//! original driver's flat 56-byte record (`original_source/simple.h`'s `struct simplefs_inode`).

use crate::block_device::{BlockDevice, BLOCK_SIZE};
use crate::buffer_cache::BufferCache;
use crate::codec::ByteOrder;
use crate::error::{Error, Result};
use crate::superblock::SuperblockManager;

/// The on-disk size of one inode record.
pub const INODE_SIZE: usize = 56;

const MODE_TYPE_MASK: u64 = 0o170000;
const MODE_DIR: u64 = 0o040000;
const MODE_REG: u64 = 0o100000;

/// The inode number of the root directory, fixed for every volume.
pub const ROOT_INODE_NO: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
	Regular,
	Directory,
}

/// A decoded inode record.
///
/// `size_or_children` backs both `file_size` (regular files) and `dir_children_count`
/// (directories); the original C driver unions the two, and since the two cases never overlap
/// for a single inode a single field plays the same role here.
#[derive(Debug, Clone)]
pub struct Inode {
	pub mode: u64,
	pub inode_no: u64,
	pub data_block_number: u64,
	pub c_time: u64,
	pub m_time: u64,
	pub indirect_block_number: u64,
	size_or_children: u64,
}

impl Inode {
	/// Builds a fresh inode with no data block allocated yet (`data_block_number == 0` is the
	/// unallocated sentinel, since block 0 always holds the superblock).
	pub fn new(inode_no: u64, inode_type: InodeType, permissions: u32, now: u64) -> Self {
		let type_bits = match inode_type {
			InodeType::Regular => MODE_REG,
			InodeType::Directory => MODE_DIR,
		};
		Self {
			mode: type_bits | (permissions as u64 & !MODE_TYPE_MASK),
			inode_no,
			data_block_number: 0,
			c_time: now,
			m_time: now,
			indirect_block_number: 0,
			size_or_children: 0,
		}
	}

	pub fn inode_type(&self) -> Result<InodeType> {
		match self.mode & MODE_TYPE_MASK {
			MODE_REG => Ok(InodeType::Regular),
			MODE_DIR => Ok(InodeType::Directory),
			_ => Err(Error::Invalid("unrecognized inode mode bits")),
		}
	}

	pub fn is_dir(&self) -> bool {
		self.mode & MODE_TYPE_MASK == MODE_DIR
	}

	/// The file's byte length. Only meaningful for regular files.
	pub fn file_size(&self) -> u64 {
		self.size_or_children
	}

	pub fn set_file_size(&mut self, size: u64) {
		self.size_or_children = size;
	}

	/// The number of directory entries stored under this inode. Only meaningful for directories.
	pub fn dir_children_count(&self) -> u64 {
		self.size_or_children
	}

	pub fn set_dir_children_count(&mut self, count: u64) {
		self.size_or_children = count;
	}

	pub fn encode(&self, bo: ByteOrder) -> [u8; INODE_SIZE] {
		let mut buf = [0u8; INODE_SIZE];
		buf[0..8].copy_from_slice(&bo.write_u64(self.mode));
		buf[8..16].copy_from_slice(&bo.write_u64(self.inode_no));
		buf[16..24].copy_from_slice(&bo.write_u64(self.data_block_number));
		buf[24..32].copy_from_slice(&bo.write_u64(self.c_time));
		buf[32..40].copy_from_slice(&bo.write_u64(self.m_time));
		buf[40..48].copy_from_slice(&bo.write_u64(self.indirect_block_number));
		buf[48..56].copy_from_slice(&bo.write_u64(self.size_or_children));
		buf
	}

	pub fn decode(buf: &[u8; INODE_SIZE], bo: ByteOrder) -> Result<Self> {
		let mode = bo.read_u64(buf[0..8].try_into().unwrap());
		let inode_no = bo.read_u64(buf[8..16].try_into().unwrap());
		if inode_no == 0 {
			return Err(Error::Invalid("inode number zero in a decoded record"));
		}
		let inode = Self {
			mode,
			inode_no,
			data_block_number: bo.read_u64(buf[16..24].try_into().unwrap()),
			c_time: bo.read_u64(buf[24..32].try_into().unwrap()),
			m_time: bo.read_u64(buf[32..40].try_into().unwrap()),
			indirect_block_number: bo.read_u64(buf[40..48].try_into().unwrap()),
			size_or_children: bo.read_u64(buf[48..56].try_into().unwrap()),
		};
		inode.inode_type()?;
		Ok(inode)
	}
}

/// Reads and writes fixed-size inode records packed into the inode-table region.
#[derive(Debug)]
pub struct InodeStore {
	inode_block_start: u64,
	inode_bitmap_start: u64,
	inodes_per_block: u64,
}

impl InodeStore {
	pub fn new(inode_block_start: u64, inode_bitmap_start: u64) -> Self {
		Self {
			inode_block_start,
			inode_bitmap_start,
			inodes_per_block: (BLOCK_SIZE / INODE_SIZE) as u64,
		}
	}

	fn locate(&self, inode_no: u64) -> Result<(u64, usize)> {
		if inode_no == 0 {
			return Err(Error::Invalid("inode number zero is not a valid inode"));
		}
		let record_index = inode_no - 1;
		let blk_no = self.inode_block_start + record_index / self.inodes_per_block;
		if blk_no >= self.inode_bitmap_start {
			return Err(Error::OutOfRange("inode number exceeds the inode table"));
		}
		let offset = (record_index % self.inodes_per_block) as usize * INODE_SIZE;
		Ok((blk_no, offset))
	}

	/// Reads the inode record for `inode_no`. Fails with [`Error::NotFound`] if the inode's bit is
	/// not set in the inode bitmap, even when `inode_no` falls within the table's span (e.g. a
	/// number that was never allocated).
	pub fn read(
		&self,
		dev: &mut BlockDevice,
		cache: &mut BufferCache,
		sb: &mut SuperblockManager,
		inode_no: u64,
		byte_order: ByteOrder,
	) -> Result<Inode> {
		let (blk_no, offset) = self.locate(inode_no)?;
		if !sb.is_inode_allocated(dev, cache, inode_no)? {
			return Err(Error::NotFound);
		}
		let handle = cache.get(dev, blk_no)?;
		let buf = handle.lock().unwrap();
		let record: [u8; INODE_SIZE] = buf.data()[offset..offset + INODE_SIZE].try_into().unwrap();
		Inode::decode(&record, byte_order)
	}

	pub fn write(
		&self,
		dev: &mut BlockDevice,
		cache: &mut BufferCache,
		inode: &Inode,
		byte_order: ByteOrder,
	) -> Result<()> {
		let (blk_no, offset) = self.locate(inode.inode_no)?;
		let handle = cache.get(dev, blk_no)?;
		{
			let mut buf = handle.lock().unwrap();
			buf.data_mut()[offset..offset + INODE_SIZE].copy_from_slice(&inode.encode(byte_order));
		}
		cache.mark_dirty(&handle);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encode_decode_round_trip() {
		let mut inode = Inode::new(2, InodeType::Regular, 0o644, 1_700_000_000);
		inode.data_block_number = 3;
		inode.set_file_size(40);
		let decoded = Inode::decode(&inode.encode(ByteOrder::Little), ByteOrder::Little).unwrap();
		assert_eq!(decoded.inode_no, 2);
		assert_eq!(decoded.data_block_number, 3);
		assert_eq!(decoded.file_size(), 40);
		assert_eq!(decoded.inode_type().unwrap(), InodeType::Regular);
	}

	#[test]
	fn directory_inode_tracks_children_count() {
		let mut inode = Inode::new(1, InodeType::Directory, 0o755, 0);
		inode.set_dir_children_count(1);
		assert_eq!(inode.dir_children_count(), 1);
		assert!(inode.is_dir());
	}

	#[test]
	fn decode_rejects_unknown_mode_bits() {
		let mut inode = Inode::new(1, InodeType::Regular, 0o644, 0);
		inode.mode = 0o020000; // character device; this format only knows regular files and directories
		let buf = inode.encode(ByteOrder::Little);
		assert!(matches!(Inode::decode(&buf, ByteOrder::Little), Err(Error::Invalid(_))));
	}

	#[test]
	fn store_round_trips_through_buffer_cache() {
		use crate::superblock::{Superblock, SuperblockManager};
		use tempfile::tempfile;
		let file = tempfile().unwrap();
		file.set_len(8 * BLOCK_SIZE as u64).unwrap();
		let mut dev = BlockDevice::new(file).unwrap();
		let mut cache = BufferCache::new();
		// max_inodes = 100 over an 8-block device lays the inode table at block 1 and the inode
		// bitmap at block 3, matching the `InodeStore::new(1, 3)` below.
		let sb = Superblock::new_layout(8, 100, ByteOrder::Little).unwrap();
		assert_eq!(sb.inode_block_start, 1);
		assert_eq!(sb.inode_bitmap_start, 3);
		let mut sb_mgr = SuperblockManager::new(sb);
		let store = InodeStore::new(1, 3);
		let inode_no = sb_mgr.allocate_inode_number(&mut dev, &mut cache).unwrap();
		let mut inode = Inode::new(inode_no, InodeType::Directory, 0o755, 42);
		inode.data_block_number = 5;
		store.write(&mut dev, &mut cache, &inode, ByteOrder::Little).unwrap();
		let read_back = store
			.read(&mut dev, &mut cache, &mut sb_mgr, inode_no, ByteOrder::Little)
			.unwrap();
		assert_eq!(read_back.data_block_number, 5);
		assert_eq!(read_back.c_time, 42);
	}

	#[test]
	fn read_rejects_an_inode_number_whose_bit_is_not_set() {
		use crate::superblock::{Superblock, SuperblockManager};
		use tempfile::tempfile;
		let file = tempfile().unwrap();
		file.set_len(8 * BLOCK_SIZE as u64).unwrap();
		let mut dev = BlockDevice::new(file).unwrap();
		let mut cache = BufferCache::new();
		let sb = Superblock::new_layout(8, 100, ByteOrder::Little).unwrap();
		let mut sb_mgr = SuperblockManager::new(sb);
		let store = InodeStore::new(1, 3);
		// Inode 2 is within the table's span but was never allocated.
		let err = store
			.read(&mut dev, &mut cache, &mut sb_mgr, 2, ByteOrder::Little)
			.unwrap_err();
		assert!(matches!(err, Error::NotFound));
	}

	#[test]
	fn locate_rejects_inode_zero() {
		let store = InodeStore::new(1, 3);
		assert!(matches!(store.locate(0), Err(Error::Invalid(_))));
	}
}
