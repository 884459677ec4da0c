//! Translates a file-relative logical block index into a physical block number, allocating on
//! demand.
//!
//! Grounded on the teacher's `Ext2INode::translate_blk_off`/`alloc_content_blk`
//! (`kernel/src/file/fs/ext2/inode.rs`), collapsed from the teacher's four-level indirection
//! table to the single level of indirection `original_source/simple.h` actually implements:
//! logical block 0 lives at `inode.data_block_number`; every later block is a pointer slot in the
//! one indirect block at `inode.indirect_block_number`.

use crate::block_device::{BlockDevice, BLOCK_SIZE};
use crate::buffer_cache::BufferCache;
use crate::codec::ByteOrder;
use crate::error::{Error, Result};
use crate::inode::Inode;
use crate::superblock::SuperblockManager;

/// The number of block-pointer slots that fit in one indirect block.
pub const SLOTS_PER_INDIRECT_BLOCK: u64 = (BLOCK_SIZE / 8) as u64;

/// The largest logical block index a file may address (block 0 is direct, the rest are one
/// level of indirection deep).
pub const MAX_LOGICAL_BLOCK_INDEX: u64 = SLOTS_PER_INDIRECT_BLOCK;

fn read_slot(buf: &[u8; BLOCK_SIZE], slot: usize, bo: ByteOrder) -> u64 {
	let offset = slot * 8;
	bo.read_u64(buf[offset..offset + 8].try_into().unwrap())
}

fn write_slot(buf: &mut [u8; BLOCK_SIZE], slot: usize, value: u64, bo: ByteOrder) {
	let offset = slot * 8;
	buf[offset..offset + 8].copy_from_slice(&bo.write_u64(value));
}

/// Resolves `logical_index` (0 = the file's first block) to a physical block number.
///
/// With `create == false`, a hole (a block never written) resolves to `Ok(None)`. With
/// `create == true`, holes are filled by allocating a fresh block, so the return is always
/// `Ok(Some(_))` unless the device is out of space. Mutates `inode.data_block_number` and
/// `inode.indirect_block_number` in place when a new direct or indirect block is allocated;
/// the caller is responsible for persisting the inode afterwards.
pub fn get_physical_block(
	dev: &mut BlockDevice,
	cache: &mut BufferCache,
	sb: &mut SuperblockManager,
	inode: &mut Inode,
	logical_index: u64,
	create: bool,
	byte_order: ByteOrder,
) -> Result<Option<u64>> {
	if logical_index == 0 {
		if inode.data_block_number != 0 {
			return Ok(Some(inode.data_block_number));
		}
		if !create {
			return Ok(None);
		}
		let block_no = sb.allocate_data_block(dev, cache, 1)?;
		zero_block(dev, cache, block_no)?;
		inode.data_block_number = block_no;
		return Ok(Some(block_no));
	}

	let slot = (logical_index - 1) as usize;
	if slot as u64 >= SLOTS_PER_INDIRECT_BLOCK {
		return Err(Error::FileTooLarge);
	}

	if inode.indirect_block_number == 0 {
		if !create {
			return Ok(None);
		}
		let indirect_block_no = sb.allocate_data_block(dev, cache, 1)?;
		zero_block(dev, cache, indirect_block_no)?;
		inode.indirect_block_number = indirect_block_no;
	}

	let indirect_handle = cache.get(dev, inode.indirect_block_number)?;
	let existing = {
		let buf = indirect_handle.lock().unwrap();
		read_slot(buf.data(), slot, byte_order)
	};
	if existing != 0 {
		return Ok(Some(existing));
	}
	if !create {
		return Ok(None);
	}
	let block_no = sb.allocate_data_block(dev, cache, 1)?;
	zero_block(dev, cache, block_no)?;
	{
		let mut buf = indirect_handle.lock().unwrap();
		write_slot(buf.data_mut(), slot, block_no, byte_order);
	}
	cache.mark_dirty(&indirect_handle);
	Ok(Some(block_no))
}

fn zero_block(dev: &mut BlockDevice, cache: &mut BufferCache, block_no: u64) -> Result<()> {
	let handle = cache.get(dev, block_no)?;
	{
		let mut buf = handle.lock().unwrap();
		buf.data_mut().fill(0);
	}
	cache.mark_dirty(&handle);
	Ok(())
}
