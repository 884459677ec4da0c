//! Variable-length directory records and the directory engine that packs, scans, and searches
//! them across a directory inode's data blocks.
//!
//! Grounded on the teacher's unsized `Dirent` (`kernel/src/file/fs/ext2/dirent.rs`) for the
//! scan-until-sentinel shape, with the teacher's internal padding/alignment dropped in favor of
//! the original driver's flat, unpadded record (`original_source/simple.h`'s
//! `struct simplefs_dir_record`): an 8-byte inode number, a 1-byte name length, then the name
//! bytes with nothing in between entries.

use crate::block_device::{BlockDevice, BLOCK_SIZE};
use crate::block_map::{get_physical_block, MAX_LOGICAL_BLOCK_INDEX};
use crate::buffer_cache::BufferCache;
use crate::codec::ByteOrder;
use crate::error::{Error, Result};
use crate::inode::Inode;
use crate::superblock::SuperblockManager;

/// The longest name a directory record can hold.
pub const MAX_NAME_LEN: usize = 255;

const RECORD_HEADER_LEN: usize = 9;

/// One decoded directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
	pub inode_no: u64,
	pub name: String,
}

impl DirEntry {
	fn encoded_len(&self) -> usize {
		RECORD_HEADER_LEN + self.name.len()
	}

	fn encode(&self, bo: ByteOrder) -> Vec<u8> {
		let mut out = Vec::with_capacity(self.encoded_len());
		out.extend_from_slice(&bo.write_u64(self.inode_no));
		out.push(self.name.len() as u8);
		out.extend_from_slice(self.name.as_bytes());
		out
	}
}

/// Reads entries out of a single block's worth of packed directory records, stopping at the
/// first zero inode number (the sentinel left by a zero-filled block).
fn scan_block(buf: &[u8; BLOCK_SIZE], bo: ByteOrder) -> Vec<(DirEntry, usize)> {
	let mut entries = Vec::new();
	let mut cursor = 0usize;
	while cursor + RECORD_HEADER_LEN <= BLOCK_SIZE {
		let inode_no = bo.read_u64(buf[cursor..cursor + 8].try_into().unwrap());
		if inode_no == 0 {
			break;
		}
		let name_len = buf[cursor + 8] as usize;
		let name_start = cursor + RECORD_HEADER_LEN;
		if name_start + name_len > BLOCK_SIZE {
			break;
		}
		let name = String::from_utf8_lossy(&buf[name_start..name_start + name_len]).into_owned();
		entries.push((DirEntry { inode_no, name }, cursor));
		cursor = name_start + name_len;
	}
	entries
}

/// Looks up `name` among `dir_inode`'s entries, scanning every allocated block in order.
pub fn lookup(
	dev: &mut BlockDevice,
	cache: &mut BufferCache,
	sb: &mut SuperblockManager,
	dir_inode: &mut Inode,
	name: &str,
	byte_order: ByteOrder,
) -> Result<Option<u64>> {
	for logical_index in 0..=MAX_LOGICAL_BLOCK_INDEX {
		let Some(block_no) = get_physical_block(dev, cache, sb, dir_inode, logical_index, false, byte_order)? else {
			break;
		};
		let handle = cache.get(dev, block_no)?;
		let buf = handle.lock().unwrap();
		for (entry, _) in scan_block(buf.data(), byte_order) {
			if entry.name == name {
				return Ok(Some(entry.inode_no));
			}
		}
	}
	Ok(None)
}

/// Collects every entry stored under `dir_inode`, in on-disk order.
pub fn iterate(
	dev: &mut BlockDevice,
	cache: &mut BufferCache,
	sb: &mut SuperblockManager,
	dir_inode: &mut Inode,
	byte_order: ByteOrder,
) -> Result<Vec<DirEntry>> {
	let mut out = Vec::new();
	for logical_index in 0..=MAX_LOGICAL_BLOCK_INDEX {
		let Some(block_no) = get_physical_block(dev, cache, sb, dir_inode, logical_index, false, byte_order)? else {
			break;
		};
		let handle = cache.get(dev, block_no)?;
		let buf = handle.lock().unwrap();
		out.extend(scan_block(buf.data(), byte_order).into_iter().map(|(e, _)| e));
	}
	Ok(out)
}

/// Inserts a new `(name, inode_no)` record into `dir_inode`, allocating a new block if every
/// existing one is full. Rejects a name already present with [`Error::AlreadyExists`].
///
/// Bumps `dir_inode`'s `dir_children_count`; the caller is responsible for persisting the inode
/// afterwards, the same contract [`get_physical_block`] uses for `data_block_number`.
pub fn insert(
	dev: &mut BlockDevice,
	cache: &mut BufferCache,
	sb: &mut SuperblockManager,
	dir_inode: &mut Inode,
	name: &str,
	inode_no: u64,
	byte_order: ByteOrder,
) -> Result<()> {
	if name.is_empty() || name.len() > MAX_NAME_LEN {
		return Err(Error::NameTooLong);
	}
	let record = DirEntry { inode_no, name: name.to_string() };
	let needed = record.encoded_len();

	let mut first_unallocated = None;
	for logical_index in 0..=MAX_LOGICAL_BLOCK_INDEX {
		let block_no = match get_physical_block(dev, cache, sb, dir_inode, logical_index, false, byte_order)? {
			Some(block_no) => block_no,
			None => {
				first_unallocated = Some(logical_index);
				break;
			}
		};
		let handle = cache.get(dev, block_no)?;
		let (end_of_entries, has_room) = {
			let buf = handle.lock().unwrap();
			let entries = scan_block(buf.data(), byte_order);
			if entries.iter().any(|(e, _)| e.name == name) {
				return Err(Error::AlreadyExists);
			}
			let end = entries
				.last()
				.map(|(e, off)| off + e.encoded_len())
				.unwrap_or(0);
			(end, end + needed <= BLOCK_SIZE)
		};
		if has_room {
			let mut buf = handle.lock().unwrap();
			let bytes = record.encode(byte_order);
			buf.data_mut()[end_of_entries..end_of_entries + bytes.len()].copy_from_slice(&bytes);
			drop(buf);
			cache.mark_dirty(&handle);
			dir_inode.set_dir_children_count(dir_inode.dir_children_count() + 1);
			return Ok(());
		}
	}

	let logical_index = first_unallocated.ok_or(Error::FileTooLarge)?;
	let block_no = get_physical_block(dev, cache, sb, dir_inode, logical_index, true, byte_order)?
		.expect("create=true always returns a block");
	let handle = cache.get(dev, block_no)?;
	let bytes = record.encode(byte_order);
	{
		let mut buf = handle.lock().unwrap();
		buf.data_mut()[0..bytes.len()].copy_from_slice(&bytes);
	}
	cache.mark_dirty(&handle);
	dir_inode.set_dir_children_count(dir_inode.dir_children_count() + 1);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::inode::InodeType;
	use crate::superblock::Superblock;
	use tempfile::tempfile;

	fn setup(nr_blocks: u64) -> (BlockDevice, BufferCache, SuperblockManager, Inode) {
		let file = tempfile().unwrap();
		file.set_len(nr_blocks * BLOCK_SIZE as u64).unwrap();
		let dev = BlockDevice::new(file).unwrap();
		let sb = Superblock::new_layout(nr_blocks, 16, ByteOrder::Little).unwrap();
		let dir_inode = Inode::new(1, InodeType::Directory, 0o755, 0);
		(dev, BufferCache::new(), SuperblockManager::new(sb), dir_inode)
	}

	#[test]
	fn insert_then_lookup_round_trip() {
		let (mut dev, mut cache, mut sb, mut dir) = setup(64);
		insert(&mut dev, &mut cache, &mut sb, &mut dir, "vanakkam", 2, ByteOrder::Little).unwrap();
		assert_eq!(dir.dir_children_count(), 1);
		let found = lookup(&mut dev, &mut cache, &mut sb, &mut dir, "vanakkam", ByteOrder::Little).unwrap();
		assert_eq!(found, Some(2));
		let missing = lookup(&mut dev, &mut cache, &mut sb, &mut dir, "nope", ByteOrder::Little).unwrap();
		assert_eq!(missing, None);
	}

	#[test]
	fn insert_rejects_duplicate_name() {
		let (mut dev, mut cache, mut sb, mut dir) = setup(64);
		insert(&mut dev, &mut cache, &mut sb, &mut dir, "a", 2, ByteOrder::Little).unwrap();
		let err = insert(&mut dev, &mut cache, &mut sb, &mut dir, "a", 3, ByteOrder::Little).unwrap_err();
		assert!(matches!(err, Error::AlreadyExists));
	}

	#[test]
	fn insert_rejects_name_too_long() {
		let (mut dev, mut cache, mut sb, mut dir) = setup(64);
		let name = "x".repeat(MAX_NAME_LEN + 1);
		let err = insert(&mut dev, &mut cache, &mut sb, &mut dir, &name, 2, ByteOrder::Little).unwrap_err();
		assert!(matches!(err, Error::NameTooLong));
	}

	#[test]
	fn insertion_order_is_preserved_on_iterate() {
		let (mut dev, mut cache, mut sb, mut dir) = setup(64);
		for (i, name) in ["a", "b", "c"].iter().enumerate() {
			insert(&mut dev, &mut cache, &mut sb, &mut dir, name, (i + 2) as u64, ByteOrder::Little).unwrap();
		}
		let entries = iterate(&mut dev, &mut cache, &mut sb, &mut dir, ByteOrder::Little).unwrap();
		let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
		assert_eq!(names, vec!["a", "b", "c"]);
	}

	#[test]
	fn insert_spills_into_a_second_block_when_full() {
		let (mut dev, mut cache, mut sb, mut dir) = setup(600);
		// Each record here is 9 + 3 = 12 bytes; force enough of them to overflow one 4096-byte block.
		let n = BLOCK_SIZE / 12 + 1;
		for i in 0..n {
			let name = format!("{:03}", i);
			insert(&mut dev, &mut cache, &mut sb, &mut dir, &name, (i + 2) as u64, ByteOrder::Little).unwrap();
		}
		assert_ne!(dir.indirect_block_number, 0);
		let entries = iterate(&mut dev, &mut cache, &mut sb, &mut dir, ByteOrder::Little).unwrap();
		assert_eq!(entries.len(), n);
	}
}
