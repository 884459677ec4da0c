//! The filesystem facade: `format`, `mount`, path lookup, and the read/write/create/mkdir/sync
//! operations built on top of the superblock, inode, block-mapping, and directory layers.
//!
//! Grounded on the teacher's `Ext2Fs`/`FilesystemOps` (`kernel/src/file/fs/ext2/mod.rs`) for the
//! lock-ordered, internally-synchronized facade shape, and on
//! `maestro-os-maestro-utils/mkfs/src/ext2.rs` plus `original_source/mkfs-simplefs.c` for what a
//! freshly formatted volume contains (a root directory holding one welcome file).

use crate::block_device::{BlockDevice, BLOCK_SIZE};
use crate::block_map::get_physical_block;
use crate::buffer_cache::BufferCache;
use crate::codec::ByteOrder;
use crate::dirent::{self, DirEntry};
use crate::error::{Error, Result};
use crate::inode::{Inode, InodeStore, InodeType, ROOT_INODE_NO};
use crate::superblock::{Superblock, SuperblockManager, SUPERBLOCK_BLOCK_NO};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// The name of the file `format` creates in the root directory of every fresh volume.
pub const WELCOME_FILE_NAME: &str = "vanakkam";
/// The contents of that file (`original_source/mkfs-simplefs.c`'s welcome message).
pub const WELCOME_FILE_BODY: &[u8] = b"Love is God. God is Love. Anbe Murugan.\n";

/// Policy knobs for [`Filesystem::format`], loadable from a TOML config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
	/// How many inodes the volume's inode table and inode bitmap are sized for.
	pub max_inodes: u64,
	/// Format with the superblock's low version bit cleared, selecting big-endian encoding for
	/// every other on-disk field.
	pub big_endian: bool,
}

impl Default for FormatOptions {
	fn default() -> Self {
		Self {
			max_inodes: 1024,
			big_endian: false,
		}
	}
}

/// Nanoseconds since the Unix epoch, the unit `Inode::c_time`/`m_time` are stored in.
fn now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_nanos() as u64)
		.unwrap_or(0)
}

/// A mounted SimpleFS volume.
///
/// Every operation is internally synchronized; callers do not need to serialize their own calls.
/// Locks are always acquired in the order `dir_update_lock` -> `inode_store_lock` -> the
/// superblock manager's own lock, so two facade operations can never deadlock against each other.
pub struct Filesystem {
	device: Mutex<BlockDevice>,
	cache: Mutex<BufferCache>,
	sb: Mutex<SuperblockManager>,
	inode_store: InodeStore,
	byte_order: ByteOrder,
	dir_update_lock: Mutex<()>,
	inode_store_lock: Mutex<()>,
}

impl Filesystem {
	/// Formats `path` as a fresh SimpleFS volume: writes the superblock, zeroes the metadata
	/// region, and populates the root directory with one welcome file.
	pub fn format(path: &Path, options: &FormatOptions) -> Result<()> {
		let file = OpenOptions::new().read(true).write(true).open(path)?;
		let nr_blocks = file.metadata()?.len() / BLOCK_SIZE as u64;
		let byte_order = if options.big_endian { ByteOrder::Big } else { ByteOrder::Little };
		let sb = Superblock::new_layout(nr_blocks, options.max_inodes, byte_order)?;
		info!(
			"formatting {} blocks, {} inodes, data region starts at block {}",
			nr_blocks, options.max_inodes, sb.data_block_start
		);

		let mut dev = BlockDevice::new(file)?;
		let mut cache = BufferCache::new();
		let zero = Box::new([0u8; BLOCK_SIZE]);
		for blk_no in 0..sb.data_block_start {
			dev.write_block(blk_no, &zero)?;
		}

		let inode_store = InodeStore::new(sb.inode_block_start, sb.inode_bitmap_start);
		let mut sb_mgr = SuperblockManager::new(sb);

		let root_no = sb_mgr.allocate_inode_number(&mut dev, &mut cache)?;
		debug_assert_eq!(root_no, ROOT_INODE_NO);
		let mut root = Inode::new(root_no, InodeType::Directory, 0o755, now());

		let welcome_no = sb_mgr.allocate_inode_number(&mut dev, &mut cache)?;
		let mut welcome = Inode::new(welcome_no, InodeType::Regular, 0o644, now());
		let data_block = sb_mgr.allocate_data_block(&mut dev, &mut cache, 1)?;
		welcome.data_block_number = data_block;
		welcome.set_file_size(WELCOME_FILE_BODY.len() as u64);
		let handle = cache.get(&mut dev, data_block)?;
		{
			let mut buf = handle.lock().unwrap();
			buf.data_mut().fill(0);
			buf.data_mut()[..WELCOME_FILE_BODY.len()].copy_from_slice(WELCOME_FILE_BODY);
		}
		cache.mark_dirty(&handle);
		inode_store.write(&mut dev, &mut cache, &welcome, byte_order)?;

		dirent::insert(&mut dev, &mut cache, &mut sb_mgr, &mut root, WELCOME_FILE_NAME, welcome_no, byte_order)?;
		inode_store.write(&mut dev, &mut cache, &root, byte_order)?;

		sb_mgr.sync_metadata(&mut dev, &mut cache)?;
		dev.sync()?;
		Ok(())
	}

	/// Mounts an already-formatted volume, determining its byte order from the superblock.
	pub fn mount(path: &Path) -> Result<Self> {
		let file = OpenOptions::new().read(true).write(true).open(path)?;
		let mut dev = BlockDevice::new(file)?;
		let sb_block = dev.read_block(SUPERBLOCK_BLOCK_NO)?;
		let sb = Superblock::decode(&sb_block)?;
		let byte_order = sb.byte_order;
		let inode_store = InodeStore::new(sb.inode_block_start, sb.inode_bitmap_start);
		Ok(Self {
			device: Mutex::new(dev),
			cache: Mutex::new(BufferCache::new()),
			sb: Mutex::new(SuperblockManager::new(sb)),
			inode_store,
			byte_order,
			dir_update_lock: Mutex::new(()),
			inode_store_lock: Mutex::new(()),
		})
	}

	/// Resolves a `/`-separated path (relative to the root directory) to an inode number.
	pub fn lookup_path(&self, path: &str) -> Result<u64> {
		let mut current = ROOT_INODE_NO;
		for component in path.split('/').filter(|c| !c.is_empty()) {
			let mut dev = self.device.lock().unwrap();
			let mut cache = self.cache.lock().unwrap();
			let mut sb = self.sb.lock().unwrap();
			let mut dir_inode = self.inode_store.read(&mut dev, &mut cache, &mut sb, current, self.byte_order)?;
			if !dir_inode.is_dir() {
				return Err(Error::NotFound);
			}
			let found = dirent::lookup(&mut dev, &mut cache, &mut sb, &mut dir_inode, component, self.byte_order)?;
			current = found.ok_or(Error::NotFound)?;
		}
		Ok(current)
	}

	/// Lists the entries of the directory at `inode_no`.
	pub fn readdir(&self, inode_no: u64) -> Result<Vec<DirEntry>> {
		let mut dev = self.device.lock().unwrap();
		let mut cache = self.cache.lock().unwrap();
		let mut sb = self.sb.lock().unwrap();
		let mut dir_inode = self.inode_store.read(&mut dev, &mut cache, &mut sb, inode_no, self.byte_order)?;
		if !dir_inode.is_dir() {
			return Err(Error::Invalid("not a directory"));
		}
		dirent::iterate(&mut dev, &mut cache, &mut sb, &mut dir_inode, self.byte_order)
	}

	/// Creates a regular file named `name` inside the directory at `parent_inode_no`.
	pub fn create(&self, parent_inode_no: u64, name: &str) -> Result<u64> {
		self.create_entry(parent_inode_no, name, InodeType::Regular, 0o644)
	}

	/// Creates a subdirectory named `name` inside the directory at `parent_inode_no`.
	pub fn mkdir(&self, parent_inode_no: u64, name: &str) -> Result<u64> {
		self.create_entry(parent_inode_no, name, InodeType::Directory, 0o755)
	}

	fn create_entry(&self, parent_inode_no: u64, name: &str, inode_type: InodeType, permissions: u32) -> Result<u64> {
		let _dir_guard = self.dir_update_lock.lock().unwrap();
		let _inode_guard = self.inode_store_lock.lock().unwrap();
		let mut dev = self.device.lock().unwrap();
		let mut cache = self.cache.lock().unwrap();
		let mut sb = self.sb.lock().unwrap();

		let mut parent = self.inode_store.read(&mut dev, &mut cache, &mut sb, parent_inode_no, self.byte_order)?;
		if !parent.is_dir() {
			return Err(Error::Invalid("parent is not a directory"));
		}
		if dirent::lookup(&mut dev, &mut cache, &mut sb, &mut parent, name, self.byte_order)?.is_some() {
			return Err(Error::AlreadyExists);
		}

		let new_no = sb.allocate_inode_number(&mut dev, &mut cache)?;
		let new_inode = Inode::new(new_no, inode_type, permissions, now());
		self.inode_store.write(&mut dev, &mut cache, &new_inode, self.byte_order)?;
		// `ParentLinked` is the point of no return: before it, any failure must undo the inode
		// number allocated above, since a local error return here must never leak it.
		if let Err(e) = dirent::insert(&mut dev, &mut cache, &mut sb, &mut parent, name, new_no, self.byte_order) {
			sb.free_inode_number(&mut dev, &mut cache, new_no)?;
			return Err(e);
		}
		self.inode_store.write(&mut dev, &mut cache, &parent, self.byte_order)?;
		Ok(new_no)
	}

	/// Reads up to `buf.len()` bytes from `inode_no` starting at `offset`, returning the number
	/// of bytes actually read. A read past a hole that was never written is zero-filled.
	pub fn read(&self, inode_no: u64, offset: u64, buf: &mut [u8]) -> Result<usize> {
		let mut dev = self.device.lock().unwrap();
		let mut cache = self.cache.lock().unwrap();
		let mut sb = self.sb.lock().unwrap();
		let mut inode = self.inode_store.read(&mut dev, &mut cache, &mut sb, inode_no, self.byte_order)?;
		if inode.is_dir() {
			return Err(Error::Invalid("cannot read a directory as a file"));
		}
		let file_size = inode.file_size();
		if offset >= file_size {
			return Ok(0);
		}
		let to_read = buf.len().min((file_size - offset) as usize);
		let mut done = 0usize;
		while done < to_read {
			let pos = offset + done as u64;
			let logical_index = pos / BLOCK_SIZE as u64;
			let block_offset = (pos % BLOCK_SIZE as u64) as usize;
			let chunk = (BLOCK_SIZE - block_offset).min(to_read - done);
			match get_physical_block(&mut dev, &mut cache, &mut sb, &mut inode, logical_index, false, self.byte_order)? {
				Some(block_no) => {
					let handle = cache.get(&mut dev, block_no)?;
					let block = handle.lock().unwrap();
					buf[done..done + chunk].copy_from_slice(&block.data()[block_offset..block_offset + chunk]);
				}
				None => buf[done..done + chunk].fill(0),
			}
			done += chunk;
		}
		Ok(done)
	}

	/// Writes `data` to `inode_no` starting at `offset`, extending the file and allocating
	/// blocks as needed. Returns the number of bytes written.
	pub fn write(&self, inode_no: u64, offset: u64, data: &[u8]) -> Result<usize> {
		let _inode_guard = self.inode_store_lock.lock().unwrap();
		let mut dev = self.device.lock().unwrap();
		let mut cache = self.cache.lock().unwrap();
		let mut sb = self.sb.lock().unwrap();
		let mut inode = self.inode_store.read(&mut dev, &mut cache, &mut sb, inode_no, self.byte_order)?;
		if inode.is_dir() {
			return Err(Error::Invalid("cannot write to a directory"));
		}
		let mut done = 0usize;
		while done < data.len() {
			let pos = offset + done as u64;
			let logical_index = pos / BLOCK_SIZE as u64;
			let block_offset = (pos % BLOCK_SIZE as u64) as usize;
			let chunk = (BLOCK_SIZE - block_offset).min(data.len() - done);
			let block_no = get_physical_block(&mut dev, &mut cache, &mut sb, &mut inode, logical_index, true, self.byte_order)?
				.expect("create=true always returns a block");
			let handle = cache.get(&mut dev, block_no)?;
			{
				let mut block = handle.lock().unwrap();
				block.data_mut()[block_offset..block_offset + chunk].copy_from_slice(&data[done..done + chunk]);
			}
			cache.mark_dirty(&handle);
			done += chunk;
		}
		let new_size = offset + done as u64;
		if new_size > inode.file_size() {
			inode.set_file_size(new_size);
		}
		inode.m_time = now();
		self.inode_store.write(&mut dev, &mut cache, &inode, self.byte_order)?;
		Ok(done)
	}

	/// Flushes every dirty buffer and the superblock to the backing device.
	pub fn sync(&self) -> Result<()> {
		let mut dev = self.device.lock().unwrap();
		let mut cache = self.cache.lock().unwrap();
		let mut sb = self.sb.lock().unwrap();
		sb.sync_metadata(&mut dev, &mut cache)?;
		cache.sync_all(&mut dev)?;
		dev.sync()?;
		Ok(())
	}

	/// Syncs and releases the volume.
	pub fn unmount(self) -> Result<()> {
		self.sync()
	}

}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::NamedTempFile;

	fn make_device(blocks: u64) -> NamedTempFile {
		let file = NamedTempFile::new().unwrap();
		file.as_file().set_len(blocks * BLOCK_SIZE as u64).unwrap();
		file
	}

	#[test]
	fn format_then_mount_round_trip() {
		let dev = make_device(256);
		Filesystem::format(dev.path(), &FormatOptions::default()).unwrap();
		let fs = Filesystem::mount(dev.path()).unwrap();
		let welcome_no = fs.lookup_path("vanakkam").unwrap();
		let mut buf = vec![0u8; WELCOME_FILE_BODY.len()];
		let n = fs.read(welcome_no, 0, &mut buf).unwrap();
		assert_eq!(n, WELCOME_FILE_BODY.len());
		assert_eq!(buf, WELCOME_FILE_BODY);
	}

	#[test]
	fn create_then_write_then_read() {
		let dev = make_device(256);
		Filesystem::format(dev.path(), &FormatOptions::default()).unwrap();
		let fs = Filesystem::mount(dev.path()).unwrap();
		let no = fs.create(ROOT_INODE_NO, "hello.txt").unwrap();
		fs.write(no, 0, b"hi there").unwrap();
		let mut buf = [0u8; 8];
		fs.read(no, 0, &mut buf).unwrap();
		assert_eq!(&buf, b"hi there");
	}

	#[test]
	fn mkdir_then_lookup_path() {
		let dev = make_device(256);
		Filesystem::format(dev.path(), &FormatOptions::default()).unwrap();
		let fs = Filesystem::mount(dev.path()).unwrap();
		fs.mkdir(ROOT_INODE_NO, "sub").unwrap();
		let sub_no = fs.lookup_path("sub").unwrap();
		let file_no = fs.create(sub_no, "inner.txt").unwrap();
		fs.write(file_no, 0, b"nested").unwrap();
		let resolved = fs.lookup_path("sub/inner.txt").unwrap();
		assert_eq!(resolved, file_no);
	}

	#[test]
	fn create_rejects_duplicate_name() {
		let dev = make_device(256);
		Filesystem::format(dev.path(), &FormatOptions::default()).unwrap();
		let fs = Filesystem::mount(dev.path()).unwrap();
		fs.create(ROOT_INODE_NO, "dup").unwrap();
		let err = fs.create(ROOT_INODE_NO, "dup").unwrap_err();
		assert!(matches!(err, Error::AlreadyExists));
	}

	#[test]
	fn persists_across_remount() {
		let dev = make_device(256);
		Filesystem::format(dev.path(), &FormatOptions::default()).unwrap();
		{
			let fs = Filesystem::mount(dev.path()).unwrap();
			let no = fs.create(ROOT_INODE_NO, "persist.txt").unwrap();
			fs.write(no, 0, b"still here").unwrap();
			fs.unmount().unwrap();
		}
		let fs = Filesystem::mount(dev.path()).unwrap();
		let no = fs.lookup_path("persist.txt").unwrap();
		let mut buf = [0u8; 10];
		fs.read(no, 0, &mut buf).unwrap();
		assert_eq!(&buf, b"still here");
	}

	#[test]
	fn big_endian_volume_round_trips() {
		let dev = make_device(256);
		let options = FormatOptions { big_endian: true, ..Default::default() };
		Filesystem::format(dev.path(), &options).unwrap();
		let fs = Filesystem::mount(dev.path()).unwrap();
		assert_eq!(fs.byte_order, ByteOrder::Big);
		let no = fs.lookup_path("vanakkam").unwrap();
		let mut buf = vec![0u8; WELCOME_FILE_BODY.len()];
		fs.read(no, 0, &mut buf).unwrap();
		assert_eq!(buf, WELCOME_FILE_BODY);
	}
}
