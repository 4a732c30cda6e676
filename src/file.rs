// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of Parity.

// Parity is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Parity is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Parity.  If not, see <http://www.gnu.org/licenses/>.

use std::path::Path;
use std::sync::Arc;

use fs2::FileExt as _;
use parking_lot::{Mutex, MutexGuard};

use crate::error::{Error, Result};

/// Buffered appends are pushed to the kernel once this many dirty bytes
/// accumulate, matching the erase block size of common SSDs.
const FLUSH_BLOCK_BYTES: usize = 512 << 10;

#[cfg(unix)]
fn read_file_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> Result<()> {
	use std::os::unix::fs::FileExt;
	Ok(file.read_exact_at(buf, offset)?)
}

#[cfg(unix)]
fn write_file_at(file: &std::fs::File, buf: &[u8], offset: u64) -> Result<()> {
	use std::os::unix::fs::FileExt;
	Ok(file.write_all_at(buf, offset)?)
}

#[cfg(windows)]
fn read_file_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> Result<()> {
	use std::os::windows::fs::FileExt;
	file.seek_read(buf, offset)?;
	Ok(())
}

#[cfg(windows)]
fn write_file_at(file: &std::fs::File, buf: &[u8], offset: u64) -> Result<()> {
	use std::os::windows::fs::FileExt;
	file.seek_write(buf, offset)?;
	Ok(())
}

#[cfg(target_os = "macos")]
fn disable_read_ahead(file: &std::fs::File) -> Result<()> {
	use std::os::unix::io::AsRawFd;
	if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_RDAHEAD, 0) } != 0 {
		Err(std::io::Error::last_os_error())?
	} else {
		Ok(())
	}
}

#[cfg(target_os = "linux")]
fn disable_read_ahead(file: &std::fs::File) -> Result<()> {
	use std::os::unix::io::AsRawFd;
	let err = unsafe {
		libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_RANDOM)
	};
	if err != 0 {
		Err(std::io::Error::from_raw_os_error(err))?
	} else {
		Ok(())
	}
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn disable_read_ahead(_file: &std::fs::File) -> Result<()> {
	Ok(())
}

/// An immutable segment file, safe for concurrent reads.
pub enum ReadonlyFile {
	Posix { file: std::fs::File, len: u64 },
	Mapped { map: memmap2::Mmap },
}

impl ReadonlyFile {
	/// Opens with pread access and read-ahead disabled.
	pub fn open(path: &Path) -> Result<ReadonlyFile> {
		let file = std::fs::OpenOptions::new().read(true).open(path)?;
		disable_read_ahead(&file)?;
		let len = file.metadata()?.len();
		Ok(ReadonlyFile::Posix { file, len })
	}

	/// Opens memory-mapped; preferred for files replayed front to back.
	pub fn open_mapped(path: &Path) -> Result<ReadonlyFile> {
		let file = std::fs::OpenOptions::new().read(true).open(path)?;
		let len = file.metadata()?.len();
		if len == 0 {
			// Zero-length files cannot be mapped.
			return Ok(ReadonlyFile::Posix { file, len });
		}
		let map = unsafe { memmap2::Mmap::map(&file)? };
		Ok(ReadonlyFile::Mapped { map })
	}

	pub fn size(&self) -> u64 {
		match self {
			ReadonlyFile::Posix { len, .. } => *len,
			ReadonlyFile::Mapped { map } => map.len() as u64,
		}
	}

	/// Reads at most `buf.len()` bytes at `offset`, returning the number of
	/// bytes actually read. Short reads happen only at the end of the file.
	pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
		let size = self.size();
		if offset >= size {
			return Ok(0);
		}
		let n = buf.len().min((size - offset) as usize);
		match self {
			ReadonlyFile::Posix { file, .. } => read_file_at(file, &mut buf[..n], offset)?,
			ReadonlyFile::Mapped { map } => {
				buf[..n].copy_from_slice(&map[offset as usize..offset as usize + n])
			}
		}
		Ok(n)
	}
}

// Fixed staging area for the buffered backing. Writes only touch regions
// reserved under the writer lock; bytes below the committed write index
// are never modified again, so concurrent reads of committed regions are
// race free.
struct StagingBuf {
	ptr: *mut u8,
	len: usize,
}

unsafe impl Send for StagingBuf {}
unsafe impl Sync for StagingBuf {}

impl StagingBuf {
	fn new(len: usize) -> StagingBuf {
		let buf = vec![0u8; len].into_boxed_slice();
		StagingBuf { ptr: Box::into_raw(buf) as *mut u8, len }
	}
}

impl Drop for StagingBuf {
	fn drop(&mut self) {
		unsafe {
			drop(Box::from_raw(std::slice::from_raw_parts_mut(self.ptr, self.len) as *mut [u8]));
		}
	}
}

enum Backing {
	/// mmap over the preallocated file; writes land in the page cache,
	/// sync is msync.
	Mapped(memmap2::MmapRaw),
	/// In-memory staging buffer; dirty bytes reach the kernel with pwrite
	/// on flush.
	Buffered(StagingBuf),
}

impl Backing {
	fn base(&self) -> *mut u8 {
		match self {
			Backing::Mapped(map) => map.as_mut_ptr(),
			Backing::Buffered(buf) => buf.ptr,
		}
	}
}

struct Writer {
	write_index: usize,
	flush_offset: usize,
	/// Set on rotation; a sealed file rejects all further allocations.
	sealed: bool,
}

/// The active segment's data file: a file preallocated to the segment
/// ceiling, append-only through `Appender`, concurrently readable at
/// committed offsets.
pub struct ReadWriteFile {
	file: std::fs::File,
	capacity: usize,
	backing: Backing,
	writer: Mutex<Writer>,
}

impl ReadWriteFile {
	pub fn open(path: &Path, capacity: u64, backing: crate::options::IoBacking) -> Result<ReadWriteFile> {
		let file = std::fs::OpenOptions::new().read(true).write(true).create(true).open(path)?;
		let len = file.metadata()?.len();
		if len == 0 {
			file.allocate(capacity)?;
			file.set_len(capacity)?;
		} else if len != capacity {
			return Err(Error::Corruption(format!(
				"unexpected size {} of data file {:?}, expected {}",
				len,
				path,
				capacity
			)));
		}
		let capacity = capacity as usize;
		let backing = match backing {
			crate::options::IoBacking::Mapped => {
				Backing::Mapped(memmap2::MmapRaw::map_raw(&file)?)
			}
			crate::options::IoBacking::Buffered => {
				let staging = StagingBuf::new(capacity);
				let buf = unsafe { std::slice::from_raw_parts_mut(staging.ptr, capacity) };
				read_file_at(&file, buf, 0)?;
				Backing::Buffered(staging)
			}
		};
		Ok(ReadWriteFile {
			file,
			capacity,
			backing,
			writer: Mutex::new(Writer { write_index: 0, flush_offset: 0, sealed: false }),
		})
	}

	pub fn size(&self) -> u64 {
		self.capacity as u64
	}

	/// Locks the writer. Serializes allocation and flushing; readers are
	/// not blocked.
	pub fn appender(&self) -> Appender<'_> {
		Appender { file: self, writer: self.writer.lock() }
	}

	/// Positions the writer over recovered content. The bytes below
	/// `offset` are already on disk.
	pub fn set_write_offset(&self, offset: usize) {
		let mut writer = self.writer.lock();
		writer.write_index = offset;
		writer.flush_offset = offset;
	}

	/// Marks the file sealed so late writers holding a stale handle fail
	/// their allocation and re-resolve the active segment.
	pub fn seal(&self) -> Result<()> {
		let mut writer = self.writer.lock();
		let flushed = self.flush_locked(&mut writer, true);
		writer.sealed = true;
		flushed
	}

	pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
		if offset >= self.capacity as u64 {
			return Ok(0);
		}
		let n = buf.len().min(self.capacity - offset as usize);
		// Committed regions are immutable and in-flight writes only touch
		// regions no reader has been handed a location for.
		unsafe {
			std::ptr::copy_nonoverlapping(
				self.backing.base().add(offset as usize),
				buf.as_mut_ptr(),
				n,
			);
		}
		Ok(n)
	}

	fn flush_locked(&self, writer: &mut Writer, force: bool) -> Result<()> {
		match &self.backing {
			// Mapped pages are already kernel-owned.
			Backing::Mapped(_) => Ok(()),
			Backing::Buffered(staging) => {
				let dirty = writer.write_index - writer.flush_offset;
				if dirty == 0 || (!force && dirty < FLUSH_BLOCK_BYTES) {
					return Ok(());
				}
				let buf = unsafe {
					std::slice::from_raw_parts(staging.ptr.add(writer.flush_offset), dirty)
				};
				write_file_at(&self.file, buf, writer.flush_offset as u64)?;
				writer.flush_offset = writer.write_index;
				Ok(())
			}
		}
	}

	pub fn flush(&self, force: bool) -> Result<()> {
		let mut writer = self.writer.lock();
		self.flush_locked(&mut writer, force)
	}

	/// Forces the file content to stable storage.
	pub fn sync(&self) -> Result<()> {
		self.flush(true)?;
		match &self.backing {
			Backing::Mapped(map) => Ok(map.flush()?),
			Backing::Buffered(_) => Ok(self.file.sync_data()?),
		}
	}
}

pub struct Appender<'a> {
	file: &'a ReadWriteFile,
	writer: MutexGuard<'a, Writer>,
}

impl<'a> Appender<'a> {
	/// Atomically reserves `len` bytes, serializes into them through
	/// `fill` and best-effort flushes. Returns the record offset, or
	/// `None` when the file is sealed or cannot hold `len` more bytes.
	pub fn append<F: FnOnce(&mut [u8])>(&mut self, len: usize, fill: F) -> Result<Option<u32>> {
		if self.writer.sealed || len > self.file.capacity - self.writer.write_index {
			return Ok(None);
		}
		let offset = self.writer.write_index;
		self.writer.write_index += len;
		// Exclusive access: the region was reserved under the writer lock.
		let buf = unsafe {
			std::slice::from_raw_parts_mut(self.file.backing.base().add(offset), len)
		};
		fill(buf);
		self.file.flush_locked(&mut self.writer, false)?;
		Ok(Some(offset as u32))
	}
}

/// A handle on one segment's data file: either the active read-write file
/// or a sealed read-only one.
#[derive(Clone)]
pub enum DataFile {
	Active(Arc<ReadWriteFile>),
	Sealed(Arc<ReadonlyFile>),
}

impl DataFile {
	pub fn size(&self) -> u64 {
		match self {
			DataFile::Active(file) => file.size(),
			DataFile::Sealed(file) => file.size(),
		}
	}

	pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
		match self {
			DataFile::Active(file) => file.read(offset, buf),
			DataFile::Sealed(file) => file.read(offset, buf),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::options::IoBacking;

	struct TempDir(std::path::PathBuf);

	impl TempDir {
		fn new(name: &'static str) -> TempDir {
			env_logger::try_init().ok();
			let mut path = std::env::temp_dir();
			path.push("cask-db-test");
			path.push("file");
			path.push(name);

			if path.exists() {
				std::fs::remove_dir_all(&path).unwrap();
			}
			std::fs::create_dir_all(&path).unwrap();
			TempDir(path)
		}

		fn file(&self, name: &str) -> std::path::PathBuf {
			self.0.join(name)
		}
	}

	impl Drop for TempDir {
		fn drop(&mut self) {
			if self.0.exists() {
				std::fs::remove_dir_all(&self.0).unwrap();
			}
		}
	}

	fn append_read_roundtrip(backing: IoBacking) {
		let dir = TempDir::new(match backing {
			IoBacking::Mapped => "roundtrip_mapped",
			IoBacking::Buffered => "roundtrip_buffered",
		});
		let file = ReadWriteFile::open(&dir.file("1.data"), 4096, backing).unwrap();

		let mut appender = file.appender();
		let a = appender.append(5, |buf| buf.copy_from_slice(b"hello")).unwrap().unwrap();
		let b = appender.append(5, |buf| buf.copy_from_slice(b"world")).unwrap().unwrap();
		drop(appender);

		assert_eq!(a, 0);
		assert_eq!(b, 5);

		let mut buf = [0u8; 10];
		assert_eq!(file.read(0, &mut buf).unwrap(), 10);
		assert_eq!(&buf, b"helloworld");
	}

	#[test]
	fn roundtrip_mapped() {
		append_read_roundtrip(IoBacking::Mapped);
	}

	#[test]
	fn roundtrip_buffered() {
		append_read_roundtrip(IoBacking::Buffered);
	}

	#[test]
	fn overflow_returns_none() {
		let dir = TempDir::new("overflow");
		let file = ReadWriteFile::open(&dir.file("1.data"), 64, IoBacking::Buffered).unwrap();
		let mut appender = file.appender();
		assert!(appender.append(64, |buf| buf.fill(1)).unwrap().is_some());
		assert!(appender.append(1, |buf| buf.fill(2)).unwrap().is_none());
	}

	#[test]
	fn sealed_rejects_appends() {
		let dir = TempDir::new("sealed");
		let file = ReadWriteFile::open(&dir.file("1.data"), 4096, IoBacking::Mapped).unwrap();
		file.seal().unwrap();
		let mut appender = file.appender();
		assert!(appender.append(1, |buf| buf.fill(0)).unwrap().is_none());
	}

	#[test]
	fn persisted_after_sync() {
		let dir = TempDir::new("persisted");
		let path = dir.file("1.data");
		{
			let file = ReadWriteFile::open(&path, 4096, IoBacking::Buffered).unwrap();
			file.appender().append(4, |buf| buf.copy_from_slice(b"data")).unwrap().unwrap();
			file.sync().unwrap();
		}
		let file = ReadonlyFile::open(&path).unwrap();
		assert_eq!(file.size(), 4096);
		let mut buf = [0u8; 4];
		assert_eq!(file.read(0, &mut buf).unwrap(), 4);
		assert_eq!(&buf, b"data");
	}

	#[test]
	fn wrong_size_is_corruption() {
		let dir = TempDir::new("wrong_size");
		let path = dir.file("1.data");
		std::fs::write(&path, b"short").unwrap();
		assert!(matches!(
			ReadWriteFile::open(&path, 4096, IoBacking::Mapped),
			Err(Error::Corruption(_))
		));
	}

	#[test]
	fn readonly_short_read_at_eof() {
		let dir = TempDir::new("short_read");
		let path = dir.file("1.data");
		std::fs::write(&path, b"0123456789").unwrap();
		for file in [ReadonlyFile::open(&path).unwrap(), ReadonlyFile::open_mapped(&path).unwrap()] {
			let mut buf = [0u8; 8];
			assert_eq!(file.read(6, &mut buf).unwrap(), 4);
			assert_eq!(&buf[..4], b"6789");
			assert_eq!(file.read(100, &mut buf).unwrap(), 0);
		}
	}
}
