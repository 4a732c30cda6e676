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

// The file manager owns the single active segment and the pool of open
// read-only segment files. Exactly one segment accepts appends at any
// time; rotation seals it, schedules its fsync and index write-out in the
// background and installs a fresh preallocated data file under the next
// id.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{
	cache::LruCache,
	display::hex,
	error::{Error, Result},
	file::{DataFile, ReadWriteFile, ReadonlyFile},
	index::IndexRecord,
	iterator::RecordIterator,
	metadata::MetadataManager,
	options::{IoBacking, Options},
	record::{Location, Record, SegmentId},
	worker::Scheduler,
};

const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct ActiveSegment {
	id: SegmentId,
	data: Arc<ReadWriteFile>,
	index_log: Arc<Mutex<Vec<u8>>>,
}

struct ManagerState {
	active: Option<ActiveSegment>,
	open_files: LruCache<SegmentId, Arc<ReadonlyFile>>,
}

pub struct ManagerInner {
	metadata: Arc<MetadataManager>,
	scheduler: Arc<Scheduler>,
	segment_bytes: u64,
	data_io: IoBacking,
	active_id: AtomicU32,
	state: Mutex<ManagerState>,
}

#[derive(Clone)]
pub struct FileManager {
	inner: Arc<ManagerInner>,
}

impl FileManager {
	pub fn new(
		metadata: Arc<MetadataManager>,
		scheduler: Arc<Scheduler>,
		options: &Options,
	) -> FileManager {
		FileManager {
			inner: Arc::new(ManagerInner {
				metadata,
				scheduler,
				segment_bytes: options.segment_bytes,
				data_io: options.data_io,
				active_id: AtomicU32::new(0),
				state: Mutex::new(ManagerState {
					active: None,
					open_files: LruCache::new(options.max_open_files),
				}),
			}),
		}
	}

	/// Opens the most recent segment for appending, or creates segment 1
	/// in an empty database.
	pub fn init(&self) -> Result<()> {
		let id = self.inner.metadata.last().unwrap_or(1);
		let mut state = self.inner.state.lock();
		self.rotate(&mut state, id)
	}

	pub fn active_id(&self) -> SegmentId {
		self.inner.active_id.load(Ordering::Relaxed)
	}

	/// Appends one record, rotating to a new segment when the active one
	/// is full. Serialization and the index-log append happen under the
	/// data file's write lock; the manager lock is only held to snapshot
	/// or advance the active segment.
	pub fn append(&self, record: &Record<'_>) -> Result<Location> {
		let len = record.encoded_size() as usize;
		if len as u64 > self.inner.segment_bytes {
			return Err(Error::Unsupported(format!(
				"record of {} bytes exceeds the segment ceiling",
				len
			)));
		}
		loop {
			let active = {
				let state = self.inner.state.lock();
				match &state.active {
					Some(active) => active.clone(),
					None => return Err(Error::InvalidArgument("file manager is not initialized".into())),
				}
			};

			let mut appender = active.data.appender();
			if let Some(offset) = appender.append(len, |buf| record.encode(buf))? {
				// Still under the data file's write lock, so index records
				// stay ordered by offset.
				IndexRecord {
					rtype: record.rtype,
					offset,
					len: len as u32,
					key: record.key,
				}
				.encode_into(&mut active.index_log.lock());
				log::trace!(
					target: "cask-db",
					"appended {} bytes at {}:{}, key {}",
					len,
					active.id,
					offset,
					hex(record.key),
				);
				return Ok(Location::new(active.id, offset));
			}
			drop(appender);

			let mut state = self.inner.state.lock();
			match &state.active {
				// Another writer already rotated; retry against the new
				// active segment.
				Some(current) if current.id != active.id => continue,
				_ => {}
			}
			self.rotate(&mut state, active.id + 1)?;
		}
	}

	/// Seals the current active segment (if any), schedules its fsync and
	/// index write-out, and installs `id` as the new active segment.
	fn rotate(&self, state: &mut ManagerState, id: SegmentId) -> Result<()> {
		if let Some(prev) = state.active.take() {
			log::debug!(target: "cask-db", "rotating segment {} -> {}", prev.id, id);
			if let Err(e) = prev.data.seal() {
				log::warn!(target: "cask-db", "failed to flush segment {}: {}", prev.id, e);
			}
			spawn_sync(&self.inner.scheduler, prev.id, prev.data, Duration::from_secs(0));
			// No appender can reach the sealed file, the log is complete.
			let log_bytes = std::mem::take(&mut *prev.index_log.lock());
			spawn_index_write(&self.inner, prev.id, log_bytes, Duration::from_secs(0));
		}

		let (data, index_log, offset) = self.open_data_file(id)?;
		// A leftover index file would go stale as soon as we append.
		match std::fs::remove_file(self.inner.metadata.index_path(id)) {
			Ok(()) => log::debug!(target: "cask-db", "removed stale index file of segment {}", id),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => return Err(e.into()),
		}
		self.inner.metadata.create(id)?;
		state.active = Some(ActiveSegment { id, data, index_log: Arc::new(Mutex::new(index_log)) });
		self.inner.active_id.store(id, Ordering::Relaxed);
		if offset != 0 {
			log::debug!(target: "cask-db", "segment {} resumes appending at offset {}", id, offset);
		}
		Ok(())
	}

	/// Opens (or creates) a data file, scanning any existing content to
	/// find the append position and to rebuild the in-memory index log.
	fn open_data_file(&self, id: SegmentId) -> Result<(Arc<ReadWriteFile>, Vec<u8>, u32)> {
		let path = self.inner.metadata.data_path(id);
		let file = Arc::new(ReadWriteFile::open(&path, self.inner.segment_bytes, self.inner.data_io)?);

		let mut index_log = Vec::new();
		let mut offset = 0;
		let mut iter = RecordIterator::new(DataFile::Active(file.clone()));
		loop {
			match iter.next_record() {
				Some(Ok((at, record))) => {
					IndexRecord {
						rtype: record.rtype,
						offset: at,
						len: record.encoded_size(),
						key: &record.key,
					}
					.encode_into(&mut index_log);
					offset = at + record.encoded_size();
				}
				// A torn record is the segment's truthful end.
				Some(Err(e)) if e.is_corruption() => break,
				Some(Err(e)) => return Err(e),
				None => break,
			}
		}
		file.set_write_offset(offset as usize);
		Ok((file, index_log, offset))
	}

	/// A read handle on a segment's data file. The active segment is
	/// served directly; sealed segments go through the open-files LRU.
	pub fn acquire(&self, id: SegmentId) -> Result<DataFile> {
		{
			let mut state = self.inner.state.lock();
			if let Some(active) = &state.active {
				if active.id == id {
					return Ok(DataFile::Active(active.data.clone()));
				}
			}
			if let Some(file) = state.open_files.get(&id) {
				return Ok(DataFile::Sealed(file.clone()));
			}
		}
		// Open outside the lock; a racing open of the same id just
		// replaces the cached handle.
		let path = self.inner.metadata.data_path(id);
		let file = Arc::new(ReadonlyFile::open(&path).map_err(|e| {
			log::error!(target: "cask-db", "cannot open segment {} at {:?}: {}", id, path, e);
			e
		})?);
		let mut state = self.inner.state.lock();
		state.open_files.put(id, file.clone());
		Ok(DataFile::Sealed(file))
	}

	/// A read handle on a segment's index file; fails when the segment
	/// has none (it is or crashed as the active segment).
	pub fn acquire_index(&self, id: SegmentId) -> Result<ReadonlyFile> {
		ReadonlyFile::open_mapped(&self.inner.metadata.index_path(id))
	}

	pub fn release(&self, id: SegmentId) {
		self.inner.state.lock().open_files.remove(&id);
	}

	/// Drops a sealed segment: metadata delete entry first, then both
	/// files. `id` must not be the active segment.
	pub fn remove(&self, id: SegmentId) -> Result<()> {
		debug_assert_ne!(id, self.active_id());
		self.release(id);
		self.inner.metadata.delete(id)?;
		for path in [self.inner.metadata.data_path(id), self.inner.metadata.index_path(id)] {
			match std::fs::remove_file(&path) {
				Ok(()) => {}
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
				Err(e) => log::warn!(target: "cask-db", "failed to remove {:?}: {}", path, e),
			}
		}
		log::debug!(target: "cask-db", "removed segment {}", id);
		Ok(())
	}

	fn active_data(&self) -> Option<Arc<ReadWriteFile>> {
		self.inner.state.lock().active.as_ref().map(|active| active.data.clone())
	}

	pub fn flush(&self, force: bool) -> Result<()> {
		match self.active_data() {
			Some(data) => data.flush(force),
			None => Ok(()),
		}
	}

	pub fn sync(&self) -> Result<()> {
		match self.active_data() {
			Some(data) => data.sync(),
			None => Ok(()),
		}
	}

	/// Flushes and fsyncs the active segment and drains its index log to
	/// disk so the next open can recover from the index file.
	pub fn close(&self) -> Result<()> {
		let active = {
			let state = self.inner.state.lock();
			state.active.clone()
		};
		let active = match active {
			Some(active) => active,
			None => return Ok(()),
		};
		active.data.sync()?;
		let log_bytes = active.index_log.lock().clone();
		ManagerInner::write_index_file(&self.inner, active.id, &log_bytes)
	}
}

impl ManagerInner {
	/// Writes a complete index file through a temporary sibling, so an
	/// index file is either absent or whole.
	fn write_index_file(inner: &ManagerInner, id: SegmentId, bytes: &[u8]) -> Result<()> {
		use std::io::Write;
		let path = inner.metadata.index_path(id);
		let tmp = path.with_extension("index.tmp");
		let mut file = std::fs::File::create(&tmp)?;
		file.write_all(bytes)?;
		file.sync_data()?;
		std::fs::rename(&tmp, &path)?;
		Ok(())
	}
}

/// Retries the fsync of a rotated segment every second until it goes
/// through. The queued job holds the scheduler weakly so a dropped
/// scheduler is not kept alive by its own queue.
fn spawn_sync(scheduler: &Arc<Scheduler>, id: SegmentId, file: Arc<ReadWriteFile>, delay: Duration) {
	let weak = Arc::downgrade(scheduler);
	scheduler.schedule_once(delay, move || match file.sync() {
		Ok(()) => log::trace!(target: "cask-db", "synced segment {}", id),
		Err(e) => {
			log::warn!(target: "cask-db", "failed to sync segment {}: {}", id, e);
			if let Some(scheduler) = weak.upgrade() {
				spawn_sync(&scheduler, id, file, RETRY_DELAY);
			}
		}
	});
}

/// Writes a rotated segment's index file in the background, retrying
/// every second. If the job is lost to a crash or shutdown the index is
/// rebuilt from the data file on the next open.
fn spawn_index_write(inner: &Arc<ManagerInner>, id: SegmentId, bytes: Vec<u8>, delay: Duration) {
	let weak = Arc::downgrade(inner);
	inner.scheduler.schedule_once(delay, move || {
		let inner = match weak.upgrade() {
			Some(inner) => inner,
			None => return,
		};
		match ManagerInner::write_index_file(&inner, id, &bytes) {
			Ok(()) => log::trace!(target: "cask-db", "wrote index file of segment {}", id),
			Err(e) => {
				log::warn!(target: "cask-db", "failed to write index file of segment {}: {}", id, e);
				spawn_index_write(&inner, id, bytes, RETRY_DELAY);
			}
		}
	});
}
