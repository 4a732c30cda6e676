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

// The engine. All writes append to the active segment through the file
// manager and update the in-memory key index under a single mutex. That
// mutex also guards the per-segment free-byte hints and the compaction
// queue; it is never held across disk I/O.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{
	compress::{compress, uncompress},
	display::hex,
	error::{Error, Result},
	index::Dir,
	iterator::{IndexIterator, RecordIterator},
	metadata::MetadataManager,
	options::{Options, ReadOptions, WriteOptions},
	read_cache::ReadCache,
	record::{Location, OwnedRecord, Record, RecordType, SegmentId},
	segment::FileManager,
	worker::{Scheduler, TaskId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompactState {
	Nop,
	Queued,
	Scheduling,
	Compacting,
}

#[derive(Debug, Clone, Copy)]
struct CompactHint {
	free_bytes: u64,
	state: CompactState,
}

impl Default for CompactHint {
	fn default() -> Self {
		CompactHint { free_bytes: 0, state: CompactState::Nop }
	}
}

#[derive(Default)]
struct DbState {
	index: HashMap<Box<[u8]>, Dir>,
	hints: HashMap<SegmentId, CompactHint>,
	tasks: Vec<SegmentId>,
}

struct DbInner {
	options: Options,
	state: Mutex<DbState>,
	manager: FileManager,
	metadata: Arc<MetadataManager>,
	read_cache: Option<ReadCache>,
	scheduler: Arc<Scheduler>,
	readonly: AtomicBool,
	shutdown: AtomicBool,
}

/// An embedded log-structured key-value store. All operations take
/// `&self`; the handle is shared between threads freely.
pub struct Db {
	inner: Arc<DbInner>,
	sync_task: TaskId,
	compact_task: TaskId,
}

impl Db {
	pub fn open<P: AsRef<Path>>(options: &Options, path: P) -> Result<Db> {
		let options = options.clone();
		let scheduler = Arc::new(Scheduler::new(options.worker_threads));
		let metadata = Arc::new(MetadataManager::open(path.as_ref())?);
		let manager = FileManager::new(metadata.clone(), scheduler.clone(), &options);
		manager.init()?;

		let read_cache = if options.read_cache.enable {
			Some(ReadCache::new(options.read_cache.bytes, options.read_cache.shards))
		} else {
			None
		};

		let inner = Arc::new(DbInner {
			options,
			state: Mutex::new(DbState::default()),
			manager,
			metadata,
			read_cache,
			scheduler,
			readonly: AtomicBool::new(false),
			shutdown: AtomicBool::new(false),
		});
		inner.recover()?;
		log::info!(
			target: "cask-db",
			"database {} opened with {} keys",
			inner.metadata.name(),
			inner.state.lock().index.len(),
		);

		let sync_task = Self::spawn_sync_worker(&inner);
		let compact_task = Self::spawn_compact_worker(&inner);
		Ok(Db { inner, sync_task, compact_task })
	}

	fn spawn_sync_worker(inner: &Arc<DbInner>) -> TaskId {
		let weak = Arc::downgrade(inner);
		let interval = inner.options.sync_interval;
		let max_errors = inner.options.sync_max_io_error;
		let mut failed = 0u32;
		inner.scheduler.schedule_every(interval, interval, move || {
			let inner = match weak.upgrade() {
				Some(inner) => inner,
				None => return,
			};
			match inner.manager.sync() {
				Ok(()) => failed = 0,
				Err(e) => {
					failed += 1;
					log::warn!(target: "cask-db", "periodic sync failed ({} consecutive): {}", failed, e);
					if failed > max_errors && !inner.readonly.swap(true, Ordering::SeqCst) {
						log::error!(
							target: "cask-db",
							"database is read-only after {} consecutive sync failures",
							failed,
						);
					}
				}
			}
		})
	}

	fn spawn_compact_worker(inner: &Arc<DbInner>) -> TaskId {
		let weak = Arc::downgrade(inner);
		let interval = inner.options.compaction.interval;
		inner.scheduler.schedule_every(interval, interval, move || {
			let inner = match weak.upgrade() {
				Some(inner) => inner,
				None => return,
			};
			let tasks = {
				let mut state = inner.state.lock();
				inner.poll_compact_tasks(&mut state)
			};
			for id in tasks {
				let weak = Arc::downgrade(&inner);
				inner.scheduler.schedule_once(Duration::from_secs(0), move || {
					if let Some(inner) = weak.upgrade() {
						inner.compact_segment(id);
					}
				});
			}
		})
	}

	pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
		let dir = {
			let state = self.inner.state.lock();
			match state.index.get(key) {
				Some(dir) => *dir,
				None => return Ok(None),
			}
		};
		let record = self.inner.read_record(dir, options.use_read_cache)?;
		if self.inner.options.compress_value {
			Ok(Some(uncompress(&record.value)?))
		} else {
			Ok(Some(record.value))
		}
	}

	pub fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
		self.inner.write(options, key, Some(value)).map(|_| ())
	}

	/// Removes `key`, returning whether it was present. The tombstone is
	/// written either way as a durable marker.
	pub fn delete(&self, options: &WriteOptions, key: &[u8]) -> Result<bool> {
		self.inner.write(options, key, None)
	}

	/// Forces buffered bytes of the active segment to the kernel.
	pub fn flush(&self) -> Result<()> {
		self.inner.manager.flush(true)
	}

	/// Synchronously compacts every segment currently queued.
	pub fn compact(&self) -> Result<()> {
		let mut tasks = {
			let mut state = self.inner.state.lock();
			self.inner.poll_compact_tasks(&mut state)
		};
		tasks.sort_unstable();
		for id in tasks {
			self.inner.compact_segment(id);
		}
		Ok(())
	}

	/// A single-pass scan over the live content of the store. The key set
	/// is snapshotted at creation; values are read as the iterator
	/// advances, skipping records that fail their checksum.
	pub fn iter(&self) -> DbIterator<'_> {
		let entries = {
			let state = self.inner.state.lock();
			state.index.iter().map(|(key, dir)| (key.clone(), *dir)).collect()
		};
		DbIterator { inner: &self.inner, entries, pos: 0 }
	}
}

impl Drop for Db {
	fn drop(&mut self) {
		self.inner.shutdown.store(true, Ordering::SeqCst);
		self.inner.scheduler.cancel(self.sync_task);
		self.inner.scheduler.cancel(self.compact_task);
		self.inner.scheduler.shutdown();
		if let Err(e) = self.inner.manager.close() {
			log::warn!(target: "cask-db", "failed to close database cleanly: {}", e);
		}
		log::info!(target: "cask-db", "database {} closed", self.inner.metadata.name());
	}
}

impl DbInner {
	fn write(&self, options: &WriteOptions, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
		if self.readonly.load(Ordering::SeqCst) {
			return Err(Error::Unsupported("database is read-only".into()));
		}
		if key.len() > u8::MAX as usize {
			return Err(Error::Unsupported(format!("key of {} bytes is too long", key.len())));
		}

		let compressed;
		let (rtype, stored) = match value {
			Some(value) if self.options.compress_value => {
				compressed = compress(value)?;
				(RecordType::Set, &compressed[..])
			}
			Some(value) => (RecordType::Set, value),
			// Tombstones carry no value, compressed or not.
			None => (RecordType::Delete, &[][..]),
		};
		let record = Record::new(rtype, key, stored, 0);
		let size = record.encoded_size();
		if size as u64 > self.options.segment_bytes {
			return Err(Error::Unsupported(format!(
				"record of {} bytes exceeds the segment ceiling",
				size
			)));
		}

		let loc = self.manager.append(&record)?;

		let mut found = true;
		{
			let mut state = self.state.lock();
			match state.index.get(key).copied() {
				None => {
					if value.is_none() {
						// Deleting an absent key: the tombstone itself is
						// dead weight from the start.
						self.update_unused(&mut state, loc, size as u64);
						found = false;
					} else {
						state.index.insert(key.into(), Dir { loc, entry_size: size });
					}
				}
				Some(old) => {
					self.update_unused(&mut state, old.loc, old.entry_size as u64);
					if value.is_none() {
						state.index.remove(key);
					} else {
						state.index.insert(key.into(), Dir { loc, entry_size: size });
					}
				}
			}
		}

		if options.sync {
			self.manager.sync()?;
		}
		Ok(found)
	}

	fn read_record(&self, dir: Dir, use_cache: bool) -> Result<OwnedRecord> {
		if let (Some(cache), true) = (&self.read_cache, use_cache) {
			let bytes = cache.read(dir.loc, dir.entry_size, |id| self.manager.acquire(id))?;
			let record = Record::decode(bytes.as_slice())?
				.ok_or_else(|| Error::Corruption(format!("truncated record at {}", dir.loc)))?;
			if !record.validate() {
				return Err(Error::Corruption(format!("checksum mismatch at {}", dir.loc)));
			}
			return Ok(record.to_owned());
		}

		let file = self.manager.acquire(dir.loc.segment)?;
		let mut iter = RecordIterator::new(file);
		iter.seek(dir.loc.offset);
		match iter.next_record() {
			Some(Ok((_, record))) => {
				if !record.validate() {
					return Err(Error::Corruption(format!("checksum mismatch at {}", dir.loc)));
				}
				Ok(record)
			}
			Some(Err(e)) => Err(e),
			None => Err(Error::Corruption(format!("missing record at {}", dir.loc))),
		}
	}

	/// Accounts `bytes` of dead data in `loc`'s segment and enqueues the
	/// segment for compaction once it crosses the threshold. The active
	/// segment is never enqueued; it picks up its backlog after rotation.
	fn update_unused(&self, state: &mut DbState, loc: Location, bytes: u64) {
		let hint = state.hints.entry(loc.segment).or_insert_with(Default::default);
		hint.free_bytes += bytes;
		if hint.free_bytes >= self.options.compaction_threshold()
			&& hint.state == CompactState::Nop
			&& loc.segment != self.manager.active_id()
		{
			hint.state = CompactState::Queued;
			state.tasks.push(loc.segment);
			log::debug!(
				target: "cask-db",
				"segment {} queued for compaction with {} free bytes",
				loc.segment,
				hint.free_bytes,
			);
		}
	}

	fn poll_compact_tasks(&self, state: &mut DbState) -> Vec<SegmentId> {
		let tasks = std::mem::take(&mut state.tasks);
		for id in &tasks {
			if let Some(hint) = state.hints.get_mut(id) {
				hint.state = CompactState::Scheduling;
			}
		}
		tasks
	}

	fn recover(&self) -> Result<()> {
		let mut state = self.state.lock();
		for id in self.metadata.files() {
			log::debug!(target: "cask-db", "recovering segment {}", id);
			if !self.recover_from_index(&mut state, id) {
				self.recover_from_data(&mut state, id)?;
			}
		}
		Ok(())
	}

	/// Replays a segment's index file into the key index. Returns false
	/// when the segment has no usable index file, in which case the data
	/// file is the source of truth.
	fn recover_from_index(&self, state: &mut DbState, id: SegmentId) -> bool {
		let file = match self.manager.acquire_index(id) {
			Ok(file) => file,
			Err(_) => return false,
		};
		let mut iter = match IndexIterator::new(&file) {
			Ok(iter) => iter,
			Err(e) => {
				log::warn!(target: "cask-db", "unreadable index file of segment {}: {}", id, e);
				return false;
			}
		};
		// Parse the whole file before applying anything so a bad index
		// file falls back to the data scan cleanly.
		let mut entries = Vec::new();
		loop {
			match iter.next_entry() {
				Ok(Some(entry)) => entries.push(entry),
				Ok(None) => break,
				Err(e) => {
					log::warn!(target: "cask-db", "corrupt index file of segment {}: {}", id, e);
					return false;
				}
			}
		}
		for entry in entries {
			self.apply(state, entry.rtype, &entry.key, Location::new(id, entry.offset), entry.len);
		}
		true
	}

	fn recover_from_data(&self, state: &mut DbState, id: SegmentId) -> Result<()> {
		let file = self.manager.acquire(id)?;
		let mut iter = RecordIterator::new(file);
		loop {
			match iter.next_record() {
				Some(Ok((offset, record))) => self.apply(
					state,
					record.rtype,
					&record.key,
					Location::new(id, offset),
					record.encoded_size(),
				),
				// A torn record is the segment's truthful end.
				Some(Err(e)) if e.is_corruption() => break,
				Some(Err(e)) => return Err(e),
				None => break,
			}
		}
		self.manager.release(id);
		Ok(())
	}

	/// Applies one recovered entry. Segments replay in ascending id order
	/// and offsets ascend within a segment, so location comparisons
	/// decide which version wins.
	fn apply(&self, state: &mut DbState, rtype: RecordType, key: &[u8], loc: Location, len: u32) {
		match rtype {
			RecordType::Set => match state.index.get(key).copied() {
				None => {
					state.index.insert(key.into(), Dir { loc, entry_size: len });
				}
				Some(dir) if dir.loc > loc => {
					// A newer version is already indexed.
					self.update_unused(state, loc, len as u64);
				}
				Some(dir) if dir.loc == loc => {
					log::error!(target: "cask-db", "duplicate replay of {} for key {}", loc, hex(key));
				}
				Some(dir) => {
					self.update_unused(state, dir.loc, dir.entry_size as u64);
					state.index.insert(key.into(), Dir { loc, entry_size: len });
				}
			},
			RecordType::Delete => {
				// The tombstone itself is overhead.
				self.update_unused(state, loc, len as u64);
				if let Some(dir) = state.index.get(key).copied() {
					if dir.loc > loc {
						return;
					}
					self.update_unused(state, dir.loc, dir.entry_size as u64);
					state.index.remove(key);
				}
			}
		}
	}

	/// Moves the live records of segment `id` to the active segment and
	/// deletes the segment.
	fn compact_segment(&self, id: SegmentId) {
		if self.readonly.load(Ordering::SeqCst) {
			return;
		}
		if id == self.manager.active_id() {
			self.abort_compaction(id);
			return;
		}
		let file = match self.manager.acquire(id) {
			Ok(file) => file,
			Err(e) => {
				log::warn!(target: "cask-db", "cannot open segment {} for compaction: {}", id, e);
				self.state.lock().hints.remove(&id);
				return;
			}
		};
		log::debug!(target: "cask-db", "compacting segment {}", id);
		{
			let mut state = self.state.lock();
			state.hints.entry(id).or_insert_with(Default::default).state = CompactState::Compacting;
		}

		let mut moved = 0u64;
		let mut iter = RecordIterator::new(file);
		loop {
			if self.shutdown.load(Ordering::SeqCst) {
				self.abort_compaction(id);
				return;
			}
			let (offset, record) = match iter.next_record() {
				Some(Ok(next)) => next,
				Some(Err(e)) if e.is_corruption() => break,
				Some(Err(e)) => {
					log::warn!(target: "cask-db", "compaction of segment {} aborted: {}", id, e);
					self.abort_compaction(id);
					return;
				}
				None => break,
			};
			if record.rtype != RecordType::Set {
				continue;
			}
			let loc = Location::new(id, offset);
			{
				// Skip records the index no longer points at.
				let state = self.state.lock();
				match state.index.get(&record.key[..]) {
					Some(dir) if dir.loc == loc => {}
					_ => continue,
				}
			}

			let new_loc = match self.manager.append(&record.as_record()) {
				Ok(new_loc) => new_loc,
				Err(e) => {
					log::warn!(target: "cask-db", "compaction of segment {} aborted: {}", id, e);
					self.abort_compaction(id);
					return;
				}
			};

			let mut state = self.state.lock();
			match state.index.get_mut(&record.key[..]) {
				// Nothing newer arrived while we copied; point the key at
				// the moved record.
				Some(dir) if dir.loc == loc => {
					*dir = Dir { loc: new_loc, entry_size: record.encoded_size() };
					moved += 1;
				}
				// A writer overtook the copy; the copy is garbage in the
				// segment it just landed in.
				_ => self.update_unused(&mut state, new_loc, record.encoded_size() as u64),
			}
		}

		self.state.lock().hints.remove(&id);
		if let Err(e) = self.manager.remove(id) {
			log::warn!(target: "cask-db", "failed to remove compacted segment {}: {}", id, e);
		}
		log::debug!(target: "cask-db", "compacted segment {}, {} records moved", id, moved);
	}

	/// Returns a segment's hint to `Nop`, keeping its free-byte count, so
	/// the next free-byte update can re-enqueue it.
	fn abort_compaction(&self, id: SegmentId) {
		let mut state = self.state.lock();
		if let Some(hint) = state.hints.get_mut(&id) {
			hint.state = CompactState::Nop;
		}
	}
}

/// Yielded by [`DbIterator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterEntry {
	pub key: Vec<u8>,
	pub value: Vec<u8>,
	pub timestamp: u32,
}

pub struct DbIterator<'a> {
	inner: &'a DbInner,
	entries: Vec<(Box<[u8]>, Dir)>,
	pos: usize,
}

impl<'a> Iterator for DbIterator<'a> {
	type Item = IterEntry;

	fn next(&mut self) -> Option<IterEntry> {
		while self.pos < self.entries.len() {
			let (key, dir) = &self.entries[self.pos];
			self.pos += 1;
			let record = match self.inner.read_record(*dir, false) {
				Ok(record) => record,
				Err(e) => {
					log::debug!(target: "cask-db", "skipping unreadable record at {}: {}", dir.loc, e);
					continue;
				}
			};
			let value = if self.inner.options.compress_value {
				match uncompress(&record.value) {
					Ok(value) => value,
					Err(e) => {
						log::debug!(target: "cask-db", "skipping record at {}: {}", dir.loc, e);
						continue;
					}
				}
			} else {
				record.value
			};
			return Some(IterEntry { key: key.to_vec(), value, timestamp: record.timestamp });
		}
		None
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::options::CompactionOptions;
	use crate::record::RECORD_HEADER_SIZE;

	struct TempDir(std::path::PathBuf);

	impl TempDir {
		fn new(name: &'static str) -> TempDir {
			env_logger::try_init().ok();
			let mut path = std::env::temp_dir();
			path.push("cask-db-test");
			path.push("db");
			path.push(name);

			if path.exists() {
				std::fs::remove_dir_all(&path).unwrap();
			}
			std::fs::create_dir_all(&path).unwrap();
			TempDir(path)
		}

		fn db_path(&self) -> std::path::PathBuf {
			self.0.join("test.db")
		}

		fn db(&self, options: &Options) -> Db {
			Db::open(options, self.db_path()).unwrap()
		}
	}

	impl Drop for TempDir {
		fn drop(&mut self) {
			if self.0.exists() {
				std::fs::remove_dir_all(&self.0).unwrap();
			}
		}
	}

	fn test_options() -> Options {
		Options {
			segment_bytes: 4096,
			compress_value: false,
			sync_interval: Duration::from_secs(1000),
			compaction: CompactionOptions {
				threshold_bytes: None,
				interval: Duration::from_secs(1000),
			},
			..Default::default()
		}
	}

	fn value(size: usize) -> Vec<u8> {
		use rand::RngCore;
		let mut result = vec![0u8; size];
		rand::thread_rng().fill_bytes(&mut result);
		result
	}

	fn index_snapshot(db: &Db) -> Vec<(Vec<u8>, (SegmentId, u32, u32))> {
		let state = db.inner.state.lock();
		let mut entries: Vec<_> = state
			.index
			.iter()
			.map(|(key, dir)| (key.to_vec(), (dir.loc.segment, dir.loc.offset, dir.entry_size)))
			.collect();
		entries.sort();
		entries
	}

	#[test]
	fn put_get_reopen() {
		let dir = TempDir::new("put_get_reopen");
		{
			let db = dir.db(&test_options());
			db.put(&WriteOptions::default(), b"foo", b"bar").unwrap();
			assert_eq!(db.get(&ReadOptions::default(), b"foo").unwrap().unwrap(), b"bar");
		}
		assert!(dir.0.join("test_1.data").exists());
		assert!(dir.0.join("test_1.index").exists());

		let db = dir.db(&test_options());
		assert_eq!(db.get(&ReadOptions::default(), b"foo").unwrap().unwrap(), b"bar");
	}

	#[test]
	fn delete_semantics() {
		let dir = TempDir::new("delete");
		let db = dir.db(&test_options());

		db.put(&WriteOptions::default(), b"k", b"v").unwrap();
		assert!(db.delete(&WriteOptions::default(), b"k").unwrap());
		assert_eq!(db.get(&ReadOptions::default(), b"k").unwrap(), None);
		// Deleting an absent key reports not found and leaves the store
		// usable.
		assert!(!db.delete(&WriteOptions::default(), b"k").unwrap());
		db.put(&WriteOptions::default(), b"k", b"v2").unwrap();
		assert_eq!(db.get(&ReadOptions::default(), b"k").unwrap().unwrap(), b"v2");
	}

	#[test]
	fn delete_survives_reopen() {
		let dir = TempDir::new("delete_reopen");
		{
			let db = dir.db(&test_options());
			db.put(&WriteOptions::default(), b"gone", b"v").unwrap();
			db.put(&WriteOptions::default(), b"kept", b"v").unwrap();
			db.delete(&WriteOptions::default(), b"gone").unwrap();
		}
		let db = dir.db(&test_options());
		assert_eq!(db.get(&ReadOptions::default(), b"gone").unwrap(), None);
		assert_eq!(db.get(&ReadOptions::default(), b"kept").unwrap().unwrap(), b"v");
	}

	#[test]
	fn overwrite_updates_free_hint() {
		let dir = TempDir::new("free_hint");
		let db = dir.db(&test_options());

		db.put(&WriteOptions::default(), b"k", b"v1").unwrap();
		db.put(&WriteOptions::default(), b"k", b"v2").unwrap();
		assert_eq!(db.get(&ReadOptions::default(), b"k").unwrap().unwrap(), b"v2");

		let first_size = (RECORD_HEADER_SIZE + 1 + 2) as u64;
		let state = db.inner.state.lock();
		assert_eq!(state.hints.get(&1).unwrap().free_bytes, first_size);
	}

	#[test]
	fn many_keys_flush_reopen() {
		let dir = TempDir::new("many_keys");
		let options = Options { segment_bytes: 1 << 20, ..test_options() };
		let values: Vec<_> = (0..1000).map(|_| value(100)).collect();
		{
			let db = dir.db(&options);
			for (i, value) in values.iter().enumerate() {
				db.put(&WriteOptions::default(), format!("key{:04}", i).as_bytes(), value).unwrap();
			}
			db.flush().unwrap();
		}
		let db = dir.db(&options);
		for (i, value) in values.iter().enumerate() {
			let got = db.get(&ReadOptions::default(), format!("key{:04}", i).as_bytes()).unwrap();
			assert_eq!(got.as_deref(), Some(&value[..]));
		}
	}

	#[test]
	fn rotation_keeps_keys() {
		let dir = TempDir::new("rotation");
		let values: Vec<_> = (0..100).map(|_| value(100)).collect();
		{
			let db = dir.db(&test_options());
			for (i, value) in values.iter().enumerate() {
				db.put(&WriteOptions::default(), format!("key{:03}", i).as_bytes(), value).unwrap();
			}
			assert!(db.inner.metadata.files().len() >= 2);
			for (i, value) in values.iter().enumerate() {
				let got = db.get(&ReadOptions::default(), format!("key{:03}", i).as_bytes()).unwrap();
				assert_eq!(got.as_deref(), Some(&value[..]));
			}
		}
		let db = dir.db(&test_options());
		for (i, value) in values.iter().enumerate() {
			let got = db.get(&ReadOptions::default(), format!("key{:03}", i).as_bytes()).unwrap();
			assert_eq!(got.as_deref(), Some(&value[..]));
		}
	}

	#[test]
	fn compaction_reclaims_segment() {
		let dir = TempDir::new("compaction");
		let db = dir.db(&test_options());

		// 35 records of 114 bytes fill segment 1.
		for i in 0..35 {
			db.put(&WriteOptions::default(), format!("key{:02}", i).as_bytes(), &vec![i as u8; 95])
				.unwrap();
		}
		assert_eq!(db.inner.manager.active_id(), 1);
		// Deleting 30 of them pushes segment 1 over the 3072-byte
		// compaction threshold (the tombstones rotate into segment 2).
		for i in 0..30 {
			db.delete(&WriteOptions::default(), format!("key{:02}", i).as_bytes()).unwrap();
		}
		assert!(db.inner.manager.active_id() > 1);

		db.compact().unwrap();

		assert!(!dir.0.join("test_1.data").exists());
		assert!(!db.inner.metadata.files().contains(&1));
		assert!(db.inner.state.lock().hints.get(&1).is_none());
		for i in 0..30 {
			assert_eq!(
				db.get(&ReadOptions::default(), format!("key{:02}", i).as_bytes()).unwrap(),
				None
			);
		}
		for i in 30..35 {
			let got = db.get(&ReadOptions::default(), format!("key{:02}", i).as_bytes()).unwrap();
			assert_eq!(got.unwrap(), vec![i as u8; 95]);
		}
	}

	#[test]
	fn compaction_preserves_content_across_reopen() {
		let dir = TempDir::new("compaction_reopen");
		let values: Vec<_> = (0..35).map(|i| vec![i as u8; 95]).collect();
		{
			let db = dir.db(&test_options());
			for (i, value) in values.iter().enumerate() {
				db.put(&WriteOptions::default(), format!("key{:02}", i).as_bytes(), value).unwrap();
			}
			for i in 0..30 {
				db.delete(&WriteOptions::default(), format!("key{:02}", i).as_bytes()).unwrap();
			}
			db.compact().unwrap();
		}
		let db = dir.db(&test_options());
		for i in 0..30 {
			assert_eq!(
				db.get(&ReadOptions::default(), format!("key{:02}", i).as_bytes()).unwrap(),
				None
			);
		}
		for i in 30..35 {
			let got = db.get(&ReadOptions::default(), format!("key{:02}", i).as_bytes()).unwrap();
			assert_eq!(got.unwrap(), values[i]);
		}
	}

	#[test]
	fn corruption_is_contained() {
		let dir = TempDir::new("corruption");
		let options = Options { segment_bytes: 8192, ..test_options() };
		{
			let db = dir.db(&options);
			for i in 0..3 {
				db.put(&WriteOptions::default(), format!("key{}", i).as_bytes(), &vec![7u8; 100])
					.unwrap();
			}
		}

		// Flip one bit inside the first record's value payload.
		let data_path = dir.0.join("test_1.data");
		let mut bytes = std::fs::read(&data_path).unwrap();
		bytes[RECORD_HEADER_SIZE + 4 + 2] ^= 0x01;
		std::fs::write(&data_path, &bytes).unwrap();

		let db = dir.db(&options);
		for read_cache in [true, false] {
			let options = ReadOptions { use_read_cache: read_cache };
			assert!(matches!(db.get(&options, b"key0"), Err(Error::Corruption(_))));
			assert_eq!(db.get(&options, b"key1").unwrap().unwrap(), vec![7u8; 100]);
			assert_eq!(db.get(&options, b"key2").unwrap().unwrap(), vec![7u8; 100]);
		}
	}

	#[test]
	fn cache_coherence() {
		let dir = TempDir::new("cache_coherence");
		let db = dir.db(&test_options());

		let values: Vec<_> = (0..60).map(|_| value(150)).collect();
		for (i, value) in values.iter().enumerate() {
			db.put(&WriteOptions::default(), format!("key{:02}", i).as_bytes(), value).unwrap();
		}
		for (i, value) in values.iter().enumerate() {
			let key = format!("key{:02}", i);
			let cached = db.get(&ReadOptions { use_read_cache: true }, key.as_bytes()).unwrap();
			let direct = db.get(&ReadOptions { use_read_cache: false }, key.as_bytes()).unwrap();
			assert_eq!(cached, direct);
			assert_eq!(cached.as_deref(), Some(&value[..]));
		}
	}

	#[test]
	fn readonly_rejects_writes() {
		let dir = TempDir::new("readonly");
		let db = dir.db(&test_options());
		db.put(&WriteOptions::default(), b"k", b"v").unwrap();

		db.inner.readonly.store(true, Ordering::SeqCst);
		assert!(matches!(
			db.put(&WriteOptions::default(), b"k", b"v2"),
			Err(Error::Unsupported(_))
		));
		assert!(matches!(db.delete(&WriteOptions::default(), b"k"), Err(Error::Unsupported(_))));
		// Reads keep working.
		assert_eq!(db.get(&ReadOptions::default(), b"k").unwrap().unwrap(), b"v");
		db.inner.readonly.store(false, Ordering::SeqCst);
	}

	#[test]
	fn oversized_writes_are_unsupported() {
		let dir = TempDir::new("oversized");
		let db = dir.db(&test_options());
		assert!(matches!(
			db.put(&WriteOptions::default(), b"k", &vec![0u8; 8192]),
			Err(Error::Unsupported(_))
		));
		assert!(matches!(
			db.put(&WriteOptions::default(), &vec![0u8; 300], b"v"),
			Err(Error::Unsupported(_))
		));
	}

	#[test]
	fn recovery_idempotence() {
		let dir = TempDir::new("idempotence");
		{
			let db = dir.db(&test_options());
			for i in 0..50 {
				db.put(&WriteOptions::default(), format!("key{:02}", i).as_bytes(), &vec![1u8; 50])
					.unwrap();
			}
			db.delete(&WriteOptions::default(), b"key00").unwrap();
		}
		let first = {
			let db = dir.db(&test_options());
			index_snapshot(&db)
		};
		let second = {
			let db = dir.db(&test_options());
			index_snapshot(&db)
		};
		assert_eq!(first, second);
		assert!(!first.is_empty());
	}

	#[test]
	fn recovers_without_index_files() {
		let dir = TempDir::new("no_index");
		let values: Vec<_> = (0..100).map(|_| value(100)).collect();
		{
			let db = dir.db(&test_options());
			for (i, value) in values.iter().enumerate() {
				db.put(&WriteOptions::default(), format!("key{:03}", i).as_bytes(), value).unwrap();
			}
		}
		// Losing every index file only costs recovery speed.
		for entry in std::fs::read_dir(&dir.0).unwrap() {
			let path = entry.unwrap().path();
			if path.extension().map_or(false, |e| e == "index") {
				std::fs::remove_file(&path).unwrap();
			}
		}
		let db = dir.db(&test_options());
		for (i, value) in values.iter().enumerate() {
			let got = db.get(&ReadOptions::default(), format!("key{:03}", i).as_bytes()).unwrap();
			assert_eq!(got.as_deref(), Some(&value[..]));
		}
	}

	#[test]
	fn compressed_values_roundtrip() {
		let dir = TempDir::new("compressed");
		let options = Options { compress_value: true, ..test_options() };
		let long = vec![b'a'; 6000];
		{
			let db = dir.db(&options);
			// A value above the raw ceiling is fine once compressed.
			db.put(&WriteOptions::default(), b"long", &long).unwrap();
			db.put(&WriteOptions::default(), b"short", b"v").unwrap();
			assert_eq!(db.get(&ReadOptions::default(), b"long").unwrap().unwrap(), long);
		}
		let db = dir.db(&options);
		assert_eq!(db.get(&ReadOptions::default(), b"long").unwrap().unwrap(), long);
		assert_eq!(db.get(&ReadOptions::default(), b"short").unwrap().unwrap(), b"v");
	}

	#[test]
	fn empty_value_is_not_a_delete() {
		let dir = TempDir::new("empty_value");
		let db = dir.db(&test_options());
		db.put(&WriteOptions::default(), b"k", b"").unwrap();
		assert_eq!(db.get(&ReadOptions::default(), b"k").unwrap().unwrap(), b"");
	}

	#[test]
	fn synced_write() {
		let dir = TempDir::new("synced");
		let db = dir.db(&test_options());
		db.put(&WriteOptions { sync: true }, b"k", b"v").unwrap();
		assert_eq!(db.get(&ReadOptions::default(), b"k").unwrap().unwrap(), b"v");
	}

	#[test]
	fn iterator_sees_live_content() {
		let dir = TempDir::new("iterator");
		let options = Options { compress_value: true, ..test_options() };
		let db = dir.db(&options);
		for i in 0..10 {
			db.put(&WriteOptions::default(), format!("key{}", i).as_bytes(), &vec![i as u8; 40])
				.unwrap();
		}
		db.delete(&WriteOptions::default(), b"key3").unwrap();
		db.delete(&WriteOptions::default(), b"key7").unwrap();

		let mut seen: Vec<_> = db.iter().map(|entry| (entry.key, entry.value)).collect();
		seen.sort();
		assert_eq!(seen.len(), 8);
		for (key, value) in seen {
			let i: u8 = String::from_utf8(key[3..].to_vec()).unwrap().parse().unwrap();
			assert_ne!(i, 3);
			assert_ne!(i, 7);
			assert_eq!(value, vec![i; 40]);
		}
	}

	#[test]
	fn concurrent_writers_and_readers() {
		let dir = TempDir::new("concurrent");
		let options = Options { segment_bytes: 1 << 20, ..test_options() };
		let db = std::sync::Arc::new(dir.db(&options));

		let mut handles = Vec::new();
		for thread in 0..4u8 {
			let db = db.clone();
			handles.push(std::thread::spawn(move || {
				for i in 0..50u8 {
					let key = [b't', thread, i];
					let value = vec![thread ^ i; 64];
					db.put(&WriteOptions::default(), &key, &value).unwrap();
					// A read of our own key observes the put.
					let got = db.get(&ReadOptions::default(), &key).unwrap().unwrap();
					assert_eq!(got, value);
				}
			}));
		}
		for handle in handles {
			handle.join().unwrap();
		}
		for thread in 0..4u8 {
			for i in 0..50u8 {
				let got = db.get(&ReadOptions::default(), &[b't', thread, i]).unwrap().unwrap();
				assert_eq!(got, vec![thread ^ i; 64]);
			}
		}
	}
}
