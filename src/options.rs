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

use std::time::Duration;

/// Default hard ceiling for a segment's data file: 32 MiB.
pub const DEFAULT_SEGMENT_BYTES: u64 = 32 << 20;

/// Backing strategy for the active data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoBacking {
	/// mmap the preallocated file; sync is msync.
	Mapped,
	/// In-memory staging buffer flushed with pwrite.
	Buffered,
}

#[derive(Debug, Clone)]
pub struct CompactionOptions {
	/// Free bytes in a segment that enqueue it for compaction.
	/// `None` resolves to 3/4 of the segment ceiling.
	pub threshold_bytes: Option<u64>,
	pub interval: Duration,
}

impl Default for CompactionOptions {
	fn default() -> Self {
		CompactionOptions {
			threshold_bytes: None,
			interval: Duration::from_secs(5),
		}
	}
}

#[derive(Debug, Clone)]
pub struct ReadCacheOptions {
	pub enable: bool,
	/// Total byte budget across all shards.
	pub bytes: usize,
	pub shards: usize,
}

impl Default for ReadCacheOptions {
	fn default() -> Self {
		ReadCacheOptions {
			enable: true,
			bytes: 16 << 20,
			shards: 16,
		}
	}
}

#[derive(Debug, Clone)]
pub struct Options {
	/// Capacity of the LRU of open read-only segment files.
	pub max_open_files: usize,
	/// Hard size ceiling of a segment's data file. Appends that would
	/// exceed it rotate to a new segment.
	pub segment_bytes: u64,
	pub compaction: CompactionOptions,
	pub compress_value: bool,
	pub sync_interval: Duration,
	/// Consecutive sync failures before the database turns read-only.
	pub sync_max_io_error: u32,
	pub read_cache: ReadCacheOptions,
	pub data_io: IoBacking,
	pub worker_threads: usize,
}

impl Default for Options {
	fn default() -> Self {
		Options {
			max_open_files: 16,
			segment_bytes: DEFAULT_SEGMENT_BYTES,
			compaction: Default::default(),
			compress_value: true,
			sync_interval: Duration::from_secs(10),
			sync_max_io_error: 32,
			read_cache: Default::default(),
			data_io: IoBacking::Mapped,
			worker_threads: 1,
		}
	}
}

impl Options {
	pub fn compaction_threshold(&self) -> u64 {
		self.compaction
			.threshold_bytes
			.unwrap_or(self.segment_bytes / 4 * 3)
	}
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
	/// Force the write to stable storage before returning.
	pub sync: bool,
}

#[derive(Debug, Clone)]
pub struct ReadOptions {
	pub use_read_cache: bool,
}

impl Default for ReadOptions {
	fn default() -> Self {
		ReadOptions { use_read_cache: true }
	}
}
