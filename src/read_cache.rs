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

// Caches 4 KiB blocks of segment data files. A block is addressed by a
// 64-bit key: the segment id in the high word, the block-aligned byte
// offset in the low word. Record bytes are assembled from the covering
// blocks; a record that fits in a single block borrows the cached block
// instead of copying.

use std::sync::Arc;

use crate::{
	cache::ShardedCache,
	error::{Error, Result},
	file::DataFile,
	record::{Location, SegmentId},
};

pub const BLOCK_BYTES: usize = 4096;

fn block_key(segment: SegmentId, offset: u64) -> u64 {
	((segment as u64) << 32) | (offset & !(BLOCK_BYTES as u64 - 1))
}

pub struct Block {
	data: [u8; BLOCK_BYTES],
}

/// Bytes of one record, either copied out of several blocks or borrowed
/// from the single cached block that holds the whole record.
pub enum RecordBytes {
	Owned(Vec<u8>),
	Shared { block: Arc<Block>, start: usize, len: usize },
}

impl RecordBytes {
	pub fn as_slice(&self) -> &[u8] {
		match self {
			RecordBytes::Owned(buf) => buf,
			RecordBytes::Shared { block, start, len } => &block.data[*start..*start + *len],
		}
	}
}

pub struct ReadCache {
	blocks: ShardedCache<u64, Arc<Block>>,
}

impl ReadCache {
	pub fn new(bytes: usize, shards: usize) -> ReadCache {
		let shards = shards.max(1);
		let per_shard = ((bytes + shards - 1) / shards) / BLOCK_BYTES;
		ReadCache { blocks: ShardedCache::new(shards, per_shard) }
	}

	/// Assembles the `len` bytes at `loc`, loading missing blocks through
	/// `opener`. The opened file handle is reused across the blocks of one
	/// record.
	pub fn read<F>(&self, loc: Location, len: u32, mut opener: F) -> Result<RecordBytes>
	where
		F: FnMut(SegmentId) -> Result<DataFile>,
	{
		let begin = loc.offset as u64;
		let end = begin + len as u64;
		let mut file: Option<DataFile> = None;
		let mut out: Option<RecordBytes> = None;

		let mut block_start = begin & !(BLOCK_BYTES as u64 - 1);
		while block_start < end {
			let key = block_key(loc.segment, block_start);
			let block = self.blocks.get_or_compute(key, || {
				let handle = match &file {
					Some(handle) => handle.clone(),
					None => {
						let handle = opener(loc.segment)?;
						file = Some(handle.clone());
						handle
					}
				};
				let mut data = [0u8; BLOCK_BYTES];
				let read = handle.read(block_start, &mut data)?;
				if read != BLOCK_BYTES {
					return Err(Error::Io(std::io::Error::new(
						std::io::ErrorKind::UnexpectedEof,
						format!("short read of block {}:{}", loc.segment, block_start),
					)));
				}
				Ok(Arc::new(Block { data }))
			})?;

			let slice_start = (begin.max(block_start) - block_start) as usize;
			let slice_end = (end.min(block_start + BLOCK_BYTES as u64) - block_start) as usize;
			if slice_end - slice_start == len as usize {
				// The whole record sits in this block.
				out = Some(RecordBytes::Shared { block, start: slice_start, len: len as usize });
			} else {
				if out.is_none() {
					out = Some(RecordBytes::Owned(Vec::with_capacity(len as usize)));
				}
				if let Some(RecordBytes::Owned(buf)) = &mut out {
					buf.extend_from_slice(&block.data[slice_start..slice_end]);
				}
			}
			block_start += BLOCK_BYTES as u64;
		}

		// len > 0, so the loop ran at least once.
		Ok(out.expect("record spans at least one block"))
	}
}
