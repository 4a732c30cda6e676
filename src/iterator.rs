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

use std::convert::TryInto;

use crate::{
	error::Result,
	file::{DataFile, ReadonlyFile},
	index::IndexRecord,
	record::{OwnedRecord, Record, RecordType, RECORD_HEADER_SIZE},
};

const SCAN_CHUNK: usize = 64 << 10;

/// Forward scan over the data records of one segment. The scan ends at
/// the first offset that does not hold a complete record: the
/// preallocated tail of the segment, or a partial write cut off by a
/// crash.
pub struct RecordIterator {
	file: DataFile,
	offset: u32,
	size: u32,
	buf: Vec<u8>,
	buf_start: u32,
}

impl RecordIterator {
	pub fn new(file: DataFile) -> RecordIterator {
		let size = file.size().min(u32::MAX as u64) as u32;
		RecordIterator { file, offset: 0, size, buf: Vec::new(), buf_start: 0 }
	}

	pub fn seek(&mut self, offset: u32) {
		self.offset = offset;
		self.buf.clear();
		self.buf_start = offset;
	}

	fn window(&self) -> &[u8] {
		let skip = (self.offset - self.buf_start) as usize;
		if skip <= self.buf.len() {
			&self.buf[skip..]
		} else {
			&[]
		}
	}

	fn load(&mut self, need: usize) -> Result<()> {
		if self.window().len() >= need {
			return Ok(());
		}
		let remaining = (self.size - self.offset) as usize;
		let want = need.max(SCAN_CHUNK).min(remaining);
		self.buf.resize(want, 0);
		let read = self.file.read(self.offset as u64, &mut self.buf)?;
		self.buf.truncate(read);
		self.buf_start = self.offset;
		Ok(())
	}

	/// The next record and its offset. `None` at the end of the segment.
	pub fn next_record(&mut self) -> Option<Result<(u32, OwnedRecord)>> {
		if self.offset as u64 + RECORD_HEADER_SIZE as u64 > self.size as u64 {
			return None;
		}
		if let Err(e) = self.load(RECORD_HEADER_SIZE) {
			return Some(Err(e));
		}
		let window = self.window();
		if window.len() < RECORD_HEADER_SIZE || window[4] == 0 {
			return None;
		}
		let key_size = window[5] as usize;
		let value_size = u32::from_be_bytes(window[6..10].try_into().unwrap()) as usize;
		let total = RECORD_HEADER_SIZE + key_size + value_size;
		if self.offset as u64 + total as u64 > self.size as u64 {
			// Runs past the segment ceiling: a torn tail.
			return None;
		}
		if let Err(e) = self.load(total) {
			return Some(Err(e));
		}
		let window = self.window();
		if window.len() < total {
			return None;
		}
		let record = match Record::decode(&window[..total]) {
			Ok(Some(record)) => record.to_owned(),
			Ok(None) => return None,
			Err(e) => return Some(Err(e)),
		};
		let offset = self.offset;
		self.offset += total as u32;
		Some(Ok((offset, record)))
	}
}

/// One replayed index file entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
	pub rtype: RecordType,
	pub offset: u32,
	pub len: u32,
	pub key: Vec<u8>,
}

/// Replays a per-segment index file front to back.
pub struct IndexIterator {
	buf: Vec<u8>,
	pos: usize,
}

impl IndexIterator {
	pub fn new(file: &ReadonlyFile) -> Result<IndexIterator> {
		let mut buf = vec![0u8; file.size() as usize];
		let read = file.read(0, &mut buf)?;
		buf.truncate(read);
		Ok(IndexIterator { buf, pos: 0 })
	}

	pub fn next_entry(&mut self) -> Result<Option<IndexEntry>> {
		match IndexRecord::decode(&self.buf[self.pos..])? {
			Some((record, consumed)) => {
				self.pos += consumed;
				Ok(Some(IndexEntry {
					rtype: record.rtype,
					offset: record.offset,
					len: record.len,
					key: record.key.to_vec(),
				}))
			}
			None => Ok(None),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::options::IoBacking;
	use crate::file::ReadWriteFile;
	use std::sync::Arc;

	struct TempDir(std::path::PathBuf);

	impl TempDir {
		fn new(name: &'static str) -> TempDir {
			env_logger::try_init().ok();
			let mut path = std::env::temp_dir();
			path.push("cask-db-test");
			path.push("iterator");
			path.push(name);

			if path.exists() {
				std::fs::remove_dir_all(&path).unwrap();
			}
			std::fs::create_dir_all(&path).unwrap();
			TempDir(path)
		}
	}

	impl Drop for TempDir {
		fn drop(&mut self) {
			if self.0.exists() {
				std::fs::remove_dir_all(&self.0).unwrap();
			}
		}
	}

	fn segment_with_records(dir: &TempDir, records: &[Record<'_>]) -> DataFile {
		let path = dir.0.join("1.data");
		let file = Arc::new(ReadWriteFile::open(&path, 16 << 10, IoBacking::Buffered).unwrap());
		let mut appender = file.appender();
		for record in records {
			appender
				.append(record.encoded_size() as usize, |buf| record.encode(buf))
				.unwrap()
				.unwrap();
		}
		drop(appender);
		DataFile::Active(file)
	}

	#[test]
	fn scans_all_records() {
		let dir = TempDir::new("scans_all");
		let records: Vec<_> = (0..10u8)
			.map(|i| Record::new(RecordType::Set, b"key", if i % 2 == 0 { b"even" } else { b"odd!" }, i as u32))
			.collect();
		let file = segment_with_records(&dir, &records);

		let mut iter = RecordIterator::new(file);
		let mut offsets = Vec::new();
		let mut count = 0;
		while let Some(next) = iter.next_record() {
			let (offset, record) = next.unwrap();
			assert_eq!(record.timestamp, count as u32);
			assert!(record.validate());
			offsets.push(offset);
			count += 1;
		}
		assert_eq!(count, 10);
		// Records are contiguous from offset zero.
		assert_eq!(offsets[0], 0);
		for pair in offsets.windows(2) {
			assert_eq!(pair[1] - pair[0], records[0].encoded_size());
		}
	}

	#[test]
	fn seek_reads_one_record() {
		let dir = TempDir::new("seek");
		let records: Vec<_> = (0..5u32)
			.map(|i| Record::new(RecordType::Set, b"key", b"value", i))
			.collect();
		let file = segment_with_records(&dir, &records);
		let record_size = records[0].encoded_size();

		let mut iter = RecordIterator::new(file);
		iter.seek(record_size * 3);
		let (offset, record) = iter.next_record().unwrap().unwrap();
		assert_eq!(offset, record_size * 3);
		assert_eq!(record.timestamp, 3);
	}

	#[test]
	fn stops_at_padding() {
		let dir = TempDir::new("padding");
		let records = [Record::new(RecordType::Set, b"key", b"value", 0)];
		let file = segment_with_records(&dir, &records);

		let mut iter = RecordIterator::new(file);
		assert!(iter.next_record().unwrap().is_ok());
		assert!(iter.next_record().is_none());
	}

	#[test]
	fn index_replay() {
		let dir = TempDir::new("index_replay");
		let path = dir.0.join("1.index");
		let mut log = Vec::new();
		for i in 0..20u32 {
			IndexRecord { rtype: RecordType::Set, offset: i * 64, len: 64, key: b"abc" }
				.encode_into(&mut log);
		}
		std::fs::write(&path, &log).unwrap();

		let file = ReadonlyFile::open_mapped(&path).unwrap();
		let mut iter = IndexIterator::new(&file).unwrap();
		let mut count = 0;
		while let Some(entry) = iter.next_entry().unwrap() {
			assert_eq!(entry.offset, count * 64);
			assert_eq!(entry.key, b"abc");
			count += 1;
		}
		assert_eq!(count, 20);
	}
}
