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

// On disk data record layout.
//
// [CHECKSUM: 4][TYPE: 1][KEY_SIZE: 1][VALUE_SIZE: 4][TIMESTAMP: 4][KEY][VALUE]
//
// All integers are big-endian, the header is packed with no padding.
// CHECKSUM - crc32 over KEY and VALUE.
// TYPE - 1 for a set, 2 for a delete. A delete record carries an empty
// value. A zero TYPE byte never occurs in a written record; decoding one
// means the scan has reached the preallocated tail of the segment.

use std::convert::TryInto;

use crate::error::{Error, Result};

pub type SegmentId = u32;

pub const RECORD_HEADER_SIZE: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
	Set = 1,
	Delete = 2,
}

impl RecordType {
	pub fn from_u8(t: u8) -> Option<RecordType> {
		match t {
			1 => Some(RecordType::Set),
			2 => Some(RecordType::Delete),
			_ => None,
		}
	}
}

/// Physical position of a data record. The lexicographic order of
/// `(segment, offset)` is the version order of a key: the largest
/// location holds the authoritative record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
	pub segment: SegmentId,
	pub offset: u32,
}

impl Location {
	pub fn new(segment: SegmentId, offset: u32) -> Location {
		Location { segment, offset }
	}
}

impl std::fmt::Display for Location {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.segment, self.offset)
	}
}

pub fn checksum(key: &[u8], value: &[u8]) -> u32 {
	let mut hasher = crc32fast::Hasher::new();
	hasher.update(key);
	hasher.update(value);
	hasher.finalize()
}

/// A data record borrowing its key and value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
	pub checksum: u32,
	pub rtype: RecordType,
	pub key: &'a [u8],
	pub value: &'a [u8],
	pub timestamp: u32,
}

impl<'a> Record<'a> {
	pub fn new(rtype: RecordType, key: &'a [u8], value: &'a [u8], timestamp: u32) -> Record<'a> {
		Record {
			checksum: checksum(key, value),
			rtype,
			key,
			value,
			timestamp,
		}
	}

	pub fn encoded_size(&self) -> u32 {
		(RECORD_HEADER_SIZE + self.key.len() + self.value.len()) as u32
	}

	/// `buf` must be exactly `encoded_size()` bytes.
	pub fn encode(&self, buf: &mut [u8]) {
		debug_assert_eq!(buf.len(), self.encoded_size() as usize);
		buf[0..4].copy_from_slice(&self.checksum.to_be_bytes());
		buf[4] = self.rtype as u8;
		buf[5] = self.key.len() as u8;
		buf[6..10].copy_from_slice(&(self.value.len() as u32).to_be_bytes());
		buf[10..14].copy_from_slice(&self.timestamp.to_be_bytes());
		let key_end = RECORD_HEADER_SIZE + self.key.len();
		buf[RECORD_HEADER_SIZE..key_end].copy_from_slice(self.key);
		buf[key_end..key_end + self.value.len()].copy_from_slice(self.value);
	}

	/// Decodes one record from the head of `buf`. Returns `Ok(None)` when
	/// fewer bytes remain than the record needs, or when the type byte is
	/// zero (preallocated tail). An unknown non-zero type byte is corruption.
	pub fn decode(buf: &'a [u8]) -> Result<Option<Record<'a>>> {
		if buf.len() < RECORD_HEADER_SIZE {
			return Ok(None);
		}
		let rtype = match buf[4] {
			0 => return Ok(None),
			t => RecordType::from_u8(t)
				.ok_or_else(|| Error::Corruption(format!("unknown record type {}", t)))?,
		};
		let key_size = buf[5] as usize;
		let value_size = u32::from_be_bytes(buf[6..10].try_into().unwrap()) as usize;
		if buf.len() < RECORD_HEADER_SIZE + key_size + value_size {
			return Ok(None);
		}
		let key_end = RECORD_HEADER_SIZE + key_size;
		Ok(Some(Record {
			checksum: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
			rtype,
			key: &buf[RECORD_HEADER_SIZE..key_end],
			value: &buf[key_end..key_end + value_size],
			timestamp: u32::from_be_bytes(buf[10..14].try_into().unwrap()),
		}))
	}

	/// Recomputes the checksum over key and value.
	pub fn validate(&self) -> bool {
		checksum(self.key, self.value) == self.checksum
	}

	pub fn to_owned(&self) -> OwnedRecord {
		OwnedRecord {
			checksum: self.checksum,
			rtype: self.rtype,
			key: self.key.to_vec(),
			value: self.value.to_vec(),
			timestamp: self.timestamp,
		}
	}
}

/// A decoded record owning its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedRecord {
	pub checksum: u32,
	pub rtype: RecordType,
	pub key: Vec<u8>,
	pub value: Vec<u8>,
	pub timestamp: u32,
}

impl OwnedRecord {
	pub fn as_record(&self) -> Record<'_> {
		Record {
			checksum: self.checksum,
			rtype: self.rtype,
			key: &self.key,
			value: &self.value,
			timestamp: self.timestamp,
		}
	}

	pub fn encoded_size(&self) -> u32 {
		(RECORD_HEADER_SIZE + self.key.len() + self.value.len()) as u32
	}

	pub fn validate(&self) -> bool {
		checksum(&self.key, &self.value) == self.checksum
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn encode_decode() {
		let record = Record::new(RecordType::Set, b"key", b"value", 7);
		let mut buf = vec![0u8; record.encoded_size() as usize];
		record.encode(&mut buf);

		let decoded = Record::decode(&buf).unwrap().unwrap();
		assert_eq!(decoded, record);
		assert!(decoded.validate());
	}

	#[test]
	fn delete_has_empty_value() {
		let record = Record::new(RecordType::Delete, b"key", b"", 0);
		let mut buf = vec![0u8; record.encoded_size() as usize];
		record.encode(&mut buf);

		let decoded = Record::decode(&buf).unwrap().unwrap();
		assert_eq!(decoded.rtype, RecordType::Delete);
		assert!(decoded.value.is_empty());
	}

	#[test]
	fn partial_input() {
		let record = Record::new(RecordType::Set, b"key", b"value", 0);
		let mut buf = vec![0u8; record.encoded_size() as usize];
		record.encode(&mut buf);

		for cut in 0..buf.len() {
			assert!(Record::decode(&buf[..cut]).unwrap().is_none());
		}
	}

	#[test]
	fn padding_is_end() {
		assert!(Record::decode(&[0u8; 64]).unwrap().is_none());
	}

	#[test]
	fn unknown_type_is_corruption() {
		let record = Record::new(RecordType::Set, b"key", b"value", 0);
		let mut buf = vec![0u8; record.encoded_size() as usize];
		record.encode(&mut buf);
		buf[4] = 9;
		assert!(Record::decode(&buf).is_err());
	}

	#[test]
	fn checksum_catches_flip() {
		let record = Record::new(RecordType::Set, b"key", b"value", 0);
		let mut buf = vec![0u8; record.encoded_size() as usize];
		record.encode(&mut buf);
		buf[RECORD_HEADER_SIZE + 4] ^= 0x01;

		let decoded = Record::decode(&buf).unwrap().unwrap();
		assert!(!decoded.validate());
	}

	#[test]
	fn location_order() {
		assert!(Location::new(1, 100) < Location::new(1, 200));
		assert!(Location::new(1, 200) < Location::new(2, 0));
	}
}
