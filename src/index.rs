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

// On disk index record layout.
//
// [TYPE: 1][OFFSET: 4][LEN: 4][KEY_SIZE: 1][KEY]
//
// One index record mirrors one data record minus the value payload:
// OFFSET is the data record's offset in the segment's data file and LEN
// its full encoded length. Index files are dense and ordered by OFFSET;
// the append happens under the data file's write lock.

use std::convert::TryInto;

use crate::{
	error::{Error, Result},
	record::{Location, RecordType},
};

pub const INDEX_HEADER_SIZE: usize = 10;

/// Key-index payload: where the authoritative record of a key lives and
/// how many bytes it occupies there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dir {
	pub loc: Location,
	pub entry_size: u32,
}

/// An index record borrowing its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord<'a> {
	pub rtype: RecordType,
	pub offset: u32,
	pub len: u32,
	pub key: &'a [u8],
}

impl<'a> IndexRecord<'a> {
	pub fn encoded_size(&self) -> usize {
		INDEX_HEADER_SIZE + self.key.len()
	}

	pub fn encode_into(&self, out: &mut Vec<u8>) {
		out.push(self.rtype as u8);
		out.extend_from_slice(&self.offset.to_be_bytes());
		out.extend_from_slice(&self.len.to_be_bytes());
		out.push(self.key.len() as u8);
		out.extend_from_slice(self.key);
	}

	/// Decodes one record from the head of `buf`, returning it with the
	/// number of bytes consumed. `Ok(None)` when `buf` holds no complete
	/// record.
	pub fn decode(buf: &'a [u8]) -> Result<Option<(IndexRecord<'a>, usize)>> {
		if buf.len() < INDEX_HEADER_SIZE {
			return Ok(None);
		}
		let rtype = RecordType::from_u8(buf[0])
			.ok_or_else(|| Error::Corruption(format!("unknown index record type {}", buf[0])))?;
		let key_size = buf[9] as usize;
		if buf.len() < INDEX_HEADER_SIZE + key_size {
			return Ok(None);
		}
		let record = IndexRecord {
			rtype,
			offset: u32::from_be_bytes(buf[1..5].try_into().unwrap()),
			len: u32::from_be_bytes(buf[5..9].try_into().unwrap()),
			key: &buf[INDEX_HEADER_SIZE..INDEX_HEADER_SIZE + key_size],
		};
		Ok(Some((record, INDEX_HEADER_SIZE + key_size)))
	}
}
