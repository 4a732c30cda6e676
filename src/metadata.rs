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

// Metadata file layout.
//
// Header:
// [NAME_LEN: 2][NAME]
// Log entries:
// [TYPE: 1][SEGMENT_ID: 4]
// TYPE - 0 creates the segment, 1 deletes it. The live segment set is the
// fold of the log. The file is tiny, every append is fsynced.
//
// The database lives at `<name>.db`; segment files beside it as
// `<name>_<id>.data` and `<name>_<id>.index`.

use std::collections::BTreeSet;
use std::convert::TryInto;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::Mutex;

use crate::{
	error::{Error, Result},
	record::SegmentId,
};

const CREATE_SEGMENT: u8 = 0;
const DELETE_SEGMENT: u8 = 1;

struct MetaState {
	file: std::fs::File,
	files: BTreeSet<SegmentId>,
}

/// Keeps the ordered set of live segment ids durable. Holds an exclusive
/// lock on the metadata file for the lifetime of the handle, so a database
/// can only be opened once.
pub struct MetadataManager {
	name: String,
	state: Mutex<MetaState>,
}

impl MetadataManager {
	pub fn open(path: &Path) -> Result<MetadataManager> {
		let full = path
			.to_str()
			.ok_or_else(|| Error::InvalidArgument(format!("database path {:?} is not unicode", path)))?;
		if !full.ends_with(".db") || full.len() == 3 {
			return Err(Error::InvalidArgument(format!(
				"database path {} does not end in .db",
				full
			)));
		}
		let name = full[..full.len() - 3].to_string();

		let mut file = std::fs::OpenOptions::new()
			.read(true)
			.append(true)
			.create(true)
			.open(path)?;
		file.try_lock_exclusive()
			.map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("database {} is locked", full))))?;

		let mut buf = Vec::new();
		file.read_to_end(&mut buf)?;

		let mut files = BTreeSet::new();
		let name = if buf.is_empty() {
			log::info!(target: "cask-db", "creating database {}", name);
			let mut header = Vec::with_capacity(2 + name.len());
			header.extend_from_slice(&(name.len() as u16).to_be_bytes());
			header.extend_from_slice(name.as_bytes());
			file.write_all(&header)?;
			file.sync_data()?;
			name
		} else {
			let name = Self::replay(&buf, &mut files)?;
			log::info!(target: "cask-db", "opened database {} with {} segments", name, files.len());
			name
		};

		Ok(MetadataManager { name, state: Mutex::new(MetaState { file, files }) })
	}

	fn replay(buf: &[u8], files: &mut BTreeSet<SegmentId>) -> Result<String> {
		if buf.len() < 2 {
			return Err(Error::Corruption("metadata header is truncated".into()));
		}
		let name_len = u16::from_be_bytes(buf[0..2].try_into().unwrap()) as usize;
		if buf.len() < 2 + name_len {
			return Err(Error::Corruption("metadata header is truncated".into()));
		}
		let name = String::from_utf8(buf[2..2 + name_len].to_vec())
			.map_err(|_| Error::Corruption("metadata name is not unicode".into()))?;

		let mut rest = &buf[2 + name_len..];
		while !rest.is_empty() {
			if rest.len() < 5 {
				return Err(Error::Corruption("metadata log entry is truncated".into()));
			}
			let id = u32::from_be_bytes(rest[1..5].try_into().unwrap());
			match rest[0] {
				CREATE_SEGMENT => {
					files.insert(id);
				}
				DELETE_SEGMENT => {
					files.remove(&id);
				}
				t => {
					return Err(Error::Corruption(format!("unknown metadata entry type {}", t)))
				}
			}
			rest = &rest[5..];
		}
		Ok(name)
	}

	fn append(state: &mut MetaState, entry_type: u8, id: SegmentId) -> Result<()> {
		let mut entry = [0u8; 5];
		entry[0] = entry_type;
		entry[1..5].copy_from_slice(&id.to_be_bytes());
		state.file.write_all(&entry)?;
		state.file.sync_data()?;
		Ok(())
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Live segment ids in ascending order.
	pub fn files(&self) -> Vec<SegmentId> {
		self.state.lock().files.iter().copied().collect()
	}

	pub fn last(&self) -> Option<SegmentId> {
		self.state.lock().files.iter().next_back().copied()
	}

	pub fn create(&self, id: SegmentId) -> Result<()> {
		let mut state = self.state.lock();
		if !state.files.insert(id) {
			return Ok(());
		}
		Self::append(&mut state, CREATE_SEGMENT, id)
	}

	pub fn delete(&self, id: SegmentId) -> Result<()> {
		let mut state = self.state.lock();
		if !state.files.remove(&id) {
			return Ok(());
		}
		Self::append(&mut state, DELETE_SEGMENT, id)
	}

	pub fn data_path(&self, id: SegmentId) -> PathBuf {
		PathBuf::from(format!("{}_{}.data", self.name, id))
	}

	pub fn index_path(&self, id: SegmentId) -> PathBuf {
		PathBuf::from(format!("{}_{}.index", self.name, id))
	}
}
