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

//! Embedded log-structured key-value database.
//!
//! All writes append to a segmented on-disk log; an in-memory index maps
//! each key to the location of its latest record. Overwritten and
//! deleted records are reclaimed by background compaction. Reads are
//! served through a block-aligned read cache.

mod cache;
mod compress;
mod db;
mod display;
mod error;
mod file;
mod index;
mod iterator;
mod metadata;
mod options;
mod read_cache;
mod record;
mod segment;
mod worker;

pub use db::{Db, DbIterator, IterEntry};
pub use error::{Error, Result};
pub use options::{
	CompactionOptions, IoBacking, Options, ReadCacheOptions, ReadOptions, WriteOptions,
	DEFAULT_SEGMENT_BYTES,
};
