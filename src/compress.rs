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

// Values are stored snappy-compressed when `Options::compress_value` is set.
// The engine treats the codec as opaque.

use crate::error::{Error, Result};

pub fn compress(value: &[u8]) -> Result<Vec<u8>> {
	snap::raw::Encoder::new()
		.compress_vec(value)
		.map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
}

pub fn uncompress(value: &[u8]) -> Result<Vec<u8>> {
	snap::raw::Decoder::new()
		.decompress_vec(value)
		.map_err(|e| Error::Corruption(format!("value decompression failed: {}", e)))
}

#[cfg(test)]
mod test {
	use super::{compress, uncompress};

	#[test]
	fn roundtrip() {
		let value = b"the quick brown fox jumps over the lazy dog".to_vec();
		let packed = compress(&value).unwrap();
		assert_eq!(uncompress(&packed).unwrap(), value);
	}

	#[test]
	fn empty_value() {
		let packed = compress(b"").unwrap();
		assert_eq!(uncompress(&packed).unwrap(), Vec::<u8>::new());
	}

	#[test]
	fn garbage_is_corruption() {
		assert!(uncompress(b"\xff\xff\xff\xff").is_err());
	}
}
