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

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;

use crate::error::Result;

const NIL: usize = usize::MAX;

struct Entry<K, V> {
	key: K,
	value: V,
	prev: usize,
	next: usize,
}

/// Fixed-capacity LRU map. All operations are O(1); inserting into a full
/// cache evicts the least recently used entry. A capacity of zero caches
/// nothing.
pub struct LruCache<K, V> {
	map: HashMap<K, usize>,
	slots: Vec<Option<Entry<K, V>>>,
	free: Vec<usize>,
	head: usize,
	tail: usize,
	capacity: usize,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
	pub fn new(capacity: usize) -> LruCache<K, V> {
		LruCache {
			map: HashMap::with_capacity(capacity),
			slots: Vec::with_capacity(capacity),
			free: Vec::new(),
			head: NIL,
			tail: NIL,
			capacity,
		}
	}

	pub fn len(&self) -> usize {
		self.map.len()
	}

	fn detach(&mut self, slot: usize) {
		let (prev, next) = {
			let entry = self.slots[slot].as_ref().unwrap();
			(entry.prev, entry.next)
		};
		match prev {
			NIL => self.head = next,
			p => self.slots[p].as_mut().unwrap().next = next,
		}
		match next {
			NIL => self.tail = prev,
			n => self.slots[n].as_mut().unwrap().prev = prev,
		}
	}

	fn attach_front(&mut self, slot: usize) {
		{
			let entry = self.slots[slot].as_mut().unwrap();
			entry.prev = NIL;
			entry.next = self.head;
		}
		match self.head {
			NIL => self.tail = slot,
			h => self.slots[h].as_mut().unwrap().prev = slot,
		}
		self.head = slot;
	}

	pub fn get(&mut self, key: &K) -> Option<&V> {
		let slot = *self.map.get(key)?;
		self.detach(slot);
		self.attach_front(slot);
		Some(&self.slots[slot].as_ref().unwrap().value)
	}

	pub fn remove(&mut self, key: &K) -> Option<V> {
		let slot = self.map.remove(key)?;
		self.detach(slot);
		self.free.push(slot);
		Some(self.slots[slot].take().unwrap().value)
	}

	/// Drops the least recently used entry.
	pub fn evict(&mut self) -> Option<(K, V)> {
		let slot = self.tail;
		if slot == NIL {
			return None;
		}
		self.detach(slot);
		self.free.push(slot);
		let entry = self.slots[slot].take().unwrap();
		self.map.remove(&entry.key);
		Some((entry.key, entry.value))
	}

	pub fn put(&mut self, key: K, value: V) {
		if self.capacity == 0 {
			return;
		}
		if let Some(&slot) = self.map.get(&key) {
			self.detach(slot);
			self.attach_front(slot);
			self.slots[slot].as_mut().unwrap().value = value;
			return;
		}
		if self.map.len() == self.capacity {
			self.evict();
		}
		let entry = Entry { key: key.clone(), value, prev: NIL, next: NIL };
		let slot = match self.free.pop() {
			Some(slot) => {
				self.slots[slot] = Some(entry);
				slot
			}
			None => {
				self.slots.push(Some(entry));
				self.slots.len() - 1
			}
		};
		self.attach_front(slot);
		self.map.insert(key, slot);
	}
}

fn shard_of<K: Hash>(key: &K, shards: usize) -> usize {
	let mut hasher = std::collections::hash_map::DefaultHasher::new();
	key.hash(&mut hasher);
	hasher.finish() as usize % shards
}

/// An LRU split into independently locked shards. Operations on one shard
/// never block another.
pub struct ShardedCache<K, V> {
	shards: Vec<Mutex<LruCache<K, V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> ShardedCache<K, V> {
	pub fn new(shards: usize, capacity_per_shard: usize) -> ShardedCache<K, V> {
		let shards = shards.max(1);
		ShardedCache {
			shards: (0..shards).map(|_| Mutex::new(LruCache::new(capacity_per_shard))).collect(),
		}
	}

	fn shard(&self, key: &K) -> &Mutex<LruCache<K, V>> {
		&self.shards[shard_of(key, self.shards.len())]
	}

	pub fn get(&self, key: &K) -> Option<V> {
		self.shard(key).lock().get(key).cloned()
	}

	pub fn put(&self, key: K, value: V) {
		self.shard(&key).lock().put(key, value);
	}

	pub fn remove(&self, key: &K) -> Option<V> {
		self.shard(key).lock().remove(key)
	}

	/// Looks `key` up and, on a miss, runs `loader` while still holding the
	/// shard lock, installing its result. Concurrent misses for keys of the
	/// same shard serialize, so a given key is loaded once (single-flight
	/// per shard). `loader` runs under the lock and must not reenter the
	/// cache.
	pub fn get_or_compute<F>(&self, key: K, loader: F) -> Result<V>
	where
		F: FnOnce() -> Result<V>,
	{
		let mut shard = self.shard(&key).lock();
		if let Some(value) = shard.get(&key) {
			return Ok(value.clone());
		}
		let value = loader()?;
		shard.put(key, value.clone());
		Ok(value)
	}
}
