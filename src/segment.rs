use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::substitute::Repr;

/// A slot in a bucket chain.
pub(crate) struct Node<K, V, S> {
	pub key: K,
	pub hash: u32,
	pub repr: Repr<K, V, S>,
	/// Bytes charged to the pool for this key.
	pub size: u64,
}

/// Bucket array of one segment. Only reachable through the segment's lock.
pub(crate) struct Table<K, V, S> {
	buckets: Vec<Vec<Node<K, V, S>>>,
	threshold: usize,
}

impl<K: Eq, V, S> Table<K, V, S> {
	fn with_capacity(capacity: usize, load_factor: f32) -> Self {
		let capacity = capacity.max(1).next_power_of_two();
		let mut buckets = Vec::with_capacity(capacity);
		buckets.resize_with(capacity, Vec::new);
		Self {
			buckets,
			threshold: (capacity as f32 * load_factor) as usize,
		}
	}

	#[inline]
	fn bucket_index(&self, hash: u32) -> usize {
		hash as usize & (self.buckets.len() - 1)
	}

	pub fn find(&self, key: &K, hash: u32) -> Option<&Node<K, V, S>> {
		self.buckets[self.bucket_index(hash)].iter().find(|node| node.hash == hash && node.key == *key)
	}

	pub fn find_mut(&mut self, key: &K, hash: u32) -> Option<&mut Node<K, V, S>> {
		let index = self.bucket_index(hash);
		self.buckets[index].iter_mut().find(|node| node.hash == hash && node.key == *key)
	}

	pub fn nodes(&self) -> impl Iterator<Item = &Node<K, V, S>> {
		self.buckets.iter().flatten()
	}

	/// Number of buckets.
	#[cfg(test)]
	pub fn capacity(&self) -> usize {
		self.buckets.len()
	}

	fn rehash(&mut self, load_factor: f32) {
		let capacity = self.buckets.len() * 2;
		let mut buckets: Vec<Vec<Node<K, V, S>>> = Vec::with_capacity(capacity);
		buckets.resize_with(capacity, Vec::new);
		for node in self.buckets.drain(..).flatten() {
			let index = node.hash as usize & (capacity - 1);
			buckets[index].push(node);
		}
		self.buckets = buckets;
		self.threshold = (capacity as f32 * load_factor) as usize;
	}
}

/// One independently locked shard of a store.
///
/// `count` and `mod_count` are written under the write lock with release
/// ordering and may be read without any lock; a reader that sees them with
/// acquire ordering sees every structural change they account for. The tier
/// counters follow the same rule.
pub(crate) struct Segment<K, V, S> {
	table: RwLock<Table<K, V, S>>,
	count: AtomicUsize,
	mod_count: AtomicU64,
	substitute_count: AtomicUsize,
	bytes: AtomicU64,
	substitute_bytes: AtomicU64,
	load_factor: f32,
}

impl<K: Eq, V, S> Segment<K, V, S> {
	pub fn new(initial_capacity: usize, load_factor: f32) -> Self {
		Self {
			table: RwLock::new(Table::with_capacity(initial_capacity, load_factor)),
			count: AtomicUsize::new(0),
			mod_count: AtomicU64::new(0),
			substitute_count: AtomicUsize::new(0),
			bytes: AtomicU64::new(0),
			substitute_bytes: AtomicU64::new(0),
			load_factor,
		}
	}

	/// Number of keys held.
	#[inline]
	pub fn count(&self) -> usize {
		self.count.load(Ordering::Acquire)
	}

	/// Structural modification counter.
	#[inline]
	pub fn mod_count(&self) -> u64 {
		self.mod_count.load(Ordering::Acquire)
	}

	pub fn substitute_count(&self) -> usize {
		self.substitute_count.load(Ordering::Acquire)
	}

	/// Bytes charged for all keys held.
	pub fn bytes(&self) -> u64 {
		self.bytes.load(Ordering::Acquire)
	}

	/// Bytes charged for keys currently held as substitutes.
	pub fn substitute_bytes(&self) -> u64 {
		self.substitute_bytes.load(Ordering::Acquire)
	}

	pub fn read(&self) -> RwLockReadGuard<'_, Table<K, V, S>> {
		self.table.read()
	}

	pub fn try_read(&self) -> Option<RwLockReadGuard<'_, Table<K, V, S>>> {
		self.table.try_read()
	}

	pub fn write(&self) -> RwLockWriteGuard<'_, Table<K, V, S>> {
		self.table.write()
	}

	pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, Table<K, V, S>>> {
		self.table.try_write()
	}

	pub fn try_write_until(&self, deadline: Instant) -> Option<RwLockWriteGuard<'_, Table<K, V, S>>> {
		self.table.try_write_until(deadline)
	}

	fn track(&self, repr: &Repr<K, V, S>, size: u64, added: bool) {
		let apply = |counter: &AtomicU64| {
			if added {
				counter.fetch_add(size, Ordering::Release);
			} else {
				counter.fetch_sub(size, Ordering::Release);
			}
		};
		apply(&self.bytes);
		if repr.is_substitute() {
			apply(&self.substitute_bytes);
			if added {
				self.substitute_count.fetch_add(1, Ordering::Release);
			} else {
				self.substitute_count.fetch_sub(1, Ordering::Release);
			}
		}
	}

	/// Insert or overwrite the node for `key`. Returns the replaced
	/// representation and its size.
	pub fn put_locked(
		&self,
		table: &mut Table<K, V, S>,
		key: K,
		hash: u32,
		repr: Repr<K, V, S>,
		size: u64,
	) -> Option<(Repr<K, V, S>, u64)> {
		self.track(&repr, size, true);
		if let Some(node) = table.find_mut(&key, hash) {
			let old_repr = std::mem::replace(&mut node.repr, repr);
			let old_size = std::mem::replace(&mut node.size, size);
			self.track(&old_repr, old_size, false);
			return Some((old_repr, old_size));
		}

		let index = table.bucket_index(hash);
		table.buckets[index].push(Node {
			key,
			hash,
			repr,
			size,
		});
		let count = self.count.load(Ordering::Relaxed) + 1;
		if count > table.threshold {
			table.rehash(self.load_factor);
		}
		self.mod_count.fetch_add(1, Ordering::Release);
		self.count.store(count, Ordering::Release);
		None
	}

	/// Remove the node for `key` if `matches` accepts its representation.
	pub fn remove_locked(
		&self,
		table: &mut Table<K, V, S>,
		key: &K,
		hash: u32,
		matches: impl FnOnce(&Repr<K, V, S>) -> bool,
	) -> Option<Node<K, V, S>> {
		let index = table.bucket_index(hash);
		let bucket = &mut table.buckets[index];
		let position = bucket.iter().position(|node| node.hash == hash && node.key == *key)?;
		if !matches(&bucket[position].repr) {
			return None;
		}
		let node = bucket.swap_remove(position);
		self.track(&node.repr, node.size, false);
		self.mod_count.fetch_add(1, Ordering::Release);
		self.count.store(self.count.load(Ordering::Relaxed) - 1, Ordering::Release);
		Some(node)
	}

	/// Swap the representation for `key` if the current one is
	/// reference-equal to `expected`. Returns whether the swap happened.
	pub fn fault_locked(
		&self,
		table: &mut Table<K, V, S>,
		key: &K,
		hash: u32,
		expected: &Repr<K, V, S>,
		new: Repr<K, V, S>,
	) -> bool {
		let Some(node) = table.find_mut(key, hash) else {
			return false;
		};
		if !node.repr.ptr_eq(expected) {
			return false;
		}
		let size = node.size;
		let old = std::mem::replace(&mut node.repr, new);
		self.track(&node.repr, size, true);
		self.track(&old, size, false);
		true
	}

	/// Remove every node.
	pub fn clear_locked(&self, table: &mut Table<K, V, S>) -> Vec<Node<K, V, S>> {
		let nodes: Vec<_> = table.buckets.iter_mut().flat_map(|bucket| bucket.drain(..)).collect();
		if !nodes.is_empty() {
			self.bytes.store(0, Ordering::Release);
			self.substitute_bytes.store(0, Ordering::Release);
			self.substitute_count.store(0, Ordering::Release);
			self.mod_count.fetch_add(1, Ordering::Release);
			self.count.store(0, Ordering::Release);
		}
		nodes
	}

	/// Append up to `want - out.len()` nodes accepted by `filter`, walking
	/// buckets from `seed`. Skips the segment if its lock is contended.
	pub fn add_random_sample<T>(
		&self,
		filter: &mut impl FnMut(&Node<K, V, S>) -> Option<T>,
		want: usize,
		seed: usize,
		out: &mut Vec<T>,
	) {
		if self.count() == 0 || out.len() >= want {
			return;
		}
		let Some(table) = self.try_read() else {
			return;
		};
		let len = table.buckets.len();
		for offset in 0..len {
			for node in &table.buckets[(seed.wrapping_add(offset)) & (len - 1)] {
				if let Some(sample) = filter(node) {
					out.push(sample);
					if out.len() >= want {
						return;
					}
				}
			}
		}
	}
}
