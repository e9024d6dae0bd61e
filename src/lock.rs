//! Multi-key atomic regions.
//!
//! Keys are grouped by segment and each distinct segment is write-locked once,
//! in ascending index order. Two threads locking overlapping key sets always
//! contend in the same order and cannot deadlock each other.

use std::collections::BTreeSet;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLockWriteGuard;
use tracing::debug;

use crate::entry::{Entry, now_millis};
use crate::error::{Result, StoreError};
use crate::hash::hash_key;
use crate::listener::Departure;
use crate::metrics::Counters;
use crate::segment::{Node, Table};
use crate::store::SegmentedStore;
use crate::substitute::SubstituteFactory;

/// Write locks on every segment owning one of a set of keys.
///
/// The segment locks are not reentrant, so while the guard is alive the
/// locked keys must be accessed through the guard rather than the store.
/// Dropping the guard releases the locks; listeners for entries removed
/// through it are notified afterwards.
pub struct KeysGuard<'a, K, V, F: SubstituteFactory<K, V>> {
	store: &'a SegmentedStore<K, V, F>,
	locked: Vec<(usize, RwLockWriteGuard<'a, Table<K, V, F::Substitute>>)>,
	departed: Vec<Node<K, V, F::Substitute>>,
}

impl<K, V, F> SegmentedStore<K, V, F>
where
	K: Hash + Eq + Clone + Send + Sync + 'static,
	V: Send + Sync + 'static,
	F: SubstituteFactory<K, V>,
{
	fn segments_of<'k>(&self, keys: impl IntoIterator<Item = &'k K>) -> BTreeSet<usize>
	where
		K: 'k,
	{
		keys.into_iter().map(|key| self.segment_index(key)).collect()
	}

	/// Write-lock the segments owning `keys`, blocking as long as it takes.
	pub fn lock_keys<'k>(&self, keys: impl IntoIterator<Item = &'k K>) -> Result<KeysGuard<'_, K, V, F>>
	where
		K: 'k,
	{
		self.check_alive()?;
		let locked = self
			.segments_of(keys)
			.into_iter()
			.map(|index| (index, self.segment(index).write()))
			.collect();
		Ok(KeysGuard {
			store: self,
			locked,
			departed: Vec::new(),
		})
	}

	/// Write-lock the segments owning `keys`, giving up after `timeout`.
	///
	/// On timeout every lock already taken is released before
	/// [`StoreError::Timeout`] is returned.
	pub fn try_lock_keys<'k>(
		&self,
		keys: impl IntoIterator<Item = &'k K>,
		timeout: Duration,
	) -> Result<KeysGuard<'_, K, V, F>>
	where
		K: 'k,
	{
		self.check_alive()?;
		let deadline = Instant::now() + timeout;
		let indices = self.segments_of(keys);
		let mut locked = Vec::with_capacity(indices.len());
		for index in indices.iter().copied() {
			match self.segment(index).try_write_until(deadline) {
				Some(table) => locked.push((index, table)),
				None => {
					let held = locked.len();
					drop(locked);
					debug!(store = %self.name(), segment = index, held, "bulk lock timed out");
					return Err(StoreError::Timeout(timeout, indices.len()));
				}
			}
		}
		Ok(KeysGuard {
			store: self,
			locked,
			departed: Vec::new(),
		})
	}
}

impl<K, V, F> KeysGuard<'_, K, V, F>
where
	K: Hash + Eq + Clone + Send + Sync + 'static,
	V: Send + Sync + 'static,
	F: SubstituteFactory<K, V>,
{
	/// Indices of the locked segments, ascending.
	pub fn segments(&self) -> Vec<usize> {
		self.locked.iter().map(|(index, _)| *index).collect()
	}

	fn position(&self, key: &K) -> Result<(u32, usize)> {
		let hash = hash_key(key);
		let index = self.store.segment_index(key);
		self.locked
			.binary_search_by_key(&index, |(locked, _)| *locked)
			.map(|position| (hash, position))
			.map_err(|_| StoreError::NotLocked(index))
	}

	/// Read a locked key without recording statistics. Expired entries read as
	/// absent.
	pub fn get(&self, key: &K) -> Result<Option<Arc<Entry<K, V>>>> {
		let (hash, position) = self.position(key)?;
		let table = &self.locked[position].1;
		let entry = table.find(key, hash).and_then(|node| self.store.materialize(key, &node.repr));
		let now = now_millis();
		Ok(entry.filter(|entry| !entry.is_expired_at(now)))
	}

	/// Insert or overwrite a locked key. Returns `true` if it was absent.
	///
	/// Only the growth over the bytes the key already holds is reserved. Pool
	/// eviction triggered here only try-locks segments, so it skips the ones
	/// this guard holds; listeners for entries it evicts elsewhere run before
	/// this call returns, with the guard's locks still held.
	pub fn put(&mut self, entry: Entry<K, V>) -> Result<bool> {
		let store = self.store;
		let (hash, position) = self.position(entry.key())?;
		let entry = Arc::new(entry);
		let size = store.measure(&entry);
		let key = entry.key().clone();

		let segment = store.segment(self.locked[position].0);
		let table = &mut self.locked[position].1;
		let held = table.find(&key, hash).map_or(0, |node| node.size);
		let charged = store.reserve(size.saturating_sub(held))?;
		if let Some(node) = table.find(&key, hash)
			&& let Some(previous) = store.materialize(&key, &node.repr)
		{
			entry.mark_replacing(previous.version(), now_millis());
		}
		let repr = store.factory().create(&key, Arc::clone(&entry));
		match segment.put_locked(table, key, hash, repr, size) {
			Some((old_repr, old_size)) => {
				store.settle(charged, old_size, size);
				store.free_repr(&old_repr);
				Counters::bump(&store.counters().updates);
				Ok(false)
			}
			None => {
				Counters::bump(&store.counters().puts);
				Ok(true)
			}
		}
	}

	/// Remove a locked key.
	pub fn remove(&mut self, key: &K) -> Result<Option<Arc<Entry<K, V>>>> {
		let store = self.store;
		let (hash, position) = self.position(key)?;
		let segment = store.segment(self.locked[position].0);
		let table = &mut self.locked[position].1;
		let Some(node) = segment.remove_locked(table, key, hash, |_| true) else {
			return Ok(None);
		};
		let entry = store.materialize(key, &node.repr);
		store.release(node.size);
		Counters::bump(&store.counters().removals);
		self.departed.push(node);
		Ok(entry)
	}
}

impl<K, V, F: SubstituteFactory<K, V>> Drop for KeysGuard<'_, K, V, F> {
	fn drop(&mut self) {
		self.locked.clear();
		for node in self.departed.drain(..) {
			self.store.depart(node, Departure::Removed);
		}
	}
}
