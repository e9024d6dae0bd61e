use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::RwLockWriteGuard;
use tracing::{debug, trace, warn};

use crate::entry::{Entry, now_millis};
use crate::error::{PoolError, Result, StoreError};
use crate::hash::{hash_key, segment_index};
use crate::listener::{Departure, StoreListener};
use crate::metrics::{Counters, StoreMetrics};
use crate::pool::{PoolAccessor, PoolParticipant, Tier};
use crate::segment::{Node, Segment, Table};
use crate::substitute::{Repr, SubstituteFactory};
use crate::traits::{PoolableStore, Status, Store};

/// Optimistic passes over the segment counters before `size` locks them all.
const RETRIES_BEFORE_LOCK: usize = 2;

/// Representation held by a store built on factory `F`.
pub type StoreRepr<K, V, F> = Repr<K, V, <F as SubstituteFactory<K, V>>::Substitute>;

/// A concurrent map of keys to entries or substitutes, split into a fixed
/// number of independently locked segments.
///
/// Keys route to a segment by the top bits of their spread hash. Writes
/// reserve bytes from the store's pool before taking the segment lock and
/// release replaced bytes after dropping it, so pool eviction never runs under
/// one of this store's locks.
///
/// Built with [`StoreBuilder`](crate::StoreBuilder).
///
/// # Example
///
/// ```
/// use tierpool::{Entry, IdentityFactory, Store, StoreBuilder};
///
/// let store = StoreBuilder::<&str, i32>::new("sessions").segments(16).build(IdentityFactory::new());
///
/// assert!(store.put(Entry::new("a", 1)).unwrap());
/// assert!(!store.put(Entry::new("a", 2)).unwrap());
/// assert_eq!(*store.get(&"a").unwrap().unwrap().value(), 2);
/// assert_eq!(store.size(), 1);
/// ```
pub struct SegmentedStore<K, V, F: SubstituteFactory<K, V>> {
	name: String,
	segments: Box<[Segment<K, V, F::Substitute>]>,
	segment_shift: u32,
	factory: Arc<F>,
	accessor: Option<PoolAccessor<K, V>>,
	listeners: Vec<Arc<dyn StoreListener<K, V>>>,
	status: AtomicU8,
	counters: Counters,
	sample_size: usize,
}

impl<K, V, F: SubstituteFactory<K, V>> SegmentedStore<K, V, F> {
	pub(crate) fn free_repr(&self, repr: &StoreRepr<K, V, F>) {
		if let Repr::Substitute(substitute) = repr {
			self.factory.free(substitute);
		}
	}

	/// Finish off a node that has left its segment: free its substitute and
	/// tell listeners. Must be called without segment locks held.
	pub(crate) fn depart(&self, node: Node<K, V, F::Substitute>, departure: Departure) {
		if !self.listeners.is_empty() {
			let entry = node.repr.as_entry();
			for listener in &self.listeners {
				departure.notify(listener.as_ref(), &self.name, &node.key, entry);
			}
		}
		self.free_repr(&node.repr);
	}
}

impl<K, V, F> SegmentedStore<K, V, F>
where
	K: Hash + Eq + Clone + Send + Sync + 'static,
	V: Send + Sync + 'static,
	F: SubstituteFactory<K, V>,
{
	pub(crate) fn new(
		name: String,
		segments: Box<[Segment<K, V, F::Substitute>]>,
		segment_shift: u32,
		factory: Arc<F>,
		accessor: Option<PoolAccessor<K, V>>,
		listeners: Vec<Arc<dyn StoreListener<K, V>>>,
		sample_size: usize,
	) -> Self {
		Self {
			name,
			segments,
			segment_shift,
			factory,
			accessor,
			listeners,
			status: AtomicU8::new(Status::Uninitialised as u8),
			counters: Counters::default(),
			sample_size,
		}
	}

	/// Bind to the factory and go live.
	pub(crate) fn start(&self) {
		self.factory.bind(&self.name);
		self.status.store(Status::Alive as u8, Ordering::Release);
		debug!(store = %self.name, segments = self.segments.len(), "store started");
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn factory(&self) -> &Arc<F> {
		&self.factory
	}

	/// Pool accessor, if the store was built against a pool.
	pub fn accessor(&self) -> Option<&PoolAccessor<K, V>> {
		self.accessor.as_ref()
	}

	pub fn segment_count(&self) -> usize {
		self.segments.len()
	}

	/// Index of the segment `key` routes to.
	pub fn segment_index(&self, key: &K) -> usize {
		segment_index(hash_key(key), self.segment_shift)
	}

	pub(crate) fn segment(&self, index: usize) -> &Segment<K, V, F::Substitute> {
		&self.segments[index]
	}

	pub(crate) fn segment_for(&self, hash: u32) -> &Segment<K, V, F::Substitute> {
		&self.segments[segment_index(hash, self.segment_shift)]
	}

	pub(crate) fn counters(&self) -> &Counters {
		&self.counters
	}

	pub(crate) fn check_alive(&self) -> Result<()> {
		if self.status() == Status::Alive {
			Ok(())
		} else {
			Err(StoreError::NotAlive(self.name.clone()))
		}
	}

	/// Bytes the pool will be charged for `entry`. Zero without a pool.
	pub(crate) fn measure(&self, entry: &Entry<K, V>) -> u64 {
		self.accessor
			.as_ref()
			.map_or(0, |accessor| accessor.measure(entry.key(), entry.value(), entry))
	}

	/// Reserve `bytes` from the pool. Zero without a pool.
	pub(crate) fn reserve(&self, bytes: u64) -> Result<u64> {
		let Some(accessor) = &self.accessor else {
			return Ok(0);
		};
		accessor.reserve(bytes, false).map_err(|error| {
			if matches!(error, PoolError::Capacity { .. }) {
				warn!(store = %self.name, %error, "write denied");
			}
			StoreError::from(error)
		})
	}

	/// Bytes currently charged for `key`, zero if absent.
	fn resident_size(&self, key: &K, hash: u32) -> u64 {
		let segment = self.segment_for(hash);
		if segment.count() == 0 {
			return 0;
		}
		segment.read().find(key, hash).map_or(0, |node| node.size)
	}

	/// Write-lock the segment for `key` with enough bytes reserved to store
	/// `size` bytes under it. Returns the guard and the bytes charged.
	///
	/// Only growth over what the key already holds is charged, so an overwrite
	/// never evicts on behalf of bytes it is about to give back. The resident
	/// size is read again under the lock; if it shrank in the meantime the
	/// shortfall is reserved with the lock dropped and the lock retaken.
	fn lock_for_write(
		&self,
		key: &K,
		hash: u32,
		size: u64,
	) -> Result<(RwLockWriteGuard<'_, Table<K, V, F::Substitute>>, u64)> {
		let segment = self.segment_for(hash);
		let mut held = self.resident_size(key, hash);
		let mut charged = 0;
		loop {
			let missing = size.saturating_sub(held.saturating_add(charged));
			match self.reserve(missing) {
				Ok(bytes) => charged += bytes,
				Err(error) => {
					self.release(charged);
					return Err(error);
				}
			}
			let table = segment.write();
			held = table.find(key, hash).map_or(0, |node| node.size);
			if held.saturating_add(charged) >= size {
				return Ok((table, charged));
			}
			trace!(store = %self.name, held, charged, size, "resident size shrank, reserving again");
		}
	}

	/// Settle the bytes of a write that charged `charged` for `size` bytes and
	/// displaced a node of `old_size` bytes. Call with the segment unlocked.
	pub(crate) fn settle(&self, charged: u64, old_size: u64, size: u64) {
		self.release(charged.saturating_add(old_size).saturating_sub(size));
	}

	pub(crate) fn release(&self, bytes: u64) {
		if bytes == 0 {
			return;
		}
		if let Some(accessor) = &self.accessor
			&& let Err(error) = accessor.delete(bytes)
		{
			trace!(store = %self.name, %error, bytes, "release after unlink");
		}
	}

	/// The entry behind a representation.
	pub(crate) fn materialize(&self, key: &K, repr: &StoreRepr<K, V, F>) -> Option<Arc<Entry<K, V>>> {
		match repr {
			Repr::Entry(entry) => Some(Arc::clone(entry)),
			Repr::Substitute(substitute) => self.factory.retrieve(key, substitute),
		}
	}

	/// The representation currently held for `key`.
	pub fn representation(&self, key: &K) -> Option<StoreRepr<K, V, F>> {
		let hash = hash_key(key);
		let segment = self.segment_for(hash);
		if segment.count() == 0 {
			return None;
		}
		segment.read().find(key, hash).map(|node| node.repr.clone())
	}

	/// Remove `key` if it still holds `expected`, blocking for the lock.
	fn expire(&self, key: &K, hash: u32, expected: &StoreRepr<K, V, F>) {
		let segment = self.segment_for(hash);
		let removed = {
			let mut table = segment.write();
			segment.remove_locked(&mut table, key, hash, |current| current.ptr_eq(expected))
		};
		if let Some(node) = removed {
			self.release(node.size);
			Counters::bump(&self.counters.expirations);
			self.depart(node, Departure::Expired);
		}
	}

	fn lookup(&self, key: &K, quiet: bool) -> Result<Option<Arc<Entry<K, V>>>> {
		self.check_alive()?;
		let hash = hash_key(key);
		let segment = self.segment_for(hash);
		let (repr, entry) = loop {
			let repr = if segment.count() == 0 {
				None
			} else {
				segment.read().find(key, hash).map(|node| node.repr.clone())
			};
			let Some(repr) = repr else {
				if !quiet {
					self.counters.misses.record();
					self.counters.heap_misses.record();
					self.counters.substitute_misses.record();
				}
				return Ok(None);
			};

			// Substitutes are materialised after the lock is dropped. One that
			// was replaced and freed in between reads as gone, so look again.
			let entry = match &repr {
				Repr::Entry(entry) => Some(Arc::clone(entry)),
				Repr::Substitute(substitute) => self.factory.retrieve(key, substitute),
			};
			if entry.is_none()
				&& repr.is_substitute()
				&& !self.representation(key).is_some_and(|current| current.ptr_eq(&repr))
			{
				continue;
			}
			break (repr, entry);
		};
		if !quiet && repr.is_substitute() {
			self.counters.heap_misses.record();
		}

		let now = now_millis();
		let live = entry.filter(|entry| !entry.is_expired_at(now));
		if !quiet {
			match (&repr, &live) {
				(Repr::Entry(_), Some(_)) => self.counters.heap_hits.record(),
				(Repr::Entry(_), None) => self.counters.heap_misses.record(),
				(Repr::Substitute(_), Some(_)) => self.counters.substitute_hits.record(),
				(Repr::Substitute(_), None) => self.counters.substitute_misses.record(),
			}
			match &live {
				Some(entry) => {
					entry.touch(now);
					self.counters.hits.record();
				}
				None => {
					self.counters.misses.record();
					self.expire(key, hash, &repr);
				}
			}
		}
		Ok(live)
	}

	/// Insert `entry` unless the key is already present. Returns the present
	/// entry, or `None` if `entry` was inserted.
	pub fn put_if_absent(&self, entry: Entry<K, V>) -> Result<Option<Arc<Entry<K, V>>>> {
		self.check_alive()?;
		let hash = hash_key(entry.key());
		let segment = self.segment_for(hash);
		if segment.count() > 0
			&& let Some(repr) = segment.read().find(entry.key(), hash).map(|node| node.repr.clone())
			&& let Some(existing) = self.materialize(entry.key(), &repr)
		{
			return Ok(Some(existing));
		}

		let entry = Arc::new(entry);
		let size = self.measure(&entry);
		let key = entry.key().clone();
		let (mut table, charged) = self.lock_for_write(&key, hash, size)?;
		if let Some(node) = table.find(&key, hash) {
			let existing = self.materialize(&key, &node.repr);
			drop(table);
			self.release(charged);
			return Ok(existing);
		}
		let repr = self.factory.create(&key, Arc::clone(&entry));
		segment.put_locked(&mut table, key, hash, repr, size);
		drop(table);
		Counters::bump(&self.counters.puts);
		Ok(None)
	}

	/// Overwrite the value for a key whose current value satisfies `matches`.
	/// Returns the replaced entry, or `None` if nothing was replaced.
	fn replace_if(
		&self,
		entry: Entry<K, V>,
		matches: impl FnOnce(&Entry<K, V>) -> bool,
	) -> Result<Option<Arc<Entry<K, V>>>> {
		self.check_alive()?;
		let hash = hash_key(entry.key());
		let segment = self.segment_for(hash);
		if segment.count() == 0 {
			return Ok(None);
		}

		let entry = Arc::new(entry);
		let size = self.measure(&entry);
		let key = entry.key().clone();
		let (mut table, charged) = self.lock_for_write(&key, hash, size)?;
		let current = table.find(&key, hash).and_then(|node| self.materialize(&key, &node.repr));
		let Some(current) = current.filter(|current| matches(current)) else {
			drop(table);
			self.release(charged);
			return Ok(None);
		};
		entry.mark_replacing(current.version(), now_millis());
		let repr = self.factory.create(&key, Arc::clone(&entry));
		let replaced = segment.put_locked(&mut table, key, hash, repr, size);
		drop(table);

		let old_size = match replaced {
			Some((old_repr, old_size)) => {
				self.free_repr(&old_repr);
				old_size
			}
			None => 0,
		};
		self.settle(charged, old_size, size);
		Counters::bump(&self.counters.updates);
		Ok(Some(current))
	}

	/// Overwrite the value for `entry`'s key only if the key is present.
	/// Returns the replaced entry.
	pub fn replace(&self, entry: Entry<K, V>) -> Result<Option<Arc<Entry<K, V>>>> {
		self.replace_if(entry, |_| true)
	}

	/// Overwrite the value for `new`'s key only if the current value equals
	/// `old`'s value.
	pub fn replace_element(&self, old: &Entry<K, V>, new: Entry<K, V>) -> Result<bool>
	where
		V: PartialEq,
	{
		Ok(self.replace_if(new, |current| current.value() == old.value())?.is_some())
	}

	/// Remove `expected`'s key only if the current value equals `expected`'s
	/// value. Returns the removed entry.
	pub fn remove_element(&self, expected: &Entry<K, V>) -> Result<Option<Arc<Entry<K, V>>>>
	where
		V: PartialEq,
	{
		self.check_alive()?;
		let key = expected.key();
		let hash = hash_key(key);
		let segment = self.segment_for(hash);
		if segment.count() == 0 {
			return Ok(None);
		}

		let mut table = segment.write();
		let current = table.find(key, hash).and_then(|node| self.materialize(key, &node.repr));
		let Some(current) = current.filter(|current| current.value() == expected.value()) else {
			return Ok(None);
		};
		let removed = segment.remove_locked(&mut table, key, hash, |_| true);
		drop(table);

		if let Some(node) = removed {
			self.release(node.size);
			Counters::bump(&self.counters.removals);
			self.depart(node, Departure::Removed);
		}
		Ok(Some(current))
	}

	fn finish_fault(&self, expected: &StoreRepr<K, V, F>, new: &StoreRepr<K, V, F>, installed: bool) -> bool {
		if installed {
			self.free_repr(expected);
			if let Repr::Substitute(substitute) = new {
				self.factory.installed(substitute);
			}
			Counters::bump(&self.counters.faults);
			trace!(store = %self.name, substitute = new.is_substitute(), "fault installed");
		} else {
			self.free_repr(new);
		}
		installed
	}

	/// Swap the representation held for `key` from `expected` to `new`,
	/// blocking for the segment lock.
	///
	/// Succeeds only if the stored representation is reference-equal to
	/// `expected`, in which case `expected` is freed. Otherwise `new` is freed
	/// and the store is unchanged.
	pub fn fault(&self, key: &K, expected: &StoreRepr<K, V, F>, new: StoreRepr<K, V, F>) -> bool {
		if self.status() != Status::Alive {
			return self.finish_fault(expected, &new, false);
		}
		let hash = hash_key(key);
		let segment = self.segment_for(hash);
		let installed = {
			let mut table = segment.write();
			segment.fault_locked(&mut table, key, hash, expected, new.clone())
		};
		self.finish_fault(expected, &new, installed)
	}

	/// Like [`fault`](Self::fault), but fails immediately if the segment lock
	/// is held elsewhere.
	pub fn try_fault(&self, key: &K, expected: &StoreRepr<K, V, F>, new: StoreRepr<K, V, F>) -> bool {
		if self.status() != Status::Alive {
			return self.finish_fault(expected, &new, false);
		}
		let hash = hash_key(key);
		let segment = self.segment_for(hash);
		let Some(mut table) = segment.try_write() else {
			return self.finish_fault(expected, &new, false);
		};
		let installed = segment.fault_locked(&mut table, key, hash, expected, new.clone());
		drop(table);
		self.finish_fault(expected, &new, installed)
	}

	/// Move the live entry for `key` into the factory's tier. Pinned entries
	/// stay put.
	pub fn demote(&self, key: &K) -> bool {
		let Some(repr) = self.representation(key) else {
			return false;
		};
		let Repr::Entry(entry) = &repr else {
			return false;
		};
		if entry.is_pinned() {
			return false;
		}
		let Some(substitute) = self.factory.substitute(key, entry) else {
			return false;
		};
		self.fault(key, &repr, Repr::Substitute(substitute))
	}

	/// Bring the substitute for `key` back as a live entry, unless the segment
	/// is contended.
	pub fn promote(&self, key: &K) -> bool {
		let Some(repr) = self.representation(key) else {
			return false;
		};
		let Repr::Substitute(substitute) = &repr else {
			return false;
		};
		let Some(entry) = self.factory.retrieve(key, substitute) else {
			return false;
		};
		self.try_fault(key, &repr, Repr::Entry(entry))
	}

	/// Remove `key` if it still holds `expected`. Never blocks: a contended
	/// segment makes this return `false`.
	pub fn evict(&self, key: &K, expected: &StoreRepr<K, V, F>) -> bool {
		let hash = hash_key(key);
		let segment = self.segment_for(hash);
		let Some(mut table) = segment.try_write() else {
			return false;
		};
		let removed = segment.remove_locked(&mut table, key, hash, |current| current.ptr_eq(expected));
		drop(table);

		let Some(node) = removed else {
			return false;
		};
		self.release(node.size);
		Counters::bump(&self.counters.evictions);
		self.depart(node, Departure::Evicted);
		true
	}

	/// Up to `sample_size` keys with their representations, accepted by
	/// `filter`.
	///
	/// Scanning starts at the segment `key_hint` routes to, or a random one,
	/// and walks forward circularly. Contended segments are skipped.
	pub fn random_sample(
		&self,
		filter: impl Fn(&K, &StoreRepr<K, V, F>) -> bool,
		sample_size: usize,
		key_hint: Option<&K>,
	) -> Vec<(K, StoreRepr<K, V, F>)> {
		let mut sample = Vec::with_capacity(sample_size);
		if sample_size == 0 {
			return sample;
		}
		let mask = self.segments.len() - 1;
		let start = match key_hint {
			Some(key) => self.segment_index(key),
			None => rand::random::<u32>() as usize & mask,
		};
		let seed = rand::random::<u64>() as usize;
		let mut pick = |node: &Node<K, V, F::Substitute>| {
			filter(&node.key, &node.repr).then(|| (node.key.clone(), node.repr.clone()))
		};
		for offset in 0..self.segments.len() {
			self.segments[(start + offset) & mask].add_random_sample(&mut pick, sample_size, seed, &mut sample);
			if sample.len() >= sample_size {
				break;
			}
		}
		sample
	}

	/// Evict up to `count` victims accepted by `filter`, picking from random
	/// samples: expired entries first, then substitutes, then the least
	/// recently used live entry. Pinned entries are never chosen.
	fn evict_victims(&self, count: usize, filter: impl Fn(&StoreRepr<K, V, F>) -> bool) -> bool {
		if self.status() != Status::Alive {
			return false;
		}
		let now = now_millis();
		let mut evicted = 0;
		while evicted < count {
			let mut sample = self.random_sample(
				|_, repr| filter(repr) && !repr.as_entry().is_some_and(|entry| entry.is_pinned()),
				self.sample_size,
				None,
			);
			sample.sort_by_key(|(_, repr)| victim_rank(repr, now));
			if !sample.iter().any(|(key, repr)| self.evict(key, repr)) {
				break;
			}
			evicted += 1;
		}
		if evicted > 0 {
			debug!(store = %self.name, evicted, requested = count, "evicted for pool");
		}
		evicted > 0
	}

	/// Size from the segment counters alone, without retries or locks.
	fn approximate_count(&self) -> u64 {
		self.segments.iter().map(|segment| segment.count() as u64).sum()
	}

	/// Exact number of keys, read with every segment's read lock held.
	pub fn exact_size(&self) -> usize {
		let tables: Vec<_> = self.segments.iter().map(|segment| segment.read()).collect();
		let size = self.segments.iter().map(Segment::count).sum();
		drop(tables);
		size
	}

	pub fn metrics(&self) -> StoreMetrics {
		let bytes = self.segments.iter().map(Segment::bytes).sum();
		self.counters.snapshot(self.approximate_count(), bytes)
	}

	fn tier_is_substitute(&self, tier: Tier) -> bool {
		tier != Tier::OnHeap && tier == self.factory.tier()
	}
}

fn victim_rank<K, V, S>(repr: &Repr<K, V, S>, now: u64) -> (u8, u64) {
	match repr {
		Repr::Entry(entry) if entry.is_expired_at(now) => (0, 0),
		Repr::Substitute(_) => (1, 0),
		Repr::Entry(entry) => (2, entry.creation_time().max(entry.last_access_time())),
	}
}

impl<K, V, F> Store<K, V> for SegmentedStore<K, V, F>
where
	K: Hash + Eq + Clone + Send + Sync + 'static,
	V: Send + Sync + 'static,
	F: SubstituteFactory<K, V>,
{
	fn put(&self, entry: Entry<K, V>) -> Result<bool> {
		self.check_alive()?;
		let entry = Arc::new(entry);
		let size = self.measure(&entry);
		let key = entry.key().clone();
		let hash = hash_key(&key);
		let segment = self.segment_for(hash);

		let (mut table, charged) = self.lock_for_write(&key, hash, size)?;
		if let Some(node) = table.find(&key, hash)
			&& let Some(previous) = self.materialize(&key, &node.repr)
		{
			entry.mark_replacing(previous.version(), now_millis());
		}
		let repr = self.factory.create(&key, Arc::clone(&entry));
		let replaced = segment.put_locked(&mut table, key, hash, repr, size);
		drop(table);

		match replaced {
			Some((old_repr, old_size)) => {
				self.settle(charged, old_size, size);
				self.free_repr(&old_repr);
				Counters::bump(&self.counters.updates);
				Ok(false)
			}
			None => {
				self.settle(charged, 0, size);
				Counters::bump(&self.counters.puts);
				Ok(true)
			}
		}
	}

	fn get(&self, key: &K) -> Result<Option<Arc<Entry<K, V>>>> {
		self.lookup(key, false)
	}

	fn get_quiet(&self, key: &K) -> Result<Option<Arc<Entry<K, V>>>> {
		self.lookup(key, true)
	}

	fn remove(&self, key: &K) -> Result<Option<Arc<Entry<K, V>>>> {
		self.check_alive()?;
		let hash = hash_key(key);
		let segment = self.segment_for(hash);
		if segment.count() == 0 {
			return Ok(None);
		}
		let removed = {
			let mut table = segment.write();
			segment
				.remove_locked(&mut table, key, hash, |_| true)
				.map(|node| (self.materialize(key, &node.repr), node))
		};

		let Some((entry, node)) = removed else {
			return Ok(None);
		};
		self.release(node.size);
		Counters::bump(&self.counters.removals);
		self.depart(node, Departure::Removed);
		Ok(entry)
	}

	fn remove_all(&self) -> Result<()> {
		self.check_alive()?;
		for segment in self.segments.iter() {
			let nodes = segment.clear_locked(&mut segment.write());
			self.release(nodes.iter().map(|node| node.size).sum());
			for node in &nodes {
				self.free_repr(&node.repr);
			}
		}
		Ok(())
	}

	fn keys(&self) -> Result<Vec<K>> {
		self.check_alive()?;
		let mut keys = Vec::new();
		for segment in self.segments.iter() {
			if segment.count() > 0 {
				keys.extend(segment.read().nodes().map(|node| node.key.clone()));
			}
		}
		Ok(keys)
	}

	/// Sums segment counts twice without locking and accepts the result when no
	/// segment changed structure in between. After
	/// `RETRIES_BEFORE_LOCK` torn attempts, falls back to
	/// [`exact_size`](SegmentedStore::exact_size).
	fn size(&self) -> usize {
		for _ in 0..RETRIES_BEFORE_LOCK {
			let mut mod_counts = Vec::with_capacity(self.segments.len());
			let mut sum = 0;
			for segment in self.segments.iter() {
				mod_counts.push(segment.mod_count());
				sum += segment.count();
			}
			let stable = self.segments.iter().zip(&mod_counts).all(|(segment, &seen)| segment.mod_count() == seen);
			if stable {
				return sum;
			}
		}
		trace!(store = %self.name, "size unstable, locking all segments");
		self.exact_size()
	}

	fn contains_key(&self, key: &K) -> bool {
		let hash = hash_key(key);
		let segment = self.segment_for(hash);
		segment.count() > 0 && segment.read().find(key, hash).is_some()
	}

	fn dispose(&self) {
		if self
			.status
			.compare_exchange(Status::Alive as u8, Status::Shutdown as u8, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return;
		}
		if let Some(accessor) = &self.accessor {
			accessor.unlink();
		}
		for segment in self.segments.iter() {
			let nodes = segment.clear_locked(&mut segment.write());
			for node in &nodes {
				self.free_repr(&node.repr);
			}
		}
		self.factory.unbind(&self.name);
		debug!(store = %self.name, "store disposed");
	}

	fn status(&self) -> Status {
		Status::from_u8(self.status.load(Ordering::Acquire))
	}
}

impl<K, V, F> PoolParticipant for SegmentedStore<K, V, F>
where
	K: Hash + Eq + Clone + Send + Sync + 'static,
	V: Send + Sync + 'static,
	F: SubstituteFactory<K, V>,
{
	fn evict(&self, count: usize, _size: u64) -> bool {
		self.evict_victims(count, |_| true)
	}

	fn approximate_hit_rate(&self) -> f32 {
		self.counters.hits.rate()
	}

	fn approximate_miss_rate(&self) -> f32 {
		self.counters.misses.rate()
	}

	fn approximate_count_size(&self) -> u64 {
		self.approximate_count()
	}
}

impl<K, V, F> PoolableStore for SegmentedStore<K, V, F>
where
	K: Hash + Eq + Clone + Send + Sync + 'static,
	V: Send + Sync + 'static,
	F: SubstituteFactory<K, V>,
{
	fn approximate_tier_hit_rate(&self, tier: Tier) -> f32 {
		match tier {
			Tier::OnHeap => self.counters.heap_hits.rate(),
			tier if self.tier_is_substitute(tier) => self.counters.substitute_hits.rate(),
			_ => 0.0,
		}
	}

	fn approximate_tier_miss_rate(&self, tier: Tier) -> f32 {
		match tier {
			Tier::OnHeap => self.counters.heap_misses.rate(),
			tier if self.tier_is_substitute(tier) => self.counters.substitute_misses.rate(),
			_ => 0.0,
		}
	}

	fn approximate_tier_byte_size(&self, tier: Tier) -> u64 {
		let substitute: u64 = self.segments.iter().map(Segment::substitute_bytes).sum();
		match tier {
			Tier::OnHeap => self.segments.iter().map(Segment::bytes).sum::<u64>() - substitute,
			tier if self.tier_is_substitute(tier) => substitute,
			_ => 0,
		}
	}

	fn approximate_tier_count_size(&self, tier: Tier) -> u64 {
		let substitute: u64 = self.segments.iter().map(|segment| segment.substitute_count() as u64).sum();
		match tier {
			Tier::OnHeap => self.approximate_count().saturating_sub(substitute),
			tier if self.tier_is_substitute(tier) => substitute,
			_ => 0,
		}
	}

	fn evict_from_on_heap(&self, count: usize, _size: u64) -> bool {
		self.evict_victims(count, |repr| !repr.is_substitute())
	}

	fn evict_from_off_heap(&self, count: usize, _size: u64) -> bool {
		self.tier_is_substitute(Tier::OffHeap) && self.evict_victims(count, |repr| repr.is_substitute())
	}

	fn evict_from_on_disk(&self, count: usize, _size: u64) -> bool {
		self.tier_is_substitute(Tier::OnDisk) && self.evict_victims(count, |repr| repr.is_substitute())
	}
}

impl<K, V, F: SubstituteFactory<K, V>> fmt::Debug for SegmentedStore<K, V, F> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SegmentedStore")
			.field("name", &self.name)
			.field("segments", &self.segments.len())
			.field("status", &Status::from_u8(self.status.load(Ordering::Acquire)))
			.finish()
	}
}
