//! Store counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::stats::RateCounter;

/// Snapshot of a store's counters.
///
/// # Example
///
/// ```
/// use tierpool::{Entry, IdentityFactory, Store, StoreBuilder};
///
/// let store = StoreBuilder::<u64, &str>::new("users").build(IdentityFactory::new());
/// store.put(Entry::new(1, "alice")).unwrap();
/// store.get(&1).unwrap();
/// store.get(&2).unwrap();
///
/// let metrics = store.metrics();
/// assert_eq!(metrics.hits, 1);
/// assert_eq!(metrics.misses, 1);
/// assert_eq!(metrics.hit_rate(), 0.5);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Default)]
pub struct StoreMetrics {
	/// Lookups through `get` that found a live entry.
	pub hits: u64,
	/// Lookups through `get` that found nothing or an expired entry.
	pub misses: u64,
	/// Puts of a key that was absent.
	pub puts: u64,
	/// Puts that replaced an existing representation.
	pub updates: u64,
	/// Entries removed to free pool space.
	pub evictions: u64,
	/// Expired entries removed on access.
	pub expirations: u64,
	/// Entries removed explicitly.
	pub removals: u64,
	/// Successful representation swaps.
	pub faults: u64,
	/// Live entries plus substitutes.
	pub entry_count: u64,
	/// Bytes charged to the store's pool accessor.
	pub byte_size: u64,
}

impl StoreMetrics {
	/// Hits over all `get` lookups, or 0.0 with no lookups.
	pub fn hit_rate(&self) -> f64 {
		let total = self.total_accesses();
		if total == 0 {
			0.0
		} else {
			self.hits as f64 / total as f64
		}
	}

	pub fn total_accesses(&self) -> u64 {
		self.hits + self.misses
	}

	pub fn total_writes(&self) -> u64 {
		self.puts + self.updates
	}
}

/// Live counters backing [`StoreMetrics`], plus the decayed rates pool
/// evictors consult.
#[derive(Default)]
pub(crate) struct Counters {
	pub hits: RateCounter,
	pub misses: RateCounter,
	/// Reads answered by a live entry.
	pub heap_hits: RateCounter,
	pub heap_misses: RateCounter,
	/// Reads answered by materialising a substitute.
	pub substitute_hits: RateCounter,
	pub substitute_misses: RateCounter,
	pub puts: AtomicU64,
	pub updates: AtomicU64,
	pub evictions: AtomicU64,
	pub expirations: AtomicU64,
	pub removals: AtomicU64,
	pub faults: AtomicU64,
}

impl Counters {
	pub fn bump(counter: &AtomicU64) {
		counter.fetch_add(1, Ordering::Relaxed);
	}

	pub fn snapshot(&self, entry_count: u64, byte_size: u64) -> StoreMetrics {
		StoreMetrics {
			hits: self.hits.total(),
			misses: self.misses.total(),
			puts: self.puts.load(Ordering::Relaxed),
			updates: self.updates.load(Ordering::Relaxed),
			evictions: self.evictions.load(Ordering::Relaxed),
			expirations: self.expirations.load(Ordering::Relaxed),
			removals: self.removals.load(Ordering::Relaxed),
			faults: self.faults.load(Ordering::Relaxed),
			entry_count,
			byte_size,
		}
	}
}
