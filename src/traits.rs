use std::sync::Arc;

use crate::entry::Entry;
use crate::error::Result;
use crate::pool::{PoolParticipant, Tier};

/// Lifecycle of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
	Uninitialised = 0,
	Alive = 1,
	Shutdown = 2,
}

impl Status {
	pub(crate) fn from_u8(value: u8) -> Self {
		match value {
			1 => Status::Alive,
			2 => Status::Shutdown,
			_ => Status::Uninitialised,
		}
	}
}

/// Operations the cache layer performs on a store.
///
/// Single-key operations are linearized by the key's segment lock. Nothing is
/// atomic across keys.
pub trait Store<K, V>: Send + Sync {
	/// Insert or overwrite. Returns `true` if the key was absent.
	fn put(&self, entry: Entry<K, V>) -> Result<bool>;

	/// Read, recording access time, hit count and hit/miss statistics.
	fn get(&self, key: &K) -> Result<Option<Arc<Entry<K, V>>>>;

	/// Read without touching any statistic.
	fn get_quiet(&self, key: &K) -> Result<Option<Arc<Entry<K, V>>>>;

	fn remove(&self, key: &K) -> Result<Option<Arc<Entry<K, V>>>>;

	fn remove_all(&self) -> Result<()>;

	/// Snapshot of the keys, taken one segment at a time.
	fn keys(&self) -> Result<Vec<K>>;

	/// Number of keys held, live or substituted.
	fn size(&self) -> usize;

	fn contains_key(&self, key: &K) -> bool;

	/// Shut the store down. Only the first call has any effect.
	fn dispose(&self);

	fn status(&self) -> Status;
}

/// Per-tier view of a participant, for evictors that weigh tiers separately.
pub trait PoolableStore: PoolParticipant {
	fn approximate_tier_hit_rate(&self, tier: Tier) -> f32;

	fn approximate_tier_miss_rate(&self, tier: Tier) -> f32;

	fn approximate_tier_byte_size(&self, tier: Tier) -> u64;

	fn approximate_tier_count_size(&self, tier: Tier) -> u64;

	/// Evict up to `count` live entries.
	fn evict_from_on_heap(&self, count: usize, size: u64) -> bool;

	/// Evict up to `count` off-heap substitutes.
	fn evict_from_off_heap(&self, count: usize, size: u64) -> bool;

	/// Evict up to `count` on-disk substitutes.
	fn evict_from_on_disk(&self, count: usize, size: u64) -> bool;
}
