use std::sync::Arc;

use crate::entry::Entry;

/// Hooks fired by a store after an entry leaves it.
///
/// Callbacks run on the thread that removed the entry, after the segment lock
/// was released. `entry` is `None` when the key was held as a substitute.
/// Every method defaults to doing nothing.
///
/// One exception: entries evicted to make room for a
/// [`KeysGuard::put`](crate::KeysGuard::put) are reported while that guard
/// still holds its segment locks. A listener that can see such evictions must
/// not reach the store for keys in those segments.
pub trait StoreListener<K, V>: Send + Sync {
	/// Removed to make room in the store's pool.
	fn on_evicted(&self, _store: &str, _key: &K, _entry: Option<&Arc<Entry<K, V>>>) {}

	/// Found expired on access and removed.
	fn on_expired(&self, _store: &str, _key: &K, _entry: Option<&Arc<Entry<K, V>>>) {}

	/// Removed explicitly.
	fn on_removed(&self, _store: &str, _key: &K, _entry: Option<&Arc<Entry<K, V>>>) {}
}

/// Why an entry left a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Departure {
	Evicted,
	Expired,
	Removed,
}

impl Departure {
	pub fn notify<K, V>(
		self,
		listener: &dyn StoreListener<K, V>,
		store: &str,
		key: &K,
		entry: Option<&Arc<Entry<K, V>>>,
	) {
		match self {
			Departure::Evicted => listener.on_evicted(store, key, entry),
			Departure::Expired => listener.on_expired(store, key, entry),
			Departure::Removed => listener.on_removed(store, key, entry),
		}
	}
}
