use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// A stored key/value record with expiry and access metadata.
///
/// Entries are shared as `Arc<Entry<K, V>>`. The key and value are immutable;
/// the access metadata is atomic so read paths can update it without the
/// segment write lock. Version and update time are only written by the owning
/// segment while it holds its write lock, before the entry is published.
///
/// # Example
///
/// ```
/// use tierpool::Entry;
///
/// let entry = Entry::new("user:1", "alice").with_time_to_live(60).pinned(true);
/// assert!(entry.is_pinned());
/// assert!(!entry.is_expired());
/// ```
#[derive(Debug)]
pub struct Entry<K, V> {
	key: K,
	value: V,
	creation_time: u64,
	last_access_time: AtomicU64,
	last_update_time: AtomicU64,
	version: AtomicU64,
	hit_count: AtomicU64,
	/// Seconds; zero means unlimited.
	time_to_idle: u32,
	/// Seconds; zero means unlimited.
	time_to_live: u32,
	eternal: bool,
	pinned: bool,
}

impl<K, V> Entry<K, V> {
	/// Create an entry stamped with the current time and no expiry.
	pub fn new(key: K, value: V) -> Self {
		Self::created_at(key, value, now_millis())
	}

	/// Create an entry with an explicit creation time (milliseconds).
	pub fn created_at(key: K, value: V, creation_time: u64) -> Self {
		Self {
			key,
			value,
			creation_time,
			last_access_time: AtomicU64::new(0),
			last_update_time: AtomicU64::new(0),
			version: AtomicU64::new(1),
			hit_count: AtomicU64::new(0),
			time_to_idle: 0,
			time_to_live: 0,
			eternal: false,
			pinned: false,
		}
	}

	pub fn with_time_to_live(mut self, seconds: u32) -> Self {
		self.time_to_live = seconds;
		self
	}

	pub fn with_time_to_idle(mut self, seconds: u32) -> Self {
		self.time_to_idle = seconds;
		self
	}

	/// Eternal entries never expire, whatever their TTL/TTI.
	pub fn eternal(mut self, eternal: bool) -> Self {
		self.eternal = eternal;
		self
	}

	/// Pinned entries are never chosen by eviction.
	pub fn pinned(mut self, pinned: bool) -> Self {
		self.pinned = pinned;
		self
	}

	pub fn key(&self) -> &K {
		&self.key
	}

	pub fn value(&self) -> &V {
		&self.value
	}

	pub fn creation_time(&self) -> u64 {
		self.creation_time
	}

	/// Last access time, or zero if the entry was never read.
	pub fn last_access_time(&self) -> u64 {
		self.last_access_time.load(Ordering::Relaxed)
	}

	/// Last update time, or zero if the entry never replaced another.
	pub fn last_update_time(&self) -> u64 {
		self.last_update_time.load(Ordering::Acquire)
	}

	/// Version counter, starting at 1 and bumped each time this entry
	/// replaces an earlier one for the same key.
	pub fn version(&self) -> u64 {
		self.version.load(Ordering::Acquire)
	}

	pub fn hit_count(&self) -> u64 {
		self.hit_count.load(Ordering::Relaxed)
	}

	pub fn time_to_live(&self) -> u32 {
		self.time_to_live
	}

	pub fn time_to_idle(&self) -> u32 {
		self.time_to_idle
	}

	pub fn is_eternal(&self) -> bool {
		self.eternal
	}

	pub fn is_pinned(&self) -> bool {
		self.pinned
	}

	/// Most recent of creation, update and access.
	fn most_recent_time(&self) -> u64 {
		self.creation_time.max(self.last_update_time()).max(self.last_access_time())
	}

	/// Instant (milliseconds) after which the entry is expired, or `None` if
	/// it never expires.
	pub fn expiration_time(&self) -> Option<u64> {
		if self.eternal || (self.time_to_live == 0 && self.time_to_idle == 0) {
			return None;
		}
		let ttl_expiry = (self.time_to_live != 0)
			.then(|| self.creation_time.saturating_add(u64::from(self.time_to_live) * 1000));
		let tti_expiry = (self.time_to_idle != 0)
			.then(|| self.most_recent_time().saturating_add(u64::from(self.time_to_idle) * 1000));
		match (ttl_expiry, tti_expiry) {
			(Some(a), Some(b)) => Some(a.min(b)),
			(a, b) => a.or(b),
		}
	}

	pub fn is_expired_at(&self, now: u64) -> bool {
		self.expiration_time().is_some_and(|at| now >= at)
	}

	pub fn is_expired(&self) -> bool {
		self.is_expired_at(now_millis())
	}

	/// Record a read.
	pub(crate) fn touch(&self, now: u64) {
		self.last_access_time.store(now, Ordering::Relaxed);
		self.hit_count.fetch_add(1, Ordering::Relaxed);
	}

	/// Stamp this entry as the successor of `previous_version`. Called by the
	/// segment under its write lock before the entry becomes visible.
	pub(crate) fn mark_replacing(&self, previous_version: u64, now: u64) {
		self.version.store(previous_version + 1, Ordering::Release);
		self.last_update_time.store(now, Ordering::Release);
	}
}
