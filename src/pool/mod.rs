//! Shared byte budgets and cross-store eviction.
//!
//! A [`Pool`] owns a byte budget and the set of accounts linked to it. Each
//! store holds a [`PoolAccessor`] through which it reserves and releases bytes.
//! When a reservation does not fit, the pool's [`PoolEvictor`] is asked to
//! free space across every linked participant, which may include stores other
//! than the one asking.
//!
//! # Lock discipline
//!
//! No accessor lock is held while the evictor runs. Eviction calls back into
//! participants, which take segment locks of their own; a participant may be
//! the very store whose write is waiting for room. Stores only ever try-lock
//! segments while evicting, so eviction cannot block on a lock held by the
//! thread that triggered it.

mod accessor;
mod evictor;
mod sizeof;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

pub use accessor::PoolAccessor;
pub use evictor::{BalancedAccessEvictor, FromLargestCachePoolEvictor, PoolEvictor};
pub use sizeof::{ConstantSizeOfEngine, DeepSizeOfEngine, Size, SizeOfEngine};

/// Storage tier a pool or representation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Tier {
	#[default]
	OnHeap,
	OffHeap,
	OnDisk,
}

/// How an accessor admits reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessorKind {
	/// Lock-free compare-and-set on the pool occupancy.
	#[default]
	Atomic,
	/// Admissions serialized by a pool-wide lock, released during eviction.
	Locked,
}

/// A store (or part of one) competing for a pool's budget.
pub trait PoolParticipant: Send + Sync {
	/// Evict up to `count` entries, aiming to release `size` bytes. Returns
	/// whether anything was evicted.
	fn evict(&self, count: usize, size: u64) -> bool;

	/// Decayed hits per second.
	fn approximate_hit_rate(&self) -> f32;

	/// Decayed misses per second.
	fn approximate_miss_rate(&self) -> f32;

	/// Approximate number of entries held.
	fn approximate_count_size(&self) -> u64;
}

/// A participant's running byte count within a pool.
///
/// Evictors see the pool as a slice of accounts: the bytes each one holds and
/// the participant to evict from.
pub struct PoolAccount {
	id: u64,
	size: AtomicU64,
	participant: Weak<dyn PoolParticipant>,
	kind: AccessorKind,
	linked: AtomicBool,
	aborted_size_of: AtomicBool,
}

impl PoolAccount {
	pub fn id(&self) -> u64 {
		self.id
	}

	/// Bytes currently held.
	pub fn size(&self) -> u64 {
		self.size.load(Ordering::Acquire)
	}

	/// The participant, if it is still alive.
	pub fn participant(&self) -> Option<Arc<dyn PoolParticipant>> {
		self.participant.upgrade()
	}

	pub fn kind(&self) -> AccessorKind {
		self.kind
	}

	pub fn is_linked(&self) -> bool {
		self.linked.load(Ordering::Acquire)
	}

	/// Whether any measurement charged to this account was approximate.
	pub fn has_aborted_size_of(&self) -> bool {
		self.aborted_size_of.load(Ordering::Relaxed)
	}
}

impl fmt::Debug for PoolAccount {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PoolAccount")
			.field("id", &self.id)
			.field("size", &self.size())
			.field("kind", &self.kind)
			.field("linked", &self.is_linked())
			.finish()
	}
}

pub(crate) struct PoolInner {
	name: String,
	tier: Tier,
	max_size: AtomicU64,
	occupied: AtomicU64,
	accounts: RwLock<Vec<Arc<PoolAccount>>>,
	evictor: Box<dyn PoolEvictor>,
	admission: Mutex<()>,
	default_kind: AccessorKind,
	next_id: AtomicU64,
}

/// A byte budget shared by any number of stores.
///
/// `Pool` is a cheap handle; clones refer to the same budget.
///
/// # Example
///
/// ```
/// use tierpool::{FromLargestCachePoolEvictor, Pool, Tier};
///
/// let pool = Pool::builder("heap", 64 * 1024 * 1024)
///     .tier(Tier::OnHeap)
///     .evictor(FromLargestCachePoolEvictor)
///     .build();
/// assert_eq!(pool.size(), 0);
/// ```
#[derive(Clone)]
pub struct Pool {
	inner: Arc<PoolInner>,
}

impl Pool {
	pub fn builder(name: impl Into<String>, max_size: u64) -> PoolBuilder {
		PoolBuilder::new(name, max_size)
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	pub fn tier(&self) -> Tier {
		self.inner.tier
	}

	pub fn max_size(&self) -> u64 {
		self.inner.max_size.load(Ordering::Acquire)
	}

	/// Bytes currently reserved by linked accounts.
	pub fn size(&self) -> u64 {
		self.inner.occupied.load(Ordering::Acquire)
	}

	/// Change the budget. Lowering it below the current occupancy evicts down
	/// to the new budget; the result of that eviction is returned.
	pub fn set_max_size(&self, max_size: u64) -> bool {
		let previous = self.inner.max_size.swap(max_size, Ordering::AcqRel);
		debug!(pool = %self.inner.name, previous, max_size, "pool resized");
		let occupied = self.size();
		if occupied > max_size {
			self.free_space(occupied - max_size)
		} else {
			true
		}
	}

	/// Snapshot of the linked accounts.
	pub fn accounts(&self) -> Vec<Arc<PoolAccount>> {
		self.inner.accounts.read().clone()
	}

	/// Create an accessor for `participant` using the pool's default kind.
	pub fn create_accessor<K, V>(
		&self,
		participant: Weak<dyn PoolParticipant>,
		engine: Arc<dyn SizeOfEngine<K, V>>,
	) -> PoolAccessor<K, V> {
		self.create_accessor_with_kind(participant, engine, self.inner.default_kind)
	}

	pub fn create_accessor_with_kind<K, V>(
		&self,
		participant: Weak<dyn PoolParticipant>,
		engine: Arc<dyn SizeOfEngine<K, V>>,
		kind: AccessorKind,
	) -> PoolAccessor<K, V> {
		let account = Arc::new(PoolAccount {
			id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
			size: AtomicU64::new(0),
			participant,
			kind,
			linked: AtomicBool::new(true),
			aborted_size_of: AtomicBool::new(false),
		});
		self.inner.accounts.write().push(Arc::clone(&account));
		debug!(pool = %self.inner.name, account = account.id, ?kind, "accessor linked");
		PoolAccessor::new(self.clone(), account, engine)
	}

	/// Unlink every account, returning their bytes to the pool.
	pub fn unlink_all(&self) {
		for account in self.accounts() {
			self.unlink(&account);
		}
	}

	/// Ask the evictor to free `bytes` across all linked participants. Must be
	/// called without holding any accessor or segment lock.
	pub(crate) fn free_space(&self, bytes: u64) -> bool {
		let accounts = self.accounts();
		let freed = self.inner.evictor.free_space(&accounts, bytes);
		if !freed {
			debug!(pool = %self.inner.name, bytes, "evictor could not free enough space");
		}
		freed
	}

	/// Claim `bytes` if they fit under the budget, otherwise report how many
	/// bytes are missing.
	pub(crate) fn try_claim(&self, bytes: u64) -> Result<(), u64> {
		let max = self.max_size();
		let mut current = self.inner.occupied.load(Ordering::Acquire);
		loop {
			let wanted = current.saturating_add(bytes);
			if wanted > max {
				return Err(wanted - max);
			}
			match self.inner.occupied.compare_exchange_weak(
				current,
				wanted,
				Ordering::AcqRel,
				Ordering::Acquire,
			) {
				Ok(_) => return Ok(()),
				Err(actual) => current = actual,
			}
		}
	}

	pub(crate) fn claim_unchecked(&self, bytes: u64) {
		self.inner.occupied.fetch_add(bytes, Ordering::AcqRel);
	}

	pub(crate) fn release(&self, bytes: u64) {
		let _ = self.inner.occupied.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
			Some(current.saturating_sub(bytes))
		});
	}

	pub(crate) fn admission(&self) -> &Mutex<()> {
		&self.inner.admission
	}

	pub(crate) fn unlink(&self, account: &Arc<PoolAccount>) -> bool {
		if !account.linked.swap(false, Ordering::AcqRel) {
			return false;
		}
		self.inner.accounts.write().retain(|a| !Arc::ptr_eq(a, account));
		let held = account.size.swap(0, Ordering::AcqRel);
		self.release(held);
		debug!(pool = %self.inner.name, account = account.id, held, "accessor unlinked");
		true
	}
}

impl fmt::Debug for Pool {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Pool")
			.field("name", &self.inner.name)
			.field("tier", &self.inner.tier)
			.field("max_size", &self.max_size())
			.field("size", &self.size())
			.finish()
	}
}

/// Builder for a [`Pool`].
///
/// Defaults: on-heap tier, [`FromLargestCachePoolEvictor`], atomic accessors.
pub struct PoolBuilder {
	name: String,
	max_size: u64,
	tier: Tier,
	evictor: Box<dyn PoolEvictor>,
	kind: AccessorKind,
}

impl PoolBuilder {
	pub fn new(name: impl Into<String>, max_size: u64) -> Self {
		Self {
			name: name.into(),
			max_size,
			tier: Tier::OnHeap,
			evictor: Box::new(FromLargestCachePoolEvictor),
			kind: AccessorKind::Atomic,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn tier(mut self, tier: Tier) -> Self {
		self.tier = tier;
		self
	}

	pub fn evictor(mut self, evictor: impl PoolEvictor + 'static) -> Self {
		self.evictor = Box::new(evictor);
		self
	}

	/// Accessor kind handed out by [`Pool::create_accessor`].
	pub fn accessor_kind(mut self, kind: AccessorKind) -> Self {
		self.kind = kind;
		self
	}

	pub fn build(self) -> Pool {
		debug!(pool = %self.name, max_size = self.max_size, tier = ?self.tier, "pool created");
		Pool {
			inner: Arc::new(PoolInner {
				name: self.name,
				tier: self.tier,
				max_size: AtomicU64::new(self.max_size),
				occupied: AtomicU64::new(0),
				accounts: RwLock::new(Vec::new()),
				evictor: self.evictor,
				admission: Mutex::new(()),
				default_kind: self.kind,
				next_id: AtomicU64::new(0),
			}),
		}
	}
}
