//! Representations held by store slots and the factories that convert
//! between them.
//!
//! A slot holds either a live [`Entry`] or one tier-specific substitute
//! standing in for it. Identity of a representation is reference identity,
//! which is what [`fault`](crate::SegmentedStore::fault) compares against.

use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::entry::Entry;
use crate::pool::Tier;

/// What a store slot currently holds for a key.
pub enum Repr<K, V, S> {
	/// A live entry.
	Entry(Arc<Entry<K, V>>),
	/// A substitute for an entry living in another tier.
	Substitute(Arc<S>),
}

impl<K, V, S> Repr<K, V, S> {
	/// Reference equality.
	pub fn ptr_eq(&self, other: &Self) -> bool {
		match (self, other) {
			(Repr::Entry(a), Repr::Entry(b)) => Arc::ptr_eq(a, b),
			(Repr::Substitute(a), Repr::Substitute(b)) => Arc::ptr_eq(a, b),
			_ => false,
		}
	}

	pub fn as_entry(&self) -> Option<&Arc<Entry<K, V>>> {
		match self {
			Repr::Entry(entry) => Some(entry),
			Repr::Substitute(_) => None,
		}
	}

	pub fn is_substitute(&self) -> bool {
		matches!(self, Repr::Substitute(_))
	}
}

impl<K, V, S> Clone for Repr<K, V, S> {
	fn clone(&self) -> Self {
		match self {
			Repr::Entry(entry) => Repr::Entry(Arc::clone(entry)),
			Repr::Substitute(substitute) => Repr::Substitute(Arc::clone(substitute)),
		}
	}
}

impl<K, V, S> fmt::Debug for Repr<K, V, S> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Repr::Entry(entry) => write!(f, "Repr::Entry({:p})", Arc::as_ptr(entry)),
			Repr::Substitute(substitute) => {
				write!(f, "Repr::Substitute({:p})", Arc::as_ptr(substitute))
			}
		}
	}
}

/// Strategy converting entries to and from a tier-specific representation.
///
/// Stores call into the factory from [`fault`](crate::SegmentedStore::fault)
/// and its variants, from reads that find a substitute, and when a
/// representation is dropped from a slot.
pub trait SubstituteFactory<K, V>: Send + Sync + 'static {
	/// Substitute type held in store slots.
	type Substitute: Send + Sync + 'static;

	/// Tier that substitutes created by this factory live in.
	fn tier(&self) -> Tier;

	/// Called once when a store starts using this factory.
	fn bind(&self, _store: &str) {}

	/// Called once by the thread that disposes a bound store.
	fn unbind(&self, _store: &str) {}

	/// Representation to install for a freshly written entry.
	fn create(&self, _key: &K, entry: Arc<Entry<K, V>>) -> Repr<K, V, Self::Substitute> {
		Repr::Entry(entry)
	}

	/// Build a substitute for a live entry, or `None` if this factory does
	/// not demote entries.
	fn substitute(&self, _key: &K, _entry: &Arc<Entry<K, V>>) -> Option<Arc<Self::Substitute>> {
		None
	}

	/// Materialise the entry behind a substitute. `None` if its storage is gone.
	fn retrieve(&self, key: &K, substitute: &Self::Substitute) -> Option<Arc<Entry<K, V>>>;

	/// Release storage held by a substitute that has left its slot.
	fn free(&self, substitute: &Self::Substitute);

	/// Called after a substitute was installed and the segment lock released.
	fn installed(&self, _substitute: &Self::Substitute) {}
}

/// Factory that never substitutes: every slot holds a live entry.
pub struct IdentityFactory<K, V> {
	marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> IdentityFactory<K, V> {
	pub fn new() -> Self {
		Self {
			marker: PhantomData,
		}
	}
}

impl<K, V> Default for IdentityFactory<K, V> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K: 'static, V: 'static> SubstituteFactory<K, V> for IdentityFactory<K, V> {
	type Substitute = Infallible;

	fn tier(&self) -> Tier {
		Tier::OnHeap
	}

	fn retrieve(&self, _key: &K, substitute: &Infallible) -> Option<Arc<Entry<K, V>>> {
		match *substitute {}
	}

	fn free(&self, substitute: &Infallible) {
		match *substitute {}
	}
}

/// Handle to an entry parked in a [`SpillFactory`] region.
#[derive(Debug, PartialEq, Eq)]
pub struct Spilled {
	slot: u64,
}

impl Spilled {
	pub fn slot(&self) -> u64 {
		self.slot
	}
}

/// Factory that demotes entries into a separate region keyed by slot number,
/// standing in for an off-heap or disk tier.
///
/// Fresh writes stay on heap unless `spill_on_write` is set; demotion happens
/// through [`SegmentedStore::demote`](crate::SegmentedStore::demote).
pub struct SpillFactory<K, V> {
	tier: Tier,
	spill_on_write: bool,
	region: Mutex<HashMap<u64, Arc<Entry<K, V>>>>,
	next_slot: AtomicU64,
	bound: Mutex<Vec<String>>,
}

impl<K, V> SpillFactory<K, V> {
	pub fn new(tier: Tier) -> Self {
		Self {
			tier,
			spill_on_write: false,
			region: Mutex::new(HashMap::new()),
			next_slot: AtomicU64::new(0),
			bound: Mutex::new(Vec::new()),
		}
	}

	/// Write every new entry straight into the region.
	pub fn spill_on_write(mut self, enabled: bool) -> Self {
		self.spill_on_write = enabled;
		self
	}

	/// Number of entries currently parked in the region.
	pub fn region_len(&self) -> usize {
		self.region.lock().len()
	}

	/// Names of the stores currently bound to this factory.
	pub fn bound_stores(&self) -> Vec<String> {
		self.bound.lock().clone()
	}

	fn park(&self, entry: &Arc<Entry<K, V>>) -> Arc<Spilled> {
		let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
		self.region.lock().insert(slot, Arc::clone(entry));
		Arc::new(Spilled {
			slot,
		})
	}
}

impl<K, V> SubstituteFactory<K, V> for SpillFactory<K, V>
where
	K: Send + Sync + 'static,
	V: Send + Sync + 'static,
{
	type Substitute = Spilled;

	fn tier(&self) -> Tier {
		self.tier
	}

	fn bind(&self, store: &str) {
		self.bound.lock().push(store.to_owned());
	}

	fn unbind(&self, store: &str) {
		self.bound.lock().retain(|name| name != store);
	}

	fn create(&self, _key: &K, entry: Arc<Entry<K, V>>) -> Repr<K, V, Spilled> {
		if self.spill_on_write {
			Repr::Substitute(self.park(&entry))
		} else {
			Repr::Entry(entry)
		}
	}

	fn substitute(&self, _key: &K, entry: &Arc<Entry<K, V>>) -> Option<Arc<Spilled>> {
		Some(self.park(entry))
	}

	fn retrieve(&self, _key: &K, substitute: &Spilled) -> Option<Arc<Entry<K, V>>> {
		self.region.lock().get(&substitute.slot).cloned()
	}

	fn free(&self, substitute: &Spilled) {
		self.region.lock().remove(&substitute.slot);
	}

	fn installed(&self, substitute: &Spilled) {
		tracing::trace!(slot = substitute.slot, tier = ?self.tier, "substitute installed");
	}
}
