use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::MutexGuard;
use tracing::debug;

use super::{AccessorKind, Pool, PoolAccount, SizeOfEngine};
use crate::entry::Entry;
use crate::error::PoolError;

/// Eviction rounds attempted before a reservation is given up on. Each round
/// runs the evictor once; a round only fails to admit when concurrent writers
/// took the space it freed.
const MAX_EVICTION_ROUNDS: usize = 8;

/// A participant's handle for reserving and releasing bytes in a [`Pool`].
///
/// Sizes are measured with the accessor's [`SizeOfEngine`]. Dropping the
/// accessor unlinks it.
pub struct PoolAccessor<K, V> {
	pool: Pool,
	account: Arc<PoolAccount>,
	engine: Arc<dyn SizeOfEngine<K, V>>,
}

impl<K, V> PoolAccessor<K, V> {
	pub(crate) fn new(pool: Pool, account: Arc<PoolAccount>, engine: Arc<dyn SizeOfEngine<K, V>>) -> Self {
		Self {
			pool,
			account,
			engine,
		}
	}

	pub fn pool(&self) -> &Pool {
		&self.pool
	}

	pub fn account(&self) -> &Arc<PoolAccount> {
		&self.account
	}

	/// Bytes held by this accessor.
	pub fn size(&self) -> u64 {
		self.account.size()
	}

	pub fn has_aborted_size_of(&self) -> bool {
		self.account.has_aborted_size_of()
	}

	fn check_linked(&self) -> Result<(), PoolError> {
		if self.account.is_linked() {
			Ok(())
		} else {
			Err(PoolError::Unlinked)
		}
	}

	pub(crate) fn measure(&self, key: &K, value: &V, container: &Entry<K, V>) -> u64 {
		let size = self.engine.size_of(key, value, container);
		if !size.exact {
			self.account.aborted_size_of.store(true, Ordering::Relaxed);
		}
		size.bytes
	}

	/// Measure and reserve the bytes for a new entry. Returns the reserved size.
	pub fn add(&self, key: &K, value: &V, container: &Entry<K, V>, force: bool) -> Result<u64, PoolError> {
		self.check_linked()?;
		let bytes = self.measure(key, value, container);
		self.reserve(bytes, force)
	}

	/// Reserve the size difference between a stored value of `current_size`
	/// bytes and its replacement. Returns the signed delta actually applied.
	pub fn replace(
		&self,
		current_size: u64,
		key: &K,
		value: &V,
		container: &Entry<K, V>,
		force: bool,
	) -> Result<i64, PoolError> {
		self.check_linked()?;
		let new_size = self.measure(key, value, container);
		if new_size >= current_size {
			let grow = new_size - current_size;
			self.reserve(grow, force)?;
			Ok(grow as i64)
		} else {
			let shrink = current_size - new_size;
			self.delete(shrink)?;
			Ok(-(shrink as i64))
		}
	}

	/// Release `bytes`. Never blocks and never evicts.
	///
	/// # Panics
	///
	/// Panics if the accessor is linked and holds fewer than `bytes` bytes.
	pub fn delete(&self, bytes: u64) -> Result<u64, PoolError> {
		self.check_linked()?;
		let released = self.account.size.fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
			held.checked_sub(bytes)
		});
		match released {
			Ok(_) => {
				self.pool.release(bytes);
				Ok(bytes)
			}
			// Unlinking zeroes the account concurrently with us.
			Err(_) if !self.account.is_linked() => Err(PoolError::Unlinked),
			Err(held) => panic!(
				"pool accessor {} released {bytes} bytes but only holds {held}",
				self.account.id
			),
		}
	}

	/// Whether the entry would fit without triggering eviction.
	pub fn can_add_without_evicting(&self, key: &K, value: &V, container: &Entry<K, V>) -> Result<bool, PoolError> {
		self.check_linked()?;
		let bytes = self.engine.size_of(key, value, container).bytes;
		Ok(self.pool.size().saturating_add(bytes) <= self.pool.max_size())
	}

	/// Reserve `bytes` already measured by the caller.
	///
	/// When the pool is full the evictor is run and the budget re-validated
	/// afterwards. With `force` the bytes are admitted even if eviction falls
	/// short. A request larger than the whole budget is denied up front
	/// without evicting anything, unless forced.
	///
	/// [`AccessorKind::Locked`] accessors hold the pool's admission lock from
	/// the budget check to the commit, dropping it only while the evictor
	/// runs. [`AccessorKind::Atomic`] accessors claim with a compare-and-set.
	pub fn reserve(&self, bytes: u64, force: bool) -> Result<u64, PoolError> {
		self.check_linked()?;
		if bytes == 0 {
			return Ok(0);
		}
		let max_size = self.pool.max_size();
		if !force && bytes > max_size {
			debug!(pool = %self.pool.name(), account = self.account.id, bytes, max_size, "reservation exceeds budget");
			return Err(PoolError::Capacity {
				requested: bytes,
				available: max_size.saturating_sub(self.pool.size()),
			});
		}
		match self.account.kind {
			AccessorKind::Atomic => self.reserve_atomic(bytes, force),
			AccessorKind::Locked => self.reserve_locked(bytes, force),
		}
	}

	fn reserve_atomic(&self, bytes: u64, force: bool) -> Result<u64, PoolError> {
		for _ in 0..MAX_EVICTION_ROUNDS {
			match self.pool.try_claim(bytes) {
				Ok(()) => return self.commit(bytes),
				Err(missing) => {
					if !self.pool.free_space(missing) {
						break;
					}
				}
			}
		}
		self.settle_shortfall(bytes, force)
	}

	fn reserve_locked(&self, bytes: u64, force: bool) -> Result<u64, PoolError> {
		let mut admission = self.pool.admission().lock();
		for _ in 0..MAX_EVICTION_ROUNDS {
			match self.pool.try_claim(bytes) {
				Ok(()) => return self.commit(bytes),
				Err(missing) => {
					// Participants take their own locks while evicting, and may
					// reserve through this pool themselves.
					let freed = MutexGuard::unlocked(&mut admission, || self.pool.free_space(missing));
					if !freed {
						break;
					}
				}
			}
		}
		self.settle_shortfall(bytes, force)
	}

	/// Eviction could not make room: admit over budget if forced, else deny.
	fn settle_shortfall(&self, bytes: u64, force: bool) -> Result<u64, PoolError> {
		if force {
			self.pool.claim_unchecked(bytes);
			debug!(pool = %self.pool.name(), account = self.account.id, bytes, "forced over budget");
			return self.commit(bytes);
		}

		let available = self.pool.max_size().saturating_sub(self.pool.size());
		debug!(pool = %self.pool.name(), account = self.account.id, bytes, available, "reservation denied");
		Err(PoolError::Capacity {
			requested: bytes,
			available,
		})
	}

	/// Credit claimed pool bytes to this account.
	fn commit(&self, bytes: u64) -> Result<u64, PoolError> {
		self.account.size.fetch_add(bytes, Ordering::AcqRel);
		if self.account.is_linked() {
			return Ok(bytes);
		}
		// Unlinked while we were claiming; hand the bytes back.
		let taken = self.account.size.fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
			held.checked_sub(bytes)
		});
		if taken.is_ok() {
			self.pool.release(bytes);
		}
		Err(PoolError::Unlinked)
	}

	/// Detach from the pool, returning held bytes. Idempotent.
	pub fn unlink(&self) {
		self.pool.unlink(&self.account);
	}
}

impl<K, V> Drop for PoolAccessor<K, V> {
	fn drop(&mut self) {
		self.unlink();
	}
}

impl<K, V> fmt::Debug for PoolAccessor<K, V> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PoolAccessor")
			.field("pool", &self.pool.name())
			.field("account", &self.account)
			.finish()
	}
}
