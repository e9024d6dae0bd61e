use std::time::Duration;

use thiserror::Error;

/// Errors returned by a [`PoolAccessor`](crate::PoolAccessor).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
	/// Eviction could not free enough room and the reservation was not forced.
	#[error("pool capacity exhausted: requested {requested} bytes, {available} available")]
	Capacity {
		/// Bytes the caller asked for.
		requested: u64,
		/// Bytes left in the pool when the reservation was denied.
		available: u64,
	},

	/// The accessor was unlinked from its pool.
	#[error("pool accessor has been unlinked")]
	Unlinked,
}

/// Errors returned by store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
	/// The store has been disposed (or was never started).
	#[error("store `{0}` is not alive")]
	NotAlive(String),

	/// A write was denied because its pool had no room for it.
	#[error(transparent)]
	Pool(#[from] PoolError),

	/// Bulk key locking did not complete before the deadline. Every segment
	/// lock taken by the attempt has been released.
	#[error("timed out after {0:?} locking {1} segments")]
	Timeout(Duration, usize),

	/// A bulk lock guard was asked about a key whose segment it does not hold.
	#[error("key routes to segment {0}, which this guard has not locked")]
	NotLocked(usize),
}

impl StoreError {
	/// Whether this error is a capacity denial rather than a lifecycle fault.
	pub fn is_capacity(&self) -> bool {
		matches!(self, StoreError::Pool(PoolError::Capacity { .. }))
	}
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
