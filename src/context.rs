use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::pool::{Pool, PoolBuilder};

/// Resources shared by the stores of one cache manager.
///
/// Owns the named pools stores draw their budgets from. Create one per
/// manager and hand out pool handles from it; shutting the context down
/// unlinks every accessor of every pool it owns.
///
/// # Example
///
/// ```
/// use tierpool::{Pool, StoreContext};
///
/// let context = StoreContext::new();
/// let heap = context.register(Pool::builder("heap", 1 << 20));
/// assert_eq!(context.pool("heap").map(|pool| pool.max_size()), Some(heap.max_size()));
/// context.shutdown();
/// assert!(context.pool("heap").is_none());
/// ```
#[derive(Default)]
pub struct StoreContext {
	pools: RwLock<HashMap<String, Pool>>,
}

impl StoreContext {
	pub fn new() -> Self {
		Self::default()
	}

	/// Build a pool and register it under its name. An existing pool with the
	/// same name is returned instead, and `builder` is discarded.
	pub fn register(&self, builder: PoolBuilder) -> Pool {
		let mut pools = self.pools.write();
		if let Some(existing) = pools.get(builder.name()) {
			return existing.clone();
		}
		let pool = builder.build();
		debug!(pool = %pool.name(), "pool registered");
		pools.insert(pool.name().to_owned(), pool.clone());
		pool
	}

	pub fn pool(&self, name: &str) -> Option<Pool> {
		self.pools.read().get(name).cloned()
	}

	pub fn pool_names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.pools.read().keys().cloned().collect();
		names.sort();
		names
	}

	/// Remove a pool, unlinking its accessors.
	pub fn remove(&self, name: &str) -> Option<Pool> {
		let pool = self.pools.write().remove(name)?;
		pool.unlink_all();
		Some(pool)
	}

	/// Unlink every accessor of every pool and forget the pools.
	pub fn shutdown(&self) {
		let pools: Vec<Pool> = self.pools.write().drain().map(|(_, pool)| pool).collect();
		for pool in &pools {
			pool.unlink_all();
		}
		debug!(pools = pools.len(), "context shut down");
	}
}

impl Drop for StoreContext {
	fn drop(&mut self) {
		self.shutdown();
	}
}
