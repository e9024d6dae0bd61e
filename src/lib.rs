//! # tierpool
//!
//! Storage core for a tiered in-process cache:
//! - **Segmented concurrent store** with per-segment read/write locks
//! - **Atomic tier transitions** ("faults") between live entries and
//!   tier-specific substitutes
//! - **Shared byte pools** spanning any number of stores
//! - **Pluggable pool eviction** choosing victims across stores
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use tierpool::{
//!     ConstantSizeOfEngine, Entry, FromLargestCachePoolEvictor, IdentityFactory, Pool, Store,
//!     StoreBuilder,
//! };
//!
//! // Two stores sharing a 1 KiB budget, charged 10 bytes per entry.
//! let pool = Pool::builder("heap", 1024).evictor(FromLargestCachePoolEvictor).build();
//! let users = StoreBuilder::<u64, String>::new("users")
//!     .pool(&pool, Arc::new(ConstantSizeOfEngine::per_entry(10)))
//!     .build(IdentityFactory::new());
//! let orders = StoreBuilder::<u64, String>::new("orders")
//!     .pool(&pool, Arc::new(ConstantSizeOfEngine::per_entry(10)))
//!     .build(IdentityFactory::new());
//!
//! users.put(Entry::new(1, "alice".to_string())).unwrap();
//! orders.put(Entry::new(7, "book".to_string())).unwrap();
//!
//! assert_eq!(users.get(&1).unwrap().unwrap().value(), "alice");
//! assert_eq!(pool.size(), 20);
//! ```
//!
//! ## Tiering
//!
//! A [`SubstituteFactory`] decides how entries move out of the heap. The
//! [`IdentityFactory`] never moves them; [`SpillFactory`] parks them in a
//! side region and leaves a [`Spilled`] handle in the store. Demotion and
//! promotion go through [`SegmentedStore::fault`] and
//! [`SegmentedStore::try_fault`], which swap a key's representation only if it
//! is still the one the caller saw.
//!
//! ## Thread Safety
//!
//! Stores are `Send + Sync` and are shared as `Arc<SegmentedStore<..>>`.
//! Segment locks are not reentrant: while a [`KeysGuard`] is alive, access
//! its keys through the guard.

mod builder;
mod context;
mod entry;
mod error;
mod hash;
mod listener;
mod lock;
mod metrics;
mod pool;
mod segment;
mod stats;
mod store;
mod substitute;
mod traits;

pub use builder::{StoreBuilder, StoreConfig};
pub use context::StoreContext;
pub use deepsize::DeepSizeOf;
pub use entry::{Entry, now_millis};
pub use error::{PoolError, Result, StoreError};
pub use hash::{hash_key, spread};
pub use listener::StoreListener;
pub use lock::KeysGuard;
pub use metrics::StoreMetrics;
pub use pool::{
	AccessorKind, BalancedAccessEvictor, ConstantSizeOfEngine, DeepSizeOfEngine, FromLargestCachePoolEvictor, Pool,
	PoolAccessor, PoolAccount, PoolBuilder, PoolEvictor, PoolParticipant, Size, SizeOfEngine, Tier,
};
pub use stats::RateCounter;
pub use store::{SegmentedStore, StoreRepr};
pub use substitute::{IdentityFactory, Repr, SpillFactory, Spilled, SubstituteFactory};
pub use traits::{PoolableStore, Status, Store};
