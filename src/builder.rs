use std::hash::Hash;
use std::sync::{Arc, Weak};

use crate::hash::segment_shift;
use crate::listener::StoreListener;
use crate::pool::{AccessorKind, Pool, PoolParticipant, SizeOfEngine};
use crate::segment::Segment;
use crate::store::SegmentedStore;
use crate::substitute::SubstituteFactory;

/// Tuning knobs of a [`SegmentedStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
	/// Number of segments. Rounded up to a power of two.
	pub segments: usize,
	/// Initial bucket count of each segment.
	pub initial_capacity: usize,
	/// Fill ratio at which a segment doubles its buckets.
	pub load_factor: f32,
	/// Keys sampled per victim when the store evicts for its pool.
	pub eviction_sample_size: usize,
}

impl Default for StoreConfig {
	fn default() -> Self {
		Self {
			segments: 64,
			initial_capacity: 16,
			load_factor: 0.75,
			eviction_sample_size: 30,
		}
	}
}

struct PoolBinding<K, V> {
	pool: Pool,
	engine: Arc<dyn SizeOfEngine<K, V>>,
}

/// Builder for a [`SegmentedStore`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use tierpool::{ConstantSizeOfEngine, IdentityFactory, Pool, StoreBuilder};
///
/// let pool = Pool::builder("heap", 1024 * 1024).build();
/// let store = StoreBuilder::<String, Vec<u8>>::new("blobs")
///     .segments(32)
///     .pool(&pool, Arc::new(ConstantSizeOfEngine::per_entry(128)))
///     .build(IdentityFactory::new());
/// assert_eq!(store.segment_count(), 32);
/// ```
pub struct StoreBuilder<K, V> {
	name: String,
	config: StoreConfig,
	pool: Option<PoolBinding<K, V>>,
	accessor_kind: Option<AccessorKind>,
	listeners: Vec<Arc<dyn StoreListener<K, V>>>,
}

impl<K, V> StoreBuilder<K, V>
where
	K: Hash + Eq + Clone + Send + Sync + 'static,
	V: Send + Sync + 'static,
{
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			config: StoreConfig::default(),
			pool: None,
			accessor_kind: None,
			listeners: Vec::new(),
		}
	}

	/// Replace every tuning knob at once.
	pub fn config(mut self, config: StoreConfig) -> Self {
		self.config = config;
		self
	}

	/// Set the number of segments.
	///
	/// Will be rounded up to the next power of 2.
	///
	/// Default: 64
	pub fn segments(mut self, count: usize) -> Self {
		assert!(count > 0, "segments must be at least 1");
		self.config.segments = count;
		self
	}

	/// Default: 16
	pub fn initial_capacity(mut self, capacity: usize) -> Self {
		self.config.initial_capacity = capacity;
		self
	}

	/// Valid range: (0, 1].
	///
	/// Default: 0.75
	pub fn load_factor(mut self, load_factor: f32) -> Self {
		assert!(load_factor > 0.0 && load_factor <= 1.0, "load_factor must be in (0, 1]");
		self.config.load_factor = load_factor;
		self
	}

	/// Default: 30
	pub fn eviction_sample_size(mut self, size: usize) -> Self {
		assert!(size > 0, "eviction_sample_size must be at least 1");
		self.config.eviction_sample_size = size;
		self
	}

	/// Charge entries to `pool`, measured by `engine`. Without a pool every
	/// entry is charged zero bytes.
	pub fn pool(mut self, pool: &Pool, engine: Arc<dyn SizeOfEngine<K, V>>) -> Self {
		self.pool = Some(PoolBinding {
			pool: pool.clone(),
			engine,
		});
		self
	}

	/// Override the pool's default accessor kind for this store. May be set
	/// before or after [`pool`](Self::pool); ignored without a pool.
	pub fn accessor_kind(mut self, kind: AccessorKind) -> Self {
		self.accessor_kind = Some(kind);
		self
	}

	pub fn listener(mut self, listener: Arc<dyn StoreListener<K, V>>) -> Self {
		self.listeners.push(listener);
		self
	}

	/// Build a live store owning `factory`.
	pub fn build<F: SubstituteFactory<K, V>>(self, factory: F) -> Arc<SegmentedStore<K, V, F>> {
		self.build_shared(Arc::new(factory))
	}

	/// Build a live store using a factory shared with other stores.
	pub fn build_shared<F: SubstituteFactory<K, V>>(self, factory: Arc<F>) -> Arc<SegmentedStore<K, V, F>> {
		let count = self.config.segments.max(1).next_power_of_two();
		let shift = segment_shift(count);
		let segments: Box<[Segment<K, V, F::Substitute>]> = (0..count)
			.map(|_| Segment::new(self.config.initial_capacity, self.config.load_factor))
			.collect();

		let Self {
			name,
			config,
			pool,
			accessor_kind,
			listeners,
		} = self;

		let store = Arc::new_cyclic(|this: &Weak<SegmentedStore<K, V, F>>| {
			let accessor = pool.map(|binding| {
				let participant: Weak<dyn PoolParticipant> = this.clone();
				match accessor_kind {
					Some(kind) => binding.pool.create_accessor_with_kind(participant, binding.engine, kind),
					None => binding.pool.create_accessor(participant, binding.engine),
				}
			});
			SegmentedStore::new(name, segments, shift, factory, accessor, listeners, config.eviction_sample_size)
		});
		store.start();
		store
	}
}
