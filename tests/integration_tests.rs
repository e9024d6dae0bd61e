use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tierpool::{
	AccessorKind, BalancedAccessEvictor, ConstantSizeOfEngine, Entry, FromLargestCachePoolEvictor, IdentityFactory,
	Pool, PoolError, PoolableStore, Repr, SegmentedStore, Size, SizeOfEngine, SpillFactory, Store, StoreBuilder,
	StoreContext, StoreError, StoreListener, SubstituteFactory, Tier, spread,
};
use tracing_subscriber::EnvFilter;

/// Route store and pool logs to the test harness; `RUST_LOG=tierpool=debug`
/// shows eviction decisions.
fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

type IdentityStore = Arc<SegmentedStore<u64, String, IdentityFactory<u64, String>>>;
type SpillStore = Arc<SegmentedStore<u64, String, SpillFactory<u64, String>>>;

fn identity_store(segments: usize) -> IdentityStore {
	StoreBuilder::<u64, String>::new("identity").segments(segments).build(IdentityFactory::new())
}

fn spill_store() -> SpillStore {
	StoreBuilder::<u64, String>::new("spill").segments(8).build(SpillFactory::new(Tier::OnDisk))
}

fn pooled_store(name: &str, pool: &Pool) -> IdentityStore {
	StoreBuilder::<u64, String>::new(name)
		.segments(8)
		.pool(pool, Arc::new(ConstantSizeOfEngine::per_entry(10)))
		.build(IdentityFactory::new())
}

/// One key from each of `count` distinct segments, ordered by segment index.
fn keys_in_distinct_segments(store: &IdentityStore, count: usize) -> Vec<u64> {
	let mut picked: Vec<(usize, u64)> = Vec::new();
	for key in 0u64.. {
		let index = store.segment_index(&key);
		if picked.iter().all(|(seen, _)| *seen != index) {
			picked.push((index, key));
			if picked.len() == count {
				break;
			}
		}
	}
	picked.sort_unstable();
	picked.into_iter().map(|(_, key)| key).collect()
}

/// Keys routed to the same segment as `anchor`, excluding it.
fn keys_sharing_segment(store: &IdentityStore, anchor: u64, count: usize) -> Vec<u64> {
	let index = store.segment_index(&anchor);
	(0u64..).filter(|key| *key != anchor && store.segment_index(key) == index).take(count).collect()
}

/// Charges one byte per byte of the value.
struct ByLength;

impl SizeOfEngine<u64, String> for ByLength {
	fn size_of(&self, _key: &u64, value: &String, _container: &Entry<u64, String>) -> Size {
		Size::exact(value.len() as u64)
	}
}

#[derive(Default)]
struct Recording {
	evicted: AtomicUsize,
	evicted_keys: Mutex<Vec<u64>>,
	removed: Mutex<Vec<u64>>,
}

impl StoreListener<u64, String> for Recording {
	fn on_evicted(&self, _store: &str, key: &u64, _entry: Option<&Arc<Entry<u64, String>>>) {
		self.evicted.fetch_add(1, Ordering::Relaxed);
		self.evicted_keys.lock().push(*key);
	}

	fn on_removed(&self, _store: &str, key: &u64, _entry: Option<&Arc<Entry<u64, String>>>) {
		self.removed.lock().push(*key);
	}
}

#[test]
fn test_routing_is_deterministic() {
	let store = identity_store(16);
	for key in 0u64..1_000 {
		assert_eq!(store.segment_index(&key), store.segment_index(&key));
		assert!(store.segment_index(&key) < 16);
	}
	assert_eq!(spread(42), spread(42));

	for key in 0u64..1_000 {
		store.put(Entry::new(key, key.to_string())).expect("alive");
	}
	for key in 0u64..1_000 {
		let entry = store.get(&key).expect("alive").expect("present");
		assert_eq!(entry.value(), &key.to_string());
	}
}

#[test]
fn test_keys_spread_over_segments() {
	let store = identity_store(16);
	let mut used = [false; 16];
	for key in 0u64..1_000 {
		used[store.segment_index(&key)] = true;
	}
	assert!(used.iter().all(|used| *used), "every segment receives keys");
}

#[test]
fn test_concurrent_try_fault_has_one_winner() {
	let store = spill_store();
	store.put(Entry::new(1, "one".into())).expect("alive");
	let expected = store.representation(&1).expect("present");
	let entry = expected.as_entry().expect("live").clone();

	let threads = 16;
	let barrier = Arc::new(Barrier::new(threads));
	let wins = Arc::new(AtomicUsize::new(0));
	let handles: Vec<_> = (0..threads)
		.map(|_| {
			let store = Arc::clone(&store);
			let expected = expected.clone();
			let entry = Arc::clone(&entry);
			let barrier = Arc::clone(&barrier);
			let wins = Arc::clone(&wins);
			thread::spawn(move || {
				let substitute = store.factory().substitute(&1, &entry).expect("spill");
				barrier.wait();
				if store.try_fault(&1, &expected, Repr::Substitute(substitute)) {
					wins.fetch_add(1, Ordering::Relaxed);
				}
			})
		})
		.collect();
	for handle in handles {
		handle.join().expect("thread should not panic");
	}

	assert_eq!(wins.load(Ordering::Relaxed), 1);
	assert_eq!(store.factory().region_len(), 1);
	assert!(store.representation(&1).is_some_and(|repr| repr.is_substitute()));
	assert_eq!(store.get(&1).expect("alive").expect("materialised").value(), "one");
}

#[test]
fn test_no_dual_representation_under_concurrent_faults() {
	let store = spill_store();
	let keys = 64u64;
	for key in 0..keys {
		store.put(Entry::new(key, key.to_string())).expect("alive");
	}

	let threads = 8;
	let barrier = Arc::new(Barrier::new(threads));
	let handles: Vec<_> = (0..threads)
		.map(|t| {
			let store = Arc::clone(&store);
			let barrier = Arc::clone(&barrier);
			thread::spawn(move || {
				barrier.wait();
				for i in 0..2_000u64 {
					let key = (i * 7 + t as u64) % keys;
					match (i + t as u64) % 4 {
						0 => {
							store.demote(&key);
						}
						1 => {
							store.promote(&key);
						}
						2 => {
							store.put(Entry::new(key, key.to_string())).expect("alive");
						}
						_ => {
							let entry = store.get(&key).expect("alive").expect("keys are never removed");
							assert_eq!(entry.value(), &key.to_string());
						}
					}
				}
			})
		})
		.collect();
	for handle in handles {
		handle.join().expect("thread should not panic");
	}

	assert_eq!(store.size(), keys as usize);
	let substitutes = store.approximate_tier_count_size(Tier::OnDisk);
	assert_eq!(store.factory().region_len() as u64, substitutes, "one slot per substituted key");
	assert_eq!(store.approximate_tier_count_size(Tier::OnHeap) + substitutes, keys);
}

#[test]
fn test_size_converges_after_concurrent_writes() {
	let store = identity_store(16);
	let threads = 8u64;
	let per_thread = 500u64;
	let barrier = Arc::new(Barrier::new(threads as usize));
	let handles: Vec<_> = (0..threads)
		.map(|t| {
			let store = Arc::clone(&store);
			let barrier = Arc::clone(&barrier);
			thread::spawn(move || {
				barrier.wait();
				let base = t * per_thread;
				for key in base..base + per_thread {
					store.put(Entry::new(key, String::new())).expect("alive");
					let _ = store.size();
				}
				for key in (base..base + per_thread).filter(|key| key % 2 == 0) {
					store.remove(&key).expect("alive");
				}
			})
		})
		.collect();
	for handle in handles {
		handle.join().expect("thread should not panic");
	}

	let expected = (threads * per_thread / 2) as usize;
	assert_eq!(store.size(), expected);
	assert_eq!(store.exact_size(), expected);
	assert_eq!(store.keys().expect("alive").len(), expected);
}

#[test]
fn test_bulk_lock_rolls_back_on_timeout() {
	let store = identity_store(8);
	let keys = keys_in_distinct_segments(&store, 3);

	let held = store.lock_keys([&keys[2]]).expect("alive");
	let result = store.try_lock_keys(keys.iter(), Duration::from_millis(20));
	assert!(matches!(result, Err(StoreError::Timeout(_, 3))));

	let first_two = store.try_lock_keys([&keys[0], &keys[1]], Duration::ZERO).expect("released after timeout");
	assert_eq!(first_two.segments().len(), 2);
	drop(first_two);
	drop(held);

	let all = store.try_lock_keys(keys.iter(), Duration::from_millis(20)).expect("uncontended");
	assert_eq!(all.segments().len(), 3);
	assert!(all.segments().windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn test_keys_guard_operations() {
	let recording = Arc::new(Recording::default());
	let store = StoreBuilder::<u64, String>::new("guarded")
		.segments(8)
		.listener(recording.clone())
		.build(IdentityFactory::new());
	let keys = keys_in_distinct_segments(&store, 3);
	store.put(Entry::new(keys[1], "before".into())).expect("alive");

	{
		let mut guard = store.lock_keys([&keys[0], &keys[1]]).expect("alive");
		assert!(guard.put(Entry::new(keys[0], "zero".into())).expect("locked"));
		assert!(!guard.put(Entry::new(keys[1], "one".into())).expect("locked"));
		assert_eq!(guard.get(&keys[1]).expect("locked").expect("present").value(), "one");

		assert!(matches!(guard.get(&keys[2]), Err(StoreError::NotLocked(_))));
		assert!(matches!(guard.put(Entry::new(keys[2], "two".into())), Err(StoreError::NotLocked(_))));

		let removed = guard.remove(&keys[0]).expect("locked").expect("present");
		assert_eq!(removed.value(), "zero");
		assert!(recording.removed.lock().is_empty(), "listeners run after unlock");
	}

	assert_eq!(*recording.removed.lock(), vec![keys[0]]);
	assert!(store.get(&keys[0]).expect("alive").is_none());
	let entry = store.get(&keys[1]).expect("alive").expect("present");
	assert_eq!(entry.value(), "one");
	assert_eq!(entry.version(), 2);
}

#[test]
fn test_guard_write_evicts_around_held_segments() {
	init_tracing();
	let pool = Pool::builder("heap", 30).build();
	let recording = Arc::new(Recording::default());
	let store = StoreBuilder::<u64, String>::new("guarded")
		.segments(8)
		.pool(&pool, Arc::new(ConstantSizeOfEngine::per_entry(10)))
		.listener(recording.clone())
		.build(IdentityFactory::new());
	let keys = keys_in_distinct_segments(&store, 2);
	let neighbours = keys_sharing_segment(&store, keys[1], 2);
	let held_segment = store.segment_index(&keys[0]);

	store.put(Entry::new(keys[1], "a".into())).expect("fits");
	for key in &neighbours {
		store.put(Entry::new(*key, "b".into())).expect("fits");
	}
	assert_eq!(pool.size(), 30);

	let mut guard = store.lock_keys([&keys[0]]).expect("alive");
	assert!(guard.put(Entry::new(keys[0], "locked".into())).expect("evicts from the other segment"));
	// Evictions made for a guarded write are reported before the guard drops.
	let evicted = recording.evicted_keys.lock().clone();
	assert_eq!(evicted.len(), 1);
	assert!(evicted.iter().all(|key| store.segment_index(key) != held_segment));
	assert!(!guard.put(Entry::new(keys[0], "relocked".into())).expect("same size overwrite"));
	drop(guard);

	assert_eq!(recording.evicted.load(Ordering::Relaxed), 1, "overwrite under the guard evicts nothing");
	assert_eq!(pool.size(), 30);
	assert_eq!(store.size(), 3);
	assert!(store.contains_key(&keys[0]));
}

#[test]
fn test_shared_pool_stays_within_budget() {
	init_tracing();
	let pool = Pool::builder("heap", 1_000).evictor(FromLargestCachePoolEvictor).build();
	let first = pooled_store("first", &pool);
	let second = pooled_store("second", &pool);

	for i in 0u64..150 {
		let store = if i % 2 == 0 { &first } else { &second };
		store.put(Entry::new(i, i.to_string())).expect("eviction makes room");
		assert!(pool.size() <= 1_000);
	}

	let live = first.size() + second.size();
	assert_eq!(live, 100);
	assert_eq!(pool.size(), live as u64 * 10);
	assert_eq!(first.accessor().expect("pooled").size() + second.accessor().expect("pooled").size(), pool.size());
	assert_eq!(first.metrics().evictions + second.metrics().evictions, 50);

	// Each write trims whichever store grew last: the larger account, or on a
	// tie the older one.
	assert_eq!(first.size(), 49);
	assert_eq!(second.size(), 51);
	assert_eq!(first.metrics().evictions, 26);
	assert_eq!(second.metrics().evictions, 24);
}

#[test]
fn test_overwrites_in_a_full_pool_keep_every_key() {
	let pool = Pool::builder("heap", 30).build();
	let store = pooled_store("full", &pool);
	for key in 0u64..3 {
		store.put(Entry::new(key, "v0".into()).pinned(key == 0)).expect("fits");
	}

	for round in 1..20 {
		for key in 0u64..3 {
			assert!(!store.put(Entry::new(key, format!("v{round}")).pinned(key == 0)).expect("same size fits"));
		}
	}

	assert_eq!(store.size(), 3);
	assert_eq!(pool.size(), 30);
	assert_eq!(store.metrics().evictions, 0);
	assert_eq!(store.metrics().updates, 57);
}

#[test]
fn test_entry_larger_than_the_pool_is_denied_up_front() {
	init_tracing();
	let pool = Pool::builder("heap", 100).build();
	let store = StoreBuilder::<u64, String>::new("sized")
		.segments(8)
		.pool(&pool, Arc::new(ByLength))
		.build(IdentityFactory::new());
	for key in 0u64..9 {
		store.put(Entry::new(key, "x".repeat(10))).expect("fits");
	}

	let denied = store.put(Entry::new(99, "x".repeat(500))).expect_err("larger than the budget");
	assert_eq!(
		denied,
		StoreError::Pool(PoolError::Capacity {
			requested: 500,
			available: 10
		})
	);
	assert_eq!(store.size(), 9);
	assert_eq!(pool.size(), 90);
	assert_eq!(store.metrics().evictions, 0);
}

#[test]
fn test_concurrent_writers_share_budget() {
	init_tracing();
	for kind in [AccessorKind::Atomic, AccessorKind::Locked] {
		let pool = Pool::builder("heap", 500).accessor_kind(kind).build();
		let stores: Vec<IdentityStore> = (0..4).map(|i| pooled_store(&format!("s{i}"), &pool)).collect();

		let barrier = Arc::new(Barrier::new(stores.len()));
		let handles: Vec<_> = stores
			.iter()
			.map(|store| {
				let store = Arc::clone(store);
				let pool = pool.clone();
				let barrier = Arc::clone(&barrier);
				thread::spawn(move || {
					barrier.wait();
					for key in 0u64..500 {
						let _ = store.put(Entry::new(key, String::new()));
						assert!(pool.size() <= 500);
					}
				})
			})
			.collect();
		for handle in handles {
			handle.join().expect("thread should not panic");
		}

		assert!(pool.size() <= 500);
		let charged: u64 = stores.iter().map(|store| store.accessor().expect("pooled").size()).sum();
		assert_eq!(charged, pool.size());
	}
}

#[test]
fn test_balanced_evictor_spares_the_hot_store() {
	init_tracing();
	let pool = Pool::builder("heap", 400).evictor(BalancedAccessEvictor::new()).build();
	let recording = Arc::new(Recording::default());
	let hot = pooled_store("hot", &pool);
	let cold = StoreBuilder::<u64, String>::new("cold")
		.segments(8)
		.pool(&pool, Arc::new(ConstantSizeOfEngine::per_entry(10)))
		.listener(recording.clone())
		.build(IdentityFactory::new());

	for key in 0u64..20 {
		hot.put(Entry::new(key, String::new())).expect("fits");
		cold.put(Entry::new(key, String::new())).expect("fits");
	}
	for _ in 0..10 {
		for key in 0u64..20 {
			hot.get(&key).expect("alive").expect("present");
		}
	}

	for key in 100u64..110 {
		hot.put(Entry::new(key, String::new())).expect("cold store gives way");
	}

	assert_eq!(hot.size(), 30);
	assert_eq!(cold.size(), 10);
	assert_eq!(recording.evicted.load(Ordering::Relaxed), 10);
	assert!(pool.size() <= 400);
}

#[test]
fn test_pinned_entries_survive_pool_pressure() {
	let pool = Pool::builder("heap", 100).build();
	let store = pooled_store("pinned", &pool);
	for key in 0u64..5 {
		store.put(Entry::new(key, String::new()).pinned(true)).expect("fits");
	}
	for key in 100u64..200 {
		store.put(Entry::new(key, String::new())).expect("unpinned entries rotate");
	}

	for key in 0u64..5 {
		assert!(store.contains_key(&key), "pinned {key} evicted");
	}
	assert_eq!(store.size(), 10);
}

#[test]
fn test_context_shutdown_unlinks_every_store() {
	let context = StoreContext::new();
	let pool = context.register(Pool::builder("heap", 1_000));
	let first = pooled_store("first", &pool);
	let second = pooled_store("second", &pool);
	first.put(Entry::new(1, "a".into())).expect("fits");
	second.put(Entry::new(1, "b".into())).expect("fits");
	assert_eq!(pool.size(), 20);
	assert_eq!(pool.accounts().len(), 2);

	context.shutdown();

	assert_eq!(pool.size(), 0);
	assert!(pool.accounts().is_empty());
	assert_eq!(first.put(Entry::new(2, "c".into())), Err(StoreError::Pool(PoolError::Unlinked)));
}

#[test]
fn test_dispose_returns_bytes_to_shared_pool() {
	let pool = Pool::builder("heap", 1_000).build();
	let first = pooled_store("first", &pool);
	let second = pooled_store("second", &pool);
	for key in 0u64..10 {
		first.put(Entry::new(key, String::new())).expect("fits");
		second.put(Entry::new(key, String::new())).expect("fits");
	}
	assert_eq!(pool.size(), 200);

	first.dispose();

	assert_eq!(pool.size(), 100);
	assert_eq!(pool.accounts().len(), 1);
	assert_eq!(second.get(&3).expect("alive").map(|entry| entry.key().to_owned()), Some(3));
}
