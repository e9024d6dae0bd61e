use std::cmp::Reverse;
use std::sync::Arc;

use hashbrown::HashSet;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use super::{PoolAccount, PoolParticipant};

/// Policy choosing which participants give up bytes when a pool is full.
///
/// Implementations must tolerate participants that evict nothing (empty, or
/// only pinned entries left) and must not assume any ordering of `accounts`.
pub trait PoolEvictor: Send + Sync {
	/// Try to free `bytes` across `accounts`. Returns whether enough was freed.
	fn free_space(&self, accounts: &[Arc<PoolAccount>], bytes: u64) -> bool;
}

/// Evicts one entry at a time from whichever untried participant holds the
/// most bytes.
///
/// A participant that evicts nothing, or whose size does not drop, is marked
/// tried and skipped for the rest of the call.
#[derive(Debug, Clone, Copy, Default)]
pub struct FromLargestCachePoolEvictor;

impl PoolEvictor for FromLargestCachePoolEvictor {
	fn free_space(&self, accounts: &[Arc<PoolAccount>], bytes: u64) -> bool {
		let mut remaining = bytes;
		let mut tried = HashSet::new();

		while remaining > 0 {
			let largest = accounts
				.iter()
				.filter(|account| account.is_linked() && !tried.contains(&account.id()))
				.max_by_key(|account| (account.size(), Reverse(account.id())));
			let Some(account) = largest else {
				return false;
			};
			let Some(participant) = account.participant() else {
				tried.insert(account.id());
				continue;
			};

			let before = account.size();
			let evicted = participant.evict(1, remaining);
			let freed = before.saturating_sub(account.size());
			if !evicted || freed == 0 {
				tried.insert(account.id());
			}
			remaining = remaining.saturating_sub(freed);
		}
		true
	}
}

/// Evicts from the participants whose residents are currently worth least.
///
/// Participants are shuffled and costed in batches. Within a batch the
/// cheapest participant is asked first, for as many entries as its mean entry
/// size says are needed to cover the remaining bytes.
///
/// Cost of a participant holding `byte_size` bytes, relative to the batch's
/// average byte size:
///
/// - no hits and no misses: `-∞` when above average, `0` otherwise
/// - misses but no hits: `+∞`
/// - hits but no entries counted yet: `+∞`
/// - otherwise `(hit_rate / entry_count) * (byte_size / average)^-α`
#[derive(Debug, Clone, Copy)]
pub struct BalancedAccessEvictor {
	sample_size: usize,
	alpha: f64,
}

impl Default for BalancedAccessEvictor {
	fn default() -> Self {
		Self {
			sample_size: 5,
			alpha: 1.0,
		}
	}
}

impl BalancedAccessEvictor {
	pub fn new() -> Self {
		Self::default()
	}

	/// Participants costed together per batch.
	pub fn with_sample_size(mut self, sample_size: usize) -> Self {
		self.sample_size = sample_size.max(1);
		self
	}

	pub fn with_alpha(mut self, alpha: f64) -> Self {
		self.alpha = alpha;
		self
	}

	/// Eviction cost of `participant` holding `byte_size` bytes in a batch
	/// averaging `average_size` bytes. Lower is evicted first.
	pub fn cost(&self, participant: &dyn PoolParticipant, byte_size: u64, average_size: f64) -> f64 {
		let hit_rate = f64::from(participant.approximate_hit_rate());
		let miss_rate = f64::from(participant.approximate_miss_rate());
		let access_rate = hit_rate + miss_rate;

		if access_rate == 0.0 {
			return if byte_size as f64 > average_size {
				f64::NEG_INFINITY
			} else {
				0.0
			};
		}
		if hit_rate == 0.0 {
			return f64::INFINITY;
		}

		let count = participant.approximate_count_size();
		if count == 0 {
			return f64::INFINITY;
		}
		let count = count as f64;
		let fill_level = byte_size as f64 / average_size;
		let cost = (hit_rate / count) * fill_level.powf(-self.alpha);
		if cost.is_nan() {
			warn!(hit_rate, miss_rate, count, fill_level, "eviction cost is NaN, treating as most expensive");
			return f64::INFINITY;
		}
		cost
	}
}

impl PoolEvictor for BalancedAccessEvictor {
	fn free_space(&self, accounts: &[Arc<PoolAccount>], bytes: u64) -> bool {
		if bytes == 0 {
			return true;
		}
		let mut candidates: Vec<Arc<PoolAccount>> =
			accounts.iter().filter(|account| account.is_linked()).cloned().collect();
		candidates.shuffle(&mut rand::rng());

		let mut remaining = bytes;
		for batch in candidates.chunks(self.sample_size) {
			let total: u64 = batch.iter().map(|account| account.size()).sum();
			let average = total as f64 / batch.len() as f64;

			let mut costed: Vec<(f64, &Arc<PoolAccount>, Arc<dyn PoolParticipant>)> = batch
				.iter()
				.filter_map(|account| {
					let participant = account.participant()?;
					let cost = self.cost(participant.as_ref(), account.size(), average);
					Some((cost, account, participant))
				})
				.collect();
			costed.sort_by(|a, b| a.0.total_cmp(&b.0));

			for (cost, account, participant) in costed {
				let before = account.size();
				if before == 0 {
					continue;
				}
				let count = participant.approximate_count_size().max(1);
				let mean_entry_size = (before / count).max(1);
				let wanted = usize::try_from(remaining.div_ceil(mean_entry_size)).unwrap_or(usize::MAX).max(1);

				participant.evict(wanted, remaining);
				let freed = before.saturating_sub(account.size());
				debug!(account = account.id(), cost, wanted, freed, "balanced eviction");
				remaining = remaining.saturating_sub(freed);
				if remaining == 0 {
					return true;
				}
			}
		}
		false
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Weak;

	use parking_lot::Mutex;

	use super::*;
	use crate::pool::{ConstantSizeOfEngine, Pool, PoolAccessor};

	/// Participant with `evictable` bytes it is willing to give up, released in
	/// `unit`-byte entries. Every eviction round is appended to `log`.
	struct Fake {
		name: &'static str,
		accessor: Mutex<Option<Arc<PoolAccessor<u64, u64>>>>,
		evictable: Mutex<u64>,
		unit: u64,
		hit_rate: f32,
		miss_rate: f32,
		log: Arc<Mutex<Vec<&'static str>>>,
	}

	impl PoolParticipant for Fake {
		fn evict(&self, count: usize, _size: u64) -> bool {
			self.log.lock().push(self.name);
			let guard = self.accessor.lock();
			let Some(accessor) = guard.as_ref() else {
				return false;
			};
			let mut evictable = self.evictable.lock();
			let mut evicted = false;
			for _ in 0..count {
				if *evictable < self.unit {
					break;
				}
				accessor.delete(self.unit).expect("linked");
				*evictable -= self.unit;
				evicted = true;
			}
			evicted
		}

		fn approximate_hit_rate(&self) -> f32 {
			self.hit_rate
		}

		fn approximate_miss_rate(&self) -> f32 {
			self.miss_rate
		}

		fn approximate_count_size(&self) -> u64 {
			self.accessor.lock().as_ref().map_or(0, |a| a.size() / self.unit)
		}
	}

	struct Setup {
		pool: Pool,
		fakes: Vec<Arc<Fake>>,
		log: Arc<Mutex<Vec<&'static str>>>,
	}

	impl Setup {
		fn new(max_size: u64) -> Self {
			Self {
				pool: Pool::builder("test", max_size).build(),
				fakes: Vec::new(),
				log: Arc::new(Mutex::new(Vec::new())),
			}
		}

		fn add(&mut self, name: &'static str, size: u64, evictable: u64, hit_rate: f32, miss_rate: f32) {
			let fake = Arc::new(Fake {
				name,
				accessor: Mutex::new(None),
				evictable: Mutex::new(evictable),
				unit: 10,
				hit_rate,
				miss_rate,
				log: Arc::clone(&self.log),
			});
			let weak: Weak<dyn PoolParticipant> = Arc::downgrade(&fake) as Weak<dyn PoolParticipant>;
			let accessor = self.pool.create_accessor(weak, Arc::new(ConstantSizeOfEngine::per_entry(10)));
			accessor.reserve(size, true).expect("linked");
			*fake.accessor.lock() = Some(Arc::new(accessor));
			self.fakes.push(fake);
		}

		fn log(&self) -> Vec<&'static str> {
			self.log.lock().clone()
		}
	}

	impl Drop for Setup {
		fn drop(&mut self) {
			for fake in &self.fakes {
				fake.accessor.lock().take();
			}
		}
	}

	#[test]
	fn test_from_largest_starts_with_largest_then_moves_on() {
		let mut setup = Setup::new(1000);
		setup.add("a", 100, 40, 0.0, 0.0);
		setup.add("b", 50, 50, 0.0, 0.0);
		setup.add("c", 10, 10, 0.0, 0.0);

		assert!(FromLargestCachePoolEvictor.free_space(&setup.pool.accounts(), 60));

		let log = setup.log();
		assert_eq!(log.first(), Some(&"a"));
		let after_a: Vec<_> = log.iter().skip_while(|name| **name == "a").collect();
		assert_eq!(after_a.first(), Some(&&"b"));
		assert!(!log.contains(&"c"));
		assert_eq!(setup.pool.size(), 100);
	}

	#[test]
	fn test_from_largest_reports_failure_when_nothing_evictable() {
		let mut setup = Setup::new(1000);
		setup.add("a", 100, 0, 0.0, 0.0);
		setup.add("b", 50, 0, 0.0, 0.0);

		assert!(!FromLargestCachePoolEvictor.free_space(&setup.pool.accounts(), 10));
		assert_eq!(setup.log(), vec!["a", "b"]);
		assert_eq!(setup.pool.size(), 150);
	}

	#[test]
	fn test_from_largest_zero_bytes_is_free() {
		let setup = Setup::new(10);
		assert!(FromLargestCachePoolEvictor.free_space(&setup.pool.accounts(), 0));
	}

	#[test]
	fn test_balanced_cost_classes() {
		let evictor = BalancedAccessEvictor::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		let fake = |hit_rate, miss_rate| Fake {
			name: "x",
			accessor: Mutex::new(None),
			evictable: Mutex::new(0),
			unit: 10,
			hit_rate,
			miss_rate,
			log: Arc::clone(&log),
		};

		assert_eq!(evictor.cost(&fake(0.0, 0.0), 200, 100.0), f64::NEG_INFINITY);
		assert_eq!(evictor.cost(&fake(0.0, 0.0), 50, 100.0), 0.0);
		assert_eq!(evictor.cost(&fake(0.0, 5.0), 50, 100.0), f64::INFINITY);
		assert_eq!(evictor.cost(&fake(10.0, 1.0), 50, 100.0), f64::INFINITY, "hits with no entries counted");

		let mut setup = Setup::new(1000);
		setup.add("counted", 100, 0, 10.0, 1.0);
		// 10 hits/s over 10 entries, at half the batch average.
		assert_eq!(evictor.cost(setup.fakes[0].as_ref(), 50, 100.0), 2.0);
		assert_eq!(evictor.cost(setup.fakes[0].as_ref(), 200, 100.0), 0.5);
	}

	#[test]
	fn test_balanced_cost_nan_is_most_expensive() {
		let mut setup = Setup::new(1000);
		setup.add("x", 100, 0, 10.0, 0.0);
		let evictor = BalancedAccessEvictor::new().with_alpha(f64::NAN);
		assert_eq!(evictor.cost(setup.fakes[0].as_ref(), 50, 100.0), f64::INFINITY);
	}

	#[test]
	fn test_balanced_prefers_idle_over_hot() {
		for _ in 0..20 {
			let mut setup = Setup::new(1000);
			setup.add("hot", 100, 100, 100.0, 0.0);
			setup.add("idle", 100, 100, 0.0, 0.0);

			assert!(BalancedAccessEvictor::new().free_space(&setup.pool.accounts(), 30));
			assert_eq!(setup.log(), vec!["idle"]);
		}
	}

	#[test]
	fn test_balanced_moves_to_next_when_cheapest_is_pinned() {
		let mut setup = Setup::new(1000);
		setup.add("hot", 100, 100, 100.0, 0.0);
		setup.add("idle", 100, 0, 0.0, 0.0);

		assert!(BalancedAccessEvictor::new().free_space(&setup.pool.accounts(), 30));
		assert_eq!(setup.log(), vec!["idle", "hot"]);
	}

	#[test]
	fn test_balanced_reports_failure_when_nothing_evictable() {
		let mut setup = Setup::new(1000);
		setup.add("a", 100, 0, 1.0, 1.0);
		setup.add("b", 100, 0, 0.0, 0.0);

		assert!(!BalancedAccessEvictor::new().free_space(&setup.pool.accounts(), 30));
		assert_eq!(setup.pool.size(), 200);
	}
}
