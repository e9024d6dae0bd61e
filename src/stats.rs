//! Decayed per-second event rates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Weight of the previous rate when a sampling window is folded in.
const DECAY: f32 = 0.5;

const WINDOW: Duration = Duration::from_secs(1);

struct Window {
	started: Instant,
	count_at_start: u64,
	rate: f32,
	completed: bool,
}

/// Counts events and reports an approximate, exponentially decayed rate.
///
/// Recording is a single atomic add. The rate is recomputed lazily when read:
/// once a window of at least a second has passed, its rate is blended into the
/// running rate and a new window starts. A window still in progress is
/// reported as its events over at least one second.
pub struct RateCounter {
	total: AtomicU64,
	window: Mutex<Window>,
}

impl Default for RateCounter {
	fn default() -> Self {
		Self::new()
	}
}

impl RateCounter {
	pub fn new() -> Self {
		Self::starting_at(Instant::now())
	}

	fn starting_at(started: Instant) -> Self {
		Self {
			total: AtomicU64::new(0),
			window: Mutex::new(Window {
				started,
				count_at_start: 0,
				rate: 0.0,
				completed: false,
			}),
		}
	}

	pub fn record(&self) {
		self.total.fetch_add(1, Ordering::Relaxed);
	}

	/// Events recorded since creation.
	pub fn total(&self) -> u64 {
		self.total.load(Ordering::Relaxed)
	}

	/// Approximate events per second.
	pub fn rate(&self) -> f32 {
		self.rate_at(Instant::now())
	}

	fn rate_at(&self, now: Instant) -> f32 {
		let total = self.total();
		let mut window = self.window.lock();
		let elapsed = now.saturating_duration_since(window.started);
		let events = total.saturating_sub(window.count_at_start) as f32;
		let current = events / elapsed.max(WINDOW).as_secs_f32();

		if elapsed < WINDOW {
			return if window.completed {
				window.rate * DECAY + current * (1.0 - DECAY)
			} else {
				current
			};
		}

		window.rate = if window.completed {
			window.rate * DECAY + current * (1.0 - DECAY)
		} else {
			current
		};
		window.completed = true;
		window.started = now;
		window.count_at_start = total;
		window.rate
	}
}
