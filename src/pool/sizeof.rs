//! Measuring the byte footprint of stored entries.

use std::mem::size_of;

use deepsize::DeepSizeOf;

use crate::entry::Entry;

/// Outcome of a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
	pub bytes: u64,
	/// `false` when the engine gave up walking the object graph and `bytes`
	/// is a lower bound.
	pub exact: bool,
}

impl Size {
	pub fn exact(bytes: u64) -> Self {
		Self {
			bytes,
			exact: true,
		}
	}

	pub fn approximate(bytes: u64) -> Self {
		Self {
			bytes,
			exact: false,
		}
	}
}

/// Measures a key, a value and the container holding them.
pub trait SizeOfEngine<K, V>: Send + Sync {
	fn size_of(&self, key: &K, value: &V, container: &Entry<K, V>) -> Size;
}

/// Engine reporting fixed sizes for every key, value and container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantSizeOfEngine {
	key: u64,
	value: u64,
	container: u64,
}

impl ConstantSizeOfEngine {
	pub fn new(key: u64, value: u64, container: u64) -> Self {
		Self {
			key,
			value,
			container,
		}
	}

	/// Engine charging `bytes` per entry in total.
	pub fn per_entry(bytes: u64) -> Self {
		Self::new(0, bytes, 0)
	}
}

impl<K, V> SizeOfEngine<K, V> for ConstantSizeOfEngine {
	fn size_of(&self, _key: &K, _value: &V, _container: &Entry<K, V>) -> Size {
		Size::exact(self.key + self.value + self.container)
	}
}

/// Engine walking keys and values with [`DeepSizeOf`].
///
/// The container is charged its shallow size minus the inline key and value,
/// plus the two reference counts of the `Arc` it is stored in. With a
/// `max_bytes` limit, larger measurements are capped and reported as
/// approximate.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeepSizeOfEngine {
	max_bytes: Option<u64>,
}

impl DeepSizeOfEngine {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_max_bytes(max_bytes: u64) -> Self {
		Self {
			max_bytes: Some(max_bytes),
		}
	}
}

impl<K: DeepSizeOf, V: DeepSizeOf> SizeOfEngine<K, V> for DeepSizeOfEngine {
	fn size_of(&self, key: &K, value: &V, _container: &Entry<K, V>) -> Size {
		let container = size_of::<Entry<K, V>>() - size_of::<K>() - size_of::<V>()
			+ 2 * size_of::<usize>();
		let bytes = (key.deep_size_of() + value.deep_size_of() + container) as u64;
		match self.max_bytes {
			Some(max) if bytes > max => Size::approximate(max),
			_ => Size::exact(bytes),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_constant_engine() {
		let engine = ConstantSizeOfEngine::new(1, 2, 3);
		let entry = Entry::new(1u64, 2u64);
		assert_eq!(engine.size_of(&1u64, &2u64, &entry), Size::exact(6));
	}

	#[test]
	fn test_deep_engine_counts_heap_data() {
		let engine = DeepSizeOfEngine::new();
		let small = Entry::new(1u64, vec![0u8; 8]);
		let large = Entry::new(1u64, vec![0u8; 1024]);

		let small_size = engine.size_of(small.key(), small.value(), &small);
		let large_size = engine.size_of(large.key(), large.value(), &large);

		assert!(small_size.exact);
		assert!(large_size.bytes >= small_size.bytes + 1000);
	}

	#[test]
	fn test_deep_engine_caps_and_flags_approximate() {
		let engine = DeepSizeOfEngine::with_max_bytes(64);
		let entry = Entry::new(1u64, vec![0u8; 4096]);
		let size = engine.size_of(entry.key(), entry.value(), &entry);
		assert_eq!(size, Size::approximate(64));
	}
}
