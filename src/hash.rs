//! Key hashing and segment routing.
//!
//! Native hashes come from a fixed-key `AHasher` so routing is stable for the
//! lifetime of the process. The 64-bit result is folded to 32 bits and run
//! through a shift/add cascade that pushes entropy into the high bits, which
//! select the segment, and keeps the low bits usable for bucket selection.

use std::hash::{Hash, Hasher};

use ahash::AHasher;

/// Native hash of a key, folded to 32 bits.
pub(crate) fn native_hash<K: Hash + ?Sized>(key: &K) -> u32 {
	let mut hasher = AHasher::default();
	key.hash(&mut hasher);
	let h = hasher.finish();
	(h ^ (h >> 32)) as u32
}

/// Spread a native hash to defend against clustering in the low bits.
pub fn spread(hash: u32) -> u32 {
	let mut h = hash;
	h = h.wrapping_add((h << 15) ^ 0xffff_cd7d);
	h ^= h >> 10;
	h = h.wrapping_add(h << 3);
	h ^= h >> 6;
	h = h.wrapping_add((h << 2).wrapping_add(h << 14));
	h ^ (h >> 16)
}

/// Spread hash of a key.
pub fn hash_key<K: Hash + ?Sized>(key: &K) -> u32 {
	spread(native_hash(key))
}

/// Shift applied to a spread hash to obtain a segment index for
/// `segment_count` segments (a power of two).
pub(crate) fn segment_shift(segment_count: usize) -> u32 {
	debug_assert!(segment_count.is_power_of_two());
	32 - segment_count.trailing_zeros()
}

/// Segment index from the top bits of a spread hash.
#[inline]
pub(crate) fn segment_index(hash: u32, shift: u32) -> usize {
	// A single segment needs a shift of 32, which `>>` does not allow.
	hash.checked_shr(shift).unwrap_or(0) as usize
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_spread_is_deterministic() {
		assert_eq!(spread(12345), spread(12345));
		assert_eq!(hash_key(&"alpha"), hash_key(&"alpha"));
	}

	#[test]
	fn test_spread_mixes_low_bits() {
		// Hashes that differ only in low bits should land in different high bits.
		let shift = segment_shift(64);
		let segments: std::collections::HashSet<usize> =
			(0u32..64).map(|h| segment_index(spread(h), shift)).collect();
		assert!(segments.len() > 16, "only {} distinct segments", segments.len());
	}

	#[test]
	fn test_segment_shift() {
		assert_eq!(segment_shift(64), 26);
		assert_eq!(segment_shift(1), 32);
		assert_eq!(segment_index(u32::MAX, segment_shift(64)), 63);
		assert_eq!(segment_index(u32::MAX, segment_shift(1)), 0);
	}
}
