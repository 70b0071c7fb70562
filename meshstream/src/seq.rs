//! Modular sequence-number arithmetic.
//!
//! Sequence numbers are u32 and wrap modulo 2^32. Comparisons interpret the
//! wrapped difference as a signed value in (-2^31, 2^31], the standard
//! serial-number rule, so ordering survives wraparound.

/// Returns `true` if `a` is strictly before `b` in sequence space.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Returns `true` if `a` is at or before `b` in sequence space.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// Forward distance from `b` to `a` (how far `a` is ahead of `b`).
///
/// Only meaningful when `seq_le(b, a)` holds; the caller is expected to have
/// established that ordering first.
#[inline]
pub fn seq_distance(a: u32, b: u32) -> u32 {
    a.wrapping_sub(b)
}
