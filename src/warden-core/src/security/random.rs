//! Helpers over the operating system CSPRNG.

use std::time::Duration;

use rand::rngs::OsRng;
use rand::{Rng, RngCore};

/// Random `u32`.
pub fn u32() -> u32 {
    OsRng.next_u32()
}

/// Random `u64`.
pub fn u64() -> u64 {
    OsRng.next_u64()
}

/// `n` random bytes.
pub fn bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// `n` random bytes, hex encoded (`2n` characters).
pub fn hex(n: usize) -> String {
    hex::encode(bytes(n))
}

/// Uniform duration in `[min, max]`, at millisecond resolution.
///
/// Returns `min` when the range is empty.
pub fn duration_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = u64::try_from((max - min).as_millis()).unwrap_or(u64::MAX);
    min + Duration::from_millis(OsRng.gen_range(0..=span))
}
