//! Opaque predicates: branches whose outcome is fixed but not obvious
//! to a static reader.

use std::hint::black_box;

use super::unix_nanos;

/// Predicates over the clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpaquePredicates;

impl OpaquePredicates {
    /// Create a predicate source.
    pub fn new() -> Self {
        Self
    }

    /// `x² + x` is even for every integer.
    pub fn always_true(&self) -> bool {
        let x = black_box(unix_nanos());
        x.wrapping_mul(x).wrapping_add(x) & 1 == 0
    }

    /// `x` and `x + 1` are never both odd.
    pub fn always_false(&self) -> bool {
        let x = black_box(unix_nanos());
        x & 1 == 1 && x.wrapping_add(1) & 1 == 1
    }

    /// Returns `expected` through arithmetic the optimizer cannot fold.
    pub fn random_looking(&self, expected: bool) -> bool {
        let a = black_box(7u64);
        let b = black_box(3u64);
        let c = a * a + b * b;
        if expected {
            c == 58
        } else {
            c == 59
        }
    }

    /// Run `check` behind decoy branches.
    pub fn confusing_branch(&self, check: impl FnOnce() -> bool) -> bool {
        if self.always_false() {
            return true;
        }
        if self.always_true() {
            return check();
        }
        false
    }
}
