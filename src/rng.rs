//! Minimal OS-seeded randomness for grip/weather sampling.
//!
//! `std::collections::hash_map::RandomState` draws a fresh random key from the OS
//! on every construction; hashing nothing still yields a value derived from that
//! key, which is enough entropy for the dynamic-track/weather sampling this server
//! needs without pulling in a dedicated RNG crate.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};

/// A pseudo-random value in `[0, 1)`.
pub fn unit() -> f32 {
    let bits = RandomState::new().build_hasher().finish();
    (bits >> 11) as f32 / (1u64 << 53) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_stays_in_range() {
        for _ in 0..1000 {
            let v = unit();
            assert!((0.0..1.0).contains(&v), "value out of range: {v}");
        }
    }
}
