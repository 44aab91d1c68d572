//! Random Source Adapters

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ports::RandomSource;

/// Production random source seeded from OS entropy.
#[derive(Debug)]
pub struct OsRandomSource {
    rng: Mutex<StdRng>,
}

impl OsRandomSource {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl Default for OsRandomSource {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomSource for OsRandomSource {
    fn gen_range(&self, upper: u64) -> u64 {
        if upper == 0 {
            return 0;
        }
        self.rng.lock().gen_range(0..upper)
    }
}

/// Reproducible random source for simulations and tests.
///
/// # Example
///
/// ```rust
/// use popnode_registry::adapters::SeededRandomSource;
/// use popnode_registry::RandomSource;
///
/// let a = SeededRandomSource::new(7);
/// let b = SeededRandomSource::new(7);
/// assert_eq!(a.gen_range(1000), b.gen_range(1000));
/// ```
#[derive(Debug)]
pub struct SeededRandomSource {
    rng: Mutex<StdRng>,
}

impl SeededRandomSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandomSource {
    fn gen_range(&self, upper: u64) -> u64 {
        if upper == 0 {
            return 0;
        }
        self.rng.lock().gen_range(0..upper)
    }
}
