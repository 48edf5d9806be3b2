//! Shared pool of seeded pseudo-random generators
//!
//! Endpoint selection draws random numbers on every new session, potentially
//! from many sessions at once. Instead of a process-global generator behind a
//! mutex, each thread checks out its own `StdRng`, seeded from the operating
//! system entropy source on first use. Checkout is a thread-local borrow, so
//! the hot path takes no lock.
//!
//! The generators do not need to be cryptographic: endpoint choice is not a
//! secret, only the seed quality matters for spread.

use std::cell::RefCell;

use rand::rngs::StdRng;
use rand::SeedableRng;

thread_local! {
    static POOL: RefCell<StdRng> = RefCell::new(StdRng::from_entropy());
}

/// Borrow this thread's generator for the duration of the closure.
///
/// Re-entrant borrows are a programming error and panic; keep the closure
/// free of calls back into this module.
pub fn borrow<T>(f: impl FnOnce(&mut StdRng) -> T) -> T {
    POOL.with(|rng| f(&mut rng.borrow_mut()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn draws_are_well_distributed() {
        let mut buckets = [0u32; 8];
        for _ in 0..8000 {
            let v = borrow(|rng| rng.gen_range(0..8));
            buckets[v] += 1;
        }
        for &count in &buckets {
            assert!(count > 700, "bucket occupancy too low: {count}");
        }
    }

    #[test]
    fn threads_get_independent_generators() {
        let a: u64 = borrow(|rng| rng.gen());
        let b: u64 = std::thread::spawn(|| borrow(|rng| rng.gen()))
            .join()
            .unwrap();
        // Not a correctness property, but a collision here is a 2^-64 event.
        assert_ne!(a, b);
    }
}
