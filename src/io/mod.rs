//! I/O Abstractions
//!
//! Randomness is injected through the [`Rng`] trait so the same code paths
//! run in production (entropy-seeded) and under deterministic simulation
//! (seed-controlled, fully replayable).

pub mod production;
pub mod simulation;

pub use production::ProductionRng;
pub use simulation::SimulatedRng;

/// Source of randomness used by producers, fault injection and the DST harness
pub trait Rng: Send {
    fn next_u64(&mut self) -> u64;

    fn gen_bool(&mut self, probability: f64) -> bool;

    /// Uniform value in `[min, max)`. Returns `min` when the range is empty.
    fn gen_range(&mut self, min: u64, max: u64) -> u64;

    fn shuffle<T>(&mut self, slice: &mut [T]);

    /// Fill `dest` with random bytes
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}
