//! BUGGIFY - Deterministic Fault Injection
//!
//! Every decision point that talks to a failure domain (storage commit,
//! transport ack, delivery ordering, session lifetime) can be turned into a
//! fault site. Decisions draw from the caller's [`crate::io::Rng`], so a
//! failing seed replays the exact same fault sequence.
//!
//! ```ignore
//! if buggify!(&mut rng, faults::sink::COMMIT_FAIL) {
//!     return Err(SinkError::Rejected("injected".into()));
//! }
//!
//! // Explicit probability overrides the configured one
//! if buggify!(&mut rng, faults::transport::DELIVERY_REORDER, 0.25) {
//!     rng.shuffle(&mut window);
//! }
//! ```

pub mod config;
pub mod faults;

pub use config::FaultConfig;
pub use faults::ALL_FAULTS;

use std::cell::RefCell;
use std::collections::HashMap;

/// Check/trigger counters per fault id
#[derive(Debug, Clone, Default)]
pub struct BuggifyStats {
    pub checks: HashMap<String, u64>,
    pub triggers: HashMap<String, u64>,
}

impl BuggifyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_check(&mut self, fault_id: &str) {
        *self.checks.entry(fault_id.to_string()).or_insert(0) += 1;
    }

    pub fn record_trigger(&mut self, fault_id: &str) {
        *self.triggers.entry(fault_id.to_string()).or_insert(0) += 1;
    }

    pub fn triggered(&self, fault_id: &str) -> u64 {
        self.triggers.get(fault_id).copied().unwrap_or(0)
    }

    /// Fold another run's counters into this one
    pub fn merge(&mut self, other: &BuggifyStats) {
        for (id, n) in &other.checks {
            *self.checks.entry(id.clone()).or_insert(0) += n;
        }
        for (id, n) in &other.triggers {
            *self.triggers.entry(id.clone()).or_insert(0) += n;
        }
    }

    pub fn summary(&self) -> String {
        let mut ids: Vec<_> = self.checks.keys().collect();
        ids.sort();

        let mut lines = vec!["BUGGIFY Statistics:".to_string()];
        for id in ids {
            let checks = self.checks.get(id).copied().unwrap_or(0);
            lines.push(format!("  {}: {}/{}", id, self.triggered(id), checks));
        }
        lines.join("\n")
    }
}

thread_local! {
    static BUGGIFY_CONTEXT: RefCell<BuggifyContext> = RefCell::new(BuggifyContext::default());
}

/// Per-thread fault configuration and counters
#[derive(Debug, Default)]
pub struct BuggifyContext {
    pub config: FaultConfig,
    pub stats: BuggifyStats,
}

/// Replace the fault configuration for the current thread
pub fn set_config(config: FaultConfig) {
    BUGGIFY_CONTEXT.with(|ctx| {
        ctx.borrow_mut().config = config;
    });
}

pub fn get_stats() -> BuggifyStats {
    BUGGIFY_CONTEXT.with(|ctx| ctx.borrow().stats.clone())
}

pub fn reset_stats() {
    BUGGIFY_CONTEXT.with(|ctx| {
        ctx.borrow_mut().stats = BuggifyStats::new();
    });
}

/// Check a fault site using the thread's configured probability
#[inline]
pub fn should_buggify<R: crate::io::Rng>(rng: &mut R, fault_id: &str) -> bool {
    BUGGIFY_CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        ctx.stats.record_check(fault_id);

        let prob = ctx.config.get(fault_id);
        if prob <= 0.0 {
            return false;
        }

        let triggered = draw(rng) < prob;
        if triggered {
            ctx.stats.record_trigger(fault_id);
        }
        triggered
    })
}

/// Check a fault site with an explicit probability
#[inline]
pub fn should_buggify_with_prob<R: crate::io::Rng>(
    rng: &mut R,
    fault_id: &str,
    probability: f64,
) -> bool {
    BUGGIFY_CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        ctx.stats.record_check(fault_id);

        if !ctx.config.enabled {
            return false;
        }

        // Draw even at probability zero so the RNG stream does not depend on
        // which sites are configured.
        let triggered = draw(rng) < probability.clamp(0.0, 1.0);
        if triggered {
            ctx.stats.record_trigger(fault_id);
        }
        triggered
    })
}

#[inline]
fn draw<R: crate::io::Rng>(rng: &mut R) -> f64 {
    rng.gen_range(0, 1_000_000) as f64 / 1_000_000.0
}

/// Fault injection check
///
/// `buggify!(rng, id)` uses the configured probability for `id`;
/// `buggify!(rng, id, p)` uses `p`.
#[macro_export]
macro_rules! buggify {
    ($rng:expr, $fault_id:expr) => {
        $crate::buggify::should_buggify($rng, $fault_id)
    };
    ($rng:expr, $fault_id:expr, $prob:expr) => {
        $crate::buggify::should_buggify_with_prob($rng, $fault_id, $prob)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;

    #[test]
    fn test_disabled_never_triggers() {
        set_config(FaultConfig::disabled());
        let mut rng = SimulatedRng::new(1);

        for _ in 0..1000 {
            assert!(!buggify!(&mut rng, faults::sink::COMMIT_FAIL));
            assert!(!buggify!(&mut rng, faults::sink::COMMIT_FAIL, 1.0));
        }
        set_config(FaultConfig::new());
    }

    #[test]
    fn test_explicit_probability_extremes() {
        set_config(FaultConfig::new());
        let mut rng = SimulatedRng::new(2);

        let always = (0..100)
            .filter(|_| buggify!(&mut rng, "test.always", 1.0))
            .count();
        let never = (0..100)
            .filter(|_| buggify!(&mut rng, "test.never", 0.0))
            .count();

        assert_eq!(always, 100);
        assert_eq!(never, 0);
    }

    #[test]
    fn test_stats_track_checks_and_triggers() {
        set_config(FaultConfig::only(&[(faults::sink::COMMIT_FAIL, 0.05)]));
        reset_stats();
        let mut rng = SimulatedRng::new(3);

        for _ in 0..1000 {
            let _ = buggify!(&mut rng, faults::sink::COMMIT_FAIL);
        }

        let stats = get_stats();
        assert_eq!(stats.checks.get(faults::sink::COMMIT_FAIL), Some(&1000));
        let triggers = stats.triggered(faults::sink::COMMIT_FAIL);
        assert!(triggers > 0 && triggers < 100, "triggers: {}", triggers);
        assert!(stats.summary().contains(faults::sink::COMMIT_FAIL));
        set_config(FaultConfig::new());
    }

    #[test]
    fn test_configured_probability_skips_unregistered_sites() {
        set_config(FaultConfig::only(&[(faults::consumer::SESSION_RESTART, 1.0)]));
        reset_stats();
        let mut rng = SimulatedRng::new(4);

        assert!(buggify!(&mut rng, faults::consumer::SESSION_RESTART));
        assert!(!buggify!(&mut rng, faults::transport::POISON_PAYLOAD));

        let stats = get_stats();
        assert_eq!(stats.triggered(faults::consumer::SESSION_RESTART), 1);
        assert_eq!(stats.checks.get(faults::transport::POISON_PAYLOAD), Some(&1));
        assert_eq!(stats.triggered(faults::transport::POISON_PAYLOAD), 0);
        set_config(FaultConfig::new());
    }

    #[test]
    fn test_merge_adds_counters() {
        let mut a = BuggifyStats::new();
        a.record_check("x");
        a.record_trigger("x");
        let mut b = BuggifyStats::new();
        b.record_check("x");
        b.record_check("y");

        a.merge(&b);
        assert_eq!(a.checks.get("x"), Some(&2));
        assert_eq!(a.checks.get("y"), Some(&1));
        assert_eq!(a.triggered("x"), 1);
        assert!(a.summary().contains("  x: 1/2"));
    }

    #[test]
    fn test_same_seed_same_faults() {
        set_config(FaultConfig::new());
        let run = |seed| {
            let mut rng = SimulatedRng::new(seed);
            (0..50)
                .map(|_| buggify!(&mut rng, faults::sink::COMMIT_FAIL, 0.3))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(99), run(99));
    }
}
