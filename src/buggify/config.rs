//! Fault probabilities

use super::faults;
use std::collections::HashMap;

/// Per-fault probabilities plus a global on/off switch
#[derive(Debug, Clone)]
pub struct FaultConfig {
    pub enabled: bool,
    probabilities: HashMap<String, f64>,
}

impl FaultConfig {
    /// Enabled, with conservative default probabilities
    pub fn new() -> Self {
        let mut probabilities = HashMap::new();
        probabilities.insert(faults::sink::COMMIT_FAIL.to_string(), 0.02);
        probabilities.insert(faults::sink::CONNECTION_LOST.to_string(), 0.005);
        probabilities.insert(faults::transport::ACK_FAIL.to_string(), 0.0);
        probabilities.insert(faults::transport::DELIVERY_REORDER.to_string(), 0.05);
        probabilities.insert(faults::transport::POISON_PAYLOAD.to_string(), 0.01);
        probabilities.insert(faults::consumer::SESSION_RESTART.to_string(), 0.01);
        FaultConfig {
            enabled: true,
            probabilities,
        }
    }

    /// Nothing ever triggers
    pub fn disabled() -> Self {
        FaultConfig {
            enabled: false,
            probabilities: HashMap::new(),
        }
    }

    /// High fault rates for stress runs
    pub fn chaos() -> Self {
        let mut config = FaultConfig::new();
        config.set(faults::sink::COMMIT_FAIL, 0.15);
        config.set(faults::sink::CONNECTION_LOST, 0.05);
        config.set(faults::transport::DELIVERY_REORDER, 0.25);
        config.set(faults::transport::POISON_PAYLOAD, 0.02);
        config.set(faults::consumer::SESSION_RESTART, 0.05);
        config
    }

    /// Only the listed sites are live
    pub fn only(sites: &[(&str, f64)]) -> Self {
        let mut config = FaultConfig {
            enabled: true,
            probabilities: HashMap::new(),
        };
        for (fault_id, probability) in sites {
            config.set(fault_id, *probability);
        }
        config
    }

    pub fn set(&mut self, fault_id: &str, probability: f64) {
        self.probabilities
            .insert(fault_id.to_string(), probability.clamp(0.0, 1.0));
    }

    /// Probability for a fault id (0.0 when disabled or unknown)
    pub fn get(&self, fault_id: &str) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        self.probabilities.get(fault_id).copied().unwrap_or(0.0)
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::new()
    }
}
