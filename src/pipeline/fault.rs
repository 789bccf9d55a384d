//! Synthetic processing failures for resilience testing
//!
//! Injection is compiled only with the `fault-injection` feature. Without it
//! the injector still exists so wiring stays identical, but it never fires
//! and cannot be switched on.

use crate::config::{FaultInjectionConfig, StageKind};
use crate::messaging::{HandlerError, HandlerResult};
use crate::pipeline::metrics::STAGE_METRICS;
#[cfg(feature = "fault-injection")]
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{info, warn};

/// Snapshot exposed by the admin endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaultInjectionStatus {
    pub compiled: bool,
    pub enabled: bool,
    pub probability: f64,
    pub stages: Vec<StageKind>,
}

/// Runtime-toggleable random failure source
pub struct FaultInjector {
    enabled: AtomicBool,
    probability_bits: AtomicU64,
    stages: HashSet<StageKind>,
}

impl FaultInjector {
    pub fn new(config: &FaultInjectionConfig) -> Self {
        let injector = Self {
            enabled: AtomicBool::new(false),
            probability_bits: AtomicU64::new(clamp(config.probability).to_bits()),
            stages: config.stages.iter().copied().collect(),
        };
        injector.set_enabled(config.enabled);
        injector
    }

    pub fn disabled() -> Self {
        Self::new(&FaultInjectionConfig {
            enabled: false,
            probability: 0.0,
            stages: Vec::new(),
        })
    }

    /// Whether injection was compiled into this build
    pub fn compiled() -> bool {
        cfg!(feature = "fault-injection")
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Switch injection on or off; returns the effective state
    pub fn set_enabled(&self, enabled: bool) -> bool {
        if enabled && !Self::compiled() {
            warn!("Fault injection requested but not compiled into this build");
            return false;
        }
        self.enabled.store(enabled, Ordering::Relaxed);
        info!(enabled, probability = self.probability(), "Fault injection toggled");
        enabled
    }

    pub fn probability(&self) -> f64 {
        f64::from_bits(self.probability_bits.load(Ordering::Relaxed))
    }

    /// Values outside `0.0..=1.0` are clamped
    pub fn set_probability(&self, probability: f64) {
        self.probability_bits
            .store(clamp(probability).to_bits(), Ordering::Relaxed);
    }

    pub fn applies_to(&self, stage: StageKind) -> bool {
        self.stages.contains(&stage)
    }

    /// Fail with `SimulatedProcessing` at the configured rate
    pub fn check(&self, stage: StageKind) -> HandlerResult {
        if !self.is_enabled() || !self.applies_to(stage) || !self.roll() {
            return Ok(());
        }

        STAGE_METRICS
            .injected_failures
            .with_label_values(&[stage.as_ref()])
            .inc();
        warn!(stage = %stage, "Injecting simulated processing failure");
        Err(HandlerError::simulated(format!(
            "simulated {} processing failure",
            stage
        )))
    }

    pub fn status(&self) -> FaultInjectionStatus {
        let mut stages: Vec<StageKind> = self.stages.iter().copied().collect();
        stages.sort_by_key(|stage| StageKind::ALL.iter().position(|s| s == stage));
        FaultInjectionStatus {
            compiled: Self::compiled(),
            enabled: self.is_enabled(),
            probability: self.probability(),
            stages,
        }
    }

    #[cfg(feature = "fault-injection")]
    fn roll(&self) -> bool {
        rand::thread_rng().gen_bool(self.probability())
    }

    #[cfg(not(feature = "fault-injection"))]
    fn roll(&self) -> bool {
        false
    }
}

fn clamp(probability: f64) -> f64 {
    if probability.is_nan() {
        0.0
    } else {
        probability.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::FailureKind;

    fn injector(enabled: bool, probability: f64) -> FaultInjector {
        FaultInjector::new(&FaultInjectionConfig {
            enabled,
            probability,
            stages: vec![StageKind::Payment],
        })
    }

    #[test]
    fn test_disabled_never_fails() {
        let injector = injector(false, 1.0);
        for _ in 0..100 {
            assert!(injector.check(StageKind::Payment).is_ok());
        }
    }

    #[test]
    fn test_other_stages_untouched() {
        let injector = injector(true, 1.0);
        assert!(injector.check(StageKind::Invoice).is_ok());
    }

    #[cfg(feature = "fault-injection")]
    #[test]
    fn test_certain_failure_is_simulated_kind() {
        let injector = injector(true, 1.0);
        let err = injector.check(StageKind::Payment).unwrap_err();
        assert_eq!(err.kind, FailureKind::SimulatedProcessing);
    }

    #[cfg(feature = "fault-injection")]
    #[test]
    fn test_runtime_toggle() {
        let injector = injector(false, 1.0);
        assert!(injector.set_enabled(true));
        assert!(injector.check(StageKind::Payment).is_err());

        injector.set_probability(0.0);
        assert!(injector.check(StageKind::Payment).is_ok());
    }

    #[cfg(not(feature = "fault-injection"))]
    #[test]
    fn test_cannot_enable_without_feature() {
        let injector = injector(true, 1.0);
        assert!(!injector.is_enabled());
        assert!(!injector.set_enabled(true));
        let _ = FailureKind::SimulatedProcessing;
    }

    #[test]
    fn test_probability_clamped() {
        let injector = injector(false, 4.0);
        assert_eq!(injector.probability(), 1.0);
        injector.set_probability(-1.0);
        assert_eq!(injector.probability(), 0.0);
        injector.set_probability(f64::NAN);
        assert_eq!(injector.probability(), 0.0);
    }
}
