//! Constant-power fallback when no hardware counter exists.
//!
//! Publishes `estimated_watts x elapsed_seconds` as a synthetic
//! cumulative package counter so the rest of the pipeline is exercised
//! unchanged. Selected only when estimation is allowed by configuration.

use std::time::Instant;

use super::{EnergyReader, MilliJoules, Zone, ZoneReadings};

#[derive(Debug)]
pub struct ConstantPowerEstimator {
    watts: f64,
    started: Instant,
}

impl ConstantPowerEstimator {
    pub fn new(watts: f64) -> Self {
        Self {
            watts,
            started: Instant::now(),
        }
    }

    fn energy_at(&self, elapsed_seconds: f64) -> MilliJoules {
        (self.watts * elapsed_seconds * 1000.0) as MilliJoules
    }
}

impl EnergyReader for ConstantPowerEstimator {
    fn name(&self) -> &'static str {
        "estimator"
    }

    fn is_supported(&self) -> bool {
        true
    }

    fn read_cumulative(&mut self) -> anyhow::Result<ZoneReadings> {
        let total = self.energy_at(self.started.elapsed().as_secs_f64());
        Ok(ZoneReadings::from([(Zone::Package(0), total)]))
    }
}
