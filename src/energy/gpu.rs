//! GPU energy via the NVIDIA Management Library.
//!
//! Devices that support the total-energy counter (Volta and newer)
//! report cumulative millijoules directly; older devices fall back to
//! integrating instantaneous power draw between reads. When NVML cannot
//! initialize the GPU zone is omitted entirely.

use std::time::Instant;

use nvml_wrapper::Nvml;

use super::{EnergyReader, MilliJoules, Zone, ZoneReadings};

#[derive(Debug, Default)]
struct DeviceAccumulator {
    total_mj: f64,
    last_read: Option<Instant>,
}

impl DeviceAccumulator {
    fn advance(&mut self, watts: f64) -> MilliJoules {
        let now = Instant::now();
        if let Some(last) = self.last_read {
            self.total_mj += watts * now.duration_since(last).as_secs_f64() * 1000.0;
        }
        self.last_read = Some(now);
        self.total_mj as MilliJoules
    }
}

pub struct NvmlGpu {
    nvml: Option<Nvml>,
    device_count: u32,
    accumulators: Vec<DeviceAccumulator>,
}

impl NvmlGpu {
    pub fn new() -> Self {
        match Nvml::init() {
            Ok(nvml) => {
                let device_count = nvml.device_count().unwrap_or(0);
                let accumulators = (0..device_count).map(|_| DeviceAccumulator::default()).collect();
                Self {
                    nvml: Some(nvml),
                    device_count,
                    accumulators,
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "NVML initialization failed");
                Self {
                    nvml: None,
                    device_count: 0,
                    accumulators: Vec::new(),
                }
            }
        }
    }
}

impl Default for NvmlGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl EnergyReader for NvmlGpu {
    fn name(&self) -> &'static str {
        "nvml"
    }

    fn is_supported(&self) -> bool {
        self.nvml.is_some() && self.device_count > 0
    }

    fn read_cumulative(&mut self) -> anyhow::Result<ZoneReadings> {
        let nvml = self
            .nvml
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("NVML not initialized"))?;

        let mut readings = ZoneReadings::new();
        for index in 0..self.device_count {
            let device = nvml.device_by_index(index)?;
            let total_mj = match device.total_energy_consumption() {
                Ok(mj) => mj,
                Err(_) => {
                    // Energy counter unsupported; integrate power draw.
                    let milliwatts = device.power_usage()?;
                    self.accumulators[index as usize].advance(f64::from(milliwatts) / 1000.0)
                }
            };
            readings.insert(Zone::Gpu(index as u16), total_mj);
        }
        Ok(readings)
    }
}
