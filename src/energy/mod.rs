//! Energy zones, the backend reader contract, and the source registry.
//!
//! The registry probes backends in a fixed preference order at startup,
//! caches the selection, and afterwards only reads cumulative counters.
//! Counter semantics: monotonic millijoules within one boot; wrap and
//! reset handling belongs to the attribution engine, not the backends.

pub mod estimator;
pub mod gpu;
pub mod hwmon;
pub mod msr;
pub mod rapl;
pub mod redfish;

use std::collections::BTreeMap;
use std::fmt;

use crate::config::{Config, PlatformSource};

/// Energy quantities are unsigned integer millijoules throughout.
pub type MilliJoules = u64;

/// A named power domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Zone {
    Package(u16),
    Core(u16),
    Dram(u16),
    Uncore(u16),
    Gpu(u16),
    Platform,
    /// Platform energy not accounted to CPU, DRAM, or GPU; synthesized
    /// by the attribution engine, never read from a backend.
    Other,
}

/// Zone family, used to pick the per-workload usage metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneKind {
    Package,
    Core,
    Dram,
    Uncore,
    Gpu,
    Platform,
    Other,
}

impl Zone {
    pub fn kind(&self) -> ZoneKind {
        match self {
            Zone::Package(_) => ZoneKind::Package,
            Zone::Core(_) => ZoneKind::Core,
            Zone::Dram(_) => ZoneKind::Dram,
            Zone::Uncore(_) => ZoneKind::Uncore,
            Zone::Gpu(_) => ZoneKind::Gpu,
            Zone::Platform => ZoneKind::Platform,
            Zone::Other => ZoneKind::Other,
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Zone::Package(i) => write!(f, "package-{i}"),
            Zone::Core(i) => write!(f, "core-{i}"),
            Zone::Dram(i) => write!(f, "dram-{i}"),
            Zone::Uncore(i) => write!(f, "uncore-{i}"),
            Zone::Gpu(i) => write!(f, "gpu-{i}"),
            Zone::Platform => write!(f, "platform"),
            Zone::Other => write!(f, "other"),
        }
    }
}

/// One cumulative-counter reading, zone to millijoules.
pub type ZoneReadings = BTreeMap<Zone, MilliJoules>;

/// Capability contract every backend implements.
pub trait EnergyReader: Send {
    /// Stable identifier for logs and the source-info metric.
    fn name(&self) -> &'static str;

    /// Whether this backend can serve readings on this host.
    fn is_supported(&self) -> bool;

    /// Read current cumulative counters for all zones this backend owns.
    fn read_cumulative(&mut self) -> anyhow::Result<ZoneReadings>;

    /// Release background resources. Called once during shutdown.
    fn stop(&mut self) {}
}

/// Startup failures that abort the agent.
#[derive(Debug, thiserror::Error)]
pub enum EnergyError {
    #[error("no CPU energy source available and estimation is disallowed")]
    NoCpuSource,
}

/// Selected backends plus the last good reading per zone.
pub struct EnergySourceRegistry {
    cpu: Box<dyn EnergyReader>,
    platform: Option<Box<dyn EnergyReader>>,
    gpu: Option<Box<dyn EnergyReader>>,
    last: ZoneReadings,
}

impl EnergySourceRegistry {
    /// Probe backends in preference order and cache the selection.
    pub async fn probe(config: &Config) -> Result<Self, EnergyError> {
        let cpu = select_cpu_source(config)?;
        tracing::info!(source = cpu.name(), "Selected CPU energy source");

        let platform = select_platform_source(config).await;
        if let Some(ref p) = platform {
            tracing::info!(source = p.name(), "Selected platform energy source");
        }

        let gpu = select_gpu_source(config);
        if let Some(ref g) = gpu {
            tracing::info!(source = g.name(), "Selected GPU energy source");
        }

        Ok(Self {
            cpu,
            platform,
            gpu,
            last: ZoneReadings::new(),
        })
    }

    /// Build a registry from explicit backends. Test seam.
    pub fn from_parts(
        cpu: Box<dyn EnergyReader>,
        platform: Option<Box<dyn EnergyReader>>,
        gpu: Option<Box<dyn EnergyReader>>,
    ) -> Self {
        Self {
            cpu,
            platform,
            gpu,
            last: ZoneReadings::new(),
        }
    }

    /// Read every selected backend.
    ///
    /// A failing backend keeps its zones at the prior reading (delta 0
    /// downstream) and contributes an error; the tick still proceeds.
    pub fn read_cumulative(&mut self) -> (ZoneReadings, Vec<anyhow::Error>) {
        let mut errors = Vec::new();
        let mut readings = self.last.clone();

        match self.cpu.read_cumulative() {
            Ok(r) => readings.extend(r),
            Err(e) => errors.push(e.context(format!("cpu source {}", self.cpu.name()))),
        }
        if let Some(platform) = self.platform.as_mut() {
            match platform.read_cumulative() {
                Ok(r) => readings.extend(r),
                Err(e) => errors.push(e.context(format!("platform source {}", platform.name()))),
            }
        }
        if let Some(gpu) = self.gpu.as_mut() {
            match gpu.read_cumulative() {
                Ok(r) => readings.extend(r),
                Err(e) => errors.push(e.context(format!("gpu source {}", gpu.name()))),
            }
        }

        self.last = readings.clone();
        (readings, errors)
    }

    /// (component, backend name) pairs for the source-info metric.
    pub fn sources(&self) -> Vec<(&'static str, &'static str)> {
        let mut out = vec![("cpu", self.cpu.name())];
        if let Some(ref p) = self.platform {
            out.push(("platform", p.name()));
        }
        if let Some(ref g) = self.gpu {
            out.push(("gpu", g.name()));
        }
        out
    }

    pub fn stop_all(&mut self) {
        self.cpu.stop();
        if let Some(platform) = self.platform.as_mut() {
            platform.stop();
        }
        if let Some(gpu) = self.gpu.as_mut() {
            gpu.stop();
        }
    }
}

fn select_cpu_source(config: &Config) -> Result<Box<dyn EnergyReader>, EnergyError> {
    let mut candidates: Vec<Box<dyn EnergyReader>> =
        vec![Box::new(rapl::RaplPowercap::new(&config.sysfs_root))];
    if config.enable_msr {
        candidates.push(Box::new(msr::MsrEnergy::new(&config.sysfs_root)));
    }
    candidates.push(Box::new(hwmon::AmpereCpuPower::new(&config.sysfs_root)));

    for candidate in candidates {
        if candidate.is_supported() {
            return Ok(candidate);
        }
        tracing::debug!(source = candidate.name(), "CPU energy source not supported");
    }

    if config.allow_estimation {
        tracing::warn!(
            watts = config.estimated_watts,
            "No hardware CPU energy source found, falling back to constant-power estimation"
        );
        return Ok(Box::new(estimator::ConstantPowerEstimator::new(
            config.estimated_watts,
        )));
    }
    Err(EnergyError::NoCpuSource)
}

async fn select_platform_source(config: &Config) -> Option<Box<dyn EnergyReader>> {
    match config.platform_source {
        PlatformSource::None => None,
        PlatformSource::Acpi => probe_acpi(config),
        PlatformSource::Redfish => probe_redfish(config).await,
        PlatformSource::Auto => match probe_acpi(config) {
            Some(acpi) => Some(acpi),
            None => probe_redfish(config).await,
        },
    }
}

fn probe_acpi(config: &Config) -> Option<Box<dyn EnergyReader>> {
    let acpi = hwmon::AcpiPowerMeter::new(&config.sysfs_root);
    if acpi.is_supported() {
        Some(Box::new(acpi))
    } else {
        None
    }
}

async fn probe_redfish(config: &Config) -> Option<Box<dyn EnergyReader>> {
    let creds = config.redfish.as_ref()?;
    match redfish::RedfishPlatform::connect(creds.clone(), config.redfish_probe_interval).await {
        Ok(backend) => Some(Box::new(backend)),
        Err(e) => {
            tracing::warn!(host = %creds.host, error = %e, "Redfish platform source unavailable");
            None
        }
    }
}

fn select_gpu_source(config: &Config) -> Option<Box<dyn EnergyReader>> {
    if !config.enable_gpu {
        return None;
    }
    let backend = gpu::NvmlGpu::new();
    if backend.is_supported() {
        Some(Box::new(backend))
    } else {
        tracing::debug!("NVML not available, GPU zone omitted");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakySource {
        readings: Vec<anyhow::Result<ZoneReadings>>,
    }

    impl EnergyReader for FlakySource {
        fn name(&self) -> &'static str {
            "flaky"
        }
        fn is_supported(&self) -> bool {
            true
        }
        fn read_cumulative(&mut self) -> anyhow::Result<ZoneReadings> {
            self.readings.remove(0)
        }
    }

    #[test]
    fn test_zone_display() {
        assert_eq!(Zone::Package(0).to_string(), "package-0");
        assert_eq!(Zone::Dram(1).to_string(), "dram-1");
        assert_eq!(Zone::Platform.to_string(), "platform");
        assert_eq!(Zone::Other.to_string(), "other");
    }

    #[test]
    fn test_failed_read_keeps_prior_value() {
        let mut registry = EnergySourceRegistry::from_parts(
            Box::new(FlakySource {
                readings: vec![
                    Ok(BTreeMap::from([(Zone::Package(0), 1000)])),
                    Err(anyhow::anyhow!("transient")),
                    Ok(BTreeMap::from([(Zone::Package(0), 3000)])),
                ],
            }),
            None,
            None,
        );

        let (first, errors) = registry.read_cumulative();
        assert!(errors.is_empty());
        assert_eq!(first[&Zone::Package(0)], 1000);

        let (second, errors) = registry.read_cumulative();
        assert_eq!(errors.len(), 1);
        assert_eq!(second[&Zone::Package(0)], 1000);

        let (third, errors) = registry.read_cumulative();
        assert!(errors.is_empty());
        assert_eq!(third[&Zone::Package(0)], 3000);
    }
}
