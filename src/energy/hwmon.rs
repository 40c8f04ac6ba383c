//! Platform and CPU power from hwmon sensors.
//!
//! Two variants share the file layout `<sysfs>/class/hwmon/hwmon<k>/
//! power<N>_average` (microwatts) with a sibling `power<N>_label`:
//!
//! - [`AcpiPowerMeter`]: every labeled average-power sensor that is not
//!   the CPU sensor contributes to one platform zone.
//! - [`AmpereCpuPower`]: the sensor labeled `CPU power` stands in for
//!   package energy on machines without RAPL.
//!
//! Both expose watts, not joules, so a cumulative counter is synthesized
//! as watts x elapsed seconds between reads.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;

use super::{EnergyReader, MilliJoules, Zone, ZoneReadings};

const HWMON_SUBDIR: &str = "class/hwmon";
const AMPERE_CPU_LABEL: &str = "CPU power";

/// One `power<N>_average` file with its label.
#[derive(Debug, Clone)]
struct PowerSensor {
    label: String,
    average_path: PathBuf,
}

/// Synthesizes a monotonic millijoule counter from instantaneous watts.
#[derive(Debug)]
struct EnergyAccumulator {
    total_mj: f64,
    last_read: Option<Instant>,
}

impl EnergyAccumulator {
    fn new() -> Self {
        Self {
            total_mj: 0.0,
            last_read: None,
        }
    }

    fn advance(&mut self, watts: f64) -> MilliJoules {
        let now = Instant::now();
        if let Some(last) = self.last_read {
            self.total_mj += watts * now.duration_since(last).as_secs_f64() * 1000.0;
        }
        self.last_read = Some(now);
        self.total_mj as MilliJoules
    }

    #[cfg(test)]
    fn advance_by(&mut self, watts: f64, seconds: f64) -> MilliJoules {
        self.total_mj += watts * seconds * 1000.0;
        self.total_mj as MilliJoules
    }
}

/// ACPI power-meter platform backend.
#[derive(Debug)]
pub struct AcpiPowerMeter {
    sensors: Vec<PowerSensor>,
    accumulator: EnergyAccumulator,
}

impl AcpiPowerMeter {
    pub fn new(sysfs_root: &Path) -> Self {
        let sensors = discover_sensors(sysfs_root)
            .into_iter()
            .filter(|s| s.label != AMPERE_CPU_LABEL)
            .collect();
        Self {
            sensors,
            accumulator: EnergyAccumulator::new(),
        }
    }
}

impl EnergyReader for AcpiPowerMeter {
    fn name(&self) -> &'static str {
        "acpi-power-meter"
    }

    fn is_supported(&self) -> bool {
        self.sensors
            .iter()
            .any(|s| read_microwatts(&s.average_path).is_ok())
    }

    fn read_cumulative(&mut self) -> anyhow::Result<ZoneReadings> {
        let mut watts = 0.0;
        for sensor in &self.sensors {
            let microwatts = read_microwatts(&sensor.average_path)
                .with_context(|| format!("sensor {}", sensor.label))?;
            watts += microwatts as f64 / 1e6;
        }
        let total = self.accumulator.advance(watts);
        Ok(ZoneReadings::from([(Zone::Platform, total)]))
    }
}

/// Ampere-style CPU power sensor standing in for package energy.
#[derive(Debug)]
pub struct AmpereCpuPower {
    sensor: Option<PowerSensor>,
    accumulator: EnergyAccumulator,
}

impl AmpereCpuPower {
    pub fn new(sysfs_root: &Path) -> Self {
        let sensor = discover_sensors(sysfs_root)
            .into_iter()
            .find(|s| s.label == AMPERE_CPU_LABEL);
        Self {
            sensor,
            accumulator: EnergyAccumulator::new(),
        }
    }
}

impl EnergyReader for AmpereCpuPower {
    fn name(&self) -> &'static str {
        "hwmon-cpu-power"
    }

    fn is_supported(&self) -> bool {
        self.sensor
            .as_ref()
            .map(|s| read_microwatts(&s.average_path).is_ok())
            .unwrap_or(false)
    }

    fn read_cumulative(&mut self) -> anyhow::Result<ZoneReadings> {
        let sensor = self
            .sensor
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no CPU power sensor"))?;
        let microwatts = read_microwatts(&sensor.average_path)
            .with_context(|| format!("sensor {}", sensor.label))?;
        let total = self.accumulator.advance(microwatts as f64 / 1e6);
        Ok(ZoneReadings::from([(Zone::Package(0), total)]))
    }
}

fn read_microwatts(path: &Path) -> anyhow::Result<u64> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    raw.trim()
        .parse()
        .with_context(|| format!("parsing {}", path.display()))
}

fn discover_sensors(sysfs_root: &Path) -> Vec<PowerSensor> {
    let mut sensors = Vec::new();
    let Ok(chips) = fs::read_dir(sysfs_root.join(HWMON_SUBDIR)) else {
        return sensors;
    };

    for chip in chips.flatten() {
        let chip_dir = chip.path();
        let Ok(files) = fs::read_dir(&chip_dir) else {
            continue;
        };
        for file in files.flatten() {
            let name = file.file_name().to_string_lossy().into_owned();
            let Some(index) = name
                .strip_prefix("power")
                .and_then(|r| r.strip_suffix("_average"))
            else {
                continue;
            };
            let label_path = chip_dir.join(format!("power{index}_label"));
            let label = fs::read_to_string(&label_path)
                .map(|l| l.trim().to_string())
                .unwrap_or_default();
            sensors.push(PowerSensor {
                label,
                average_path: file.path(),
            });
        }
    }

    sensors.sort_by(|a, b| a.average_path.cmp(&b.average_path));
    sensors
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::fs;
    use std::path::Path;

    /// Fabricate one hwmon chip with labeled average-power sensors.
    pub fn write_hwmon_chip(sysfs_root: &Path, chip: u16, sensors: &[(&str, u64)]) {
        let dir = sysfs_root.join(format!("class/hwmon/hwmon{chip}"));
        fs::create_dir_all(&dir).unwrap();
        for (n, (label, microwatts)) in sensors.iter().enumerate() {
            let n = n + 1;
            fs::write(dir.join(format!("power{n}_average")), format!("{microwatts}\n")).unwrap();
            fs::write(dir.join(format!("power{n}_label")), format!("{label}\n")).unwrap();
        }
    }
}
