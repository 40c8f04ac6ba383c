//! RAPL energy counters via the sysfs powercap tree.
//!
//! Layout: `<sysfs>/class/powercap/intel-rapl:<i>` is one package (its
//! `name` file reads `package-N`); children `intel-rapl:<i>:<j>` carry
//! `core`, `dram`, `uncore`, or `psys`. Each exposes a monotonically
//! increasing `energy_uj` microjoule counter that wraps at the register
//! width.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

use super::{EnergyReader, Zone, ZoneReadings};

const POWERCAP_SUBDIR: &str = "class/powercap";

/// One discovered counter file.
#[derive(Debug, Clone)]
struct RaplZone {
    zone: Zone,
    energy_path: PathBuf,
}

/// Sysfs powercap backend.
#[derive(Debug)]
pub struct RaplPowercap {
    zones: Vec<RaplZone>,
}

impl RaplPowercap {
    pub fn new(sysfs_root: &Path) -> Self {
        let root = sysfs_root.join(POWERCAP_SUBDIR);
        let zones = discover_zones(&root);
        Self { zones }
    }
}

impl EnergyReader for RaplPowercap {
    fn name(&self) -> &'static str {
        "rapl-sysfs"
    }

    fn is_supported(&self) -> bool {
        // At least one readable counter; a tree that exists but denies
        // reads (non-root) is as unusable as no tree at all.
        self.zones
            .iter()
            .any(|z| read_energy_uj(&z.energy_path).is_ok())
    }

    fn read_cumulative(&mut self) -> anyhow::Result<ZoneReadings> {
        let mut readings = ZoneReadings::new();
        for zone in &self.zones {
            let microjoules = read_energy_uj(&zone.energy_path)
                .with_context(|| format!("zone {}", zone.zone))?;
            readings.insert(zone.zone, microjoules / 1000);
        }
        Ok(readings)
    }
}

fn read_energy_uj(path: &Path) -> anyhow::Result<u64> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    raw.trim()
        .parse::<u64>()
        .with_context(|| format!("parsing {}", path.display()))
}

fn discover_zones(powercap_root: &Path) -> Vec<RaplZone> {
    let mut zones = Vec::new();
    let Ok(entries) = fs::read_dir(powercap_root) else {
        return zones;
    };

    for entry in entries.flatten() {
        let dir = entry.path();
        let Some(package_index) = parse_package_index(&entry.file_name().to_string_lossy())
        else {
            continue;
        };

        if dir.join("energy_uj").is_file() {
            zones.push(RaplZone {
                zone: Zone::Package(package_index),
                energy_path: dir.join("energy_uj"),
            });
        }

        let Ok(children) = fs::read_dir(&dir) else {
            continue;
        };
        for child in children.flatten() {
            let child_dir = child.path();
            if !child_dir.is_dir() || !child_dir.join("energy_uj").is_file() {
                continue;
            }
            let Ok(name) = fs::read_to_string(child_dir.join("name")) else {
                continue;
            };
            let zone = match name.trim() {
                "core" => Zone::Core(package_index),
                "dram" => Zone::Dram(package_index),
                "uncore" => Zone::Uncore(package_index),
                // Whole-platform domain exposed through RAPL on some CPUs.
                "psys" => Zone::Platform,
                other => {
                    tracing::debug!(name = other, "Skipping unrecognized RAPL subzone");
                    continue;
                }
            };
            zones.push(RaplZone {
                zone,
                energy_path: child_dir.join("energy_uj"),
            });
        }
    }

    zones.sort_by_key(|z| z.zone);
    zones
}

/// `intel-rapl:<i>` top-level directories only; children have two colons.
fn parse_package_index(dir_name: &str) -> Option<u16> {
    let rest = dir_name.strip_prefix("intel-rapl:")?;
    if rest.contains(':') {
        return None;
    }
    rest.parse().ok()
}
