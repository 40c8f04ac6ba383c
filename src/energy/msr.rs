//! RAPL energy counters via model-specific registers.
//!
//! Used when the powercap tree is absent (stripped-down kernels) but
//! `/dev/cpu/<n>/msr` is readable. One representative CPU per physical
//! package is read; the 32-bit energy-status registers wrap naturally
//! and the attribution engine absorbs the wrap.

use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::Context;

use super::{EnergyReader, Zone, ZoneReadings};

const MSR_RAPL_POWER_UNIT: u64 = 0x606;
const MSR_PKG_ENERGY_STATUS: u64 = 0x611;
const MSR_DRAM_ENERGY_STATUS: u64 = 0x619;

/// One physical package and the CPU whose MSR device represents it.
#[derive(Debug, Clone)]
struct PackageCpu {
    package: u16,
    msr_path: PathBuf,
}

/// MSR-backed CPU energy source.
#[derive(Debug)]
pub struct MsrEnergy {
    packages: Vec<PackageCpu>,
}

impl MsrEnergy {
    pub fn new(sysfs_root: &Path) -> Self {
        Self {
            packages: discover_packages(sysfs_root),
        }
    }

    fn energy_unit_joules(msr_path: &Path) -> anyhow::Result<f64> {
        let raw = read_msr(msr_path, MSR_RAPL_POWER_UNIT)?;
        // Bits 12:8 hold the energy-status unit as a negative power of 2.
        let esu = (raw >> 8) & 0x1f;
        Ok(1.0 / f64::from(1u32 << esu))
    }
}

impl EnergyReader for MsrEnergy {
    fn name(&self) -> &'static str {
        "rapl-msr"
    }

    fn is_supported(&self) -> bool {
        self.packages
            .first()
            .map(|p| read_msr(&p.msr_path, MSR_PKG_ENERGY_STATUS).is_ok())
            .unwrap_or(false)
    }

    fn read_cumulative(&mut self) -> anyhow::Result<ZoneReadings> {
        let mut readings = ZoneReadings::new();
        for pkg in &self.packages {
            let unit = Self::energy_unit_joules(&pkg.msr_path)
                .with_context(|| format!("package {}", pkg.package))?;

            let raw_pkg = read_msr(&pkg.msr_path, MSR_PKG_ENERGY_STATUS)
                .with_context(|| format!("package {}", pkg.package))?;
            let pkg_mj = (raw_pkg & 0xffff_ffff) as f64 * unit * 1000.0;
            readings.insert(Zone::Package(pkg.package), pkg_mj as u64);

            // DRAM status is absent on client parts; skip quietly.
            if let Ok(raw_dram) = read_msr(&pkg.msr_path, MSR_DRAM_ENERGY_STATUS) {
                let dram_mj = (raw_dram & 0xffff_ffff) as f64 * unit * 1000.0;
                readings.insert(Zone::Dram(pkg.package), dram_mj as u64);
            }
        }
        Ok(readings)
    }
}

fn read_msr(path: &Path, offset: u64) -> anyhow::Result<u64> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut buf = [0u8; 8];
    file.read_exact_at(&mut buf, offset)
        .with_context(|| format!("reading msr {offset:#x} from {}", path.display()))?;
    Ok(u64::from_le_bytes(buf))
}

/// First CPU of each physical package, from sysfs topology.
fn discover_packages(sysfs_root: &Path) -> Vec<PackageCpu> {
    let cpus_dir = sysfs_root.join("devices/system/cpu");
    let mut packages: Vec<PackageCpu> = Vec::new();

    let Ok(entries) = fs::read_dir(&cpus_dir) else {
        return packages;
    };
    let mut cpu_ids: Vec<u32> = entries
        .flatten()
        .filter_map(|e| {
            e.file_name()
                .to_str()
                .and_then(|n| n.strip_prefix("cpu").and_then(|id| id.parse().ok()))
        })
        .collect();
    cpu_ids.sort_unstable();

    for cpu in cpu_ids {
        let topo = cpus_dir.join(format!("cpu{cpu}/topology/physical_package_id"));
        let Ok(raw) = fs::read_to_string(&topo) else {
            continue;
        };
        let Ok(package) = raw.trim().parse::<u16>() else {
            continue;
        };
        if packages.iter().any(|p| p.package == package) {
            continue;
        }
        packages.push(PackageCpu {
            package,
            msr_path: PathBuf::from(format!("/dev/cpu/{cpu}/msr")),
        });
    }

    packages.sort_by_key(|p| p.package);
    packages
}
