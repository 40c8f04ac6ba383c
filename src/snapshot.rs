//! The immutable per-tick snapshot published to readers.
//!
//! A snapshot is a self-contained value: every backref (process →
//! container, container → pod) resolves inside the same snapshot's maps.
//! Publication is a single `Arc` swap; readers holding the previous
//! snapshot are never disturbed.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::energy::{MilliJoules, Zone};
use crate::resource::{ContainerRuntime, Hypervisor, ProcessKind};

/// Attributed energy for one workload in one zone.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    /// Average watts over the last tick.
    pub power_watts: f64,
    /// Millijoules attributed since the workload was first seen.
    pub energy_total_mj: MilliJoules,
}

impl Usage {
    pub fn energy_joules(&self) -> f64 {
        self.energy_total_mj as f64 / 1000.0
    }
}

/// Zone → attributed usage for one workload.
pub type ZoneUsageMap = BTreeMap<Zone, Usage>;

/// Node-level accounting for one zone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeZoneUsage {
    /// Last cumulative counter as read from the source.
    pub cumulative_mj: MilliJoules,
    /// Energy consumed this tick (wrap-absorbed).
    pub delta_mj: MilliJoules,
    /// Idle portion of this tick's delta.
    pub idle_delta_mj: MilliJoules,
    /// Dynamic portion of this tick's delta.
    pub dynamic_delta_mj: MilliJoules,
    /// Average watts over the last tick.
    pub power_watts: f64,
    /// Running sum of per-tick deltas since start.
    pub energy_total_mj: MilliJoules,
    /// Running sum of idle portions since start.
    pub idle_energy_mj: MilliJoules,
    /// Running sum of dynamic portions since start.
    pub dynamic_energy_mj: MilliJoules,
}

/// Node-wide view for one tick.
#[derive(Debug, Clone, Default)]
pub struct NodeUsage {
    pub zones: BTreeMap<Zone, NodeZoneUsage>,
    /// Host CPU utilization ratio in [0, 1].
    pub cpu_usage_ratio: f64,
    /// Sum of running-process CPU-time deltas, seconds.
    pub cpu_time_delta_seconds: f64,
}

/// Running and terminated members of one workload class.
///
/// A key never appears in both maps; terminated entries survive exactly
/// one snapshot.
#[derive(Debug, Clone)]
pub struct Lifecycle<K: Ord, V> {
    pub running: BTreeMap<K, V>,
    pub terminated: BTreeMap<K, V>,
}

impl<K: Ord, V> Default for Lifecycle<K, V> {
    fn default() -> Self {
        Self {
            running: BTreeMap::new(),
            terminated: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub pid: i32,
    pub comm: String,
    pub exe: String,
    pub kind: ProcessKind,
    pub container_id: Option<String>,
    pub vm_id: Option<String>,
    pub cpu_time_total: f64,
    pub cpu_time_delta: f64,
    pub zones: ZoneUsageMap,
}

#[derive(Debug, Clone)]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    pub runtime: ContainerRuntime,
    pub pod_id: Option<String>,
    pub cpu_time_total: f64,
    pub cpu_time_delta: f64,
    pub zones: ZoneUsageMap,
}

#[derive(Debug, Clone)]
pub struct VirtualMachineSnapshot {
    pub id: String,
    pub name: String,
    pub hypervisor: Hypervisor,
    pub cpu_time_total: f64,
    pub cpu_time_delta: f64,
    pub zones: ZoneUsageMap,
}

#[derive(Debug, Clone)]
pub struct PodSnapshot {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub container_ids: BTreeSet<String>,
    pub cpu_time_total: f64,
    pub cpu_time_delta: f64,
    pub zones: ZoneUsageMap,
}

/// The published value.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub node: NodeUsage,
    pub processes: Lifecycle<i32, ProcessSnapshot>,
    pub containers: Lifecycle<String, ContainerSnapshot>,
    pub virtual_machines: Lifecycle<String, VirtualMachineSnapshot>,
    pub pods: Lifecycle<String, PodSnapshot>,
    /// Containers whose pod lookup answered "no pod".
    pub containers_without_pod: BTreeSet<String>,
}

impl Snapshot {
    /// The pre-first-tick snapshot.
    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            node: NodeUsage::default(),
            processes: Lifecycle::default(),
            containers: Lifecycle::default(),
            virtual_machines: Lifecycle::default(),
            pods: Lifecycle::default(),
            containers_without_pod: BTreeSet::new(),
        }
    }

    /// Total watts for one workload's zone map.
    pub fn total_watts(zones: &ZoneUsageMap) -> f64 {
        zones.values().map(|u| u.power_watts).sum()
    }

    /// Total attributed joules for one workload's zone map.
    pub fn total_joules(zones: &ZoneUsageMap) -> f64 {
        zones.values().map(|u| u.energy_joules()).sum()
    }
}
