//! Energy attribution: cumulative counters to per-workload energy.
//!
//! Per zone and tick, the engine turns cumulative readings into deltas
//! (absorbing counter wraps), splits each delta into an idle and a
//! dynamic part using the minimum-observed-delta heuristic, and then
//! distributes the dynamic part across workloads in proportion to their
//! share of the zone's usage metric. Idle energy is always divided
//! evenly across running workloads of a class.
//!
//! The idle baseline is learned over the whole process lifetime: a
//! zone's baseline is the smallest tick delta ever observed while the
//! node's idle-signal metric was at (or below) its historical minimum.

use std::collections::{BTreeMap, HashSet};

use rustc_hash::FxHashMap;

use crate::config::UsageMetric;
use crate::energy::{MilliJoules, Zone, ZoneKind, ZoneReadings};
use crate::resource::informer::Resources;
use crate::snapshot::{NodeZoneUsage, Usage, ZoneUsageMap};

/// Attribution tuning. The zone-to-metric mapping is fixed by zone kind
/// with configurable choices for the two zones that have a natural
/// hardware counter.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Metric whose new minimum marks the node "sufficiently idle".
    pub idle_signal: UsageMetric,
    /// Preferred metric for DRAM zones.
    pub dram_metric: UsageMetric,
    /// Preferred metric for GPU zones.
    pub gpu_metric: UsageMetric,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            idle_signal: UsageMetric::Instructions,
            dram_metric: UsageMetric::DramAccesses,
            gpu_metric: UsageMetric::GpuUtilization,
        }
    }
}

impl EngineSettings {
    /// The usage metric for a zone kind; `None` means the zone has no
    /// per-workload metric and dynamic energy is divided evenly.
    fn zone_metric(&self, kind: ZoneKind) -> Option<UsageMetric> {
        match kind {
            ZoneKind::Package | ZoneKind::Core | ZoneKind::Platform => Some(UsageMetric::CpuTime),
            ZoneKind::Dram => Some(self.dram_metric),
            ZoneKind::Gpu => Some(self.gpu_metric),
            ZoneKind::Uncore | ZoneKind::Other => None,
        }
    }
}

/// A workload's value for one usage metric.
///
/// Only scheduler CPU time is collected today; the hardware-counter
/// metrics resolve to the CPU-time fallback until a perf source exists.
fn usage_value(metric: UsageMetric, cpu_time_delta: f64) -> f64 {
    match metric {
        UsageMetric::CpuTime
        | UsageMetric::Instructions
        | UsageMetric::Cycles
        | UsageMetric::CacheMisses
        | UsageMetric::DramAccesses
        | UsageMetric::GpuUtilization => cpu_time_delta,
    }
}

/// Engine-internal identity of a workload across snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum WorkloadKey {
    Process(i32),
    Container(String),
    Vm(String),
    Pod(String),
}

#[derive(Debug, Default)]
struct ZoneState {
    prev_cumulative: Option<MilliJoules>,
    idle_baseline: Option<MilliJoules>,
    energy_total: MilliJoules,
    idle_energy: MilliJoules,
    dynamic_energy: MilliJoules,
}

/// Per-class attribution results for one tick.
#[derive(Debug, Default)]
pub struct Attribution {
    pub node_zones: BTreeMap<Zone, NodeZoneUsage>,
    pub processes: BTreeMap<i32, ZoneUsageMap>,
    pub processes_final: BTreeMap<i32, ZoneUsageMap>,
    pub containers: BTreeMap<String, ZoneUsageMap>,
    pub containers_final: BTreeMap<String, ZoneUsageMap>,
    pub virtual_machines: BTreeMap<String, ZoneUsageMap>,
    pub virtual_machines_final: BTreeMap<String, ZoneUsageMap>,
    pub pods: BTreeMap<String, ZoneUsageMap>,
    pub pods_final: BTreeMap<String, ZoneUsageMap>,
}

/// Stateful attribution engine. One instance lives as long as the agent.
pub struct AttributionEngine {
    settings: EngineSettings,
    zones: FxHashMap<Zone, ZoneState>,
    min_idle_signal: Option<f64>,
    /// Accumulated energy per living workload.
    energy: FxHashMap<WorkloadKey, BTreeMap<Zone, MilliJoules>>,
}

impl AttributionEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            zones: FxHashMap::default(),
            min_idle_signal: None,
            energy: FxHashMap::default(),
        }
    }

    /// Attribute one tick.
    pub fn attribute(
        &mut self,
        readings: &ZoneReadings,
        tick_seconds: f64,
        resources: &Resources,
    ) -> Attribution {
        let signal = self.idle_signal_value(resources);
        let sufficiently_idle = self.min_idle_signal.map_or(true, |min| signal <= min);
        if sufficiently_idle {
            self.min_idle_signal =
                Some(self.min_idle_signal.map_or(signal, |min| min.min(signal)));
        }

        let mut node_zones = self.update_zone_deltas(readings, tick_seconds, sufficiently_idle);
        self.derive_other_zone(&mut node_zones, tick_seconds);

        let process_workloads: Vec<(i32, f64)> = resources
            .processes
            .running
            .iter()
            .map(|(pid, p)| (*pid, p.cpu_time_delta))
            .collect();
        let container_workloads: Vec<(String, f64)> = resources
            .containers
            .running
            .iter()
            .map(|(id, c)| (id.clone(), c.cpu_time_delta))
            .collect();
        let vm_workloads: Vec<(String, f64)> = resources
            .virtual_machines
            .running
            .iter()
            .map(|(id, v)| (id.clone(), v.cpu_time_delta))
            .collect();
        let pod_workloads: Vec<(String, f64)> = resources
            .pods
            .running
            .iter()
            .map(|(id, p)| (id.clone(), p.cpu_time_delta))
            .collect();

        let processes =
            self.attribute_class(&node_zones, tick_seconds, &process_workloads, |pid| {
                WorkloadKey::Process(*pid)
            });
        let containers =
            self.attribute_class(&node_zones, tick_seconds, &container_workloads, |id| {
                WorkloadKey::Container(id.clone())
            });
        let virtual_machines =
            self.attribute_class(&node_zones, tick_seconds, &vm_workloads, |id| {
                WorkloadKey::Vm(id.clone())
            });
        let pods = self.attribute_class(&node_zones, tick_seconds, &pod_workloads, |id| {
            WorkloadKey::Pod(id.clone())
        });

        let processes_final = self.take_final(
            resources.processes.terminated.keys().copied(),
            WorkloadKey::Process,
        );
        let containers_final = self.take_final(
            resources.containers.terminated.keys().cloned(),
            WorkloadKey::Container,
        );
        let virtual_machines_final = self.take_final(
            resources.virtual_machines.terminated.keys().cloned(),
            WorkloadKey::Vm,
        );
        let pods_final =
            self.take_final(resources.pods.terminated.keys().cloned(), WorkloadKey::Pod);

        self.retain_running(resources);

        Attribution {
            node_zones,
            processes,
            processes_final,
            containers,
            containers_final,
            virtual_machines,
            virtual_machines_final,
            pods,
            pods_final,
        }
    }

    /// Resolve the configured idle signal to a node-level value.
    fn idle_signal_value(&self, resources: &Resources) -> f64 {
        // Instruction counters are the preferred signal but have no
        // collector wired; fall back to the node CPU-time delta.
        usage_value(self.settings.idle_signal, resources.node_cpu_time_delta)
    }

    /// Compute per-zone deltas and the idle/dynamic split, updating the
    /// lifetime baselines and running sums.
    fn update_zone_deltas(
        &mut self,
        readings: &ZoneReadings,
        tick_seconds: f64,
        sufficiently_idle: bool,
    ) -> BTreeMap<Zone, NodeZoneUsage> {
        let mut node_zones = BTreeMap::new();
        for (&zone, &cumulative) in readings {
            let state = self.zones.entry(zone).or_default();

            let (delta, measured) = match state.prev_cumulative {
                None => (0, false),
                // Regression means the counter wrapped or reset; the
                // tick contributes nothing and must not shrink the
                // baseline.
                Some(prev) if cumulative < prev => (0, false),
                Some(prev) => (cumulative - prev, true),
            };
            state.prev_cumulative = Some(cumulative);

            if sufficiently_idle && measured {
                state.idle_baseline =
                    Some(state.idle_baseline.map_or(delta, |b| b.min(delta)));
            }

            let idle_delta = state.idle_baseline.unwrap_or(0).min(delta);
            let dynamic_delta = delta - idle_delta;

            state.energy_total += delta;
            state.idle_energy += idle_delta;
            state.dynamic_energy += dynamic_delta;

            node_zones.insert(
                zone,
                NodeZoneUsage {
                    cumulative_mj: cumulative,
                    delta_mj: delta,
                    idle_delta_mj: idle_delta,
                    dynamic_delta_mj: dynamic_delta,
                    power_watts: watts(delta, tick_seconds),
                    energy_total_mj: state.energy_total,
                    idle_energy_mj: state.idle_energy,
                    dynamic_energy_mj: state.dynamic_energy,
                },
            );
        }
        node_zones
    }

    /// Platform energy not explained by CPU, DRAM, or GPU becomes the
    /// synthetic `other` zone, computed separately for the idle and
    /// dynamic parts.
    fn derive_other_zone(
        &mut self,
        node_zones: &mut BTreeMap<Zone, NodeZoneUsage>,
        tick_seconds: f64,
    ) {
        let Some(platform) = node_zones.get(&Zone::Platform).cloned() else {
            return;
        };

        let mut accounted_dynamic: MilliJoules = 0;
        let mut accounted_idle: MilliJoules = 0;
        for (zone, usage) in node_zones.iter() {
            // Every CPU domain counts as accounted: core and uncore are
            // published as sibling zones next to their package.
            if matches!(
                zone.kind(),
                ZoneKind::Package
                    | ZoneKind::Core
                    | ZoneKind::Uncore
                    | ZoneKind::Dram
                    | ZoneKind::Gpu
            ) {
                accounted_dynamic += usage.dynamic_delta_mj;
                accounted_idle += usage.idle_delta_mj;
            }
        }

        let dynamic_delta = platform.dynamic_delta_mj.saturating_sub(accounted_dynamic);
        let idle_delta = platform.idle_delta_mj.saturating_sub(accounted_idle);
        let delta = dynamic_delta + idle_delta;

        let state = self.zones.entry(Zone::Other).or_default();
        state.energy_total += delta;
        state.idle_energy += idle_delta;
        state.dynamic_energy += dynamic_delta;

        node_zones.insert(
            Zone::Other,
            NodeZoneUsage {
                cumulative_mj: state.energy_total,
                delta_mj: delta,
                idle_delta_mj: idle_delta,
                dynamic_delta_mj: dynamic_delta,
                power_watts: watts(delta, tick_seconds),
                energy_total_mj: state.energy_total,
                idle_energy_mj: state.idle_energy,
                dynamic_energy_mj: state.dynamic_energy,
            },
        );
    }

    /// Attribute every zone to one workload class.
    fn attribute_class<K: Ord + Clone>(
        &mut self,
        node_zones: &BTreeMap<Zone, NodeZoneUsage>,
        tick_seconds: f64,
        workloads: &[(K, f64)],
        to_key: impl Fn(&K) -> WorkloadKey,
    ) -> BTreeMap<K, ZoneUsageMap> {
        let mut out: BTreeMap<K, ZoneUsageMap> = workloads
            .iter()
            .map(|(k, _)| (k.clone(), ZoneUsageMap::new()))
            .collect();
        if workloads.is_empty() {
            return out;
        }
        let count = workloads.len() as u64;

        for (&zone, node_usage) in node_zones {
            let assignments = match self.settings.zone_metric(zone.kind()) {
                Some(metric) => {
                    let usages: Vec<f64> = workloads
                        .iter()
                        .map(|(_, cpu)| usage_value(metric, *cpu).max(0.0))
                        .collect();
                    let total: f64 = usages.iter().sum();
                    if total > 0.0 {
                        ratio_assign(node_usage.dynamic_delta_mj, &usages, total)
                    } else {
                        vec![node_usage.dynamic_delta_mj / count; workloads.len()]
                    }
                }
                None => vec![node_usage.dynamic_delta_mj / count; workloads.len()],
            };
            let idle_share = node_usage.idle_delta_mj / count;

            for (i, (key, _)) in workloads.iter().enumerate() {
                let tick_energy = assignments[i] + idle_share;
                let accumulated = self
                    .energy
                    .entry(to_key(key))
                    .or_default()
                    .entry(zone)
                    .or_insert(0);
                *accumulated += tick_energy;
                out.get_mut(key).expect("workload key present").insert(
                    zone,
                    Usage {
                        power_watts: watts(tick_energy, tick_seconds),
                        energy_total_mj: *accumulated,
                    },
                );
            }
        }
        out
    }

    /// Remove accumulators for terminated workloads and return their
    /// final zone maps with zero power.
    fn take_final<K: Ord + Clone>(
        &mut self,
        keys: impl Iterator<Item = K>,
        to_key: impl Fn(K) -> WorkloadKey,
    ) -> BTreeMap<K, ZoneUsageMap> {
        let mut out = BTreeMap::new();
        for key in keys {
            let accumulated = self
                .energy
                .remove(&to_key(key.clone()))
                .unwrap_or_default();
            let zones: ZoneUsageMap = accumulated
                .into_iter()
                .map(|(zone, energy)| {
                    (
                        zone,
                        Usage {
                            power_watts: 0.0,
                            energy_total_mj: energy,
                        },
                    )
                })
                .collect();
            out.insert(key, zones);
        }
        out
    }

    /// Drop accumulators for workloads that silently disappeared.
    fn retain_running(&mut self, resources: &Resources) {
        let mut living: HashSet<WorkloadKey> = HashSet::new();
        living.extend(
            resources
                .processes
                .running
                .keys()
                .map(|pid| WorkloadKey::Process(*pid)),
        );
        living.extend(
            resources
                .containers
                .running
                .keys()
                .map(|id| WorkloadKey::Container(id.clone())),
        );
        living.extend(
            resources
                .virtual_machines
                .running
                .keys()
                .map(|id| WorkloadKey::Vm(id.clone())),
        );
        living.extend(
            resources
                .pods
                .running
                .keys()
                .map(|id| WorkloadKey::Pod(id.clone())),
        );
        self.energy.retain(|key, _| living.contains(key));
    }
}

fn watts(energy_mj: MilliJoules, tick_seconds: f64) -> f64 {
    if tick_seconds <= 0.0 {
        return 0.0;
    }
    energy_mj as f64 / 1000.0 / tick_seconds
}

/// Usage-proportional dynamic shares, rounded up per workload but
/// clamped so the running sum never exceeds the zone's dynamic delta.
/// Any floating-point residue goes to the heaviest user, making the sum
/// exact whenever total usage is nonzero.
fn ratio_assign(dynamic: MilliJoules, usages: &[f64], total: f64) -> Vec<MilliJoules> {
    let mut out = vec![0u64; usages.len()];
    let mut remaining = dynamic;
    for (i, usage) in usages.iter().enumerate() {
        let share = (usage / total * dynamic as f64).ceil() as MilliJoules;
        let assigned = share.min(remaining);
        out[i] = assigned;
        remaining -= assigned;
    }
    if remaining > 0 {
        if let Some(heaviest) = (0..usages.len())
            .max_by(|&a, &b| usages[a].partial_cmp(&usages[b]).expect("finite usage"))
        {
            out[heaviest] += remaining;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Process, ProcessKind};
    use proptest::prelude::*;

    fn resources_with_process_delta(cpu_time_delta: f64) -> Resources {
        let mut resources = Resources::default();
        resources.processes.running.insert(
            1,
            Process {
                pid: 1,
                comm: "worker".to_string(),
                exe: "/bin/worker".to_string(),
                kind: ProcessKind::Regular,
                container_id: None,
                vm_id: None,
                cpu_time_total: cpu_time_delta,
                cpu_time_delta,
            },
        );
        resources.node_cpu_time_delta = cpu_time_delta;
        resources
    }

    fn package_reading(mj: MilliJoules) -> ZoneReadings {
        ZoneReadings::from([(Zone::Package(0), mj)])
    }

    #[test]
    fn test_idle_baseline_learning_scenario() {
        let mut engine = AttributionEngine::new(EngineSettings::default());

        // Warm-up establishes the counter base; no delta measured yet.
        engine.attribute(&package_reading(10_000), 3.0, &resources_with_process_delta(0.0));

        // Tick 1: delta 1000 at signal 0 (idle). Baseline becomes 1000.
        let tick1 = engine.attribute(
            &package_reading(11_000),
            3.0,
            &resources_with_process_delta(0.0),
        );
        assert_eq!(tick1.node_zones[&Zone::Package(0)].delta_mj, 1000);

        // Tick 2: delta 300 at signal 0. Baseline shrinks to 300.
        let tick2 = engine.attribute(
            &package_reading(11_300),
            3.0,
            &resources_with_process_delta(0.0),
        );
        assert_eq!(tick2.node_zones[&Zone::Package(0)].idle_delta_mj, 300);
        assert_eq!(tick2.node_zones[&Zone::Package(0)].dynamic_delta_mj, 0);

        // Tick 3: delta 500 at signal 100 (busy). Baseline unchanged.
        let tick3 = engine.attribute(
            &package_reading(11_800),
            3.0,
            &resources_with_process_delta(100.0),
        );
        let zone = &tick3.node_zones[&Zone::Package(0)];
        assert_eq!(zone.idle_delta_mj, 300);
        assert_eq!(zone.dynamic_delta_mj, 200);

        // The sole workload holds 100% of the usage: 200 dynamic + 300 idle.
        let usage = tick3.processes[&1][&Zone::Package(0)];
        let tick_energy_w = usage.power_watts * 3.0 * 1000.0;
        assert!((tick_energy_w - 500.0).abs() < 1e-6);
    }

    #[test]
    fn test_wrap_produces_zero_delta_and_keeps_baseline() {
        let mut engine = AttributionEngine::new(EngineSettings::default());
        let resources = resources_with_process_delta(0.0);

        engine.attribute(&package_reading(5_000), 3.0, &resources);
        let t1 = engine.attribute(&package_reading(5_400), 3.0, &resources);
        assert_eq!(t1.node_zones[&Zone::Package(0)].delta_mj, 400);

        // Counter regresses: wrap/reset tick contributes nothing.
        let t2 = engine.attribute(&package_reading(100), 3.0, &resources);
        let zone = &t2.node_zones[&Zone::Package(0)];
        assert_eq!(zone.delta_mj, 0);
        assert_eq!(zone.dynamic_delta_mj, 0);

        // Next delta measured from the post-wrap base; baseline is
        // still the pre-wrap 400, not 0.
        let t3 = engine.attribute(&package_reading(700), 3.0, &resources);
        assert_eq!(t3.node_zones[&Zone::Package(0)].delta_mj, 600);
        assert_eq!(t3.node_zones[&Zone::Package(0)].idle_delta_mj, 400);
    }

    #[test]
    fn test_idle_delta_never_exceeds_total_delta() {
        let mut engine = AttributionEngine::new(EngineSettings::default());
        let resources = resources_with_process_delta(0.0);

        engine.attribute(&package_reading(0), 3.0, &resources);
        engine.attribute(&package_reading(1_000), 3.0, &resources);
        // Delta 100 is below the learned baseline of 1000.
        let tick = engine.attribute(&package_reading(1_100), 3.0, &resources);
        let zone = &tick.node_zones[&Zone::Package(0)];
        assert_eq!(zone.idle_delta_mj, 100);
        assert_eq!(zone.dynamic_delta_mj, 0);
        assert_eq!(zone.delta_mj, zone.idle_delta_mj + zone.dynamic_delta_mj);
    }

    #[test]
    fn test_dynamic_split_proportional_with_ceil() {
        let mut resources = Resources::default();
        for (pid, delta) in [(1, 1.0), (2, 3.0)] {
            resources.processes.running.insert(
                pid,
                Process {
                    pid,
                    comm: "p".to_string(),
                    exe: String::new(),
                    kind: ProcessKind::Regular,
                    container_id: None,
                    vm_id: None,
                    cpu_time_total: delta,
                    cpu_time_delta: delta,
                },
            );
        }
        resources.node_cpu_time_delta = 4.0;

        let mut engine = AttributionEngine::new(EngineSettings::default());
        engine.attribute(&package_reading(0), 1.0, &resources);
        // Busy tick right away: baseline learned on the first measured
        // tick, so force a baseline of zero with an idle warm-up first.
        let idle = resources_with_process_delta(0.0);
        engine.attribute(&package_reading(0), 1.0, &idle);

        let tick = engine.attribute(&package_reading(1_000), 1.0, &resources);
        let zone = &tick.node_zones[&Zone::Package(0)];
        assert_eq!(zone.dynamic_delta_mj, 1000);

        let p1 = tick.processes[&1][&Zone::Package(0)].energy_total_mj;
        let p2 = tick.processes[&2][&Zone::Package(0)].energy_total_mj;
        assert_eq!(p1 + p2, 1000);
        // 25% of 1000, rounded up.
        assert_eq!(p1, 250);
        assert_eq!(p2, 750);
    }

    #[test]
    fn test_zero_usage_splits_dynamic_evenly() {
        let mut resources = Resources::default();
        for pid in [1, 2, 3] {
            resources.processes.running.insert(
                pid,
                Process {
                    pid,
                    comm: "idle".to_string(),
                    exe: String::new(),
                    kind: ProcessKind::Regular,
                    container_id: None,
                    vm_id: None,
                    cpu_time_total: 0.0,
                    cpu_time_delta: 0.0,
                },
            );
        }
        resources.node_cpu_time_delta = 0.0;

        let mut engine = AttributionEngine::new(EngineSettings::default());
        engine.attribute(&package_reading(0), 1.0, &resources);
        let tick = engine.attribute(&package_reading(900), 1.0, &resources);

        // First measured tick while idle: the whole delta becomes the
        // baseline, so it is all idle, split evenly.
        for pid in [1, 2, 3] {
            assert_eq!(
                tick.processes[&pid][&Zone::Package(0)].energy_total_mj,
                300
            );
        }
    }

    #[test]
    fn test_uncore_divided_evenly_despite_usage_skew() {
        let mut resources = Resources::default();
        for (pid, delta) in [(1, 9.0), (2, 1.0)] {
            resources.processes.running.insert(
                pid,
                Process {
                    pid,
                    comm: "p".to_string(),
                    exe: String::new(),
                    kind: ProcessKind::Regular,
                    container_id: None,
                    vm_id: None,
                    cpu_time_total: delta,
                    cpu_time_delta: delta,
                },
            );
        }
        resources.node_cpu_time_delta = 10.0;

        let readings_zero = ZoneReadings::from([(Zone::Uncore(0), 0)]);
        let readings = ZoneReadings::from([(Zone::Uncore(0), 400)]);

        let mut engine = AttributionEngine::new(EngineSettings::default());
        engine.attribute(&readings_zero, 1.0, &resources_with_process_delta(0.0));
        engine.attribute(&readings_zero, 1.0, &resources_with_process_delta(0.0));
        let tick = engine.attribute(&readings, 1.0, &resources);

        assert_eq!(tick.node_zones[&Zone::Uncore(0)].dynamic_delta_mj, 400);
        assert_eq!(tick.processes[&1][&Zone::Uncore(0)].energy_total_mj, 200);
        assert_eq!(tick.processes[&2][&Zone::Uncore(0)].energy_total_mj, 200);
    }

    #[test]
    fn test_other_zone_is_platform_excess() {
        let resources = resources_with_process_delta(1.0);
        let mut engine = AttributionEngine::new(EngineSettings::default());

        let base = ZoneReadings::from([(Zone::Package(0), 0), (Zone::Platform, 0)]);
        engine.attribute(&base, 1.0, &resources_with_process_delta(0.0));
        engine.attribute(&base, 1.0, &resources_with_process_delta(0.0));

        // Package consumed 300, platform 1000: 700 unexplained.
        let busy = ZoneReadings::from([(Zone::Package(0), 300), (Zone::Platform, 1_000)]);
        let tick = engine.attribute(&busy, 1.0, &resources);

        let other = &tick.node_zones[&Zone::Other];
        assert_eq!(other.dynamic_delta_mj, 700);
        // The single workload receives the whole even split.
        assert_eq!(tick.processes[&1][&Zone::Other].energy_total_mj, 700);
    }

    #[test]
    fn test_other_zone_excludes_core_and_uncore() {
        let resources = resources_with_process_delta(1.0);
        let mut engine = AttributionEngine::new(EngineSettings::default());

        let base = ZoneReadings::from([
            (Zone::Package(0), 0),
            (Zone::Core(0), 0),
            (Zone::Uncore(0), 0),
            (Zone::Platform, 0),
        ]);
        engine.attribute(&base, 1.0, &resources_with_process_delta(0.0));
        engine.attribute(&base, 1.0, &resources_with_process_delta(0.0));

        // Package 300 + core 100 + uncore 50 are all explained CPU
        // energy; only 550 of the platform's 1000 is left over.
        let busy = ZoneReadings::from([
            (Zone::Package(0), 300),
            (Zone::Core(0), 100),
            (Zone::Uncore(0), 50),
            (Zone::Platform, 1_000),
        ]);
        let tick = engine.attribute(&busy, 1.0, &resources);

        let other = &tick.node_zones[&Zone::Other];
        assert_eq!(other.dynamic_delta_mj, 550);
        assert_eq!(other.idle_delta_mj, 0);
        assert_eq!(tick.processes[&1][&Zone::Other].energy_total_mj, 550);
    }

    #[test]
    fn test_other_zone_absent_without_platform() {
        let mut engine = AttributionEngine::new(EngineSettings::default());
        let tick = engine.attribute(
            &package_reading(100),
            1.0,
            &resources_with_process_delta(0.0),
        );
        assert!(!tick.node_zones.contains_key(&Zone::Other));
    }

    #[test]
    fn test_terminated_workload_keeps_final_energy_once() {
        let mut engine = AttributionEngine::new(EngineSettings::default());
        let running = resources_with_process_delta(1.0);

        engine.attribute(&package_reading(0), 1.0, &resources_with_process_delta(0.0));
        engine.attribute(&package_reading(0), 1.0, &resources_with_process_delta(0.0));
        let tick = engine.attribute(&package_reading(500), 1.0, &running);
        let accumulated = tick.processes[&1][&Zone::Package(0)].energy_total_mj;
        assert_eq!(accumulated, 500);

        // Next tick the process is terminated.
        let mut terminated = Resources::default();
        terminated
            .processes
            .terminated
            .insert(1, running.processes.running[&1].clone());
        let final_tick = engine.attribute(&package_reading(600), 1.0, &terminated);
        let final_usage = final_tick.processes_final[&1][&Zone::Package(0)];
        assert_eq!(final_usage.energy_total_mj, accumulated);
        assert_eq!(final_usage.power_watts, 0.0);
        assert!(final_tick.processes.is_empty());
    }

    #[test]
    fn test_monotonic_cumulative_across_ticks() {
        let mut engine = AttributionEngine::new(EngineSettings::default());
        let resources = resources_with_process_delta(0.0);
        let mut last_total = 0;
        for cumulative in [100u64, 400, 900, 1_600] {
            let tick = engine.attribute(&package_reading(cumulative), 1.0, &resources);
            let total = tick.node_zones[&Zone::Package(0)].energy_total_mj;
            assert!(total >= last_total);
            last_total = total;
        }
    }

    proptest! {
        #[test]
        fn prop_ratio_assign_conserves_dynamic(
            dynamic in 0u64..1_000_000,
            usages in proptest::collection::vec(0u32..10_000, 1..20)
        ) {
            let usages: Vec<f64> = usages.into_iter().map(f64::from).collect();
            let total: f64 = usages.iter().sum();
            prop_assume!(total > 0.0);

            let assigned = ratio_assign(dynamic, &usages, total);
            let sum: u64 = assigned.iter().sum();
            prop_assert_eq!(sum, dynamic);
        }

        #[test]
        fn prop_zero_usage_gets_zero_dynamic(
            dynamic in 1u64..1_000_000,
            nonzero in 1u32..10_000
        ) {
            let usages = vec![0.0, f64::from(nonzero), 0.0];
            let assigned = ratio_assign(dynamic, &usages, f64::from(nonzero));
            prop_assert_eq!(assigned[0], 0);
            prop_assert_eq!(assigned[2], 0);
            prop_assert_eq!(assigned[1], dynamic);
        }
    }
}
