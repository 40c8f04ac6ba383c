//! Per-tick workload lifecycle tracking.
//!
//! Each refresh rescans procfs, reclassifies what changed, aggregates
//! CPU deltas up to containers, VMs, and pods, and diffs against the
//! previous tick to produce terminated sets. Classification is memoized
//! by (PID, comm): a changed comm means the PID was reused and the
//! record is rebuilt from scratch; a negligible CPU delta skips
//! reclassification entirely.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::{container, vm, Container, ContainerRuntime, Hypervisor, Pod, Process, ProcessKind, VirtualMachine};
use crate::kubernetes::PodLookup;
use crate::procfs::{ProcError, ProcFs, ProcHandle, ProcStat};
use crate::snapshot::Lifecycle;

/// CPU-time deltas below this are treated as "did not run".
const NEGLIGIBLE_CPU_DELTA: f64 = 1e-12;

/// Everything one refresh produced.
#[derive(Debug, Default)]
pub struct Resources {
    pub processes: Lifecycle<i32, Process>,
    pub containers: Lifecycle<String, Container>,
    pub virtual_machines: Lifecycle<String, VirtualMachine>,
    pub pods: Lifecycle<String, Pod>,
    /// Containers whose pod lookup answered "no pod".
    pub containers_without_pod: BTreeSet<String>,
    /// Sum of running-process CPU deltas this tick, seconds.
    pub node_cpu_time_delta: f64,
    /// Host CPU utilization ratio in [0, 1].
    pub cpu_usage_ratio: f64,
}

/// A refresh result: best-effort resources plus the errors collected
/// from independent workers along the way.
#[derive(Debug)]
pub struct RefreshOutcome {
    pub resources: Resources,
    pub errors: Vec<anyhow::Error>,
}

/// Identity facts recorded the first time a workload is classified,
/// consumed when the aggregate record is created.
#[derive(Debug, Default)]
struct DiscoveredIdentities {
    containers: BTreeMap<String, (ContainerRuntime, Option<String>)>,
    vms: BTreeMap<String, vm::VmMatch>,
}

/// Input to the VM aggregation task.
#[derive(Debug, Clone)]
struct VmObservation {
    pid: i32,
    kind: ProcessKind,
    vm_id: Option<String>,
    cpu_time_total: f64,
    cpu_time_delta: f64,
}

/// The lifecycle tracker. Sole writer of its caches; readers only ever
/// see the snapshots assembled from [`Resources`].
pub struct ResourceInformer {
    procfs: Arc<ProcFs>,
    pod_lookup: Option<Arc<dyn PodLookup>>,
    max_terminated: usize,
    processes: FxHashMap<i32, Process>,
    containers: FxHashMap<String, Container>,
    vms: FxHashMap<String, VirtualMachine>,
    pods: FxHashMap<String, Pod>,
}

impl ResourceInformer {
    pub fn new(
        procfs: Arc<ProcFs>,
        pod_lookup: Option<Arc<dyn PodLookup>>,
        max_terminated: usize,
    ) -> Self {
        Self {
            procfs,
            pod_lookup,
            max_terminated,
            processes: FxHashMap::default(),
            containers: FxHashMap::default(),
            vms: FxHashMap::default(),
            pods: FxHashMap::default(),
        }
    }

    /// Run one refresh.
    ///
    /// Only an enumeration failure aborts; everything else degrades to
    /// collected errors and the outcome is still usable for a snapshot.
    pub async fn refresh(&mut self) -> Result<RefreshOutcome, ProcError> {
        let handles = self.procfs.enumerate()?;
        let mut errors: Vec<anyhow::Error> = Vec::new();
        let mut discovered = DiscoveredIdentities::default();

        // Host CPU usage is an independent producer for this tick.
        let ratio_task = tokio::task::spawn_blocking({
            let procfs = self.procfs.clone();
            move || procfs.cpu_usage_ratio()
        });

        // Producer (a): process scan with classification.
        let mut running_processes: BTreeMap<i32, Process> = BTreeMap::new();
        for handle in handles {
            match self.observe_process(&handle, &mut discovered, &mut errors).await {
                Ok(Some(process)) => {
                    running_processes.insert(process.pid, process);
                }
                Ok(None) => {} // exited mid-scan
                Err(e) => errors.push(e),
            }
        }

        // Producer (b): VM aggregation over the scanned hypervisors.
        let vm_observations: Vec<VmObservation> = running_processes
            .values()
            .filter(|p| p.kind == ProcessKind::VmHypervisor)
            .map(|p| VmObservation {
                pid: p.pid,
                kind: p.kind,
                vm_id: p.vm_id.clone(),
                cpu_time_total: p.cpu_time_total,
                cpu_time_delta: p.cpu_time_delta,
            })
            .collect();
        let prev_vms = std::mem::take(&mut self.vms);
        let discovered_vms = std::mem::take(&mut discovered.vms);
        let vm_task =
            tokio::spawn(
                async move { aggregate_vms(prev_vms, discovered_vms, vm_observations) },
            );

        // Container aggregation, then pod association (pods depend on
        // containers, so this chain stays sequential).
        let mut running_containers =
            self.aggregate_containers(&running_processes, &discovered.containers);
        let mut prev_pods = std::mem::take(&mut self.pods);
        let (running_pods, containers_without_pod, pod_errors) = associate_pods(
            self.pod_lookup.as_ref(),
            &mut prev_pods,
            &mut running_containers,
        )
        .await;
        errors.extend(pod_errors);

        // Join the sibling producers.
        let (running_vms, leftover_vms) = match vm_task.await {
            Ok(result) => result,
            Err(e) => {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
                return Err(ProcError::Parse {
                    path: self.procfs.root().to_path_buf(),
                    reason: "vm aggregation task cancelled".to_string(),
                });
            }
        };
        let cpu_usage_ratio = match ratio_task.await {
            Ok(Ok(ratio)) => ratio,
            Ok(Err(e)) => {
                errors.push(anyhow::Error::new(e).context("host cpu usage"));
                0.0
            }
            Err(e) => {
                errors.push(anyhow::anyhow!("host cpu usage task failed: {e}"));
                0.0
            }
        };

        let node_cpu_time_delta = running_processes
            .values()
            .map(|p| p.cpu_time_delta)
            .sum();

        // Anything still cached was not seen this tick: it terminated
        // now and will be fully forgotten at the next tick.
        let terminated_processes = cap_terminated(
            std::mem::take(&mut self.processes)
                .into_iter()
                .collect::<BTreeMap<_, _>>(),
            self.max_terminated,
        );
        let terminated_containers = cap_terminated(
            std::mem::take(&mut self.containers)
                .into_iter()
                .collect::<BTreeMap<_, _>>(),
            self.max_terminated,
        );
        let terminated_vms = cap_terminated(
            leftover_vms.into_iter().collect::<BTreeMap<_, _>>(),
            self.max_terminated,
        );
        let terminated_pods = cap_terminated(
            prev_pods.into_iter().collect::<BTreeMap<_, _>>(),
            self.max_terminated,
        );

        self.processes = running_processes
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        self.containers = running_containers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.vms = running_vms.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        self.pods = running_pods
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(RefreshOutcome {
            resources: Resources {
                processes: Lifecycle {
                    running: running_processes,
                    terminated: terminated_processes,
                },
                containers: Lifecycle {
                    running: running_containers,
                    terminated: terminated_containers,
                },
                virtual_machines: Lifecycle {
                    running: running_vms,
                    terminated: terminated_vms,
                },
                pods: Lifecycle {
                    running: running_pods,
                    terminated: terminated_pods,
                },
                containers_without_pod,
                node_cpu_time_delta,
                cpu_usage_ratio,
            },
            errors,
        })
    }

    /// Observe one PID: reuse the cached record when possible, otherwise
    /// read its metadata and classify. `Ok(None)` means the process
    /// exited mid-scan.
    async fn observe_process(
        &mut self,
        handle: &ProcHandle,
        discovered: &mut DiscoveredIdentities,
        errors: &mut Vec<anyhow::Error>,
    ) -> Result<Option<Process>, anyhow::Error> {
        let pid = handle.pid();
        let stat = match handle.stat() {
            Ok(stat) => stat,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(anyhow::Error::new(e).context(format!("pid {pid}"))),
        };

        if let Some(mut cached) = self.processes.remove(&pid) {
            let delta = stat.cpu_time_seconds - cached.cpu_time_total;
            // Negligible movement: keep the classification untouched and
            // skip even the comm comparison.
            if delta.abs() < NEGLIGIBLE_CPU_DELTA || cached.comm == stat.comm {
                cached.cpu_time_delta = delta.max(0.0);
                cached.cpu_time_total = stat.cpu_time_seconds;
                // Keep existing identities discoverable for aggregation.
                self.remember_identity(&cached, discovered);
                return Ok(Some(cached));
            }
            tracing::debug!(
                pid,
                old_comm = %cached.comm,
                new_comm = %stat.comm,
                "PID reused by a different program, reclassifying"
            );
        }

        self.classify_process(handle, stat, discovered, errors)
            .await
            .map(Some)
    }

    /// A cached VM record may predate this refresh's discovery map; make
    /// sure the aggregator can still resolve its identity.
    fn remember_identity(&self, process: &Process, discovered: &mut DiscoveredIdentities) {
        if process.kind != ProcessKind::VmHypervisor {
            return;
        }
        if let Some(vm_id) = &process.vm_id {
            if let Some(existing) = self.vms.get(vm_id) {
                discovered.vms.insert(
                    vm_id.clone(),
                    vm::VmMatch {
                        id: existing.id.clone(),
                        name: existing.name.clone(),
                        hypervisor: existing.hypervisor,
                    },
                );
            }
        }
    }

    /// Full classification of a new (or rebranded) process. The
    /// container and VM detectors run as sibling tasks and are joined;
    /// both failing is collected as one joined error and the process
    /// falls back to regular.
    async fn classify_process(
        &self,
        handle: &ProcHandle,
        stat: ProcStat,
        discovered: &mut DiscoveredIdentities,
        errors: &mut Vec<anyhow::Error>,
    ) -> Result<Process, anyhow::Error> {
        let pid = handle.pid();
        let exe = handle.exe();
        let cgroups = match handle.cgroups() {
            Ok(cgroups) => cgroups,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => {
                errors.push(anyhow::Error::new(e).context(format!("cgroups of pid {pid}")));
                Vec::new()
            }
        };
        let environ = match handle.environ() {
            Ok(environ) => environ,
            Err(e) => {
                tracing::debug!(pid, error = %e, "environ unreadable");
                Vec::new()
            }
        };
        let cmdline = match handle.cmdline() {
            Ok(cmdline) => cmdline,
            Err(e) => {
                tracing::debug!(pid, error = %e, "cmdline unreadable");
                Vec::new()
            }
        };

        let container_task = tokio::spawn({
            let cgroups = cgroups.clone();
            let environ = environ.clone();
            let cmdline = cmdline.clone();
            let exe = exe.clone();
            async move {
                container::detect(&cgroups)
                    .map(|m| (m, container::detect_name(&environ, &cmdline, &exe)))
            }
        });
        let vm_task = tokio::spawn({
            let cmdline = cmdline.clone();
            async move { vm::detect(&cmdline) }
        });
        let (container_result, vm_result) = tokio::join!(container_task, vm_task);

        let (container_outcome, vm_outcome) = match (container_result, vm_result) {
            (Ok(c), Ok(v)) => (c, v),
            (Ok(c), Err(e)) => {
                tracing::debug!(pid, error = %e, "vm detector task failed");
                (c, None)
            }
            (Err(e), Ok(v)) => {
                tracing::debug!(pid, error = %e, "container detector task failed");
                (None, v)
            }
            (Err(container_err), Err(vm_err)) => {
                errors.push(anyhow::anyhow!(
                    "classifying pid {pid}: container detector: {container_err}; vm detector: {vm_err}"
                ));
                (None, None)
            }
        };

        let mut process = Process {
            pid,
            comm: stat.comm,
            exe,
            kind: ProcessKind::Regular,
            container_id: None,
            vm_id: None,
            cpu_time_total: stat.cpu_time_seconds,
            // First sighting: everything accumulated so far counts as
            // this tick's delta.
            cpu_time_delta: stat.cpu_time_seconds,
        };

        if let Some((container_match, name)) = container_outcome {
            process.kind = ProcessKind::ContainerMember;
            process.container_id = Some(container_match.id.clone());
            discovered
                .containers
                .entry(container_match.id.clone())
                .or_insert((container_match.runtime, name));
        } else if let Some(vm_match) = vm_outcome {
            process.kind = ProcessKind::VmHypervisor;
            process.vm_id = Some(vm_match.id.clone());
            discovered.vms.insert(vm_match.id.clone(), vm_match);
        }

        Ok(process)
    }

    /// Fold member processes into container records. The first touch in
    /// a tick resets the counters so totals equal the sum over currently
    /// running members.
    fn aggregate_containers(
        &mut self,
        processes: &BTreeMap<i32, Process>,
        discovered: &BTreeMap<String, (ContainerRuntime, Option<String>)>,
    ) -> BTreeMap<String, Container> {
        let mut running: BTreeMap<String, Container> = BTreeMap::new();
        for process in processes.values() {
            let Some(container_id) = &process.container_id else {
                continue;
            };
            let entry = running.entry(container_id.clone()).or_insert_with(|| {
                let mut container =
                    self.containers.remove(container_id).unwrap_or_else(|| {
                        let (runtime, name) = discovered
                            .get(container_id)
                            .cloned()
                            .unwrap_or((ContainerRuntime::Unknown, None));
                        Container {
                            id: container_id.clone(),
                            name: name.unwrap_or_default(),
                            runtime,
                            pod_id: None,
                            cpu_time_total: 0.0,
                            cpu_time_delta: 0.0,
                        }
                    });
                container.cpu_time_total = 0.0;
                container.cpu_time_delta = 0.0;
                container
            });
            entry.cpu_time_delta += process.cpu_time_delta;
            entry.cpu_time_total += process.cpu_time_total;
        }
        running
    }
}

/// Build the running VM map from this tick's hypervisor observations.
///
/// Exactly one process anchors each VM, so totals replace rather than
/// accumulate. Returns the running map plus the unclaimed previous VMs
/// (terminated this tick).
fn aggregate_vms(
    mut prev: FxHashMap<String, VirtualMachine>,
    discovered: BTreeMap<String, vm::VmMatch>,
    observations: Vec<VmObservation>,
) -> (BTreeMap<String, VirtualMachine>, FxHashMap<String, VirtualMachine>) {
    let mut running = BTreeMap::new();
    for obs in observations {
        assert!(
            obs.kind == ProcessKind::VmHypervisor,
            "VM aggregation received pid {} with kind {}",
            obs.pid,
            obs.kind
        );
        let id = match obs.vm_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => panic!(
                "VM hypervisor process {} reached aggregation with an empty VM identifier",
                obs.pid
            ),
        };

        let mut vm = prev
            .remove(&id)
            .or_else(|| {
                discovered.get(&id).map(|m| VirtualMachine {
                    id: m.id.clone(),
                    name: m.name.clone(),
                    hypervisor: m.hypervisor,
                    cpu_time_total: 0.0,
                    cpu_time_delta: 0.0,
                })
            })
            .unwrap_or_else(|| VirtualMachine {
                id: id.clone(),
                name: format!("kvm-{}", &id[..id.len().min(8)]),
                hypervisor: Hypervisor::Kvm,
                cpu_time_total: 0.0,
                cpu_time_delta: 0.0,
            });
        vm.cpu_time_delta = obs.cpu_time_delta;
        vm.cpu_time_total = obs.cpu_time_total;
        running.insert(id, vm);
    }
    (running, prev)
}

/// Resolve each running container to its pod.
///
/// Found: upsert the pod, overwrite the container name with the
/// pod-supplied one, set the backref. NotFound: record the container as
/// podless. API errors join the refresh error.
async fn associate_pods(
    lookup: Option<&Arc<dyn PodLookup>>,
    prev_pods: &mut FxHashMap<String, Pod>,
    containers: &mut BTreeMap<String, Container>,
) -> (BTreeMap<String, Pod>, BTreeSet<String>, Vec<anyhow::Error>) {
    let mut running: BTreeMap<String, Pod> = BTreeMap::new();
    let mut without_pod = BTreeSet::new();
    let mut errors = Vec::new();

    let Some(lookup) = lookup else {
        return (running, without_pod, errors);
    };

    for (container_id, container) in containers.iter_mut() {
        match lookup.lookup(container_id).await {
            Ok(info) => {
                container.name = info.container_name.clone();
                container.pod_id = Some(info.id.clone());
                let pod = running.entry(info.id.clone()).or_insert_with(|| {
                    let mut pod = prev_pods.remove(&info.id).unwrap_or_else(|| Pod {
                        id: info.id.clone(),
                        name: info.name.clone(),
                        namespace: info.namespace.clone(),
                        container_ids: BTreeSet::new(),
                        cpu_time_total: 0.0,
                        cpu_time_delta: 0.0,
                    });
                    pod.name = info.name.clone();
                    pod.namespace = info.namespace.clone();
                    pod.container_ids.clear();
                    pod.cpu_time_total = 0.0;
                    pod.cpu_time_delta = 0.0;
                    pod
                });
                pod.container_ids.insert(container_id.clone());
                pod.cpu_time_delta += container.cpu_time_delta;
                pod.cpu_time_total += container.cpu_time_total;
            }
            Err(e) if e.is_not_found() => {
                // The pod is gone (or never existed); a stale backref
                // must not outlive it in the running maps.
                container.pod_id = None;
                without_pod.insert(container_id.clone());
            }
            Err(e) => {
                errors.push(
                    anyhow::Error::new(e)
                        .context(format!("pod lookup for container {container_id}")),
                );
            }
        }
    }

    (running, without_pod, errors)
}

/// Bound the terminated set so a churn storm cannot balloon a snapshot.
fn cap_terminated<K: Ord, V>(map: BTreeMap<K, V>, max: usize) -> BTreeMap<K, V> {
    if map.len() <= max {
        return map;
    }
    tracing::warn!(
        dropped = map.len() - max,
        "Terminated workload set exceeds cap, dropping oldest keys"
    );
    map.into_iter().take(max).collect()
}
