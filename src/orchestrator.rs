//! The tick loop: refresh resources and read energy concurrently, run
//! attribution, publish one immutable snapshot.
//!
//! Publication is a `watch` channel carrying `Arc<Snapshot>`: the send
//! is a single atomic swap, readers keep whatever `Arc` they already
//! cloned, and endpoint handlers never contend with the writer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;

use crate::attribution::{Attribution, AttributionEngine};
use crate::energy::EnergySourceRegistry;
use crate::resource::informer::{ResourceInformer, Resources};
use crate::snapshot::{
    ContainerSnapshot, Lifecycle, NodeUsage, PodSnapshot, ProcessSnapshot, Snapshot,
    VirtualMachineSnapshot,
};

pub struct Orchestrator {
    informer: ResourceInformer,
    registry: EnergySourceRegistry,
    engine: AttributionEngine,
    period: Duration,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    last_read: Option<Instant>,
}

impl Orchestrator {
    pub fn new(
        informer: ResourceInformer,
        registry: EnergySourceRegistry,
        engine: AttributionEngine,
        period: Duration,
    ) -> (Self, watch::Receiver<Arc<Snapshot>>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(Snapshot::empty()));
        (
            Self {
                informer,
                registry,
                engine,
                period,
                snapshot_tx,
                last_read: None,
            },
            snapshot_rx,
        )
    }

    /// Run until the shutdown signal flips, then stop all backends.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.registry.stop_all();
        tracing::info!("Snapshot orchestrator stopped");
    }

    async fn tick(&mut self) {
        let now = Instant::now();
        // Wall-clock interval between reads; the first tick assumes the
        // configured period.
        let tick_seconds = self
            .last_read
            .map(|last| now.duration_since(last).as_secs_f64())
            .unwrap_or_else(|| self.period.as_secs_f64());
        self.last_read = Some(now);

        let registry = &mut self.registry;
        let (refresh_result, (readings, read_errors)) = tokio::join!(
            self.informer.refresh(),
            async move { registry.read_cumulative() }
        );

        for error in read_errors {
            tracing::warn!(error = %format!("{error:#}"), "Energy read failed, reusing prior value");
        }

        let outcome = match refresh_result {
            Ok(outcome) => outcome,
            Err(e) => {
                // Previous snapshot stays visible.
                tracing::error!(error = %e, "Resource refresh aborted, keeping previous snapshot");
                return;
            }
        };
        if !outcome.errors.is_empty() {
            let joined = outcome
                .errors
                .iter()
                .map(|e| format!("{e:#}"))
                .collect::<Vec<_>>()
                .join("; ");
            tracing::warn!(
                count = outcome.errors.len(),
                errors = %joined,
                "Refresh completed with errors, publishing best-effort snapshot"
            );
        }

        let attribution = self
            .engine
            .attribute(&readings, tick_seconds, &outcome.resources);
        let snapshot = assemble_snapshot(outcome.resources, attribution);

        tracing::debug!(
            processes = snapshot.processes.running.len(),
            containers = snapshot.containers.running.len(),
            vms = snapshot.virtual_machines.running.len(),
            pods = snapshot.pods.running.len(),
            zones = snapshot.node.zones.len(),
            "Publishing snapshot"
        );
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}

/// Compose the immutable snapshot from this tick's resources and
/// attribution results.
fn assemble_snapshot(resources: Resources, mut attribution: Attribution) -> Snapshot {
    let processes = Lifecycle {
        running: resources
            .processes
            .running
            .into_iter()
            .map(|(pid, p)| {
                let zones = attribution.processes.remove(&pid).unwrap_or_default();
                (
                    pid,
                    ProcessSnapshot {
                        pid: p.pid,
                        comm: p.comm,
                        exe: p.exe,
                        kind: p.kind,
                        container_id: p.container_id,
                        vm_id: p.vm_id,
                        cpu_time_total: p.cpu_time_total,
                        cpu_time_delta: p.cpu_time_delta,
                        zones,
                    },
                )
            })
            .collect(),
        terminated: resources
            .processes
            .terminated
            .into_iter()
            .map(|(pid, p)| {
                let zones = attribution.processes_final.remove(&pid).unwrap_or_default();
                (
                    pid,
                    ProcessSnapshot {
                        pid: p.pid,
                        comm: p.comm,
                        exe: p.exe,
                        kind: p.kind,
                        container_id: p.container_id,
                        vm_id: p.vm_id,
                        cpu_time_total: p.cpu_time_total,
                        cpu_time_delta: p.cpu_time_delta,
                        zones,
                    },
                )
            })
            .collect(),
    };

    let containers = Lifecycle {
        running: resources
            .containers
            .running
            .into_iter()
            .map(|(id, c)| {
                let zones = attribution.containers.remove(&id).unwrap_or_default();
                (
                    id,
                    ContainerSnapshot {
                        id: c.id,
                        name: c.name,
                        runtime: c.runtime,
                        pod_id: c.pod_id,
                        cpu_time_total: c.cpu_time_total,
                        cpu_time_delta: c.cpu_time_delta,
                        zones,
                    },
                )
            })
            .collect(),
        terminated: resources
            .containers
            .terminated
            .into_iter()
            .map(|(id, c)| {
                let zones = attribution.containers_final.remove(&id).unwrap_or_default();
                (
                    id,
                    ContainerSnapshot {
                        id: c.id,
                        name: c.name,
                        runtime: c.runtime,
                        pod_id: c.pod_id,
                        cpu_time_total: c.cpu_time_total,
                        cpu_time_delta: c.cpu_time_delta,
                        zones,
                    },
                )
            })
            .collect(),
    };

    let virtual_machines = Lifecycle {
        running: resources
            .virtual_machines
            .running
            .into_iter()
            .map(|(id, v)| {
                let zones = attribution.virtual_machines.remove(&id).unwrap_or_default();
                (
                    id,
                    VirtualMachineSnapshot {
                        id: v.id,
                        name: v.name,
                        hypervisor: v.hypervisor,
                        cpu_time_total: v.cpu_time_total,
                        cpu_time_delta: v.cpu_time_delta,
                        zones,
                    },
                )
            })
            .collect(),
        terminated: resources
            .virtual_machines
            .terminated
            .into_iter()
            .map(|(id, v)| {
                let zones = attribution
                    .virtual_machines_final
                    .remove(&id)
                    .unwrap_or_default();
                (
                    id,
                    VirtualMachineSnapshot {
                        id: v.id,
                        name: v.name,
                        hypervisor: v.hypervisor,
                        cpu_time_total: v.cpu_time_total,
                        cpu_time_delta: v.cpu_time_delta,
                        zones,
                    },
                )
            })
            .collect(),
    };

    let pods = Lifecycle {
        running: resources
            .pods
            .running
            .into_iter()
            .map(|(id, p)| {
                let zones = attribution.pods.remove(&id).unwrap_or_default();
                (
                    id,
                    PodSnapshot {
                        id: p.id,
                        name: p.name,
                        namespace: p.namespace,
                        container_ids: p.container_ids,
                        cpu_time_total: p.cpu_time_total,
                        cpu_time_delta: p.cpu_time_delta,
                        zones,
                    },
                )
            })
            .collect(),
        terminated: resources
            .pods
            .terminated
            .into_iter()
            .map(|(id, p)| {
                let zones = attribution.pods_final.remove(&id).unwrap_or_default();
                (
                    id,
                    PodSnapshot {
                        id: p.id,
                        name: p.name,
                        namespace: p.namespace,
                        container_ids: p.container_ids,
                        cpu_time_total: p.cpu_time_total,
                        cpu_time_delta: p.cpu_time_delta,
                        zones,
                    },
                )
            })
            .collect(),
    };

    Snapshot {
        timestamp: Utc::now(),
        node: NodeUsage {
            zones: attribution.node_zones,
            cpu_usage_ratio: resources.cpu_usage_ratio,
            cpu_time_delta_seconds: resources.node_cpu_time_delta,
        },
        processes,
        containers,
        virtual_machines,
        pods,
        containers_without_pod: resources.containers_without_pod,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::EngineSettings;
    use crate::energy::estimator::ConstantPowerEstimator;
    use crate::procfs::testutil::{write_host_stat, write_process};
    use crate::procfs::ProcFs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_loop_publishes_and_stops_on_shutdown() {
        let tmp = TempDir::new().unwrap();
        write_host_stat(tmp.path(), [100, 0, 50, 800, 50, 0, 0, 0]);
        write_process(tmp.path(), 1, "init", 500, "/init.scope", &[], &["/sbin/init"]);

        let informer = ResourceInformer::new(Arc::new(ProcFs::new(tmp.path(), 100)), None, 500);
        let registry = EnergySourceRegistry::from_parts(
            Box::new(ConstantPowerEstimator::new(100.0)),
            None,
            None,
        );
        let engine = AttributionEngine::new(EngineSettings::default());
        let (orchestrator, mut snapshot_rx) = Orchestrator::new(
            informer,
            registry,
            engine,
            Duration::from_millis(20),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(orchestrator.run(shutdown_rx));

        // Wait for the first published snapshot.
        tokio::time::timeout(Duration::from_secs(5), snapshot_rx.changed())
            .await
            .expect("snapshot published")
            .unwrap();
        let snapshot = snapshot_rx.borrow().clone();
        assert!(snapshot.processes.running.contains_key(&1));
        assert!(snapshot.node.zones.contains_key(&crate::energy::Zone::Package(0)));

        // A reader holding the old Arc is undisturbed by later swaps.
        tokio::time::timeout(Duration::from_secs(5), snapshot_rx.changed())
            .await
            .expect("second snapshot published")
            .unwrap();
        assert!(snapshot.processes.running.contains_key(&1));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("orchestrator stopped")
            .unwrap();
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_previous_snapshot() {
        let tmp = TempDir::new().unwrap();
        write_host_stat(tmp.path(), [0, 0, 0, 0, 0, 0, 0, 0]);
        write_process(tmp.path(), 9, "svc", 100, "/system.slice/svc.service", &[], &["/bin/svc"]);

        let procfs_root = tmp.path().to_path_buf();
        let informer = ResourceInformer::new(Arc::new(ProcFs::new(&procfs_root, 100)), None, 500);
        let registry = EnergySourceRegistry::from_parts(
            Box::new(ConstantPowerEstimator::new(50.0)),
            None,
            None,
        );
        let engine = AttributionEngine::new(EngineSettings::default());
        let (mut orchestrator, snapshot_rx) = Orchestrator::new(
            informer,
            registry,
            engine,
            Duration::from_secs(3),
        );

        orchestrator.tick().await;
        let first = snapshot_rx.borrow().clone();
        assert!(first.processes.running.contains_key(&9));

        // Tear the whole tree down: enumeration now fails and the
        // previous snapshot must remain visible.
        std::fs::remove_dir_all(&procfs_root).unwrap();
        orchestrator.tick().await;
        let second = snapshot_rx.borrow().clone();
        assert_eq!(second.timestamp, first.timestamp);
        assert!(second.processes.running.contains_key(&9));
    }
}
