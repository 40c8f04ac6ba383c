//! Workload data model and per-tick lifecycle tracking.
//!
//! Cross-references between workloads are ID backrefs, never owned
//! pointers: a process names its container, a container names its pod,
//! and a pod lists its container IDs. Full objects are resolved through
//! the snapshot's maps, which keeps the published value copy-on-publish
//! cheap and cycle-free.

pub mod container;
pub mod informer;
pub mod vm;

use std::collections::BTreeSet;
use std::fmt;

/// Classification of a running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessKind {
    #[default]
    Regular,
    ContainerMember,
    VmHypervisor,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessKind::Regular => write!(f, "regular"),
            ProcessKind::ContainerMember => write!(f, "container-member"),
            ProcessKind::VmHypervisor => write!(f, "vm-hypervisor"),
        }
    }
}

/// Container runtime inferred from the cgroup path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerRuntime {
    Docker,
    Containerd,
    CriO,
    Podman,
    /// Kubepods cgroup layout with no runtime-specific marker.
    Kubepods,
    #[default]
    Unknown,
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerRuntime::Docker => write!(f, "docker"),
            ContainerRuntime::Containerd => write!(f, "containerd"),
            ContainerRuntime::CriO => write!(f, "cri-o"),
            ContainerRuntime::Podman => write!(f, "podman"),
            ContainerRuntime::Kubepods => write!(f, "kubepods"),
            ContainerRuntime::Unknown => write!(f, "unknown"),
        }
    }
}

/// Hypervisor flavor for VM workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hypervisor {
    Kvm,
}

impl fmt::Display for Hypervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hypervisor::Kvm => write!(f, "kvm"),
        }
    }
}

/// One tracked process. Mutated only by the informer.
#[derive(Debug, Clone)]
pub struct Process {
    pub pid: i32,
    pub comm: String,
    pub exe: String,
    pub kind: ProcessKind,
    /// Backref by ID into the container map.
    pub container_id: Option<String>,
    /// Backref by ID into the VM map.
    pub vm_id: Option<String>,
    /// Cumulative user+system CPU seconds.
    pub cpu_time_total: f64,
    /// CPU seconds consumed since the previous tick.
    pub cpu_time_delta: f64,
}

/// One tracked container, aggregated from its member processes.
#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub runtime: ContainerRuntime,
    /// Backref by ID into the pod map, set by pod association.
    pub pod_id: Option<String>,
    pub cpu_time_total: f64,
    pub cpu_time_delta: f64,
}

/// One tracked virtual machine, anchored by its hypervisor process.
#[derive(Debug, Clone)]
pub struct VirtualMachine {
    pub id: String,
    pub name: String,
    pub hypervisor: Hypervisor,
    pub cpu_time_total: f64,
    pub cpu_time_delta: f64,
}

/// One tracked pod, aggregated from its member containers.
#[derive(Debug, Clone)]
pub struct Pod {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub container_ids: BTreeSet<String>,
    pub cpu_time_total: f64,
    pub cpu_time_delta: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_values_match_label_vocabulary() {
        assert_eq!(ProcessKind::ContainerMember.to_string(), "container-member");
        assert_eq!(ContainerRuntime::CriO.to_string(), "cri-o");
        assert_eq!(Hypervisor::Kvm.to_string(), "kvm");
    }
}
