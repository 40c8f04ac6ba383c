//! Per-node energy attribution for Linux hosts.
//!
//! Once per tick the agent samples hardware energy counters and procfs
//! CPU usage, classifies processes into containers and virtual
//! machines, resolves containers to pods through the Kubernetes API,
//! splits each energy zone's delta into idle and dynamic parts, and
//! attributes the dynamic part to workloads by usage ratio. The result
//! is an immutable snapshot served over a Prometheus scrape endpoint
//! and an MCP tool endpoint.
//!
//! ## Architecture
//!
//! 1. **Resource Informer** (`resource` module) - scans procfs, detects
//!    container and VM membership from cgroup paths and command lines,
//!    and tracks running/terminated workloads with CPU-time deltas.
//!
//! 2. **Energy Source Registry** (`energy` module) - probes RAPL sysfs,
//!    MSR, hwmon/ACPI, Redfish, and NVML backends in preference order
//!    and reads cumulative joule counters.
//!
//! 3. **Attribution Engine** (`attribution` module) - converts counters
//!    into idle/dynamic splits and distributes energy to processes,
//!    containers, VMs, and pods.
//!
//! 4. **Snapshot Orchestrator** (`orchestrator` module) - drives the
//!    tick loop and publishes snapshots to the endpoint handlers.

pub mod attribution;
pub mod config;
pub mod energy;
pub mod exporter;
pub mod kubernetes;
pub mod mcp;
pub mod orchestrator;
pub mod procfs;
pub mod resource;
pub mod snapshot;
