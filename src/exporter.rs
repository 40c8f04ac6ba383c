//! Prometheus scrape endpoint over the latest snapshot.
//!
//! Handlers never touch the informer or the engine: they clone the
//! current `Arc<Snapshot>` out of the watch channel and render it. A
//! fresh registry is populated per scrape, so counters carry the
//! snapshot's accumulated totals directly.

use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::snapshot::{Snapshot, ZoneUsageMap};

/// Immutable identity facts rendered as info metrics.
#[derive(Debug, Clone)]
pub struct StaticInfo {
    pub node_name: String,
    pub arch: String,
    pub cpu_vendor: String,
    pub cpu_model: String,
    pub cpu_cores: usize,
    /// (component, backend) pairs from the energy registry.
    pub sources: Vec<(&'static str, &'static str)>,
}

/// Host CPU identity from `/proc/cpuinfo`.
pub fn collect_cpu_info(
    procfs_root: &Path,
    arch_override: Option<&str>,
) -> (String, String, String, usize) {
    let arch = arch_override
        .map(str::to_string)
        .unwrap_or_else(|| std::env::consts::ARCH.to_string());

    let mut vendor = String::new();
    let mut model = String::new();
    let mut cores = 0usize;
    if let Ok(raw) = std::fs::read_to_string(procfs_root.join("cpuinfo")) {
        for line in raw.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "processor" => cores += 1,
                "vendor_id" if vendor.is_empty() => vendor = value.to_string(),
                "model name" if model.is_empty() => model = value.to_string(),
                _ => {}
            }
        }
    }
    (arch, vendor, model, cores)
}

struct ExporterState {
    snapshot: watch::Receiver<Arc<Snapshot>>,
    info: StaticInfo,
}

/// Build the HTTP surface: the metrics route plus a liveness route.
pub fn router(
    snapshot: watch::Receiver<Arc<Snapshot>>,
    info: StaticInfo,
    metrics_path: &str,
) -> Router {
    let state = Arc::new(ExporterState { snapshot, info });
    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn metrics_handler(State(state): State<Arc<ExporterState>>) -> Response {
    let snapshot = state.snapshot.borrow().clone();
    match render_metrics(&snapshot, &state.info) {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Metrics rendering failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// One metric pair (watts gauge, joules counter) per workload class.
struct ClassMetrics {
    watts: GaugeVec,
    joules: CounterVec,
}

fn class_metrics(
    registry: &Registry,
    class: &str,
    labels: &[&str],
) -> prometheus::Result<ClassMetrics> {
    let mut label_names: Vec<&str> = labels.to_vec();
    label_names.push("zone");
    label_names.push("state");

    let watts = GaugeVec::new(
        Opts::new(
            format!("wattmon_{class}_zone_watts"),
            format!("Average power of a {class} in one energy zone over the last sample interval"),
        ),
        &label_names,
    )?;
    let joules = CounterVec::new(
        Opts::new(
            format!("wattmon_{class}_zone_joules_total"),
            format!("Energy attributed to a {class} in one energy zone since it was first seen"),
        ),
        &label_names,
    )?;
    registry.register(Box::new(watts.clone()))?;
    registry.register(Box::new(joules.clone()))?;
    Ok(ClassMetrics { watts, joules })
}

impl ClassMetrics {
    fn observe(&self, labels: &[&str], state: &str, zones: &ZoneUsageMap) {
        for (zone, usage) in zones {
            let zone_name = zone.to_string();
            let mut values: Vec<&str> = labels.to_vec();
            values.push(&zone_name);
            values.push(state);
            self.watts.with_label_values(&values).set(usage.power_watts);
            self.joules
                .with_label_values(&values)
                .inc_by(usage.energy_joules());
        }
    }
}

/// Render the whole exposition text for one snapshot.
pub fn render_metrics(snapshot: &Snapshot, info: &StaticInfo) -> anyhow::Result<String> {
    let registry = Registry::new();

    let build_info = GaugeVec::new(
        Opts::new("wattmon_build_info", "Build identity of this agent"),
        &["version", "node"],
    )?;
    registry.register(Box::new(build_info.clone()))?;
    build_info
        .with_label_values(&[env!("CARGO_PKG_VERSION"), &info.node_name])
        .set(1.0);

    let cpu_info = GaugeVec::new(
        Opts::new("wattmon_node_cpu_info", "Host CPU identity"),
        &["arch", "vendor", "model", "cores"],
    )?;
    registry.register(Box::new(cpu_info.clone()))?;
    cpu_info
        .with_label_values(&[
            &info.arch,
            &info.cpu_vendor,
            &info.cpu_model,
            &info.cpu_cores.to_string(),
        ])
        .set(1.0);

    let source_info = GaugeVec::new(
        Opts::new(
            "wattmon_energy_source_info",
            "Selected energy backend per component",
        ),
        &["component", "source"],
    )?;
    registry.register(Box::new(source_info.clone()))?;
    for (component, source) in &info.sources {
        source_info.with_label_values(&[component, source]).set(1.0);
    }

    let cpu_usage = GaugeVec::new(
        Opts::new(
            "wattmon_node_cpu_usage_ratio",
            "Host CPU utilization ratio over the last sample interval",
        ),
        &["node"],
    )?;
    registry.register(Box::new(cpu_usage.clone()))?;
    cpu_usage
        .with_label_values(&[&info.node_name])
        .set(snapshot.node.cpu_usage_ratio);

    let node_watts = GaugeVec::new(
        Opts::new(
            "wattmon_node_zone_watts",
            "Node power per energy zone over the last sample interval",
        ),
        &["zone"],
    )?;
    let node_joules = CounterVec::new(
        Opts::new(
            "wattmon_node_zone_joules_total",
            "Node energy per zone since agent start",
        ),
        &["zone"],
    )?;
    registry.register(Box::new(node_watts.clone()))?;
    registry.register(Box::new(node_joules.clone()))?;
    for (zone, usage) in &snapshot.node.zones {
        let zone_name = zone.to_string();
        node_watts
            .with_label_values(&[&zone_name])
            .set(usage.power_watts);
        node_joules
            .with_label_values(&[&zone_name])
            .inc_by(usage.energy_total_mj as f64 / 1000.0);
    }

    let process = class_metrics(
        &registry,
        "process",
        &["pid", "comm", "kind", "container_id", "vm_id"],
    )?;
    for (state, members) in [
        ("running", &snapshot.processes.running),
        ("terminated", &snapshot.processes.terminated),
    ] {
        for p in members.values() {
            let pid = p.pid.to_string();
            let kind = p.kind.to_string();
            process.observe(
                &[
                    &pid,
                    &p.comm,
                    &kind,
                    p.container_id.as_deref().unwrap_or(""),
                    p.vm_id.as_deref().unwrap_or(""),
                ],
                state,
                &p.zones,
            );
        }
    }

    let container = class_metrics(
        &registry,
        "container",
        &["container_id", "container_name", "runtime", "pod_id"],
    )?;
    for (state, members) in [
        ("running", &snapshot.containers.running),
        ("terminated", &snapshot.containers.terminated),
    ] {
        for c in members.values() {
            let runtime = c.runtime.to_string();
            container.observe(
                &[&c.id, &c.name, &runtime, c.pod_id.as_deref().unwrap_or("")],
                state,
                &c.zones,
            );
        }
    }

    let vm = class_metrics(&registry, "vm", &["vm_id", "vm_name", "hypervisor"])?;
    for (state, members) in [
        ("running", &snapshot.virtual_machines.running),
        ("terminated", &snapshot.virtual_machines.terminated),
    ] {
        for v in members.values() {
            let hypervisor = v.hypervisor.to_string();
            vm.observe(&[&v.id, &v.name, &hypervisor], state, &v.zones);
        }
    }

    let pod = class_metrics(&registry, "pod", &["pod_id", "pod_name", "namespace"])?;
    for (state, members) in [
        ("running", &snapshot.pods.running),
        ("terminated", &snapshot.pods.terminated),
    ] {
        for p in members.values() {
            pod.observe(&[&p.id, &p.name, &p.namespace], state, &p.zones);
        }
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
