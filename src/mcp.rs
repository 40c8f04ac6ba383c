//! MCP tool-call endpoint over the latest snapshot.
//!
//! Three read-only tools for agents: rank workloads by consumption,
//! inspect one workload's per-zone power, and search workloads by power
//! band or name. Results are short human-readable text blocks; the
//! transport (stdio, SSE, streamable HTTP) is wired in `main.rs`.

use std::sync::Arc;

use rmcp::{
    handler::server::router::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::snapshot::Snapshot;

/// MCP server facade over the snapshot channel.
#[derive(Clone)]
pub struct EnergyToolServer {
    snapshot: watch::Receiver<Arc<Snapshot>>,
    tool_router: ToolRouter<Self>,
}

impl EnergyToolServer {
    pub fn new(snapshot: watch::Receiver<Arc<Snapshot>>) -> Self {
        Self {
            snapshot,
            tool_router: Self::tool_router(),
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot.borrow().clone()
    }
}

// --- Tool Parameter Types ---

/// Parameters for the list_top_consumers tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ListTopConsumersParams {
    /// Workload class: "process", "container", "vm", "pod", or "node".
    pub resource_type: String,

    /// Maximum number of results (default: 10).
    #[serde(default)]
    pub limit: Option<usize>,

    /// Ranking key: "power" (default) or "energy".
    #[serde(default)]
    pub sort_by: Option<String>,
}

/// Parameters for the get_resource_power tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetResourcePowerParams {
    /// Workload class: "process", "container", "vm", "pod", or "node".
    pub resource_type: String,

    /// PID, workload ID (full or unique prefix), or exact name.
    pub resource_id: String,
}

/// Parameters for the search_resources tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SearchResourcesParams {
    /// Workload class: "process", "container", "vm", "pod", or "node".
    pub resource_type: String,

    /// Minimum total power in watts.
    #[serde(default)]
    pub power_min: Option<f64>,

    /// Maximum total power in watts.
    #[serde(default)]
    pub power_max: Option<f64>,

    /// Case-insensitive substring matched against workload names.
    #[serde(default)]
    pub name_pattern: Option<String>,

    /// Maximum number of results (default: 20).
    #[serde(default)]
    pub limit: Option<usize>,
}

// --- Snapshot flattening ---

/// One workload flattened for ranking and rendering.
#[derive(Debug, Clone)]
struct WorkloadRow {
    id: String,
    name: String,
    detail: String,
    power_watts: f64,
    energy_joules: f64,
}

fn collect_rows(snapshot: &Snapshot, resource_type: &str) -> Result<Vec<WorkloadRow>, String> {
    let rows = match resource_type {
        "process" => snapshot
            .processes
            .running
            .values()
            .map(|p| WorkloadRow {
                id: p.pid.to_string(),
                name: p.comm.clone(),
                detail: match &p.container_id {
                    Some(container) => format!("{} in container {container}", p.kind),
                    None => p.kind.to_string(),
                },
                power_watts: Snapshot::total_watts(&p.zones),
                energy_joules: Snapshot::total_joules(&p.zones),
            })
            .collect(),
        "container" => snapshot
            .containers
            .running
            .values()
            .map(|c| WorkloadRow {
                id: c.id.clone(),
                name: c.name.clone(),
                detail: match &c.pod_id {
                    Some(pod) => format!("runtime {}, pod {pod}", c.runtime),
                    None => format!("runtime {}", c.runtime),
                },
                power_watts: Snapshot::total_watts(&c.zones),
                energy_joules: Snapshot::total_joules(&c.zones),
            })
            .collect(),
        "vm" => snapshot
            .virtual_machines
            .running
            .values()
            .map(|v| WorkloadRow {
                id: v.id.clone(),
                name: v.name.clone(),
                detail: format!("hypervisor {}", v.hypervisor),
                power_watts: Snapshot::total_watts(&v.zones),
                energy_joules: Snapshot::total_joules(&v.zones),
            })
            .collect(),
        "pod" => snapshot
            .pods
            .running
            .values()
            .map(|p| WorkloadRow {
                id: p.id.clone(),
                name: p.name.clone(),
                detail: format!("namespace {}, {} containers", p.namespace, p.container_ids.len()),
                power_watts: Snapshot::total_watts(&p.zones),
                energy_joules: Snapshot::total_joules(&p.zones),
            })
            .collect(),
        "node" => {
            let power: f64 = snapshot.node.zones.values().map(|z| z.power_watts).sum();
            let energy: f64 = snapshot
                .node
                .zones
                .values()
                .map(|z| z.energy_total_mj as f64 / 1000.0)
                .sum();
            vec![WorkloadRow {
                id: "node".to_string(),
                name: "node".to_string(),
                detail: format!("{} zones", snapshot.node.zones.len()),
                power_watts: power,
                energy_joules: energy,
            }]
        }
        other => {
            return Err(format!(
                "unknown resource_type '{other}' (expected process, container, vm, pod, or node)"
            ))
        }
    };
    Ok(rows)
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

fn render_row(index: usize, row: &WorkloadRow) -> String {
    format!(
        "{index}. {name} (id={id}, {detail}): {power:.3} W, {energy:.3} J total",
        name = if row.name.is_empty() { "<unnamed>" } else { row.name.as_str() },
        id = short_id(&row.id),
        detail = row.detail,
        power = row.power_watts,
        energy = row.energy_joules,
    )
}

// --- Pure renderers (unit-tested without a transport) ---

fn render_top_consumers(
    snapshot: &Snapshot,
    params: &ListTopConsumersParams,
) -> Result<String, String> {
    let sort_by = params.sort_by.as_deref().unwrap_or("power");
    if !matches!(sort_by, "power" | "energy") {
        return Err(format!("unknown sort_by '{sort_by}' (expected power or energy)"));
    }
    let mut rows = collect_rows(snapshot, &params.resource_type)?;
    rows.sort_by(|a, b| {
        let (ka, kb) = match sort_by {
            "energy" => (a.energy_joules, b.energy_joules),
            _ => (a.power_watts, b.power_watts),
        };
        kb.partial_cmp(&ka).unwrap_or(std::cmp::Ordering::Equal)
    });

    let limit = params.limit.unwrap_or(10);
    let total = rows.len();
    let mut out = format!(
        "Top {} {} consumers by {} (of {} running):\n",
        limit.min(total),
        params.resource_type,
        sort_by,
        total
    );
    if rows.is_empty() {
        out.push_str("(none running)\n");
    }
    for (i, row) in rows.iter().take(limit).enumerate() {
        out.push_str(&render_row(i + 1, row));
        out.push('\n');
    }
    Ok(out)
}

fn render_resource_power(
    snapshot: &Snapshot,
    params: &GetResourcePowerParams,
) -> Result<String, String> {
    if params.resource_type == "node" {
        let mut out = format!(
            "Node energy by zone (cpu usage {:.1}%):\n",
            snapshot.node.cpu_usage_ratio * 100.0
        );
        for (zone, usage) in &snapshot.node.zones {
            out.push_str(&format!(
                "  {zone}: {power:.3} W, {total:.3} J total ({idle:.3} J idle, {dynamic:.3} J dynamic)\n",
                power = usage.power_watts,
                total = usage.energy_total_mj as f64 / 1000.0,
                idle = usage.idle_energy_mj as f64 / 1000.0,
                dynamic = usage.dynamic_energy_mj as f64 / 1000.0,
            ));
        }
        return Ok(out);
    }

    let needle = params.resource_id.as_str();
    let zones = match params.resource_type.as_str() {
        "process" => snapshot
            .processes
            .running
            .values()
            .find(|p| p.pid.to_string() == needle || p.comm == needle)
            .map(|p| (format!("process {} ({})", p.pid, p.comm), p.zones.clone())),
        "container" => snapshot
            .containers
            .running
            .values()
            .find(|c| c.id.starts_with(needle) || c.name == needle)
            .map(|c| {
                (
                    format!("container {} ({})", short_id(&c.id), c.name),
                    c.zones.clone(),
                )
            }),
        "vm" => snapshot
            .virtual_machines
            .running
            .values()
            .find(|v| v.id.starts_with(needle) || v.name == needle)
            .map(|v| (format!("vm {} ({})", v.id, v.name), v.zones.clone())),
        "pod" => snapshot
            .pods
            .running
            .values()
            .find(|p| p.id.starts_with(needle) || p.name == needle)
            .map(|p| (format!("pod {} ({})", short_id(&p.id), p.name), p.zones.clone())),
        other => {
            return Err(format!(
                "unknown resource_type '{other}' (expected process, container, vm, pod, or node)"
            ))
        }
    };

    let Some((title, zones)) = zones else {
        return Err(format!(
            "no running {} matches '{}'",
            params.resource_type, params.resource_id
        ));
    };

    let mut out = format!(
        "{title}: {power:.3} W, {energy:.3} J total\n",
        power = Snapshot::total_watts(&zones),
        energy = Snapshot::total_joules(&zones),
    );
    for (zone, usage) in &zones {
        out.push_str(&format!(
            "  {zone}: {power:.3} W, {energy:.3} J\n",
            power = usage.power_watts,
            energy = usage.energy_joules(),
        ));
    }
    Ok(out)
}

fn render_search(snapshot: &Snapshot, params: &SearchResourcesParams) -> Result<String, String> {
    let mut rows = collect_rows(snapshot, &params.resource_type)?;
    let pattern = params.name_pattern.as_deref().map(str::to_lowercase);
    rows.retain(|row| {
        if let Some(min) = params.power_min {
            if row.power_watts < min {
                return false;
            }
        }
        if let Some(max) = params.power_max {
            if row.power_watts > max {
                return false;
            }
        }
        if let Some(ref pattern) = pattern {
            if !row.name.to_lowercase().contains(pattern) {
                return false;
            }
        }
        true
    });
    rows.sort_by(|a, b| {
        b.power_watts
            .partial_cmp(&a.power_watts)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let limit = params.limit.unwrap_or(20);
    let total = rows.len();
    let mut out = format!(
        "{} matching {} workload(s), showing {}:\n",
        total,
        params.resource_type,
        limit.min(total)
    );
    if rows.is_empty() {
        out.push_str("(no matches)\n");
    }
    for (i, row) in rows.iter().take(limit).enumerate() {
        out.push_str(&render_row(i + 1, row));
        out.push('\n');
    }
    Ok(out)
}

// --- Tool Implementations ---

#[tool_router]
impl EnergyToolServer {
    /// Rank running workloads of a class by power or energy.
    #[tool(
        name = "list_top_consumers",
        description = "List the top energy consumers of one workload class (process, container, vm, pod, or node), sorted by current power or accumulated energy."
    )]
    async fn list_top_consumers(
        &self,
        Parameters(params): Parameters<ListTopConsumersParams>,
    ) -> Result<CallToolResult, McpError> {
        let snapshot = self.current();
        let text = render_top_consumers(&snapshot, &params)
            .map_err(|e| McpError::invalid_params(e, None))?;
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    /// Per-zone power breakdown for one workload.
    #[tool(
        name = "get_resource_power",
        description = "Show the per-zone power and energy of one workload, addressed by PID, ID, ID prefix, or name. Use resource_type 'node' for the node-level zone breakdown."
    )]
    async fn get_resource_power(
        &self,
        Parameters(params): Parameters<GetResourcePowerParams>,
    ) -> Result<CallToolResult, McpError> {
        let snapshot = self.current();
        let text = render_resource_power(&snapshot, &params)
            .map_err(|e| McpError::invalid_params(e, None))?;
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    /// Filter workloads by power band and name substring.
    #[tool(
        name = "search_resources",
        description = "Search running workloads of one class by power range (watts) and case-insensitive name substring."
    )]
    async fn search_resources(
        &self,
        Parameters(params): Parameters<SearchResourcesParams>,
    ) -> Result<CallToolResult, McpError> {
        let snapshot = self.current();
        let text =
            render_search(&snapshot, &params).map_err(|e| McpError::invalid_params(e, None))?;
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }
}

#[tool_handler]
impl ServerHandler for EnergyToolServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: rmcp::model::Implementation {
                name: "wattmon".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: Some("Node Energy Monitor".into()),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Per-node energy attribution. Use list_top_consumers to rank processes, \
                 containers, VMs, or pods by power draw, get_resource_power for a per-zone \
                 breakdown of one workload, and search_resources to filter by power range \
                 or name."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::Zone;
    use crate::resource::{ContainerRuntime, ProcessKind};
    use crate::snapshot::{ContainerSnapshot, ProcessSnapshot, Usage, ZoneUsageMap};

    fn zones(power: f64, energy_mj: u64) -> ZoneUsageMap {
        ZoneUsageMap::from([(
            Zone::Package(0),
            Usage {
                power_watts: power,
                energy_total_mj: energy_mj,
            },
        )])
    }

    fn test_snapshot() -> Snapshot {
        let mut snapshot = Snapshot::empty();
        for (pid, comm, power) in [(1, "idleish", 0.5), (2, "burner", 9.0), (3, "mid", 3.0)] {
            snapshot.processes.running.insert(
                pid,
                ProcessSnapshot {
                    pid,
                    comm: comm.to_string(),
                    exe: String::new(),
                    kind: ProcessKind::Regular,
                    container_id: None,
                    vm_id: None,
                    cpu_time_total: 1.0,
                    cpu_time_delta: 0.1,
                    zones: zones(power, (power * 1000.0) as u64),
                },
            );
        }
        snapshot.containers.running.insert(
            "deadbeef00112233".to_string(),
            ContainerSnapshot {
                id: "deadbeef00112233".to_string(),
                name: "web-frontend".to_string(),
                runtime: ContainerRuntime::Containerd,
                pod_id: None,
                cpu_time_total: 2.0,
                cpu_time_delta: 0.2,
                zones: zones(4.2, 4_200),
            },
        );
        snapshot
    }

    #[test]
    fn test_top_consumers_sorted_by_power() {
        let text = render_top_consumers(
            &test_snapshot(),
            &ListTopConsumersParams {
                resource_type: "process".to_string(),
                limit: Some(2),
                sort_by: None,
            },
        )
        .unwrap();
        let burner = text.find("burner").unwrap();
        let mid = text.find("mid").unwrap();
        assert!(burner < mid);
        assert!(!text.contains("idleish"));
    }

    #[test]
    fn test_top_consumers_rejects_bad_type() {
        let err = render_top_consumers(
            &test_snapshot(),
            &ListTopConsumersParams {
                resource_type: "zone".to_string(),
                limit: None,
                sort_by: None,
            },
        )
        .unwrap_err();
        assert!(err.contains("unknown resource_type"));
    }

    #[test]
    fn test_resource_power_by_id_prefix() {
        let text = render_resource_power(
            &test_snapshot(),
            &GetResourcePowerParams {
                resource_type: "container".to_string(),
                resource_id: "deadbeef".to_string(),
            },
        )
        .unwrap();
        assert!(text.contains("web-frontend"));
        assert!(text.contains("package-0"));
        assert!(text.contains("4.200 W"));
    }

    #[test]
    fn test_resource_power_by_pid() {
        let text = render_resource_power(
            &test_snapshot(),
            &GetResourcePowerParams {
                resource_type: "process".to_string(),
                resource_id: "2".to_string(),
            },
        )
        .unwrap();
        assert!(text.contains("burner"));
    }

    #[test]
    fn test_resource_power_not_found() {
        let err = render_resource_power(
            &test_snapshot(),
            &GetResourcePowerParams {
                resource_type: "vm".to_string(),
                resource_id: "nope".to_string(),
            },
        )
        .unwrap_err();
        assert!(err.contains("no running vm"));
    }

    #[test]
    fn test_search_power_band_and_name() {
        let text = render_search(
            &test_snapshot(),
            &SearchResourcesParams {
                resource_type: "process".to_string(),
                power_min: Some(1.0),
                power_max: Some(5.0),
                name_pattern: None,
                limit: None,
            },
        )
        .unwrap();
        assert!(text.contains("mid"));
        assert!(!text.contains("burner"));
        assert!(!text.contains("idleish"));

        let text = render_search(
            &test_snapshot(),
            &SearchResourcesParams {
                resource_type: "container".to_string(),
                power_min: None,
                power_max: None,
                name_pattern: Some("FRONT".to_string()),
                limit: None,
            },
        )
        .unwrap();
        assert!(text.contains("web-frontend"));
    }

    #[test]
    fn test_node_breakdown() {
        let mut snapshot = test_snapshot();
        snapshot.node.zones.insert(
            Zone::Package(0),
            crate::snapshot::NodeZoneUsage {
                power_watts: 20.0,
                energy_total_mj: 60_000,
                idle_energy_mj: 20_000,
                dynamic_energy_mj: 40_000,
                ..Default::default()
            },
        );
        let text = render_resource_power(
            &snapshot,
            &GetResourcePowerParams {
                resource_type: "node".to_string(),
                resource_id: String::new(),
            },
        )
        .unwrap();
        assert!(text.contains("package-0"));
        assert!(text.contains("60.000 J total"));
    }
}
