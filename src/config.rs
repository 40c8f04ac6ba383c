//! Runtime configuration for the agent.
//!
//! CLI flags map one-to-one onto [`Config`]; `main.rs` owns the clap
//! surface and converts into this typed form. Validation clamps values
//! with a hard floor (sample period minimum) instead of rejecting them.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Smallest allowed sampling interval.
pub const MIN_SAMPLE_PERIOD: Duration = Duration::from_secs(1);

/// Default sampling interval.
pub const DEFAULT_SAMPLE_PERIOD: Duration = Duration::from_secs(3);

/// Kernel clock tick rate assumed when converting stat ticks to seconds.
pub const DEFAULT_TICKS_PER_SECOND: u32 = 100;

/// Where node-level platform power is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PlatformSource {
    /// Probe ACPI hwmon first, then Redfish if credentials are present.
    #[default]
    Auto,
    /// ACPI power-meter hwmon sensors only.
    Acpi,
    /// Redfish out-of-band BMC only.
    Redfish,
    /// No platform zone.
    None,
}

/// Transport for the tool-call endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ToolTransport {
    /// MCP over stdin/stdout.
    Stdio,
    /// MCP over HTTP server-sent events.
    Sse,
    /// MCP over streamable HTTP.
    #[default]
    Streamable,
}

/// Per-workload counter used to judge whether the node is idle and to
/// apportion dynamic energy for a zone.
///
/// Only CPU time is collected by the informer today; the other variants
/// resolve to a CPU-time fallback at attribution time so a perf-counter
/// source can be wired in without changing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum UsageMetric {
    /// Hardware instruction count.
    #[default]
    Instructions,
    /// Hardware cycle count.
    Cycles,
    /// Last-level cache misses.
    CacheMisses,
    /// DRAM access count.
    DramAccesses,
    /// GPU utilization share.
    GpuUtilization,
    /// Scheduler CPU time.
    CpuTime,
}

/// Credentials and connection settings for the Redfish backend, loaded
/// from the file named by `--redfish-cred-file`.
#[derive(Debug, Clone, Deserialize)]
pub struct RedfishConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub skip_ssl_verify: bool,
}

/// Fully resolved agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub sample_period: Duration,
    pub procfs_root: PathBuf,
    pub sysfs_root: PathBuf,
    pub ticks_per_second: u32,
    pub enable_msr: bool,
    pub enable_gpu: bool,
    pub allow_estimation: bool,
    pub estimated_watts: f64,
    pub cpu_arch_override: Option<String>,
    pub platform_source: PlatformSource,
    pub redfish: Option<RedfishConfig>,
    pub redfish_probe_interval: Duration,
    pub idle_signal_metric: UsageMetric,
    pub listen_addr: SocketAddr,
    pub metrics_path: String,
    pub tool_endpoint_path: String,
    pub tool_transport: ToolTransport,
    pub node_name: String,
    pub kube_pod_lookup: bool,
    pub max_terminated: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_period: DEFAULT_SAMPLE_PERIOD,
            procfs_root: PathBuf::from("/proc"),
            sysfs_root: PathBuf::from("/sys"),
            ticks_per_second: DEFAULT_TICKS_PER_SECOND,
            enable_msr: false,
            enable_gpu: true,
            allow_estimation: true,
            estimated_watts: 100.0,
            cpu_arch_override: None,
            platform_source: PlatformSource::Auto,
            redfish: None,
            redfish_probe_interval: Duration::from_secs(30),
            idle_signal_metric: UsageMetric::Instructions,
            listen_addr: "0.0.0.0:28282".parse().expect("static addr"),
            metrics_path: "/metrics".to_string(),
            tool_endpoint_path: "/mcp".to_string(),
            tool_transport: ToolTransport::Streamable,
            node_name: default_node_name(),
            kube_pod_lookup: true,
            max_terminated: 500,
        }
    }
}

impl Config {
    /// Clamp out-of-range values to their allowed minimums.
    pub fn validate(&mut self) {
        if self.sample_period < MIN_SAMPLE_PERIOD {
            tracing::warn!(
                requested = ?self.sample_period,
                minimum = ?MIN_SAMPLE_PERIOD,
                "Sample period below minimum, clamping"
            );
            self.sample_period = MIN_SAMPLE_PERIOD;
        }
        if self.ticks_per_second == 0 {
            tracing::warn!("ticks-per-second must be nonzero, using default");
            self.ticks_per_second = DEFAULT_TICKS_PER_SECOND;
        }
    }
}

/// Node name from the environment (downward API) or the hostname.
pub fn default_node_name() -> String {
    std::env::var("NODE_NAME")
        .ok()
        .filter(|n| !n.is_empty())
        .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Load Redfish credentials from a JSON file:
/// `{"host": "...", "username": "...", "password": "...", "skip_ssl_verify": false}`.
pub fn load_redfish_credentials(path: &Path) -> anyhow::Result<RedfishConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading Redfish credential file {}", path.display()))?;
    let creds: RedfishConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parsing Redfish credential file {}", path.display()))?;
    if creds.host.is_empty() {
        anyhow::bail!("Redfish credential file {} has an empty host", path.display());
    }
    Ok(creds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sample_period_clamped_to_minimum() {
        let mut config = Config {
            sample_period: Duration::from_millis(250),
            ..Config::default()
        };
        config.validate();
        assert_eq!(config.sample_period, MIN_SAMPLE_PERIOD);
    }

    #[test]
    fn test_default_period_unchanged() {
        let mut config = Config::default();
        config.validate();
        assert_eq!(config.sample_period, DEFAULT_SAMPLE_PERIOD);
    }

    #[test]
    fn test_redfish_credentials_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"host": "https://bmc.example", "username": "root", "password": "calvin", "skip_ssl_verify": true}}"#
        )
        .unwrap();

        let creds = load_redfish_credentials(file.path()).unwrap();
        assert_eq!(creds.host, "https://bmc.example");
        assert_eq!(creds.username, "root");
        assert!(creds.skip_ssl_verify);
    }

    #[test]
    fn test_redfish_credentials_empty_host_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"host": "", "username": "u", "password": "p"}}"#).unwrap();
        assert!(load_redfish_credentials(file.path()).is_err());
    }
}
