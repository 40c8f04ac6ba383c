//! Agent entrypoint: CLI parsing, wiring, signal handling.
//!
//! Exit codes: 0 clean shutdown, 1 configuration failure, 2 no energy
//! source available when estimation is disallowed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use wattmon::attribution::{AttributionEngine, EngineSettings};
use wattmon::config::{
    load_redfish_credentials, Config, PlatformSource, ToolTransport, UsageMetric,
};
use wattmon::energy::{EnergyError, EnergySourceRegistry};
use wattmon::exporter::{self, StaticInfo};
use wattmon::kubernetes::{KubePodStore, PodLookup};
use wattmon::mcp::EnergyToolServer;
use wattmon::orchestrator::Orchestrator;
use wattmon::procfs::ProcFs;
use wattmon::resource::informer::ResourceInformer;

const EXIT_CONFIG: i32 = 1;
const EXIT_NO_ENERGY_SOURCE: i32 = 2;

/// Per-node energy attribution agent
#[derive(Parser, Debug)]
#[command(name = "wattmon")]
#[command(about = "Attribute node energy to processes, containers, VMs, and pods")]
#[command(version)]
struct Args {
    /// Sampling interval in seconds (minimum 1)
    #[arg(long, default_value = "3", env = "WATTMON_SAMPLE_PERIOD_SECS")]
    sample_period_secs: u64,

    /// Root of the process filesystem
    #[arg(long, default_value = "/proc")]
    procfs_root: PathBuf,

    /// Root of the sysfs tree (energy counters, hwmon)
    #[arg(long, default_value = "/sys")]
    sysfs_root: PathBuf,

    /// Kernel clock ticks per second for stat conversion
    #[arg(long, default_value = "100")]
    ticks_per_second: u32,

    /// Allow the MSR energy backend
    #[arg(long, default_value = "false")]
    enable_msr: bool,

    /// Probe the GPU energy backend
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    enable_gpu: bool,

    /// Fall back to constant-power estimation when no hardware source
    /// exists; disabling this makes a missing source fatal
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    allow_estimation: bool,

    /// Assumed node power for the estimation fallback, watts
    #[arg(long, default_value = "100.0")]
    estimated_watts: f64,

    /// Report this CPU architecture instead of detecting it
    #[arg(long)]
    cpu_arch_override: Option<String>,

    /// Where node platform power is read from
    #[arg(long, value_enum, default_value_t = PlatformSource::Auto)]
    platform_source: PlatformSource,

    /// JSON file with Redfish credentials (host/username/password)
    #[arg(long)]
    redfish_cred_file: Option<PathBuf>,

    /// Redfish background poll cadence in seconds
    #[arg(long, default_value = "30")]
    redfish_probe_interval_secs: u64,

    /// Counter whose new minimum marks the node "sufficiently idle"
    #[arg(long, value_enum, default_value_t = UsageMetric::Instructions)]
    idle_signal_metric: UsageMetric,

    /// HTTP listen address for metrics and tool endpoints
    #[arg(long, default_value = "0.0.0.0:28282")]
    listen_addr: SocketAddr,

    /// HTTP path of the Prometheus scrape endpoint
    #[arg(long, default_value = "/metrics")]
    metrics_path: String,

    /// HTTP path of the MCP tool endpoint
    #[arg(long, default_value = "/mcp")]
    tool_endpoint_path: String,

    /// MCP transport
    #[arg(long, value_enum, default_value_t = ToolTransport::Streamable)]
    tool_transport: ToolTransport,

    /// Node name for labels (downward API in a DaemonSet)
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Resolve containers to pods via the Kubernetes API when available
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    kube_pod_lookup: bool,

    /// Upper bound on terminated workloads kept in one snapshot
    #[arg(long, default_value = "500")]
    max_terminated: usize,
}

fn build_config(args: Args) -> anyhow::Result<Config> {
    let redfish = match &args.redfish_cred_file {
        Some(path) => Some(load_redfish_credentials(path)?),
        None => None,
    };

    let mut config = Config {
        sample_period: Duration::from_secs(args.sample_period_secs),
        procfs_root: args.procfs_root,
        sysfs_root: args.sysfs_root,
        ticks_per_second: args.ticks_per_second,
        enable_msr: args.enable_msr,
        enable_gpu: args.enable_gpu,
        allow_estimation: args.allow_estimation,
        estimated_watts: args.estimated_watts,
        cpu_arch_override: args.cpu_arch_override,
        platform_source: args.platform_source,
        redfish,
        redfish_probe_interval: Duration::from_secs(args.redfish_probe_interval_secs),
        idle_signal_metric: args.idle_signal_metric,
        listen_addr: args.listen_addr,
        metrics_path: args.metrics_path,
        tool_endpoint_path: args.tool_endpoint_path,
        tool_transport: args.tool_transport,
        node_name: args
            .node_name
            .unwrap_or_else(wattmon::config::default_node_name),
        kube_pod_lookup: args.kube_pod_lookup,
        max_terminated: args.max_terminated,
    };
    config.validate();
    Ok(config)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // RUST_LOG takes precedence, fallback to info. With the stdio MCP
    // transport, stdout belongs to the protocol stream and logs must go
    // to stderr.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if args.tool_transport == ToolTransport::Stdio {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
    let config = match build_config(args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Configuration failure");
            std::process::exit(EXIT_CONFIG);
        }
    };

    tracing::info!(
        sample_period = ?config.sample_period,
        procfs_root = %config.procfs_root.display(),
        sysfs_root = %config.sysfs_root.display(),
        platform_source = ?config.platform_source,
        listen = %config.listen_addr,
        node = %config.node_name,
        "Starting wattmon"
    );

    let registry = match EnergySourceRegistry::probe(&config).await {
        Ok(registry) => registry,
        Err(e @ EnergyError::NoCpuSource) => {
            tracing::error!(error = %e, "Cannot initialize any energy source");
            std::process::exit(EXIT_NO_ENERGY_SOURCE);
        }
    };

    if let Err(e) = run(config, registry).await {
        tracing::error!(error = %format!("{e:#}"), "Agent failed");
        std::process::exit(EXIT_CONFIG);
    }
}

async fn run(config: Config, registry: EnergySourceRegistry) -> anyhow::Result<()> {
    let sources = registry.sources();

    // Pod association degrades gracefully when the API is unreachable.
    let pod_lookup: Option<Arc<dyn PodLookup>> = if config.kube_pod_lookup {
        KubePodStore::try_new(&config.node_name)
            .await
            .map(|store| store as Arc<dyn PodLookup>)
    } else {
        None
    };

    let procfs = Arc::new(ProcFs::new(&config.procfs_root, config.ticks_per_second));
    let informer = ResourceInformer::new(procfs, pod_lookup, config.max_terminated);
    let engine = AttributionEngine::new(EngineSettings {
        idle_signal: config.idle_signal_metric,
        ..EngineSettings::default()
    });

    let (orchestrator, snapshot_rx) =
        Orchestrator::new(informer, registry, engine, config.sample_period);

    // Shutdown fan-out: signals flip the watch, everything drains.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let signal_shutdown_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
        let _ = signal_shutdown_tx.send(true);
    });

    let orchestrator_task = tokio::spawn(orchestrator.run(shutdown_rx.clone()));

    let (arch, cpu_vendor, cpu_model, cpu_cores) = exporter::collect_cpu_info(
        &config.procfs_root,
        config.cpu_arch_override.as_deref(),
    );
    let info = StaticInfo {
        node_name: config.node_name.clone(),
        arch,
        cpu_vendor,
        cpu_model,
        cpu_cores,
        sources,
    };

    let cancel = CancellationToken::new();
    let mut router = exporter::router(snapshot_rx.clone(), info, &config.metrics_path);
    router = mount_tool_endpoint(router, &config, snapshot_rx.clone(), &cancel);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(
        addr = %config.listen_addr,
        metrics_path = %config.metrics_path,
        "HTTP server listening"
    );

    let mut serve_shutdown = shutdown_rx.clone();
    let serve_cancel = cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while serve_shutdown.changed().await.is_ok() {
                if *serve_shutdown.borrow() {
                    break;
                }
            }
            serve_cancel.cancel();
        })
        .await
        .context("HTTP server")?;

    // Make sure the tick loop stops even if the server exited first.
    let _ = shutdown_tx.send(true);
    orchestrator_task.await.context("joining orchestrator")?;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Attach the MCP endpoint for the configured transport.
fn mount_tool_endpoint(
    router: axum::Router,
    config: &Config,
    snapshot_rx: watch::Receiver<Arc<wattmon::snapshot::Snapshot>>,
    cancel: &CancellationToken,
) -> axum::Router {
    let tool_server = EnergyToolServer::new(snapshot_rx);

    match config.tool_transport {
        ToolTransport::Streamable => {
            use rmcp::transport::streamable_http_server::{
                session::local::LocalSessionManager, StreamableHttpService,
            };
            use rmcp::transport::StreamableHttpServerConfig;

            let service: StreamableHttpService<EnergyToolServer, LocalSessionManager> =
                StreamableHttpService::new(
                    move || Ok(tool_server.clone()),
                    Default::default(),
                    StreamableHttpServerConfig {
                        stateful_mode: true,
                        sse_keep_alive: Some(Duration::from_secs(15)),
                        cancellation_token: cancel.child_token(),
                    },
                );
            tracing::info!(path = %config.tool_endpoint_path, "Tool endpoint on streamable HTTP");
            router.nest_service(&config.tool_endpoint_path, service)
        }
        ToolTransport::Sse => {
            use rmcp::transport::sse_server::{SseServer, SseServerConfig};

            // The SSE transport brings its own HTTP stack, so it gets a
            // sibling listener one port above the main one.
            let sse_addr = std::net::SocketAddr::new(
                config.listen_addr.ip(),
                config.listen_addr.port().wrapping_add(1),
            );
            let sse_config = SseServerConfig {
                bind: sse_addr,
                sse_path: config.tool_endpoint_path.clone(),
                post_path: format!("{}/message", config.tool_endpoint_path),
                ct: cancel.child_token(),
                sse_keep_alive: Some(Duration::from_secs(15)),
            };
            let path = config.tool_endpoint_path.clone();
            tokio::spawn(async move {
                match SseServer::serve_with_config(sse_config).await {
                    Ok(sse_server) => {
                        tracing::info!(addr = %sse_addr, path = %path, "Tool endpoint on SSE");
                        // Dropping the returned token does not stop the
                        // service; shutdown rides the parent token.
                        let _service_ct = sse_server.with_service(move || tool_server.clone());
                    }
                    Err(e) => {
                        tracing::error!(addr = %sse_addr, error = %e, "SSE tool endpoint failed to bind");
                    }
                }
            });
            router
        }
        ToolTransport::Stdio => {
            use rmcp::ServiceExt;

            tokio::spawn(async move {
                match tool_server.serve(rmcp::transport::stdio()).await {
                    Ok(service) => {
                        if let Err(e) = service.waiting().await {
                            tracing::warn!(error = %e, "MCP stdio session ended with error");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "MCP stdio transport failed"),
                }
            });
            tracing::info!("Tool endpoint on stdio");
            router
        }
    }
}
