//! Container-to-pod resolution against the Kubernetes API.
//!
//! A watch-based store keeps a container-ID → pod-metadata cache for the
//! local node, refreshed by a pod watcher with periodic full resyncs.
//! Lookups are answered from the cache: a miss means the container has
//! no pod, which is a distinct outcome from the watcher being broken.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::api::{Api, ListParams};
use kube::runtime::watcher::{self, Event};
use kube::Client;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// If the store has not synced within this window, lookups fail with an
/// API error instead of claiming containers are podless.
const STORE_STALENESS_THRESHOLD: Duration = Duration::from_secs(120);

/// Full-list resync cadence, catching events the watch missed.
const RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Backoff after a broken watch stream.
const WATCH_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Pod identity for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    /// Pod UID.
    pub id: String,
    pub name: String,
    pub namespace: String,
    /// The container's name inside the pod spec.
    pub container_name: String,
}

/// Lookup outcomes. "No pod for this container" is expected and marks
/// the container as podless; `Api` failures join the refresh error.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("no pod for container {0}")]
    NotFound(String),

    #[error("pod store unavailable: {0}")]
    Api(String),
}

impl LookupError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, LookupError::NotFound(_))
    }
}

/// Object-safe pod lookup contract the informer depends on.
pub trait PodLookup: Send + Sync {
    fn lookup(&self, container_id: &str) -> BoxFuture<'_, Result<PodInfo, LookupError>>;
}

#[derive(Debug, Default)]
struct StoreState {
    by_container: HashMap<String, PodInfo>,
    last_sync: Option<Instant>,
}

/// Kubernetes-backed pod store scoped to one node.
pub struct KubePodStore {
    client: Client,
    node_name: String,
    state: Arc<RwLock<StoreState>>,
}

impl KubePodStore {
    /// Create a store with in-cluster (or kubeconfig) credentials and
    /// start its watch loop. Returns `None` when the API is unreachable
    /// so the agent degrades to podless operation.
    pub async fn try_new(node_name: &str) -> Option<Arc<Self>> {
        let client = match Client::try_default().await {
            Ok(client) => client,
            Err(e) => {
                info!(error = %e, "Kubernetes API not available, pod association disabled");
                return None;
            }
        };

        let store = Arc::new(Self {
            client,
            node_name: node_name.to_string(),
            state: Arc::new(RwLock::new(StoreState::default())),
        });

        if let Err(e) = store.resync().await {
            info!(error = %e, "Initial pod list failed, pod association disabled");
            return None;
        }

        info!(node = %store.node_name, "Kubernetes pod store initialized");
        let watch_store = store.clone();
        tokio::spawn(async move {
            watch_store.run_watch_loop().await;
        });
        Some(store)
    }

    /// Full list of pods on this node, replacing the cache.
    async fn resync(&self) -> anyhow::Result<()> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params =
            ListParams::default().fields(&format!("spec.nodeName={}", self.node_name));
        let pod_list = pods.list(&params).await?;

        let mut by_container = HashMap::new();
        for pod in pod_list {
            index_pod(&pod, &mut by_container);
        }

        let mut state = self.state.write().await;
        debug!(containers = by_container.len(), "Pod store resynced");
        state.by_container = by_container;
        state.last_sync = Some(Instant::now());
        Ok(())
    }

    /// Watch pods on this node, resyncing periodically. Runs until the
    /// store is dropped.
    async fn run_watch_loop(self: Arc<Self>) {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let config =
            watcher::Config::default().fields(&format!("spec.nodeName={}", self.node_name));

        loop {
            let stream = watcher::watcher(pods.clone(), config.clone());
            use futures::StreamExt;
            tokio::pin!(stream);
            let mut resync_timer = tokio::time::interval(RESYNC_INTERVAL);
            resync_timer.tick().await;

            loop {
                tokio::select! {
                    event = stream.next() => {
                        match event {
                            Some(Ok(event)) => self.handle_event(event).await,
                            Some(Err(e)) => {
                                warn!(error = %e, "Pod watch error, reconnecting");
                                break;
                            }
                            None => {
                                info!("Pod watch stream ended, reconnecting");
                                break;
                            }
                        }
                    }
                    _ = resync_timer.tick() => {
                        if let Err(e) = self.resync().await {
                            warn!(error = %e, "Periodic pod resync failed");
                        }
                    }
                }
            }

            tokio::time::sleep(WATCH_RECONNECT_BACKOFF).await;
        }
    }

    async fn handle_event(&self, event: Event<Pod>) {
        match event {
            Event::Apply(pod) | Event::InitApply(pod) => {
                let mut additions = HashMap::new();
                index_pod(&pod, &mut additions);
                let mut state = self.state.write().await;
                state.by_container.extend(additions);
                state.last_sync = Some(Instant::now());
            }
            Event::Delete(pod) => {
                let Some(uid) = pod.metadata.uid.as_deref() else {
                    return;
                };
                let mut state = self.state.write().await;
                state.by_container.retain(|_, info| info.id != uid);
                state.last_sync = Some(Instant::now());
            }
            Event::Init => {}
            Event::InitDone => {
                let mut state = self.state.write().await;
                state.last_sync = Some(Instant::now());
            }
        }
    }
}

impl PodLookup for KubePodStore {
    fn lookup(&self, container_id: &str) -> BoxFuture<'_, Result<PodInfo, LookupError>> {
        let container_id = container_id.to_string();
        Box::pin(async move {
            let state = self.state.read().await;
            let stale = state
                .last_sync
                .map(|t| t.elapsed() > STORE_STALENESS_THRESHOLD)
                .unwrap_or(true);
            if stale {
                return Err(LookupError::Api(
                    "pod store has not synced recently".to_string(),
                ));
            }
            state
                .by_container
                .get(&container_id)
                .cloned()
                .ok_or(LookupError::NotFound(container_id))
        })
    }
}

/// Index one pod's container statuses (regular, init, ephemeral) by
/// runtime-prefix-stripped container ID.
fn index_pod(pod: &Pod, out: &mut HashMap<String, PodInfo>) {
    let metadata = &pod.metadata;
    let (Some(uid), Some(pod_name)) = (&metadata.uid, &metadata.name) else {
        return;
    };
    let namespace = metadata.namespace.clone().unwrap_or_default();

    let Some(status) = &pod.status else {
        return;
    };

    let mut index_statuses = |statuses: &Option<Vec<ContainerStatus>>| {
        let Some(statuses) = statuses else {
            return;
        };
        for cs in statuses {
            let Some(container_id) = &cs.container_id else {
                continue;
            };
            out.insert(
                strip_runtime_prefix(container_id).to_string(),
                PodInfo {
                    id: uid.clone(),
                    name: pod_name.clone(),
                    namespace: namespace.clone(),
                    container_name: cs.name.clone(),
                },
            );
        }
    };

    index_statuses(&status.container_statuses);
    index_statuses(&status.init_container_statuses);
    index_statuses(&status.ephemeral_container_statuses);
}

/// The API reports `containerd://<id>`, `docker://<id>`, `cri-o://<id>`;
/// cgroup-derived IDs carry no prefix.
fn strip_runtime_prefix(id: &str) -> &str {
    id.find("://").map(|i| &id[i + 3..]).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_runtime_prefix() {
        assert_eq!(
            strip_runtime_prefix("containerd://abc123def456"),
            "abc123def456"
        );
        assert_eq!(strip_runtime_prefix("docker://xyz789"), "xyz789");
        assert_eq!(strip_runtime_prefix("cri-o://test123"), "test123");
        assert_eq!(strip_runtime_prefix("plain-id"), "plain-id");
    }

    #[test]
    fn test_index_pod_covers_all_status_lists() {
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {
                "uid": "uid-1",
                "name": "mypod",
                "namespace": "default"
            },
            "status": {
                "containerStatuses": [
                    {"name": "app", "containerId": "containerd://aaa", "image": "", "imageID": "", "ready": true, "restartCount": 0}
                ],
                "initContainerStatuses": [
                    {"name": "init", "containerId": "containerd://bbb", "image": "", "imageID": "", "ready": true, "restartCount": 0}
                ]
            }
        }))
        .unwrap();

        let mut out = HashMap::new();
        index_pod(&pod, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out["aaa"].name, "mypod");
        assert_eq!(out["aaa"].container_name, "app");
        assert_eq!(out["bbb"].container_name, "init");
        assert_eq!(out["bbb"].namespace, "default");
    }

    #[test]
    fn test_index_pod_without_status_is_skipped() {
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"uid": "uid-2", "name": "pending-pod"}
        }))
        .unwrap();
        let mut out = HashMap::new();
        index_pod(&pod, &mut out);
        assert!(out.is_empty());
    }
}
