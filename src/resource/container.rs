//! Container detection from cgroup paths, environment, and command line.
//!
//! Cgroup v2 can nest several runtime markers inside a single path: a
//! KinD node's containers live under an outer `docker-<id>.scope` and an
//! inner `cri-containerd-<id>.scope`. Every pattern match across every
//! supplied path is collected with its starting byte offset and the
//! deepest (greatest offset) match wins, so nested Kubernetes-in-Docker
//! workloads attribute to the inner container.

use once_cell::sync::Lazy;
use regex::Regex;

use super::ContainerRuntime;

/// A detected container identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMatch {
    pub id: String,
    pub runtime: ContainerRuntime,
}

static CGROUP_PATTERNS: Lazy<Vec<(ContainerRuntime, Regex)>> = Lazy::new(|| {
    vec![
        (
            ContainerRuntime::Docker,
            Regex::new(r"/docker[-/]([0-9a-f]{64})").expect("static pattern"),
        ),
        (
            ContainerRuntime::Containerd,
            Regex::new(r"/containerd[-/]([0-9a-f]{64})").expect("static pattern"),
        ),
        (
            ContainerRuntime::Containerd,
            Regex::new(r"[:/ ]cri-containerd[-:]([0-9a-f]{64})").expect("static pattern"),
        ),
        (
            ContainerRuntime::CriO,
            Regex::new(r"/crio-([0-9a-f]{64})").expect("static pattern"),
        ),
        (
            ContainerRuntime::Podman,
            Regex::new(r"libpod-([0-9a-f]{64})").expect("static pattern"),
        ),
        (
            ContainerRuntime::Podman,
            Regex::new(r"/libpod-payload-([0-9a-f]+)").expect("static pattern"),
        ),
        (
            ContainerRuntime::Kubepods,
            Regex::new(r"/kubepods/[^/]+/pod[0-9a-f-]+/([0-9a-f]{64})").expect("static pattern"),
        ),
    ]
});

/// Detect the owning container from a process's cgroup paths.
///
/// Returns `None` when no pattern matches any path.
pub fn detect(cgroup_paths: &[String]) -> Option<ContainerMatch> {
    let mut best: Option<(usize, ContainerMatch)> = None;

    for path in cgroup_paths {
        for (runtime, pattern) in CGROUP_PATTERNS.iter() {
            for captures in pattern.captures_iter(path) {
                let whole = captures.get(0).expect("match group 0");
                let id = captures.get(1).expect("id capture").as_str().to_string();
                let offset = whole.start();
                let deeper = best
                    .as_ref()
                    .map(|(best_offset, _)| offset > *best_offset)
                    .unwrap_or(true);
                if deeper {
                    best = Some((
                        offset,
                        ContainerMatch {
                            id,
                            runtime: *runtime,
                        },
                    ));
                }
            }
        }
    }

    best.map(|(_, m)| m)
}

/// Shim binaries whose positional argument 3 is the container name.
const SHIM_BASENAMES: [&str; 2] = ["docker-containerd-shim", "containerd-shim"];

/// Recover a container name from process metadata.
///
/// Precedence: `CONTAINER_NAME` env, `HOSTNAME` env, `--name` on the
/// command line, shim positional argument. First non-empty wins; the pod
/// informer may later overwrite the result. May return `None`.
pub fn detect_name(
    environ: &[(String, String)],
    cmdline: &[String],
    exe: &str,
) -> Option<String> {
    for key in ["CONTAINER_NAME", "HOSTNAME"] {
        if let Some((_, value)) = environ.iter().find(|(k, _)| k == key) {
            if !value.is_empty() {
                return Some(value.clone());
            }
        }
    }
    name_from_cmdline(cmdline, exe)
}

fn name_from_cmdline(cmdline: &[String], exe: &str) -> Option<String> {
    let mut args = cmdline.iter();
    while let Some(arg) = args.next() {
        if let Some(value) = arg.strip_prefix("--name=") {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        } else if arg == "--name" {
            if let Some(value) = args.next() {
                if !value.is_empty() {
                    return Some(value.clone());
                }
            }
        }
    }

    let basename = std::path::Path::new(exe)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if SHIM_BASENAMES.contains(&basename) {
        if let Some(name) = cmdline.get(3) {
            if !name.is_empty() {
                return Some(name.clone());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    const ID_A: &str = "fd9d0ea06257a9780827cbc7fd92e3812a54fca26d63e191b73610d5d48b9cbd";
    const ID_B: &str = "99f3a16ea25b7724cb56a4f0c0df1113ad9474fbf5545bead97fd5c7f61c13f4";

    #[test]
    fn test_docker_scope() {
        let m = detect(&paths(&[&format!("/system.slice/docker-{ID_A}.scope")])).unwrap();
        assert_eq!(m.runtime, ContainerRuntime::Docker);
        assert_eq!(m.id, ID_A);
    }

    #[test]
    fn test_crio_scope() {
        let m = detect(&paths(&[&format!(
            "/kubepods.slice/kubepods-besteffort.slice/crio-{ID_B}.scope"
        )]))
        .unwrap();
        assert_eq!(m.runtime, ContainerRuntime::CriO);
        assert_eq!(m.id, ID_B);
    }

    #[test]
    fn test_podman_libpod() {
        let m = detect(&paths(&[&format!(
            "/machine.slice/libpod-{ID_A}.scope/container"
        )]))
        .unwrap();
        assert_eq!(m.runtime, ContainerRuntime::Podman);
        assert_eq!(m.id, ID_A);
    }

    #[test]
    fn test_podman_payload() {
        let m = detect(&paths(&["/machine.slice/libpod-payload-abc123def456"])).unwrap();
        assert_eq!(m.runtime, ContainerRuntime::Podman);
        assert_eq!(m.id, "abc123def456");
    }

    #[test]
    fn test_kubepods_generic() {
        let m = detect(&paths(&[&format!(
            "/kubepods/besteffort/pod29b83755-78d3-4345-9a8f-d3017edb5da3/{ID_B}"
        )]))
        .unwrap();
        assert_eq!(m.runtime, ContainerRuntime::Kubepods);
        assert_eq!(m.id, ID_B);
    }

    #[test]
    fn test_kind_nested_scope_prefers_inner_match() {
        // Kubernetes-in-Docker: the node is a docker container, the
        // workload an inner cri-containerd scope.
        let path = format!(
            "/system.slice/docker-{ID_A}.scope/kubelet.slice/kubelet-kubepods.slice/kubelet-kubepods-besteffort.slice/kubelet-kubepods-besteffort-pod1234.slice/cri-containerd-{ID_B}.scope"
        );
        let m = detect(&paths(&[&path])).unwrap();
        assert_eq!(m.runtime, ContainerRuntime::Containerd);
        assert_eq!(m.id, ID_B);
    }

    #[test]
    fn test_deepest_match_across_multiple_paths() {
        let outer = format!("/system.slice/docker-{ID_A}.scope");
        let inner = format!("/a/much/longer/prefix/before/the/match/crio-{ID_B}.scope");
        let m = detect(&paths(&[&outer, &inner])).unwrap();
        assert_eq!(m.runtime, ContainerRuntime::CriO);
        assert_eq!(m.id, ID_B);
    }

    #[test]
    fn test_plain_service_no_match() {
        assert!(detect(&paths(&["/system.slice/sshd.service"])).is_none());
        assert!(detect(&[]).is_none());
    }

    #[test]
    fn test_short_hex_id_rejected() {
        assert!(detect(&paths(&["/system.slice/docker-abc123.scope"])).is_none());
    }

    #[test]
    fn test_name_env_precedence() {
        let environ = vec![
            ("HOSTNAME".to_string(), "host-fallback".to_string()),
            ("CONTAINER_NAME".to_string(), "explicit".to_string()),
        ];
        assert_eq!(
            detect_name(&environ, &[], "/usr/bin/app"),
            Some("explicit".to_string())
        );

        let environ = vec![("HOSTNAME".to_string(), "host-fallback".to_string())];
        assert_eq!(
            detect_name(&environ, &[], "/usr/bin/app"),
            Some("host-fallback".to_string())
        );
    }

    #[test]
    fn test_name_from_cmdline_flag() {
        let cmdline: Vec<String> = ["/usr/bin/run", "--name", "web"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(detect_name(&[], &cmdline, "/usr/bin/run"), Some("web".to_string()));

        let cmdline: Vec<String> = ["/usr/bin/run", "--name=api"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(detect_name(&[], &cmdline, "/usr/bin/run"), Some("api".to_string()));
    }

    #[test]
    fn test_name_from_shim_positional() {
        let cmdline: Vec<String> = ["containerd-shim", "-namespace", "moby", "shimmed-name"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            detect_name(&[], &cmdline, "/usr/bin/containerd-shim"),
            Some("shimmed-name".to_string())
        );
    }

    #[test]
    fn test_name_may_be_absent() {
        assert_eq!(detect_name(&[], &[], "/usr/bin/app"), None);
    }
}
