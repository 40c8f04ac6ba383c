//! Process filesystem reader.
//!
//! Enumerates processes and reads the per-process files the informer
//! classifies from (stat, comm, exe, cgroup, environ, cmdline), plus the
//! host-wide CPU line used for the node usage ratio. All paths are rooted
//! at a configurable directory so tests can fabricate a tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Errors from individual procfs reads.
///
/// `NotFound` is the expected race of a process exiting mid-scan and is
/// skipped silently by callers; everything else is collected into the
/// enclosing refresh error.
#[derive(Debug, thiserror::Error)]
pub enum ProcError {
    #[error("process {0} not found")]
    NotFound(i32),

    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

impl ProcError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProcError::NotFound(_))
    }

    fn from_io(pid: i32, path: &Path, source: io::Error) -> Self {
        // ESRCH surfaces as NotFound on some kernels when the task is
        // mid-exit; treat it the same as a vanished directory.
        if source.kind() == io::ErrorKind::NotFound || source.raw_os_error() == Some(libc_esrch())
        {
            ProcError::NotFound(pid)
        } else {
            ProcError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

const fn libc_esrch() -> i32 {
    3
}

/// Aggregate CPU times from the host `stat` line, in kernel ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CpuTimes {
    user: u64,
    nice: u64,
    system: u64,
    idle: u64,
    iowait: u64,
    irq: u64,
    softirq: u64,
    steal: u64,
}

impl CpuTimes {
    fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    fn delta(&self, prev: &CpuTimes) -> CpuTimes {
        CpuTimes {
            user: self.user.saturating_sub(prev.user),
            nice: self.nice.saturating_sub(prev.nice),
            system: self.system.saturating_sub(prev.system),
            idle: self.idle.saturating_sub(prev.idle),
            iowait: self.iowait.saturating_sub(prev.iowait),
            irq: self.irq.saturating_sub(prev.irq),
            softirq: self.softirq.saturating_sub(prev.softirq),
            steal: self.steal.saturating_sub(prev.steal),
        }
    }
}

/// Reader over a procfs-style tree.
#[derive(Debug)]
pub struct ProcFs {
    root: PathBuf,
    ticks_per_second: f64,
    prev_cpu: Mutex<Option<CpuTimes>>,
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>, ticks_per_second: u32) -> Self {
        Self {
            root: root.into(),
            ticks_per_second: f64::from(ticks_per_second),
            prev_cpu: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Enumerate currently visible processes.
    ///
    /// A failure here aborts the enclosing refresh; per-process failures
    /// are reported lazily by the returned handles instead.
    pub fn enumerate(&self) -> Result<Vec<ProcHandle>, ProcError> {
        let entries = fs::read_dir(&self.root).map_err(|e| ProcError::Io {
            path: self.root.clone(),
            source: e,
        })?;

        let mut handles = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|n| n.parse::<i32>().ok()) else {
                continue;
            };
            handles.push(ProcHandle {
                pid,
                dir: entry.path(),
                ticks_per_second: self.ticks_per_second,
            });
        }
        handles.sort_by_key(|h| h.pid);
        Ok(handles)
    }

    /// Host CPU utilization ratio in `[0, 1]` since the previous call.
    ///
    /// The first call caches the reading and returns 0. Subsequent calls
    /// compute `active / total` over the tick deltas, where active
    /// excludes idle and iowait. The cached reading is always updated.
    pub fn cpu_usage_ratio(&self) -> Result<f64, ProcError> {
        let path = self.root.join("stat");
        let raw = fs::read_to_string(&path).map_err(|e| ProcError::Io {
            path: path.clone(),
            source: e,
        })?;
        let current = parse_aggregate_cpu_line(&raw, &path)?;

        let mut prev = self.prev_cpu.lock().expect("cpu stat lock poisoned");
        let ratio = match prev.as_ref() {
            None => 0.0,
            Some(p) => {
                let d = current.delta(p);
                let total = d.total();
                if total == 0 {
                    0.0
                } else {
                    let active = total - (d.idle + d.iowait);
                    active as f64 / total as f64
                }
            }
        };
        *prev = Some(current);
        Ok(ratio)
    }
}

/// Parse the first `cpu ` line of the host stat file.
fn parse_aggregate_cpu_line(raw: &str, path: &Path) -> Result<CpuTimes, ProcError> {
    let line = raw
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| ProcError::Parse {
            path: path.to_path_buf(),
            reason: "missing aggregate cpu line".to_string(),
        })?;

    let mut fields = line.split_whitespace().skip(1).map(|f| f.parse::<u64>());
    let mut next = |name: &str| -> Result<u64, ProcError> {
        fields
            .next()
            .and_then(Result::ok)
            .ok_or_else(|| ProcError::Parse {
                path: path.to_path_buf(),
                reason: format!("missing {name} field"),
            })
    };

    Ok(CpuTimes {
        user: next("user")?,
        nice: next("nice")?,
        system: next("system")?,
        idle: next("idle")?,
        iowait: next("iowait")?,
        irq: next("irq")?,
        softirq: next("softirq")?,
        steal: next("steal")?,
    })
}

/// Lazy accessor for one process directory.
///
/// Nothing is read until a method is called; every method re-reads so a
/// handle can outlive an exiting process and report `NotFound` cleanly.
#[derive(Debug, Clone)]
pub struct ProcHandle {
    pid: i32,
    dir: PathBuf,
    ticks_per_second: f64,
}

impl ProcHandle {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    fn read(&self, file: &str) -> Result<String, ProcError> {
        let path = self.dir.join(file);
        fs::read_to_string(&path).map_err(|e| ProcError::from_io(self.pid, &path, e))
    }

    /// Command name and cumulative CPU time, from one `stat` read.
    ///
    /// The comm field is parenthesized and may itself contain spaces or
    /// parentheses; fields are parsed after the last `)`.
    pub fn stat(&self) -> Result<ProcStat, ProcError> {
        let path = self.dir.join("stat");
        let raw = self.read("stat")?;

        let open = raw.find('(').ok_or_else(|| ProcError::Parse {
            path: path.clone(),
            reason: "missing comm".to_string(),
        })?;
        let close = raw.rfind(')').ok_or_else(|| ProcError::Parse {
            path: path.clone(),
            reason: "unterminated comm".to_string(),
        })?;
        let comm = raw[open + 1..close].to_string();

        // After ") ": state is field 3, utime field 14, stime field 15.
        let rest: Vec<&str> = raw[close + 1..].split_whitespace().collect();
        let utime: u64 = rest
            .get(11)
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| ProcError::Parse {
                path: path.clone(),
                reason: "missing utime".to_string(),
            })?;
        let stime: u64 = rest
            .get(12)
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| ProcError::Parse {
                path: path.clone(),
                reason: "missing stime".to_string(),
            })?;

        Ok(ProcStat {
            comm,
            cpu_time_seconds: (utime + stime) as f64 / self.ticks_per_second,
        })
    }

    pub fn comm(&self) -> Result<String, ProcError> {
        Ok(self.read("comm")?.trim_end().to_string())
    }

    /// Resolved executable path; empty when the symlink is unreadable
    /// (kernel threads, permission).
    pub fn exe(&self) -> String {
        fs::read_link(self.dir.join("exe"))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Cgroup paths for this process, one per hierarchy line.
    pub fn cgroups(&self) -> Result<Vec<String>, ProcError> {
        let raw = self.read("cgroup")?;
        Ok(raw
            .lines()
            .filter_map(|line| line.splitn(3, ':').nth(2))
            .map(str::to_string)
            .collect())
    }

    /// Environment as key/value pairs (NUL-separated `K=V` entries).
    pub fn environ(&self) -> Result<Vec<(String, String)>, ProcError> {
        let raw = self.read("environ")?;
        Ok(raw
            .split('\0')
            .filter(|s| !s.is_empty())
            .filter_map(|s| {
                s.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect())
    }

    /// NUL-separated argv.
    pub fn cmdline(&self) -> Result<Vec<String>, ProcError> {
        let raw = self.read("cmdline")?;
        Ok(raw
            .split('\0')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// One parsed `stat` read.
#[derive(Debug, Clone)]
pub struct ProcStat {
    pub comm: String,
    pub cpu_time_seconds: f64,
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::fs;
    use std::path::Path;

    /// Fabricate a process directory under a fake procfs root.
    pub fn write_process(
        root: &Path,
        pid: i32,
        comm: &str,
        cpu_ticks: u64,
        cgroup: &str,
        environ: &[(&str, &str)],
        cmdline: &[&str],
    ) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("stat"),
            format!(
                "{pid} ({comm}) S 1 {pid} {pid} 0 -1 4194304 100 0 0 0 {utime} {stime} 0 0 20 0 1 0 100 1000000 100 18446744073709551615",
                utime = cpu_ticks / 2,
                stime = cpu_ticks - cpu_ticks / 2,
            ),
        )
        .unwrap();
        fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
        fs::write(dir.join("cgroup"), format!("0::{cgroup}\n")).unwrap();
        let env: String = environ
            .iter()
            .map(|(k, v)| format!("{k}={v}\0"))
            .collect();
        fs::write(dir.join("environ"), env).unwrap();
        let args: String = cmdline.iter().map(|a| format!("{a}\0")).collect();
        fs::write(dir.join("cmdline"), args).unwrap();
    }

    /// Write the host-wide stat file with the given aggregate cpu fields.
    pub fn write_host_stat(root: &Path, fields: [u64; 8]) {
        let line = format!(
            "cpu  {} {} {} {} {} {} {} {} 0 0\ncpu0 0 0 0 0 0 0 0 0 0 0\n",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            fields[4],
            fields[5],
            fields[6],
            fields[7]
        );
        fs::write(root.join("stat"), line).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{write_host_stat, write_process};
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_enumerate_skips_non_pid_entries() {
        let tmp = TempDir::new().unwrap();
        write_process(tmp.path(), 42, "sh", 100, "/system.slice/sh.service", &[], &["sh"]);
        std::fs::create_dir(tmp.path().join("sys")).unwrap();
        std::fs::write(tmp.path().join("uptime"), "1 1\n").unwrap();

        let procfs = ProcFs::new(tmp.path(), 100);
        let handles = procfs.enumerate().unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].pid(), 42);
    }

    #[test]
    fn test_stat_parses_comm_and_cpu_time() {
        let tmp = TempDir::new().unwrap();
        write_process(tmp.path(), 1001, "sh", 1050, "/system.slice/sh.service", &[], &["sh"]);

        let procfs = ProcFs::new(tmp.path(), 100);
        let handle = &procfs.enumerate().unwrap()[0];
        let stat = handle.stat().unwrap();
        assert_eq!(stat.comm, "sh");
        assert!((stat.cpu_time_seconds - 10.5).abs() < 1e-9);
    }

    #[test]
    fn test_stat_handles_spaces_and_parens_in_comm() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("7");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("stat"),
            "7 (tmux: server (1)) S 1 7 7 0 -1 0 0 0 0 0 200 100 0 0 20 0 1 0 1 1 1 1",
        )
        .unwrap();

        let procfs = ProcFs::new(tmp.path(), 100);
        let handle = &procfs.enumerate().unwrap()[0];
        let stat = handle.stat().unwrap();
        assert_eq!(stat.comm, "tmux: server (1)");
        assert!((stat.cpu_time_seconds - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_process_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let handle = ProcHandle {
            pid: 9999,
            dir: tmp.path().join("9999"),
            ticks_per_second: 100.0,
        };
        let err = handle.stat().unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_environ_and_cmdline_split_on_nul() {
        let tmp = TempDir::new().unwrap();
        write_process(
            tmp.path(),
            5,
            "app",
            0,
            "/",
            &[("CONTAINER_NAME", "web"), ("PATH", "/bin")],
            &["/bin/app", "--name", "web"],
        );

        let procfs = ProcFs::new(tmp.path(), 100);
        let handle = &procfs.enumerate().unwrap()[0];
        let env = handle.environ().unwrap();
        assert!(env.contains(&("CONTAINER_NAME".to_string(), "web".to_string())));
        assert_eq!(
            handle.cmdline().unwrap(),
            vec!["/bin/app", "--name", "web"]
        );
    }

    #[test]
    fn test_cgroups_take_path_component() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("8");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("cgroup"),
            "12:pids:/system.slice/app.service\n0::/system.slice/app.service\n",
        )
        .unwrap();

        let procfs = ProcFs::new(tmp.path(), 100);
        let handle = &procfs.enumerate().unwrap()[0];
        assert_eq!(
            handle.cgroups().unwrap(),
            vec!["/system.slice/app.service", "/system.slice/app.service"]
        );
    }

    #[test]
    fn test_cpu_usage_ratio_first_call_zero() {
        let tmp = TempDir::new().unwrap();
        write_host_stat(tmp.path(), [100, 0, 50, 800, 50, 0, 0, 0]);

        let procfs = ProcFs::new(tmp.path(), 100);
        assert_eq!(procfs.cpu_usage_ratio().unwrap(), 0.0);
    }

    #[test]
    fn test_cpu_usage_ratio_delta() {
        let tmp = TempDir::new().unwrap();
        write_host_stat(tmp.path(), [100, 0, 50, 800, 50, 0, 0, 0]);

        let procfs = ProcFs::new(tmp.path(), 100);
        procfs.cpu_usage_ratio().unwrap();

        // +60 active (40 user, 20 system), +130 idle, +10 iowait: 60/200.
        write_host_stat(tmp.path(), [140, 0, 70, 930, 60, 0, 0, 0]);
        let ratio = procfs.cpu_usage_ratio().unwrap();
        assert!((ratio - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_cpu_usage_ratio_zero_total() {
        let tmp = TempDir::new().unwrap();
        write_host_stat(tmp.path(), [100, 0, 50, 800, 50, 0, 0, 0]);

        let procfs = ProcFs::new(tmp.path(), 100);
        procfs.cpu_usage_ratio().unwrap();
        let ratio = procfs.cpu_usage_ratio().unwrap();
        assert_eq!(ratio, 0.0);
    }
}
