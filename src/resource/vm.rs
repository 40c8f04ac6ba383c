//! Virtual-machine detection from hypervisor command lines.
//!
//! The recognized set is deliberately narrow: `qemu-system-<arch>` and
//! `qemu-kvm` binaries only. Broader matching (libvirt wrappers, guest
//! agents) misclassifies host-side helpers such as
//! `qemu-ga`/`qemu-*-guest-agent` as VMs.

use once_cell::sync::Lazy;
use regex::Regex;

use super::Hypervisor;

/// A detected virtual machine identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmMatch {
    /// Stable ID: `-uuid` value, else the guest name, else a 16-hex
    /// digest of the command line.
    pub id: String,
    pub name: String,
    pub hypervisor: Hypervisor,
}

static QEMU_SYSTEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^qemu-system-[a-z0-9_]+$").expect("static pattern"));

/// Identify a hypervisor process and derive its VM identity.
pub fn detect(cmdline: &[String]) -> Option<VmMatch> {
    let argv0 = cmdline.first()?;
    let basename = std::path::Path::new(argv0)
        .file_name()
        .and_then(|n| n.to_str())?;

    if basename != "qemu-kvm" && !QEMU_SYSTEM.is_match(basename) {
        return None;
    }
    let hypervisor = Hypervisor::Kvm;

    let uuid = flag_value(cmdline, "-uuid");
    let guest_name = flag_value(cmdline, "-name").and_then(parse_guest_name);

    let id = match (&uuid, &guest_name) {
        (Some(uuid), _) => uuid.clone(),
        (None, Some(name)) => name.clone(),
        (None, None) => cmdline_digest(cmdline),
    };

    let name = guest_name
        .unwrap_or_else(|| format!("{hypervisor}-{}", &id[..id.len().min(8)]));

    Some(VmMatch {
        id,
        name,
        hypervisor,
    })
}

/// Value of `-flag <value>` or `-flag=<value>`.
fn flag_value(cmdline: &[String], flag: &str) -> Option<String> {
    let prefixed = format!("{flag}=");
    let mut args = cmdline.iter();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next().filter(|v| !v.is_empty()).cloned();
        }
        if let Some(value) = arg.strip_prefix(&prefixed) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// The `-name` value is either a bare name or a comma-separated option
/// list; `guest=<name>` wins, otherwise the first option-free segment.
fn parse_guest_name(value: String) -> Option<String> {
    if !value.contains(',') {
        return Some(value).filter(|v| !v.is_empty());
    }
    let segments: Vec<&str> = value.split(',').collect();
    if let Some(guest) = segments.iter().find_map(|s| s.strip_prefix("guest=")) {
        return Some(guest.to_string()).filter(|v| !v.is_empty());
    }
    segments
        .iter()
        .find(|s| !s.contains('='))
        .map(|s| s.to_string())
        .filter(|v| !v.is_empty())
}

/// Lowercase hex of the first 8 bytes of the space-joined command line.
fn cmdline_digest(cmdline: &[String]) -> String {
    let joined = cmdline.join(" ");
    joined
        .as_bytes()
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}
