//! Host fact collection.
//!
//! Reads straight from procfs/sysfs; every probe degrades to a zero or
//! `false` rather than failing the heartbeat — a fleet dashboard with a
//! missing number beats an agent that cannot report at all.

use std::path::Path;

use nkudo_types::wire::HostFacts;

use crate::config::AgentConfig;

/// Collect the current host facts.
#[must_use]
pub fn collect(config: &AgentConfig) -> HostFacts {
    HostFacts {
        hostname: read_trimmed("/proc/sys/kernel/hostname").unwrap_or_else(|| "unknown".to_owned()),
        cpu_cores_total: std::thread::available_parallelism()
            .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
            .unwrap_or(0),
        memory_bytes_total: memory_total_bytes().unwrap_or(0),
        storage_bytes_total: storage_total_bytes().unwrap_or(0),
        kvm_available: Path::new("/dev/kvm").exists(),
        cloud_hypervisor_available: config
            .hypervisor_bin
            .as_ref()
            .is_some_and(|bin| bin.exists()),
        agent_version: env!("CARGO_PKG_VERSION").to_owned(),
        os: std::env::consts::OS.to_owned(),
        arch: std::env::consts::ARCH.to_owned(),
        kernel_version: read_trimmed("/proc/sys/kernel/osrelease")
            .unwrap_or_else(|| "unknown".to_owned()),
    }
}

fn read_trimmed(path: &str) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

/// `MemTotal` from /proc/meminfo, in bytes.
fn memory_total_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_total(&meminfo)
}

fn parse_meminfo_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib.saturating_mul(1024))
}

/// Sum of real block devices under /sys/block (loop/ram/zram excluded),
/// sizes reported in 512-byte sectors.
fn storage_total_bytes() -> Option<u64> {
    let entries = std::fs::read_dir("/sys/block").ok()?;
    let mut total: u64 = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram") {
            continue;
        }
        if let Some(sectors) = read_trimmed(&format!("/sys/block/{name}/size"))
            .and_then(|s| s.parse::<u64>().ok())
        {
            total = total.saturating_add(sectors.saturating_mul(512));
        }
    }
    Some(total)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_parses_kib_to_bytes() {
        let meminfo = "MemTotal:       16309528 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_meminfo_total(meminfo), Some(16_309_528 * 1024));
    }

    #[test]
    fn meminfo_without_total_is_none() {
        assert_eq!(parse_meminfo_total("MemFree: 12 kB\n"), None);
    }

    #[test]
    fn facts_never_panic() {
        let config = AgentConfig {
            control_plane_url: "https://cp".to_owned(),
            state_dir: "/tmp".into(),
            pki_dir: "/tmp".into(),
            runtime_dir: "/tmp".into(),
            hypervisor_bin: None,
            heartbeat_interval_secs: None,
            action_timeout_secs: 120,
            insecure_tls: false,
        };
        let facts = collect(&config);
        assert!(!facts.hostname.is_empty());
        assert!(!facts.arch.is_empty());
        assert!(!facts.cloud_hypervisor_available);
    }
}
