//! Best-effort resource checks run at the top of every cycle.
//!
//! None of these checks can fail a cycle. Their findings are logged, and the
//! CPU clock check produces an environment override for SteamCMD, which
//! refuses to run when it cannot detect a clock speed.

use std::fs;
use std::path::{Path, PathBuf};

use nix::sys::statvfs::statvfs;
use nix::sys::utsname::uname;
use tracing::{debug, info, warn};

/// Environment variable SteamCMD reads when clock detection fails.
pub const CPU_MHZ_ENV: &str = "CPU_MHZ";

/// Clock speed reported to SteamCMD when none can be detected.
pub const CPU_MHZ_FALLBACK: &str = "2000";

/// Recommended minimum memory in KiB.
pub const MIN_MEMORY_KIB: u64 = 4_000_000;

/// Findings of one preflight run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreflightReport {
    /// Detected clock speed in MHz.
    pub cpu_mhz: Option<f64>,
    /// Override to pass to SteamCMD, set only when no clock speed was found.
    pub cpu_override: Option<(String, String)>,
    /// Total memory in KiB.
    pub mem_total_kib: Option<u64>,
    /// How far total memory is below [`MIN_MEMORY_KIB`].
    pub memory_shortfall_kib: Option<u64>,
}

pub struct Preflight {
    cpuinfo_path: PathBuf,
    meminfo_path: PathBuf,
    storage_path: PathBuf,
}

impl Preflight {
    /// Preflight against `/proc`, reporting storage for `storage_path`.
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            cpuinfo_path: PathBuf::from("/proc/cpuinfo"),
            meminfo_path: PathBuf::from("/proc/meminfo"),
            storage_path: storage_path.into(),
        }
    }

    /// Preflight against alternate info files.
    pub fn with_sources(
        cpuinfo_path: impl Into<PathBuf>,
        meminfo_path: impl Into<PathBuf>,
        storage_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cpuinfo_path: cpuinfo_path.into(),
            meminfo_path: meminfo_path.into(),
            storage_path: storage_path.into(),
        }
    }

    pub fn run(&self) -> PreflightReport {
        let mut report = PreflightReport::default();
        self.check_cpu(&mut report);
        self.check_memory(&mut report);
        self.check_storage();
        report
    }

    fn check_cpu(&self, report: &mut PreflightReport) {
        let mhz = fs::read_to_string(&self.cpuinfo_path)
            .ok()
            .and_then(|content| parse_cpu_mhz(&content));

        match mhz {
            Some(mhz) if mhz > 0.0 => {
                debug!(cpu_mhz = mhz, "cpu clock detected");
                report.cpu_mhz = Some(mhz);
            }
            _ => {
                warn!(
                    fallback_mhz = CPU_MHZ_FALLBACK,
                    "could not detect cpu clock speed, passing fallback to steamcmd"
                );
                report.cpu_override = Some((CPU_MHZ_ENV.to_string(), CPU_MHZ_FALLBACK.to_string()));
            }
        }
    }

    fn check_memory(&self, report: &mut PreflightReport) {
        let Some(total) = fs::read_to_string(&self.meminfo_path)
            .ok()
            .and_then(|content| parse_mem_total_kib(&content))
        else {
            debug!("total memory unknown");
            return;
        };

        report.mem_total_kib = Some(total);
        if total < MIN_MEMORY_KIB {
            let shortfall = MIN_MEMORY_KIB - total;
            report.memory_shortfall_kib = Some(shortfall);
            warn!(
                total = %format_kib(total),
                recommended = %format_kib(MIN_MEMORY_KIB),
                shortfall = %format_kib(shortfall),
                "server has less memory than recommended, expect crashes during world load"
            );
        } else {
            debug!(total = %format_kib(total), "memory check passed");
        }
    }

    fn check_storage(&self) {
        match uname() {
            Ok(uts) => info!(
                kernel = %uts.sysname().to_string_lossy(),
                release = %uts.release().to_string_lossy(),
                machine = %uts.machine().to_string_lossy(),
                "kernel"
            ),
            Err(e) => debug!(error = %e, "uname failed"),
        }

        let Some(path) = existing_ancestor(&self.storage_path) else {
            return;
        };
        match statvfs(path) {
            Ok(stat) => {
                let block = stat.fragment_size() as u64;
                let total = stat.blocks() as u64 * block / 1024;
                let free = stat.blocks_available() as u64 * block / 1024;
                info!(
                    path = %path.display(),
                    total = %format_kib(total),
                    free = %format_kib(free),
                    "storage"
                );
            }
            Err(e) => debug!(path = %path.display(), error = %e, "statvfs failed"),
        }
    }
}

/// First `cpu MHz` value in `/proc/cpuinfo` content.
pub fn parse_cpu_mhz(content: &str) -> Option<f64> {
    content
        .lines()
        .filter(|line| line.starts_with("cpu MHz"))
        .find_map(|line| line.split(':').nth(1)?.trim().parse().ok())
}

/// `MemTotal` in KiB from `/proc/meminfo` content.
pub fn parse_mem_total_kib(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => parts.next()?.parse().ok(),
            _ => None,
        }
    })
}

/// Format KiB as a human-readable size.
pub fn format_kib(kib: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    let mut value = kib as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", kib, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn existing_ancestor(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| p.exists())
}
