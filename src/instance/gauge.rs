//! Host memory gauge.
//!
//! Free memory comes from `MemAvailable` in `/proc/meminfo`; per-process
//! resident memory from `VmRSS` in `/proc/<pid>/status`.

use std::fs;
use std::io;
use std::path::PathBuf;

use super::Registry;
use super::liveness::ProcessTable;

pub trait MemoryGauge: Send + Sync {
    /// Memory currently available to new processes, in MB.
    fn free_memory_mb(&self) -> io::Result<u64>;

    /// Resident memory of `pid` in MB, or `None` if it cannot be read.
    fn resident_memory_mb(&self, pid: i32) -> Option<u64>;
}

/// [`MemoryGauge`] reading a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcMemory {
    proc_root: PathBuf,
}

impl Default for ProcMemory {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcMemory {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl MemoryGauge for ProcMemory {
    fn free_memory_mb(&self) -> io::Result<u64> {
        let path = self.proc_root.join("meminfo");
        let text = fs::read_to_string(&path)?;
        parse_available_kib(&text)
            .map(|kib| kib / 1024)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("no usable memory figures in {}", path.display()),
                )
            })
    }

    fn resident_memory_mb(&self, pid: i32) -> Option<u64> {
        let text = fs::read_to_string(self.proc_root.join(pid.to_string()).join("status")).ok()?;
        text.lines()
            .find_map(|line| line.strip_prefix("VmRSS:"))
            .and_then(parse_kib)
            .map(|kib| kib / 1024)
    }
}

/// Sum of resident memory over every tracked record whose pid is alive.
/// Dead or unreadable pids contribute zero.
pub fn total_tracked_memory_mb(
    registry: &Registry,
    processes: &dyn ProcessTable,
    gauge: &dyn MemoryGauge,
) -> u64 {
    registry
        .iter()
        .filter_map(|(_, record)| record.live_pid())
        .filter(|pid| processes.probe(*pid).is_alive())
        .filter_map(|pid| gauge.resident_memory_mb(pid))
        .sum()
}

/// `MemAvailable`, falling back to `MemFree + Buffers + Cached` on kernels
/// that predate it.
fn parse_available_kib(meminfo: &str) -> Option<u64> {
    let field = |name: &str| {
        meminfo
            .lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
            .and_then(parse_kib)
    };

    if let Some(available) = field("MemAvailable") {
        return Some(available);
    }
    let free = field("MemFree")?;
    Some(free + field("Buffers").unwrap_or(0) + field("Cached").unwrap_or(0))
}

fn parse_kib(value: &str) -> Option<u64> {
    value.split_whitespace().next()?.parse().ok()
}
