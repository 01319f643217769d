//! System resource monitoring
//!
//! Reports process and machine memory around inference. Only Linux exposes
//! these numbers here; other platforms report nothing.

use std::fmt;

/// Memory usage snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// Resident memory of this process
    pub ram_used_mb: u64,
    /// Physical memory of the machine
    pub ram_total_mb: u64,
}

impl fmt::Display for ResourceUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} MB used of {} MB", self.ram_used_mb, self.ram_total_mb)
    }
}

/// Get current process memory usage
///
/// Returns `None` where the platform offers no reading.
pub fn get_resource_usage() -> Option<ResourceUsage> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        Some(ResourceUsage {
            ram_used_mb: parse_kb_field(&status, "VmRSS")? / 1024,
            ram_total_mb: parse_kb_field(&meminfo, "MemTotal")? / 1024,
        })
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Reads a `Key:   1234 kB` line from a procfs file
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_kb_field(text: &str, key: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let value = line.strip_prefix(key)?.strip_prefix(':')?;
        value.split_whitespace().next()?.parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "Name:\tlocalchat\nVmPeak:\t  900000 kB\nVmRSS:\t  524288 kB\nThreads:\t4\n";

    #[test]
    fn test_parse_kb_field() {
        assert_eq!(parse_kb_field(STATUS, "VmRSS"), Some(524288));
        assert_eq!(parse_kb_field(STATUS, "VmPeak"), Some(900000));
    }

    #[test]
    fn test_parse_kb_field_missing_or_prefix_only() {
        assert_eq!(parse_kb_field(STATUS, "VmSwap"), None);
        // "Vm" is a prefix of several keys but not a key itself
        assert_eq!(parse_kb_field(STATUS, "Vm"), None);
    }

    #[test]
    fn test_display() {
        let usage = ResourceUsage {
            ram_used_mb: 512,
            ram_total_mb: 16384,
        };
        assert_eq!(usage.to_string(), "512 MB used of 16384 MB");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_reads_own_memory() {
        // procfs may be absent in a sandbox
        if let Some(usage) = get_resource_usage() {
            assert!(usage.ram_used_mb <= usage.ram_total_mb);
            assert!(usage.ram_total_mb > 0);
        }
    }
}
