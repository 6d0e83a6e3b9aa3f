//! System status snapshot for node status reports.

use sysinfo::{Disks, System};

use crate::api::NodeStatus;

/// Collect CPU, memory and disk usage percentages plus system uptime.
pub fn collect() -> NodeStatus {
    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu = sys.global_cpu_info().cpu_usage() as f64;

    let total_mem = sys.total_memory();
    let mem = if total_mem > 0 {
        sys.used_memory() as f64 / total_mem as f64 * 100.0
    } else {
        0.0
    };

    let disks = Disks::new_with_refreshed_list();
    let (total, avail) = disks.iter().fold((0u64, 0u64), |(t, a), d| {
        (t + d.total_space(), a + d.available_space())
    });
    let disk = if total > 0 {
        (total - avail) as f64 / total as f64 * 100.0
    } else {
        0.0
    };

    NodeStatus {
        cpu,
        mem,
        disk,
        uptime: System::uptime(),
    }
}
