//! Host metrics sampling.

use nebula_core::protocol::HostMetrics;

/// Supplier of host-metrics samples.
///
/// A trait seam so heartbeat and handler code can be tested without
/// touching the real system tables.
pub trait MetricsSampler: Send + Sync {
    fn sample(&self) -> HostMetrics;
}

/// Production sampler backed by `sysinfo`.
pub struct SysinfoSampler;

impl MetricsSampler for SysinfoSampler {
    fn sample(&self) -> HostMetrics {
        use sysinfo::{Disks, System};

        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let memory_usage = if sys.total_memory() > 0 {
            sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0
        } else {
            0.0
        };

        let disks = Disks::new_with_refreshed_list();
        let (total, avail) = disks
            .iter()
            .fold((0u64, 0u64), |(t, a), d| {
                (t + d.total_space(), a + d.available_space())
            });
        let disk_usage = if total > 0 {
            (total - avail) as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        HostMetrics {
            cpu_usage: sys.global_cpu_usage() as f64,
            memory_usage,
            disk_usage,
            hostname: System::host_name().unwrap_or_else(|| "unknown".into()),
            os: System::long_os_version()
                .or_else(System::name)
                .unwrap_or_else(|| std::env::consts::OS.to_string()),
            uptime: System::uptime(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysinfo_sampler_produces_plausible_values() {
        let metrics = SysinfoSampler.sample();
        assert!((0.0..=100.0).contains(&metrics.memory_usage));
        assert!((0.0..=100.0).contains(&metrics.disk_usage));
        assert!(!metrics.hostname.is_empty());
    }
}
