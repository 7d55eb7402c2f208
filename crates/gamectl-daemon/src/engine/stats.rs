//! CPU and memory usage from cumulative engine counters.

use std::collections::HashMap;
use std::sync::Mutex;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One reading of the cumulative CPU counters for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSample {
    /// Total CPU time consumed by the container (ns).
    pub container_total: u64,
    /// Total CPU time of the host (ns).
    pub system_total: u64,
    pub online_cpus: u32,
}

/// `(cpu_delta / system_delta) * online_cpus * 100` between two samples.
///
/// Without a previous sample there is no delta, so the result is 0. Counter
/// resets (container restarted) also yield 0.
#[allow(clippy::cast_precision_loss)]
pub fn cpu_percent(previous: Option<&CpuSample>, current: &CpuSample) -> f64 {
    let Some(previous) = previous else {
        return 0.0;
    };
    let Some(cpu_delta) = current.container_total.checked_sub(previous.container_total) else {
        return 0.0;
    };
    let Some(system_delta) = current.system_total.checked_sub(previous.system_total) else {
        return 0.0;
    };
    if system_delta == 0 {
        return 0.0;
    }
    (cpu_delta as f64 / system_delta as f64) * f64::from(current.online_cpus.max(1)) * 100.0
}

/// Resident memory in megabytes.
#[allow(clippy::cast_precision_loss)]
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

/// Remembers the last sample per container so successive reads yield a
/// CPU percentage.
#[derive(Default)]
pub struct CpuSampler {
    last: Mutex<HashMap<String, CpuSample>>,
}

impl CpuSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `sample` for `key` and return the percentage since the
    /// previous one.
    pub fn observe(&self, key: &str, sample: CpuSample) -> f64 {
        let mut last = self
            .last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let percent = cpu_percent(last.get(key), &sample);
        last.insert(key.to_string(), sample);
        percent
    }

    /// Drop the stored sample, e.g. when the container is removed.
    pub fn forget(&self, key: &str) {
        self.last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(container_total: u64, system_total: u64, online_cpus: u32) -> CpuSample {
        CpuSample {
            container_total,
            system_total,
            online_cpus,
        }
    }

    #[test]
    fn first_reading_is_zero() {
        assert!(cpu_percent(None, &sample(500, 1_000, 4)).abs() < f64::EPSILON);
    }

    #[test]
    fn percent_scales_with_cores() {
        let prev = sample(1_000, 10_000, 4);
        let cur = sample(2_000, 20_000, 4);
        // 1000 / 10000 * 4 * 100
        assert!((cpu_percent(Some(&prev), &cur) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn counter_reset_and_idle_system_yield_zero() {
        let prev = sample(5_000, 10_000, 2);
        assert!(cpu_percent(Some(&prev), &sample(100, 20_000, 2)).abs() < f64::EPSILON);
        assert!(cpu_percent(Some(&prev), &sample(6_000, 10_000, 2)).abs() < f64::EPSILON);
    }

    #[test]
    fn sampler_tracks_each_container_separately() {
        let sampler = CpuSampler::new();
        assert!(sampler.observe("a", sample(0, 0, 1)).abs() < f64::EPSILON);
        assert!(sampler.observe("b", sample(0, 0, 1)).abs() < f64::EPSILON);
        assert!((sampler.observe("a", sample(50, 100, 1)) - 50.0).abs() < 1e-9);

        sampler.forget("a");
        assert!(sampler.observe("a", sample(80, 200, 1)).abs() < f64::EPSILON);
    }

    #[test]
    fn memory_conversion() {
        assert!((bytes_to_mb(512 * 1024 * 1024) - 512.0).abs() < f64::EPSILON);
    }
}
