//! Resource admission: decides whether system load allows another dispatch.

use conveyor_core::resources::ResourceMonitor;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Result of an admission check. Deferral is not an error: the scheduler
/// simply tries again on its next tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Admitted { usage: f64 },
    Deferred { usage: f64, threshold: f64 },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

#[derive(Clone)]
pub struct ResourceAdmission {
    monitor: Arc<dyn ResourceMonitor>,
}

impl ResourceAdmission {
    pub fn new(monitor: Arc<dyn ResourceMonitor>) -> Self {
        Self { monitor }
    }

    /// Read current usage on the blocking pool. Monitors may touch the
    /// filesystem.
    pub async fn sample(&self) -> f64 {
        let monitor = Arc::clone(&self.monitor);
        match tokio::task::spawn_blocking(move || monitor.current_usage_percent()).await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(error = %e, "Usage sampling task failed, assuming idle");
                0.0
            }
        }
    }

    /// Admit when `usage` is strictly below `threshold`.
    pub fn evaluate(usage: f64, threshold: f64) -> Admission {
        if usage < threshold {
            Admission::Admitted { usage }
        } else {
            Admission::Deferred { usage, threshold }
        }
    }
}

/// Usage derived from the 1-minute load average relative to the CPU count.
pub struct LoadAverageMonitor {
    path: PathBuf,
    cpus: usize,
}

impl LoadAverageMonitor {
    pub fn new() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            path: PathBuf::from("/proc/loadavg"),
            cpus,
        }
    }

    pub fn with_path(path: impl Into<PathBuf>, cpus: usize) -> Self {
        Self {
            path: path.into(),
            cpus: cpus.max(1),
        }
    }
}

impl Default for LoadAverageMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor for LoadAverageMonitor {
    fn current_usage_percent(&self) -> f64 {
        let load = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| parse_loadavg(&content));

        match load {
            Some(load) => load / self.cpus as f64 * 100.0,
            None => {
                warn!(path = %self.path.display(), "Unable to read load average, assuming idle");
                0.0
            }
        }
    }
}

/// First field of `/proc/loadavg`.
fn parse_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

/// Monitor reporting a settable value.
#[derive(Debug, Default)]
pub struct StaticUsageMonitor {
    bits: AtomicU64,
}

impl StaticUsageMonitor {
    pub fn new(usage: f64) -> Self {
        Self {
            bits: AtomicU64::new(usage.to_bits()),
        }
    }

    pub fn set(&self, usage: f64) {
        self.bits.store(usage.to_bits(), Ordering::Relaxed);
    }
}

impl ResourceMonitor for StaticUsageMonitor {
    fn current_usage_percent(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_loadavg() {
        assert_eq!(parse_loadavg("0.52 0.58 0.59 1/467 12345\n"), Some(0.52));
        assert_eq!(parse_loadavg(""), None);
        assert_eq!(parse_loadavg("garbage"), None);
    }

    #[test]
    fn test_admission_threshold_is_exclusive() {
        assert_eq!(
            ResourceAdmission::evaluate(80.0, 80.0),
            Admission::Deferred {
                usage: 80.0,
                threshold: 80.0
            }
        );
        assert!(ResourceAdmission::evaluate(79.9, 80.0).is_admitted());
    }

    #[tokio::test]
    async fn test_sample_reads_monitor() {
        let monitor = Arc::new(StaticUsageMonitor::new(42.0));
        let admission = ResourceAdmission::new(monitor.clone());
        assert_eq!(admission.sample().await, 42.0);

        monitor.set(7.5);
        assert_eq!(admission.sample().await, 7.5);
    }

    #[test]
    fn test_load_average_monitor_reads_file() {
        let path = std::env::temp_dir().join(format!("conveyor-loadavg-{}", std::process::id()));
        std::fs::write(&path, "3.00 2.00 1.00 2/100 42\n").unwrap();

        let monitor = LoadAverageMonitor::with_path(&path, 4);
        assert_eq!(monitor.current_usage_percent(), 75.0);

        std::fs::remove_file(&path).unwrap();
        assert_eq!(monitor.current_usage_percent(), 0.0);
    }
}
