//! System load sampling.

/// Reports current system usage as a percentage.
pub trait ResourceMonitor: Send + Sync {
    /// Current usage in percent. Values above 100 mean oversubscription.
    fn current_usage_percent(&self) -> f64;
}
