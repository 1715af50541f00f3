//! Engine configuration.

use std::time::Duration;

/// Tuning knobs shared by the pagination controller, the projector, and the
/// timeline source. Decoupled from any outer app configuration so the engine
/// can be embedded and tested independently.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Number of statuses requested per page.
    pub page_size: u32,
    /// Delay before a failed page fetch is retried. The retry is
    /// unconditional and uncapped; foreground list screens own the
    /// controller's lifetime, so teardown is the cap.
    pub fail_retry_delay: Duration,
    /// Debounce window for the record projector. Bursts of store-change
    /// notifications within this window coalesce into a single republish.
    pub debounce_window: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            fail_retry_delay: Duration::from_secs(3),
            debounce_window: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.page_size, 20);
        assert_eq!(config.fail_retry_delay, Duration::from_secs(3));
        assert_eq!(config.debounce_window, Duration::from_millis(100));
    }
}
