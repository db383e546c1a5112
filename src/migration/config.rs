//! Backfill configuration.

use std::time::Duration;

/// Configuration for a margin backfill run.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Calculate and report without writing anything back
    pub dry_run: bool,

    /// Leave strategies that already carry both margin fields untouched
    pub only_missing: bool,

    /// How long a failing write is retried before the record counts as failed
    pub write_retry_window: Duration,

    /// First delay between write retries
    pub write_retry_initial: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            only_missing: false,
            write_retry_window: Duration::from_secs(10),
            write_retry_initial: Duration::from_millis(200),
        }
    }
}
