//! Configuration for a JSON storage instance
//!
//! Controls backup retention and the two timing knobs of the deferred
//! commit: the debounce window and the anti-starvation ceiling.

use std::time::Duration;

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of backup snapshots kept beside the primary file
    pub max_backup_files: usize,
    /// Quiet period after the last mutation before a flush runs
    pub write_delay: Duration,
    /// Longest a dirty streak may be deferred before a mutation flushes synchronously
    pub max_deferred_period: Duration,
}

impl Config {
    /// Production defaults: 5 backups, 500ms debounce, flush at least once a minute.
    pub fn standard() -> Self {
        Self {
            max_backup_files: 5,
            write_delay: Duration::from_millis(500),
            max_deferred_period: Duration::from_secs(60),
        }
    }

    /// Short timings for tests and tools that want changes on disk quickly.
    pub fn testing() -> Self {
        Self {
            max_backup_files: 3,
            write_delay: Duration::from_millis(20),
            max_deferred_period: Duration::from_millis(200),
        }
    }

    /// Builder-style setter for backup retention.
    pub fn with_max_backup_files(mut self, max_backup_files: usize) -> Self {
        self.max_backup_files = max_backup_files;
        self
    }

    /// Builder-style setter for the debounce window.
    pub fn with_write_delay(mut self, write_delay: Duration) -> Self {
        self.write_delay = write_delay;
        self
    }

    /// Builder-style setter for the anti-starvation ceiling.
    pub fn with_max_deferred_period(mut self, max_deferred_period: Duration) -> Self {
        self.max_deferred_period = max_deferred_period;
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.max_deferred_period.is_zero() {
            return Err("max_deferred_period must be > 0".into());
        }
        if self.write_delay > self.max_deferred_period {
            return Err("write_delay must not exceed max_deferred_period".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::standard() }
}
