//! Context and persistence configuration.

use std::time::Duration;

/// Configuration shared by an entity context and the persister it drives.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum rows submitted in one physical batch.
    ///
    /// Longer runs of same-type entities are split.
    pub max_batch_size: usize,

    /// Whether the audit sink is called after the writes.
    pub audit_enabled: bool,

    /// Lock wait used with `SELECT ... FOR UPDATE WAIT n`.
    ///
    /// Only used when the store lacks per-row batch counts and supports the
    /// wait clause. `None` fails immediately on a held lock.
    pub pessimistic_lock_wait: Option<Duration>,

    /// Whether lock tokens are compared against the freshly loaded snapshot
    /// before any write is attempted.
    pub validate_locks_before_write: bool,

    /// Lock token assigned to newly created rows.
    pub initial_lock_value: i64,

    /// Number of cached handles after which dead entries are purged.
    pub proxy_cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_batch_size: 256,
            audit_enabled: true,
            pessimistic_lock_wait: Some(Duration::from_secs(5)),
            validate_locks_before_write: true,
            initial_lock_value: 1,
            proxy_cache_capacity: 4096,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum batch size (at least 1).
    #[must_use]
    pub const fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = if size == 0 { 1 } else { size };
        self
    }

    /// Sets whether audit records are written.
    #[must_use]
    pub const fn audit_enabled(mut self, value: bool) -> Self {
        self.audit_enabled = value;
        self
    }

    /// Sets the pessimistic lock wait.
    #[must_use]
    pub const fn pessimistic_lock_wait(mut self, wait: Option<Duration>) -> Self {
        self.pessimistic_lock_wait = wait;
        self
    }

    /// Sets whether locks are validated before writing.
    #[must_use]
    pub const fn validate_locks_before_write(mut self, value: bool) -> Self {
        self.validate_locks_before_write = value;
        self
    }

    /// Sets the lock token given to created rows.
    #[must_use]
    pub const fn initial_lock_value(mut self, value: i64) -> Self {
        self.initial_lock_value = value;
        self
    }

    /// Sets the handle cache purge threshold.
    #[must_use]
    pub const fn proxy_cache_capacity(mut self, capacity: usize) -> Self {
        self.proxy_cache_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.max_batch_size, 256);
        assert!(config.audit_enabled);
        assert!(config.validate_locks_before_write);
        assert_eq!(config.initial_lock_value, 1);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .max_batch_size(0)
            .audit_enabled(false)
            .pessimistic_lock_wait(None);

        assert_eq!(config.max_batch_size, 1);
        assert!(!config.audit_enabled);
        assert!(config.pessimistic_lock_wait.is_none());
    }
}
