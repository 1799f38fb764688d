//! Database capability descriptor.

/// Capabilities of the underlying database engine.
///
/// The persistence engine picks its conflict-detection strategy from these
/// flags: per-row batch counts when available, otherwise pessimistic row
/// locks taken while loading the validation snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Batches report an affected-row count for every row.
    pub supports_batch_update_counts: bool,
    /// `SELECT ... FOR UPDATE` is available.
    pub supports_select_for_update: bool,
    /// `SELECT ... FOR UPDATE WAIT n` is available.
    pub supports_select_for_update_wait: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_batch_update_counts: true,
            supports_select_for_update: true,
            supports_select_for_update_wait: true,
        }
    }
}

impl Capabilities {
    /// Creates the default capability set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether batches report per-row counts.
    #[must_use]
    pub const fn batch_update_counts(mut self, value: bool) -> Self {
        self.supports_batch_update_counts = value;
        self
    }

    /// Sets whether `FOR UPDATE` is supported.
    #[must_use]
    pub const fn select_for_update(mut self, value: bool) -> Self {
        self.supports_select_for_update = value;
        self
    }

    /// Sets whether `FOR UPDATE WAIT n` is supported.
    #[must_use]
    pub const fn select_for_update_wait(mut self, value: bool) -> Self {
        self.supports_select_for_update_wait = value;
        self
    }

    /// Returns true if conflicts must be prevented by locking rows up front.
    #[must_use]
    pub const fn needs_pessimistic_locking(&self) -> bool {
        !self.supports_batch_update_counts && self.supports_select_for_update
    }
}
