//! Backend capability flags.

use serde::{Deserialize, Serialize};

/// Feature flags a row-access backend reports about itself.
///
/// The engine consults these before choosing an execution strategy, e.g.
/// whether a failed batch can be attributed to a single statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    /// Several select plans can be answered in one round trip.
    pub supports_multiple_result_sets: bool,
    /// Batch execution reports one status per statement.
    pub supports_batch_update_counts: bool,
    /// On any failure inside a batch, every statement is reported failed.
    pub flags_all_operations_as_failed_on_batch_update_exception: bool,
    /// `SELECT ... FOR UPDATE` is available.
    pub supports_select_for_update: bool,
    /// `SELECT ... FOR UPDATE WAIT n` is available.
    pub supports_select_for_update_wait_n: bool,
}

impl BackendCapabilities {
    /// Capabilities of a fully featured backend.
    pub fn full() -> Self {
        Self {
            supports_multiple_result_sets: true,
            supports_batch_update_counts: true,
            flags_all_operations_as_failed_on_batch_update_exception: false,
            supports_select_for_update: true,
            supports_select_for_update_wait_n: true,
        }
    }

    /// Capabilities of a minimal backend: no multi result sets, opaque batch
    /// failures and no row locking.
    pub fn minimal() -> Self {
        Self {
            supports_multiple_result_sets: false,
            supports_batch_update_counts: false,
            flags_all_operations_as_failed_on_batch_update_exception: true,
            supports_select_for_update: false,
            supports_select_for_update_wait_n: false,
        }
    }

    /// Whether a failed batch reports enough detail to name the failing
    /// statement without re-running it.
    pub fn can_attribute_batch_failures(&self) -> bool {
        self.supports_batch_update_counts
            && !self.flags_all_operations_as_failed_on_batch_update_exception
    }
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self::full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribution() {
        assert!(BackendCapabilities::full().can_attribute_batch_failures());
        assert!(!BackendCapabilities::minimal().can_attribute_batch_failures());

        let mut caps = BackendCapabilities::full();
        caps.flags_all_operations_as_failed_on_batch_update_exception = true;
        assert!(!caps.can_attribute_batch_failures());
    }
}
