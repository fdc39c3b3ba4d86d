//! Engine configuration.

use std::time::Duration;

use crate::live_query::DEFAULT_NOTIFICATION_CAPACITY;

// =============================================================================
// Defaults
// =============================================================================

/// Default time allowed for a partition subscription to go live, in milliseconds.
///
/// Covers the subscriber's catch-up read. `execute` fails with
/// `SubscriptionFailed` when it expires.
pub const DEFAULT_SUBSCRIBE_TIMEOUT_MS: u64 = 5_000;

// =============================================================================
// Engine Configuration
// =============================================================================

/// Configuration for a [`QueryEngine`](crate::engine::QueryEngine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum time to wait for a subscription to confirm it is live.
    pub subscribe_timeout: Duration,

    /// Notification channel capacity for live queries that do not set one.
    pub notification_capacity: usize,
}

impl EngineConfig {
    /// Sets the subscription timeout.
    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    /// Sets the default notification channel capacity.
    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            subscribe_timeout: Duration::from_millis(DEFAULT_SUBSCRIBE_TIMEOUT_MS),
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}
