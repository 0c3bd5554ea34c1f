//! Engine configuration.

use std::time::Duration;

/// Default grace window granted to delay-mode inhibitor holders before
/// a secure-lock proceeds without them.
pub const DEFAULT_SECURE_LOCK_GRACE: Duration = Duration::from_secs(5);

/// Default capacity of the notification broadcast channel.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

/// Configuration for the broker engine.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long a held secure-lock waits for delay-mode inhibitor
    /// holders before proceeding. The bound is an explicit
    /// configuration value, not inferred.
    pub secure_lock_grace: Duration,

    /// Capacity of the notification broadcast channel. Slow
    /// subscribers that fall further behind than this lose
    /// notifications (`tokio::sync::broadcast` lag semantics).
    pub notification_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            secure_lock_grace: DEFAULT_SECURE_LOCK_GRACE,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

impl ManagerConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay-holder grace window.
    #[must_use]
    pub const fn with_secure_lock_grace(mut self, grace: Duration) -> Self {
        self.secure_lock_grace = grace;
        self
    }

    /// Set the notification channel capacity.
    #[must_use]
    pub const fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }
}
