use std::time::Duration;

/// Runtime tuning knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of released callee frames kept for reuse.
    pub pool_capacity: usize,
    /// Initial capacity of the reactor event buffer used by the driver.
    pub event_capacity: usize,
    /// Upper bound on a single reactor wait. `None` blocks until something
    /// fires or a delayed run-queue entry becomes due.
    pub poll_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pool_capacity: 64,
            event_capacity: 256,
            poll_timeout: None,
        }
    }
}

impl Config {
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Effective reactor timeout given the caller's wish.
    pub(crate) fn clamp_timeout(&self, wanted: Option<Duration>) -> Option<Duration> {
        match (wanted, self.poll_timeout) {
            (None, None) => None,
            (Some(t), None) | (None, Some(t)) => Some(t),
            (Some(a), Some(b)) => Some(a.min(b)),
        }
    }
}
