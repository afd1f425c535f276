//! Service tuning knobs

use std::time::Duration;

/// Configuration shared by the room manager, relay and persistence scheduler
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Quiet period after the last change before a document is saved
    pub save_debounce: Duration,
    /// Capacity of each connection's outbound queue. A connection whose
    /// queue fills up is disconnected.
    pub outbound_buffer: usize,
    /// Save attempts when the last member leaves a room
    pub final_flush_attempts: u32,
    /// Pause between final flush attempts
    pub final_flush_backoff: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_secs(3),
            outbound_buffer: 256,
            final_flush_attempts: 3,
            final_flush_backoff: Duration::from_millis(200),
        }
    }
}

impl ServiceConfig {
    pub fn with_save_debounce(mut self, debounce: Duration) -> Self {
        self.save_debounce = debounce;
        self
    }

    pub fn with_outbound_buffer(mut self, capacity: usize) -> Self {
        self.outbound_buffer = capacity.max(1);
        self
    }
}
