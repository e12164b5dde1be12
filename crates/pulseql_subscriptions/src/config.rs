//! Configuration for the subscription layer.

use std::time::Duration;

/// Tunables shared by observers, routers and the relay.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Capacity of each operation observer's message buffer. A full
    /// buffer applies backpressure to producers instead of dropping.
    pub buffer_capacity: usize,
    /// How long a producer backs off against a full buffer before the
    /// consumer is treated as stalled and the operation is failed.
    pub stall_timeout: Duration,
    /// Ring capacity of the in-memory broker's per-topic channel.
    pub broker_capacity: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionConfig {
    /// Creates a config with default values.
    pub fn new() -> Self {
        Self {
            buffer_capacity: 64,
            stall_timeout: Duration::from_secs(5),
            broker_capacity: 256,
        }
    }

    /// Sets the observer buffer capacity.
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Sets the stall timeout.
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Sets the in-memory broker channel capacity.
    pub fn broker_capacity(mut self, capacity: usize) -> Self {
        self.broker_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = SubscriptionConfig::new()
            .buffer_capacity(8)
            .stall_timeout(Duration::from_millis(100));

        assert_eq!(config.buffer_capacity, 8);
        assert_eq!(config.stall_timeout, Duration::from_millis(100));
        assert_eq!(config.broker_capacity, 256);
    }
}
