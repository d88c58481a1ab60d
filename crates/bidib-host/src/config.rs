//! Host construction configuration.
//!
//! Plain struct with a `Default`, matching this codebase's existing
//! `ServerRuntimeConfig`/`ConnectionConfig` convention rather than a builder.

use std::time::Duration;

/// Baud rates probed, in order, when opening the serial port.
pub const DEFAULT_BAUD_PROBE_ORDER: [u32; 3] = [1_000_000, 115_200, 19_200];

/// Default bounded-queue capacity for inbound messages and posted callbacks.
pub const DEFAULT_INGRESS_QUEUE_CAPACITY: usize = 64;

/// Default enqueue timeout for posted callbacks.
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(50);

/// Default enqueue timeout for transport-delivered ingress messages.
pub const DEFAULT_ENQUEUE_TIMEOUT_INGRESS: Duration = Duration::from_millis(100);

/// Configuration accepted at host construction.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Device path of the serial port (e.g. `/dev/ttyUSB0`).
    pub port_name: String,
    /// Baud rates tried in order until one yields a `SYS_MAGIC` reply.
    pub baud_probe_order: Vec<u32>,
    /// Capacity of the bounded ingress/callback queue.
    pub ingress_queue_capacity: usize,
    /// Enqueue timeout for posted callbacks (`go`/`stop`/`get_root`, ...).
    pub enqueue_timeout_default: Duration,
    /// Enqueue timeout for messages the transport hands to the dispatcher.
    pub enqueue_timeout_ingress: Duration,
}

impl HostConfig {
    /// Configuration for `port_name` with every other field at its default.
    #[must_use]
    pub fn new(port_name: impl Into<String>) -> Self {
        Self { port_name: port_name.into(), ..Self::default() }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_probe_order: DEFAULT_BAUD_PROBE_ORDER.to_vec(),
            ingress_queue_capacity: DEFAULT_INGRESS_QUEUE_CAPACITY,
            enqueue_timeout_default: DEFAULT_ENQUEUE_TIMEOUT,
            enqueue_timeout_ingress: DEFAULT_ENQUEUE_TIMEOUT_INGRESS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_overrides_only_port_name() {
        let config = HostConfig::new("/dev/ttyUSB0");
        assert_eq!(config.port_name, "/dev/ttyUSB0");
        assert_eq!(config.baud_probe_order, vec![1_000_000, 115_200, 19_200]);
        assert_eq!(config.ingress_queue_capacity, 64);
    }

    #[test]
    fn default_has_empty_port_name() {
        assert_eq!(HostConfig::default().port_name, "");
    }
}
