use std::time::Duration;

/// Local socket pair buffer size (send and receive, both ends)
pub const DEFAULT_LOCAL_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Capture buffer size; also the filter snap length
pub const DEFAULT_CAPTURE_BUFFER_SIZE: usize = 0x80000;

/// Smallest accepted buffer; holds a full Ethernet frame plus capture header
pub const MIN_BUFFER_SIZE: usize = 2048;

/// Upper bound on a single readiness wait
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Minimum spacing between reports sharing a throttle key
pub const DEFAULT_THROTTLE_WINDOW: Duration = Duration::from_secs(5);

/// Period of the bridge membership check in the daemon
pub const DEFAULT_MEMBERSHIP_INTERVAL: Duration = Duration::from_secs(5);

/// How many datagrams the VM-to-host relay moves per readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayPolicy {
    /// One read/write cycle per event, for fairness across ports
    #[default]
    OnePerEvent,
    /// Keep reading until the socket would block, at most `port::MAX_DRAIN_DATAGRAMS`
    DrainReported,
}

/// Switch tunables
#[derive(Debug, Clone)]
pub struct SwitchConfig {
    pub local_buffer_size: usize,
    pub capture_buffer_size: usize,
    pub poll_timeout: Duration,
    pub relay_policy: RelayPolicy,
    pub throttle_window: Duration,
    pub membership_interval: Duration,
    /// Whether the capture filter also accepts broadcast frames
    pub accept_broadcast: bool,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            local_buffer_size: DEFAULT_LOCAL_BUFFER_SIZE,
            capture_buffer_size: DEFAULT_CAPTURE_BUFFER_SIZE,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            relay_policy: RelayPolicy::default(),
            throttle_window: DEFAULT_THROTTLE_WINDOW,
            membership_interval: DEFAULT_MEMBERSHIP_INTERVAL,
            accept_broadcast: true,
        }
    }
}

impl SwitchConfig {
    /// Poll timeout in milliseconds, clamped to what `poll(2)` accepts.
    pub fn poll_timeout_ms(&self) -> u16 {
        self.poll_timeout.as_millis().min(u16::MAX as u128) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SwitchConfig::default();
        assert_eq!(config.local_buffer_size, 8 * 1024 * 1024);
        assert_eq!(config.capture_buffer_size, 512 * 1024);
        assert_eq!(config.relay_policy, RelayPolicy::OnePerEvent);
        assert_eq!(config.poll_timeout_ms(), 1000);
        assert!(config.accept_broadcast);
    }

    #[test]
    fn poll_timeout_is_clamped() {
        let config = SwitchConfig {
            poll_timeout: Duration::from_secs(3600),
            ..Default::default()
        };
        assert_eq!(config.poll_timeout_ms(), u16::MAX);
    }
}
