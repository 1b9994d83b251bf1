//! Messenger tunables. Every timeout of the concurrency model and every
//! protocol cap has a knob here; the defaults match the documented contract.

use std::time::Duration;

use cypher_proto::PaddingMode;

#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Bound on cached skipped message keys per ratchet session.
    pub max_skipped_keys: u32,

    /// Timeout for fetching a peer's key bundle.
    pub user_config_fetch_timeout: Duration,
    /// How long a validated peer config snapshot stays fresh.
    pub user_config_ttl: Duration,
    /// Timeout for one transport send.
    pub transport_send_timeout: Duration,
    /// Timeout for the P2P two-phase handshake.
    pub p2p_handshake_timeout: Duration,
    /// Unacked P2P sendMessage frames fall back to the server transport
    /// after this long.
    pub p2p_send_timeout: Duration,

    /// Per-device transport attempts before the device is quarantined.
    pub send_retries: u32,
    /// First retry delay; doubles per attempt up to `retry_max_delay`.
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    /// Plaintext padding applied before sealing.
    pub padding: PaddingMode,

    /// Event bus ring capacity; slow consumers lag, producers never block.
    pub event_capacity: usize,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            max_skipped_keys: 1000,
            user_config_fetch_timeout: Duration::from_secs(15),
            user_config_ttl: Duration::from_secs(60),
            transport_send_timeout: Duration::from_secs(30),
            p2p_handshake_timeout: Duration::from_secs(30),
            p2p_send_timeout: Duration::from_secs(10),
            send_retries: 4,
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(5),
            padding: PaddingMode::default(),
            event_capacity: 256,
        }
    }
}

impl MessengerConfig {
    /// Exponential backoff delay before retry `attempt` (0-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = MessengerConfig::default();
        assert_eq!(config.backoff_delay(0), Duration::from_millis(50));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(20), config.retry_max_delay);
    }
}
