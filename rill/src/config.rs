//! Stack tunables.

use std::time::Duration;

use serde::Deserialize;

use crate::neigh::NeighborConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// How long a partial reassembly is kept before it expires with an ICMP
    /// Time Exceeded to the source.
    pub reassembly_timeout_ms: u64,
    /// Duplicate address detection window for newly assigned IPv6 addresses.
    pub dad_timeout_ms: u64,
    /// TTL applied to outbound IPv4 packets that still carry TTL zero when
    /// finalized. IPv6 uses the interface hop limit instead.
    pub default_ttl: u8,
    pub neighbor: NeighborConfig,
    /// Ephemeral port range for automatic binds, inclusive.
    pub port_min: u16,
    pub port_max: u16,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            reassembly_timeout_ms: 10_000,
            dad_timeout_ms: 3_000,
            default_ttl: 128,
            neighbor: NeighborConfig::default(),
            port_min: 49152,
            port_max: 65535,
        }
    }
}

impl StackConfig {
    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }

    pub fn dad_timeout(&self) -> Duration {
        Duration::from_millis(self.dad_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = StackConfig::default();
        assert_eq!(c.reassembly_timeout(), Duration::from_secs(10));
        assert_eq!(c.dad_timeout(), Duration::from_secs(3));
        assert_eq!(c.default_ttl, 128);
        assert!(c.port_min < c.port_max);
    }
}
