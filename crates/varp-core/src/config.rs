//! Core configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use varp_wire::EncapMode;

use crate::sa::ReplayPolicy;

/// Default VARP/tunnel UDP port
pub const DEFAULT_PORT: u16 = 1798;

/// Default resolution multicast group
pub const DEFAULT_MULTICAST: Ipv4Addr = Ipv4Addr::new(224, 10, 0, 1);

/// Transform names and keys used when a secured tunnel must build an
/// association on demand (pre-shared control-plane material).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SaDefaults {
    pub cipher: String,
    pub cipher_key: Vec<u8>,
    pub digest: String,
    pub digest_key: Vec<u8>,
}

/// Core protocol configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    /// UDP port for resolution and tunnel traffic
    pub udp_port: u16,

    /// Multicast group for resolution probes and flooded frames
    /// (None when only the unicast peer overlay is available)
    pub multicast_addr: Option<SocketAddr>,

    /// Vnet id encoding on the wire
    pub encap_mode: EncapMode,

    /// Interval between resolution probes for an incomplete entry
    pub probe_interval: Duration,

    /// Probes sent before an entry is marked failed
    pub max_probes: u32,

    /// Frames buffered per entry awaiting resolution
    pub queue_max: usize,

    /// Idle lifetime of a cache entry before sweep removes it
    pub entry_ttl: Duration,

    /// Interval between sweep runs
    pub sweep_interval: Duration,

    /// Idle lifetime of a non-persistent local vif registration
    pub vif_ttl: Duration,

    /// Inbound replay-window enforcement for secured traffic
    pub replay_policy: ReplayPolicy,

    /// Pre-shared material for on-demand association creation
    pub sa_defaults: Option<SaDefaults>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            udp_port: DEFAULT_PORT,
            multicast_addr: Some(SocketAddr::new(IpAddr::V4(DEFAULT_MULTICAST), DEFAULT_PORT)),
            encap_mode: EncapMode::Extended,
            probe_interval: Duration::from_secs(1),
            max_probes: 5,
            queue_max: 16,
            entry_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            vif_ttl: Duration::from_secs(300),
            replay_policy: ReplayPolicy::Off,
            sa_defaults: None,
        }
    }
}

impl CoreConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_probes == 0 {
            return Err("max_probes must be at least 1".into());
        }
        if self.queue_max == 0 {
            return Err("queue_max must be at least 1".into());
        }
        if self.probe_interval.is_zero() {
            return Err("probe_interval must be non-zero".into());
        }
        if self.sweep_interval.is_zero() {
            return Err("sweep_interval must be non-zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_probes_rejected() {
        let config = CoreConfig {
            max_probes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
