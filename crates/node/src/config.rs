use std::time::Duration;

use interay::{HostType, NetworkSettings, UdpTimings};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub mode: HostType,
    pub hostname: String,
    pub settings: NetworkSettings,
    pub peer_timeout: Duration,
    pub name: String,
    /// Ticks between two pings from a client, 0 to disable.
    pub ping_every: u32,
    pub run_for: Option<Duration>,
}

impl NodeConfig {
    pub fn timings(&self) -> UdpTimings {
        UdpTimings {
            peer_timeout: self.peer_timeout,
            ..UdpTimings::default()
        }
    }
}
